//! Sharding-key resolution for the sluice router.
//!
//! Two levels of resolution live here:
//! - keyspace level: routing values → shards (`DestinationResolver`,
//!   `HashShardResolver`);
//! - table level: routing values → physical partitions of logic tables
//!   (`LogicTable`, `TableShardingIndex`).

pub mod destination;
pub mod function;
pub mod resolver;
pub mod table;

pub use destination::{Destination, DestinationResolver};
pub use function::{hash_datum, ShardingFunction};
pub use resolver::{HashShardResolver, KeyspaceLayout, ShardRange};
pub use table::{ActualTable, InGroup, LogicTable, TableMapping, TableShardingIndex};
