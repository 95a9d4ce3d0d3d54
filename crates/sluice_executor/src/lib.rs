//! Statement execution for the sluice router.
//!
//! [`Executor`] is the entry point: it looks statements up in the
//! [`PlanCache`], handles transaction control, brackets writes in implicit
//! transactions and collapses duplicate replica reads through the
//! [`Consolidator`]. Plans run against an [`ExecutionCursor`], which sends
//! shard work through [`ScatterConn`] to a [`ShardGateway`].

pub mod consolidator;
pub mod cursor;
pub mod executor;
pub mod gateway;
pub mod normalizer;
pub mod plan_cache;
pub mod planner;
pub mod scatter_conn;
pub mod session;
pub mod txconn;


pub use consolidator::{Consolidator, ConsolidatorRole, ConsolidatorStats};
pub use cursor::ExecutionCursor;
pub use executor::{ExecuteOptions, Executor, StatementResult};
pub use gateway::{GatewayCall, MemoryGateway, ShardGateway};
pub use normalizer::{cache_key, normalize, NormalizedStatement};
pub use plan_cache::{Plan, PlanCache, PlanCacheStats};
pub use planner::{PlanRequest, Planner};
pub use scatter_conn::ScatterConn;
pub use session::{Session, ShardSession, TxnState};
pub use txconn::{TransactionCoordinator, TxConn};
