use std::fmt;

use sluice_common::datum::Datum;
use sluice_common::error::SluiceResult;
use sluice_common::types::{ShardTarget, TabletType};

/// What a route wants to reach, before it is turned into physical shards.
#[derive(Debug, Clone, PartialEq)]
pub enum Destination {
    /// The shard owning one routing value.
    Value(Datum),
    /// Every shard owning any of these routing values.
    Values(Vec<Datum>),
    /// A shard named explicitly (shard hint or pre-resolved target).
    Shard(String),
    AllShards,
    /// Any single shard; used for schema-only queries.
    AnyShard,
    /// Nothing; resolves to an empty shard list.
    None,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Value(v) => write!(f, "Value({})", v.to_sql_literal()),
            Destination::Values(vs) => {
                let parts: Vec<String> = vs.iter().map(|v| v.to_sql_literal()).collect();
                write!(f, "Values({})", parts.join(","))
            }
            Destination::Shard(s) => write!(f, "Shard({s})"),
            Destination::AllShards => write!(f, "AllShards"),
            Destination::AnyShard => write!(f, "AnyShard"),
            Destination::None => write!(f, "None"),
        }
    }
}

/// Keyspace topology lookup: destinations → physical shards.
///
/// Returns one shard list per input destination, in input order. Within a
/// list shards are de-duplicated and keep keyspace order.
pub trait DestinationResolver: Send + Sync {
    fn resolve(
        &self,
        keyspace: &str,
        tablet_type: TabletType,
        destinations: &[Destination],
    ) -> SluiceResult<Vec<Vec<ShardTarget>>>;

    /// Every shard of `keyspace`.
    fn all_shards(&self, keyspace: &str, tablet_type: TabletType) -> SluiceResult<Vec<ShardTarget>> {
        let mut resolved = self.resolve(keyspace, tablet_type, &[Destination::AllShards])?;
        Ok(resolved.pop().unwrap_or_default())
    }
}
