//! The capability set primitives use to reach shards.
//!
//! A `VCursor` is created per top-level statement and handed down the
//! primitive tree by reference. Implementations keep any mutable state
//! (session, partial-DML flag) behind interior mutability so primitives only
//! ever need `&dyn VCursor`.

use std::fmt;

use sluice_common::datum::QueryResult;
use sluice_common::error::{SluiceError, SluiceResult};
use sluice_common::types::{ShardTarget, TabletType};
use sluice_sharding::Destination;

use crate::bind::BoundQuery;

/// Statements to send to one shard, executed there in order.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedShardQuery {
    pub target: ShardTarget,
    pub queries: Vec<BoundQuery>,
}

impl ResolvedShardQuery {
    pub fn new(target: ShardTarget, queries: Vec<BoundQuery>) -> Self {
        Self { target, queries }
    }

    pub fn single(target: ShardTarget, query: BoundQuery) -> Self {
        Self {
            target,
            queries: vec![query],
        }
    }
}

impl fmt::Display for ResolvedShardQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} statements)", self.target, self.queries.len())
    }
}

/// One shard's result stream. Items are row batches; the first batch of a
/// stream carries the field list. The producer blocks once the consumer
/// falls behind by the configured number of batches.
pub type RowStream = Box<dyn Iterator<Item = SluiceResult<QueryResult>> + Send>;

/// Explicit `keyspace:shard` target set on the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardHint {
    pub keyspace: String,
    pub shard: String,
}

pub trait VCursor {
    /// Replica role this statement targets.
    fn tablet_type(&self) -> TabletType;

    /// Explicit shard target, if the session has one. Routes into the same
    /// keyspace send to this shard regardless of routing values.
    fn shard_hint(&self) -> Option<ShardHint>;

    fn resolve_destinations(
        &self,
        keyspace: &str,
        destinations: &[Destination],
    ) -> SluiceResult<Vec<Vec<ShardTarget>>>;

    /// Run every query on its shard and merge the results: rows appended in
    /// shard order, affected counts summed, first insert id kept.
    ///
    /// `rollback_on_error` asks the cursor to flag the enclosing transaction
    /// for rollback if any shard fails. `can_autocommit` lets a single-shard
    /// write commit in the same round trip outside a transaction.
    fn execute_multi_shard(
        &self,
        queries: Vec<ResolvedShardQuery>,
        rollback_on_error: bool,
        can_autocommit: bool,
    ) -> SluiceResult<QueryResult>;

    /// As `execute_multi_shard`, but each shard receives its statements as
    /// one batch.
    fn execute_batch_multi_shard(
        &self,
        queries: Vec<ResolvedShardQuery>,
        rollback_on_error: bool,
        can_autocommit: bool,
    ) -> SluiceResult<QueryResult>;

    /// One stream per shard-query pair, in input order.
    fn stream_execute_multi(&self, queries: Vec<ResolvedShardQuery>) -> SluiceResult<Vec<RowStream>>;

    fn max_memory_rows(&self) -> usize;

    /// Set only for internal/administrative statements.
    fn ignore_max_memory_rows(&self) -> bool;

    fn warn_memory_rows(&self) -> usize {
        0
    }

    /// Guard for results materialized in router memory.
    fn check_memory_rows(&self, rows: usize) -> SluiceResult<()> {
        if self.ignore_max_memory_rows() {
            return Ok(());
        }
        let max = self.max_memory_rows();
        if max > 0 && rows > max {
            return Err(SluiceError::ResourceLimit(format!(
                "in-memory row count exceeded allowed limit of {max}"
            )));
        }
        let warn = self.warn_memory_rows();
        if warn > 0 && rows >= warn {
            tracing::warn!(rows, warn, max, "in-memory row count above warning threshold");
        }
        Ok(())
    }

    fn in_transaction(&self) -> bool;

    /// Cooperative cancellation point.
    fn check_cancelled(&self) -> SluiceResult<()>;
}
