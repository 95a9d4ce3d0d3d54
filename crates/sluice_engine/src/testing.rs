//! Recording `VCursor` for primitive tests.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use sluice_common::datum::{DataType, Datum, Field, OwnedRow, QueryResult};
use sluice_common::error::SluiceResult;
use sluice_common::types::{ShardTarget, TabletType};
use sluice_sharding::{Destination, DestinationResolver, HashShardResolver, KeyspaceLayout};

use crate::vcursor::{ResolvedShardQuery, RowStream, ShardHint, VCursor};

type Responder = Box<dyn Fn(&ShardTarget, &str) -> SluiceResult<QueryResult> + Send + Sync>;

/// Keyspaces: `user` (two shards `-80`, `80-`) and `main` (unsharded).
pub(crate) struct FakeCursor {
    resolver: HashShardResolver,
    responder: Responder,
    calls: Mutex<Vec<(ShardTarget, String)>>,
    batch_calls: Mutex<usize>,
    pub hint: Option<ShardHint>,
    pub max_rows: usize,
    pub ignore_max_rows: bool,
    pub in_txn: bool,
    /// Set when a `rollback_on_error` dispatch fails inside a transaction.
    pub partial_dml: AtomicBool,
    pub last_autocommit: Mutex<Option<bool>>,
}

impl FakeCursor {
    pub fn new(
        responder: impl Fn(&ShardTarget, &str) -> SluiceResult<QueryResult> + Send + Sync + 'static,
    ) -> Self {
        Self {
            resolver: HashShardResolver::new()
                .with_keyspace(KeyspaceLayout::uniform("user", 2))
                .with_keyspace(KeyspaceLayout::unsharded("main")),
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
            batch_calls: Mutex::new(0),
            hint: None,
            max_rows: 0,
            ignore_max_rows: false,
            in_txn: false,
            partial_dml: AtomicBool::new(false),
            last_autocommit: Mutex::new(None),
        }
    }

    /// Every statement sent, rendered, in dispatch order.
    pub fn calls(&self) -> Vec<(ShardTarget, String)> {
        self.calls.lock().clone()
    }

    pub fn sql_calls(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(_, s)| s.clone()).collect()
    }

    pub fn batch_calls(&self) -> usize {
        *self.batch_calls.lock()
    }

    fn run(&self, queries: Vec<ResolvedShardQuery>, rollback_on_error: bool) -> SluiceResult<QueryResult> {
        let mut merged = QueryResult::default();
        for rsq in queries {
            for q in rsq.queries {
                let sql = q.to_sql_text()?;
                self.calls.lock().push((rsq.target.clone(), sql.clone()));
                match (self.responder)(&rsq.target, &sql) {
                    Ok(r) => merged.append(r),
                    Err(e) => {
                        if rollback_on_error && self.in_txn {
                            self.partial_dml.store(true, Ordering::SeqCst);
                        }
                        return Err(e);
                    }
                }
            }
        }
        Ok(merged)
    }
}

impl VCursor for FakeCursor {
    fn tablet_type(&self) -> TabletType {
        TabletType::Primary
    }

    fn shard_hint(&self) -> Option<ShardHint> {
        self.hint.clone()
    }

    fn resolve_destinations(
        &self,
        keyspace: &str,
        destinations: &[Destination],
    ) -> SluiceResult<Vec<Vec<ShardTarget>>> {
        self.resolver.resolve(keyspace, TabletType::Primary, destinations)
    }

    fn execute_multi_shard(
        &self,
        queries: Vec<ResolvedShardQuery>,
        rollback_on_error: bool,
        can_autocommit: bool,
    ) -> SluiceResult<QueryResult> {
        *self.last_autocommit.lock() = Some(can_autocommit);
        self.run(queries, rollback_on_error)
    }

    fn execute_batch_multi_shard(
        &self,
        queries: Vec<ResolvedShardQuery>,
        rollback_on_error: bool,
        can_autocommit: bool,
    ) -> SluiceResult<QueryResult> {
        *self.batch_calls.lock() += 1;
        *self.last_autocommit.lock() = Some(can_autocommit);
        self.run(queries, rollback_on_error)
    }

    fn stream_execute_multi(&self, queries: Vec<ResolvedShardQuery>) -> SluiceResult<Vec<RowStream>> {
        let mut streams: Vec<RowStream> = Vec::new();
        for rsq in queries {
            let result = self.run(vec![rsq], false);
            streams.push(Box::new(std::iter::once(result)));
        }
        Ok(streams)
    }

    fn max_memory_rows(&self) -> usize {
        self.max_rows
    }

    fn ignore_max_memory_rows(&self) -> bool {
        self.ignore_max_rows
    }

    fn in_transaction(&self) -> bool {
        self.in_txn
    }

    fn check_cancelled(&self) -> SluiceResult<()> {
        Ok(())
    }
}

pub(crate) fn int_row(vals: &[i64]) -> OwnedRow {
    OwnedRow::new(vals.iter().map(|v| Datum::Int64(*v)).collect())
}

pub(crate) fn int_fields(names: &[&str]) -> Vec<Field> {
    names.iter().map(|n| Field::new(*n, DataType::Int64)).collect()
}

pub(crate) fn int_result(names: &[&str], rows: &[&[i64]]) -> QueryResult {
    QueryResult::new(int_fields(names), rows.iter().map(|r| int_row(r)).collect())
}
