//! `VCursor` implementation backing one top-level statement.

use parking_lot::Mutex;
use sluice_common::cancel::CancelToken;
use sluice_common::config::ExecutionConfig;
use sluice_common::datum::QueryResult;
use sluice_common::error::SluiceResult;
use sluice_common::types::{ShardTarget, TabletType};
use sluice_engine::{Destination, DestinationResolver, ResolvedShardQuery, RowStream, ShardHint, VCursor};

use crate::scatter_conn::ScatterConn;
use crate::session::Session;

/// Borrows the session for the duration of one statement. The session sits
/// behind a mutex so primitives can reach it through `&dyn VCursor`.
pub struct ExecutionCursor<'a> {
    session: Mutex<&'a mut Session>,
    resolver: &'a dyn DestinationResolver,
    scatter: &'a ScatterConn,
    cancel: CancelToken,
    limits: &'a ExecutionConfig,
    ignore_max_memory_rows: bool,
    tablet_type: TabletType,
    shard_hint: Option<ShardHint>,
}

impl<'a> ExecutionCursor<'a> {
    pub fn new(
        session: &'a mut Session,
        resolver: &'a dyn DestinationResolver,
        scatter: &'a ScatterConn,
        cancel: CancelToken,
        limits: &'a ExecutionConfig,
    ) -> Self {
        let tablet_type = session.tablet_type;
        let shard_hint = session.shard_hint.clone();
        Self {
            session: Mutex::new(session),
            resolver,
            scatter,
            cancel,
            limits,
            ignore_max_memory_rows: false,
            tablet_type,
            shard_hint,
        }
    }

    pub fn with_ignore_max_memory_rows(mut self, ignore: bool) -> Self {
        self.ignore_max_memory_rows = ignore;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

impl VCursor for ExecutionCursor<'_> {
    fn tablet_type(&self) -> TabletType {
        self.tablet_type
    }

    fn shard_hint(&self) -> Option<ShardHint> {
        self.shard_hint.clone()
    }

    fn resolve_destinations(
        &self,
        keyspace: &str,
        destinations: &[Destination],
    ) -> SluiceResult<Vec<Vec<ShardTarget>>> {
        self.resolver.resolve(keyspace, self.tablet_type, destinations)
    }

    fn execute_multi_shard(
        &self,
        queries: Vec<ResolvedShardQuery>,
        rollback_on_error: bool,
        can_autocommit: bool,
    ) -> SluiceResult<QueryResult> {
        let mut session = self.session.lock();
        self.scatter
            .execute_multi_shard(&mut session, queries, rollback_on_error, can_autocommit, &self.cancel)
    }

    fn execute_batch_multi_shard(
        &self,
        queries: Vec<ResolvedShardQuery>,
        rollback_on_error: bool,
        can_autocommit: bool,
    ) -> SluiceResult<QueryResult> {
        let mut session = self.session.lock();
        self.scatter
            .execute_batch_multi_shard(&mut session, queries, rollback_on_error, can_autocommit, &self.cancel)
    }

    fn stream_execute_multi(&self, queries: Vec<ResolvedShardQuery>) -> SluiceResult<Vec<RowStream>> {
        self.scatter.stream_execute_multi(queries, &self.cancel)
    }

    fn max_memory_rows(&self) -> usize {
        self.limits.max_memory_rows
    }

    fn ignore_max_memory_rows(&self) -> bool {
        self.ignore_max_memory_rows
    }

    fn warn_memory_rows(&self) -> usize {
        self.limits.warn_memory_rows
    }

    fn in_transaction(&self) -> bool {
        self.session.lock().in_transaction()
    }

    fn check_cancelled(&self) -> SluiceResult<()> {
        self.cancel.check()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::gateway::MemoryGateway;
    use crate::session::TxnState;
    use sluice_common::config::HealthConfig;
    use sluice_common::error::SluiceError;
    use sluice_common::types::BindVars;
    use sluice_engine::BoundQuery;
    use sluice_sharding::{HashShardResolver, KeyspaceLayout};

    fn fixture() -> (HashShardResolver, ScatterConn, ExecutionConfig) {
        let resolver = HashShardResolver::new().with_keyspace(KeyspaceLayout::uniform("user", 2));
        let gw = Arc::new(MemoryGateway::new(|_, _| Ok(QueryResult::default())));
        let limits = ExecutionConfig {
            max_memory_rows: 10,
            ..Default::default()
        };
        let scatter = ScatterConn::new(gw, &limits, &HealthConfig::default());
        (resolver, scatter, limits)
    }

    #[test]
    fn test_failed_write_in_transaction_marks_rollback() {
        let (resolver, _, limits) = fixture();
        let gw = Arc::new(MemoryGateway::new(|t, _| {
            if t.shard == "80-" {
                Err(SluiceError::transport(t, "deadlock"))
            } else {
                Ok(QueryResult::affected(1, 0))
            }
        }));
        let scatter = ScatterConn::new(gw, &limits, &HealthConfig::default());
        let mut session = Session::new("user");
        session.txn = Some(TxnState::default());
        {
            let vc = ExecutionCursor::new(&mut session, &resolver, &scatter, CancelToken::new(), &limits);
            assert!(vc.in_transaction());
            let queries = ["-80", "80-"]
                .iter()
                .map(|shard| {
                    ResolvedShardQuery::single(
                        ShardTarget::new("user", *shard, TabletType::Primary),
                        BoundQuery::new("update t set a = 1", BindVars::new()),
                    )
                })
                .collect();
            assert!(vc.execute_multi_shard(queries, true, false).is_err());
        }
        let txn = session.txn.unwrap();
        assert!(txn.rollback_pending);
        assert_eq!(txn.shard_sessions.len(), 2);
    }

    #[test]
    fn test_memory_limit_and_override() {
        let (resolver, scatter, limits) = fixture();
        let mut session = Session::new("user");
        let vc = ExecutionCursor::new(&mut session, &resolver, &scatter, CancelToken::new(), &limits);
        assert!(matches!(vc.check_memory_rows(11), Err(SluiceError::ResourceLimit(_))));
        let vc = vc.with_ignore_max_memory_rows(true);
        assert!(vc.check_memory_rows(11).is_ok());
    }

    #[test]
    fn test_cancel_is_observed() {
        let (resolver, scatter, limits) = fixture();
        let mut session = Session::new("user");
        session.use_target("user:80-@replica").unwrap();
        let cancel = CancelToken::new();
        let vc = ExecutionCursor::new(&mut session, &resolver, &scatter, cancel.clone(), &limits);
        assert_eq!(vc.tablet_type(), TabletType::Replica);
        assert_eq!(vc.shard_hint().unwrap().shard, "80-");
        cancel.cancel("killed");
        assert!(matches!(vc.check_cancelled(), Err(SluiceError::Cancelled(_))));
    }
}
