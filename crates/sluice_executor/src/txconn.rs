//! Router-level transactions spanning shard-local ones.

use std::sync::Arc;

use sluice_common::error::{SluiceError, SluiceResult};

use crate::gateway::ShardGateway;
use crate::session::{Session, ShardSession, TxnState};

pub trait TransactionCoordinator: Send + Sync {
    fn begin(&self, session: &mut Session) -> SluiceResult<()>;

    /// Commit every shard transaction of the session. The session leaves the
    /// transaction whether or not this succeeds.
    fn commit(&self, session: &mut Session) -> SluiceResult<()>;

    /// Roll back every shard transaction, reporting the first failure.
    fn rollback(&self, session: &mut Session) -> SluiceResult<()>;
}

/// Commits shard by shard in the order shards joined the transaction. Not
/// atomic across shards: a commit failure rolls back the shards not yet
/// committed and reports the failure.
pub struct TxConn {
    gateway: Arc<dyn ShardGateway>,
}

impl TxConn {
    pub fn new(gateway: Arc<dyn ShardGateway>) -> Self {
        Self { gateway }
    }

    fn rollback_all(&self, shard_sessions: &[ShardSession]) -> SluiceResult<()> {
        let mut first_err = None;
        for ss in shard_sessions {
            if let Err(e) = self.gateway.rollback(&ss.target, ss.transaction_id) {
                tracing::warn!(target = %ss.target, txn = %ss.transaction_id, error = %e, "shard rollback failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl TransactionCoordinator for TxConn {
    fn begin(&self, session: &mut Session) -> SluiceResult<()> {
        if session.in_transaction() {
            return Err(SluiceError::Transaction(format!(
                "session {} already has an open transaction",
                session.id
            )));
        }
        session.txn = Some(TxnState::default());
        Ok(())
    }

    fn commit(&self, session: &mut Session) -> SluiceResult<()> {
        let Some(txn) = session.txn.take() else {
            return Ok(());
        };
        if txn.rollback_pending {
            // The statement that failed mid-DML already reported its error.
            let _ = self.rollback_all(&txn.shard_sessions);
            return Err(SluiceError::Transaction(
                "transaction rolled back after a partially applied statement".into(),
            ));
        }
        for (i, ss) in txn.shard_sessions.iter().enumerate() {
            if let Err(e) = self.gateway.commit(&ss.target, ss.transaction_id) {
                tracing::warn!(
                    session_id = session.id,
                    target = %ss.target,
                    committed = i,
                    total = txn.shard_sessions.len(),
                    error = %e,
                    "commit failed, rolling back remaining shards"
                );
                if let Err(rb) = self.rollback_all(&txn.shard_sessions[i + 1..]) {
                    tracing::warn!(session_id = session.id, error = %rb, "rollback after failed commit failed");
                }
                return Err(e);
            }
        }
        tracing::debug!(session_id = session.id, shards = txn.shard_sessions.len(), "transaction committed");
        Ok(())
    }

    fn rollback(&self, session: &mut Session) -> SluiceResult<()> {
        let Some(txn) = session.txn.take() else {
            return Ok(());
        };
        tracing::debug!(session_id = session.id, shards = txn.shard_sessions.len(), "rolling back transaction");
        self.rollback_all(&txn.shard_sessions)
    }
}
