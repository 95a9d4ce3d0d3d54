//! Per-connection session state owned by the caller and lent to the
//! executor for one statement at a time.

use sluice_common::error::{SluiceError, SluiceResult};
use sluice_common::request_context::next_session_id;
use sluice_common::types::{ShardTarget, TabletType, TransactionId};
use sluice_engine::ShardHint;

/// A shard-local transaction opened on behalf of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSession {
    pub target: ShardTarget,
    pub transaction_id: TransactionId,
}

/// Router-level transaction: the shard transactions it spans, opened
/// lazily as statements reach new shards.
#[derive(Debug, Clone, Default)]
pub struct TxnState {
    pub shard_sessions: Vec<ShardSession>,
    /// Opened by the router around a single autocommit statement.
    pub implicit: bool,
    /// A single-shard write ran with shard-side autocommit, so there is
    /// nothing left to commit.
    pub autocommitted: bool,
    /// Some shard failed mid-DML; the transaction must be rolled back.
    pub rollback_pending: bool,
}

impl TxnState {
    pub fn transaction_for(&self, target: &ShardTarget) -> Option<TransactionId> {
        self.shard_sessions
            .iter()
            .find(|s| s.target == *target)
            .map(|s| s.transaction_id)
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: u64,
    /// Default keyspace for unqualified statements and plan cache keys.
    pub keyspace: String,
    /// Explicit `keyspace:shard` target, if any.
    pub shard_hint: Option<ShardHint>,
    pub tablet_type: TabletType,
    pub autocommit: bool,
    pub txn: Option<TxnState>,
    /// Rows affected by the last DML, -1 after a read.
    pub row_count: i64,
    /// Rows returned by the last SELECT.
    pub found_rows: u64,
}

impl Session {
    pub fn new(keyspace: impl Into<String>) -> Self {
        Self {
            id: next_session_id(),
            keyspace: keyspace.into(),
            shard_hint: None,
            tablet_type: TabletType::Primary,
            autocommit: true,
            txn: None,
            row_count: -1,
            found_rows: 0,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    /// Point the session at `keyspace[:shard][@tablet_type]`.
    pub fn use_target(&mut self, target: &str) -> SluiceResult<()> {
        let (rest, tablet_type) = match target.rsplit_once('@') {
            Some((rest, tt)) => (rest, parse_tablet_type(tt)?),
            None => (target, TabletType::Primary),
        };
        let (keyspace, shard) = match rest.split_once(':') {
            Some((ks, shard)) if !shard.is_empty() => (ks, Some(shard)),
            Some((ks, _)) => (ks, None),
            None => (rest, None),
        };
        if keyspace.is_empty() {
            return Err(SluiceError::Config(format!("invalid target {target:?}: empty keyspace")));
        }
        self.keyspace = keyspace.to_string();
        self.shard_hint = shard.map(|s| ShardHint {
            keyspace: keyspace.to_string(),
            shard: s.to_string(),
        });
        self.tablet_type = tablet_type;
        tracing::debug!(session_id = self.id, target, "session target changed");
        Ok(())
    }

    /// Cache-key suffix for the explicit shard target.
    pub fn hint_key(&self) -> Option<String> {
        self.shard_hint
            .as_ref()
            .map(|h| format!("{}:{}", h.keyspace, h.shard))
    }
}

fn parse_tablet_type(s: &str) -> SluiceResult<TabletType> {
    match s.to_ascii_lowercase().as_str() {
        "primary" | "master" => Ok(TabletType::Primary),
        "replica" => Ok(TabletType::Replica),
        "rdonly" => Ok(TabletType::Rdonly),
        other => Err(SluiceError::Config(format!("unknown tablet type: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_use_target_with_shard_and_type() {
        let mut s = Session::new("main");
        s.use_target("user:-80@replica").unwrap();
        assert_eq!(s.keyspace, "user");
        assert_eq!(s.tablet_type, TabletType::Replica);
        assert_eq!(s.hint_key().as_deref(), Some("user:-80"));
    }

    #[test]
    fn test_use_target_keyspace_only_clears_hint() {
        let mut s = Session::new("main");
        s.use_target("user:80-").unwrap();
        s.use_target("main").unwrap();
        assert!(s.shard_hint.is_none());
        assert_eq!(s.tablet_type, TabletType::Primary);
    }

    #[test]
    fn test_invalid_targets() {
        let mut s = Session::new("main");
        assert!(s.use_target(":-80").is_err());
        assert!(s.use_target("user@leader").is_err());
    }

    #[test]
    fn test_transaction_lookup() {
        let target = ShardTarget::new("user", "-80", TabletType::Primary);
        let txn = TxnState {
            shard_sessions: vec![ShardSession {
                target: target.clone(),
                transaction_id: TransactionId(9),
            }],
            ..Default::default()
        };
        assert_eq!(txn.transaction_for(&target), Some(TransactionId(9)));
        assert_eq!(
            txn.transaction_for(&ShardTarget::new("user", "80-", TabletType::Primary)),
            None
        );
    }
}
