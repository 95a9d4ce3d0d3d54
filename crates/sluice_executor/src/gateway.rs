//! The shard transport seam, and an in-memory implementation of it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use sluice_common::datum::QueryResult;
use sluice_common::error::{SluiceError, SluiceResult};
use sluice_common::types::{ShardTarget, TransactionId};
use sluice_engine::RowStream;

/// Per-shard statement execution and transaction control. Implementations
/// own connection pooling, RPC retries and replica selection.
pub trait ShardGateway: Send + Sync {
    /// Run one statement, inside `transaction_id` when given, otherwise with
    /// shard-side autocommit.
    fn execute(
        &self,
        target: &ShardTarget,
        sql: &str,
        transaction_id: Option<TransactionId>,
    ) -> SluiceResult<QueryResult>;

    /// Run statements in one round trip, one result per statement.
    fn execute_batch(
        &self,
        target: &ShardTarget,
        sqls: &[String],
        transaction_id: Option<TransactionId>,
    ) -> SluiceResult<Vec<QueryResult>>;

    /// Row batches as the shard produces them. The first batch carries the
    /// field list.
    fn stream_execute(&self, target: &ShardTarget, sql: &str) -> SluiceResult<RowStream>;

    fn begin(&self, target: &ShardTarget) -> SluiceResult<TransactionId>;

    fn commit(&self, target: &ShardTarget, transaction_id: TransactionId) -> SluiceResult<()>;

    fn rollback(&self, target: &ShardTarget, transaction_id: TransactionId) -> SluiceResult<()>;

    /// Whether a healthy replica currently serves `target`.
    fn is_serving(&self, _target: &ShardTarget) -> bool {
        true
    }
}

/// One recorded gateway call.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    Execute {
        target: ShardTarget,
        sql: String,
        transaction_id: Option<TransactionId>,
    },
    Batch {
        target: ShardTarget,
        sqls: Vec<String>,
        transaction_id: Option<TransactionId>,
    },
    Stream {
        target: ShardTarget,
        sql: String,
    },
    Begin(ShardTarget),
    Commit(ShardTarget, TransactionId),
    Rollback(ShardTarget, TransactionId),
}

type Responder = Box<dyn Fn(&ShardTarget, &str) -> SluiceResult<QueryResult> + Send + Sync>;

/// In-process gateway answering every statement through a responder
/// closure. Records all calls and supports latency and failure injection.
pub struct MemoryGateway {
    responder: Responder,
    latency: Mutex<Duration>,
    calls: Mutex<Vec<GatewayCall>>,
    next_transaction_id: AtomicI64,
    commit_error: Mutex<Option<SluiceError>>,
    rollback_error: Mutex<Option<SluiceError>>,
    not_serving: Mutex<HashSet<String>>,
}

impl MemoryGateway {
    pub fn new(
        responder: impl Fn(&ShardTarget, &str) -> SluiceResult<QueryResult> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            latency: Mutex::new(Duration::ZERO),
            calls: Mutex::new(Vec::new()),
            next_transaction_id: AtomicI64::new(1),
            commit_error: Mutex::new(None),
            rollback_error: Mutex::new(None),
            not_serving: Mutex::new(HashSet::new()),
        }
    }

    /// Delay applied to every statement.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Fail every subsequent commit with `err`.
    pub fn set_commit_error(&self, err: Option<SluiceError>) {
        *self.commit_error.lock() = err;
    }

    /// Fail every subsequent rollback with `err`.
    pub fn set_rollback_error(&self, err: Option<SluiceError>) {
        *self.rollback_error.lock() = err;
    }

    pub fn set_serving(&self, shard: &str, serving: bool) {
        let mut not_serving = self.not_serving.lock();
        if serving {
            not_serving.remove(shard);
        } else {
            not_serving.insert(shard.to_string());
        }
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Statements reaching shards through execute, batch or stream.
    pub fn statement_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .map(|c| match c {
                GatewayCall::Execute { .. } | GatewayCall::Stream { .. } => 1,
                GatewayCall::Batch { sqls, .. } => sqls.len(),
                _ => 0,
            })
            .sum()
    }

    pub fn begin_count(&self) -> usize {
        self.count(|c| matches!(c, GatewayCall::Begin(_)))
    }

    pub fn commit_count(&self) -> usize {
        self.count(|c| matches!(c, GatewayCall::Commit(..)))
    }

    pub fn rollback_count(&self) -> usize {
        self.count(|c| matches!(c, GatewayCall::Rollback(..)))
    }

    fn count(&self, pred: impl Fn(&GatewayCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: GatewayCall) {
        self.calls.lock().push(call);
    }

    fn respond(&self, target: &ShardTarget, sql: &str) -> SluiceResult<QueryResult> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        (self.responder)(target, sql)
    }
}

impl ShardGateway for MemoryGateway {
    fn execute(
        &self,
        target: &ShardTarget,
        sql: &str,
        transaction_id: Option<TransactionId>,
    ) -> SluiceResult<QueryResult> {
        self.record(GatewayCall::Execute {
            target: target.clone(),
            sql: sql.to_string(),
            transaction_id,
        });
        self.respond(target, sql)
    }

    fn execute_batch(
        &self,
        target: &ShardTarget,
        sqls: &[String],
        transaction_id: Option<TransactionId>,
    ) -> SluiceResult<Vec<QueryResult>> {
        self.record(GatewayCall::Batch {
            target: target.clone(),
            sqls: sqls.to_vec(),
            transaction_id,
        });
        sqls.iter().map(|sql| self.respond(target, sql)).collect()
    }

    fn stream_execute(&self, target: &ShardTarget, sql: &str) -> SluiceResult<RowStream> {
        self.record(GatewayCall::Stream {
            target: target.clone(),
            sql: sql.to_string(),
        });
        let result = self.respond(target, sql)?;
        Ok(Box::new(std::iter::once(Ok(result))))
    }

    fn begin(&self, target: &ShardTarget) -> SluiceResult<TransactionId> {
        self.record(GatewayCall::Begin(target.clone()));
        Ok(TransactionId(
            self.next_transaction_id.fetch_add(1, Ordering::SeqCst),
        ))
    }

    fn commit(&self, target: &ShardTarget, transaction_id: TransactionId) -> SluiceResult<()> {
        self.record(GatewayCall::Commit(target.clone(), transaction_id));
        match self.commit_error.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn rollback(&self, target: &ShardTarget, transaction_id: TransactionId) -> SluiceResult<()> {
        self.record(GatewayCall::Rollback(target.clone(), transaction_id));
        match self.rollback_error.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn is_serving(&self, target: &ShardTarget) -> bool {
        !self.not_serving.lock().contains(&target.shard)
    }
}
