//! Multi-shard dispatch: fans bound statements out to shards, merges the
//! results, and keeps shard transactions attached to the session.

use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::time::Duration;

use sluice_common::cancel::CancelToken;
use sluice_common::config::{ExecutionConfig, HealthConfig};
use sluice_common::datum::QueryResult;
use sluice_common::error::{SluiceError, SluiceResult};
use sluice_common::types::{ShardTarget, TransactionId};
use sluice_engine::{ResolvedShardQuery, RowStream};

use crate::gateway::ShardGateway;
use crate::session::{Session, ShardSession};

/// One shard's share of a multi-shard call, rendered to SQL text.
struct ShardWork {
    target: ShardTarget,
    sqls: Vec<String>,
}

fn render(queries: Vec<ResolvedShardQuery>) -> SluiceResult<Vec<ShardWork>> {
    queries
        .into_iter()
        .map(|rsq| {
            let sqls = rsq
                .queries
                .iter()
                .map(|q| q.to_sql_text())
                .collect::<SluiceResult<Vec<_>>>()?;
            Ok(ShardWork {
                target: rsq.target,
                sqls,
            })
        })
        .collect()
}

/// Split a batch so no chunk exceeds `max_rows`; only the first chunk keeps
/// the field list.
pub(crate) fn rebatch(mut batch: QueryResult, max_rows: usize) -> Vec<QueryResult> {
    if max_rows == 0 || batch.rows.len() <= max_rows {
        return vec![batch];
    }
    let rows = std::mem::take(&mut batch.rows);
    let mut out = Vec::with_capacity(rows.len().div_ceil(max_rows));
    let mut first = Some(batch);
    for chunk in rows.chunks(max_rows) {
        let mut part = first.take().unwrap_or_default();
        part.rows = chunk.to_vec();
        out.push(part);
    }
    out
}

pub struct ScatterConn {
    gateway: Arc<dyn ShardGateway>,
    max_parallelism: usize,
    stream_buffer_batches: usize,
    stream_batch_rows: usize,
    wait_for_serving: Duration,
    poll_interval: Duration,
}

impl ScatterConn {
    pub fn new(gateway: Arc<dyn ShardGateway>, execution: &ExecutionConfig, health: &HealthConfig) -> Self {
        Self {
            gateway,
            max_parallelism: execution.max_parallelism.max(1),
            stream_buffer_batches: execution.stream_buffer_batches.max(1),
            stream_batch_rows: execution.stream_batch_rows,
            wait_for_serving: Duration::from_millis(health.wait_for_serving_ms),
            poll_interval: Duration::from_millis(health.poll_interval_ms.max(1)),
        }
    }

    pub fn gateway(&self) -> &Arc<dyn ShardGateway> {
        &self.gateway
    }

    /// Block until every target has a serving replica, polling on a fixed
    /// interval. Fails with `DeadlineExceeded` once the wait budget or the
    /// statement deadline runs out.
    pub fn wait_for_serving(&self, targets: &[ShardTarget], cancel: &CancelToken) -> SluiceResult<()> {
        if self.wait_for_serving.is_zero() {
            return Ok(());
        }
        let budget = cancel.with_timeout(self.wait_for_serving);
        loop {
            cancel.check()?;
            let pending: Vec<String> = targets
                .iter()
                .filter(|t| !self.gateway.is_serving(t))
                .map(|t| t.to_string())
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
            if budget.is_expired() {
                return Err(SluiceError::DeadlineExceeded(format!(
                    "timed out after {}ms waiting for serving shards: {}",
                    self.wait_for_serving.as_millis(),
                    pending.join(", ")
                )));
            }
            tracing::debug!(pending = pending.len(), "waiting for shards to become serving");
            budget.wait_timeout(self.poll_interval);
        }
    }

    pub fn execute_multi_shard(
        &self,
        session: &mut Session,
        queries: Vec<ResolvedShardQuery>,
        rollback_on_error: bool,
        can_autocommit: bool,
        cancel: &CancelToken,
    ) -> SluiceResult<QueryResult> {
        self.dispatch(session, queries, rollback_on_error, can_autocommit, false, cancel)
    }

    pub fn execute_batch_multi_shard(
        &self,
        session: &mut Session,
        queries: Vec<ResolvedShardQuery>,
        rollback_on_error: bool,
        can_autocommit: bool,
        cancel: &CancelToken,
    ) -> SluiceResult<QueryResult> {
        self.dispatch(session, queries, rollback_on_error, can_autocommit, true, cancel)
    }

    fn dispatch(
        &self,
        session: &mut Session,
        queries: Vec<ResolvedShardQuery>,
        rollback_on_error: bool,
        can_autocommit: bool,
        batch: bool,
        cancel: &CancelToken,
    ) -> SluiceResult<QueryResult> {
        cancel.check()?;
        let work = render(queries)?;
        if work.is_empty() {
            return Ok(QueryResult::default());
        }
        let targets: Vec<ShardTarget> = work.iter().map(|w| w.target.clone()).collect();
        self.wait_for_serving(&targets, cancel)?;
        sluice_observability::record_shard_fanout(work.len());

        if session.in_transaction() {
            self.run_in_transaction(session, work, rollback_on_error, can_autocommit, batch, cancel)
        } else {
            self.run_parallel(work, batch, cancel)
        }
    }

    fn run_statements(
        &self,
        work: &ShardWork,
        transaction_id: Option<TransactionId>,
        batch: bool,
    ) -> SluiceResult<QueryResult> {
        let mut merged = QueryResult::default();
        if batch {
            for r in self.gateway.execute_batch(&work.target, &work.sqls, transaction_id)? {
                merged.append(r);
            }
        } else {
            for sql in &work.sqls {
                merged.append(self.gateway.execute(&work.target, sql, transaction_id)?);
            }
        }
        Ok(merged)
    }

    /// Sequential, on the session's shard transactions, opening them lazily.
    fn run_in_transaction(
        &self,
        session: &mut Session,
        work: Vec<ShardWork>,
        rollback_on_error: bool,
        can_autocommit: bool,
        batch: bool,
        cancel: &CancelToken,
    ) -> SluiceResult<QueryResult> {
        let session_id = session.id;
        let Some(txn) = session.txn.as_mut() else {
            return self.run_parallel(work, batch, cancel);
        };

        if txn.implicit
            && can_autocommit
            && txn.shard_sessions.is_empty()
            && work.len() == 1
            && work[0].sqls.len() == 1
        {
            tracing::debug!(session_id, target = %work[0].target, "single-shard write with shard autocommit");
            let result = self.run_statements(&work[0], None, batch)?;
            txn.autocommitted = true;
            return Ok(result);
        }

        let mut merged = QueryResult::default();
        for w in &work {
            let attempt = cancel.check().and_then(|_| {
                let tid = match txn.transaction_for(&w.target) {
                    Some(tid) => tid,
                    None => {
                        let tid = self.gateway.begin(&w.target)?;
                        txn.shard_sessions.push(ShardSession {
                            target: w.target.clone(),
                            transaction_id: tid,
                        });
                        tid
                    }
                };
                self.run_statements(w, Some(tid), batch)
            });
            match attempt {
                Ok(r) => merged.append(r),
                Err(e) => {
                    tracing::warn!(session_id, target = %w.target, error = %e, "shard statement failed in transaction");
                    if rollback_on_error {
                        txn.rollback_pending = true;
                    }
                    return Err(e);
                }
            }
        }
        Ok(merged)
    }

    /// Parallel fan-out in waves of at most `max_parallelism` shards.
    /// Results merge in input order; the first failure in that order wins.
    fn run_parallel(&self, work: Vec<ShardWork>, batch: bool, cancel: &CancelToken) -> SluiceResult<QueryResult> {
        let mut results: Vec<SluiceResult<QueryResult>> = Vec::with_capacity(work.len());
        if work.len() == 1 {
            results.push(self.run_statements(&work[0], None, batch));
        } else {
            for wave in work.chunks(self.max_parallelism) {
                cancel.check()?;
                let wave_results: Vec<SluiceResult<QueryResult>> = std::thread::scope(|s| {
                    let handles: Vec<_> = wave
                        .iter()
                        .map(|w| s.spawn(move || self.run_statements(w, None, batch)))
                        .collect();
                    handles
                        .into_iter()
                        .map(|h| {
                            h.join().unwrap_or_else(|_| {
                                Err(SluiceError::internal_bug(
                                    "E-SCATTER-001",
                                    "shard worker panicked during fan-out",
                                    "thread::scope join returned Err",
                                ))
                            })
                        })
                        .collect()
                });
                results.extend(wave_results);
            }
        }

        let mut merged = QueryResult::default();
        let mut first_err = None;
        for (w, r) in work.iter().zip(results) {
            match r {
                Ok(r) if first_err.is_none() => merged.append(r),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(target = %w.target, error = %e, "shard statement failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(merged),
        }
    }

    /// One stream per shard statement, in input order. Each stream is fed by
    /// a producer thread that stays at most `stream_buffer_batches` ahead of
    /// the consumer.
    pub fn stream_execute_multi(
        &self,
        queries: Vec<ResolvedShardQuery>,
        cancel: &CancelToken,
    ) -> SluiceResult<Vec<RowStream>> {
        cancel.check()?;
        let work = render(queries)?;
        let targets: Vec<ShardTarget> = work.iter().map(|w| w.target.clone()).collect();
        self.wait_for_serving(&targets, cancel)?;

        let mut streams: Vec<RowStream> = Vec::new();
        for w in work {
            for sql in w.sqls {
                let (tx, rx) = sync_channel::<SluiceResult<QueryResult>>(self.stream_buffer_batches);
                let gateway = Arc::clone(&self.gateway);
                let target = w.target.clone();
                let cancel = cancel.clone();
                let max_rows = self.stream_batch_rows;
                std::thread::Builder::new()
                    .name(format!("sluice-stream-{}", target.shard))
                    .spawn(move || {
                        let stream = match gateway.stream_execute(&target, &sql) {
                            Ok(s) => s,
                            Err(e) => {
                                let _ = tx.send(Err(e));
                                return;
                            }
                        };
                        for item in stream {
                            let batch = match cancel.check().and(item) {
                                Ok(b) => b,
                                Err(e) => {
                                    let _ = tx.send(Err(e));
                                    return;
                                }
                            };
                            for chunk in rebatch(batch, max_rows) {
                                // Receiver gone: the consumer stopped reading.
                                if tx.send(Ok(chunk)).is_err() {
                                    return;
                                }
                            }
                        }
                    })
                    .map_err(|e| SluiceError::Internal(format!("failed to spawn stream producer: {e}")))?;
                streams.push(Box::new(rx.into_iter()));
            }
        }
        Ok(streams)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use super::*;
    use crate::gateway::{GatewayCall, MemoryGateway};
    use crate::session::TxnState;
    use sluice_common::datum::{DataType, Datum, Field, OwnedRow};
    use sluice_common::types::{BindVars, TabletType};
    use sluice_engine::BoundQuery;

    fn target(shard: &str) -> ShardTarget {
        ShardTarget::new("user", shard, TabletType::Primary)
    }

    fn rsq(shard: &str, sql: &str) -> ResolvedShardQuery {
        ResolvedShardQuery::single(target(shard), BoundQuery::new(sql, BindVars::new()))
    }

    fn one_row(v: i64) -> QueryResult {
        QueryResult::new(
            vec![Field::new("v", DataType::Int64)],
            vec![OwnedRow::new(vec![Datum::Int64(v)])],
        )
    }

    fn conn(gw: Arc<MemoryGateway>, parallelism: usize) -> ScatterConn {
        let execution = ExecutionConfig {
            max_parallelism: parallelism,
            ..Default::default()
        };
        ScatterConn::new(gw, &execution, &HealthConfig::default())
    }

    #[test]
    fn test_parallel_merge_keeps_input_order() {
        let gw = Arc::new(MemoryGateway::new(|t, _| {
            Ok(one_row(if t.shard == "-80" { 1 } else { 2 }))
        }));
        gw.set_latency(Duration::from_millis(20));
        let sc = conn(gw.clone(), 4);
        let mut session = Session::new("user");
        let res = sc
            .execute_multi_shard(
                &mut session,
                vec![rsq("80-", "select 1"), rsq("-80", "select 1")],
                false,
                false,
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(res.rows[0].values[0], Datum::Int64(2));
        assert_eq!(res.rows[1].values[0], Datum::Int64(1));
    }

    #[test]
    fn test_parallelism_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        let gw = Arc::new(MemoryGateway::new(move |_, _| {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            r.fetch_sub(1, Ordering::SeqCst);
            Ok(QueryResult::default())
        }));
        let sc = conn(gw, 2);
        let queries = (0..6).map(|i| rsq(&format!("s{i}"), "select 1")).collect();
        sc.execute_multi_shard(&mut Session::new("user"), queries, false, false, &CancelToken::new())
            .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_transaction_opens_shard_sessions_lazily() {
        let gw = Arc::new(MemoryGateway::new(|_, _| Ok(QueryResult::affected(1, 0))));
        let sc = conn(gw.clone(), 4);
        let mut session = Session::new("user");
        session.txn = Some(TxnState::default());
        let cancel = CancelToken::new();
        sc.execute_multi_shard(&mut session, vec![rsq("-80", "update t set a = 1")], true, false, &cancel)
            .unwrap();
        sc.execute_multi_shard(
            &mut session,
            vec![rsq("-80", "update t set a = 2"), rsq("80-", "update t set a = 2")],
            true,
            false,
            &cancel,
        )
        .unwrap();
        assert_eq!(gw.begin_count(), 2);
        let txn = session.txn.as_ref().unwrap();
        assert_eq!(txn.shard_sessions.len(), 2);
        let calls = gw.calls();
        assert!(calls.iter().all(|c| match c {
            GatewayCall::Execute { transaction_id, .. } => transaction_id.is_some(),
            _ => true,
        }));
    }

    #[test]
    fn test_failure_in_transaction_flags_rollback() {
        let gw = Arc::new(MemoryGateway::new(|t, _| {
            if t.shard == "80-" {
                Err(SluiceError::transport(t, "duplicate entry"))
            } else {
                Ok(QueryResult::affected(1, 0))
            }
        }));
        let sc = conn(gw, 4);
        let mut session = Session::new("user");
        session.txn = Some(TxnState::default());
        let err = sc
            .execute_multi_shard(
                &mut session,
                vec![rsq("-80", "delete from t"), rsq("80-", "delete from t")],
                true,
                false,
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, SluiceError::Transport { .. }));
        assert!(session.txn.as_ref().unwrap().rollback_pending);
    }

    #[test]
    fn test_implicit_single_shard_write_autocommits() {
        let gw = Arc::new(MemoryGateway::new(|_, _| Ok(QueryResult::affected(1, 0))));
        let sc = conn(gw.clone(), 4);
        let mut session = Session::new("user");
        session.txn = Some(TxnState {
            implicit: true,
            ..Default::default()
        });
        sc.execute_multi_shard(&mut session, vec![rsq("-80", "insert into t values (1)")], true, true, &CancelToken::new())
            .unwrap();
        assert_eq!(gw.begin_count(), 0);
        assert!(session.txn.as_ref().unwrap().autocommitted);
    }

    #[test]
    fn test_wait_for_serving_times_out() {
        let gw = Arc::new(MemoryGateway::new(|_, _| Ok(QueryResult::default())));
        gw.set_serving("-80", false);
        let health = HealthConfig {
            wait_for_serving_ms: 30,
            poll_interval_ms: 5,
        };
        let sc = ScatterConn::new(gw.clone(), &ExecutionConfig::default(), &health);
        let start = Instant::now();
        let err = sc
            .execute_multi_shard(&mut Session::new("user"), vec![rsq("-80", "select 1")], false, false, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, SluiceError::DeadlineExceeded(_)));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(gw.statement_count(), 0);
    }

    #[test]
    fn test_wait_for_serving_observes_cancel() {
        let gw = Arc::new(MemoryGateway::new(|_, _| Ok(QueryResult::default())));
        gw.set_serving("-80", false);
        let health = HealthConfig {
            wait_for_serving_ms: 10_000,
            poll_interval_ms: 5,
        };
        let sc = ScatterConn::new(gw, &ExecutionConfig::default(), &health);
        let cancel = CancelToken::new();
        cancel.cancel("client went away");
        let err = sc.wait_for_serving(&[target("-80")], &cancel).unwrap_err();
        assert!(matches!(err, SluiceError::Cancelled(_)));
    }

    #[test]
    fn test_stream_rebatches_large_results() {
        let gw = Arc::new(MemoryGateway::new(|_, _| {
            Ok(QueryResult::new(
                vec![Field::new("v", DataType::Int64)],
                (0..5).map(|i| OwnedRow::new(vec![Datum::Int64(i)])).collect(),
            ))
        }));
        let execution = ExecutionConfig {
            stream_batch_rows: 2,
            ..Default::default()
        };
        let sc = ScatterConn::new(gw, &execution, &HealthConfig::default());
        let mut streams = sc
            .stream_execute_multi(vec![rsq("-80", "select v from t")], &CancelToken::new())
            .unwrap();
        assert_eq!(streams.len(), 1);
        let batches: Vec<QueryResult> = streams.remove(0).map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].fields.len(), 1);
        assert!(batches[1].fields.is_empty());
        assert_eq!(batches.iter().map(|b| b.rows.len()).sum::<usize>(), 5);
    }
}
