//! Statement dispatch: plan lookup, transaction control, implicit
//! transaction bracketing and read consolidation.

use std::sync::Arc;
use std::time::Duration;

use sluice_common::cancel::CancelToken;
use sluice_common::config::RouterConfig;
use sluice_common::datum::QueryResult;
use sluice_common::error::{SluiceError, SluiceResult};
use sluice_common::request_context::RequestContext;
use sluice_common::types::{BindVars, StatementKind};
use sluice_engine::{render_bind_vars, DestinationResolver, PrimitiveOps};

use crate::consolidator::Consolidator;
use crate::cursor::ExecutionCursor;
use crate::gateway::ShardGateway;
use crate::normalizer::{cache_key, has_skip_cache_directive, normalize, NormalizedStatement};
use crate::plan_cache::{Plan, PlanCache};
use crate::planner::{PlanRequest, Planner};
use crate::scatter_conn::{rebatch, ScatterConn};
use crate::session::Session;
use crate::txconn::TransactionCoordinator;

/// Per-call knobs.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Neither read nor populate the plan cache.
    pub skip_cache: bool,
    /// Lift the in-memory row limit. Administrative statements only.
    pub ignore_max_memory_rows: bool,
    /// Caller's cancellation handle; the query timeout is layered on top.
    pub cancel: CancelToken,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatementResult {
    pub kind: StatementKind,
    pub result: QueryResult,
}

impl StatementResult {
    fn empty(kind: StatementKind) -> Self {
        Self {
            kind,
            result: QueryResult::default(),
        }
    }
}

/// The router's statement entry point. One instance serves every session;
/// sessions are lent to it one statement at a time.
pub struct Executor {
    config: RouterConfig,
    resolver: Arc<dyn DestinationResolver>,
    planner: Arc<dyn Planner>,
    txn: Arc<dyn TransactionCoordinator>,
    scatter: ScatterConn,
    plan_cache: PlanCache,
    consolidator: Consolidator,
}

impl Executor {
    pub fn new(
        config: RouterConfig,
        resolver: Arc<dyn DestinationResolver>,
        planner: Arc<dyn Planner>,
        txn: Arc<dyn TransactionCoordinator>,
        gateway: Arc<dyn ShardGateway>,
    ) -> Self {
        let scatter = ScatterConn::new(gateway, &config.execution, &config.health);
        let plan_cache = PlanCache::new(&config.plan_cache);
        let consolidator = Consolidator::new(&config.consolidator);
        tracing::info!(
            plan_cache_capacity = plan_cache.capacity(),
            consolidator = config.consolidator.enabled,
            max_parallelism = config.execution.max_parallelism,
            "executor initialized"
        );
        Self {
            config,
            resolver,
            planner,
            txn,
            scatter,
            plan_cache,
            consolidator,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn plan_cache(&self) -> &PlanCache {
        &self.plan_cache
    }

    pub fn consolidator(&self) -> &Consolidator {
        &self.consolidator
    }

    pub fn execute(&self, session: &mut Session, sql: &str, bind_vars: &BindVars) -> SluiceResult<StatementResult> {
        self.execute_with(session, sql, bind_vars, &ExecuteOptions::default())
    }

    pub fn execute_with(
        &self,
        session: &mut Session,
        sql: &str,
        bind_vars: &BindVars,
        opts: &ExecuteOptions,
    ) -> SluiceResult<StatementResult> {
        let rctx = RequestContext::new(session.id);
        let kind = StatementKind::from_sql(sql);
        let span = tracing::debug_span!("execute", session_id = session.id, query_id = rctx.query_id, kind = kind.as_str());
        let _enter = span.enter();

        let cancel = self.statement_cancel(opts);
        let outcome = self.execute_inner(session, sql, bind_vars, kind, opts, &cancel);
        self.finish(&rctx, kind, &outcome);
        outcome
    }

    /// Deliver the statement's rows to `callback` in batches as shards
    /// produce them. Writes, reads inside a transaction and transaction
    /// control are executed in full first, then delivered in batches.
    pub fn stream_execute(
        &self,
        session: &mut Session,
        sql: &str,
        bind_vars: &BindVars,
        opts: &ExecuteOptions,
        callback: &mut dyn FnMut(QueryResult) -> SluiceResult<()>,
    ) -> SluiceResult<StatementKind> {
        let rctx = RequestContext::new(session.id);
        let kind = StatementKind::from_sql(sql);
        let span = tracing::debug_span!("stream_execute", session_id = session.id, query_id = rctx.query_id, kind = kind.as_str());
        let _enter = span.enter();

        let cancel = self.statement_cancel(opts);
        let outcome = self.stream_inner(session, sql, bind_vars, kind, opts, &cancel, callback);
        let success = outcome.is_ok();
        sluice_observability::record_query_metrics(rctx.elapsed_us(), kind.as_str(), success);
        if let Err(e) = &outcome {
            e.log_if_fatal();
            tracing::debug!(ctx = %rctx.as_context_str(), error = %e, "streaming statement failed");
        }
        outcome
    }

    /// Execute statements in order, one outcome per statement. A failed
    /// statement does not stop the ones after it.
    pub fn batch_execute(
        &self,
        session: &mut Session,
        statements: &[&str],
        bind_vars: &[BindVars],
        opts: &ExecuteOptions,
    ) -> SluiceResult<Vec<SluiceResult<StatementResult>>> {
        if !bind_vars.is_empty() && bind_vars.len() != statements.len() {
            return Err(SluiceError::Execution(format!(
                "batch has {} statements but {} bind variable sets",
                statements.len(),
                bind_vars.len()
            )));
        }
        let empty = BindVars::new();
        let results = statements
            .iter()
            .enumerate()
            .map(|(i, sql)| self.execute_with(session, sql, bind_vars.get(i).unwrap_or(&empty), opts))
            .collect();
        Ok(results)
    }

    fn statement_cancel(&self, opts: &ExecuteOptions) -> CancelToken {
        opts.cancel
            .with_timeout(Duration::from_millis(self.config.execution.query_timeout_ms))
    }

    fn finish(&self, rctx: &RequestContext, kind: StatementKind, outcome: &SluiceResult<StatementResult>) {
        sluice_observability::record_query_metrics(rctx.elapsed_us(), kind.as_str(), outcome.is_ok());
        match outcome {
            Ok(r) => tracing::debug!(
                elapsed_us = rctx.elapsed_us(),
                rows = r.result.row_count(),
                rows_affected = r.result.rows_affected,
                "statement complete"
            ),
            Err(e) => {
                e.log_if_fatal();
                tracing::debug!(ctx = %rctx.as_context_str(), error = %e, "statement failed");
            }
        }
    }

    fn execute_inner(
        &self,
        session: &mut Session,
        sql: &str,
        bind_vars: &BindVars,
        kind: StatementKind,
        opts: &ExecuteOptions,
        cancel: &CancelToken,
    ) -> SluiceResult<StatementResult> {
        cancel.check()?;
        if kind.is_txn_control() {
            self.transaction_control(session, kind)?;
            return Ok(StatementResult::empty(kind));
        }

        let (plan, normalized) = self.get_plan(session, sql, kind, bind_vars, opts.skip_cache)?;
        let result = if self.consolidation_eligible(session, &plan) {
            self.execute_consolidated(session, &plan, &normalized, opts, cancel)?
        } else {
            self.execute_plan(session, &plan, &normalized.bind_vars, opts, cancel)?
        };
        self.after_statement(session, &plan, &result);
        Ok(StatementResult {
            kind: plan.kind,
            result,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn stream_inner(
        &self,
        session: &mut Session,
        sql: &str,
        bind_vars: &BindVars,
        kind: StatementKind,
        opts: &ExecuteOptions,
        cancel: &CancelToken,
        callback: &mut dyn FnMut(QueryResult) -> SluiceResult<()>,
    ) -> SluiceResult<StatementKind> {
        cancel.check()?;
        if kind.is_txn_control() {
            self.transaction_control(session, kind)?;
            callback(QueryResult::default())?;
            return Ok(kind);
        }

        let (plan, NormalizedStatement { bind_vars, .. }) =
            self.get_plan(session, sql, kind, bind_vars, opts.skip_cache)?;
        if plan.needs_transaction() || session.in_transaction() {
            // Shard streams carry no transaction, so reads inside one run
            // on the session's shard transactions and are re-batched here.
            let result = self.execute_plan(session, &plan, &bind_vars, opts, cancel)?;
            self.after_statement(session, &plan, &result);
            for batch in rebatch(result, self.config.execution.stream_batch_rows) {
                callback(batch)?;
            }
            return Ok(plan.kind);
        }

        let mut rows = 0usize;
        {
            let mut counting = |batch: QueryResult| {
                rows += batch.rows.len();
                callback(batch)
            };
            let vc = ExecutionCursor::new(
                session,
                self.resolver.as_ref(),
                &self.scatter,
                cancel.clone(),
                &self.config.execution,
            )
            .with_ignore_max_memory_rows(opts.ignore_max_memory_rows);
            plan.root.stream_execute(&vc, &bind_vars, &mut counting)?;
        }
        if plan.kind == StatementKind::Select {
            session.row_count = -1;
            session.found_rows = rows as u64;
        }
        Ok(plan.kind)
    }

    fn transaction_control(&self, session: &mut Session, kind: StatementKind) -> SluiceResult<()> {
        match kind {
            StatementKind::Begin => {
                if session.in_transaction() {
                    // BEGIN inside a transaction commits the open one first.
                    tracing::debug!(session_id = session.id, "implicit commit of open transaction on BEGIN");
                    self.txn.commit(session)?;
                    sluice_observability::record_txn_metrics("commit", false);
                }
                self.txn.begin(session)?;
                sluice_observability::record_txn_metrics("begin", false);
            }
            StatementKind::Commit => {
                if session.in_transaction() {
                    let outcome = self.txn.commit(session);
                    sluice_observability::record_txn_metrics(
                        if outcome.is_ok() { "commit" } else { "commit_failed" },
                        false,
                    );
                    outcome?;
                }
            }
            StatementKind::Rollback => {
                if session.in_transaction() {
                    self.txn.rollback(session)?;
                    sluice_observability::record_txn_metrics("rollback", false);
                }
            }
            other => {
                return Err(SluiceError::internal_bug(
                    "E-EXEC-001",
                    "transaction control called for a data statement",
                    format!("kind={other}"),
                ))
            }
        }
        Ok(())
    }

    /// Cached plan for the statement, or a freshly compiled one, plus the
    /// normalized statement whose bind variables the plan must run with.
    fn get_plan(
        &self,
        session: &Session,
        sql: &str,
        kind: StatementKind,
        bind_vars: &BindVars,
        skip_cache: bool,
    ) -> SluiceResult<(Arc<Plan>, NormalizedStatement)> {
        let normalized = normalize(sql, kind, bind_vars);
        let hint = session.hint_key();
        let key = cache_key(&session.keyspace, &normalized.sql, hint.as_deref());
        let use_cache = kind.is_cacheable() && !skip_cache && !has_skip_cache_directive(sql);

        if use_cache {
            if let Some(plan) = self.plan_cache.get(&key) {
                tracing::debug!(key = %key, "plan cache hit");
                return Ok((plan, normalized));
            }
        }

        let req = PlanRequest {
            sql: &normalized.sql,
            kind,
            keyspace: &session.keyspace,
            tablet_type: session.tablet_type,
            shard_hint: session.shard_hint.as_ref(),
            bind_vars: &normalized.bind_vars,
        };
        let (plan_kind, root) = self.planner.plan(&req)?;
        let plan = Arc::new(Plan::new(plan_kind, root, key));
        if use_cache && plan_kind.is_cacheable() {
            self.plan_cache.put(&plan.cache_key, Arc::clone(&plan));
        }
        tracing::debug!(key = %plan.cache_key, cached = use_cache, "compiled plan:\n{}", plan.root.describe());
        Ok((plan, normalized))
    }

    fn consolidation_eligible(&self, session: &Session, plan: &Plan) -> bool {
        self.config.consolidator.enabled
            && plan.kind == StatementKind::Select
            && !plan.needs_transaction()
            && !session.tablet_type.is_primary()
            && !session.in_transaction()
    }

    fn execute_consolidated(
        &self,
        session: &mut Session,
        plan: &Plan,
        normalized: &NormalizedStatement,
        opts: &ExecuteOptions,
        cancel: &CancelToken,
    ) -> SluiceResult<QueryResult> {
        let bind_vars = &normalized.bind_vars;
        // Unrenderable templates run unconsolidated; the run itself reports
        // the problem.
        let Ok(rendered) = render_bind_vars(&normalized.sql, bind_vars) else {
            return self.execute_plan(session, plan, bind_vars, opts, cancel);
        };
        let hint = session.hint_key();
        let key = format!(
            "{}@{}",
            cache_key(&session.keyspace, &rendered, hint.as_deref()),
            session.tablet_type
        );
        let (role, outcome) = self.consolidator.consolidate(&key, cancel, || {
            self.execute_plan(session, plan, bind_vars, opts, cancel)
        });
        tracing::debug!(role = role.as_str(), "consolidated read");
        outcome
    }

    /// Run the plan, inside an implicit transaction when it writes and the
    /// session has no transaction of its own.
    fn execute_plan(
        &self,
        session: &mut Session,
        plan: &Plan,
        bind_vars: &BindVars,
        opts: &ExecuteOptions,
        cancel: &CancelToken,
    ) -> SluiceResult<QueryResult> {
        if !plan.needs_transaction() {
            return self.run_on_cursor(session, plan, bind_vars, opts, cancel);
        }

        if session.in_transaction() {
            let outcome = self.run_on_cursor(session, plan, bind_vars, opts, cancel);
            if outcome.is_err() && session.txn.as_ref().is_some_and(|t| t.rollback_pending) {
                tracing::warn!(session_id = session.id, "statement failed mid-write, rolling back transaction");
                self.rollback_quietly(session, false);
            }
            return outcome;
        }

        if !session.autocommit {
            // autocommit off: the write opens a transaction the caller ends.
            self.txn.begin(session)?;
            sluice_observability::record_txn_metrics("begin", false);
            return self.run_on_cursor(session, plan, bind_vars, opts, cancel);
        }

        self.txn.begin(session)?;
        if let Some(txn) = session.txn.as_mut() {
            txn.implicit = true;
        }
        sluice_observability::record_txn_metrics("begin", true);

        match self.run_on_cursor(session, plan, bind_vars, opts, cancel) {
            Ok(result) => match self.txn.commit(session) {
                Ok(()) => {
                    sluice_observability::record_txn_metrics("commit", true);
                    Ok(result)
                }
                Err(e) => {
                    tracing::warn!(session_id = session.id, error = %e, "implicit commit failed");
                    self.rollback_quietly(session, true);
                    Err(e)
                }
            },
            Err(e) => {
                self.rollback_quietly(session, true);
                Err(e)
            }
        }
    }

    /// Best-effort rollback. Its own failure is logged and never replaces
    /// the statement's error.
    fn rollback_quietly(&self, session: &mut Session, implicit: bool) {
        if !session.in_transaction() {
            return;
        }
        match self.txn.rollback(session) {
            Ok(()) => sluice_observability::record_txn_metrics("rollback", implicit),
            Err(rb) => {
                sluice_observability::record_txn_metrics("rollback_failed", implicit);
                tracing::warn!(session_id = session.id, error = %rb, "rollback after failed statement also failed");
            }
        }
        session.txn = None;
    }

    fn run_on_cursor(
        &self,
        session: &mut Session,
        plan: &Plan,
        bind_vars: &BindVars,
        opts: &ExecuteOptions,
        cancel: &CancelToken,
    ) -> SluiceResult<QueryResult> {
        let vc = ExecutionCursor::new(
            session,
            self.resolver.as_ref(),
            &self.scatter,
            cancel.clone(),
            &self.config.execution,
        )
        .with_ignore_max_memory_rows(opts.ignore_max_memory_rows);
        plan.root.execute(&vc, bind_vars)
    }

    fn after_statement(&self, session: &mut Session, plan: &Plan, result: &QueryResult) {
        match plan.kind {
            StatementKind::Select => {
                session.row_count = -1;
                session.found_rows = result.rows.len() as u64;
            }
            k if k.is_dml() => {
                session.row_count = i64::try_from(result.rows_affected).unwrap_or(i64::MAX);
            }
            StatementKind::Ddl => {
                session.row_count = 0;
                self.plan_cache.clear();
            }
            _ => {}
        }
    }
}
