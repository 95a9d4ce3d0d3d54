//! Observability setup: structured logging and metrics recording.
//!
//! Metrics go through the `metrics` facade; installing an exporter is left
//! to the embedding process.

use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,sluice=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn fmt_layer<S>() -> fmt::Layer<S> {
    fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
}

/// Initialize the global tracing subscriber with structured logging.
/// Panics if a global subscriber is already set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer())
        .init();
}

/// As [`init_tracing`], but returns `false` instead of panicking when a
/// subscriber is already installed (tests, embedding hosts).
pub fn try_init_tracing() -> bool {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer())
        .try_init()
        .is_ok()
}

/// One top-level statement finished.
pub fn record_query_metrics(duration_us: u64, statement_kind: &str, success: bool) {
    metrics::counter!(
        "sluice_queries_total",
        "kind" => statement_kind.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
    metrics::histogram!("sluice_query_duration_us", "kind" => statement_kind.to_string())
        .record(duration_us as f64);
}

pub fn record_plan_cache_lookup(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    metrics::counter!("sluice_plan_cache_lookups_total", "outcome" => outcome).increment(1);
}

pub fn record_plan_cache_size(entries: usize) {
    metrics::gauge!("sluice_plan_cache_entries").set(entries as f64);
}

/// `role` is `leader` or `follower`.
pub fn record_consolidator_outcome(role: &str) {
    metrics::counter!("sluice_consolidator_total", "role" => role.to_string()).increment(1);
}

/// `action` is `begin`, `commit` or `rollback`; `implicit` marks
/// autocommit brackets opened by the router itself.
pub fn record_txn_metrics(action: &str, implicit: bool) {
    metrics::counter!(
        "sluice_txn_total",
        "action" => action.to_string(),
        "implicit" => implicit.to_string()
    )
    .increment(1);
}

pub fn record_shard_fanout(shards: usize) {
    metrics::histogram!("sluice_shard_fanout").record(shards as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_init_is_idempotent() {
        let _ = try_init_tracing();
        assert!(!try_init_tracing());
    }

    #[test]
    fn test_recording_without_exporter_is_noop() {
        record_query_metrics(120, "select", true);
        record_plan_cache_lookup(false);
        record_plan_cache_size(3);
        record_consolidator_outcome("leader");
        record_txn_metrics("commit", true);
        record_shard_fanout(4);
    }
}
