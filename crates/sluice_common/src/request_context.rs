//! Per-statement context for tracing.
//!
//! Every statement handed to the executor carries a `RequestContext` that
//! propagates through plan lookup, dispatch and commit so log lines and
//! errors can be correlated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static GLOBAL_REQUEST_ID: AtomicU64 = AtomicU64::new(1);
static GLOBAL_SESSION_ID: AtomicU64 = AtomicU64::new(1);
static GLOBAL_QUERY_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_request_id() -> u64 {
    GLOBAL_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

pub fn next_session_id() -> u64 {
    GLOBAL_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

pub fn next_query_id() -> u64 {
    GLOBAL_QUERY_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique per top-level call (monotonic).
    pub request_id: u64,
    /// Owning session.
    pub session_id: u64,
    /// Unique per statement; a batch call gets one per statement.
    pub query_id: u64,
    pub started_at: Instant,
}

impl RequestContext {
    pub fn new(session_id: u64) -> Self {
        Self {
            request_id: next_request_id(),
            session_id,
            query_id: next_query_id(),
            started_at: Instant::now(),
        }
    }

    /// Create with explicit IDs (for testing).
    pub fn with_ids(request_id: u64, session_id: u64, query_id: u64) -> Self {
        Self {
            request_id,
            session_id,
            query_id,
            started_at: Instant::now(),
        }
    }

    /// Same request, next statement.
    pub fn next_query(&self) -> Self {
        Self {
            request_id: self.request_id,
            session_id: self.session_id,
            query_id: next_query_id(),
            started_at: Instant::now(),
        }
    }

    pub fn elapsed_us(&self) -> u64 {
        self.started_at.elapsed().as_micros() as u64
    }

    pub fn as_context_str(&self) -> String {
        format!(
            "request_id={}, session_id={}, query_id={}",
            self.request_id, self.session_id, self.query_id
        )
    }
}
