//! Cooperative cancellation for statements.
//!
//! A `CancelToken` is checked at request entry, before any blocking wait, and
//! inside polling loops. Clones share the cancelled flag; each clone carries
//! its own optional deadline so a statement can tighten the caller's deadline
//! without affecting other statements on the same session.
//!
//! ```ignore
//! let token = CancelToken::new();
//! let stmt = token.with_timeout(Duration::from_millis(500));
//! while !shards_ready() {
//!     stmt.check()?;
//!     stmt.wait_timeout(Duration::from_millis(10));
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{SluiceError, SluiceResult};

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
    deadline: Option<Instant>,
}

struct CancelInner {
    flag: AtomicBool,
    reason: Mutex<String>,
    condvar: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                flag: AtomicBool::new(false),
                reason: Mutex::new(String::new()),
                condvar: Condvar::new(),
            }),
            deadline: None,
        }
    }

    /// A clone sharing the cancelled flag whose deadline is at most `timeout`
    /// from now. A zero timeout leaves the deadline unchanged.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        if timeout.is_zero() {
            return self.clone();
        }
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        };
        Self {
            inner: Arc::clone(&self.inner),
            deadline: Some(deadline),
        }
    }

    /// Cancel every clone of this token. Wakes all waiters immediately.
    pub fn cancel(&self, reason: impl Into<String>) {
        *self.inner.reason.lock() = reason.into();
        self.inner.flag.store(true, Ordering::SeqCst);
        let _guard = self.inner.reason.lock();
        self.inner.condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time left before the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// `Err(Cancelled)` / `Err(DeadlineExceeded)` once the statement must stop.
    pub fn check(&self) -> SluiceResult<()> {
        if self.is_cancelled() {
            let reason = self.inner.reason.lock().clone();
            return Err(SluiceError::Cancelled(if reason.is_empty() {
                "statement cancelled".into()
            } else {
                reason
            }));
        }
        if self.is_expired() {
            return Err(SluiceError::DeadlineExceeded(
                "statement deadline elapsed".into(),
            ));
        }
        Ok(())
    }

    /// Sleep for at most `duration` (clamped to the deadline), waking early on
    /// `cancel()`. Returns `true` if the caller should stop.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        if self.is_cancelled() || self.is_expired() {
            return true;
        }
        let wait = match self.remaining() {
            Some(left) => duration.min(left),
            None => duration,
        };
        let mut guard = self.inner.reason.lock();
        if !self.is_cancelled() {
            let _ = self.inner.condvar.wait_for(&mut guard, wait);
        }
        drop(guard);
        self.is_cancelled() || self.is_expired()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_token_passes_check() {
        let t = CancelToken::new();
        assert!(!t.is_cancelled());
        assert!(t.check().is_ok());
        assert!(t.remaining().is_none());
    }

    #[test]
    fn test_cancel_is_shared_by_clones() {
        let t = CancelToken::new();
        let stmt = t.with_timeout(Duration::from_secs(60));
        t.cancel("client went away");
        match stmt.check() {
            Err(SluiceError::Cancelled(msg)) => assert_eq!(msg, "client went away"),
            other => panic!("expected Cancelled, got {:?}", other),
        }
    }

    #[test]
    fn test_deadline_exceeded() {
        let t = CancelToken::new().with_timeout(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(15));
        assert!(matches!(t.check(), Err(SluiceError::DeadlineExceeded(_))));
    }

    #[test]
    fn test_with_deadline_keeps_tighter_bound() {
        let t = CancelToken::new().with_timeout(Duration::from_millis(10));
        let looser = t.with_timeout(Duration::from_secs(60));
        assert_eq!(t.deadline(), looser.deadline());
    }

    #[test]
    fn test_wait_timeout_wakes_on_cancel() {
        let t = CancelToken::new();
        let t2 = t.clone();
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            let stopped = t2.wait_timeout(Duration::from_secs(10));
            (stopped, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        t.cancel("stop");
        let (stopped, elapsed) = handle.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(1), "took {:?}", elapsed);
    }

    #[test]
    fn test_wait_timeout_clamped_to_deadline() {
        let t = CancelToken::new().with_timeout(Duration::from_millis(20));
        let start = Instant::now();
        assert!(t.wait_timeout(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
