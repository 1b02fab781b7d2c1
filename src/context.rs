//! Query Context
//!
//! One context object threaded through planner and executor: cooperative
//! cancellation (explicit cancel or deadline), the annotation bus, and the
//! effective options. Matchers check the cancel token between pages of the
//! underlying KV iterator; the worker pool checks it between rows.

use crate::annotations::AnnotationBus;
use crate::config::QueryOptions;
use crate::error::{QueryError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative cancellation token.
///
/// Shared across threads; the worker pool uses it to abort remaining work
/// when any worker errors.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    started: Instant,
    deadline: Option<Duration>,
}

impl CancelToken {
    pub fn new(timeout: Option<Duration>) -> Self {
        CancelToken {
            cancelled: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
            deadline: timeout,
        }
    }

    pub fn infinite() -> Self {
        CancelToken::new(None)
    }

    /// Ok to continue, or `Cancelled` if the token fired or the deadline
    /// passed.
    pub fn check(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(self.cancelled_error());
        }
        if let Some(deadline) = self.deadline {
            if self.started.elapsed() > deadline {
                self.cancelled.store(true, Ordering::Relaxed);
                return Err(self.cancelled_error());
            }
        }
        Ok(())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn cancelled_error(&self) -> QueryError {
        QueryError::Cancelled {
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::infinite()
    }
}

/// Everything a pipeline stage needs besides its data: options, the
/// cancellation token, and the annotation bus. Cheap to clone.
#[derive(Clone)]
pub struct QueryContext {
    pub options: Arc<QueryOptions>,
    pub cancel: CancelToken,
    pub annotations: AnnotationBus,
}

impl QueryContext {
    pub fn new(options: QueryOptions) -> Self {
        QueryContext {
            options: Arc::new(options),
            cancel: CancelToken::infinite(),
            annotations: AnnotationBus::disabled(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.cancel = CancelToken::new(Some(timeout));
        self
    }

    pub fn with_annotations(mut self, bus: AnnotationBus) -> Self {
        self.annotations = bus;
        self
    }

    /// Shorthand for the frequent cancellation check.
    pub fn check_cancelled(&self) -> Result<()> {
        self.cancel.check()
    }
}

impl Default for QueryContext {
    fn default() -> Self {
        QueryContext::new(QueryOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_cancel() {
        let token = CancelToken::infinite();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(matches!(token.check(), Err(QueryError::Cancelled { .. })));
    }

    #[test]
    fn test_deadline_fires() {
        let token = CancelToken::new(Some(Duration::ZERO));
        std::thread::sleep(Duration::from_millis(2));
        assert!(token.check().is_err());
        // A fired deadline latches.
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_clone_shares_flag() {
        let a = CancelToken::infinite();
        let b = a.clone();
        a.cancel();
        assert!(b.is_cancelled());
    }
}
