//! Cooperative cancellation for long-running operations.
//!
//! Engine clones, payload hashing, and GC runs all accept a [`Cancel`]
//! handle and poll it between units of work. Cancellation is advisory:
//! an operation past its commit point refuses the cancel and completes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{JvsError, Result};

/// A cloneable cancellation handle with an optional deadline.
///
/// The default value never cancels.
#[derive(Clone, Debug, Default)]
pub struct Cancel {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Cancel {
    /// A handle that never fires unless [`Cancel::cancel`] is called.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle that fires automatically after `timeout`.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested or the deadline has passed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail with `CANCELLED` if cancellation has been requested.
    ///
    /// # Errors
    /// Returns [`JvsError::Cancelled`] naming `operation` when cancelled.
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(JvsError::Cancelled {
                operation: operation.to_owned(),
            });
        }
        Ok(())
    }
}
