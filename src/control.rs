//! Deadlines and cancellation shared by the pipeline stages.
//!
//! Both types are cheap to copy or clone and are passed explicitly into the
//! operations that honour them; there is no process-wide build state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// A point in time after which an operation must give up
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
    budget: Option<Duration>,
}

impl Deadline {
    /// A deadline that never expires
    pub fn none() -> Self {
        Self {
            at: None,
            budget: None,
        }
    }

    /// A deadline `timeout` from now, or none
    pub fn after(timeout: Option<Duration>) -> Self {
        match timeout {
            Some(budget) => Self {
                at: Some(Instant::now() + budget),
                budget: Some(budget),
            },
            None => Self::none(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left before expiry; `None` means unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Fail with [`Error::Timeout`] if the deadline has passed
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.is_expired() {
            return Err(self.timeout_error(operation));
        }
        Ok(())
    }

    pub fn timeout_error(&self, operation: &str) -> Error {
        Error::Timeout {
            operation: operation.to_string(),
            seconds: self.budget.map(|b| b.as_secs()).unwrap_or_default(),
        }
    }
}

/// Cooperative cancellation flag checked between stages and layers
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Fail with [`Error::Cancelled`] if cancellation was requested
    pub fn check(&self, stage: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled {
                stage: stage.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_none_never_expires() {
        let deadline = Deadline::none();
        assert!(!deadline.is_expired());
        assert!(deadline.remaining().is_none());
        assert!(deadline.check("anything").is_ok());
    }

    #[test]
    fn test_deadline_zero_expires_immediately() {
        let deadline = Deadline::after(Some(Duration::ZERO));
        assert!(deadline.is_expired());
        let err = deadline.check("fetch core").unwrap_err();
        assert!(matches!(err, Error::Timeout { ref operation, .. } if operation == "fetch core"));
    }

    #[test]
    fn test_deadline_long_budget() {
        let deadline = Deadline::after(Some(Duration::from_secs(3600)));
        assert!(!deadline.is_expired());
        assert!(deadline.remaining().unwrap() > Duration::from_secs(3000));
    }

    #[test]
    fn test_cancel_token_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(token.check("patch").is_ok());
        other.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(
            token.check("patch"),
            Err(Error::Cancelled { ref stage }) if stage == "patch"
        ));
    }
}
