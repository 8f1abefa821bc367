//! Cooperative cancellation for the operations that accept one.
//!
//! `KeyLock::lock_keys` and `Call::run` can block for an unbounded amount of time, so both take a
//! [`CancelToken`] that lets the caller give up early. See the documentation on that type for more
//! information.
//!
//! [`CancelToken`]: struct.CancelToken.html

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::signal::Signal;
use crate::util;

/// The reason a cancellable operation gave up.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CancelError {
    /// Returned when the token's `cancel` method was called.
    #[error("operation canceled")]
    Canceled,
    /// Returned when the token's deadline passed before the operation finished.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// A cloneable handle that signals "stop waiting" to whoever is holding a copy.
///
/// Cancelling any clone of a token cancels all of them. A token can also carry a deadline, after
/// which it counts as cancelled without anyone calling `cancel`. Cancellation is cooperative: the
/// primitives in this crate check the token while they wait, and code handed a token (such as the
/// callback given to `Call::run`) is expected to check it on its own.
///
/// # Example
///
/// ```
/// use afteryou::{CancelError, CancelToken};
/// use std::thread;
/// use std::time::Duration;
///
/// let token = CancelToken::new();
/// let worker = token.clone();
///
/// let handle = thread::spawn(move || {
///     while worker.check().is_ok() {
///         thread::sleep(Duration::from_millis(5));
///     }
///     worker.check()
/// });
///
/// token.cancel();
/// assert_eq!(handle.join().unwrap(), Err(CancelError::Canceled));
/// ```
#[derive(Debug, Clone)]
pub struct CancelToken {
    signal: Arc<Signal>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// Creates a new token that is only cancelled by calling `cancel`.
    pub fn new() -> CancelToken {
        CancelToken {
            signal: Arc::new(Signal::new()),
            deadline: None,
        }
    }

    /// Creates a new token that cancels itself once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> CancelToken {
        CancelToken {
            signal: Arc::new(Signal::new()),
            deadline: util::deadline_after(timeout),
        }
    }

    /// Creates a new token that cancels itself at the given instant.
    pub fn with_deadline(deadline: Instant) -> CancelToken {
        CancelToken {
            signal: Arc::new(Signal::new()),
            deadline: Some(deadline),
        }
    }

    /// Cancels this token and every clone of it, waking anything currently waiting on it.
    pub fn cancel(&self) {
        self.signal.fire();
    }

    /// Returns whether this token has been cancelled or has passed its deadline.
    pub fn is_canceled(&self) -> bool {
        self.check().is_err()
    }

    /// Returns `Ok(())` if the token is still live, or the reason it is not.
    ///
    /// An explicit `cancel` takes precedence over an expired deadline.
    pub fn check(&self) -> Result<(), CancelError> {
        if self.signal.is_fired() {
            return Err(CancelError::Canceled);
        }

        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(CancelError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Returns the deadline this token was created with, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Blocks the current thread until this token is cancelled, and returns why.
    ///
    /// A token with no deadline that nobody cancels will block forever.
    pub fn wait(&self) -> CancelError {
        if self.signal.wait_deadline(self.deadline) {
            CancelError::Canceled
        } else {
            CancelError::DeadlineExceeded
        }
    }

    pub(crate) fn signal(&self) -> &Signal {
        &self.signal
    }
}

impl Default for CancelToken {
    fn default() -> CancelToken {
        CancelToken::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::thread;

    #[test]
    fn fresh_token_is_live() {
        init_test_logging();
        let token = CancelToken::new();
        assert!(!token.is_canceled());
        assert_eq!(token.check(), Ok(()));
        assert_eq!(token.deadline(), None);
    }

    #[test]
    fn cancel_reaches_every_clone() {
        init_test_logging();
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert_eq!(token.check(), Err(CancelError::Canceled));
        assert_eq!(token.wait(), CancelError::Canceled);
    }

    #[test]
    fn deadline_expires_on_its_own() {
        init_test_logging();
        let token = CancelToken::with_timeout(Duration::from_millis(20));
        assert_eq!(token.wait(), CancelError::DeadlineExceeded);
        assert_eq!(token.check(), Err(CancelError::DeadlineExceeded));
    }

    #[test]
    fn explicit_cancel_wins_over_deadline() {
        init_test_logging();
        let token = CancelToken::with_deadline(Instant::now());
        token.cancel();
        assert_eq!(token.check(), Err(CancelError::Canceled));
    }

    #[test]
    fn wait_wakes_on_cancel_from_another_thread() {
        init_test_logging();
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || remote.wait());

        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert_eq!(handle.join().unwrap(), CancelError::Canceled);
    }
}
