//! Support module for `KeyLock` and `KeyGuard`.
//!
//! See the documentation of the [`KeyLock`] struct for more information.
//!
//! [`KeyLock`]: struct.KeyLock.html

use std::collections::HashSet;
use std::mem;
use std::sync::{Arc, Mutex};

use crate::cancel::{CancelError, CancelToken};
use crate::signal::{self, Signal};
use crate::util;

/// Mutual exclusion over arbitrary sets of string keys.
///
/// A thread locks a whole set of keys at once with `lock_keys`. Two callers whose key sets are
/// disjoint can hold their locks at the same time; two callers that share even one key are
/// serialized. A caller either gets every key it asked for or none of them, so there is no way to
/// deadlock by holding some keys while waiting on others.
///
/// Waiting works by broadcast-and-recheck: every unlock wakes every waiting caller, and each of
/// them goes back to check whether its own keys are free yet. There is no queue, and so no
/// fairness. Under heavy contention a caller can keep losing the race to others and wait for an
/// arbitrarily long time.
///
/// # Example
///
/// ```
/// use afteryou::{CancelToken, KeyLock};
///
/// let keys = KeyLock::new();
/// let never = CancelToken::new();
///
/// let a = keys.lock_keys(vec!["alice", "bob"], &never).unwrap();
/// // "carol" is free, so this doesn't block
/// let b = keys.lock_keys(vec!["carol"], &never).unwrap();
/// // "bob" is taken
/// assert!(keys.try_lock_keys(vec!["bob", "dave"]).is_none());
///
/// drop(a);
/// assert!(keys.try_lock_keys(vec!["bob", "dave"]).is_some());
/// # drop(b);
/// ```
#[derive(Debug)]
pub struct KeyLock {
    state: Mutex<LockState>,
}

#[derive(Debug)]
struct LockState {
    locked: HashSet<String>,
    // fired and replaced on every unlock
    update: Arc<Signal>,
}

impl KeyLock {
    /// Creates a new `KeyLock` with no keys locked.
    pub fn new() -> KeyLock {
        KeyLock {
            state: Mutex::new(LockState {
                locked: HashSet::new(),
                update: Arc::new(Signal::new()),
            }),
        }
    }

    /// Locks every key in `keys`, blocking until none of them is held by anyone else. Returns a
    /// guard that unlocks the keys when dropped.
    ///
    /// The cancellation token is only consulted while waiting: if the keys are free right away the
    /// lock succeeds even with a cancelled token.
    ///
    /// # Errors
    ///
    /// If `cancel` is cancelled (or passes its deadline) while this call is waiting, it returns
    /// the reason without having locked any of the keys.
    pub fn lock_keys<I, S>(
        &self,
        keys: I,
        cancel: &CancelToken,
    ) -> Result<KeyGuard<'_>, CancelError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys = canonical(keys);

        loop {
            let update = {
                let mut state = util::guts(self.state.lock());

                if !state.conflicts(&keys) {
                    state.locked.extend(keys.iter().cloned());
                    return Ok(KeyGuard { lock: self, keys });
                }

                state.update.clone()
            };

            tracing::trace!(keys = ?keys, "keys busy, waiting for an unlock");

            // index 0 is the unlock broadcast, index 1 is the caller giving up
            match signal::wait_any(&[&*update, cancel.signal()], cancel.deadline()) {
                Some(0) => continue,
                Some(_) => return Err(CancelError::Canceled),
                None => return Err(CancelError::DeadlineExceeded),
            }
        }
    }

    /// Locks every key in `keys` if none of them is currently held, without blocking.
    pub fn try_lock_keys<I, S>(&self, keys: I) -> Option<KeyGuard<'_>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys = canonical(keys);
        let mut state = util::guts(self.state.lock());

        if state.conflicts(&keys) {
            None
        } else {
            state.locked.extend(keys.iter().cloned());
            Some(KeyGuard { lock: self, keys })
        }
    }

    /// Returns whether `key` is currently locked by anyone.
    pub fn is_locked(&self, key: &str) -> bool {
        util::guts(self.state.lock()).locked.contains(key)
    }

    fn unlock(&self, keys: &[String]) {
        let update = {
            let mut state = util::guts(self.state.lock());
            for key in keys {
                state.locked.remove(key);
            }
            mem::replace(&mut state.update, Arc::new(Signal::new()))
        };

        update.fire();
    }
}

impl Default for KeyLock {
    fn default() -> KeyLock {
        KeyLock::new()
    }
}

impl LockState {
    fn conflicts(&self, keys: &[String]) -> bool {
        keys.iter().any(|key| self.locked.contains(key))
    }
}

// Sorted so that every caller walks overlapping key sets in the same order, and deduplicated so a
// repeated key doesn't count as a conflict with itself.
fn canonical<I, S>(keys: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut keys: Vec<String> = keys.into_iter().map(Into::into).collect();
    keys.sort();
    keys.dedup();
    keys
}

/// Guard struct representing a held set of keys in a `KeyLock`. The keys are unlocked when this
/// is dropped, or when `unlock` is called.
#[derive(Debug)]
#[must_use = "the keys are unlocked as soon as the guard is dropped"]
pub struct KeyGuard<'a> {
    lock: &'a KeyLock,
    keys: Vec<String>,
}

impl<'a> KeyGuard<'a> {
    /// Returns the keys held by this guard, sorted and without duplicates.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Unlocks the keys now. This is the same as dropping the guard.
    pub fn unlock(self) {}
}

impl<'a> Drop for KeyGuard<'a> {
    fn drop(&mut self) {
        self.lock.unlock(&self.keys);
    }
}
