//! Support module for `WaitGroup` and `WaitGuard`.
//!
//! See the documentation of the [`WaitGroup`] struct for more information.
//!
//! [`WaitGroup`]: struct.WaitGroup.html

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::signal::Signal;
use crate::util;

/// A counting barrier that lets threads wait until a group of tasks has finished.
///
/// A `WaitGroup` keeps a counter that tasks raise with `add` before they start and lower with
/// `done` when they finish; `wait` blocks until the counter is back at zero. Unlike a
/// `CountDownLatch`, a `WaitGroup` can be reused: raising the counter from zero starts a new
/// "round", and only `wait` calls made during that round are held up by it. Threads that were
/// already released by the previous round stay released.
///
/// The usual caveat for reusable barriers applies: if one thread is raising the counter from zero
/// while another is still in the middle of noticing that it reached zero, the second one may see
/// either round.
///
/// The counter going below zero is a bug in the caller, and `add` panics when it happens.
///
/// # Example
///
/// ```
/// use afteryou::WaitGroup;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::thread;
///
/// let group = Arc::new(WaitGroup::new());
/// let finished = Arc::new(AtomicUsize::new(0));
///
/// for _ in 0..5 {
///     group.add(1);
///     let group = group.clone();
///     let finished = finished.clone();
///     thread::spawn(move || {
///         finished.fetch_add(1, Ordering::SeqCst);
///         group.done();
///     });
/// }
///
/// group.wait();
/// assert_eq!(finished.load(Ordering::SeqCst), 5);
/// ```
#[derive(Debug)]
pub struct WaitGroup {
    state: Mutex<GroupState>,
}

#[derive(Debug)]
struct GroupState {
    counter: isize,
    // fired whenever `counter` is zero; swapped for a fresh one on every 0 -> positive move
    done: Arc<Signal>,
}

impl WaitGroup {
    /// Creates a new `WaitGroup` with its counter at zero.
    pub fn new() -> WaitGroup {
        WaitGroup {
            state: Mutex::new(GroupState {
                counter: 0,
                done: Arc::new(Signal::fired()),
            }),
        }
    }

    /// Returns the current counter value.
    pub fn count(&self) -> isize {
        util::guts(self.state.lock()).counter
    }

    /// Adds `delta` (which may be negative) to the counter.
    ///
    /// If the counter moves from zero to a positive value, a new round begins and later calls to
    /// `wait` block until it gets back to zero. If the counter reaches zero, every thread blocked
    /// in `wait` is released.
    ///
    /// # Panics
    ///
    /// Panics if the counter would go below zero or overflow. The counter is left untouched in
    /// either case.
    pub fn add(&self, delta: isize) {
        let mut state = util::guts(self.state.lock());

        // let go of the lock before panicking so it doesn't get poisoned
        let counter = match state.counter.checked_add(delta) {
            Some(counter) if counter >= 0 => counter,
            Some(_) => {
                drop(state);
                panic!("negative WaitGroup counter");
            }
            None => {
                drop(state);
                panic!("WaitGroup counter overflow");
            }
        };

        if state.counter == 0 && delta > 0 {
            state.done = Arc::new(Signal::new());
        }

        state.counter = counter;

        if counter == 0 {
            let done = state.done.clone();
            drop(state);
            done.fire();
        }
    }

    /// Subtracts one from the counter.
    ///
    /// # Panics
    ///
    /// See [`add`] for the situation where this function will panic.
    ///
    /// [`add`]: #method.add
    pub fn done(&self) {
        self.add(-1);
    }

    /// Adds one to the counter, then returns a guard object that calls `done` when dropped.
    ///
    /// # Example
    ///
    /// ```
    /// use afteryou::WaitGroup;
    /// use std::sync::Arc;
    /// use std::thread;
    ///
    /// let group = Arc::new(WaitGroup::new());
    /// let worker = group.clone();
    ///
    /// let handle = thread::spawn(move || {
    ///     let _guard = worker.guard();
    ///     // do some work; `done` happens when `_guard` goes out of scope
    /// });
    ///
    /// handle.join().unwrap();
    /// group.wait();
    /// assert_eq!(group.count(), 0);
    /// ```
    pub fn guard(&self) -> WaitGuard<'_> {
        WaitGuard::new(self)
    }

    /// Blocks the current thread until the counter reaches zero.
    ///
    /// This returns immediately if the counter is already at zero.
    pub fn wait(&self) {
        self.current().wait();
    }

    /// Blocks the current thread until the counter reaches zero or the timeout elapses, returning
    /// whether the counter reached zero.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.current().wait_deadline(util::deadline_after(timeout))
    }

    fn current(&self) -> Arc<Signal> {
        util::guts(self.state.lock()).done.clone()
    }
}

impl Default for WaitGroup {
    fn default() -> WaitGroup {
        WaitGroup::new()
    }
}

/// An opaque guard struct that calls `done` on a borrowed `WaitGroup` when dropped.
///
/// See [`WaitGroup::guard`] for more information about this struct.
///
/// [`WaitGroup::guard`]: struct.WaitGroup.html#method.guard
#[derive(Debug)]
#[must_use = "the group is marked done as soon as the guard is dropped"]
pub struct WaitGuard<'a> {
    group: &'a WaitGroup,
}

impl<'a> WaitGuard<'a> {
    fn new(group: &'a WaitGroup) -> WaitGuard<'a> {
        group.add(1);
        WaitGuard { group }
    }
}

impl<'a> Drop for WaitGuard<'a> {
    fn drop(&mut self) {
        self.group.done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn wait_at_zero_returns_immediately() {
        init_test_logging();
        let group = WaitGroup::new();
        group.wait();
        assert!(group.wait_timeout(Duration::from_millis(0)));
    }

    #[test]
    fn add_then_done_releases_wait() {
        init_test_logging();
        let group = Arc::new(WaitGroup::new());
        group.add(1);
        assert!(!group.wait_timeout(Duration::from_millis(20)));

        let released = Arc::new(AtomicBool::new(false));
        let handle = {
            let group = group.clone();
            let released = released.clone();
            thread::spawn(move || {
                group.wait();
                released.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!released.load(Ordering::SeqCst));

        group.done();
        handle.join().unwrap();
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(group.count(), 0);
    }

    #[test]
    fn rearming_starts_a_new_round() {
        init_test_logging();
        let group = WaitGroup::new();
        group.add(2);
        group.add(-2);
        group.wait();

        group.add(1);
        assert!(!group.wait_timeout(Duration::from_millis(10)));
        group.done();
        assert!(group.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn old_round_stays_released() {
        init_test_logging();
        let group = WaitGroup::new();
        group.add(1);
        let first_round = group.current();
        group.done();
        group.add(1);

        assert!(first_round.is_fired());
        assert!(!group.current().is_fired());
        group.done();
    }

    #[test]
    fn guard_calls_done_on_drop() {
        init_test_logging();
        let group = WaitGroup::new();
        {
            let _a = group.guard();
            let _b = group.guard();
            assert_eq!(group.count(), 2);
        }
        assert_eq!(group.count(), 0);
        group.wait();
    }

    #[test]
    #[should_panic(expected = "negative WaitGroup counter")]
    fn too_many_done_calls_panic() {
        init_test_logging();
        let group = WaitGroup::new();
        group.add(1);
        group.done();
        group.done();
    }

    #[test]
    fn overflowing_add_panics_with_its_own_message() {
        init_test_logging();
        let group = Arc::new(WaitGroup::new());
        group.add(1);

        let result = {
            let group = group.clone();
            thread::spawn(move || group.add(isize::MAX)).join()
        };
        let message = result
            .err()
            .and_then(|payload| payload.downcast_ref::<&str>().map(|s| s.to_string()))
            .unwrap();
        assert_eq!(message, "WaitGroup counter overflow");
        assert_eq!(group.count(), 1);
        group.done();
    }

    #[test]
    fn failed_add_leaves_counter_alone() {
        init_test_logging();
        let group = Arc::new(WaitGroup::new());
        group.add(1);

        let result = {
            let group = group.clone();
            thread::spawn(move || group.add(-2)).join()
        };
        assert!(result.is_err());
        assert_eq!(group.count(), 1);
        group.done();
    }
}
