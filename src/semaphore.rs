//! Counting permits, the primitive behind `RWMutex` and the lock half of the subscription queues.

use std::sync::{Condvar, Mutex};

use crate::cond::Locker;
use crate::util;

/// A counting semaphore with a fixed number of permits.
///
/// A permit is taken with `acquire` (blocking while none are left) and handed back with
/// `release`. Permits are not tied to the thread that took them, so one thread may acquire and
/// another release, the same way a buffered channel of tokens behaves.
///
/// A `Semaphore` with a capacity of one is a plain exclusive lock, which is why it implements
/// [`Locker`] and can back a [`Cond`].
///
/// [`Locker`]: trait.Locker.html
/// [`Cond`]: struct.Cond.html
///
/// # Example
///
/// ```
/// use afteryou::Semaphore;
/// use std::sync::Arc;
/// use std::thread;
///
/// let slots = Arc::new(Semaphore::new(2));
///
/// let handles: Vec<_> = (0..4).map(|_| {
///     let slots = slots.clone();
///     thread::spawn(move || {
///         slots.acquire();
///         // at most two threads are in here at once
///         slots.release();
///     })
/// }).collect();
///
/// for handle in handles {
///     handle.join().unwrap();
/// }
/// assert_eq!(slots.available(), 2);
/// ```
#[derive(Debug)]
pub struct Semaphore {
    capacity: usize,
    permits: Mutex<usize>,
    freed: Condvar,
}

impl Semaphore {
    /// Creates a new `Semaphore` with `capacity` permits, all of them available.
    pub fn new(capacity: usize) -> Semaphore {
        Semaphore {
            capacity,
            permits: Mutex::new(capacity),
            freed: Condvar::new(),
        }
    }

    /// Returns the total number of permits this semaphore was created with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of permits not currently held.
    pub fn available(&self) -> usize {
        *util::guts(self.permits.lock())
    }

    /// Takes one permit, blocking until one is available.
    pub fn acquire(&self) {
        let mut permits = util::guts(self.permits.lock());

        while *permits == 0 {
            permits = util::guts(self.freed.wait(permits));
        }

        *permits -= 1;
    }

    /// Takes one permit if one is available right now, returning whether it did.
    pub fn try_acquire(&self) -> bool {
        let mut permits = util::guts(self.permits.lock());

        if *permits == 0 {
            false
        } else {
            *permits -= 1;
            true
        }
    }

    /// Hands one permit back, waking a thread blocked in `acquire` if there is one.
    ///
    /// # Panics
    ///
    /// Releasing a permit that was never acquired is a bug in the caller, and panics once every
    /// permit is already back.
    pub fn release(&self) {
        let mut permits = util::guts(self.permits.lock());

        if *permits == self.capacity {
            drop(permits);
            panic!("semaphore released more permits than its capacity");
        }

        *permits += 1;
        self.freed.notify_one();
    }
}

impl Locker for Semaphore {
    fn lock(&self) {
        self.acquire();
    }

    fn unlock(&self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn try_acquire_respects_capacity() {
        init_test_logging();
        let sem = Semaphore::new(2);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        assert_eq!(sem.available(), 0);

        sem.release();
        assert_eq!(sem.available(), 1);
        assert_eq!(sem.capacity(), 2);
    }

    #[test]
    fn acquire_blocks_until_release() {
        init_test_logging();
        let sem = Arc::new(Semaphore::new(1));
        sem.acquire();

        let acquired = Arc::new(AtomicBool::new(false));
        let handle = {
            let sem = sem.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                sem.acquire();
                acquired.store(true, Ordering::SeqCst);
                sem.release();
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        sem.release();
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    #[should_panic(expected = "more permits than its capacity")]
    fn over_release_panics() {
        init_test_logging();
        let sem = Semaphore::new(1);
        sem.release();
    }
}
