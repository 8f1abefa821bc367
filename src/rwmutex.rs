//! Support module for `RWMutex` and its guards.
//!
//! See the documentation of the [`RWMutex`] struct for more information.
//!
//! [`RWMutex`]: struct.RWMutex.html

use crate::cond::Locker;
use crate::semaphore::Semaphore;

/// The number of concurrent readers an `RWMutex` allows when created with `RWMutex::new`.
pub const DEFAULT_MAX_READERS: usize = 16;

/// A reader/writer lock assembled from a pool of permits.
///
/// An `RWMutex` holds one writer permit and a fixed number of reader permits:
///
/// * A reader takes one reader permit, so at most `max_readers` readers can hold the lock at once.
///   Any further reader blocks until one of them lets go. This is a real capacity limit, not just
///   writer exclusion.
/// * A writer takes the writer permit and then *every* reader permit, one at a time. That makes it
///   wait for the readers already inside to leave and keeps new ones from starting, after which it
///   has the lock to itself.
/// * Unlocking a write hands back all the reader permits before the writer permit, so a second
///   writer queued on the writer permit can't start collecting reader permits while the first one
///   is still returning them.
///
/// There is no fairness beyond that. A steady enough stream of readers can hold off a writer
/// that is collecting permits.
///
/// An `RWMutex` doesn't own the data it protects; access is represented by the [`ReadGuard`] and
/// [`WriteGuard`] structs, which release the lock on drop.
///
/// [`ReadGuard`]: struct.ReadGuard.html
/// [`WriteGuard`]: struct.WriteGuard.html
///
/// # Example
///
/// ```
/// use afteryou::RWMutex;
///
/// let lock = RWMutex::with_max_readers(2);
///
/// {
///     let _a = lock.read();
///     let _b = lock.read();
///     // both reader slots are taken
///     assert!(lock.try_read().is_none());
///     assert!(lock.try_write().is_none());
/// }
///
/// let _w = lock.write();
/// assert!(lock.try_read().is_none());
/// ```
#[derive(Debug)]
pub struct RWMutex {
    writer: Semaphore,
    readers: Semaphore,
}

/// Guard struct representing one reader's hold on an `RWMutex`. The reader permit is returned
/// when this is dropped.
#[derive(Debug)]
#[must_use = "the read lock is released as soon as the guard is dropped"]
pub struct ReadGuard<'a> {
    lock: &'a RWMutex,
}

/// Guard struct representing a writer's exclusive hold on an `RWMutex`. Every permit is returned
/// when this is dropped.
#[derive(Debug)]
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct WriteGuard<'a> {
    lock: &'a RWMutex,
}

impl RWMutex {
    /// Creates a new `RWMutex` that allows [`DEFAULT_MAX_READERS`] concurrent readers.
    ///
    /// [`DEFAULT_MAX_READERS`]: constant.DEFAULT_MAX_READERS.html
    pub fn new() -> RWMutex {
        RWMutex::with_max_readers(DEFAULT_MAX_READERS)
    }

    /// Creates a new `RWMutex` that allows `max_readers` concurrent readers.
    ///
    /// # Panics
    ///
    /// Panics if `max_readers` is zero, since nobody could ever read.
    pub fn with_max_readers(max_readers: usize) -> RWMutex {
        assert!(max_readers > 0, "RWMutex requires at least one reader permit");

        RWMutex {
            writer: Semaphore::new(1),
            readers: Semaphore::new(max_readers),
        }
    }

    /// Returns the number of readers that can hold this lock at once.
    pub fn max_readers(&self) -> usize {
        self.readers.capacity()
    }

    /// Takes a read lock, blocking while a writer holds the lock or every reader permit is taken.
    pub fn read(&self) -> ReadGuard<'_> {
        self.readers.acquire();
        ReadGuard { lock: self }
    }

    /// Takes a read lock if a reader permit is free right now.
    pub fn try_read(&self) -> Option<ReadGuard<'_>> {
        if self.readers.try_acquire() {
            Some(ReadGuard { lock: self })
        } else {
            None
        }
    }

    /// Takes the write lock, blocking until every reader and any other writer has let go.
    pub fn write(&self) -> WriteGuard<'_> {
        self.lock_exclusive();
        WriteGuard { lock: self }
    }

    /// Takes the write lock if nobody holds any part of the lock right now.
    ///
    /// If some reader permits are free but not all of them, the ones taken along the way are handed
    /// back before this returns `None`.
    pub fn try_write(&self) -> Option<WriteGuard<'_>> {
        if !self.writer.try_acquire() {
            return None;
        }

        let max = self.max_readers();
        for taken in 0..max {
            if !self.readers.try_acquire() {
                for _ in 0..taken {
                    self.readers.release();
                }
                self.writer.release();
                return None;
            }
        }

        Some(WriteGuard { lock: self })
    }

    fn lock_exclusive(&self) {
        self.writer.acquire();

        for _ in 0..self.max_readers() {
            self.readers.acquire();
        }
    }

    fn unlock_exclusive(&self) {
        for _ in 0..self.max_readers() {
            self.readers.release();
        }

        self.writer.release();
    }
}

impl Default for RWMutex {
    fn default() -> RWMutex {
        RWMutex::new()
    }
}

/// Using an `RWMutex` as a `Locker` takes and releases the write lock.
impl Locker for RWMutex {
    fn lock(&self) {
        self.lock_exclusive();
    }

    fn unlock(&self) {
        self.unlock_exclusive();
    }
}

impl<'a> Drop for ReadGuard<'a> {
    fn drop(&mut self) {
        self.lock.readers.release();
    }
}

impl<'a> Drop for WriteGuard<'a> {
    fn drop(&mut self) {
        self.lock.unlock_exclusive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn readers_share_writers_exclude() {
        init_test_logging();
        let lock = Arc::new(RWMutex::new());
        let readers = Arc::new(AtomicUsize::new(0));
        let writers = Arc::new(AtomicUsize::new(0));
        let violated = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let lock = lock.clone();
                let readers = readers.clone();
                let writers = writers.clone();
                let violated = violated.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        if i % 4 == 0 {
                            let _guard = lock.write();
                            let w = writers.fetch_add(1, Ordering::SeqCst);
                            if w != 0 || readers.load(Ordering::SeqCst) != 0 {
                                violated.store(true, Ordering::SeqCst);
                            }
                            thread::yield_now();
                            writers.fetch_sub(1, Ordering::SeqCst);
                        } else {
                            let _guard = lock.read();
                            readers.fetch_add(1, Ordering::SeqCst);
                            if writers.load(Ordering::SeqCst) != 0 {
                                violated.store(true, Ordering::SeqCst);
                            }
                            thread::yield_now();
                            readers.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!violated.load(Ordering::SeqCst));
    }

    #[test]
    fn reader_beyond_capacity_blocks() {
        init_test_logging();
        let lock = Arc::new(RWMutex::with_max_readers(3));
        let held: Vec<_> = (0..3).map(|_| lock.read()).collect();

        let entered = Arc::new(AtomicBool::new(false));
        let handle = {
            let lock = lock.clone();
            let entered = entered.clone();
            thread::spawn(move || {
                let _guard = lock.read();
                entered.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));

        drop(held);
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn writer_waits_for_readers() {
        init_test_logging();
        let lock = Arc::new(RWMutex::new());
        let reader = lock.read();

        let wrote = Arc::new(AtomicBool::new(false));
        let handle = {
            let lock = lock.clone();
            let wrote = wrote.clone();
            thread::spawn(move || {
                let _guard = lock.write();
                wrote.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!wrote.load(Ordering::SeqCst));

        drop(reader);
        handle.join().unwrap();
        assert!(wrote.load(Ordering::SeqCst));
    }

    #[test]
    fn failed_try_write_returns_its_permits() {
        init_test_logging();
        let lock = RWMutex::with_max_readers(4);
        let reader = lock.read();

        assert!(lock.try_write().is_none());
        assert_eq!(lock.readers.available(), 3);
        assert_eq!(lock.writer.available(), 1);

        drop(reader);
        let writer = lock.try_write();
        assert!(writer.is_some());
        drop(writer);
        assert_eq!(lock.readers.available(), 4);
    }

    #[test]
    fn locker_takes_the_write_side() {
        init_test_logging();
        let lock = RWMutex::new();
        Locker::lock(&lock);
        assert!(lock.try_read().is_none());
        Locker::unlock(&lock);
        assert!(lock.try_read().is_some());
    }

    #[test]
    #[should_panic(expected = "at least one reader permit")]
    fn zero_readers_is_rejected() {
        let _ = RWMutex::with_max_readers(0);
    }
}
