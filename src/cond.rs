//! A condition variable built on top of a caller-supplied lock.
//!
//! See the documentation on [`Cond`] and [`Locker`] for details.
//!
//! [`Cond`]: struct.Cond.html
//! [`Locker`]: trait.Locker.html

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::signal::Signal;
use crate::util;

/// An exclusive lock that can be taken and released without a guard object.
///
/// This is the capability a [`Cond`] needs from the lock it is paired with: it has to let go of the
/// lock while it sleeps and take it back before returning to the caller.
///
/// [`Cond`]: struct.Cond.html
pub trait Locker {
    /// Takes the lock, blocking until it is available.
    fn lock(&self);
    /// Releases the lock. Calling this without holding the lock is a bug in the caller.
    fn unlock(&self);
}

impl<'a, L: Locker + ?Sized> Locker for &'a L {
    fn lock(&self) {
        (**self).lock()
    }

    fn unlock(&self) {
        (**self).unlock()
    }
}

impl<L: Locker + ?Sized> Locker for Arc<L> {
    fn lock(&self) {
        (**self).lock()
    }

    fn unlock(&self) {
        (**self).unlock()
    }
}

/// A condition variable that wakes its waiters in the order they started waiting.
///
/// A `Cond` is paired with a [`Locker`] when it is created. Threads call `wait` while holding that
/// lock; `wait` releases it, sleeps until another thread calls `signal` or `broadcast`, then takes
/// the lock back before returning. Each waiter gets its own one-shot wakeup, kept in a queue behind
/// a private lock, so `signal` always wakes the earliest waiter and no waiter is woken twice.
///
/// Because a waiter is queued before it lets go of the associated lock, a `signal` sent by a thread
/// that takes that lock afterward can never slip past it.
///
/// As with any condition variable, `wait` should be called in a loop that re-checks the condition
/// being waited on.
///
/// [`Locker`]: trait.Locker.html
///
/// # Example
///
/// ```
/// use afteryou::{Cond, Locker, Semaphore};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::thread;
///
/// let cond = Arc::new(Cond::new(Semaphore::new(1)));
/// let ready = Arc::new(AtomicBool::new(false));
///
/// let waiter = {
///     let cond = cond.clone();
///     let ready = ready.clone();
///     thread::spawn(move || {
///         cond.locker().lock();
///         while !ready.load(Ordering::SeqCst) {
///             cond.wait();
///         }
///         cond.locker().unlock();
///     })
/// };
///
/// cond.locker().lock();
/// ready.store(true, Ordering::SeqCst);
/// cond.signal();
/// cond.locker().unlock();
///
/// waiter.join().unwrap();
/// ```
#[derive(Debug)]
pub struct Cond<L> {
    lock: L,
    waiters: Mutex<VecDeque<Arc<Signal>>>,
}

impl<L: Locker> Cond<L> {
    /// Creates a new `Cond` associated with the given lock.
    pub fn new(lock: L) -> Cond<L> {
        Cond {
            lock,
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Returns the lock this `Cond` is associated with.
    pub fn locker(&self) -> &L {
        &self.lock
    }

    /// Returns the number of threads currently queued in `wait`.
    pub fn waiters(&self) -> usize {
        util::guts(self.waiters.lock()).len()
    }

    /// Releases the associated lock, blocks until woken by `signal` or `broadcast`, and takes the
    /// lock again before returning.
    ///
    /// The caller must hold the associated lock.
    pub fn wait(&self) {
        let waiter = self.enqueue();

        self.lock.unlock();
        waiter.wait();
        self.lock.lock();
    }

    /// Like `wait`, but gives up after `timeout`. Returns `true` if the thread was woken by
    /// `signal` or `broadcast`, and `false` if the timeout elapsed first.
    ///
    /// Either way the associated lock is held again when this returns.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let waiter = self.enqueue();

        self.lock.unlock();
        let mut woken = waiter.wait_deadline(util::deadline_after(timeout));
        if !woken {
            let mut waiters = util::guts(self.waiters.lock());
            if let Some(pos) = waiters.iter().position(|w| Arc::ptr_eq(w, &waiter)) {
                waiters.remove(pos);
            } else {
                // a `signal` already pulled us out of the queue, and it fires while holding the
                // queue lock, so the wakeup is ours
                woken = true;
            }
        }
        self.lock.lock();

        woken
    }

    /// Wakes the thread that has been waiting the longest, if any.
    pub fn signal(&self) {
        let mut waiters = util::guts(self.waiters.lock());

        if let Some(waiter) = waiters.pop_front() {
            waiter.fire();
        }
    }

    /// Wakes every thread currently waiting.
    pub fn broadcast(&self) {
        let mut waiters = util::guts(self.waiters.lock());

        for waiter in waiters.drain(..) {
            waiter.fire();
        }
    }

    fn enqueue(&self) -> Arc<Signal> {
        let waiter = Arc::new(Signal::new());
        util::guts(self.waiters.lock()).push_back(waiter.clone());
        waiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semaphore::Semaphore;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    fn wait_for_waiters<L: Locker>(cond: &Cond<L>, count: usize) {
        let begin = Instant::now();
        while cond.waiters() < count {
            assert!(begin.elapsed() < Duration::from_secs(5), "waiters never queued");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn signal_wakes_in_fifo_order() {
        init_test_logging();
        let cond = Arc::new(Cond::new(Semaphore::new(1)));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let waiter = cond.clone();
            let order = order.clone();
            handles.push(thread::spawn(move || {
                waiter.locker().lock();
                waiter.wait();
                Mutex::lock(&order).unwrap().push(i);
                waiter.locker().unlock();
            }));
            // queue them one at a time so the enqueue order is known
            wait_for_waiters(&cond, i + 1);
        }

        for woken in 1..=4 {
            cond.locker().lock();
            cond.signal();
            cond.locker().unlock();

            let begin = Instant::now();
            while Mutex::lock(&order).unwrap().len() < woken {
                assert!(begin.elapsed() < Duration::from_secs(5));
                thread::sleep(Duration::from_millis(1));
            }
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*Mutex::lock(&order).unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn broadcast_wakes_everyone_once() {
        init_test_logging();
        let cond = Arc::new(Cond::new(Semaphore::new(1)));
        let woken = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let cond = cond.clone();
                let woken = woken.clone();
                thread::spawn(move || {
                    cond.locker().lock();
                    cond.wait();
                    woken.fetch_add(1, Ordering::SeqCst);
                    cond.locker().unlock();
                })
            })
            .collect();

        wait_for_waiters(&cond, 5);
        cond.locker().lock();
        cond.broadcast();
        assert_eq!(cond.waiters(), 0);
        cond.locker().unlock();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 5);

        // nobody is queued, so these are no-ops
        cond.signal();
        cond.broadcast();
    }

    #[test]
    fn signal_without_waiters_is_a_no_op() {
        init_test_logging();
        let cond = Cond::new(Semaphore::new(1));
        cond.signal();
        assert_eq!(cond.waiters(), 0);
    }

    #[test]
    fn wait_timeout_leaves_queue_empty() {
        init_test_logging();
        let cond = Cond::new(Semaphore::new(1));

        cond.locker().lock();
        assert!(!cond.wait_timeout(Duration::from_millis(20)));
        assert_eq!(cond.waiters(), 0);
        // the lock is held again: nobody else can take it
        assert!(!cond.locker().try_acquire());
        cond.locker().unlock();
    }

    #[test]
    fn wait_timeout_observes_signal() {
        init_test_logging();
        let cond = Arc::new(Cond::new(Semaphore::new(1)));

        let handle = {
            let cond = cond.clone();
            thread::spawn(move || {
                cond.locker().lock();
                let woken = cond.wait_timeout(Duration::from_secs(10));
                cond.locker().unlock();
                woken
            })
        };

        wait_for_waiters(&cond, 1);
        cond.signal();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn works_over_a_borrowed_lock() {
        init_test_logging();
        let lock = Semaphore::new(1);
        let cond = Cond::new(&lock);

        cond.locker().lock();
        assert!(!cond.wait_timeout(Duration::from_millis(5)));
        cond.locker().unlock();
        assert_eq!(lock.available(), 1);
    }
}
