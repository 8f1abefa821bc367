//! One-shot wakeup signals, the building block every blocking primitive in this crate waits on.
//!
//! A [`Signal`] starts unfired and can be fired exactly once. Any number of threads can wait on it,
//! and once it has fired every current and future wait returns immediately. Primitives that need a
//! recurring wakeup (like `WaitGroup` or `KeyLock`) get one by swapping in a fresh `Signal` every
//! time the old one fires.
//!
//! [`Signal`]: struct.Signal.html

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::{self, Thread};
use std::time::Instant;

use crate::util;

/// A single-use notification that releases every thread waiting on it when fired.
///
/// This is the same shape as a manually-reset event that can never be reset: waiting threads park
/// themselves after leaving their handle in the signal's wait list, and `fire` unparks the whole
/// list at once.
#[derive(Debug)]
pub(crate) struct Signal {
    fired: AtomicBool,
    waiting: Mutex<Vec<Thread>>,
}

impl Signal {
    /// Creates a new, unfired `Signal`.
    pub(crate) fn new() -> Signal {
        Signal {
            fired: AtomicBool::new(false),
            waiting: Mutex::new(Vec::new()),
        }
    }

    /// Creates a `Signal` that has already fired, so waiting on it never blocks.
    pub(crate) fn fired() -> Signal {
        Signal {
            fired: AtomicBool::new(true),
            waiting: Mutex::new(Vec::new()),
        }
    }

    /// Returns whether this signal has fired.
    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Fires the signal, waking every thread currently waiting on it. Returns `false` if the signal
    /// had already been fired by someone else, in which case nothing happens.
    pub(crate) fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }

        // the flag is set before taking the list, so a waiter that registers after this point is
        // guaranteed to see it on its next check
        let waiting = mem::take(&mut *util::guts(self.waiting.lock()));
        for thread in waiting {
            thread.unpark();
        }

        true
    }

    /// Blocks the current thread until the signal fires.
    pub(crate) fn wait(&self) {
        wait_any(&[self], None);
    }

    /// Blocks the current thread until the signal fires or the deadline passes, returning whether
    /// the signal fired. A deadline of `None` waits forever.
    pub(crate) fn wait_deadline(&self, deadline: Option<Instant>) -> bool {
        wait_any(&[self], deadline).is_some()
    }

    fn register(&self) {
        let mut waiting = util::guts(self.waiting.lock());
        if !self.is_fired() {
            waiting.push(thread::current());
        }
    }

    fn unregister(&self) {
        let me = thread::current().id();
        util::guts(self.waiting.lock()).retain(|t| t.id() != me);
    }
}

/// Blocks the current thread until one of `signals` fires or `deadline` passes.
///
/// Returns the index of a fired signal (the lowest one if several have fired), or `None` if the
/// deadline passed first. This is the crate's version of a `select` over several one-shot
/// channels.
pub(crate) fn wait_any(signals: &[&Signal], deadline: Option<Instant>) -> Option<usize> {
    loop {
        // register before checking: a `fire` that lands between the check and the park still
        // finds our handle and leaves an unpark token behind for `park` to consume
        for signal in signals {
            signal.register();
        }

        let fired = signals.iter().position(|s| s.is_fired());
        if fired.is_some() {
            for signal in signals {
                signal.unregister();
            }
            return fired;
        }

        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    for signal in signals {
                        signal.unregister();
                    }
                    return None;
                }
                thread::park_timeout(deadline - now);
            }
            None => thread::park(),
        }

        // spurious wakeups and stale unpark tokens both land here; drop our handles and take
        // another lap
        for signal in signals {
            signal.unregister();
        }
    }
}
