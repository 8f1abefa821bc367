//! A collection of synchronization primitives assembled from a handful of smaller ones, rather
//! than from the standard library's `RwLock` and friends.
//!
//! This library contains the following primitives:
//!
//! * [`Cond`], a condition variable over any [`Locker`], with FIFO `signal` and `broadcast`.
//! * [`RWMutex`], a reader/writer lock with a fixed number of reader slots.
//! * [`WaitGroup`], a reusable counter that lets threads wait until a group of tasks is finished.
//! * [`KeyLock`], which locks whole sets of string keys at once.
//! * [`Call`], which collapses concurrent invocations of the same work into one execution.
//! * [`PubSub`], a topic broker that delivers messages to each subscriber in order on its own
//!   thread.
//!
//! Along with the building blocks they share:
//!
//! * [`Semaphore`], a counting semaphore that doubles as a plain exclusive lock.
//! * [`CancelToken`], which callers hand to blocking operations so they can give up on an explicit
//!   cancel or a deadline.
//!
//! [`Cond`]: struct.Cond.html
//! [`Locker`]: trait.Locker.html
//! [`RWMutex`]: struct.RWMutex.html
//! [`WaitGroup`]: struct.WaitGroup.html
//! [`KeyLock`]: struct.KeyLock.html
//! [`Call`]: struct.Call.html
//! [`PubSub`]: struct.PubSub.html
//! [`Semaphore`]: struct.Semaphore.html
//! [`CancelToken`]: struct.CancelToken.html

#![deny(missing_docs)]

//Name source: https://bulbapedia.bulbagarden.net/wiki/After_You_(move)

mod util;
mod signal;

mod call;
mod cancel;
mod cond;
mod keylock;
mod pubsub;
mod rwmutex;
mod semaphore;
mod waitgroup;

#[cfg(test)]
mod test_utils;

pub use call::{Call, CallError};
pub use cancel::{CancelError, CancelToken};
pub use cond::{Cond, Locker};
pub use keylock::{KeyGuard, KeyLock};
pub use pubsub::{PubSub, PubSubConfig, PubSubError, Subscription};
pub use rwmutex::{RWMutex, ReadGuard, WriteGuard, DEFAULT_MAX_READERS};
pub use semaphore::Semaphore;
pub use waitgroup::{WaitGroup, WaitGuard};
