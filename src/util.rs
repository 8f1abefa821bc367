//! Some utility functions that don't need to be part of the public release.

use std::sync::LockResult;
use std::time::{Duration, Instant};

// Unwrap a LockResult to get the guard even when poisoned.
//
// None of the critical sections in this crate can panic halfway through an update (handlers and
// callbacks always run outside the internal locks), so a poisoned lock still holds consistent
// state and it's fine to keep going.
//
// Source for the name: http://bulbapedia.bulbagarden.net/wiki/Guts_(Ability)
pub fn guts<T>(res: LockResult<T>) -> T {
    match res {
        Ok(guard) => guard,
        // The Pokemon's Guts raises its Attack!
        Err(poison) => poison.into_inner(),
    }
}

// Turn a relative timeout into an absolute deadline. A timeout too large to represent comes back as
// `None`, which every caller treats as "wait forever".
pub fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}
