//! Support module for `Call`, which folds concurrent identical calls into one execution.
//!
//! See the documentation of the [`Call`] struct for more information.
//!
//! [`Call`]: struct.Call.html

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::cancel::{CancelError, CancelToken};
use crate::signal::{self, Signal};
use crate::util;

/// The collection of errors that can be returned by [`Call::run`].
///
/// [`Call::run`]: struct.Call.html#method.run
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    /// The caller's token was cancelled before the shared call finished. The call itself may still
    /// be running for other callers.
    #[error(transparent)]
    Canceled(#[from] CancelError),
    /// The shared call finished with an error.
    #[error("call failed: {0}")]
    Failed(E),
    /// The callback panicked.
    #[error("call panicked")]
    Panicked,
    /// The worker thread for a new call couldn't be started.
    #[error("failed to spawn call worker: {0}")]
    Spawn(#[source] io::Error),
}

/// Duplicate-call suppression, also known as "single flight".
///
/// A `Call` runs at most one callback at a time. The first `run` starts the callback on a worker
/// thread; every `run` that arrives while it is still going joins it instead of starting another,
/// and all of them receive a clone of the same outcome. As soon as the callback finishes, the
/// `Call` forgets about it, so the next `run` starts fresh. Results are never cached past the call
/// that produced them.
///
/// Each caller passes its own [`CancelToken`]. A caller whose token is cancelled stops waiting
/// right away with `CallError::Canceled`, but the shared callback keeps running as long as anyone
/// else is still waiting for it. Only when the last interested caller gives up is the callback's
/// own token cancelled. The callback is expected to watch that token and bail out early.
///
/// [`CancelToken`]: struct.CancelToken.html
///
/// # Example
///
/// ```
/// use afteryou::{Call, CancelToken};
/// use std::sync::Arc;
/// use std::thread;
/// use std::time::Duration;
///
/// let call: Arc<Call<u32, String>> = Arc::new(Call::new());
///
/// let handles: Vec<_> = (0..4).map(|_| {
///     let call = call.clone();
///     thread::spawn(move || {
///         call.run(&CancelToken::new(), |_cancel| {
///             thread::sleep(Duration::from_millis(100));
///             Ok(42)
///         })
///     })
/// }).collect();
///
/// for handle in handles {
///     assert_eq!(handle.join().unwrap().unwrap(), 42);
/// }
/// assert!(!call.in_flight());
/// ```
#[derive(Debug)]
pub struct Call<T, E> {
    // shared with the worker thread so it can clear itself out when it finishes
    current: Arc<Mutex<Option<Arc<Group<T, E>>>>>,
}

#[derive(Debug)]
struct Group<T, E> {
    done: Signal,
    worker: CancelToken,
    state: Mutex<GroupState<T, E>>,
}

#[derive(Debug)]
struct GroupState<T, E> {
    waiting: usize,
    outcome: Option<Outcome<T, E>>,
}

#[derive(Debug)]
enum Outcome<T, E> {
    Finished(Result<T, E>),
    Panicked,
}

impl<T, E> Call<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates a new `Call` with nothing in flight.
    pub fn new() -> Call<T, E> {
        Call {
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns whether a callback is currently running.
    pub fn in_flight(&self) -> bool {
        util::guts(self.current.lock()).is_some()
    }

    /// Returns the number of callers currently waiting on the in-flight callback, or zero if
    /// nothing is running.
    pub fn waiting(&self) -> usize {
        match *util::guts(self.current.lock()) {
            Some(ref group) => util::guts(group.state.lock()).waiting,
            None => 0,
        }
    }

    /// Runs `callback`, or joins the one already running, and returns the shared outcome.
    ///
    /// If no call is in flight, `callback` is started on a new worker thread and handed a fresh
    /// `CancelToken` of its own. If one is already in flight, `callback` is dropped without being
    /// called and this waits for the running one instead.
    ///
    /// # Errors
    ///
    /// * `CallError::Canceled` if `cancel` was already cancelled on entry, or is cancelled (or
    ///   passes its deadline) before the shared call finishes.
    /// * `CallError::Failed` if the shared callback returned an error.
    /// * `CallError::Panicked` if the shared callback panicked.
    /// * `CallError::Spawn` if a worker thread was needed and couldn't be started.
    pub fn run<F>(&self, cancel: &CancelToken, callback: F) -> Result<T, CallError<E>>
    where
        F: FnOnce(&CancelToken) -> Result<T, E> + Send + 'static,
    {
        cancel.check()?;

        let group = {
            let mut current = util::guts(self.current.lock());

            match current.clone() {
                Some(group) => {
                    util::guts(group.state.lock()).waiting += 1;
                    group
                }
                None => {
                    let group = Arc::new(Group {
                        done: Signal::new(),
                        worker: CancelToken::new(),
                        state: Mutex::new(GroupState {
                            waiting: 1,
                            outcome: None,
                        }),
                    });

                    // spawned while holding the lock, so nobody can join a group whose worker
                    // never started, and the worker can't clear the slot before it's filled
                    self.spawn_worker(group.clone(), callback)
                        .map_err(CallError::Spawn)?;
                    *current = Some(group.clone());
                    group
                }
            }
        };

        // index 0 is completion, index 1 is the caller giving up
        let reason = match signal::wait_any(&[&group.done, cancel.signal()], cancel.deadline()) {
            Some(0) => return group.finish(),
            Some(_) => CancelError::Canceled,
            None => CancelError::DeadlineExceeded,
        };

        let mut state = util::guts(group.state.lock());
        state.waiting -= 1;
        if state.waiting == 0 && state.outcome.is_none() {
            tracing::debug!("last caller gave up, cancelling shared call");
            group.worker.cancel();
        }

        Err(CallError::Canceled(reason))
    }

    fn spawn_worker<F>(&self, group: Arc<Group<T, E>>, callback: F) -> io::Result<()>
    where
        F: FnOnce(&CancelToken) -> Result<T, E> + Send + 'static,
    {
        let slot = self.current.clone();

        thread::Builder::new()
            .name("afteryou-call".into())
            .spawn(move || {
                tracing::debug!("shared call started");
                let worker = group.worker.clone();
                let outcome = match panic::catch_unwind(AssertUnwindSafe(|| callback(&worker))) {
                    Ok(result) => Outcome::Finished(result),
                    Err(_) => {
                        tracing::error!("shared call panicked");
                        Outcome::Panicked
                    }
                };

                let mut current = util::guts(slot.lock());
                if current.as_ref().map_or(false, |g| Arc::ptr_eq(g, &group)) {
                    *current = None;
                }
                util::guts(group.state.lock()).outcome = Some(outcome);
                group.done.fire();
                drop(current);

                tracing::debug!("shared call finished");
            })
            .map(|_| ())
    }
}

impl<T, E> Default for Call<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Call<T, E> {
        Call::new()
    }
}

impl<T: Clone, E: Clone> Group<T, E> {
    fn finish(&self) -> Result<T, CallError<E>> {
        let mut state = util::guts(self.state.lock());
        state.waiting -= 1;

        match state.outcome {
            Some(Outcome::Finished(Ok(ref value))) => Ok(value.clone()),
            Some(Outcome::Finished(Err(ref err))) => Err(CallError::Failed(err.clone())),
            Some(Outcome::Panicked) => Err(CallError::Panicked),
            None => unreachable!("done fired before the outcome was stored"),
        }
    }
}
