//! Topic-based publish/subscribe with ordered, per-subscriber delivery.
//!
//! The primary types in this module are [`PubSub`], the broker, and [`Subscription`], the handle
//! returned for each registered handler. See the documentation on those types for further
//! information.
//!
//! # Structure
//!
//! Every subscription owns an inbox: a FIFO queue, a closed flag, and a [`Cond`] over a one-permit
//! [`Semaphore`] that guards both. A dedicated thread per subscription sleeps on that `Cond` while
//! the inbox is empty and open, pops the oldest message, drops the lock, and calls the handler. So
//! handlers for one subscription run one at a time and in publish order, while different
//! subscriptions make progress independently.
//!
//! Closing an inbox (through `unsubscribe` or `PubSub::close`) stops new messages from being
//! queued, but the thread keeps going until the queue is empty, so nothing already queued is lost.
//!
//! [`PubSub`]: struct.PubSub.html
//! [`Subscription`]: struct.Subscription.html
//! [`Cond`]: ../struct.Cond.html
//! [`Semaphore`]: ../struct.Semaphore.html

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;

use crate::cond::{Cond, Locker};
use crate::semaphore::Semaphore;
use crate::signal::Signal;
use crate::util;

/// The collection of errors that can be returned by `PubSub` methods.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    /// Returned when subscribing or publishing after the broker has been closed.
    #[error("pubsub closed")]
    Closed,
    /// Returned by `close_timeout` when some subscriptions were still draining at the deadline.
    /// They keep draining in the background.
    #[error("deadline exceeded while waiting for subscriptions to drain")]
    DeadlineExceeded,
    /// Returned when the delivery thread for a new subscription couldn't be started.
    #[error("failed to spawn subscription thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Settings for a [`PubSub`] broker.
///
/// [`PubSub`]: struct.PubSub.html
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubConfig {
    /// Name given to every subscription's delivery thread.
    pub thread_name: String,
    /// Stack size for delivery threads, or `None` for the platform default.
    pub stack_size: Option<usize>,
}

impl Default for PubSubConfig {
    fn default() -> PubSubConfig {
        PubSubConfig {
            thread_name: "afteryou-pubsub".into(),
            stack_size: None,
        }
    }
}

/// A topic-keyed message broker.
///
/// Handlers are registered against a topic with `subscribe`, and every message given to `publish`
/// for that topic is handed to each of them. Each subscription gets its own delivery thread and
/// its own queue, which means:
///
/// * A subscription sees messages in the order they were published, and its handler is never
///   called concurrently with itself.
/// * A slow handler only holds up its own subscription; `publish` never waits on handlers.
/// * `publish` delivers to the subscriptions that exist at the moment it is called. A subscription
///   added a moment later does not see that message, and publishing to a topic nobody is
///   subscribed to quietly does nothing.
///
/// `PubSub` is a cheap handle around shared state; clones all refer to the same broker. When the
/// last handle is dropped without calling `close`, every subscription is closed (and left to
/// drain) without waiting for it.
///
/// # Example
///
/// ```
/// use afteryou::PubSub;
/// use std::sync::{Arc, Mutex};
///
/// let pubsub = PubSub::new();
/// let seen = Arc::new(Mutex::new(Vec::new()));
///
/// let sink = seen.clone();
/// pubsub.subscribe("greetings", move |msg: String| {
///     sink.lock().unwrap().push(msg);
/// }).unwrap();
///
/// pubsub.publish("greetings", "hello".to_string()).unwrap();
/// pubsub.publish("greetings", "again".to_string()).unwrap();
/// pubsub.publish("nobody-listens", "dropped".to_string()).unwrap();
///
/// // closing waits for every subscription to finish what it was given
/// pubsub.close().unwrap();
/// assert_eq!(*seen.lock().unwrap(), vec!["hello", "again"]);
/// assert!(pubsub.publish("greetings", "late".to_string()).is_err());
/// ```
pub struct PubSub<M> {
    broker: Arc<Broker<M>>,
}

/// A handle to one handler's registration on a `PubSub` topic.
///
/// Dropping a `Subscription` does not unsubscribe it; call `unsubscribe` for that, or close the
/// broker. Clones refer to the same subscription.
pub struct Subscription<M> {
    inbox: Arc<Inbox<M>>,
    broker: Weak<Broker<M>>,
}

struct Broker<M> {
    config: PubSubConfig,
    state: Mutex<BrokerState<M>>,
}

struct BrokerState<M> {
    closed: bool,
    topics: HashMap<String, Vec<Arc<Inbox<M>>>>,
}

struct Inbox<M> {
    topic: String,
    // `queue` and `closed` only change while holding the cond's lock. The `Semaphore` doesn't own
    // any data the way a `Mutex` would, so the queue has to be mutable through `&self` on its own.
    queue: SegQueue<M>,
    closed: AtomicBool,
    cond: Cond<Semaphore>,
    unsubscribed: AtomicBool,
    done: Signal,
}

impl<M> PubSub<M>
where
    M: Clone + Send + 'static,
{
    /// Creates a new, open broker with the default configuration.
    pub fn new() -> PubSub<M> {
        PubSub::with_config(PubSubConfig::default())
    }

    /// Creates a new, open broker with the given configuration.
    pub fn with_config(config: PubSubConfig) -> PubSub<M> {
        PubSub {
            broker: Arc::new(Broker {
                config,
                state: Mutex::new(BrokerState {
                    closed: false,
                    topics: HashMap::new(),
                }),
            }),
        }
    }

    /// Registers `handler` to receive every message published to `topic` from now on, and starts
    /// the thread that delivers them.
    ///
    /// # Errors
    ///
    /// Returns `PubSubError::Closed` if the broker has been closed, or `PubSubError::Spawn` if the
    /// delivery thread couldn't be started. Nothing stays registered in either case.
    pub fn subscribe<S, F>(&self, topic: S, handler: F) -> Result<Subscription<M>, PubSubError>
    where
        S: Into<String>,
        F: FnMut(M) + Send + 'static,
    {
        let inbox = Arc::new(Inbox::new(topic.into()));

        {
            let mut state = util::guts(self.broker.state.lock());
            if state.closed {
                return Err(PubSubError::Closed);
            }
            state
                .topics
                .entry(inbox.topic.clone())
                .or_default()
                .push(inbox.clone());
        }

        let mut builder = thread::Builder::new().name(self.broker.config.thread_name.clone());
        if let Some(size) = self.broker.config.stack_size {
            builder = builder.stack_size(size);
        }

        let worker = inbox.clone();
        if let Err(err) = builder.spawn(move || worker.deliver(handler)) {
            self.broker.remove(&inbox);
            inbox.close();
            inbox.done.fire();
            return Err(PubSubError::Spawn(err));
        }

        tracing::debug!(topic = %inbox.topic, "subscribed");

        Ok(Subscription {
            inbox,
            broker: Arc::downgrade(&self.broker),
        })
    }

    /// Queues `msg` for every subscription currently registered on `topic`.
    ///
    /// This doesn't wait for any handler to run. A topic with no subscribers is not an error; the
    /// message is simply dropped.
    ///
    /// # Errors
    ///
    /// Returns `PubSubError::Closed` if the broker has been closed.
    pub fn publish(&self, topic: &str, msg: M) -> Result<(), PubSubError> {
        let inboxes = {
            let state = util::guts(self.broker.state.lock());
            if state.closed {
                return Err(PubSubError::Closed);
            }

            match state.topics.get(topic) {
                Some(inboxes) => inboxes.clone(),
                None => return Ok(()),
            }
        };

        for inbox in inboxes {
            inbox.push(msg.clone());
        }

        Ok(())
    }

    /// Closes the broker and blocks until every subscription has delivered everything queued for
    /// it.
    ///
    /// After this starts, `subscribe` and `publish` fail with `PubSubError::Closed`. Calling
    /// `close` on a broker that is already closed returns `Ok(())` right away.
    pub fn close(&self) -> Result<(), PubSubError> {
        self.close_until(None)
    }

    /// Like `close`, but stops waiting for subscriptions to drain after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `PubSubError::DeadlineExceeded` if some subscription still had messages to deliver
    /// when the timeout elapsed. The broker is closed regardless, and the remaining deliveries
    /// finish in the background.
    pub fn close_timeout(&self, timeout: Duration) -> Result<(), PubSubError> {
        self.close_until(util::deadline_after(timeout))
    }

    /// Returns whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        util::guts(self.broker.state.lock()).closed
    }

    /// Returns the topics that currently have at least one subscription, in sorted order.
    pub fn topics(&self) -> Vec<String> {
        let state = util::guts(self.broker.state.lock());
        let mut topics: Vec<String> = state.topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Returns the number of subscriptions currently registered on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        util::guts(self.broker.state.lock())
            .topics
            .get(topic)
            .map_or(0, Vec::len)
    }

    fn close_until(&self, deadline: Option<Instant>) -> Result<(), PubSubError> {
        let inboxes = match self.broker.shut() {
            Some(inboxes) => inboxes,
            None => return Ok(()),
        };

        tracing::debug!(subscriptions = inboxes.len(), "closing pubsub");

        for inbox in &inboxes {
            if !inbox.done.wait_deadline(deadline) {
                tracing::warn!(topic = %inbox.topic, "subscription still draining at deadline");
                return Err(PubSubError::DeadlineExceeded);
            }
        }

        Ok(())
    }
}

impl<M> Clone for PubSub<M> {
    fn clone(&self) -> PubSub<M> {
        PubSub {
            broker: self.broker.clone(),
        }
    }
}

impl<M> Default for PubSub<M>
where
    M: Clone + Send + 'static,
{
    fn default() -> PubSub<M> {
        PubSub::new()
    }
}

impl<M> fmt::Debug for PubSub<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = util::guts(self.broker.state.lock());
        f.debug_struct("PubSub")
            .field("closed", &state.closed)
            .field("topics", &state.topics.len())
            .finish()
    }
}

impl<M> Broker<M> {
    // Marks the broker closed and closes every inbox, handing them back so the caller can wait on
    // them. Returns `None` if the broker was already closed.
    fn shut(&self) -> Option<Vec<Arc<Inbox<M>>>> {
        let inboxes: Vec<Arc<Inbox<M>>> = {
            let mut state = util::guts(self.state.lock());
            if state.closed {
                return None;
            }
            state.closed = true;
            state.topics.drain().flat_map(|(_, inboxes)| inboxes).collect()
        };

        for inbox in &inboxes {
            inbox.close();
        }

        Some(inboxes)
    }

    fn remove(&self, inbox: &Arc<Inbox<M>>) {
        let mut state = util::guts(self.state.lock());
        if state.closed {
            return;
        }

        if let Some(inboxes) = state.topics.get_mut(&inbox.topic) {
            inboxes.retain(|other| !Arc::ptr_eq(other, inbox));
            if inboxes.is_empty() {
                state.topics.remove(&inbox.topic);
            }
        }
    }
}

impl<M> Drop for Broker<M> {
    fn drop(&mut self) {
        if self.shut().is_some() {
            tracing::debug!("pubsub dropped without close, subscriptions left to drain");
        }
    }
}

impl<M> Subscription<M> {
    /// Returns the topic this subscription was registered on.
    pub fn topic(&self) -> &str {
        &self.inbox.topic
    }

    /// Removes this subscription from its broker.
    ///
    /// No message published after this call reaches the handler, but messages that were already
    /// queued are still delivered before the delivery thread exits. Calling this more than once
    /// (from any clone) has no further effect.
    pub fn unsubscribe(&self) {
        if self.inbox.unsubscribed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(broker) = self.broker.upgrade() {
            broker.remove(&self.inbox);
        }
        self.inbox.close();

        tracing::debug!(topic = %self.inbox.topic, "unsubscribed");
    }

    /// Returns whether this subscription has stopped accepting messages, either because it was
    /// unsubscribed or because its broker was closed.
    pub fn is_closed(&self) -> bool {
        self.inbox.closed.load(Ordering::SeqCst)
    }

    /// Blocks until this subscription's delivery thread has exited, which happens once it has been
    /// closed and its queue is empty.
    pub fn wait(&self) {
        self.inbox.done.wait();
    }

    /// Like `wait`, but gives up after `timeout`. Returns whether the delivery thread exited.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.inbox.done.wait_deadline(util::deadline_after(timeout))
    }
}

impl<M> Clone for Subscription<M> {
    fn clone(&self) -> Subscription<M> {
        Subscription {
            inbox: self.inbox.clone(),
            broker: self.broker.clone(),
        }
    }
}

impl<M> fmt::Debug for Subscription<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.inbox.topic)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<M> Inbox<M> {
    fn new(topic: String) -> Inbox<M> {
        Inbox {
            topic,
            queue: SegQueue::new(),
            closed: AtomicBool::new(false),
            cond: Cond::new(Semaphore::new(1)),
            unsubscribed: AtomicBool::new(false),
            done: Signal::new(),
        }
    }

    fn push(&self, msg: M) {
        let lock = self.cond.locker();
        lock.lock();

        if !self.closed.load(Ordering::SeqCst) {
            self.queue.push(msg);
            self.cond.signal();
        }

        lock.unlock();
    }

    fn close(&self) {
        let lock = self.cond.locker();
        lock.lock();

        self.closed.store(true, Ordering::SeqCst);
        self.cond.broadcast();

        lock.unlock();
    }

    // The body of a subscription's delivery thread.
    fn deliver<F>(&self, mut handler: F)
    where
        F: FnMut(M),
    {
        let lock = self.cond.locker();

        loop {
            lock.lock();
            while self.queue.is_empty() && !self.closed.load(Ordering::SeqCst) {
                self.cond.wait();
            }
            let next = self.queue.pop();
            lock.unlock();

            // the queue only comes up empty here once the inbox is closed
            let msg = match next {
                Some(msg) => msg,
                None => break,
            };

            if panic::catch_unwind(AssertUnwindSafe(|| handler(msg))).is_err() {
                tracing::error!(topic = %self.topic, "subscription handler panicked");
            }
        }

        self.done.fire();
    }
}
