use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::types::{BrokerConfig, BrokerError};
use crate::metrics::{Counter, Gauge};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BrokerState {
    Created,
    Running,
    Stopped,
}

struct Registry<K, T> {
    state: BrokerState,
    topics: HashMap<K, HashMap<u64, mpsc::Sender<T>>>,
}

struct Inner<K, T> {
    config: BrokerConfig,
    registry: Mutex<Registry<K, T>>,
    next_subscriber_id: AtomicU64,
    /// Cancelled on stop so the start watcher exits
    stopped: CancellationToken,
    dropped: Counter,
    subscribers: Gauge,
}

impl<K, T> Inner<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    fn registry(&self) -> MutexGuard<'_, Registry<K, T>> {
        // A panic while holding the lock leaves the map itself consistent.
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, topic: &K, subscriber_id: u64) {
        let mut registry = self.registry();
        let Some(subscribers) = registry.topics.get_mut(topic) else {
            return;
        };
        if subscribers.remove(&subscriber_id).is_some() {
            self.subscribers.sub(1);
            debug!(topic = ?topic, subscriber_id, "Subscriber removed");
        }
        if subscribers.is_empty() {
            registry.topics.remove(topic);
        }
    }

    fn stop(&self) {
        let topics = {
            let mut registry = self.registry();
            if registry.state == BrokerState::Stopped {
                debug!("Broker already stopped");
                return;
            }
            registry.state = BrokerState::Stopped;
            std::mem::take(&mut registry.topics)
        };

        let closed: usize = topics.values().map(HashMap::len).sum();
        self.subscribers.sub(closed as i64);
        // Dropping the senders closes every subscriber channel.
        drop(topics);
        self.stopped.cancel();

        info!(
            closed_subscribers = closed,
            dropped_events = self.dropped.get(),
            "Broker stopped"
        );
    }
}

/// Topic-keyed publish/subscribe broker
///
/// Cloning is cheap; clones share the same subscriber registry.
pub struct Broker<K, T> {
    inner: Arc<Inner<K, T>>,
}

impl<K, T> Clone for Broker<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, T> fmt::Debug for Broker<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("subscriber_buffer", &self.inner.config.subscriber_buffer)
            .field("subscribers", &self.inner.subscribers.get())
            .field("dropped", &self.inner.dropped.get())
            .finish()
    }
}

impl<K, T> Default for Broker<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl<K, T> Broker<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + 'static,
{
    /// Create a new broker. Subscriptions are accepted immediately; publishing
    /// requires [`Broker::start`].
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: Mutex::new(Registry {
                    state: BrokerState::Created,
                    topics: HashMap::new(),
                }),
                next_subscriber_id: AtomicU64::new(1),
                stopped: CancellationToken::new(),
                dropped: Counter::new(),
                subscribers: Gauge::new(),
            }),
        }
    }

    /// Begin dispatching. The broker stops itself when `cancel` fires.
    ///
    /// Must be called exactly once, from within a Tokio runtime.
    pub fn start(&self, cancel: CancellationToken) -> Result<(), BrokerError> {
        {
            let mut registry = self.inner.registry();
            if registry.state != BrokerState::Created {
                error!(state = ?registry.state, "Broker started twice");
                return Err(BrokerError::AlreadyStarted);
            }
            registry.state = BrokerState::Running;
        }

        let inner = Arc::downgrade(&self.inner);
        let stopped = self.inner.stopped.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some(inner) = Weak::upgrade(&inner) {
                        debug!("Broker cancelled");
                        inner.stop();
                    }
                }
                _ = stopped.cancelled() => {}
            }
        });

        debug!(
            subscriber_buffer = self.inner.config.subscriber_buffer,
            "Broker started"
        );
        Ok(())
    }

    /// Register a subscriber for `topic`.
    ///
    /// The receiver gets every event published to `topic` after this call, in
    /// publish order. Subscribing to a stopped broker yields an already-closed
    /// channel.
    pub fn subscribe(&self, topic: K) -> (mpsc::Receiver<T>, Unsubscribe) {
        let (tx, rx) = mpsc::channel(self.inner.config.subscriber_buffer.max(1));
        let subscriber_id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut registry = self.inner.registry();
            if registry.state == BrokerState::Stopped {
                debug!(topic = ?topic, "Subscribe on stopped broker");
                return (rx, Unsubscribe::noop());
            }
            registry
                .topics
                .entry(topic.clone())
                .or_default()
                .insert(subscriber_id, tx);
            self.inner.subscribers.inc();
        }
        debug!(topic = ?topic, subscriber_id, "Subscriber registered");

        let inner = Arc::downgrade(&self.inner);
        let unsubscribe = Unsubscribe::new(move || {
            if let Some(inner) = Weak::upgrade(&inner) {
                inner.remove(&topic, subscriber_id);
            }
        });
        (rx, unsubscribe)
    }

    /// Deliver `event` to every subscriber currently registered for `topic`.
    ///
    /// Returns how many subscribers accepted the event. Full queues drop the
    /// event for that subscriber and count it in [`Broker::dropped`];
    /// subscribers whose receiver is gone are pruned.
    pub fn publish(&self, topic: &K, event: T) -> Result<usize, BrokerError> {
        let mut registry = self.inner.registry();
        match registry.state {
            BrokerState::Created => {
                error!(topic = ?topic, "Publish before broker start");
                return Err(BrokerError::NotStarted);
            }
            BrokerState::Stopped => {
                warn!(topic = ?topic, "Publish after broker stop");
                return Err(BrokerError::Stopped);
            }
            BrokerState::Running => {}
        }

        let Some(subscribers) = registry.topics.get_mut(topic) else {
            return Ok(0);
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (&subscriber_id, tx) in subscribers.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    let total = self.inner.dropped.inc();
                    warn!(
                        topic = ?topic,
                        subscriber_id,
                        dropped_total = total,
                        "Subscriber queue full, event dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(subscriber_id),
            }
        }

        for subscriber_id in &closed {
            subscribers.remove(subscriber_id);
            debug!(topic = ?topic, subscriber_id, "Pruned closed subscriber");
        }
        if subscribers.is_empty() {
            registry.topics.remove(topic);
        }
        self.inner.subscribers.sub(closed.len() as i64);

        Ok(delivered)
    }

    /// Stop dispatching and close every subscriber channel. Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Number of subscribers registered for `topic`
    #[must_use]
    pub fn subscriber_count(&self, topic: &K) -> usize {
        self.inner
            .registry()
            .topics
            .get(topic)
            .map_or(0, HashMap::len)
    }

    /// Number of topics with at least one subscriber
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.inner.registry().topics.len()
    }

    /// Total subscribers across all topics
    #[must_use]
    pub fn total_subscribers(&self) -> i64 {
        self.inner.subscribers.get()
    }

    /// Events dropped because a subscriber queue was full
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.get()
    }

    /// Whether the broker is accepting publishes
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.registry().state == BrokerState::Running
    }
}

/// Handle that deregisters one subscriber
///
/// Idempotent and safe to call concurrently with publishes. Once it returns
/// no further events are queued for the subscriber; its receiver drains what
/// was already queued and then reports closure.
#[derive(Clone)]
pub struct Unsubscribe {
    detach: Arc<dyn Fn() + Send + Sync>,
}

impl Unsubscribe {
    fn new(detach: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            detach: Arc::new(detach),
        }
    }

    fn noop() -> Self {
        Self::new(|| {})
    }

    /// Deregister the subscriber
    pub fn unsubscribe(&self) {
        (self.detach)();
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe").finish_non_exhaustive()
    }
}
