//! # Event Bus
//!
//! The publishing side of the bus plus the background dispatch loop that
//! routes queued events to subscriptions.
//!
//! ## Lifecycle
//!
//! `publish` is accepted from construction until `stop`. Events published
//! before `start` simply wait in the queue. `stop` drains up to a timeout and
//! then cancels the dispatch loop; whatever is still queued stays queued and
//! is dispatched by the next `start`.

use crate::cascade::{CascadeChain, CascadeTracker, ReserveError};
use crate::dead_letter::{DeadLetter, DeadLetterQueue};
use crate::events::{Event, EventPriority, EventType};
use crate::subscriber::{
    EventHandler, EventPredicate, Subscription, SubscriptionError, SubscriptionId,
};
use crate::{
    DEFAULT_DELIVERY_TIMEOUT_SECS, DEFAULT_MAX_CASCADE_HOPS, DEFAULT_PUBLISH_TIMEOUT_SECS,
    DEFAULT_QUEUE_SIZE,
};
use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use shared_types::{new_id, BoundedHistory, Payload};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors returned to publishers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus was stopped.
    #[error("Event bus is not accepting events")]
    NotAccepting,

    /// The queue's receiving side is gone.
    #[error("Event queue closed")]
    QueueClosed,

    /// The queue stayed full for the whole publish timeout.
    #[error("Event queue full after waiting {}ms", .0.as_millis())]
    QueueFull(Duration),

    /// The cascade chain already has `max_hops` hops.
    #[error("Cascade {chain_id} exceeded {max_hops} hops")]
    CascadeLimitExceeded {
        /// Chain id.
        chain_id: String,
        /// Configured ceiling.
        max_hops: u32,
    },

    /// The cascade chain was already completed.
    #[error("Cascade {0} is already complete")]
    CascadeClosed(String),
}

/// Event bus tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Bound of the publish queue. A full queue blocks publishers.
    pub max_queue_size: usize,
    /// Longest a publisher waits for queue space.
    pub publish_timeout: Duration,
    /// Total delivery attempts per (event, subscriber) before dead-lettering.
    pub max_retries: u32,
    /// Base retry delay, multiplied by the attempt number.
    pub retry_delay: Duration,
    /// Ceiling for a single handler invocation.
    pub delivery_timeout: Duration,
    /// Number of latency samples kept for the rolling average.
    pub latency_window: usize,
    /// Default drain timeout used by callers that have no better value.
    pub drain_timeout: Duration,
    /// Maximum hops of a cascade chain.
    pub max_cascade_hops: u32,
    /// Number of completed cascade chains kept for lookup.
    pub completed_cascade_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_QUEUE_SIZE,
            publish_timeout: Duration::from_secs(DEFAULT_PUBLISH_TIMEOUT_SECS),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            delivery_timeout: Duration::from_secs(DEFAULT_DELIVERY_TIMEOUT_SECS),
            latency_window: 1000,
            drain_timeout: Duration::from_secs(5),
            max_cascade_hops: DEFAULT_MAX_CASCADE_HOPS,
            completed_cascade_capacity: 1000,
        }
    }
}

/// Point-in-time bus counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusMetrics {
    /// Events accepted into the queue.
    pub events_published: u64,
    /// Successful (event, subscriber) deliveries.
    pub events_delivered: u64,
    /// Deliveries that ended in the dead-letter queue.
    pub events_failed: u64,
    /// Rolling average latency of successful deliveries.
    pub average_latency_ms: f64,
    /// Events waiting in the queue.
    pub queue_size: usize,
    /// Entries in the dead-letter queue.
    pub dead_letter_count: usize,
    /// Registered subscriptions.
    pub subscription_count: usize,
    /// Open cascade chains.
    pub active_cascades: usize,
}

/// Subscriptions indexed by id and by event type.
#[derive(Default)]
struct SubscriptionTable {
    by_id: HashMap<SubscriptionId, Arc<Subscription>>,
    by_type: HashMap<EventType, Vec<SubscriptionId>>,
}

impl SubscriptionTable {
    fn insert(&mut self, subscription: Subscription) -> SubscriptionId {
        let id = subscription.id.clone();
        for ty in &subscription.event_types {
            self.by_type.entry(*ty).or_default().push(id.clone());
        }
        self.by_id.insert(id.clone(), Arc::new(subscription));
        id
    }

    fn remove(&mut self, id: &str) -> bool {
        let Some(subscription) = self.by_id.remove(id) else {
            return false;
        };
        for ty in &subscription.event_types {
            if let Some(ids) = self.by_type.get_mut(ty) {
                ids.retain(|s| s != id);
                if ids.is_empty() {
                    self.by_type.remove(ty);
                }
            }
        }
        true
    }

    fn matching(&self, event: &Event) -> Vec<Arc<Subscription>> {
        self.by_type
            .get(&event.event_type)
            .into_iter()
            .flatten()
            .filter_map(|id| self.by_id.get(id))
            .filter(|s| s.matches(event))
            .cloned()
            .collect()
    }
}

struct Dispatcher {
    handle: JoinHandle<mpsc::Receiver<Arc<Event>>>,
    token: CancellationToken,
}

struct BusInner {
    config: EventBusConfig,
    sender: mpsc::Sender<Arc<Event>>,
    /// Parked here while no dispatch loop owns it.
    receiver: Mutex<Option<mpsc::Receiver<Arc<Event>>>>,
    dispatcher: Mutex<Option<Dispatcher>>,
    subscriptions: RwLock<SubscriptionTable>,
    dead_letters: Mutex<DeadLetterQueue>,
    cascades: Mutex<CascadeTracker>,
    latencies: Mutex<BoundedHistory<Duration>>,
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    /// Queued plus in-flight events.
    pending: AtomicUsize,
    accepting: AtomicBool,
    drained: Notify,
}

/// Asynchronous publish/subscribe router.
///
/// Cheap to clone; all clones share one queue and subscription table.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus. Publishing is accepted immediately; dispatch begins at
    /// [`start`](Self::start).
    #[must_use]
    pub fn new(config: EventBusConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.max_queue_size.max(1));
        let inner = BusInner {
            sender,
            receiver: Mutex::new(Some(receiver)),
            dispatcher: Mutex::new(None),
            subscriptions: RwLock::new(SubscriptionTable::default()),
            dead_letters: Mutex::new(DeadLetterQueue::default()),
            cascades: Mutex::new(CascadeTracker::new(
                config.max_cascade_hops,
                config.completed_cascade_capacity,
            )),
            latencies: Mutex::new(BoundedHistory::new(config.latency_window)),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            pending: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            drained: Notify::new(),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The configuration this bus was built with.
    #[must_use]
    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }

    // =========================================================================
    // PUBLISHING
    // =========================================================================

    /// Publish a new event. Waits up to `publish_timeout` while the queue is
    /// full.
    pub async fn publish(
        &self,
        event_type: EventType,
        payload: Payload,
        source: impl Into<String>,
        priority: EventPriority,
        correlation_id: Option<String>,
    ) -> Result<Arc<Event>, BusError> {
        let mut event = Event::new(event_type, source, payload).with_priority(priority);
        event.correlation_id = correlation_id;
        self.publish_event(event).await
    }

    /// Publish a prebuilt event. Waits up to `publish_timeout` while the
    /// queue is full.
    pub async fn publish_event(&self, event: Event) -> Result<Arc<Event>, BusError> {
        self.ensure_accepting()?;
        let wait = self.inner.config.publish_timeout;
        let permit = match tokio::time::timeout(wait, self.inner.sender.reserve()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(BusError::QueueClosed),
            Err(_) => {
                warn!(
                    event_type = %event.event_type,
                    source = %event.source,
                    wait_ms = wait.as_millis() as u64,
                    "Event queue full, publish timed out"
                );
                return Err(BusError::QueueFull(wait));
            }
        };
        Ok(self.enqueue(permit, event))
    }

    /// Publish a prebuilt event only if the queue has room right now.
    pub fn try_publish_event(&self, event: Event) -> Result<Arc<Event>, BusError> {
        self.ensure_accepting()?;
        let permit = self.inner.sender.try_reserve().map_err(|e| match e {
            TrySendError::Full(()) => BusError::QueueFull(Duration::ZERO),
            TrySendError::Closed(()) => BusError::QueueClosed,
        })?;
        Ok(self.enqueue(permit, event))
    }

    fn ensure_accepting(&self) -> Result<(), BusError> {
        if self.inner.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::NotAccepting)
        }
    }

    fn enqueue(&self, permit: mpsc::Permit<'_, Arc<Event>>, event: Event) -> Arc<Event> {
        let event = Arc::new(event);
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        permit.send(Arc::clone(&event));
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            source = %event.source,
            priority = ?event.priority,
            "Event published"
        );
        event
    }

    /// Publish one hop of a cascade at HIGH priority.
    ///
    /// A new chain is created when `chain_id` is `None` or unknown. The event
    /// is stamped with the chain id and a hop depth equal to the chain length
    /// before this hop.
    pub async fn publish_cascade(
        &self,
        event_type: EventType,
        payload: Payload,
        source: impl Into<String>,
        chain_id: Option<String>,
    ) -> Result<CascadeChain, BusError> {
        let chain_id = chain_id.unwrap_or_else(new_id);
        let mut event = Event::new(event_type, source, payload).with_priority(EventPriority::High);

        let reserved = self.inner.cascades.lock().reserve_hop(&chain_id, &mut event);
        match reserved {
            Ok(()) => {}
            Err(ReserveError::LimitExceeded { max_hops }) => {
                warn!(chain_id = %chain_id, max_hops, "Cascade hop limit reached");
                return Err(BusError::CascadeLimitExceeded { chain_id, max_hops });
            }
            Err(ReserveError::Closed) => return Err(BusError::CascadeClosed(chain_id)),
        }

        let event_id = event.id.clone();
        if let Err(e) = self.publish_event(event).await {
            self.inner.cascades.lock().release_hop(&chain_id, &event_id);
            return Err(e);
        }

        self.inner
            .cascades
            .lock()
            .get(&chain_id)
            .ok_or(BusError::CascadeClosed(chain_id))
    }

    /// Close a chain. Returns the closed chain, or `None` if it was not open.
    pub fn complete_cascade(&self, chain_id: &str) -> Option<CascadeChain> {
        let chain = self.inner.cascades.lock().complete(chain_id);
        if let Some(chain) = &chain {
            info!(
                chain_id = %chain.chain_id,
                hops = chain.total_hops(),
                "Cascade complete"
            );
        }
        chain
    }

    /// Look up an open or recently completed chain.
    #[must_use]
    pub fn get_cascade(&self, chain_id: &str) -> Option<CascadeChain> {
        self.inner.cascades.lock().get(chain_id)
    }

    // =========================================================================
    // SUBSCRIPTIONS
    // =========================================================================

    /// Register a handler for a non-empty set of event types.
    pub fn subscribe(
        &self,
        handler: Arc<dyn EventHandler>,
        event_types: impl IntoIterator<Item = EventType>,
        min_priority: EventPriority,
        predicate: Option<EventPredicate>,
    ) -> Result<SubscriptionId, SubscriptionError> {
        let subscription = Subscription::new(handler, event_types, min_priority, predicate)?;
        let types = subscription.event_types.len();
        let id = self.inner.subscriptions.write().insert(subscription);
        debug!(subscription_id = %id, event_types = types, "Subscription created");
        Ok(id)
    }

    /// Remove a subscription. Returns false if it did not exist.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let removed = self.inner.subscriptions.write().remove(subscription_id);
        if removed {
            debug!(subscription_id, "Subscription removed");
        }
        removed
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().by_id.len()
    }

    // =========================================================================
    // DEAD LETTERS
    // =========================================================================

    /// Snapshot of the dead-letter queue.
    #[must_use]
    pub fn get_dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.lock().snapshot()
    }

    /// Re-publish a dead-lettered event through the normal dispatch path.
    ///
    /// All dead-letter entries for the event are removed and the event is
    /// queued once. Returns `Ok(false)` if no entry matched.
    pub async fn retry_dead_letter(&self, event_id: &str) -> Result<bool, BusError> {
        let letters = self.inner.dead_letters.lock().take_by_event_id(event_id);
        let Some(event) = letters.first().map(|l| l.event.clone()) else {
            return Ok(false);
        };

        info!(event_id, entries = letters.len(), "Retrying dead letter");
        if let Err(e) = self.publish_event(event).await {
            self.inner.dead_letters.lock().restore(letters);
            return Err(e);
        }
        Ok(true)
    }

    /// Drop every dead letter. Returns how many were removed.
    pub fn clear_dead_letters(&self) -> usize {
        self.inner.dead_letters.lock().clear()
    }

    // =========================================================================
    // METRICS
    // =========================================================================

    /// Events waiting in the queue.
    #[must_use]
    pub fn get_queue_size(&self) -> usize {
        let sender = &self.inner.sender;
        sender.max_capacity() - sender.capacity()
    }

    /// Point-in-time counters.
    #[must_use]
    pub fn get_metrics(&self) -> BusMetrics {
        let average_latency_ms = {
            let latencies = self.inner.latencies.lock();
            if latencies.is_empty() {
                0.0
            } else {
                let total: Duration = latencies.iter().sum();
                total.as_secs_f64() * 1000.0 / latencies.len() as f64
            }
        };
        BusMetrics {
            events_published: self.inner.published.load(Ordering::Relaxed),
            events_delivered: self.inner.delivered.load(Ordering::Relaxed),
            events_failed: self.inner.failed.load(Ordering::Relaxed),
            average_latency_ms,
            queue_size: self.get_queue_size(),
            dead_letter_count: self.inner.dead_letters.lock().len(),
            subscription_count: self.subscription_count(),
            active_cascades: self.inner.cascades.lock().active_count(),
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Start the dispatch loop. Idempotent. Must be called inside a Tokio
    /// runtime.
    pub fn start(&self) {
        self.inner.accepting.store(true, Ordering::SeqCst);

        let mut dispatcher = self.inner.dispatcher.lock();
        if dispatcher.is_some() {
            return;
        }
        let Some(receiver) = self.inner.receiver.lock().take() else {
            warn!("Event bus queue receiver unavailable, dispatch not started");
            return;
        };

        let token = CancellationToken::new();
        let handle = tokio::spawn(dispatch_loop(
            Arc::downgrade(&self.inner),
            receiver,
            token.clone(),
        ));
        *dispatcher = Some(Dispatcher { handle, token });
        info!(
            queue_size = self.get_queue_size(),
            "Event bus dispatch started"
        );
    }

    /// Returns true while the dispatch loop runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.dispatcher.lock().is_some()
    }

    /// Stop accepting events, drain for up to `timeout`, then cancel the
    /// dispatch loop. Idempotent.
    ///
    /// Returns the number of events left in the queue. They stay queued and
    /// are dispatched by the next `start`.
    pub async fn stop(&self, timeout: Duration) -> usize {
        self.inner.accepting.store(false, Ordering::SeqCst);

        let dispatcher = self.inner.dispatcher.lock().take();
        let Some(dispatcher) = dispatcher else {
            return self.get_queue_size();
        };

        let deadline = Instant::now() + timeout;
        loop {
            let drained = self.inner.drained.notified();
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                break;
            }
        }

        dispatcher.token.cancel();
        match dispatcher.handle.await {
            Ok(receiver) => *self.inner.receiver.lock() = Some(receiver),
            Err(e) => error!(error = %e, "Event bus dispatch loop failed"),
        }

        let remaining = self.get_queue_size();
        if remaining > 0 {
            warn!(remaining, "Event bus stopped before draining, events left queued");
        } else {
            info!("Event bus stopped");
        }
        remaining
    }
}

impl BusInner {
    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn deliver(&self, event: Arc<Event>) {
        let matches = self.subscriptions.read().matching(&event);
        if matches.is_empty() {
            debug!(event_id = %event.id, event_type = %event.event_type, "No subscribers");
        } else {
            join_all(
                matches
                    .into_iter()
                    .map(|subscription| self.deliver_to(subscription, Arc::clone(&event))),
            )
            .await;
        }
        self.finish_one();
    }

    async fn deliver_to(&self, subscription: Arc<Subscription>, event: Arc<Event>) {
        let attempts = self.config.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let started = Instant::now();
            let call = AssertUnwindSafe(subscription.handler.handle(Arc::clone(&event)))
                .catch_unwind();

            match tokio::time::timeout(self.config.delivery_timeout, call).await {
                Ok(Ok(Ok(()))) => {
                    self.latencies.lock().push(started.elapsed());
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Ok(Ok(Err(e))) => last_error = e.to_string(),
                Ok(Err(_)) => last_error = "handler panicked".to_string(),
                Err(_) => {
                    last_error = format!(
                        "delivery timed out after {}ms",
                        self.config.delivery_timeout.as_millis()
                    );
                }
            }

            debug!(
                event_id = %event.id,
                subscription_id = %subscription.id,
                attempt,
                error = %last_error,
                "Delivery attempt failed"
            );
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay * attempt).await;
            }
        }

        self.failed.fetch_add(1, Ordering::Relaxed);
        warn!(
            event_id = %event.id,
            event_type = %event.event_type,
            subscription_id = %subscription.id,
            attempts,
            error = %last_error,
            "Delivery exhausted retries, moved to dead-letter queue"
        );
        self.dead_letters.lock().push(DeadLetter {
            event: (*event).clone(),
            subscription_id: subscription.id.clone(),
            error: last_error,
            attempts,
            failed_at: Utc::now(),
        });
    }
}

/// Pops events in publish order and hands each to its own delivery task.
/// Returns the receiver so a later `start` can resume.
async fn dispatch_loop(
    inner: Weak<BusInner>,
    mut receiver: mpsc::Receiver<Arc<Event>>,
    token: CancellationToken,
) -> mpsc::Receiver<Arc<Event>> {
    loop {
        let event = tokio::select! {
            biased;
            () = token.cancelled() => break,
            next = receiver.recv() => match next {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        tokio::spawn(async move { inner.deliver(event).await });
    }
    receiver
}
