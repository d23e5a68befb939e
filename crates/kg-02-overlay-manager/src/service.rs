//! # Overlay Manager Service
//!
//! Owns the running overlay instances, indexes them by name and by subscribed
//! event type, executes them behind per-instance circuit breakers and routes
//! bus events to every interested, healthy overlay.
//!
//! ## Shared State
//!
//! | Structure | Lock | Mutated by |
//! |-----------|------|------------|
//! | registry indices (instances, by name, by event) | one `RwLock` | register, unregister |
//! | circuit breakers | `CircuitBreakers` internal `Mutex` | every execution |
//! | execution history | `Mutex` | every execution |
//! | routing shutdown token | `Mutex` | start, stop |
//!
//! No lock is held across an `.await`.

use crate::domain::{
    Admission, CircuitBreakerConfig, CircuitBreakers, CircuitState, CircuitStatus, ManagerStats,
    OverlayExecutionRequest, OverlayExecutionResult, OverlaySummary,
};
use crate::errors::ManagerError;
use crate::metrics;
use chrono::Utc;
use futures::future::join_all;
use kg_01_overlay_contract::{
    EmittedEvent, Overlay, OverlayContext, OverlayError, OverlayHealth, OverlayInstance,
    OverlayResult,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_bus::{handler_fn, Event, EventBus, EventPriority, EventType, SubscriptionId};

pub use shared_bus::overlay_source;
use shared_types::{BoundedHistory, CapabilitySet, OverlayState, Payload, TrustLevel};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Source name the manager publishes under.
pub const MANAGER_SOURCE: &str = "overlay_manager";

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Overlay manager tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayManagerConfig {
    /// Consecutive failures before a circuit opens.
    pub failure_threshold: u32,
    /// Time a circuit stays open before a probe.
    pub circuit_timeout: Duration,
    /// Entries kept in the execution history.
    pub history_capacity: usize,
    /// Bound on one overlay's health report.
    pub health_check_timeout: Duration,
    /// Bound on one overlay's cleanup.
    pub cleanup_timeout: Duration,
    /// Trust level of event-driven executions.
    pub event_trust_level: TrustLevel,
}

impl Default for OverlayManagerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            circuit_timeout: Duration::from_secs(60),
            history_capacity: 1000,
            health_check_timeout: Duration::from_secs(5),
            cleanup_timeout: Duration::from_secs(5),
            event_trust_level: TrustLevel::Standard,
        }
    }
}

// =============================================================================
// REGISTRY INDICES
// =============================================================================

/// The three registry indices, always updated together.
#[derive(Default)]
struct RegistryIndex {
    instances: HashMap<String, Arc<OverlayInstance>>,
    by_name: HashMap<String, Vec<String>>,
    by_event: HashMap<EventType, Vec<String>>,
}

impl RegistryIndex {
    fn insert(&mut self, instance: Arc<OverlayInstance>) {
        let id = instance.id().to_string();
        self.by_name
            .entry(instance.name().to_string())
            .or_default()
            .push(id.clone());
        for event_type in &instance.manifest().subscribed_events {
            self.by_event.entry(*event_type).or_default().push(id.clone());
        }
        self.instances.insert(id, instance);
    }

    fn remove(&mut self, id: &str) -> Option<Arc<OverlayInstance>> {
        let instance = self.instances.remove(id)?;
        remove_from(&mut self.by_name, instance.name(), id);
        for event_type in &instance.manifest().subscribed_events {
            remove_from(&mut self.by_event, event_type, id);
        }
        Some(instance)
    }

    fn lookup<K>(&self, index: &HashMap<K, Vec<String>>, key: &K) -> Vec<Arc<OverlayInstance>>
    where
        K: std::hash::Hash + Eq,
    {
        index
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|id| self.instances.get(id).cloned())
            .collect()
    }
}

fn remove_from<K, Q>(index: &mut HashMap<K, Vec<String>>, key: &Q, id: &str)
where
    K: std::hash::Hash + Eq + std::borrow::Borrow<Q>,
    Q: std::hash::Hash + Eq + ?Sized,
{
    if let Some(ids) = index.get_mut(key) {
        ids.retain(|existing| existing != id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    circuit_rejections: AtomicU64,
}

/// Bus-triggered fan-outs running in the background.
struct Routing {
    pending: AtomicUsize,
    drained: Notify,
    shutdown: Mutex<CancellationToken>,
}

impl Routing {
    fn new() -> Self {
        Self {
            pending: AtomicUsize::new(0),
            drained: Notify::new(),
            shutdown: Mutex::new(CancellationToken::new()),
        }
    }

    fn in_flight(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait for every fan-out to finish. False if `deadline` passed first.
    async fn drained_by(&self, deadline: Instant) -> bool {
        loop {
            let drained = self.drained.notified();
            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }
}

/// Releases one background fan-out counted by `route_in_background`.
struct InFlight<'a>(&'a Routing);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

// =============================================================================
// OVERLAY MANAGER
// =============================================================================

/// Registry and execution manager for overlay instances.
pub struct OverlayManager {
    config: OverlayManagerConfig,
    bus: EventBus,
    registry: RwLock<RegistryIndex>,
    breakers: CircuitBreakers,
    history: Mutex<BoundedHistory<OverlayExecutionResult>>,
    counters: Counters,
    subscription: Mutex<Option<SubscriptionId>>,
    routing: Routing,
}

impl OverlayManager {
    /// Create a manager that publishes through `bus`.
    pub fn new(config: OverlayManagerConfig, bus: EventBus) -> Self {
        let breakers = CircuitBreakers::new(CircuitBreakerConfig {
            failure_threshold: config.failure_threshold,
            open_timeout: config.circuit_timeout,
        });
        Self {
            history: Mutex::new(BoundedHistory::new(config.history_capacity)),
            config,
            bus,
            registry: RwLock::new(RegistryIndex::default()),
            breakers,
            counters: Counters::default(),
            subscription: Mutex::new(None),
            routing: Routing::new(),
        }
    }

    /// The bus this manager publishes through.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    #[must_use]
    pub fn config(&self) -> &OverlayManagerConfig {
        &self.config
    }

    // =========================================================================
    // REGISTRATION
    // =========================================================================

    /// Initialize `overlay` and add it to every index.
    ///
    /// A failing `initialize` leaves the registry untouched.
    pub async fn register_instance(
        &self,
        overlay: Arc<dyn Overlay>,
    ) -> Result<String, ManagerError> {
        let instance = Arc::new(OverlayInstance::new(overlay));
        if let Err(source) = instance.initialize().await {
            return Err(ManagerError::Initialization {
                overlay: instance.name().to_string(),
                source,
            });
        }

        let id = instance.id().to_string();
        let registered = {
            let mut registry = self.registry.write();
            registry.insert(Arc::clone(&instance));
            registry.instances.len()
        };
        metrics::set_registered(registered);

        info!(
            overlay = %instance.name(),
            version = %instance.manifest().version,
            instance_id = %id,
            subscriptions = instance.manifest().subscribed_events.len(),
            "Overlay registered"
        );
        self.announce(EventType::OverlayRegistered, &instance);
        Ok(id)
    }

    /// Remove an instance from every index, forget its circuit and clean it
    /// up. Returns false if it was not registered.
    pub async fn unregister(&self, instance_id: &str) -> bool {
        let (removed, registered) = {
            let mut registry = self.registry.write();
            let removed = registry.remove(instance_id);
            (removed, registry.instances.len())
        };
        let Some(instance) = removed else {
            return false;
        };
        self.breakers.remove(instance_id);
        metrics::set_registered(registered);

        instance.cleanup(self.config.cleanup_timeout).await;
        info!(overlay = %instance.name(), instance_id, "Overlay unregistered");
        self.announce(EventType::OverlayDeactivated, &instance);
        true
    }

    /// INACTIVE → ACTIVE.
    pub async fn activate(&self, instance_id: &str) -> Result<(), ManagerError> {
        let instance = self.require(instance_id)?;
        instance.activate()?;
        self.announce(EventType::OverlayActivated, &instance);
        Ok(())
    }

    /// ACTIVE → INACTIVE. Returns false if it was not ACTIVE.
    pub async fn deactivate(&self, instance_id: &str) -> Result<bool, ManagerError> {
        let instance = self.require(instance_id)?;
        let changed = instance.deactivate();
        if changed {
            self.announce(EventType::OverlayDeactivated, &instance);
        }
        Ok(changed)
    }

    fn require(&self, instance_id: &str) -> Result<Arc<OverlayInstance>, ManagerError> {
        self.get_instance(instance_id)
            .ok_or_else(|| ManagerError::NotFound(instance_id.to_string()))
    }

    // =========================================================================
    // LOOKUP
    // =========================================================================

    #[must_use]
    pub fn get_instance(&self, instance_id: &str) -> Option<Arc<OverlayInstance>> {
        self.registry.read().instances.get(instance_id).cloned()
    }

    /// Every instance registered under `name`, in registration order.
    #[must_use]
    pub fn get_instances_by_name(&self, name: &str) -> Vec<Arc<OverlayInstance>> {
        let registry = self.registry.read();
        registry.lookup(&registry.by_name, &name.to_string())
    }

    /// Every instance subscribed to `event_type`.
    #[must_use]
    pub fn get_subscribers(&self, event_type: EventType) -> Vec<Arc<OverlayInstance>> {
        let registry = self.registry.read();
        registry.lookup(&registry.by_event, &event_type)
    }

    #[must_use]
    pub fn list_overlays(&self) -> Vec<OverlaySummary> {
        let instances: Vec<_> = self.registry.read().instances.values().cloned().collect();
        let mut summaries: Vec<_> = instances
            .iter()
            .map(|i| OverlaySummary {
                id: i.id().to_string(),
                name: i.name().to_string(),
                version: i.manifest().version.clone(),
                state: i.state(),
                circuit: self.breakers.state(i.id()),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    fn instances(&self) -> Vec<Arc<OverlayInstance>> {
        self.registry.read().instances.values().cloned().collect()
    }

    // =========================================================================
    // EXECUTION
    // =========================================================================

    /// Execute one instance behind its circuit breaker.
    ///
    /// Never fails: every rejection and failure is a non-success result.
    /// A request whose fuel budget is already spent is rejected before the
    /// overlay runs and does not count against its circuit.
    pub async fn execute_overlay(
        &self,
        instance_id: &str,
        request: OverlayExecutionRequest,
    ) -> OverlayExecutionResult {
        let Some(instance) = self.get_instance(instance_id) else {
            let error = OverlayError::NotFound(instance_id.to_string());
            return self.finish(OverlayExecutionResult::rejected(
                instance_id,
                "",
                request.correlation_id,
                &error,
            ));
        };
        let name = instance.name().to_string();
        let manifest = instance.manifest();

        if request.trust_level < manifest.min_trust {
            let error = OverlayError::InsufficientTrust {
                required: manifest.min_trust,
                actual: request.trust_level,
            };
            warn!(overlay = %name, error = %error, "Execution rejected");
            return self.finish(OverlayExecutionResult::rejected(
                instance_id,
                &name,
                request.correlation_id,
                &error,
            ));
        }

        if let Some(budget) = request.fuel_budget.as_ref().filter(|b| b.is_exhausted()) {
            let error = OverlayError::FuelExhausted {
                required: 1,
                remaining: budget.remaining(),
            };
            debug!(overlay = %name, "Fuel budget exhausted, execution skipped");
            return self.finish(OverlayExecutionResult::rejected(
                instance_id,
                &name,
                request.correlation_id,
                &error,
            ));
        }

        let admission = self.breakers.check(instance_id);
        if let Admission::Rejected { retry_in } = admission {
            self.counters.circuit_rejections.fetch_add(1, Ordering::Relaxed);
            metrics::record_circuit_rejection(&name);
            debug!(
                overlay = %name,
                retry_in_ms = retry_in.as_millis() as u64,
                "Circuit open, execution skipped"
            );
            return self.finish(OverlayExecutionResult::rejected(
                instance_id,
                &name,
                request.correlation_id,
                &OverlayError::CircuitOpen(name.clone()),
            ));
        }
        let mut half_open = self.breakers.hold(instance_id, admission);

        let capabilities = request
            .capabilities
            .intersection(&manifest.required_capabilities);
        let fuel_budget = request
            .fuel_budget
            .clone()
            .unwrap_or_else(|| manifest.default_fuel.clone());
        let token = request
            .cancellation
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);
        let ctx = OverlayContext::new(
            instance_id,
            &name,
            request.trust_level,
            capabilities,
            fuel_budget,
        )
        .with_correlation_id(request.correlation_id.clone())
        .with_trigger(request.triggered_by.clone())
        .with_user(request.user_id.clone())
        .with_cancellation(token);

        let started_at = Utc::now();
        let outcome = instance
            .run(&ctx, request.event.as_deref(), &request.input)
            .await;

        half_open.settle();
        self.account(instance_id, &name, admission, &outcome);
        let events_emitted = self
            .publish_emitted(&name, ctx.correlation_id.as_deref(), &outcome.events_to_emit)
            .await;

        self.finish(OverlayExecutionResult {
            execution_id: ctx.execution_id,
            overlay_id: instance_id.to_string(),
            overlay_name: name,
            success: outcome.success,
            data: outcome.data,
            error: outcome.error,
            error_kind: outcome.error_kind,
            events_emitted,
            duration: outcome.duration,
            fuel_consumed: outcome.fuel_consumed,
            correlation_id: ctx.correlation_id,
            started_at,
        })
    }

    /// Execute the first ACTIVE instance registered under `name`.
    pub async fn execute_by_name(
        &self,
        name: &str,
        request: OverlayExecutionRequest,
    ) -> OverlayExecutionResult {
        let instance = self
            .get_instances_by_name(name)
            .into_iter()
            .find(|i| i.state().accepts_work());
        match instance {
            Some(instance) => self.execute_overlay(instance.id(), request).await,
            None => self.finish(OverlayExecutionResult::rejected(
                "",
                name,
                request.correlation_id,
                &OverlayError::NotFound(name.to_string()),
            )),
        }
    }

    /// Run every ACTIVE, non-circuit-open overlay subscribed to the event's
    /// type, concurrently. Keyed by instance id.
    pub async fn execute_for_event(
        &self,
        event: Arc<Event>,
    ) -> HashMap<String, OverlayExecutionResult> {
        let template = self.event_template(&event);
        self.execute_for_event_with(&event, template).await
    }

    fn event_template(&self, event: &Arc<Event>) -> OverlayExecutionRequest {
        OverlayExecutionRequest::for_event(Arc::clone(event))
            .with_trust(self.config.event_trust_level)
            .with_capabilities(CapabilitySet::all())
    }

    /// Fan `event` out on its own task so bus delivery never waits on
    /// overlays. Tracked until it finishes; cancelled by `stop`.
    fn route_in_background(self: &Arc<Self>, event: Arc<Event>) {
        let token = self.routing.shutdown.lock().child_token();
        self.routing.pending.fetch_add(1, Ordering::SeqCst);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let _in_flight = InFlight(&manager.routing);
            let template = manager.event_template(&event).with_cancellation(token);
            manager.execute_for_event_with(&event, template).await;
        });
    }

    /// [`execute_for_event`](Self::execute_for_event) with a caller-built
    /// request template.
    pub async fn execute_for_event_with(
        &self,
        event: &Event,
        template: OverlayExecutionRequest,
    ) -> HashMap<String, OverlayExecutionResult> {
        let targets: Vec<_> = self
            .get_subscribers(event.event_type)
            .into_iter()
            .filter(|i| i.state().accepts_work())
            .filter(|i| event.is_targeted_at(i.name()))
            .filter(|i| event.source != overlay_source(i.name()))
            .filter(|i| !self.breakers.would_reject(i.id()))
            .collect();

        if targets.is_empty() {
            return HashMap::new();
        }
        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            overlays = targets.len(),
            "Routing event to overlays"
        );

        let runs = targets.iter().map(|instance| {
            let request = template.clone();
            async move {
                let result = self.execute_overlay(instance.id(), request).await;
                (instance.id().to_string(), result)
            }
        });
        join_all(runs).await.into_iter().collect()
    }

    fn account(
        &self,
        instance_id: &str,
        name: &str,
        admission: Admission,
        outcome: &OverlayResult,
    ) {
        match outcome.failure_kind() {
            None => self.breakers.record_success(instance_id),
            Some(kind) if kind.counts_as_failure() => {
                if self.breakers.record_failure(instance_id) {
                    metrics::record_circuit_opened(name);
                    let mut payload = Payload::new();
                    payload.insert("overlay_id".into(), json!(instance_id));
                    payload.insert("overlay_name".into(), json!(name));
                    payload.insert("error".into(), json!(outcome.error));
                    let event = Event::new(EventType::OverlayCircuitOpened, MANAGER_SOURCE, payload)
                        .with_priority(EventPriority::High);
                    if let Err(e) = self.bus.try_publish_event(event) {
                        warn!(error = %e, "Circuit-open event dropped");
                    }
                }
            }
            Some(_) => {
                if admission == Admission::Probe {
                    self.breakers.release_probe(instance_id);
                }
            }
        }
    }

    async fn publish_emitted(
        &self,
        overlay_name: &str,
        correlation_id: Option<&str>,
        emitted: &[EmittedEvent],
    ) -> Vec<String> {
        let mut published = Vec::with_capacity(emitted.len());
        for request in emitted {
            let mut event = Event::new(
                request.event_type,
                overlay_source(overlay_name),
                request.payload.clone(),
            )
            .with_priority(request.priority);
            event.correlation_id = correlation_id.map(str::to_string);
            event.target_overlays = request.target_overlays.clone();

            match self.bus.publish_event(event).await {
                Ok(event) => published.push(event.id.clone()),
                Err(e) => warn!(
                    overlay = %overlay_name,
                    event_type = %request.event_type,
                    error = %e,
                    "Failed to publish overlay event"
                ),
            }
        }
        published
    }

    fn finish(&self, result: OverlayExecutionResult) -> OverlayExecutionResult {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        if result.success {
            self.counters.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_execution(
            &result.overlay_name,
            result.success,
            result.duration.as_secs_f64(),
        );
        self.history.lock().push(result.clone());
        result
    }

    /// Lifecycle events are advisory and never wait on a full queue.
    fn announce(&self, event_type: EventType, instance: &OverlayInstance) {
        let mut payload = Payload::new();
        payload.insert("overlay_id".into(), json!(instance.id()));
        payload.insert("overlay_name".into(), json!(instance.name()));
        payload.insert("version".into(), json!(instance.manifest().version));
        let event = Event::new(event_type, MANAGER_SOURCE, payload);
        if let Err(e) = self.bus.try_publish_event(event) {
            debug!(event_type = %event_type, error = %e, "Lifecycle event dropped");
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Subscribe to every event type on the bus and route events to
    /// overlays. Re-initializes instances stopped by a previous `stop`.
    /// Idempotent.
    pub async fn start(self: &Arc<Self>) -> Result<(), ManagerError> {
        if self.subscription.lock().is_some() {
            return Ok(());
        }

        {
            let mut shutdown = self.routing.shutdown.lock();
            if shutdown.is_cancelled() {
                *shutdown = CancellationToken::new();
            }
        }
        for instance in self.instances() {
            if instance.state() == OverlayState::Stopped {
                if let Err(e) = instance.initialize().await {
                    warn!(overlay = %instance.name(), error = %e, "Overlay failed to restart");
                }
            }
        }

        let weak = Arc::downgrade(self);
        let handler = handler_fn(move |event: Arc<Event>| {
            let weak = weak.clone();
            async move {
                if let Some(manager) = weak.upgrade() {
                    manager.route_in_background(event);
                }
                Ok(())
            }
        });
        let id = self
            .bus
            .subscribe(handler, EventType::ALL, EventPriority::Low, None)?;

        let mut slot = self.subscription.lock();
        if slot.is_some() {
            self.bus.unsubscribe(&id);
        } else {
            *slot = Some(id);
            info!(overlays = self.registry.read().instances.len(), "Overlay manager started");
        }
        Ok(())
    }

    /// Returns true while subscribed to the bus.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Unsubscribe from the bus, let in-flight event routing finish, then
    /// clean up every instance, bounded by `timeout` overall. Routing still
    /// running at the deadline is cancelled. Idempotent.
    pub async fn stop(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let subscription = self.subscription.lock().take();
        if let Some(id) = subscription {
            self.bus.unsubscribe(&id);
        }

        if !self.routing.drained_by(deadline).await {
            warn!(
                in_flight = self.routing.in_flight(),
                "Event routing still running at shutdown, cancelling"
            );
        }
        self.routing.shutdown.lock().cancel();

        let instances: Vec<_> = self
            .instances()
            .into_iter()
            .filter(|i| i.state() != OverlayState::Stopped)
            .collect();
        let cleanups = instances
            .iter()
            .map(|i| i.cleanup(self.config.cleanup_timeout));
        if tokio::time::timeout_at(deadline, join_all(cleanups)).await.is_err() {
            warn!(?timeout, "Overlay cleanup did not finish before shutdown timeout");
        }
        info!(overlays = instances.len(), "Overlay manager stopped");
    }

    // =========================================================================
    // OBSERVABILITY
    // =========================================================================

    /// Ask every instance for its health, concurrently. Keyed by instance id.
    pub async fn health_check_all(&self) -> HashMap<String, OverlayHealth> {
        let instances = self.instances();
        let checks = instances.iter().map(|instance| async move {
            let health = instance.health_check(self.config.health_check_timeout).await;
            (instance.id().to_string(), health)
        });
        join_all(checks).await.into_iter().collect()
    }

    /// Up to `limit` most recent executions, oldest first.
    #[must_use]
    pub fn get_execution_history(&self, limit: usize) -> Vec<OverlayExecutionResult> {
        self.history.lock().recent(limit)
    }

    #[must_use]
    pub fn get_stats(&self) -> ManagerStats {
        let instances = self.instances();
        ManagerStats {
            registered_overlays: instances.len(),
            active_overlays: instances.iter().filter(|i| i.state().accepts_work()).count(),
            open_circuits: self.breakers.open_count(),
            total_executions: self.counters.total.load(Ordering::Relaxed),
            successful_executions: self.counters.successful.load(Ordering::Relaxed),
            failed_executions: self.counters.failed.load(Ordering::Relaxed),
            circuit_rejections: self.counters.circuit_rejections.load(Ordering::Relaxed),
            history_size: self.history.lock().len(),
        }
    }

    #[must_use]
    pub fn circuit_state(&self, instance_id: &str) -> CircuitState {
        self.breakers.state(instance_id)
    }

    #[must_use]
    pub fn circuit_status(&self, instance_id: &str) -> Option<CircuitStatus> {
        self.breakers.status(instance_id)
    }

    /// Manually close a circuit. Returns false if it was unknown.
    pub fn reset_circuit(&self, instance_id: &str) -> bool {
        self.breakers.reset(instance_id)
    }
}
