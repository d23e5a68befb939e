//! # Test Doubles
//!
//! [`ScriptedOverlay`] does whatever it is told and counts how often it was
//! asked. Enabled by the `testing` feature for downstream crates.

use crate::context::OverlayContext;
use crate::errors::OverlayError;
use crate::manifest::OverlayManifest;
use crate::overlay::{HealthReport, Overlay};
use crate::result::OverlayResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use shared_bus::{Event, EventType};
use shared_types::{Capability, FuelBudget, Payload, TrustLevel};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// What `execute` does.
#[derive(Debug, Clone)]
pub enum ScriptedBehavior {
    /// Return the configured output.
    Succeed,
    /// Return `Err(OverlayError::Execution(msg))`.
    Fail(String),
    /// Sleep, then return the configured output.
    Sleep(Duration),
    /// Panic.
    Panic,
}

/// A configurable overlay double.
pub struct ScriptedOverlay {
    manifest: OverlayManifest,
    behavior: Mutex<ScriptedBehavior>,
    output: Mutex<Payload>,
    emits: Mutex<Vec<EventType>>,
    fail_initialize: bool,
    healthy: AtomicBool,
    invocations: AtomicU32,
    init_calls: AtomicU32,
    cleanup_calls: AtomicU32,
    seen_events: Mutex<Vec<EventType>>,
    last_input: Mutex<Option<Payload>>,
}

impl ScriptedOverlay {
    /// An overlay that always succeeds with an empty output.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            manifest: OverlayManifest::new(name, "0.1.0"),
            behavior: Mutex::new(ScriptedBehavior::Succeed),
            output: Mutex::new(Payload::new()),
            emits: Mutex::new(Vec::new()),
            fail_initialize: false,
            healthy: AtomicBool::new(true),
            invocations: AtomicU32::new(0),
            init_calls: AtomicU32::new(0),
            cleanup_calls: AtomicU32::new(0),
            seen_events: Mutex::new(Vec::new()),
            last_input: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_behavior(self, behavior: ScriptedBehavior) -> Self {
        *self.behavior.lock() = behavior;
        self
    }

    /// Output returned on success.
    #[must_use]
    pub fn with_output(self, output: Payload) -> Self {
        *self.output.lock() = output;
        self
    }

    #[must_use]
    pub fn subscribing(mut self, events: impl IntoIterator<Item = EventType>) -> Self {
        self.manifest = self.manifest.subscribes_to(events);
        self
    }

    #[must_use]
    pub fn requiring(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.manifest = self.manifest.requires(capabilities);
        self
    }

    #[must_use]
    pub fn with_min_trust(mut self, level: TrustLevel) -> Self {
        self.manifest = self.manifest.with_min_trust(level);
        self
    }

    #[must_use]
    pub fn with_fuel(mut self, budget: FuelBudget) -> Self {
        self.manifest = self.manifest.with_fuel(budget);
        self
    }

    /// Ask the caller to publish `event_type` after every successful run.
    #[must_use]
    pub fn emitting(self, event_type: EventType) -> Self {
        self.emits.lock().push(event_type);
        self
    }

    #[must_use]
    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    pub fn set_behavior(&self, behavior: ScriptedBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Calls that reached `execute`.
    #[must_use]
    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn init_calls(&self) -> u32 {
        self.init_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn cleanup_calls(&self) -> u32 {
        self.cleanup_calls.load(Ordering::SeqCst)
    }

    /// Types of the triggering events seen so far.
    #[must_use]
    pub fn seen_events(&self) -> Vec<EventType> {
        self.seen_events.lock().clone()
    }

    #[must_use]
    pub fn last_input(&self) -> Option<Payload> {
        self.last_input.lock().clone()
    }
}

#[async_trait]
impl Overlay for ScriptedOverlay {
    fn manifest(&self) -> &OverlayManifest {
        &self.manifest
    }

    async fn initialize(&self) -> Result<(), OverlayError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_initialize {
            return Err(OverlayError::InitializationFailed("scripted".into()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        _ctx: &OverlayContext,
        event: Option<&Event>,
        input: &Payload,
    ) -> Result<OverlayResult, OverlayError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Some(event) = event {
            self.seen_events.lock().push(event.event_type);
        }
        *self.last_input.lock() = Some(input.clone());

        let behavior = self.behavior.lock().clone();
        match behavior {
            ScriptedBehavior::Succeed => {}
            ScriptedBehavior::Fail(message) => return Err(OverlayError::Execution(message)),
            ScriptedBehavior::Sleep(duration) => tokio::time::sleep(duration).await,
            ScriptedBehavior::Panic => panic!("scripted overlay {} panicked", self.manifest.name),
        }

        let output = self.output.lock().clone();
        let emits = self.emits.lock().clone();
        Ok(emits
            .into_iter()
            .fold(OverlayResult::ok(output), |result, ty| result.emit(ty, Payload::new())))
    }

    async fn cleanup(&self) {
        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn health_check(&self) -> HealthReport {
        if self.healthy.load(Ordering::SeqCst) {
            HealthReport::healthy()
        } else {
            HealthReport::unhealthy("scripted unhealthy")
        }
    }
}
