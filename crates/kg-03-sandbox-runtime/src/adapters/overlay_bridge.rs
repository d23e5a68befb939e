//! # Overlay Bridge
//!
//! Runs a sandbox instance behind the overlay contract, so sandboxed code can
//! be registered with the overlay manager and scheduled by the pipeline like
//! any in-process overlay.

use crate::domain::{ExecutionState, SandboxManifest, SecurityMode};
use crate::errors::SandboxError;
use crate::ports::SandboxModule;
use crate::service::{ExecuteOptions, SandboxRuntime};
use async_trait::async_trait;
use kg_01_overlay_contract::{HealthReport, Overlay, OverlayContext, OverlayError, OverlayManifest, OverlayResult};
use parking_lot::Mutex;
use serde_json::json;
use shared_bus::{Event, EventType};
use shared_types::{FuelBudget, Payload, TrustLevel};
use std::sync::Arc;
use tracing::debug;

/// An overlay whose `execute` calls one exported function of a sandbox
/// instance.
///
/// The triggering event, if any, is passed to the function under the `event`
/// key of its input.
pub struct SandboxedOverlay {
    runtime: Arc<SandboxRuntime>,
    manifest: OverlayManifest,
    sandbox_manifest: SandboxManifest,
    module: Arc<dyn SandboxModule>,
    mode: SecurityMode,
    entrypoint: String,
    budget: Option<FuelBudget>,
    instance_id: Mutex<Option<String>>,
}

impl SandboxedOverlay {
    /// The overlay requires exactly the capabilities the sandbox declares.
    pub fn new(
        runtime: Arc<SandboxRuntime>,
        sandbox_manifest: SandboxManifest,
        module: Arc<dyn SandboxModule>,
        mode: SecurityMode,
        entrypoint: impl Into<String>,
    ) -> Self {
        let manifest = OverlayManifest::new(&sandbox_manifest.name, &sandbox_manifest.version)
            .requires(sandbox_manifest.capabilities.iter())
            .with_min_trust(TrustLevel::Sandbox);
        Self {
            runtime,
            manifest,
            sandbox_manifest,
            module,
            mode,
            entrypoint: entrypoint.into(),
            budget: None,
            instance_id: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn subscribing(mut self, events: impl IntoIterator<Item = EventType>) -> Self {
        self.manifest = self.manifest.subscribes_to(events);
        self
    }

    #[must_use]
    pub fn with_min_trust(mut self, level: TrustLevel) -> Self {
        self.manifest = self.manifest.with_min_trust(level);
        self
    }

    /// Instance budget; the runtime default otherwise.
    #[must_use]
    pub fn with_budget(mut self, budget: FuelBudget) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Id of the loaded instance.
    #[must_use]
    pub fn instance_id(&self) -> Option<String> {
        self.instance_id.lock().clone()
    }

    /// Reload the instance after a failure or fuel exhaustion.
    pub fn reload(&self) -> Result<(), SandboxError> {
        let id = self
            .instance_id()
            .ok_or_else(|| SandboxError::InstanceNotFound(self.sandbox_manifest.name.clone()))?;
        self.runtime.reload(&id)
    }
}

fn to_overlay_error(overlay: &str, error: SandboxError) -> OverlayError {
    match error {
        SandboxError::Security(msg) => OverlayError::Security(msg),
        e @ SandboxError::CapabilityNotPermitted { .. } => OverlayError::Security(e.to_string()),
        SandboxError::FuelExhausted {
            required,
            remaining,
        } => OverlayError::FuelExhausted {
            required,
            remaining,
        },
        SandboxError::MemoryLimitExceeded { size, limit } => {
            OverlayError::MemoryLimitExceeded { size, limit }
        }
        SandboxError::Timeout(timeout) => OverlayError::Timeout {
            overlay: overlay.to_string(),
            timeout,
        },
        SandboxError::Cancelled => OverlayError::Cancelled,
        SandboxError::Panicked => OverlayError::Panicked(overlay.to_string()),
        SandboxError::InstanceNotFound(_) => OverlayError::NotInitialized(overlay.to_string()),
        other => OverlayError::Execution(other.to_string()),
    }
}

#[async_trait]
impl Overlay for SandboxedOverlay {
    fn manifest(&self) -> &OverlayManifest {
        &self.manifest
    }

    async fn initialize(&self) -> Result<(), OverlayError> {
        if let Some(id) = self.instance_id() {
            if self.runtime.state(&id).is_some() {
                return Ok(());
            }
        }
        let budget = self
            .budget
            .clone()
            .unwrap_or_else(|| self.runtime.default_budget());
        let id = self
            .runtime
            .load_with_budget(
                self.sandbox_manifest.clone(),
                Arc::clone(&self.module),
                self.mode,
                budget,
            )
            .map_err(|e| match e {
                SandboxError::Security(_) | SandboxError::CapabilityNotPermitted { .. } => {
                    to_overlay_error(&self.manifest.name, e)
                }
                other => OverlayError::InitializationFailed(other.to_string()),
            })?;
        *self.instance_id.lock() = Some(id);
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &OverlayContext,
        event: Option<&Event>,
        input: &Payload,
    ) -> Result<OverlayResult, OverlayError> {
        let id = self
            .instance_id()
            .ok_or_else(|| OverlayError::NotInitialized(self.manifest.name.clone()))?;

        let mut call_input = input.clone();
        if let Some(event) = event {
            call_input.insert(
                "event".into(),
                serde_json::to_value(event).unwrap_or_else(|_| json!(null)),
            );
        }
        let options = ExecuteOptions {
            fuel_limit: Some(ctx.fuel_budget.remaining()),
            cancellation: Some(ctx.cancellation.clone()),
        };

        let outcome = self
            .runtime
            .execute_with(&id, &self.entrypoint, call_input, options)
            .await
            .map_err(|e| to_overlay_error(&self.manifest.name, e))?;
        debug!(
            overlay = %self.manifest.name,
            fuel = outcome.fuel_consumed,
            "Sandboxed overlay call completed"
        );

        let mut result = OverlayResult::ok(outcome.output);
        result.fuel_consumed = outcome.fuel_consumed;
        Ok(result)
    }

    async fn cleanup(&self) {
        if let Some(id) = self.instance_id.lock().take() {
            self.runtime.terminate(&id);
        }
    }

    async fn health_check(&self) -> HealthReport {
        let Some(id) = self.instance_id() else {
            return HealthReport::unhealthy("sandbox instance not loaded");
        };
        match self.runtime.instance_summary(&id) {
            None => HealthReport::unhealthy("sandbox instance terminated"),
            Some(summary) if summary.state == ExecutionState::Failed => HealthReport::unhealthy(
                summary
                    .last_error
                    .unwrap_or_else(|| "sandbox instance failed".into()),
            ),
            Some(summary) if summary.fuel_remaining == 0 => {
                HealthReport::unhealthy("sandbox fuel exhausted")
            }
            Some(_) => HealthReport::healthy(),
        }
    }
}
