//! # Overlay Instance
//!
//! A registered overlay plus its lifecycle state and counters. [`run`] is the
//! only way work reaches [`Overlay::execute`]:
//!
//! 1. reject if uninitialized or not ACTIVE
//! 2. reject if a required capability was not granted
//! 3. run under the budget's deadline, the caller's cancellation token and a
//!    panic guard
//! 4. record counters and last error
//!
//! Every outcome, including rejections, comes back as an [`OverlayResult`].
//!
//! [`run`]: OverlayInstance::run

use crate::context::OverlayContext;
use crate::errors::{ErrorKind, OverlayError};
use crate::manifest::OverlayManifest;
use crate::overlay::Overlay;
use crate::result::OverlayResult;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use shared_bus::Event;
use shared_types::{new_id, OverlayState, Payload};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Counters kept for the life of an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceStats {
    /// Calls to `run`, including rejected ones.
    pub execution_count: u64,
    /// Calls that did not succeed.
    pub error_count: u64,
    /// Most recent failure message.
    pub last_error: Option<String>,
    /// When `run` last finished.
    pub last_execution_at: Option<DateTime<Utc>>,
    /// Sum of run durations.
    pub total_duration: Duration,
}

/// Instance-level health: the overlay's own report plus lifecycle facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayHealth {
    pub overlay_id: String,
    pub overlay_name: String,
    pub state: OverlayState,
    /// Exactly what the overlay reported, or false if it failed to report.
    pub healthy: bool,
    pub message: Option<String>,
    pub execution_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// A running overlay owned by the registry.
pub struct OverlayInstance {
    id: String,
    overlay: Arc<dyn Overlay>,
    state: RwLock<OverlayState>,
    initialized: AtomicBool,
    stats: Mutex<InstanceStats>,
}

impl OverlayInstance {
    /// Wrap an overlay in the REGISTERED state.
    pub fn new(overlay: Arc<dyn Overlay>) -> Self {
        Self {
            id: new_id(),
            overlay,
            state: RwLock::new(OverlayState::Registered),
            initialized: AtomicBool::new(false),
            stats: Mutex::new(InstanceStats::default()),
        }
    }

    /// Instance id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Overlay name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.overlay.manifest().name
    }

    #[must_use]
    pub fn manifest(&self) -> &OverlayManifest {
        self.overlay.manifest()
    }

    #[must_use]
    pub fn state(&self) -> OverlayState {
        *self.state.read()
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> InstanceStats {
        self.stats.lock().clone()
    }

    fn set_state(&self, state: OverlayState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(overlay = %self.name(), from = %previous, to = %state, "Overlay state changed");
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Run the overlay's `initialize` once and become ACTIVE.
    ///
    /// Idempotent: a second call on an initialized instance is a no-op.
    pub async fn initialize(&self) -> Result<(), OverlayError> {
        if self.is_initialized() {
            return Ok(());
        }
        self.set_state(OverlayState::Initializing);

        let outcome = AssertUnwindSafe(self.overlay.initialize())
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(OverlayError::Panicked(self.name().to_string())));

        match outcome {
            Ok(()) => {
                self.initialized.store(true, Ordering::SeqCst);
                self.set_state(OverlayState::Active);
                info!(overlay = %self.name(), instance_id = %self.id, "Overlay initialized");
                Ok(())
            }
            Err(e) => {
                self.set_state(OverlayState::Error);
                let error = match e {
                    OverlayError::InitializationFailed(_) => e,
                    other => OverlayError::InitializationFailed(other.to_string()),
                };
                self.stats.lock().last_error = Some(error.to_string());
                warn!(overlay = %self.name(), error = %error, "Overlay initialization failed");
                Err(error)
            }
        }
    }

    /// INACTIVE → ACTIVE. Requires a successful `initialize`.
    pub fn activate(&self) -> Result<(), OverlayError> {
        if !self.is_initialized() {
            return Err(OverlayError::NotInitialized(self.name().to_string()));
        }
        match self.state() {
            OverlayState::Active | OverlayState::Inactive => {
                self.set_state(OverlayState::Active);
                Ok(())
            }
            state => Err(OverlayError::NotActive {
                overlay: self.name().to_string(),
                state,
            }),
        }
    }

    /// ACTIVE → INACTIVE. Returns false if the instance was not ACTIVE.
    pub fn deactivate(&self) -> bool {
        let mut state = self.state.write();
        if *state == OverlayState::Active {
            *state = OverlayState::Inactive;
            true
        } else {
            false
        }
    }

    /// Best-effort teardown bounded by `timeout`. Never fails.
    pub async fn cleanup(&self, timeout: Duration) {
        let teardown = AssertUnwindSafe(self.overlay.cleanup()).catch_unwind();
        match tokio::time::timeout(timeout, teardown).await {
            Ok(Ok(())) => debug!(overlay = %self.name(), "Overlay cleaned up"),
            Ok(Err(_)) => warn!(overlay = %self.name(), "Overlay cleanup panicked"),
            Err(_) => warn!(overlay = %self.name(), ?timeout, "Overlay cleanup timed out"),
        }
        self.initialized.store(false, Ordering::SeqCst);
        self.set_state(OverlayState::Stopped);
    }

    /// Ask the overlay for its health, treating silence past `bound` or a
    /// panic as unhealthy.
    pub async fn health_check(&self, bound: Duration) -> OverlayHealth {
        let probe = AssertUnwindSafe(self.overlay.health_check()).catch_unwind();
        let (healthy, message) = match tokio::time::timeout(bound, probe).await {
            Ok(Ok(report)) => (report.healthy, report.message),
            Ok(Err(_)) => (false, Some("health check panicked".to_string())),
            Err(_) => (
                false,
                Some(format!("health check timed out after {}ms", bound.as_millis())),
            ),
        };
        let stats = self.stats();
        OverlayHealth {
            overlay_id: self.id.clone(),
            overlay_name: self.name().to_string(),
            state: self.state(),
            healthy,
            message,
            execution_count: stats.execution_count,
            error_count: stats.error_count,
            last_error: stats.last_error,
            checked_at: Utc::now(),
        }
    }

    // =========================================================================
    // EXECUTION
    // =========================================================================

    /// Execute the overlay behind every guard. Never returns an error.
    pub async fn run(
        &self,
        ctx: &OverlayContext,
        event: Option<&Event>,
        input: &Payload,
    ) -> OverlayResult {
        let started = Instant::now();
        let outcome = match self.admit(ctx) {
            Ok(()) => self.execute_guarded(ctx, event, input).await,
            Err(e) => Err(e),
        };

        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => OverlayResult::from_error(&e),
        };
        if !result.success && result.error_kind.is_none() {
            result.error_kind = Some(ErrorKind::Execution);
        }
        result.duration = started.elapsed();
        result.completed_at = Utc::now();

        self.record(&result);
        result
    }

    fn admit(&self, ctx: &OverlayContext) -> Result<(), OverlayError> {
        if !self.is_initialized() {
            return Err(OverlayError::NotInitialized(self.name().to_string()));
        }
        let state = self.state();
        if !state.accepts_work() {
            return Err(OverlayError::NotActive {
                overlay: self.name().to_string(),
                state,
            });
        }
        let missing = self
            .manifest()
            .required_capabilities
            .missing_from(&ctx.capabilities);
        if !missing.is_empty() {
            return Err(OverlayError::MissingCapabilities {
                overlay: self.name().to_string(),
                missing,
            });
        }
        if ctx.fuel_budget.is_exhausted() {
            return Err(OverlayError::FuelExhausted {
                required: 1,
                remaining: ctx.fuel_budget.remaining(),
            });
        }
        Ok(())
    }

    async fn execute_guarded(
        &self,
        ctx: &OverlayContext,
        event: Option<&Event>,
        input: &Payload,
    ) -> Result<OverlayResult, OverlayError> {
        let deadline = if ctx.fuel_budget.timeout.is_zero() {
            self.manifest().default_fuel.timeout
        } else {
            ctx.fuel_budget.timeout
        };
        let work = AssertUnwindSafe(self.overlay.execute(ctx, event, input)).catch_unwind();

        tokio::select! {
            biased;
            () = ctx.cancellation.cancelled() => Err(OverlayError::Cancelled),
            outcome = tokio::time::timeout(deadline, work) => match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(OverlayError::Panicked(self.name().to_string())),
                Err(_) => Err(OverlayError::Timeout {
                    overlay: self.name().to_string(),
                    timeout: deadline,
                }),
            },
        }
    }

    fn record(&self, result: &OverlayResult) {
        {
            let mut stats = self.stats.lock();
            stats.execution_count += 1;
            stats.total_duration += result.duration;
            stats.last_execution_at = Some(result.completed_at);
            if !result.success {
                stats.error_count += 1;
                stats.last_error = result.error.clone();
            }
        }
        if result.success {
            debug!(
                overlay = %self.name(),
                duration_ms = result.duration.as_millis() as u64,
                "Overlay run succeeded"
            );
        } else {
            debug!(
                overlay = %self.name(),
                kind = ?result.error_kind,
                error = result.error.as_deref().unwrap_or_default(),
                "Overlay run failed"
            );
        }
    }
}

impl std::fmt::Debug for OverlayInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayInstance")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}
