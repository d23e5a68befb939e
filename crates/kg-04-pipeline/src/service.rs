//! # Pipeline Service
//!
//! Drives every run through the fixed phase order. Each phase either calls a
//! custom [`PhaseHandler`] or fans out to the overlays registered for it,
//! through the overlay manager and therefore behind its circuit breakers.
//!
//! ## Phase Semantics
//!
//! | Mode | Deadline | On overlay failure |
//! |------|----------|--------------------|
//! | parallel | one deadline for the whole phase | siblings keep running |
//! | sequential | a fresh deadline per overlay | required phase stops at the first failure |
//!
//! A failed required phase halts the run. A failed optional phase becomes a
//! warning and the run continues with the data accumulated so far.
//!
//! ## Control
//!
//! Cancel and pause are observed at phase boundaries. Cancellation also
//! reaches running overlays through child tokens. A paused run waits at most
//! `max_pause` before it fails.

use crate::domain::{
    ActivePipeline, PhaseConfig, PhaseResult, PhaseStatus, PipelineContext, PipelinePhase,
    PipelineRequest, PipelineResult, PipelineStats, PipelineStatus,
};
use crate::errors::PipelineError;
use crate::ports::{PhaseHandler, PhaseHook};
use chrono::Utc;
use futures::future::join_all;
use kg_01_overlay_contract::{ErrorKind, OverlayInstance};
use kg_02_overlay_manager::{OverlayExecutionRequest, OverlayExecutionResult, OverlayManager};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_bus::{Event, EventBus, EventPriority, EventType};
use shared_types::{new_id, BoundedHistory, Payload};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Source name the pipeline publishes under.
pub const PIPELINE_SOURCE: &str = "pipeline";

/// Slack past a phase deadline before a still-running overlay is abandoned.
/// The overlay's own call deadline normally fires first.
const DEADLINE_GRACE: Duration = Duration::from_millis(100);

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Pipeline tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Per-phase overrides; phases not listed use their defaults.
    pub phases: BTreeMap<PipelinePhase, PhaseConfig>,
    /// Completed runs kept in history.
    pub history_capacity: usize,
    /// Longest a run may stay paused.
    pub max_pause: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            phases: PipelinePhase::ALL
                .iter()
                .map(|p| (*p, p.default_config()))
                .collect(),
            history_capacity: 100,
            max_pause: Duration::from_secs(300),
        }
    }
}

impl PipelineConfig {
    /// Effective configuration of `phase`.
    #[must_use]
    pub fn phase(&self, phase: PipelinePhase) -> PhaseConfig {
        self.phases
            .get(&phase)
            .cloned()
            .unwrap_or_else(|| phase.default_config())
    }

    #[must_use]
    pub fn with_phase(mut self, phase: PipelinePhase, config: PhaseConfig) -> Self {
        self.phases.insert(phase, config);
        self
    }

    #[must_use]
    pub fn with_max_pause(mut self, max_pause: Duration) -> Self {
        self.max_pause = max_pause;
        self
    }
}

// =============================================================================
// RUN CONTROL
// =============================================================================

struct RunState {
    status: PipelineStatus,
    current_phase: Option<PipelinePhase>,
}

/// Handle on one in-flight run, shared with cancel/pause/resume callers.
struct RunControl {
    token: CancellationToken,
    paused: watch::Sender<bool>,
    state: Mutex<RunState>,
    triggered_by: Option<String>,
    started_at: chrono::DateTime<Utc>,
}

impl RunControl {
    fn new(ctx: &PipelineContext) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            token: ctx.cancellation.clone(),
            paused,
            state: Mutex::new(RunState {
                status: PipelineStatus::Pending,
                current_phase: None,
            }),
            triggered_by: ctx.triggered_by.clone(),
            started_at: ctx.started_at,
        }
    }

    fn set_status(&self, status: PipelineStatus) {
        self.state.lock().status = status;
    }

    fn set_phase(&self, phase: PipelinePhase) {
        self.state.lock().current_phase = Some(phase);
    }

    fn is_pause_requested(&self) -> bool {
        *self.paused.borrow()
    }

    fn snapshot(&self, pipeline_id: &str) -> ActivePipeline {
        let state = self.state.lock();
        ActivePipeline {
            pipeline_id: pipeline_id.to_string(),
            status: state.status,
            current_phase: state.current_phase,
            triggered_by: self.triggered_by.clone(),
            started_at: self.started_at,
        }
    }
}

/// Removes a run from the active table however `execute` ends.
struct ActiveGuard<'a> {
    active: &'a RwLock<HashMap<String, Arc<RunControl>>>,
    pipeline_id: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.write().remove(&self.pipeline_id);
    }
}

/// Work done by one phase body, before it becomes a [`PhaseResult`].
#[derive(Default)]
struct PhaseOutcome {
    data: Payload,
    overlay_results: Vec<OverlayExecutionResult>,
    errors: Vec<String>,
    attempts: u32,
}

impl PhaseOutcome {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            errors: vec![error.into()],
            ..Self::default()
        }
    }

    /// Fold one overlay's final attempt in, merging successful output into
    /// the run's data.
    fn absorb(
        &mut self,
        ctx: &mut PipelineContext,
        result: OverlayExecutionResult,
        attempts: u32,
    ) {
        self.attempts = self.attempts.max(attempts);
        ctx.consume_fuel(result.fuel_consumed);
        if result.success {
            ctx.merge(&result.data);
            for (key, value) in &result.data {
                self.data.insert(key.clone(), value.clone());
            }
        } else {
            self.errors.push(format!(
                "{}: {}",
                result.overlay_name,
                result.error.as_deref().unwrap_or("unknown error")
            ));
        }
        self.overlay_results.push(result);
    }
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

// =============================================================================
// PIPELINE
// =============================================================================

/// The seven-phase scheduler.
pub struct Pipeline {
    config: PipelineConfig,
    manager: Arc<OverlayManager>,
    bus: EventBus,
    phase_overlays: RwLock<BTreeMap<PipelinePhase, Vec<String>>>,
    handlers: RwLock<HashMap<PipelinePhase, Arc<dyn PhaseHandler>>>,
    hooks: RwLock<Vec<Arc<dyn PhaseHook>>>,
    active: RwLock<HashMap<String, Arc<RunControl>>>,
    history: Mutex<BoundedHistory<PipelineResult>>,
    counters: Counters,
}

impl Pipeline {
    /// Create a pipeline that executes through `manager` and publishes on
    /// the manager's bus.
    pub fn new(config: PipelineConfig, manager: Arc<OverlayManager>) -> Self {
        let bus = manager.bus().clone();
        Self {
            history: Mutex::new(BoundedHistory::new(config.history_capacity)),
            config,
            manager,
            bus,
            phase_overlays: RwLock::new(BTreeMap::new()),
            handlers: RwLock::new(HashMap::new()),
            hooks: RwLock::new(Vec::new()),
            active: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<OverlayManager> {
        &self.manager
    }

    // =========================================================================
    // REGISTRATION
    // =========================================================================

    /// Run every ACTIVE instance named `overlay_name` during `phase`.
    ///
    /// Returns false if it was already registered for the phase.
    pub fn register_phase_overlay(&self, phase: PipelinePhase, overlay_name: &str) -> bool {
        let mut table = self.phase_overlays.write();
        let names = table.entry(phase).or_default();
        if names.iter().any(|n| n == overlay_name) {
            return false;
        }
        names.push(overlay_name.to_string());
        debug!(phase = %phase, overlay = %overlay_name, "Overlay registered for phase");
        true
    }

    pub fn unregister_phase_overlay(&self, phase: PipelinePhase, overlay_name: &str) -> bool {
        let mut table = self.phase_overlays.write();
        let Some(names) = table.get_mut(&phase) else {
            return false;
        };
        let before = names.len();
        names.retain(|n| n != overlay_name);
        let removed = names.len() != before;
        if names.is_empty() {
            table.remove(&phase);
        }
        removed
    }

    /// Overlay names registered for `phase`, in registration order.
    #[must_use]
    pub fn phase_overlays(&self, phase: PipelinePhase) -> Vec<String> {
        self.phase_overlays
            .read()
            .get(&phase)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace the default overlay fan-out of `phase`. Returns the previous
    /// handler.
    pub fn register_handler(
        &self,
        phase: PipelinePhase,
        handler: Arc<dyn PhaseHandler>,
    ) -> Option<Arc<dyn PhaseHandler>> {
        self.handlers.write().insert(phase, handler)
    }

    pub fn remove_handler(&self, phase: PipelinePhase) -> bool {
        self.handlers.write().remove(&phase).is_some()
    }

    pub fn add_hook(&self, hook: Arc<dyn PhaseHook>) {
        self.hooks.write().push(hook);
    }

    // =========================================================================
    // EXECUTION
    // =========================================================================

    /// Run the pipeline to a terminal status. Never fails: every outcome,
    /// cancellation included, is a [`PipelineResult`].
    ///
    /// A preset pipeline id that is already running is rejected before
    /// admission: the returned result is `Failed` and nothing is counted,
    /// recorded in history or published.
    pub async fn execute(&self, request: PipelineRequest) -> PipelineResult {
        let mut ctx = PipelineContext::new(request, CancellationToken::new());
        let control = Arc::new(RunControl::new(&ctx));
        {
            let mut active = self.active.write();
            if active.contains_key(&ctx.pipeline_id) {
                warn!(pipeline_id = %ctx.pipeline_id, "Pipeline id already running");
                let error = format!("pipeline {} is already running", ctx.pipeline_id);
                return self.result(
                    ctx,
                    PipelineStatus::Failed,
                    vec![error],
                    Vec::new(),
                    Duration::ZERO,
                );
            }
            active.insert(ctx.pipeline_id.clone(), Arc::clone(&control));
        }
        let _guard = ActiveGuard {
            active: &self.active,
            pipeline_id: ctx.pipeline_id.clone(),
        };

        self.counters.total.fetch_add(1, Ordering::Relaxed);
        control.set_status(PipelineStatus::Running);
        info!(
            pipeline_id = %ctx.pipeline_id,
            triggered_by = ?ctx.triggered_by,
            "Pipeline started"
        );
        self.announce(
            EventType::PipelineStarted,
            json!({
                "pipeline_id": ctx.pipeline_id,
                "triggered_by": ctx.triggered_by,
                "user_id": ctx.user_id,
            }),
            EventPriority::Normal,
            &ctx.correlation_id,
        );

        let started = Instant::now();
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let status = self
            .run_phases(&mut ctx, &control, &mut errors, &mut warnings)
            .await;

        let result = self.result(ctx, status, errors, warnings, started.elapsed());
        self.finish(&result);
        result
    }

    async fn run_phases(
        &self,
        ctx: &mut PipelineContext,
        control: &RunControl,
        errors: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) -> PipelineStatus {
        for phase in PipelinePhase::ALL {
            match self.checkpoint(control).await {
                Ok(()) => {}
                Err(PipelineError::Cancelled) => return PipelineStatus::Cancelled,
                Err(e) => {
                    error!(
                        pipeline_id = %ctx.pipeline_id,
                        error = %e,
                        "Pipeline stopped while paused"
                    );
                    errors.push(e.to_string());
                    return PipelineStatus::Failed;
                }
            }

            let config = self.config.phase(phase);
            if !config.enabled || ctx.skip_phases.contains(&phase) {
                debug!(pipeline_id = %ctx.pipeline_id, phase = %phase, "Phase skipped");
                ctx.phase_results.push(PhaseResult::skipped(phase));
                continue;
            }

            ctx.current_phase = Some(phase);
            control.set_phase(phase);
            let result = self.run_phase(phase, &config, ctx).await;
            self.after_phase(ctx, &result).await;
            self.announce(
                EventType::PipelinePhaseComplete,
                json!({
                    "pipeline_id": ctx.pipeline_id,
                    "phase": phase,
                    "status": result.status,
                    "duration_ms": result.duration.as_millis() as u64,
                }),
                EventPriority::Low,
                &ctx.correlation_id,
            );
            let failure = (result.status == PhaseStatus::Failed)
                .then(|| format!("phase {phase} failed: {}", result.errors.join("; ")));
            ctx.phase_results.push(result);

            if ctx.is_cancelled() {
                return PipelineStatus::Cancelled;
            }
            if let Some(message) = failure {
                if config.required {
                    error!(
                        pipeline_id = %ctx.pipeline_id,
                        phase = %phase,
                        error = %message,
                        "Required phase failed"
                    );
                    errors.push(message);
                    return PipelineStatus::Failed;
                }
                warn!(
                    pipeline_id = %ctx.pipeline_id,
                    phase = %phase,
                    error = %message,
                    "Optional phase failed, continuing"
                );
                warnings.push(message);
            }
        }
        PipelineStatus::Completed
    }

    /// Phase boundary: stop if cancelled, wait out a pause.
    async fn checkpoint(&self, control: &RunControl) -> Result<(), PipelineError> {
        if control.token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if !control.is_pause_requested() {
            return Ok(());
        }

        control.set_status(PipelineStatus::Paused);
        debug!("Pipeline paused at phase boundary");
        let mut resumed = control.paused.subscribe();
        let max_pause = self.config.max_pause;
        let outcome = tokio::select! {
            biased;
            () = control.token.cancelled() => Err(PipelineError::Cancelled),
            waited = tokio::time::timeout(
                max_pause,
                async move { resumed.wait_for(|paused| !*paused).await.map(|_| ()) },
            ) => match waited {
                Ok(_) => Ok(()),
                Err(_) => Err(PipelineError::PauseExpired(max_pause)),
            },
        };
        if outcome.is_ok() {
            control.set_status(PipelineStatus::Running);
        }
        outcome
    }

    async fn run_phase(
        &self,
        phase: PipelinePhase,
        config: &PhaseConfig,
        ctx: &mut PipelineContext,
    ) -> PhaseResult {
        let started_at = Utc::now();
        let started = Instant::now();
        debug!(pipeline_id = %ctx.pipeline_id, phase = %phase, "Phase started");

        let outcome = match self.before_phase(phase, ctx).await {
            Err(e) => PhaseOutcome::failed(e.to_string()),
            Ok(()) => {
                let handler = self.handlers.read().get(&phase).cloned();
                match handler {
                    Some(handler) => {
                        self.run_handler(phase, config, handler.as_ref(), ctx).await
                    }
                    None => self.run_overlays(phase, config, ctx).await,
                }
            }
        };

        let status = if outcome.errors.is_empty() {
            PhaseStatus::Completed
        } else {
            PhaseStatus::Failed
        };
        debug!(
            pipeline_id = %ctx.pipeline_id,
            phase = %phase,
            status = %status,
            overlays = outcome.overlay_results.len(),
            "Phase finished"
        );
        PhaseResult {
            phase,
            status,
            data: outcome.data,
            overlay_results: outcome.overlay_results,
            errors: outcome.errors,
            attempts: outcome.attempts,
            duration: started.elapsed(),
            started_at,
            completed_at: Utc::now(),
        }
    }

    async fn run_handler(
        &self,
        phase: PipelinePhase,
        config: &PhaseConfig,
        handler: &dyn PhaseHandler,
        ctx: &mut PipelineContext,
    ) -> PhaseOutcome {
        let mut last_error = PipelineError::Cancelled;
        for attempt in 1..=config.attempts() {
            let outcome = tokio::select! {
                biased;
                () = ctx.cancellation.cancelled() => Err(PipelineError::Cancelled),
                handled = tokio::time::timeout(config.timeout, handler.handle(ctx)) => {
                    handled.unwrap_or(Err(PipelineError::PhaseTimeout {
                        phase,
                        timeout: config.timeout,
                    }))
                }
            };
            match outcome {
                Ok(data) => {
                    ctx.merge(&data);
                    return PhaseOutcome {
                        data,
                        attempts: attempt,
                        ..PhaseOutcome::default()
                    };
                }
                Err(PipelineError::Cancelled) => {
                    last_error = PipelineError::Cancelled;
                    break;
                }
                Err(e) => {
                    debug!(phase = %phase, attempt, error = %e, "Phase handler failed");
                    last_error = e;
                }
            }
        }
        PhaseOutcome {
            attempts: config.attempts(),
            ..PhaseOutcome::failed(last_error.to_string())
        }
    }

    async fn run_overlays(
        &self,
        phase: PipelinePhase,
        config: &PhaseConfig,
        ctx: &mut PipelineContext,
    ) -> PhaseOutcome {
        let instances: Vec<Arc<OverlayInstance>> = self
            .phase_overlays(phase)
            .iter()
            .flat_map(|name| self.manager.get_instances_by_name(name))
            .filter(|instance| instance.state().accepts_work())
            .collect();
        let mut outcome = PhaseOutcome::default();
        if instances.is_empty() {
            debug!(phase = %phase, "No active overlays for phase");
            return outcome;
        }

        if config.parallel {
            let deadline = Instant::now() + config.timeout;
            let shared: &PipelineContext = ctx;
            let runs = instances
                .iter()
                .map(|instance| self.run_overlay(phase, config, instance, shared, deadline));
            let results = join_all(runs).await;
            for (result, attempts) in results {
                outcome.absorb(ctx, result, attempts);
            }
        } else {
            for instance in &instances {
                let deadline = Instant::now() + config.timeout;
                let (result, attempts) = self
                    .run_overlay(phase, config, instance, ctx, deadline)
                    .await;
                let failed = !result.success;
                outcome.absorb(ctx, result, attempts);
                if ctx.is_cancelled() {
                    break;
                }
                if failed && config.required {
                    debug!(
                        phase = %phase,
                        overlay = %instance.name(),
                        "Required phase stopping at first failure"
                    );
                    break;
                }
            }
        }
        outcome
    }

    /// One overlay with retries, under `deadline`.
    async fn run_overlay(
        &self,
        phase: PipelinePhase,
        config: &PhaseConfig,
        instance: &Arc<OverlayInstance>,
        ctx: &PipelineContext,
        deadline: Instant,
    ) -> (OverlayExecutionResult, u32) {
        let token = ctx.cancellation.child_token();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = overlay_request(ctx, instance, deadline, token.clone());
            let result = match tokio::time::timeout_at(
                deadline + DEADLINE_GRACE,
                self.manager.execute_overlay(instance.id(), request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    token.cancel();
                    abandoned(instance, phase, config.timeout, &ctx.correlation_id)
                }
            };

            let retryable = result
                .error_kind
                .is_some_and(|kind| kind.counts_as_failure());
            let out_of_fuel = ctx.fuel_budget.as_ref().is_some_and(|b| b.is_exhausted());
            if result.success
                || !retryable
                || out_of_fuel
                || attempt >= config.attempts()
                || token.is_cancelled()
                || Instant::now() >= deadline
            {
                return (result, attempt);
            }
            debug!(
                phase = %phase,
                overlay = %instance.name(),
                attempt,
                error = ?result.error,
                "Retrying overlay"
            );
        }
    }

    async fn before_phase(
        &self,
        phase: PipelinePhase,
        ctx: &PipelineContext,
    ) -> Result<(), PipelineError> {
        let hooks = self.hooks.read().clone();
        for hook in hooks {
            hook.before_phase(phase, ctx).await?;
        }
        Ok(())
    }

    async fn after_phase(&self, ctx: &PipelineContext, result: &PhaseResult) {
        let hooks = self.hooks.read().clone();
        for hook in hooks {
            if let Err(e) = hook.after_phase(ctx, result).await {
                warn!(phase = %result.phase, error = %e, "Post-phase hook failed");
            }
        }
    }

    fn result(
        &self,
        ctx: PipelineContext,
        status: PipelineStatus,
        errors: Vec<String>,
        warnings: Vec<String>,
        duration: Duration,
    ) -> PipelineResult {
        PipelineResult {
            pipeline_id: ctx.pipeline_id,
            correlation_id: ctx.correlation_id,
            status,
            phase_results: ctx.phase_results,
            final_data: ctx.data,
            errors,
            warnings,
            duration,
            started_at: ctx.started_at,
            completed_at: Utc::now(),
        }
    }

    fn finish(&self, result: &PipelineResult) {
        let counter = match result.status {
            PipelineStatus::Completed => &self.counters.completed,
            PipelineStatus::Cancelled => &self.counters.cancelled,
            _ => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.history.lock().push(result.clone());

        info!(
            pipeline_id = %result.pipeline_id,
            status = %result.status,
            phases = result.phase_results.len(),
            duration_ms = result.duration.as_millis() as u64,
            "Pipeline finished"
        );
        let event_type = if result.is_success() {
            EventType::PipelineCompleted
        } else {
            EventType::PipelineFailed
        };
        self.announce(
            event_type,
            json!({
                "pipeline_id": result.pipeline_id,
                "status": result.status,
                "errors": result.errors,
                "warnings": result.warnings,
                "failed_phase": result.failed_phase(),
                "duration_ms": result.duration.as_millis() as u64,
            }),
            EventPriority::Normal,
            &result.correlation_id,
        );
    }

    /// Lifecycle events are advisory: a full queue drops them rather than
    /// stalling the run.
    fn announce(
        &self,
        event_type: EventType,
        payload: serde_json::Value,
        priority: EventPriority,
        correlation_id: &str,
    ) {
        let payload = match payload {
            serde_json::Value::Object(map) => map,
            _ => Payload::new(),
        };
        let mut event = Event::new(event_type, PIPELINE_SOURCE, payload).with_priority(priority);
        event.correlation_id = Some(correlation_id.to_string());
        if let Err(e) = self.bus.try_publish_event(event) {
            warn!(event_type = %event_type, error = %e, "Pipeline event dropped");
        }
    }

    // =========================================================================
    // CONTROL
    // =========================================================================

    /// Cancel a running pipeline. Its `execute` still returns a result.
    pub fn cancel(&self, pipeline_id: &str) -> Result<(), PipelineError> {
        let control = self.control(pipeline_id)?;
        control.token.cancel();
        info!(pipeline_id = %pipeline_id, "Pipeline cancellation requested");
        Ok(())
    }

    /// Cancel every running pipeline. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let active = self.active.read();
        for control in active.values() {
            control.token.cancel();
        }
        if !active.is_empty() {
            info!(count = active.len(), "Cancelling all pipelines");
        }
        active.len()
    }

    /// Pause at the next phase boundary.
    pub fn pause(&self, pipeline_id: &str) -> Result<(), PipelineError> {
        let control = self.control(pipeline_id)?;
        if control.is_pause_requested() {
            return Err(PipelineError::InvalidStatus {
                pipeline_id: pipeline_id.to_string(),
                status: PipelineStatus::Paused,
                operation: "pause",
            });
        }
        control.paused.send_replace(true);
        info!(pipeline_id = %pipeline_id, "Pipeline pause requested");
        Ok(())
    }

    pub fn resume(&self, pipeline_id: &str) -> Result<(), PipelineError> {
        let control = self.control(pipeline_id)?;
        if !control.is_pause_requested() {
            return Err(PipelineError::InvalidStatus {
                pipeline_id: pipeline_id.to_string(),
                status: control.state.lock().status,
                operation: "resume",
            });
        }
        control.paused.send_replace(false);
        info!(pipeline_id = %pipeline_id, "Pipeline resumed");
        Ok(())
    }

    fn control(&self, pipeline_id: &str) -> Result<Arc<RunControl>, PipelineError> {
        self.active
            .read()
            .get(pipeline_id)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(pipeline_id.to_string()))
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Status of an active run, or of one still in history.
    #[must_use]
    pub fn status(&self, pipeline_id: &str) -> Option<PipelineStatus> {
        if let Some(control) = self.active.read().get(pipeline_id) {
            return Some(control.state.lock().status);
        }
        self.get_result(pipeline_id).map(|r| r.status)
    }

    #[must_use]
    pub fn get_result(&self, pipeline_id: &str) -> Option<PipelineResult> {
        self.history
            .lock()
            .iter()
            .rev()
            .find(|r| r.pipeline_id == pipeline_id)
            .cloned()
    }

    #[must_use]
    pub fn get_active_pipelines(&self) -> Vec<ActivePipeline> {
        let mut active: Vec<_> = self
            .active
            .read()
            .iter()
            .map(|(id, control)| control.snapshot(id))
            .collect();
        active.sort_by_key(|a| a.started_at);
        active
    }

    /// Up to `limit` most recent results, oldest first.
    #[must_use]
    pub fn get_history(&self, limit: usize) -> Vec<PipelineResult> {
        self.history.lock().recent(limit)
    }

    #[must_use]
    pub fn get_stats(&self) -> PipelineStats {
        let (history_size, average_duration) = {
            let history = self.history.lock();
            let total: Duration = history.iter().map(|r| r.duration).sum();
            let len = history.len();
            let average = u32::try_from(len)
                .ok()
                .filter(|n| *n > 0)
                .map_or(Duration::ZERO, |n| total / n);
            (len, average)
        };
        PipelineStats {
            total_runs: self.counters.total.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            active: self.active.read().len(),
            history_size,
            average_duration,
            registered_overlays: self.phase_overlays.read().values().map(Vec::len).sum(),
            custom_handlers: self.handlers.read().len(),
        }
    }
}

/// The manager request for one overlay attempt. The call deadline never
/// outlives the phase deadline.
fn overlay_request(
    ctx: &PipelineContext,
    instance: &OverlayInstance,
    deadline: Instant,
    token: CancellationToken,
) -> OverlayExecutionRequest {
    let mut budget = ctx
        .fuel_budget
        .clone()
        .unwrap_or_else(|| instance.manifest().default_fuel.clone());
    let remaining = deadline
        .saturating_duration_since(Instant::now())
        .max(Duration::from_millis(1));
    budget.timeout = if budget.timeout.is_zero() {
        remaining
    } else {
        budget.timeout.min(remaining)
    };

    let mut request = OverlayExecutionRequest::new(ctx.data.clone())
        .with_trust(ctx.trust_level)
        .with_capabilities(ctx.capabilities.clone())
        .with_fuel(budget)
        .with_correlation_id(ctx.correlation_id.clone())
        .with_trigger(ctx.triggered_by.as_deref().unwrap_or(PIPELINE_SOURCE))
        .with_cancellation(token);
    request.user_id = ctx.user_id.clone();
    request
}

/// Result recorded for an overlay that outlived the phase deadline.
fn abandoned(
    instance: &OverlayInstance,
    phase: PipelinePhase,
    timeout: Duration,
    correlation_id: &str,
) -> OverlayExecutionResult {
    warn!(overlay = %instance.name(), phase = %phase, "Overlay abandoned at phase deadline");
    OverlayExecutionResult {
        execution_id: new_id(),
        overlay_id: instance.id().to_string(),
        overlay_name: instance.name().to_string(),
        success: false,
        data: Payload::new(),
        error: Some(format!(
            "did not complete within the {phase} phase timeout of {timeout:?}"
        )),
        error_kind: Some(ErrorKind::ResourceLimit),
        events_emitted: Vec::new(),
        duration: timeout,
        fuel_consumed: 0,
        correlation_id: Some(correlation_id.to_string()),
        started_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kg_01_overlay_contract::testing::{ScriptedBehavior, ScriptedOverlay};
    use kg_01_overlay_contract::Overlay;
    use kg_02_overlay_manager::{CircuitState, OverlayManagerConfig};
    use shared_bus::EventBusConfig;
    use shared_types::FuelBudget;
    use std::sync::atomic::AtomicU32;

    fn output(key: &str, value: i64) -> Payload {
        let mut p = Payload::new();
        p.insert(key.into(), json!(value));
        p
    }

    fn pipeline_with(config: PipelineConfig) -> Arc<Pipeline> {
        let bus = EventBus::new(EventBusConfig::default());
        let manager = Arc::new(OverlayManager::new(OverlayManagerConfig::default(), bus));
        Arc::new(Pipeline::new(config, manager))
    }

    fn pipeline() -> Arc<Pipeline> {
        pipeline_with(PipelineConfig::default())
    }

    async fn register(
        pipeline: &Pipeline,
        phase: PipelinePhase,
        overlay: ScriptedOverlay,
    ) -> Arc<ScriptedOverlay> {
        let overlay = Arc::new(overlay);
        pipeline
            .manager()
            .register_instance(overlay.clone())
            .await
            .unwrap();
        pipeline.register_phase_overlay(phase, &overlay.manifest().name);
        overlay
    }

    #[tokio::test]
    async fn test_empty_pipeline_completes_in_phase_order() {
        let pipeline = pipeline();
        let result = pipeline
            .execute(PipelineRequest::new(output("input", 1)))
            .await;

        assert_eq!(result.status, PipelineStatus::Completed);
        let phases: Vec<_> = result.phase_results.iter().map(|r| r.phase).collect();
        assert_eq!(phases, PipelinePhase::ALL.to_vec());
        assert_eq!(result.final_data["input"], json!(1));
        assert_eq!(pipeline.get_history(10).len(), 1);
        assert!(pipeline.get_active_pipelines().is_empty());
    }

    #[tokio::test]
    async fn test_outputs_flow_forward() {
        let pipeline = pipeline();
        register(
            &pipeline,
            PipelinePhase::Ingestion,
            ScriptedOverlay::new("ingest").with_output(output("ingested", 1)),
        )
        .await;
        let analyzer = register(
            &pipeline,
            PipelinePhase::Analysis,
            ScriptedOverlay::new("analyze").with_output(output("score", 7)),
        )
        .await;

        let result = pipeline.execute(PipelineRequest::new(Payload::new())).await;
        assert!(result.is_success());
        assert_eq!(result.final_data["ingested"], json!(1));
        assert_eq!(result.final_data["score"], json!(7));
        assert_eq!(analyzer.last_input().unwrap()["ingested"], json!(1));
        assert_eq!(
            result.phase(PipelinePhase::Analysis).unwrap().overlays_executed(),
            vec!["analyze"]
        );
    }

    #[tokio::test]
    async fn test_required_phase_failure_halts() {
        let pipeline = pipeline();
        register(
            &pipeline,
            PipelinePhase::Validation,
            ScriptedOverlay::new("validator").with_behavior(ScriptedBehavior::Fail("bad".into())),
        )
        .await;
        let executor =
            register(&pipeline, PipelinePhase::Execution, ScriptedOverlay::new("exec")).await;

        let result = pipeline.execute(PipelineRequest::new(Payload::new())).await;
        assert_eq!(result.status, PipelineStatus::Failed);
        assert_eq!(result.failed_phase(), Some(PipelinePhase::Validation));
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("validator"));
        assert_eq!(executor.invocations(), 0);
        assert!(result.phase(PipelinePhase::Execution).is_none());
    }

    #[tokio::test]
    async fn test_optional_phase_failure_is_a_warning() {
        let pipeline = pipeline();
        register(
            &pipeline,
            PipelinePhase::Analysis,
            ScriptedOverlay::new("ml").with_behavior(ScriptedBehavior::Fail("model down".into())),
        )
        .await;
        let settler =
            register(&pipeline, PipelinePhase::Settlement, ScriptedOverlay::new("settle")).await;

        let result = pipeline.execute(PipelineRequest::new(Payload::new())).await;
        assert_eq!(result.status, PipelineStatus::Completed);
        assert_eq!(result.phase(PipelinePhase::Analysis).unwrap().status, PhaseStatus::Failed);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.errors.is_empty());
        assert_eq!(settler.invocations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_deadline_does_not_cancel_siblings() {
        let config = PipelineConfig::default().with_phase(
            PipelinePhase::Analysis,
            PhaseConfig::new(Duration::from_millis(50))
                .required(false)
                .parallel(true),
        );
        let pipeline = pipeline_with(config);
        register(
            &pipeline,
            PipelinePhase::Analysis,
            ScriptedOverlay::new("slow")
                .with_behavior(ScriptedBehavior::Sleep(Duration::from_secs(5))),
        )
        .await;
        register(
            &pipeline,
            PipelinePhase::Analysis,
            ScriptedOverlay::new("fast").with_output(output("fast", 1)),
        )
        .await;

        let result = pipeline.execute(PipelineRequest::new(Payload::new())).await;
        let analysis = result.phase(PipelinePhase::Analysis).unwrap();
        assert_eq!(analysis.status, PhaseStatus::Failed);
        assert_eq!(analysis.overlay_results.len(), 2);
        assert_eq!(analysis.errors.len(), 1);
        assert!(analysis.errors[0].starts_with("slow"));
        assert_eq!(result.final_data["fast"], json!(1));
        assert_eq!(result.status, PipelineStatus::Completed);
    }

    #[tokio::test]
    async fn test_sequential_required_phase_fails_fast() {
        let pipeline = pipeline();
        register(
            &pipeline,
            PipelinePhase::Execution,
            ScriptedOverlay::new("first").with_behavior(ScriptedBehavior::Fail("no".into())),
        )
        .await;
        let second =
            register(&pipeline, PipelinePhase::Execution, ScriptedOverlay::new("second")).await;

        let result = pipeline.execute(PipelineRequest::new(Payload::new())).await;
        assert_eq!(result.failed_phase(), Some(PipelinePhase::Execution));
        assert_eq!(second.invocations(), 0);
    }

    #[tokio::test]
    async fn test_retries_failed_overlay() {
        let config = PipelineConfig::default().with_phase(
            PipelinePhase::Ingestion,
            PipelinePhase::Ingestion.default_config().with_retries(2),
        );
        let pipeline = pipeline_with(config);
        let flaky = register(
            &pipeline,
            PipelinePhase::Ingestion,
            ScriptedOverlay::new("flaky").with_behavior(ScriptedBehavior::Fail("again".into())),
        )
        .await;

        let result = pipeline.execute(PipelineRequest::new(Payload::new())).await;
        assert_eq!(flaky.invocations(), 3);
        assert_eq!(result.phase(PipelinePhase::Ingestion).unwrap().attempts, 3);
        assert_eq!(result.status, PipelineStatus::Failed);
    }

    #[tokio::test]
    async fn test_skipped_and_disabled_phases() {
        let config = PipelineConfig::default().with_phase(
            PipelinePhase::Consensus,
            PipelinePhase::Consensus.default_config().disabled(),
        );
        let pipeline = pipeline_with(config);
        let analyzer =
            register(&pipeline, PipelinePhase::Analysis, ScriptedOverlay::new("ml")).await;

        let result = pipeline
            .execute(PipelineRequest::new(Payload::new()).skipping([PipelinePhase::Analysis]))
            .await;
        assert!(result.is_success());
        assert_eq!(analyzer.invocations(), 0);
        assert_eq!(result.phase(PipelinePhase::Analysis).unwrap().status, PhaseStatus::Skipped);
        assert_eq!(result.phase(PipelinePhase::Consensus).unwrap().status, PhaseStatus::Skipped);
        assert_eq!(result.phase_results.len(), 7);
    }

    struct Constant(Payload);

    #[async_trait]
    impl PhaseHandler for Constant {
        async fn handle(&self, _ctx: &PipelineContext) -> Result<Payload, PipelineError> {
            Ok(self.0.clone())
        }
    }

    struct Refuse;

    #[async_trait]
    impl PhaseHandler for Refuse {
        async fn handle(&self, _ctx: &PipelineContext) -> Result<Payload, PipelineError> {
            Err(PipelineError::handler("quorum not reached"))
        }
    }

    #[tokio::test]
    async fn test_custom_handler_replaces_overlays() {
        let pipeline = pipeline();
        let overlay =
            register(&pipeline, PipelinePhase::Consensus, ScriptedOverlay::new("vote")).await;
        pipeline.register_handler(PipelinePhase::Consensus, Arc::new(Constant(output("votes", 3))));

        let result = pipeline.execute(PipelineRequest::new(Payload::new())).await;
        assert_eq!(overlay.invocations(), 0);
        assert_eq!(result.final_data["votes"], json!(3));

        pipeline.register_handler(PipelinePhase::Settlement, Arc::new(Refuse));
        let result = pipeline.execute(PipelineRequest::new(Payload::new())).await;
        assert_eq!(result.failed_phase(), Some(PipelinePhase::Settlement));
        assert!(result.errors[0].contains("quorum not reached"));
        assert_eq!(pipeline.get_stats().custom_handlers, 2);
    }

    #[derive(Default)]
    struct Counting {
        before: AtomicU32,
        after: AtomicU32,
    }

    #[async_trait]
    impl PhaseHook for Counting {
        async fn before_phase(
            &self,
            phase: PipelinePhase,
            _ctx: &PipelineContext,
        ) -> Result<(), PipelineError> {
            self.before.fetch_add(1, Ordering::SeqCst);
            if phase == PipelinePhase::Propagation {
                return Err(PipelineError::Hook {
                    phase,
                    message: "network partitioned".into(),
                });
            }
            Ok(())
        }

        async fn after_phase(
            &self,
            _ctx: &PipelineContext,
            _result: &PhaseResult,
        ) -> Result<(), PipelineError> {
            self.after.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_hooks_wrap_every_phase_that_runs() {
        let pipeline = pipeline();
        let hook = Arc::new(Counting::default());
        pipeline.add_hook(hook.clone());

        let result = pipeline.execute(PipelineRequest::new(Payload::new())).await;
        assert_eq!(hook.before.load(Ordering::SeqCst), 7);
        assert_eq!(hook.after.load(Ordering::SeqCst), 7);
        // Propagation is optional, so its failing pre-hook is only a warning.
        assert_eq!(result.status, PipelineStatus::Completed);
        assert_eq!(result.phase(PipelinePhase::Propagation).unwrap().status, PhaseStatus::Failed);
        assert!(result.warnings[0].contains("network partitioned"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_yields_cancelled_result() {
        let pipeline = pipeline();
        register(
            &pipeline,
            PipelinePhase::Ingestion,
            ScriptedOverlay::new("slow")
                .with_behavior(ScriptedBehavior::Sleep(Duration::from_secs(2))),
        )
        .await;
        let settler =
            register(&pipeline, PipelinePhase::Settlement, ScriptedOverlay::new("settle")).await;

        let runner = Arc::clone(&pipeline);
        let handle = tokio::spawn(async move {
            runner
                .execute(PipelineRequest::new(Payload::new()).with_pipeline_id("p-cancel"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pipeline.get_active_pipelines().len(), 1);
        pipeline.cancel("p-cancel").unwrap();

        let result = handle.await.unwrap();
        assert_eq!(result.status, PipelineStatus::Cancelled);
        assert_eq!(settler.invocations(), 0);
        assert_eq!(pipeline.get_stats().cancelled, 1);
        assert_eq!(pipeline.status("p-cancel"), Some(PipelineStatus::Cancelled));
        assert!(matches!(pipeline.cancel("p-cancel"), Err(PipelineError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_at_boundary() {
        let pipeline = pipeline();
        register(
            &pipeline,
            PipelinePhase::Ingestion,
            ScriptedOverlay::new("slow")
                .with_behavior(ScriptedBehavior::Sleep(Duration::from_millis(100))),
        )
        .await;
        let analyzer =
            register(&pipeline, PipelinePhase::Analysis, ScriptedOverlay::new("ml")).await;

        let runner = Arc::clone(&pipeline);
        let handle = tokio::spawn(async move {
            runner
                .execute(PipelineRequest::new(Payload::new()).with_pipeline_id("p-pause"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        pipeline.pause("p-pause").unwrap();
        assert!(pipeline.pause("p-pause").is_err());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pipeline.status("p-pause"), Some(PipelineStatus::Paused));
        assert_eq!(analyzer.invocations(), 0);

        pipeline.resume("p-pause").unwrap();
        let result = handle.await.unwrap();
        assert!(result.is_success());
        assert_eq!(analyzer.invocations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_longer_than_max_fails() {
        let pipeline =
            pipeline_with(PipelineConfig::default().with_max_pause(Duration::from_secs(1)));
        register(
            &pipeline,
            PipelinePhase::Ingestion,
            ScriptedOverlay::new("slow")
                .with_behavior(ScriptedBehavior::Sleep(Duration::from_millis(100))),
        )
        .await;

        let runner = Arc::clone(&pipeline);
        let handle = tokio::spawn(async move {
            runner
                .execute(PipelineRequest::new(Payload::new()).with_pipeline_id("p-stuck"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        pipeline.pause("p-stuck").unwrap();

        let result = handle.await.unwrap();
        assert_eq!(result.status, PipelineStatus::Failed);
        assert!(result.errors[0].contains("paused longer"));
    }

    #[tokio::test]
    async fn test_control_of_unknown_pipeline() {
        let pipeline = pipeline();
        assert!(matches!(pipeline.pause("nope"), Err(PipelineError::NotFound(_))));
        assert!(matches!(pipeline.resume("nope"), Err(PipelineError::NotFound(_))));
        assert_eq!(pipeline.cancel_all(), 0);
        assert_eq!(pipeline.status("nope"), None);
    }

    #[tokio::test]
    async fn test_registration_is_idempotent() {
        let pipeline = pipeline();
        assert!(pipeline.register_phase_overlay(PipelinePhase::Analysis, "ml"));
        assert!(!pipeline.register_phase_overlay(PipelinePhase::Analysis, "ml"));
        assert_eq!(pipeline.phase_overlays(PipelinePhase::Analysis), vec!["ml"]);
        assert!(pipeline.unregister_phase_overlay(PipelinePhase::Analysis, "ml"));
        assert!(!pipeline.unregister_phase_overlay(PipelinePhase::Analysis, "ml"));
        assert_eq!(pipeline.get_stats().registered_overlays, 0);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let pipeline = pipeline_with(PipelineConfig {
            history_capacity: 2,
            ..PipelineConfig::default()
        });
        for _ in 0..3 {
            pipeline.execute(PipelineRequest::new(Payload::new())).await;
        }
        let stats = pipeline.get_stats();
        assert_eq!(stats.total_runs, 3);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.history_size, 2);
    }

    #[tokio::test]
    async fn test_exhausted_fuel_rejects_overlays_before_execution() {
        let pipeline = pipeline();
        let ingest =
            register(&pipeline, PipelinePhase::Ingestion, ScriptedOverlay::new("ingest")).await;
        let mut budget = FuelBudget::new(10, Duration::from_secs(5));
        budget.consume(10);

        let result = pipeline
            .execute(PipelineRequest::new(Payload::new()).with_fuel(budget))
            .await;

        assert_eq!(result.status, PipelineStatus::Failed);
        assert_eq!(result.failed_phase(), Some(PipelinePhase::Ingestion));
        assert_eq!(ingest.invocations(), 0);
        let phase = result.phase_results.last().unwrap();
        assert_eq!(phase.attempts, 1);
        assert_eq!(
            phase.overlay_results[0].error_kind,
            Some(ErrorKind::ResourceLimit)
        );
        let id = pipeline.manager().get_instances_by_name("ingest")[0].id().to_string();
        assert_eq!(pipeline.manager().circuit_state(&id), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_full_event_queue_never_stalls_a_run() {
        let bus = EventBus::new(EventBusConfig {
            max_queue_size: 2,
            ..EventBusConfig::default()
        });
        let manager = Arc::new(OverlayManager::new(OverlayManagerConfig::default(), bus.clone()));
        let pipeline = Pipeline::new(PipelineConfig::default(), manager);
        let ingest =
            register(&pipeline, PipelinePhase::Ingestion, ScriptedOverlay::new("ingest")).await;

        // Never started: the queue fills and stays full
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            pipeline.execute(PipelineRequest::new(Payload::new())),
        )
        .await
        .unwrap();

        assert_eq!(result.status, PipelineStatus::Completed);
        assert_eq!(ingest.invocations(), 1);
        assert_eq!(bus.get_queue_size(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_pipeline_id_rejected_before_admission() {
        let pipeline = pipeline();
        register(
            &pipeline,
            PipelinePhase::Ingestion,
            ScriptedOverlay::new("slow")
                .with_behavior(ScriptedBehavior::Sleep(Duration::from_secs(1))),
        )
        .await;

        let runner = Arc::clone(&pipeline);
        let first = tokio::spawn(async move {
            runner
                .execute(PipelineRequest::new(Payload::new()).with_pipeline_id("p-dup"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let duplicate = pipeline
            .execute(PipelineRequest::new(Payload::new()).with_pipeline_id("p-dup"))
            .await;
        assert_eq!(duplicate.status, PipelineStatus::Failed);
        assert!(duplicate.errors[0].contains("already running"));
        assert!(duplicate.phase_results.is_empty());
        assert_eq!(pipeline.get_stats().total_runs, 1);
        assert!(pipeline.get_history(10).is_empty());
        assert_eq!(pipeline.status("p-dup"), Some(PipelineStatus::Running));

        let first = first.await.unwrap();
        assert_eq!(first.status, PipelineStatus::Completed);
        let stats = pipeline.get_stats();
        assert_eq!(stats.total_runs, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.history_size, 1);
    }
}
