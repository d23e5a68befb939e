//! # Sandbox Runtime Service
//!
//! Loads instances, runs their exported functions under fuel, memory and
//! deadline ceilings, and owns the execution state machine.
//!
//! ## Call Admission
//!
//! Checked in this order, all before any instance code runs and without a
//! state transition:
//!
//! 1. instance loaded
//! 2. function exported
//! 3. instance READY
//! 4. budget covers the function's fuel ceiling
//! 5. serialized input fits the memory ceiling (isolated modes only)
//!
//! ## Settlement
//!
//! After the call, fuel is charged from wall time and host calls. Overrunning
//! the call's allowance consumes the whole allowance and fails the instance.

use crate::domain::{
    ExecutionMetrics, ExecutionOutcome, ExecutionState, FuelMeter, InstanceSummary,
    RuntimeSummary, SandboxConfig, SandboxManifest, SecurityMode,
};
use crate::errors::{HostError, SandboxError};
use crate::host::{BindingTable, HostContext, HostPorts, SharedBindings};
use crate::ports::SandboxModule;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use shared_types::{new_id, FuelBudget, Payload};
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Lowers the function's fuel ceiling for this call.
    pub fuel_limit: Option<u64>,
    /// Caller cancellation.
    pub cancellation: Option<CancellationToken>,
}

// =============================================================================
// INSTANCE RECORD
// =============================================================================

struct InstanceInner {
    state: ExecutionState,
    module: Option<Arc<dyn SandboxModule>>,
    fuel: FuelBudget,
    initial_fuel: FuelBudget,
    metrics: ExecutionMetrics,
    functions: BTreeMap<String, ExecutionMetrics>,
    last_error: Option<String>,
}

struct SandboxInstance {
    id: String,
    manifest: SandboxManifest,
    mode: SecurityMode,
    bindings: SharedBindings,
    cancellation: Mutex<CancellationToken>,
    inner: Mutex<InstanceInner>,
}

impl SandboxInstance {
    fn invalid_state(&self, state: ExecutionState, operation: &'static str) -> SandboxError {
        SandboxError::InvalidState {
            instance: self.id.clone(),
            state,
            operation,
        }
    }

    fn summary(&self) -> InstanceSummary {
        let inner = self.inner.lock();
        InstanceSummary {
            instance_id: self.id.clone(),
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            state: inner.state,
            security_mode: self.mode,
            fuel_total: inner.fuel.total(),
            fuel_remaining: inner.fuel.remaining(),
            bound_functions: self.bindings.read().functions(),
            metrics: inner.metrics.clone(),
            functions: inner.functions.clone(),
            last_error: inner.last_error.clone(),
        }
    }
}

/// Fails the instance if a call is dropped while RUNNING.
struct RunGuard<'a> {
    instance: &'a SandboxInstance,
    armed: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.instance.inner.lock();
        if inner.state == ExecutionState::Running {
            inner.state = ExecutionState::Failed;
            inner.last_error = Some("call abandoned while running".into());
        }
    }
}

// =============================================================================
// RUNTIME
// =============================================================================

/// Capability-sandboxed runtime.
pub struct SandboxRuntime {
    config: SandboxConfig,
    meter: FuelMeter,
    ports: HostPorts,
    instances: RwLock<HashMap<String, Arc<SandboxInstance>>>,
}

impl SandboxRuntime {
    #[must_use]
    pub fn new(config: SandboxConfig, ports: HostPorts) -> Self {
        Self {
            meter: FuelMeter::from_config(&config),
            config,
            ports,
            instances: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Budget given to instances loaded without one.
    #[must_use]
    pub fn default_budget(&self) -> FuelBudget {
        FuelBudget::new(self.config.default_fuel, self.config.default_timeout)
            .with_memory_limit_mb(self.config.default_memory_mb)
    }

    // =========================================================================
    // LOADING
    // =========================================================================

    /// Load `module` with the default budget. Returns the instance id.
    pub fn load(
        &self,
        manifest: SandboxManifest,
        module: Arc<dyn SandboxModule>,
        mode: SecurityMode,
    ) -> Result<String, SandboxError> {
        self.load_with_budget(manifest, module, mode, self.default_budget())
    }

    /// Load `module` with an explicit budget.
    ///
    /// Security-mode and capability violations are raised here and never at
    /// call time.
    pub fn load_with_budget(
        &self,
        manifest: SandboxManifest,
        module: Arc<dyn SandboxModule>,
        mode: SecurityMode,
        budget: FuelBudget,
    ) -> Result<String, SandboxError> {
        if let Err(e) = manifest.validate(mode) {
            warn!(instance = %manifest.name, %mode, error = %e, "Sandbox load refused");
            return Err(e);
        }

        let bindings = BindingTable::build(&manifest.capabilities, &self.ports);
        let bound = bindings.functions();
        let id = new_id();
        let instance = Arc::new(SandboxInstance {
            id: id.clone(),
            mode,
            bindings: Arc::new(RwLock::new(bindings)),
            cancellation: Mutex::new(CancellationToken::new()),
            inner: Mutex::new(InstanceInner {
                state: ExecutionState::Initializing,
                module: Some(module),
                fuel: budget.clone(),
                initial_fuel: budget,
                metrics: ExecutionMetrics::default(),
                functions: BTreeMap::new(),
                last_error: None,
            }),
            manifest,
        });
        instance.inner.lock().state = ExecutionState::Ready;

        info!(
            instance = %instance.manifest.name,
            instance_id = %id,
            %mode,
            exports = instance.manifest.exports.len(),
            bound_functions = bound.len(),
            "Sandbox instance loaded"
        );
        self.instances.write().insert(id.clone(), instance);
        Ok(id)
    }

    fn get(&self, instance_id: &str) -> Result<Arc<SandboxInstance>, SandboxError> {
        self.instances
            .read()
            .get(instance_id)
            .cloned()
            .ok_or_else(|| SandboxError::InstanceNotFound(instance_id.to_string()))
    }

    // =========================================================================
    // EXECUTION
    // =========================================================================

    /// Call an exported function.
    pub async fn execute(
        &self,
        instance_id: &str,
        function: &str,
        input: Payload,
    ) -> Result<ExecutionOutcome, SandboxError> {
        self.execute_with(instance_id, function, input, ExecuteOptions::default())
            .await
    }

    /// Call an exported function with a lower fuel ceiling.
    pub async fn execute_with_fuel(
        &self,
        instance_id: &str,
        function: &str,
        input: Payload,
        fuel_limit: u64,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let options = ExecuteOptions {
            fuel_limit: Some(fuel_limit),
            cancellation: None,
        };
        self.execute_with(instance_id, function, input, options).await
    }

    /// Call an exported function with per-call overrides.
    pub async fn execute_with(
        &self,
        instance_id: &str,
        function: &str,
        input: Payload,
        options: ExecuteOptions,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let instance = self.get(instance_id)?;
        let exported = instance
            .manifest
            .function(function)
            .cloned()
            .ok_or_else(|| SandboxError::UnknownFunction(function.to_string()))?;
        let ceiling = options
            .fuel_limit
            .map_or(exported.max_fuel, |limit| limit.min(exported.max_fuel));
        // Only a caller limit can be zero; manifests reject `max_fuel == 0`.
        if ceiling == 0 {
            return Err(SandboxError::FuelExhausted {
                required: exported.max_fuel,
                remaining: 0,
            });
        }
        let isolated = !instance.mode.bypasses_isolation();

        // Admission, then READY → RUNNING under one lock.
        let (module, allowance, deadline, memory_limit) = {
            let mut inner = instance.inner.lock();
            if inner.state != ExecutionState::Ready {
                return Err(instance.invalid_state(inner.state, "execute"));
            }
            let allowance = self.meter.allowance(&inner.fuel, ceiling)?;
            let memory_limit = inner.fuel.memory_limit_bytes();
            if isolated {
                check_memory(&input, memory_limit)?;
            }
            let Some(module) = inner.module.clone() else {
                return Err(instance.invalid_state(inner.state, "execute"));
            };
            inner.state = ExecutionState::Running;
            (module, allowance, inner.fuel.timeout, memory_limit)
        };
        let mut guard = RunGuard {
            instance: &instance,
            armed: true,
        };

        let instance_token = instance.cancellation.lock().clone();
        let caller_token = options.cancellation.unwrap_or_default();
        let host = HostContext::new(
            instance.id.clone(),
            instance.manifest.name.clone(),
            Arc::clone(&instance.bindings),
            self.meter.host_call_cost,
            allowance,
            caller_token.child_token(),
        );

        let started = Instant::now();
        let call = AssertUnwindSafe(module.call(&exported.name, &host, input)).catch_unwind();
        let outcome = tokio::select! {
            biased;
            () = instance_token.cancelled() => Err(SandboxError::Cancelled),
            () = caller_token.cancelled() => Err(SandboxError::Cancelled),
            result = tokio::time::timeout(deadline, call) => match result {
                Ok(Ok(Ok(output))) => Ok(output),
                Ok(Ok(Err(e))) => Err(host_failure(e)),
                Ok(Err(_)) => Err(SandboxError::Panicked),
                Err(_) => Err(SandboxError::Timeout(deadline)),
            },
        };
        drop(module);
        let elapsed = started.elapsed();
        let host_calls = host.host_calls();
        let used = self.meter.consumption(elapsed, host_calls);

        // Settle, record, transition.
        let mut inner = instance.inner.lock();
        guard.armed = false;
        if inner.state == ExecutionState::Terminated {
            return Err(outcome.err().unwrap_or(SandboxError::Cancelled));
        }

        let (fuel, mut outcome) = match self.meter.settle(&mut inner.fuel, allowance, used) {
            Ok(deducted) => (deducted, outcome),
            Err((deducted, exhausted)) => (deducted, Err(exhausted)),
        };
        if isolated {
            if let Ok(output) = &outcome {
                if let Err(e) = check_memory(output, memory_limit) {
                    outcome = Err(e);
                }
            }
        }

        let failed = outcome.is_err();
        inner.metrics.record(fuel, elapsed, failed);
        inner
            .functions
            .entry(exported.name.clone())
            .or_default()
            .record(fuel, elapsed, failed);

        match outcome {
            Ok(output) => {
                inner.state = ExecutionState::Ready;
                debug!(
                    instance = %instance.manifest.name,
                    function = %exported.name,
                    fuel,
                    host_calls,
                    duration_ms = elapsed.as_millis() as u64,
                    "Sandbox call completed"
                );
                Ok(ExecutionOutcome {
                    output,
                    fuel_consumed: fuel,
                    host_calls,
                    duration: elapsed,
                })
            }
            Err(e) => {
                inner.state = if e.fails_instance() {
                    ExecutionState::Failed
                } else {
                    ExecutionState::Ready
                };
                inner.last_error = Some(e.to_string());
                warn!(
                    instance = %instance.manifest.name,
                    function = %exported.name,
                    state = %inner.state,
                    fuel,
                    error = %e,
                    "Sandbox call failed"
                );
                Err(e)
            }
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Drop the instance, its code and its bindings. Idempotent; returns false
    /// if nothing was loaded under `instance_id`.
    pub fn terminate(&self, instance_id: &str) -> bool {
        let Some(instance) = self.instances.write().remove(instance_id) else {
            return false;
        };
        instance.cancellation.lock().cancel();
        instance.bindings.write().clear();
        {
            let mut inner = instance.inner.lock();
            inner.module = None;
            inner.state = ExecutionState::Terminated;
        }
        info!(instance = %instance.manifest.name, instance_id, "Sandbox instance terminated");
        true
    }

    /// READY → PAUSED.
    pub fn pause(&self, instance_id: &str) -> Result<(), SandboxError> {
        self.transition(instance_id, ExecutionState::Ready, ExecutionState::Paused, "pause")
    }

    /// PAUSED → READY.
    pub fn resume(&self, instance_id: &str) -> Result<(), SandboxError> {
        self.transition(instance_id, ExecutionState::Paused, ExecutionState::Ready, "resume")
    }

    fn transition(
        &self,
        instance_id: &str,
        from: ExecutionState,
        to: ExecutionState,
        operation: &'static str,
    ) -> Result<(), SandboxError> {
        let instance = self.get(instance_id)?;
        let mut inner = instance.inner.lock();
        if inner.state != from {
            return Err(instance.invalid_state(inner.state, operation));
        }
        inner.state = to;
        debug!(instance = %instance.manifest.name, from = %from, to = %to, "Sandbox state changed");
        Ok(())
    }

    /// Rebuild bindings, restore the initial fuel budget and return to READY.
    /// Metrics are kept.
    pub fn reload(&self, instance_id: &str) -> Result<(), SandboxError> {
        let instance = self.get(instance_id)?;
        let mut inner = instance.inner.lock();
        if !inner.state.can_transition_to(ExecutionState::Initializing) {
            return Err(instance.invalid_state(inner.state, "reload"));
        }
        inner.state = ExecutionState::Initializing;

        *instance.bindings.write() = BindingTable::build(&instance.manifest.capabilities, &self.ports);
        *instance.cancellation.lock() = CancellationToken::new();
        inner.fuel = inner.initial_fuel.refilled();
        inner.last_error = None;
        inner.state = ExecutionState::Ready;

        info!(instance = %instance.manifest.name, instance_id, "Sandbox instance reloaded");
        Ok(())
    }

    // =========================================================================
    // OBSERVABILITY
    // =========================================================================

    #[must_use]
    pub fn state(&self, instance_id: &str) -> Option<ExecutionState> {
        self.get(instance_id).ok().map(|i| i.inner.lock().state)
    }

    #[must_use]
    pub fn instance_summary(&self, instance_id: &str) -> Option<InstanceSummary> {
        self.get(instance_id).ok().map(|i| i.summary())
    }

    /// Summary of every loaded instance.
    #[must_use]
    pub fn summary(&self) -> RuntimeSummary {
        let instances: Vec<_> = self.instances.read().values().cloned().collect();
        RuntimeSummary::from_instances(instances.iter().map(|i| i.summary()).collect())
    }
}

fn host_failure(error: HostError) -> SandboxError {
    match error {
        HostError::OutOfFuel { calls } => SandboxError::FuelExhausted {
            required: calls,
            remaining: 0,
        },
        other => SandboxError::Trap(other.to_string()),
    }
}

fn check_memory(payload: &Payload, limit: u64) -> Result<(), SandboxError> {
    let size = serde_json::to_vec(payload)
        .map_err(|e| SandboxError::InvalidPayload(e.to_string()))?
        .len() as u64;
    if size > limit {
        return Err(SandboxError::MemoryLimitExceeded { size, limit });
    }
    Ok(())
}
