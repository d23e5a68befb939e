//! # Kernel
//!
//! Owns one instance of every kernel component and the order they start and
//! stop in.
//!
//! ## Startup / Shutdown Order
//!
//! ```text
//! start:     Event Bus ──► Overlay Manager ──► (Pipeline ready)
//! shutdown:  cancel pipelines ──► Overlay Manager ──► Event Bus
//! ```

use crate::container::{ConfigError, KernelConfig};
use kg_01_overlay_contract::Overlay;
use kg_02_overlay_manager::{ManagerError, ManagerStats, OverlayManager};
use kg_03_sandbox_runtime::{
    ExternalHost, HostPorts, QueryExecutor, RuntimeSummary, SandboxRuntime,
};
use kg_04_pipeline::{Pipeline, PipelinePhase, PipelineRequest, PipelineResult, PipelineStats};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared_bus::{BusMetrics, EventBus};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Kernel lifecycle errors.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelState {
    Created,
    Running,
    Stopped,
}

/// Counters of every component at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelSnapshot {
    pub state: KernelState,
    pub bus: BusMetrics,
    pub manager: ManagerStats,
    pub pipeline: PipelineStats,
    pub sandbox: RuntimeSummary,
}

/// The knowledge-graph kernel.
pub struct Kernel {
    config: KernelConfig,
    bus: EventBus,
    manager: Arc<OverlayManager>,
    sandbox: Arc<SandboxRuntime>,
    pipeline: Arc<Pipeline>,
    state: Mutex<KernelState>,
}

impl Kernel {
    /// Build every component from `config`.
    ///
    /// `storage` serves the sandbox database host functions and `external`
    /// its network, LLM and file functions; functions whose port is missing
    /// stay unbound.
    pub fn new(
        config: KernelConfig,
        storage: Option<Arc<dyn QueryExecutor>>,
        external: Option<Arc<dyn ExternalHost>>,
    ) -> Result<Self, KernelError> {
        config.validate()?;

        let bus = EventBus::new(config.bus.clone());
        let manager = Arc::new(OverlayManager::new(config.manager.clone(), bus.clone()));
        let ports = HostPorts {
            storage,
            bus: Some(bus.clone()),
            external,
        };
        let sandbox = Arc::new(SandboxRuntime::new(config.sandbox.clone(), ports));
        let pipeline = Arc::new(Pipeline::new(config.pipeline.clone(), Arc::clone(&manager)));

        Ok(Self {
            config,
            bus,
            manager,
            sandbox,
            pipeline,
            state: Mutex::new(KernelState::Created),
        })
    }

    /// Start the bus, then the manager. Idempotent; restarts a stopped kernel.
    pub async fn start(&self) -> Result<(), KernelError> {
        if self.state() == KernelState::Running {
            return Ok(());
        }
        info!("Starting knowledge-graph kernel");
        self.bus.start();
        self.manager.start().await?;
        *self.state.lock() = KernelState::Running;
        info!(
            overlays = self.manager.list_overlays().len(),
            "Kernel running"
        );
        Ok(())
    }

    /// Cancel running pipelines, stop the manager, then drain and stop the
    /// bus. Each stage is bounded by `timeout`. Idempotent.
    pub async fn shutdown(&self, timeout: Duration) {
        if self.state() != KernelState::Running {
            return;
        }
        info!("Initiating graceful shutdown...");

        let cancelled = self.pipeline.cancel_all();
        if cancelled > 0 {
            info!(cancelled, "Cancelled running pipelines");
        }
        self.manager.stop(timeout).await;
        let left = self.bus.stop(timeout).await;

        *self.state.lock() = KernelState::Stopped;
        info!(events_left = left, "Shutdown complete");
    }

    /// Register an overlay with the manager and schedule it in `phases`.
    /// Returns the instance id.
    pub async fn register_overlay(
        &self,
        overlay: Arc<dyn Overlay>,
        phases: &[PipelinePhase],
    ) -> Result<String, KernelError> {
        let name = overlay.manifest().name.clone();
        let id = self.manager.register_instance(overlay).await?;
        for phase in phases {
            self.pipeline.register_phase_overlay(*phase, &name);
        }
        Ok(id)
    }

    /// Run one request through the pipeline.
    pub async fn execute(&self, request: PipelineRequest) -> PipelineResult {
        self.pipeline.execute(request).await
    }

    #[must_use]
    pub fn snapshot(&self) -> KernelSnapshot {
        KernelSnapshot {
            state: self.state(),
            bus: self.bus.get_metrics(),
            manager: self.manager.get_stats(),
            pipeline: self.pipeline.get_stats(),
            sandbox: self.sandbox.summary(),
        }
    }

    #[must_use]
    pub fn state(&self) -> KernelState {
        *self.state.lock()
    }

    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<OverlayManager> {
        &self.manager
    }

    #[must_use]
    pub fn sandbox(&self) -> &Arc<SandboxRuntime> {
        &self.sandbox
    }

    #[must_use]
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }
}
