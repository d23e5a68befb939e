//! # Knowledge-Graph Kernel
//!
//! Entry point of the kernel process.
//!
//! ## Startup Sequence
//!
//! 1. Initialize logging (`KG_LOG_LEVEL`, then `RUST_LOG`, default `info`)
//! 2. Load and validate configuration from `KG_*` variables
//! 3. Build the kernel and start the event bus, then the overlay manager
//! 4. Run until Ctrl+C, then shut down in reverse order
//!
//! Overlays are registered by the embedding platform through
//! [`Kernel::register_overlay`]; the bare binary hosts none.

use std::sync::Arc;

use anyhow::{Context, Result};
use kernel_runtime::{Kernel, KernelConfig};
use kg_03_sandbox_runtime::{InMemoryQueryExecutor, QueryExecutor};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_env("KG_LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = KernelConfig::from_env().context("Failed to load kernel configuration")?;
    let shutdown_timeout = config.shutdown_timeout;

    let storage: Arc<dyn QueryExecutor> = Arc::new(InMemoryQueryExecutor::new());
    let kernel = Kernel::new(config, Some(storage), None).context("Failed to build kernel")?;
    kernel.start().await.context("Failed to start kernel")?;

    info!("Kernel is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    kernel.shutdown(shutdown_timeout).await;
    let snapshot = serde_json::to_string(&kernel.snapshot())?;
    info!(snapshot = %snapshot, "Final kernel counters");
    Ok(())
}
