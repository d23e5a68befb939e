//! # KG-03 Sandbox Runtime
//!
//! Runs untrusted or semi-trusted overlay code with least privilege and hard
//! resource ceilings.
//!
//! ## Guarantees
//!
//! | Guarantee | Enforcement |
//! |-----------|-------------|
//! | Capability closure | `host.rs` - binding table built from declared capabilities only |
//! | Trusted mode needs attestation | `domain/manifest.rs` - `SandboxManifest::validate()` at load |
//! | Fuel pre-check without running code | `domain/metering.rs` - `FuelMeter::allowance()` |
//! | Monotonic fuel | `shared_types::FuelBudget::consume()` |
//! | Terminate frees code and bindings | `service.rs` - `SandboxRuntime::terminate()` |
//!
//! ## Execution Lifecycle
//!
//! ```text
//! load ──► Initializing ──► Ready ──execute──► Running ──ok──► Ready
//!                            │ ▲                  │
//!                      pause │ │ resume           └──error/timeout/panic──► Failed
//!                            ▼ │                                              │
//!                           Paused                               reload ──► Ready
//!
//! terminate (any state) ──► Terminated
//! ```
//!
//! ## Outbound Dependencies
//!
//! | Port | Serves |
//! |------|--------|
//! | `QueryExecutor` | `db_query`, `db_query_single`, `db_write` |
//! | `EventBus` | `publish_event` |
//! | `ExternalHost` | capsule, governance, network, LLM and file functions |

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod adapters;
pub mod domain;
pub mod errors;
pub mod host;
pub mod ports;
pub mod service;

pub use adapters::{InMemoryQueryExecutor, SandboxedOverlay};
pub use domain::{
    ExecutionMetrics, ExecutionOutcome, ExecutionState, ExportedFunction, FuelMeter, HostFunction,
    InstanceSummary, RuntimeSummary, SandboxConfig, SandboxManifest, SecurityMode,
    DEFAULT_FUNCTION_FUEL,
};
pub use errors::{HostError, QueryError, SandboxError};
pub use host::{HostContext, HostPorts};
pub use ports::{ExternalHost, QueryExecutor, SandboxModule};
pub use service::{ExecuteOptions, SandboxRuntime};
