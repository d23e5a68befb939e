//! # Domain
//!
//! Pure sandbox concepts: security modes, the execution state machine, host
//! functions, manifests and fuel metering.

pub mod entities;
pub mod host_function;
pub mod manifest;
pub mod metering;
pub mod value_objects;

pub use entities::{ExecutionMetrics, ExecutionOutcome, InstanceSummary, RuntimeSummary};
pub use host_function::HostFunction;
pub use manifest::{ExportedFunction, SandboxManifest, DEFAULT_FUNCTION_FUEL};
pub use metering::FuelMeter;
pub use value_objects::{ExecutionState, SandboxConfig, SecurityMode};
