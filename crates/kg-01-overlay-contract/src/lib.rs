//! # KG-01 Overlay Contract
//!
//! The interface every overlay (pluggable processing unit) satisfies, and the
//! non-overridable run wrapper the rest of the kernel calls it through.
//!
//! ## Contract
//!
//! | Method | Rule |
//! |--------|------|
//! | `initialize` | idempotent; an error fails registration |
//! | `execute` | only reachable through [`OverlayInstance::run`] |
//! | `cleanup` | best effort; never propagates past the manager |
//! | `health_check` | callable in any state; silence past a bound is unhealthy |
//!
//! ## Run Wrapper
//!
//! [`OverlayInstance::run`] rejects uninitialized or non-ACTIVE instances,
//! rejects grants missing a required capability, enforces the deadline of the
//! execution's fuel budget, observes cancellation, catches panics and records
//! counters. Whatever happens, the caller gets an [`OverlayResult`].
//!
//! ## Error Taxonomy
//!
//! | [`ErrorKind`] | Counted by circuit breakers |
//! |---------------|-----------------------------|
//! | `Capability` | no |
//! | `ResourceLimit` | yes |
//! | `CircuitOpen` | no |
//! | `Security` | no |
//! | `Execution` | yes |
//! | `InvalidState`, `NotFound`, `Cancelled` | no |

// Crate-level lints
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod context;
pub mod errors;
pub mod instance;
pub mod manifest;
pub mod overlay;
pub mod result;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use context::OverlayContext;
pub use errors::{ErrorKind, OverlayError};
pub use instance::{InstanceStats, OverlayHealth, OverlayInstance};
pub use manifest::OverlayManifest;
pub use overlay::{HealthReport, Overlay};
pub use result::{EmittedEvent, OverlayResult};
