//! # KG-02 Overlay Manager
//!
//! Registry and execution manager for overlay instances.
//!
//! ## Responsibilities
//!
//! - Register overlays, indexing them by id, by name and by subscribed event
//! - Execute overlays behind a per-instance circuit breaker
//! - Route bus events to every ACTIVE, subscribed, targeted overlay
//! - Publish events overlays emit, tagged `overlay:<name>`
//! - Keep a bounded execution history and manager-wide counters
//!
//! ## Circuit Breaker
//!
//! ```text
//! CLOSED ──(N consecutive failures)──→ OPEN ──(timeout)──→ HALF_OPEN
//!    ↑                                   ↑                     │
//!    └───────────(probe succeeds)────────┼─────────────────────┤
//!                                        └──(probe fails)──────┘
//! ```
//!
//! Only execution failures and resource-limit violations count. Capability,
//! trust and circuit-open rejections never touch a breaker.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod domain;
pub mod errors;
pub mod metrics;
pub mod service;

pub use domain::{
    Admission, CircuitBreakerConfig, CircuitBreakers, CircuitState, CircuitStatus, HalfOpenGuard,
    ManagerStats, OverlayExecutionRequest, OverlayExecutionResult, OverlaySummary,
};
pub use errors::ManagerError;
pub use service::{overlay_source, OverlayManager, OverlayManagerConfig, MANAGER_SOURCE};
