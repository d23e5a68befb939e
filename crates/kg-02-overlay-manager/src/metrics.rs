//! # Overlay Manager Metrics
//!
//! Prometheus metrics for overlay execution and circuit breakers.
//!
//! ## Usage
//!
//! Enable with the `metrics` feature:
//! ```toml
//! kg-02-overlay-manager = { path = "...", features = ["metrics"] }
//! ```
//!
//! ## Metrics Exported
//!
//! - `overlay_executions_total` - Counter of executions (by overlay, outcome)
//! - `overlay_execution_seconds` - Histogram of execution durations (by overlay)
//! - `overlay_circuit_rejections_total` - Counter of fast-fails (by overlay)
//! - `overlay_circuits_opened_total` - Counter of breaker openings (by overlay)
//! - `overlay_registered` - Gauge of registered instances

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec,
    IntCounterVec, IntGauge,
};

#[cfg(feature = "metrics")]
lazy_static! {
    /// Executions, labeled by overlay and outcome
    pub static ref EXECUTIONS: IntCounterVec = register_int_counter_vec!(
        "overlay_executions_total",
        "Total number of overlay executions",
        &["overlay", "outcome"]
    )
    .expect("Failed to create EXECUTIONS metric");

    /// Execution durations, labeled by overlay
    pub static ref EXECUTION_SECONDS: HistogramVec = register_histogram_vec!(
        "overlay_execution_seconds",
        "Overlay execution duration in seconds",
        &["overlay"]
    )
    .expect("Failed to create EXECUTION_SECONDS metric");

    /// Fast-fails from open circuits, labeled by overlay
    pub static ref CIRCUIT_REJECTIONS: IntCounterVec = register_int_counter_vec!(
        "overlay_circuit_rejections_total",
        "Total number of executions rejected by an open circuit",
        &["overlay"]
    )
    .expect("Failed to create CIRCUIT_REJECTIONS metric");

    /// Breaker openings, labeled by overlay
    pub static ref CIRCUITS_OPENED: IntCounterVec = register_int_counter_vec!(
        "overlay_circuits_opened_total",
        "Total number of circuit breaker openings",
        &["overlay"]
    )
    .expect("Failed to create CIRCUITS_OPENED metric");

    /// Registered overlay instances
    pub static ref REGISTERED: IntGauge = register_int_gauge!(
        "overlay_registered",
        "Number of registered overlay instances"
    )
    .expect("Failed to create REGISTERED metric");
}

// =============================================================================
// METRIC RECORDING FUNCTIONS
// =============================================================================

/// Record one execution outcome
#[cfg(feature = "metrics")]
pub fn record_execution(overlay: &str, success: bool, seconds: f64) {
    let outcome = if success { "success" } else { "failure" };
    EXECUTIONS.with_label_values(&[overlay, outcome]).inc();
    EXECUTION_SECONDS.with_label_values(&[overlay]).observe(seconds);
}

/// Record a fast-fail
#[cfg(feature = "metrics")]
pub fn record_circuit_rejection(overlay: &str) {
    CIRCUIT_REJECTIONS.with_label_values(&[overlay]).inc();
}

/// Record a breaker opening
#[cfg(feature = "metrics")]
pub fn record_circuit_opened(overlay: &str) {
    CIRCUITS_OPENED.with_label_values(&[overlay]).inc();
}

/// Update registered instance gauge
#[cfg(feature = "metrics")]
pub fn set_registered(count: usize) {
    REGISTERED.set(i64::try_from(count).unwrap_or(i64::MAX));
}

// =============================================================================
// NO-OP IMPLEMENTATIONS (when metrics feature disabled)
// =============================================================================

#[cfg(not(feature = "metrics"))]
pub fn record_execution(_overlay: &str, _success: bool, _seconds: f64) {}

#[cfg(not(feature = "metrics"))]
pub fn record_circuit_rejection(_overlay: &str) {}

#[cfg(not(feature = "metrics"))]
pub fn record_circuit_opened(_overlay: &str) {}

#[cfg(not(feature = "metrics"))]
pub fn set_registered(_count: usize) {}
