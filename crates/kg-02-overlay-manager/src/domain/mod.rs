//! # Domain
//!
//! Circuit breakers and the request/result types of overlay execution.

pub mod circuit_breaker;
pub mod execution;

pub use circuit_breaker::{
    Admission, CircuitBreakerConfig, CircuitBreakers, CircuitState, CircuitStatus, HalfOpenGuard,
};
pub use execution::{ManagerStats, OverlayExecutionRequest, OverlayExecutionResult, OverlaySummary};
