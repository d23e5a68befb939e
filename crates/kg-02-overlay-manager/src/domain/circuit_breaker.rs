//! Per-instance circuit breakers for overlay execution.
//!
//! Stops invoking an overlay that keeps failing until a cool-down elapses.
//!
//! # Circuit Breaker States
//!
//! ```text
//!                  success
//!          ┌─────────────────────┐
//!          ▼                     │
//!    ┌──────────┐          ┌──────────┐          ┌──────────┐
//!    │  CLOSED  │ ───────► │   OPEN   │ ───────► │HALF-OPEN │
//!    │ (normal) │ failures │ (reject) │  timeout │ (1 probe)│
//!    └──────────┘          └──────────┘          └──────────┘
//!          ▲                     ▲   probe failure    │
//!          │                     └────────────────────┤
//!          └──────────────────────────────────────────┘
//!                          probe success
//! ```
//!
//! Every check and every transition happens under one lock, so concurrent
//! executions of the same overlay never see a half-applied transition and at
//! most one probe runs while half-open.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - executions pass through
    Closed,
    /// Executions are rejected immediately
    Open,
    /// One probe execution decides between closed and open
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Time spent open before a probe is allowed
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
        }
    }
}

/// Outcome of [`CircuitBreakers::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed: run normally.
    Allowed,
    /// Half-open: this call is the single probe.
    Probe,
    /// Open: fail fast.
    Rejected {
        /// Time until a probe will be allowed.
        retry_in: Duration,
    },
}

impl Admission {
    /// Returns true if the execution may proceed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }
}

/// Point-in-time view of one circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub times_opened: u64,
    /// How long the circuit has been open, if it is.
    pub open_for: Option<Duration>,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    total_failures: u64,
    times_opened: u64,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
            total_failures: 0,
            times_opened: 0,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.probe_in_flight = false;
        self.times_opened += 1;
    }
}

/// Breakers for every registered overlay instance, keyed by instance id.
pub struct CircuitBreakers {
    circuits: Mutex<HashMap<String, Circuit>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakers {
    /// Create an empty breaker registry.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Decide whether an execution of `instance_id` may proceed.
    ///
    /// An open circuit whose timeout has elapsed moves to half-open and
    /// admits exactly this call as its probe.
    pub fn check(&self, instance_id: &str) -> Admission {
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(instance_id.to_string())
            .or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let elapsed = circuit.opened_at.map_or(self.config.open_timeout, |t| t.elapsed());
                if elapsed >= self.config.open_timeout {
                    info!(instance_id, "Circuit breaker half-open, admitting probe");
                    circuit.state = CircuitState::HalfOpen;
                    circuit.opened_at = None;
                    circuit.probe_in_flight = true;
                    Admission::Probe
                } else {
                    let retry_in = self.config.open_timeout - elapsed;
                    debug!(
                        instance_id,
                        remaining_ms = retry_in.as_millis() as u64,
                        "Circuit breaker is open, rejecting execution"
                    );
                    Admission::Rejected { retry_in }
                }
            }
            CircuitState::HalfOpen => {
                if circuit.probe_in_flight {
                    Admission::Rejected {
                        retry_in: Duration::ZERO,
                    }
                } else {
                    circuit.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// Non-mutating variant of [`check`](Self::check) used for routing.
    #[must_use]
    pub fn would_reject(&self, instance_id: &str) -> bool {
        let circuits = self.circuits.lock();
        match circuits.get(instance_id) {
            None => false,
            Some(circuit) => match circuit.state {
                CircuitState::Closed => false,
                CircuitState::HalfOpen => circuit.probe_in_flight,
                CircuitState::Open => circuit
                    .opened_at
                    .is_some_and(|t| t.elapsed() < self.config.open_timeout),
            },
        }
    }

    /// A success closes the circuit and resets the failure counter.
    pub fn record_success(&self, instance_id: &str) {
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(instance_id.to_string())
            .or_insert_with(Circuit::new);

        if circuit.state != CircuitState::Closed {
            info!(instance_id, from = %circuit.state, "Circuit breaker closed");
        }
        circuit.state = CircuitState::Closed;
        circuit.consecutive_failures = 0;
        circuit.opened_at = None;
        circuit.probe_in_flight = false;
    }

    /// Count a genuine failure. Returns true if this failure opened the
    /// circuit.
    pub fn record_failure(&self, instance_id: &str) -> bool {
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(instance_id.to_string())
            .or_insert_with(Circuit::new);

        circuit.total_failures += 1;
        match circuit.state {
            CircuitState::Closed => {
                circuit.consecutive_failures += 1;
                if circuit.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        instance_id,
                        failures = circuit.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        timeout_secs = self.config.open_timeout.as_secs(),
                        "Circuit breaker opening due to failures"
                    );
                    circuit.open();
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                warn!(instance_id, "Circuit breaker reopening after probe failure");
                circuit.consecutive_failures += 1;
                circuit.open();
                true
            }
            // An execution admitted before the circuit opened
            CircuitState::Open => {
                circuit.consecutive_failures += 1;
                false
            }
        }
    }

    /// Give back a probe whose outcome says nothing about overlay health
    /// (rejection, cancellation). The next call becomes the probe.
    pub fn release_probe(&self, instance_id: &str) {
        if let Some(circuit) = self.circuits.lock().get_mut(instance_id) {
            if circuit.state == CircuitState::HalfOpen {
                circuit.probe_in_flight = false;
            }
        }
    }

    /// Tie a half-open admission to a guard that hands the slot back if the
    /// execution is dropped before its outcome is recorded.
    pub fn hold(&self, instance_id: &str, admission: Admission) -> HalfOpenGuard<'_> {
        HalfOpenGuard {
            breakers: self,
            instance_id: instance_id.to_string(),
            held: admission == Admission::Probe,
        }
    }

    /// Current state; unknown instances are closed.
    #[must_use]
    pub fn state(&self, instance_id: &str) -> CircuitState {
        self.circuits
            .lock()
            .get(instance_id)
            .map_or(CircuitState::Closed, |c| c.state)
    }

    /// Detailed view of one circuit.
    #[must_use]
    pub fn status(&self, instance_id: &str) -> Option<CircuitStatus> {
        self.circuits.lock().get(instance_id).map(|c| CircuitStatus {
            state: c.state,
            consecutive_failures: c.consecutive_failures,
            total_failures: c.total_failures,
            times_opened: c.times_opened,
            open_for: c.opened_at.map(|t| t.elapsed()),
        })
    }

    /// Number of circuits currently open or half-open.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.circuits
            .lock()
            .values()
            .filter(|c| c.state != CircuitState::Closed)
            .count()
    }

    /// Manually close a circuit. Returns false if it was unknown.
    pub fn reset(&self, instance_id: &str) -> bool {
        match self.circuits.lock().get_mut(instance_id) {
            Some(circuit) => {
                info!(instance_id, "Circuit breaker manually reset");
                circuit.state = CircuitState::Closed;
                circuit.consecutive_failures = 0;
                circuit.opened_at = None;
                circuit.probe_in_flight = false;
                true
            }
            None => false,
        }
    }

    /// Forget an instance entirely.
    pub fn remove(&self, instance_id: &str) {
        self.circuits.lock().remove(instance_id);
    }
}

/// Outstanding half-open admission. See [`CircuitBreakers::hold`].
#[must_use]
pub struct HalfOpenGuard<'a> {
    breakers: &'a CircuitBreakers,
    instance_id: String,
    held: bool,
}

impl HalfOpenGuard<'_> {
    /// The outcome is about to be recorded; keep the half-open slot.
    pub fn settle(&mut self) {
        self.held = false;
    }
}

impl Drop for HalfOpenGuard<'_> {
    fn drop(&mut self) {
        if self.held {
            debug!(instance_id = %self.instance_id, "Half-open call abandoned, releasing slot");
            self.breakers.release_probe(&self.instance_id);
        }
    }
}
