//! # Overlay Results
//!
//! The structured outcome of one overlay invocation. Failures are values, not
//! panics or raw errors, once they leave the run wrapper.

use crate::errors::{ErrorKind, OverlayError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_bus::{EventPriority, EventType};
use shared_types::Payload;
use std::time::Duration;

/// An event the overlay asks its caller to publish on its behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmittedEvent {
    pub event_type: EventType,
    pub payload: Payload,
    pub priority: EventPriority,
    /// Restrict routing to these overlays.
    pub target_overlays: Option<Vec<String>>,
}

/// Outcome of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayResult {
    /// Whether the overlay did its job.
    pub success: bool,
    /// Output data, merged forward by the pipeline.
    pub data: Payload,
    /// Failure message.
    pub error: Option<String>,
    /// Failure class, set whenever `success` is false.
    pub error_kind: Option<ErrorKind>,
    /// Events to publish after the invocation.
    pub events_to_emit: Vec<EmittedEvent>,
    /// Wall time spent, filled in by the run wrapper.
    pub duration: Duration,
    /// Fuel reported by the overlay (sandboxed overlays only).
    pub fuel_consumed: u64,
    /// When the invocation finished.
    pub completed_at: DateTime<Utc>,
}

impl OverlayResult {
    /// Successful result carrying `data`.
    #[must_use]
    pub fn ok(data: Payload) -> Self {
        Self {
            success: true,
            data,
            error: None,
            error_kind: None,
            events_to_emit: Vec::new(),
            duration: Duration::ZERO,
            fuel_consumed: 0,
            completed_at: Utc::now(),
        }
    }

    /// Failed result of kind [`ErrorKind::Execution`].
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Payload::new(),
            error: Some(message.into()),
            error_kind: Some(ErrorKind::Execution),
            events_to_emit: Vec::new(),
            duration: Duration::ZERO,
            fuel_consumed: 0,
            completed_at: Utc::now(),
        }
    }

    /// Failed result built from a classified error.
    #[must_use]
    pub fn from_error(error: &OverlayError) -> Self {
        let mut result = Self::fail(error.to_string());
        result.error_kind = Some(error.kind());
        result
    }

    /// Queue an event at NORMAL priority.
    #[must_use]
    pub fn emit(self, event_type: EventType, payload: Payload) -> Self {
        self.emit_with_priority(event_type, payload, EventPriority::Normal)
    }

    /// Queue an event at the given priority.
    #[must_use]
    pub fn emit_with_priority(
        mut self,
        event_type: EventType,
        payload: Payload,
        priority: EventPriority,
    ) -> Self {
        self.events_to_emit.push(EmittedEvent {
            event_type,
            payload,
            priority,
            target_overlays: None,
        });
        self
    }

    /// Error kind, treating a missing kind on a failure as an execution error.
    #[must_use]
    pub fn failure_kind(&self) -> Option<ErrorKind> {
        if self.success {
            None
        } else {
            Some(self.error_kind.unwrap_or(ErrorKind::Execution))
        }
    }
}
