//! # Kernel Events
//!
//! Defines every event type that flows through the bus and the immutable
//! [`Event`] record itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_types::{new_id, Payload};
use std::fmt;

/// All event types known to the kernel.
///
/// Closed on purpose: subscriptions and overlay routing are indexed by this
/// enum, so a typo can never silently create a new topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    // =========================================================================
    // CAPSULES
    // =========================================================================
    /// A capsule was created.
    CapsuleCreated,
    /// A capsule was modified.
    CapsuleUpdated,
    /// A capsule was deleted.
    CapsuleDeleted,
    /// Two capsules were linked.
    CapsuleLinked,
    /// A capsule was read.
    CapsuleAccessed,

    // =========================================================================
    // GOVERNANCE
    // =========================================================================
    /// A proposal was opened.
    ProposalCreated,
    /// A vote was cast on a proposal.
    VoteCast,
    /// A proposal passed.
    ProposalPassed,
    /// A proposal was rejected.
    ProposalRejected,
    /// A passed proposal produced an action.
    GovernanceAction,

    // =========================================================================
    // OVERLAY LIFECYCLE
    // =========================================================================
    /// An overlay instance joined the registry.
    OverlayRegistered,
    /// An overlay instance became ACTIVE.
    OverlayActivated,
    /// An overlay instance left ACTIVE.
    OverlayDeactivated,
    /// An overlay execution failed.
    OverlayError,
    /// An overlay execution hit its deadline.
    OverlayTimeout,
    /// An overlay's circuit breaker opened.
    OverlayCircuitOpened,

    // =========================================================================
    // ANALYSIS & SECURITY
    // =========================================================================
    /// Model-based analysis finished.
    MlAnalysisComplete,
    /// An anomaly was detected.
    AnomalyDetected,
    /// A recurring pattern was detected.
    PatternDetected,
    /// A security alert was raised.
    SecurityAlert,
    /// A security rule was violated.
    SecurityViolation,
    /// A trust level changed.
    TrustUpdated,
    /// Capsule lineage changed.
    LineageUpdated,

    // =========================================================================
    // CASCADES
    // =========================================================================
    /// A cascade chain started.
    CascadeInitiated,
    /// A cascade chain propagated one hop.
    CascadePropagated,
    /// A cascade chain was closed.
    CascadeComplete,

    // =========================================================================
    // PIPELINE
    // =========================================================================
    /// A pipeline run started.
    PipelineStarted,
    /// A pipeline phase finished.
    PipelinePhaseComplete,
    /// A pipeline run completed successfully.
    PipelineCompleted,
    /// A pipeline run failed or was cancelled.
    PipelineFailed,

    // =========================================================================
    // SYSTEM
    // =========================================================================
    /// Generic system notice.
    SystemEvent,
    /// Generic system failure.
    SystemError,
    /// Kernel started.
    SystemStartup,
    /// Kernel is shutting down.
    SystemShutdown,
}

impl EventType {
    /// Every event type, in declaration order.
    pub const ALL: [EventType; 34] = [
        EventType::CapsuleCreated,
        EventType::CapsuleUpdated,
        EventType::CapsuleDeleted,
        EventType::CapsuleLinked,
        EventType::CapsuleAccessed,
        EventType::ProposalCreated,
        EventType::VoteCast,
        EventType::ProposalPassed,
        EventType::ProposalRejected,
        EventType::GovernanceAction,
        EventType::OverlayRegistered,
        EventType::OverlayActivated,
        EventType::OverlayDeactivated,
        EventType::OverlayError,
        EventType::OverlayTimeout,
        EventType::OverlayCircuitOpened,
        EventType::MlAnalysisComplete,
        EventType::AnomalyDetected,
        EventType::PatternDetected,
        EventType::SecurityAlert,
        EventType::SecurityViolation,
        EventType::TrustUpdated,
        EventType::LineageUpdated,
        EventType::CascadeInitiated,
        EventType::CascadePropagated,
        EventType::CascadeComplete,
        EventType::PipelineStarted,
        EventType::PipelinePhaseComplete,
        EventType::PipelineCompleted,
        EventType::PipelineFailed,
        EventType::SystemEvent,
        EventType::SystemError,
        EventType::SystemStartup,
        EventType::SystemShutdown,
    ];

    /// Stable wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CapsuleCreated => "CAPSULE_CREATED",
            Self::CapsuleUpdated => "CAPSULE_UPDATED",
            Self::CapsuleDeleted => "CAPSULE_DELETED",
            Self::CapsuleLinked => "CAPSULE_LINKED",
            Self::CapsuleAccessed => "CAPSULE_ACCESSED",
            Self::ProposalCreated => "PROPOSAL_CREATED",
            Self::VoteCast => "VOTE_CAST",
            Self::ProposalPassed => "PROPOSAL_PASSED",
            Self::ProposalRejected => "PROPOSAL_REJECTED",
            Self::GovernanceAction => "GOVERNANCE_ACTION",
            Self::OverlayRegistered => "OVERLAY_REGISTERED",
            Self::OverlayActivated => "OVERLAY_ACTIVATED",
            Self::OverlayDeactivated => "OVERLAY_DEACTIVATED",
            Self::OverlayError => "OVERLAY_ERROR",
            Self::OverlayTimeout => "OVERLAY_TIMEOUT",
            Self::OverlayCircuitOpened => "OVERLAY_CIRCUIT_OPENED",
            Self::MlAnalysisComplete => "ML_ANALYSIS_COMPLETE",
            Self::AnomalyDetected => "ANOMALY_DETECTED",
            Self::PatternDetected => "PATTERN_DETECTED",
            Self::SecurityAlert => "SECURITY_ALERT",
            Self::SecurityViolation => "SECURITY_VIOLATION",
            Self::TrustUpdated => "TRUST_UPDATED",
            Self::LineageUpdated => "LINEAGE_UPDATED",
            Self::CascadeInitiated => "CASCADE_INITIATED",
            Self::CascadePropagated => "CASCADE_PROPAGATED",
            Self::CascadeComplete => "CASCADE_COMPLETE",
            Self::PipelineStarted => "PIPELINE_STARTED",
            Self::PipelinePhaseComplete => "PIPELINE_PHASE_COMPLETE",
            Self::PipelineCompleted => "PIPELINE_COMPLETED",
            Self::PipelineFailed => "PIPELINE_FAILED",
            Self::SystemEvent => "SYSTEM_EVENT",
            Self::SystemError => "SYSTEM_ERROR",
            Self::SystemStartup => "SYSTEM_STARTUP",
            Self::SystemShutdown => "SYSTEM_SHUTDOWN",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source tag of events published on behalf of the overlay `overlay_name`.
#[must_use]
pub fn overlay_source(overlay_name: &str) -> String {
    format!("overlay:{overlay_name}")
}

/// Delivery priority. Subscriptions filter on a minimum priority.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPriority {
    /// Background noise.
    Low,
    /// Ordinary traffic.
    #[default]
    Normal,
    /// Cascades and operator-relevant facts.
    High,
    /// Must be seen by every interested subscriber.
    Critical,
}

/// An immutable fact published to the bus.
///
/// Built with the `with_*` methods, then frozen behind an `Arc` by
/// [`EventBus::publish_event`](crate::EventBus::publish_event). Subscribers
/// only ever see `Arc<Event>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id.
    pub id: String,
    /// Routing key.
    pub event_type: EventType,
    /// Publisher, e.g. `overlay:security_validator` or `pipeline`.
    pub source: String,
    /// Event data.
    pub payload: Payload,
    /// Delivery priority.
    pub priority: EventPriority,
    /// Ties together every event caused by one request.
    pub correlation_id: Option<String>,
    /// If set, only overlays with these names should react.
    pub target_overlays: Option<Vec<String>>,
    /// Cascade chain this event belongs to.
    pub cascade_id: Option<String>,
    /// Hop depth inside the cascade chain.
    pub cascade_depth: u32,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create a NORMAL-priority event with a fresh id.
    #[must_use]
    pub fn new(event_type: EventType, source: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: new_id(),
            event_type,
            source: source.into(),
            payload,
            priority: EventPriority::Normal,
            correlation_id: None,
            target_overlays: None,
            cascade_id: None,
            cascade_depth: 0,
            timestamp: Utc::now(),
        }
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Restrict routing to the named overlays.
    #[must_use]
    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        self.target_overlays = Some(targets);
        self
    }

    /// Stamp cascade membership.
    #[must_use]
    pub fn with_cascade(mut self, cascade_id: impl Into<String>, depth: u32) -> Self {
        self.cascade_id = Some(cascade_id.into());
        self.cascade_depth = depth;
        self
    }

    /// Returns true if an overlay named `overlay_name` should see this event.
    #[must_use]
    pub fn is_targeted_at(&self, overlay_name: &str) -> bool {
        match &self.target_overlays {
            None => true,
            Some(targets) => targets.iter().any(|t| t == overlay_name),
        }
    }
}
