//! # Event Subscriber
//!
//! Defines the subscription side of the event bus: the handler trait, the
//! standing [`Subscription`] record and its pure matching rule.

use crate::events::{Event, EventPriority, EventType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Identifier returned by `subscribe`.
pub type SubscriptionId = String;

/// Optional extra filter evaluated after type and priority.
pub type EventPredicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Errors from subscription operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// A subscription must name at least one event type.
    #[error("Subscription has no event types")]
    EmptyEventTypes,
}

/// Failure reported by a handler. Triggers the retry policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// Receives events delivered by the bus.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event. An `Err` is retried, then dead-lettered.
    async fn handle(&self, event: Arc<Event>) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: Arc<Event>) -> Result<(), HandlerError> {
        (self.f)(event).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// A standing interest in a set of event types.
#[derive(Clone)]
pub struct Subscription {
    /// Unique subscription id.
    pub id: SubscriptionId,
    /// Receiver.
    pub handler: Arc<dyn EventHandler>,
    /// Never empty.
    pub event_types: HashSet<EventType>,
    /// Events below this priority are ignored.
    pub min_priority: EventPriority,
    /// Optional extra filter.
    pub predicate: Option<EventPredicate>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Build a subscription, rejecting an empty type set.
    pub fn new(
        handler: Arc<dyn EventHandler>,
        event_types: impl IntoIterator<Item = EventType>,
        min_priority: EventPriority,
        predicate: Option<EventPredicate>,
    ) -> Result<Self, SubscriptionError> {
        let event_types: HashSet<EventType> = event_types.into_iter().collect();
        if event_types.is_empty() {
            return Err(SubscriptionError::EmptyEventTypes);
        }
        Ok(Self {
            id: shared_types::new_id(),
            handler,
            event_types,
            min_priority,
            predicate,
            created_at: Utc::now(),
        })
    }

    /// Type, then priority, then predicate.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if !self.event_types.contains(&event.event_type) {
            return false;
        }
        if event.priority < self.min_priority {
            return false;
        }
        match &self.predicate {
            Some(predicate) => predicate(event),
            None => true,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event_types", &self.event_types)
            .field("min_priority", &self.min_priority)
            .field("has_predicate", &self.predicate.is_some())
            .field("created_at", &self.created_at)
            .finish()
    }
}
