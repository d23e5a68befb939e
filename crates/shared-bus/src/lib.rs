//! # Shared Bus - Kernel Event Bus
//!
//! Asynchronous publish/subscribe router that couples overlays, the overlay
//! manager and the pipeline. Nothing in the kernel calls an overlay directly
//! in response to a fact; it publishes an [`Event`] and lets subscribers react.
//!
//! ## Delivery Model
//!
//! ```text
//!  publish() ──► [bounded queue] ──► dispatch loop ──► index by EventType
//!                  (backpressure)                         │
//!                                         priority + predicate filter
//!                                                         │
//!                                  ┌──────────────┬───────┴──────┐
//!                                  ▼              ▼              ▼
//!                              handler A      handler B      handler C   (concurrent)
//!                                  │
//!                         retry (delay × attempt)
//!                                  │
//!                                  ▼
//!                          dead-letter queue ──► retry_dead_letter()
//! ```
//!
//! ## Guarantees
//!
//! - Events reach the dispatch loop in publish order.
//! - Delivery to the subscribers of one event is concurrent and unordered.
//! - A failing or panicking handler never affects other handlers or the publisher.
//! - A full queue blocks the publisher for at most `publish_timeout`, then
//!   the publish fails with `QueueFull`. `try_publish_event` never waits.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod cascade;
pub mod dead_letter;
pub mod events;
pub mod publisher;
pub mod subscriber;

// Re-export main types
pub use cascade::{CascadeChain, CascadeEvent};
pub use dead_letter::DeadLetter;
pub use events::{overlay_source, Event, EventPriority, EventType};
pub use publisher::{BusError, BusMetrics, EventBus, EventBusConfig};
pub use subscriber::{
    handler_fn, EventHandler, EventPredicate, HandlerError, Subscription, SubscriptionError,
    SubscriptionId,
};

/// Default bound of the publish queue.
pub const DEFAULT_QUEUE_SIZE: usize = 10_000;

/// Default wait for queue space before a publish fails.
pub const DEFAULT_PUBLISH_TIMEOUT_SECS: u64 = 5;

/// Default per-delivery ceiling for one subscriber.
pub const DEFAULT_DELIVERY_TIMEOUT_SECS: u64 = 30;

/// Default maximum length of a cascade chain.
pub const DEFAULT_MAX_CASCADE_HOPS: u32 = 10;
