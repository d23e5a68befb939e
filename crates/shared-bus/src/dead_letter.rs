//! # Dead Letters
//!
//! Deliveries that exhausted their retries. Kept until an operator retries or
//! clears them.

use crate::events::Event;
use crate::subscriber::SubscriptionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One failed (event, subscriber) delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The undeliverable event.
    pub event: Event,
    /// Subscriber whose handler kept failing.
    pub subscription_id: SubscriptionId,
    /// Last error message.
    pub error: String,
    /// Delivery attempts made.
    pub attempts: u32,
    /// When the final attempt failed.
    pub failed_at: DateTime<Utc>,
}

/// Unbounded dead-letter store.
#[derive(Debug, Default)]
pub(crate) struct DeadLetterQueue {
    entries: Vec<DeadLetter>,
}

impl DeadLetterQueue {
    pub(crate) fn push(&mut self, letter: DeadLetter) {
        self.entries.push(letter);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn snapshot(&self) -> Vec<DeadLetter> {
        self.entries.clone()
    }

    /// Remove every entry for `event_id`.
    pub(crate) fn take_by_event_id(&mut self, event_id: &str) -> Vec<DeadLetter> {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|letter| letter.event.id == event_id);
        self.entries = kept;
        taken
    }

    /// Put back entries whose retry could not be queued.
    pub(crate) fn restore(&mut self, letters: Vec<DeadLetter>) {
        self.entries.extend(letters);
    }

    /// Drop everything, returning how many entries were removed.
    pub(crate) fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}
