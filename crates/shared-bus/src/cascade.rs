//! # Cascade Tracking
//!
//! A cascade is a chain of causally linked events: one overlay's insight
//! triggers another overlay, which publishes further events, and so on. Every
//! hop is recorded under a shared chain id so the whole propagation can be
//! inspected afterwards.

use crate::events::{Event, EventType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_types::BoundedHistory;
use std::collections::{BTreeSet, HashMap};

/// One hop of a cascade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeEvent {
    /// Id of the published event.
    pub event_id: String,
    /// Its type.
    pub event_type: EventType,
    /// Its publisher.
    pub source: String,
    /// Zero-based position in the chain.
    pub hop: u32,
    /// When the hop was recorded.
    pub timestamp: DateTime<Utc>,
}

/// A traceable sequence of causally linked events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeChain {
    /// Chain id, shared by every hop.
    pub chain_id: String,
    /// Id of the first event.
    pub root_event_id: String,
    /// Hops in publish order.
    pub events: Vec<CascadeEvent>,
    /// When the first hop was recorded.
    pub started_at: DateTime<Utc>,
    /// Set once the chain is closed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Maximum number of hops.
    pub max_hops: u32,
}

impl CascadeChain {
    fn new(chain_id: String, max_hops: u32) -> Self {
        Self {
            chain_id,
            root_event_id: String::new(),
            events: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            max_hops,
        }
    }

    /// Number of hops recorded.
    #[must_use]
    pub fn total_hops(&self) -> u32 {
        u32::try_from(self.events.len()).unwrap_or(u32::MAX)
    }

    /// Returns true once `completed_at` is set.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Distinct publishers along the chain.
    #[must_use]
    pub fn overlays_affected(&self) -> BTreeSet<String> {
        self.events.iter().map(|e| e.source.clone()).collect()
    }
}

/// Why a hop could not be reserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReserveError {
    LimitExceeded { max_hops: u32 },
    Closed,
}

/// Open and completed chains.
#[derive(Debug)]
pub(crate) struct CascadeTracker {
    active: HashMap<String, CascadeChain>,
    completed: BoundedHistory<CascadeChain>,
    max_hops: u32,
}

impl CascadeTracker {
    pub(crate) fn new(max_hops: u32, completed_capacity: usize) -> Self {
        Self {
            active: HashMap::new(),
            completed: BoundedHistory::new(completed_capacity),
            max_hops,
        }
    }

    /// Record `event` as the next hop of `chain_id`, creating the chain if
    /// needed. Stamps the event with the chain id and hop depth.
    pub(crate) fn reserve_hop(
        &mut self,
        chain_id: &str,
        event: &mut Event,
    ) -> Result<(), ReserveError> {
        if self.completed.iter().any(|c| c.chain_id == chain_id) {
            return Err(ReserveError::Closed);
        }
        let max_hops = self.max_hops;
        let chain = self
            .active
            .entry(chain_id.to_string())
            .or_insert_with(|| CascadeChain::new(chain_id.to_string(), max_hops));

        let hop = chain.total_hops();
        if hop >= chain.max_hops {
            return Err(ReserveError::LimitExceeded {
                max_hops: chain.max_hops,
            });
        }

        event.cascade_id = Some(chain_id.to_string());
        event.cascade_depth = hop;
        if chain.events.is_empty() {
            chain.root_event_id = event.id.clone();
            chain.started_at = Utc::now();
        }
        chain.events.push(CascadeEvent {
            event_id: event.id.clone(),
            event_type: event.event_type,
            source: event.source.clone(),
            hop,
            timestamp: event.timestamp,
        });
        Ok(())
    }

    /// Undo a reservation whose publish failed.
    pub(crate) fn release_hop(&mut self, chain_id: &str, event_id: &str) {
        let now_empty = match self.active.get_mut(chain_id) {
            Some(chain) => {
                chain.events.retain(|e| e.event_id != event_id);
                chain.events.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.active.remove(chain_id);
        }
    }

    pub(crate) fn complete(&mut self, chain_id: &str) -> Option<CascadeChain> {
        let mut chain = self.active.remove(chain_id)?;
        chain.completed_at = Some(Utc::now());
        self.completed.push(chain.clone());
        Some(chain)
    }

    pub(crate) fn get(&self, chain_id: &str) -> Option<CascadeChain> {
        if let Some(chain) = self.active.get(chain_id) {
            return Some(chain.clone());
        }
        self.completed
            .iter()
            .rev()
            .find(|c| c.chain_id == chain_id)
            .cloned()
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::Payload;

    fn hop_event(source: &str) -> Event {
        Event::new(EventType::CascadePropagated, source, Payload::new())
    }

    #[test]
    fn test_hops_are_numbered_in_order() {
        let mut tracker = CascadeTracker::new(10, 10);
        let mut first = hop_event("overlay:a");
        let mut second = hop_event("overlay:b");

        tracker.reserve_hop("chain", &mut first).unwrap();
        tracker.reserve_hop("chain", &mut second).unwrap();

        assert_eq!(first.cascade_depth, 0);
        assert_eq!(second.cascade_depth, 1);

        let chain = tracker.get("chain").unwrap();
        assert_eq!(chain.root_event_id, first.id);
        assert_eq!(chain.total_hops(), 2);
        assert_eq!(chain.overlays_affected().len(), 2);
    }

    #[test]
    fn test_max_hops_enforced() {
        let mut tracker = CascadeTracker::new(2, 10);
        tracker.reserve_hop("c", &mut hop_event("a")).unwrap();
        tracker.reserve_hop("c", &mut hop_event("a")).unwrap();
        assert_eq!(
            tracker.reserve_hop("c", &mut hop_event("a")),
            Err(ReserveError::LimitExceeded { max_hops: 2 })
        );
    }

    #[test]
    fn test_completed_chain_rejects_hops() {
        let mut tracker = CascadeTracker::new(5, 10);
        tracker.reserve_hop("c", &mut hop_event("a")).unwrap();

        let closed = tracker.complete("c").unwrap();
        assert!(closed.is_complete());
        assert_eq!(tracker.active_count(), 0);
        assert!(tracker.get("c").unwrap().is_complete());
        assert_eq!(
            tracker.reserve_hop("c", &mut hop_event("a")),
            Err(ReserveError::Closed)
        );
    }

    #[test]
    fn test_release_drops_empty_chain() {
        let mut tracker = CascadeTracker::new(5, 10);
        let mut event = hop_event("a");
        tracker.reserve_hop("c", &mut event).unwrap();
        tracker.release_hop("c", &event.id);
        assert!(tracker.get("c").is_none());
    }
}
