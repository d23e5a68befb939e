//! # Event Routing
//!
//! Events published on the kernel bus reach plain subscribers and overlays:
//!
//! ```text
//! publisher ──► EventBus ──► subscriptions (type + min priority)
//!                  │
//!                  └──► OverlayManager ──► overlays subscribed to the type
//!                                              │
//!                                              └──► emitted events ──► EventBus
//! ```
//!
//! Failed deliveries land in the dead-letter queue and can be replayed.

#[cfg(test)]
mod tests {
    use crate::integration::support::{counting, eventually, kernel_with};
    use kg_01_overlay_contract::testing::ScriptedOverlay;
    use parking_lot::Mutex;
    use shared_bus::{handler_fn, Event, EventPriority, EventType, HandlerError};
    use shared_types::Payload;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const DRAIN: Duration = Duration::from_secs(5);

    // =========================================================================
    // PRIORITY FILTERING
    // =========================================================================

    #[tokio::test]
    async fn test_capsule_created_reaches_low_but_not_high_subscription() {
        let kernel = kernel_with(&[]);
        let low = Arc::new(AtomicU32::new(0));
        let high = Arc::new(AtomicU32::new(0));
        kernel
            .bus()
            .subscribe(
                counting(Arc::clone(&low)),
                [EventType::CapsuleCreated],
                EventPriority::Low,
                None,
            )
            .unwrap();
        kernel
            .bus()
            .subscribe(
                counting(Arc::clone(&high)),
                [EventType::CapsuleCreated],
                EventPriority::High,
                None,
            )
            .unwrap();
        kernel.start().await.unwrap();

        kernel
            .bus()
            .publish(
                EventType::CapsuleCreated,
                Payload::new(),
                "overlay:test",
                EventPriority::Normal,
                None,
            )
            .await
            .unwrap();
        kernel.shutdown(DRAIN).await;

        assert_eq!(low.load(Ordering::SeqCst), 1);
        assert_eq!(high.load(Ordering::SeqCst), 0);
    }

    // =========================================================================
    // OVERLAY ROUTING
    // =========================================================================

    #[tokio::test]
    async fn test_overlay_never_receives_its_own_event() {
        let kernel = kernel_with(&[]);
        let author =
            Arc::new(ScriptedOverlay::new("test").subscribing([EventType::CapsuleCreated]));
        let lineage =
            Arc::new(ScriptedOverlay::new("lineage").subscribing([EventType::CapsuleCreated]));
        kernel.register_overlay(author.clone(), &[]).await.unwrap();
        kernel.register_overlay(lineage.clone(), &[]).await.unwrap();
        kernel.start().await.unwrap();

        kernel
            .bus()
            .publish(
                EventType::CapsuleCreated,
                Payload::new(),
                "overlay:test",
                EventPriority::Normal,
                None,
            )
            .await
            .unwrap();

        assert!(eventually(|| !lineage.seen_events().is_empty()).await);
        kernel.shutdown(DRAIN).await;

        assert_eq!(lineage.seen_events(), vec![EventType::CapsuleCreated]);
        assert_eq!(author.invocations(), 0);
    }

    #[tokio::test]
    async fn test_emitted_events_chain_across_overlays_with_correlation() {
        let kernel = kernel_with(&[]);
        let ingest = Arc::new(
            ScriptedOverlay::new("ingest")
                .subscribing([EventType::CapsuleCreated])
                .emitting(EventType::PatternDetected),
        );
        let security = Arc::new(
            ScriptedOverlay::new("security")
                .subscribing([EventType::PatternDetected])
                .emitting(EventType::SecurityAlert),
        );
        kernel.register_overlay(ingest.clone(), &[]).await.unwrap();
        kernel.register_overlay(security.clone(), &[]).await.unwrap();

        let alerts: Arc<Mutex<Vec<Arc<Event>>>> = Arc::default();
        let sink = Arc::clone(&alerts);
        kernel
            .bus()
            .subscribe(
                handler_fn(move |event: Arc<Event>| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.lock().push(event);
                        Ok(())
                    }
                }),
                [EventType::SecurityAlert],
                EventPriority::Low,
                None,
            )
            .unwrap();
        kernel.start().await.unwrap();

        kernel
            .bus()
            .publish(
                EventType::CapsuleCreated,
                Payload::new(),
                "api",
                EventPriority::Normal,
                Some("req-7".into()),
            )
            .await
            .unwrap();

        assert!(eventually(|| !alerts.lock().is_empty()).await);
        kernel.shutdown(DRAIN).await;

        let alerts = alerts.lock();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].source, "overlay:security");
        assert_eq!(alerts[0].correlation_id.as_deref(), Some("req-7"));
        assert_eq!(ingest.invocations(), 1);
        assert_eq!(security.seen_events(), vec![EventType::PatternDetected]);
    }

    // =========================================================================
    // DEAD LETTERS
    // =========================================================================

    #[tokio::test]
    async fn test_dead_letter_round_trip_redelivers_exactly_once() {
        let kernel = kernel_with(&[("KG_MAX_RETRIES", "3"), ("KG_RETRY_DELAY_MS", "5")]);
        let calls = Arc::new(AtomicU32::new(0));
        let healthy = Arc::new(AtomicBool::new(false));
        let (handler_calls, handler_healthy) = (Arc::clone(&calls), Arc::clone(&healthy));
        kernel
            .bus()
            .subscribe(
                handler_fn(move |_event: Arc<Event>| {
                    let calls = Arc::clone(&handler_calls);
                    let healthy = Arc::clone(&handler_healthy);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        if healthy.load(Ordering::SeqCst) {
                            Ok(())
                        } else {
                            Err(HandlerError::from("audit store offline"))
                        }
                    }
                }),
                [EventType::SecurityViolation],
                EventPriority::Low,
                None,
            )
            .unwrap();

        kernel.start().await.unwrap();
        let event = kernel
            .bus()
            .publish(
                EventType::SecurityViolation,
                Payload::new(),
                "overlay:security",
                EventPriority::Critical,
                None,
            )
            .await
            .unwrap();
        kernel.shutdown(DRAIN).await;

        let letters = kernel.bus().get_dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].event.id, event.id);
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(letters[0].error, "audit store offline");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(kernel.bus().get_metrics().events_failed, 1);

        healthy.store(true, Ordering::SeqCst);
        kernel.start().await.unwrap();
        assert!(kernel.bus().retry_dead_letter(&event.id).await.unwrap());
        kernel.shutdown(DRAIN).await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(kernel.bus().get_dead_letters().is_empty());
        assert!(!kernel.bus().retry_dead_letter(&event.id).await.unwrap());
    }
}
