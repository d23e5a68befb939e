//! # Pipeline Flows
//!
//! Full seven-phase runs on a started kernel: ordering, optional-phase
//! tolerance, required-phase halts and the events each run leaves on the bus.

#[cfg(test)]
mod tests {
    use crate::integration::support::{kernel_with, payload};
    use async_trait::async_trait;
    use kernel_runtime::{Kernel, KernelConfig};
    use kg_01_overlay_contract::testing::{ScriptedBehavior, ScriptedOverlay};
    use kg_01_overlay_contract::ErrorKind;
    use kg_04_pipeline::{
        PhaseConfig, PhaseHandler, PhaseStatus, PipelineContext, PipelineError, PipelinePhase,
        PipelineRequest, PipelineStatus,
    };
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use shared_bus::{handler_fn, Event, EventPriority, EventType};
    use shared_types::{FuelBudget, Payload};
    use std::sync::Arc;
    use std::time::Duration;

    const DRAIN: Duration = Duration::from_secs(5);

    /// Records every event of `types` published on the kernel bus.
    fn record(kernel: &Kernel, types: &[EventType]) -> Arc<Mutex<Vec<Arc<Event>>>> {
        let seen: Arc<Mutex<Vec<Arc<Event>>>> = Arc::default();
        let sink = Arc::clone(&seen);
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
                types.iter().copied(),
                EventPriority::Low,
                None,
            )
            .unwrap();
        seen
    }

    async fn schedule(
        kernel: &Kernel,
        phase: PipelinePhase,
        overlay: ScriptedOverlay,
    ) -> Arc<ScriptedOverlay> {
        let overlay = Arc::new(overlay);
        kernel.register_overlay(overlay.clone(), &[phase]).await.unwrap();
        overlay
    }

    #[tokio::test]
    async fn test_phases_run_in_fixed_order_and_announce_themselves() {
        let kernel = kernel_with(&[]);
        let mut overlays = Vec::new();
        for phase in PipelinePhase::ALL {
            let overlay = ScriptedOverlay::new(format!("{phase}-overlay"))
                .with_output(payload(phase.as_str(), phase.index() as i64));
            overlays.push(schedule(&kernel, phase, overlay).await);
        }
        let events = record(
            &kernel,
            &[
                EventType::PipelineStarted,
                EventType::PipelinePhaseComplete,
                EventType::PipelineCompleted,
            ],
        );
        kernel.start().await.unwrap();

        let result = kernel
            .execute(
                PipelineRequest::new(Payload::new())
                    .triggered_by("api")
                    .with_correlation_id("req-42"),
            )
            .await;
        kernel.shutdown(DRAIN).await;

        assert_eq!(result.status, PipelineStatus::Completed);
        let order: Vec<_> = result.phase_results.iter().map(|r| r.phase).collect();
        assert_eq!(order, PipelinePhase::ALL.to_vec());
        for phase in PipelinePhase::ALL {
            assert_eq!(result.final_data[phase.as_str()], json!(phase.index() as i64));
        }

        // Each overlay saw everything the earlier phases produced.
        let settlement_input = overlays[6].last_input().unwrap();
        for phase in &PipelinePhase::ALL[..6] {
            assert!(settlement_input.contains_key(phase.as_str()));
        }
        assert!(!overlays[0]
            .last_input()
            .unwrap()
            .contains_key(PipelinePhase::Analysis.as_str()));

        let events = events.lock();
        let count = |ty: EventType| events.iter().filter(|e| e.event_type == ty).count();
        assert_eq!(count(EventType::PipelineStarted), 1);
        assert_eq!(count(EventType::PipelinePhaseComplete), 7);
        assert_eq!(count(EventType::PipelineCompleted), 1);
        assert!(events
            .iter()
            .all(|e| e.correlation_id.as_deref() == Some("req-42")));
        let mut announced: Vec<Value> = events
            .iter()
            .filter(|e| e.event_type == EventType::PipelinePhaseComplete)
            .map(|e| e.payload["phase"].clone())
            .collect();
        announced.sort_by_key(|v| v.as_str().map(str::to_string));
        let mut expected: Vec<Value> = PipelinePhase::ALL
            .iter()
            .map(|p| json!(p.as_str()))
            .collect();
        expected.sort_by_key(|v| v.as_str().map(str::to_string));
        assert_eq!(announced, expected);
    }

    #[tokio::test]
    async fn test_timed_out_optional_consensus_does_not_fail_the_run() {
        let mut config = KernelConfig::default();
        config.pipeline = config.pipeline.with_phase(
            PipelinePhase::Consensus,
            PhaseConfig::new(Duration::from_millis(5000)).required(false),
        );
        let kernel = Kernel::new(config, None, None).unwrap();

        let voter = schedule(
            &kernel,
            PipelinePhase::Consensus,
            ScriptedOverlay::new("voter")
                .with_fuel(FuelBudget::new(1_000, Duration::from_millis(1)))
                .with_behavior(ScriptedBehavior::Sleep(Duration::from_secs(1))),
        )
        .await;
        let mut later = Vec::new();
        for phase in [
            PipelinePhase::Execution,
            PipelinePhase::Propagation,
            PipelinePhase::Settlement,
        ] {
            let overlay = ScriptedOverlay::new(format!("{phase}-overlay"));
            later.push(schedule(&kernel, phase, overlay).await);
        }
        kernel.start().await.unwrap();

        let result = kernel.execute(PipelineRequest::new(Payload::new())).await;
        kernel.shutdown(DRAIN).await;

        let consensus = result.phase(PipelinePhase::Consensus).unwrap();
        assert_eq!(consensus.status, PhaseStatus::Failed);
        assert_eq!(
            consensus.overlay_results[0].error_kind,
            Some(ErrorKind::ResourceLimit)
        );
        assert_eq!(result.status, PipelineStatus::Completed);
        assert!(result.errors.is_empty());
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(voter.invocations(), 1);
        for overlay in &later {
            assert_eq!(overlay.invocations(), 1);
        }
        for phase in &PipelinePhase::ALL[4..] {
            assert_eq!(result.phase(*phase).unwrap().status, PhaseStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_required_phase_failure_halts_and_reports_failed_phase() {
        let kernel = kernel_with(&[]);
        schedule(
            &kernel,
            PipelinePhase::Validation,
            ScriptedOverlay::new("schema")
                .with_behavior(ScriptedBehavior::Fail("schema mismatch".into())),
        )
        .await;
        let executor = schedule(
            &kernel,
            PipelinePhase::Execution,
            ScriptedOverlay::new("writer"),
        )
        .await;
        let failures = record(&kernel, &[EventType::PipelineFailed]);
        kernel.start().await.unwrap();

        let result = kernel.execute(PipelineRequest::new(Payload::new())).await;
        kernel.shutdown(DRAIN).await;

        assert_eq!(result.status, PipelineStatus::Failed);
        assert_eq!(result.failed_phase(), Some(PipelinePhase::Validation));
        assert!(result.errors[0].contains("schema mismatch"));
        assert!(result.phase(PipelinePhase::Execution).is_none());
        assert_eq!(executor.invocations(), 0);

        let failures = failures.lock();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].payload["failed_phase"], json!("validation"));
        assert_eq!(failures[0].payload["pipeline_id"], json!(result.pipeline_id));
    }

    struct RequireCapsuleId;

    #[async_trait]
    impl PhaseHandler for RequireCapsuleId {
        async fn handle(&self, ctx: &PipelineContext) -> Result<Payload, PipelineError> {
            match ctx.data.get("capsule_id") {
                Some(id) => {
                    let mut out = Payload::new();
                    out.insert("validated".into(), id.clone());
                    Ok(out)
                }
                None => Err(PipelineError::handler("missing capsule_id")),
            }
        }
    }

    #[tokio::test]
    async fn test_custom_validation_handler_replaces_overlay_fan_out() {
        let kernel = kernel_with(&[]);
        let bypassed = schedule(
            &kernel,
            PipelinePhase::Validation,
            ScriptedOverlay::new("generic-validator"),
        )
        .await;
        kernel
            .pipeline()
            .register_handler(PipelinePhase::Validation, Arc::new(RequireCapsuleId));

        let ok = kernel
            .execute(PipelineRequest::new(payload("capsule_id", 9)))
            .await;
        assert_eq!(ok.status, PipelineStatus::Completed);
        assert_eq!(ok.final_data["validated"], json!(9));

        let rejected = kernel.execute(PipelineRequest::new(Payload::new())).await;
        assert_eq!(rejected.status, PipelineStatus::Failed);
        assert_eq!(rejected.failed_phase(), Some(PipelinePhase::Validation));
        assert!(rejected.errors[0].contains("missing capsule_id"));
        assert_eq!(bypassed.invocations(), 0);
    }

    #[tokio::test]
    async fn test_full_event_queue_does_not_hold_up_a_run() {
        // Not started: nothing drains the one-slot queue
        let kernel = kernel_with(&[("KG_QUEUE_SIZE", "1"), ("KG_PUBLISH_TIMEOUT_MS", "60000")]);
        let ingest =
            schedule(&kernel, PipelinePhase::Ingestion, ScriptedOverlay::new("ingest")).await;
        assert_eq!(kernel.bus().get_queue_size(), 1);

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            kernel.execute(PipelineRequest::new(payload("n", 1))),
        )
        .await
        .unwrap();

        assert_eq!(result.status, PipelineStatus::Completed);
        assert_eq!(ingest.invocations(), 1);
        assert_eq!(kernel.bus().get_queue_size(), 1);
        assert_eq!(kernel.pipeline().get_stats().completed, 1);
    }
}
