//! # Kernel Lifecycle
//!
//! The composition root: configuration reaching every component, snapshots,
//! and shutdown cancelling work still in flight.

#[cfg(test)]
mod tests {
    use crate::integration::support::{eventually, kernel_with};
    use kernel_runtime::KernelState;
    use kg_01_overlay_contract::testing::{ScriptedBehavior, ScriptedOverlay};
    use kg_04_pipeline::{PipelinePhase, PipelineRequest, PipelineStatus};
    use serde_json::json;
    use shared_types::Payload;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_environment_overrides_reach_every_component() {
        let kernel = kernel_with(&[
            ("KG_QUEUE_SIZE", "64"),
            ("KG_PIPELINE_HISTORY", "2"),
            ("KG_DEFAULT_FUEL", "5000"),
            ("KG_CIRCUIT_THRESHOLD", "3"),
        ]);
        assert_eq!(kernel.bus().config().max_queue_size, 64);
        assert_eq!(kernel.sandbox().default_budget().total(), 5000);
        assert_eq!(kernel.manager().config().failure_threshold, 3);

        kernel.start().await.unwrap();
        for _ in 0..3 {
            kernel.execute(PipelineRequest::new(Payload::new())).await;
        }
        assert_eq!(kernel.pipeline().get_history(10).len(), 2);
        assert_eq!(kernel.pipeline().get_stats().total_runs, 3);
        kernel.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_snapshot_covers_every_component() {
        let kernel = kernel_with(&[]);
        let overlay = Arc::new(ScriptedOverlay::new("lineage"));
        kernel
            .register_overlay(overlay, &[PipelinePhase::Execution])
            .await
            .unwrap();
        kernel.start().await.unwrap();
        kernel.execute(PipelineRequest::new(Payload::new())).await;

        let snapshot = serde_json::to_value(kernel.snapshot()).unwrap();
        assert_eq!(snapshot["state"], json!("running"));
        assert_eq!(snapshot["manager"]["registered_overlays"], json!(1));
        assert_eq!(snapshot["manager"]["total_executions"], json!(1));
        assert_eq!(snapshot["pipeline"]["completed"], json!(1));
        assert!(snapshot["bus"]["events_published"].as_u64().unwrap() > 0);
        assert_eq!(snapshot["sandbox"]["active_instances"], json!(0));

        kernel.shutdown(Duration::from_secs(5)).await;
        assert_eq!(kernel.snapshot().state, KernelState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_pipelines() {
        let kernel = Arc::new(kernel_with(&[]));
        let slow = Arc::new(
            ScriptedOverlay::new("slow-ingest")
                .with_behavior(ScriptedBehavior::Sleep(Duration::from_secs(60))),
        );
        kernel
            .register_overlay(slow.clone(), &[PipelinePhase::Ingestion])
            .await
            .unwrap();
        kernel.start().await.unwrap();

        let runner = Arc::clone(&kernel);
        let handle = tokio::spawn(async move {
            runner
                .execute(PipelineRequest::new(Payload::new()).with_pipeline_id("p-long"))
                .await
        });
        assert!(eventually(|| slow.invocations() == 1).await);
        assert_eq!(
            kernel.pipeline().status("p-long"),
            Some(PipelineStatus::Running)
        );

        kernel.shutdown(Duration::from_secs(5)).await;
        let result = handle.await.unwrap();

        assert_eq!(result.status, PipelineStatus::Cancelled);
        assert!(result.phase(PipelinePhase::Analysis).is_none());
        assert!(kernel.pipeline().get_active_pipelines().is_empty());
        assert_eq!(kernel.pipeline().get_stats().cancelled, 1);
    }
}
