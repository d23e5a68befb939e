//! # Circuit Breaking
//!
//! Per-overlay breakers seen from both entry points: direct manager calls
//! and pipeline phases.

#[cfg(test)]
mod tests {
    use crate::integration::support::kernel_with;
    use kg_01_overlay_contract::testing::{ScriptedBehavior, ScriptedOverlay};
    use kg_01_overlay_contract::ErrorKind;
    use kg_02_overlay_manager::{CircuitState, OverlayExecutionRequest};
    use kg_04_pipeline::{PhaseStatus, PipelinePhase, PipelineRequest, PipelineStatus};
    use shared_types::Payload;
    use std::sync::Arc;
    use std::time::Duration;

    fn failing(name: &str) -> Arc<ScriptedOverlay> {
        Arc::new(ScriptedOverlay::new(name).with_behavior(ScriptedBehavior::Fail("boom".into())))
    }

    fn request() -> OverlayExecutionRequest {
        OverlayExecutionRequest::new(Payload::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_sixth_call_fails_fast_then_probe_after_timeout() {
        let kernel = kernel_with(&[("KG_CIRCUIT_TIMEOUT_SECS", "60")]);
        let overlay = failing("flaky");
        let id = kernel.register_overlay(overlay.clone(), &[]).await.unwrap();
        let manager = kernel.manager();

        for _ in 0..5 {
            let result = manager.execute_overlay(&id, request()).await;
            assert_eq!(result.error_kind, Some(ErrorKind::Execution));
        }
        let sixth = manager.execute_overlay(&id, request()).await;
        assert!(sixth.is_circuit_open());
        assert_eq!(overlay.invocations(), 5);

        // Probe is admitted, fails, and the circuit reopens.
        tokio::time::advance(Duration::from_secs(61)).await;
        let probe = manager.execute_overlay(&id, request()).await;
        assert_eq!(probe.error_kind, Some(ErrorKind::Execution));
        assert_eq!(overlay.invocations(), 6);
        assert_eq!(manager.circuit_state(&id), CircuitState::Open);
        assert!(manager.execute_overlay(&id, request()).await.is_circuit_open());
        assert_eq!(overlay.invocations(), 6);

        // Next probe succeeds and closes it.
        overlay.set_behavior(ScriptedBehavior::Succeed);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(manager.execute_overlay(&id, request()).await.success);
        assert_eq!(manager.circuit_state(&id), CircuitState::Closed);
        assert_eq!(overlay.invocations(), 7);
    }

    #[tokio::test]
    async fn test_open_circuit_inside_optional_phase_keeps_pipelines_completing() {
        let kernel = kernel_with(&[("KG_CIRCUIT_THRESHOLD", "2")]);
        let overlay = failing("ml");
        kernel
            .register_overlay(overlay.clone(), &[PipelinePhase::Analysis])
            .await
            .unwrap();
        kernel.start().await.unwrap();

        let mut results = Vec::new();
        for _ in 0..3 {
            results.push(kernel.execute(PipelineRequest::new(Payload::new())).await);
        }

        for result in &results {
            assert_eq!(result.status, PipelineStatus::Completed);
            let analysis = result.phase(PipelinePhase::Analysis).unwrap();
            assert_eq!(analysis.status, PhaseStatus::Failed);
            assert_eq!(result.warnings.len(), 1);
        }
        let last = results[2].phase(PipelinePhase::Analysis).unwrap();
        assert_eq!(last.overlay_results[0].error_kind, Some(ErrorKind::CircuitOpen));
        assert!(results[2].warnings[0].contains("circuit open"));
        assert_eq!(overlay.invocations(), 2);

        let snapshot = kernel.snapshot();
        assert_eq!(snapshot.manager.open_circuits, 1);
        assert_eq!(snapshot.manager.circuit_rejections, 1);
        assert_eq!(snapshot.pipeline.completed, 3);
        kernel.shutdown(Duration::from_secs(5)).await;
    }
}
