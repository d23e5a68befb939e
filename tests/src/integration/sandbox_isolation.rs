//! # Sandbox Isolation
//!
//! Capability gating and fuel accounting of sandbox instances, alone and
//! plugged into the kernel as overlays.

#[cfg(test)]
mod tests {
    use crate::integration::support::kernel_with;
    use async_trait::async_trait;
    use kernel_runtime::KernelError;
    use kg_02_overlay_manager::{CircuitState, ManagerError};
    use kg_03_sandbox_runtime::{
        ExecutionState, ExternalHost, HostContext, HostError, HostFunction, HostPorts,
        InMemoryQueryExecutor, SandboxConfig, SandboxError, SandboxManifest, SandboxModule,
        SandboxRuntime, SandboxedOverlay, SecurityMode,
    };
    use kg_04_pipeline::{PhaseStatus, PipelinePhase, PipelineRequest, PipelineStatus};
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use shared_bus::{handler_fn, Event, EventBus, EventBusConfig, EventPriority, EventType};
    use shared_types::{Capability, CapabilitySet, FuelBudget, Payload};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    // =========================================================================
    // TEST MODULES
    // =========================================================================

    #[derive(Default)]
    struct RecordingExternal {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ExternalHost for RecordingExternal {
        async fn invoke(&self, function: HostFunction, _args: Payload) -> Result<Value, HostError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!(function.as_str()))
        }
    }

    /// Tries every host function gated by `target`.
    struct Prober {
        target: Capability,
        outcomes: Mutex<Vec<(HostFunction, Result<Value, HostError>)>>,
        bound: Mutex<Vec<HostFunction>>,
    }

    impl Prober {
        fn new(target: Capability) -> Self {
            Self {
                target,
                outcomes: Mutex::new(Vec::new()),
                bound: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SandboxModule for Prober {
        async fn call(
            &self,
            _function: &str,
            host: &HostContext,
            input: Payload,
        ) -> Result<Payload, HostError> {
            *self.bound.lock() = host.bound_functions();
            for function in HostFunction::gated_by(self.target) {
                let outcome = host.call(function, input.clone()).await;
                self.outcomes.lock().push((function, outcome));
            }
            Ok(Payload::new())
        }
    }

    /// Makes `host_calls` log calls per invocation.
    struct Chatty {
        host_calls: u64,
        invocations: AtomicU32,
    }

    impl Chatty {
        fn new(host_calls: u64) -> Self {
            Self {
                host_calls,
                invocations: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl SandboxModule for Chatty {
        async fn call(
            &self,
            _function: &str,
            host: &HostContext,
            _input: Payload,
        ) -> Result<Payload, HostError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            for _ in 0..self.host_calls {
                host.log("tick")?;
            }
            Ok(Payload::new())
        }
    }

    /// Measures `text` and announces the result.
    #[derive(Default)]
    struct Summarizer {
        invocations: AtomicU32,
    }

    #[async_trait]
    impl SandboxModule for Summarizer {
        async fn call(
            &self,
            _function: &str,
            host: &HostContext,
            input: Payload,
        ) -> Result<Payload, HostError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let text = input.get("text").and_then(Value::as_str).unwrap_or_default();
            let mut summary = Payload::new();
            summary.insert("length".into(), json!(text.len()));
            host.publish(EventType::PatternDetected, summary.clone()).await?;
            Ok(summary)
        }
    }

    /// Well-formed arguments for every host function, so only bindings decide.
    fn well_formed_args() -> Payload {
        let Value::Object(args) = json!({
            "message": "probe",
            "query": "MATCH (c:Capsule) RETURN c",
            "params": {},
            "event_type": "CAPSULE_CREATED",
            "payload": {},
            "url": "https://example.org",
            "prompt": "summarize",
            "path": "/tmp/capsule.json",
            "capsule_id": "c-1",
            "proposal_id": "p-1",
            "vote": "yes",
        }) else {
            unreachable!("literal is an object")
        };
        args
    }

    fn metered_runtime(fuel_per_ms: u64, host_call_cost: u64) -> SandboxRuntime {
        let config = SandboxConfig {
            fuel_per_ms,
            host_call_cost,
            ..SandboxConfig::default()
        };
        SandboxRuntime::new(config, HostPorts::new())
    }

    // =========================================================================
    // CAPABILITY CLOSURE
    // =========================================================================

    #[tokio::test]
    async fn test_no_function_gated_by_a_withheld_capability_is_callable() {
        let external = Arc::new(RecordingExternal::default());
        let ports = HostPorts::new()
            .with_storage(Arc::new(InMemoryQueryExecutor::new()))
            .with_bus(EventBus::new(EventBusConfig::default()))
            .with_external(external.clone());
        let runtime = SandboxRuntime::new(SandboxConfig::default(), ports);

        for withheld in Capability::ALL {
            let granted = Capability::ALL.into_iter().filter(|c| *c != withheld);
            let manifest = SandboxManifest::new(format!("probe-{}", withheld.as_str()), "1.0.0")
                .with_capabilities(granted)
                .export("probe");
            let module = Arc::new(Prober::new(withheld));
            let id = runtime
                .load(manifest, module.clone(), SecurityMode::Standard)
                .unwrap();
            runtime.execute(&id, "probe", well_formed_args()).await.unwrap();

            let gated: Vec<_> = HostFunction::gated_by(withheld).collect();
            assert!(!gated.is_empty(), "{withheld:?} gates nothing");

            let outcomes = module.outcomes.lock();
            assert_eq!(outcomes.len(), gated.len());
            for (function, outcome) in outcomes.iter() {
                assert_eq!(
                    outcome,
                    &Err(HostError::NotBound(*function)),
                    "{function:?} reachable without {withheld:?}"
                );
            }

            // Everything else has a backend and stays bound.
            let bound = module.bound.lock();
            assert_eq!(bound.len(), HostFunction::ALL.len() - gated.len());
            assert!(bound.iter().all(|f| !gated.contains(f)));
        }
        assert_eq!(external.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_strict_sandboxed_overlay_with_network_access_never_registers() {
        let kernel = kernel_with(&[]);
        let manifest = SandboxManifest::new("crawler", "1.0.0")
            .with_capability(Capability::NetworkAccess)
            .export("crawl");
        let overlay = SandboxedOverlay::new(
            Arc::clone(kernel.sandbox()),
            manifest,
            Arc::new(Summarizer::default()),
            SecurityMode::Strict,
            "crawl",
        );

        let err = kernel
            .register_overlay(Arc::new(overlay), &[PipelinePhase::Analysis])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KernelError::Manager(ManagerError::Initialization { .. })
        ));
        assert!(kernel.manager().list_overlays().is_empty());
        assert_eq!(kernel.sandbox().summary().active_instances, 0);
    }

    // =========================================================================
    // FUEL
    // =========================================================================

    #[tokio::test]
    async fn test_fuel_only_grows_until_exhausted_then_calls_are_refused() {
        let runtime = metered_runtime(0, 100);
        let module = Arc::new(Chatty::new(3));
        let manifest = SandboxManifest::new("ticker", "1.0.0").export_with_fuel("tick", 300);
        let id = runtime
            .load_with_budget(
                manifest,
                module.clone(),
                SecurityMode::Standard,
                FuelBudget::new(900, Duration::from_secs(5)),
            )
            .unwrap();

        let mut consumed = 0;
        for _ in 0..3 {
            let outcome = runtime.execute(&id, "tick", Payload::new()).await.unwrap();
            assert_eq!(outcome.fuel_consumed, 300);
            let summary = runtime.instance_summary(&id).unwrap();
            let now = summary.fuel_total - summary.fuel_remaining;
            assert!(now >= consumed);
            consumed = now;
        }
        assert_eq!(consumed, 900);
        assert_eq!(runtime.instance_summary(&id).unwrap().fuel_remaining, 0);

        for _ in 0..2 {
            let err = runtime.execute(&id, "tick", Payload::new()).await.unwrap_err();
            assert!(matches!(err, SandboxError::FuelExhausted { remaining: 0, .. }));
        }
        assert_eq!(module.invocations.load(Ordering::SeqCst), 3);
        assert_eq!(runtime.state(&id), Some(ExecutionState::Ready));
    }

    #[tokio::test]
    async fn test_overrunning_the_allowance_charges_it_whole_and_fails_the_instance() {
        let runtime = metered_runtime(0, 100);
        let module = Arc::new(Chatty::new(4));
        let manifest = SandboxManifest::new("greedy", "1.0.0").export_with_fuel("tick", 300);
        let id = runtime
            .load_with_budget(
                manifest,
                module.clone(),
                SecurityMode::Standard,
                FuelBudget::new(1_000, Duration::from_secs(5)),
            )
            .unwrap();

        let err = runtime.execute(&id, "tick", Payload::new()).await.unwrap_err();
        assert!(matches!(err, SandboxError::FuelExhausted { .. }));
        let summary = runtime.instance_summary(&id).unwrap();
        assert_eq!(summary.fuel_remaining, 700);
        assert_eq!(summary.state, ExecutionState::Failed);

        let refused = runtime.execute(&id, "tick", Payload::new()).await.unwrap_err();
        assert!(matches!(refused, SandboxError::InvalidState { .. }));
        assert_eq!(module.invocations.load(Ordering::SeqCst), 1);

        runtime.reload(&id).unwrap();
        assert_eq!(runtime.instance_summary(&id).unwrap().fuel_remaining, 1_000);
    }

    // =========================================================================
    // SANDBOXED OVERLAYS IN THE PIPELINE
    // =========================================================================

    #[tokio::test]
    async fn test_sandboxed_overlay_runs_in_pipeline_with_granted_capabilities() {
        let kernel = kernel_with(&[]);
        let module = Arc::new(Summarizer::default());
        let manifest = SandboxManifest::new("summarizer", "1.0.0")
            .with_capability(Capability::EventPublish)
            .export("summarize");
        let overlay = SandboxedOverlay::new(
            Arc::clone(kernel.sandbox()),
            manifest,
            module.clone(),
            SecurityMode::Standard,
            "summarize",
        );
        kernel
            .register_overlay(Arc::new(overlay), &[PipelinePhase::Analysis])
            .await
            .unwrap();

        let patterns: Arc<Mutex<Vec<Arc<Event>>>> = Arc::default();
        let sink = Arc::clone(&patterns);
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
                [EventType::PatternDetected],
                EventPriority::Low,
                None,
            )
            .unwrap();
        kernel.start().await.unwrap();

        let mut input = Payload::new();
        input.insert("text".into(), json!("hello graph"));
        let granted = CapabilitySet::from([Capability::EventPublish]);
        let result = kernel
            .execute(PipelineRequest::new(input.clone()).with_capabilities(granted))
            .await;
        assert_eq!(result.status, PipelineStatus::Completed);
        assert_eq!(result.final_data["length"], json!(11));

        // Without the grant the overlay is refused before the sandbox is entered.
        let denied = kernel.execute(PipelineRequest::new(input)).await;
        assert_eq!(denied.status, PipelineStatus::Completed);
        let analysis = denied.phase(PipelinePhase::Analysis).unwrap();
        assert_eq!(analysis.status, PhaseStatus::Failed);
        assert_eq!(module.invocations.load(Ordering::SeqCst), 1);

        kernel.shutdown(Duration::from_secs(5)).await;
        let patterns = patterns.lock();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].source, "overlay:summarizer");
        assert_eq!(patterns[0].payload["length"], json!(11));
        assert_eq!(kernel.sandbox().summary().total_invocations, 1);
    }

    #[tokio::test]
    async fn test_spent_request_fuel_never_enters_the_sandbox() {
        let kernel = kernel_with(&[]);
        let module = Arc::new(Summarizer::default());
        let manifest = SandboxManifest::new("summarizer", "1.0.0")
            .with_capability(Capability::EventPublish)
            .export("summarize");
        let overlay = SandboxedOverlay::new(
            Arc::clone(kernel.sandbox()),
            manifest,
            module.clone(),
            SecurityMode::Standard,
            "summarize",
        );
        let id = kernel
            .register_overlay(Arc::new(overlay), &[PipelinePhase::Analysis])
            .await
            .unwrap();
        kernel.start().await.unwrap();

        let mut spent = FuelBudget::new(1_000, Duration::from_secs(5));
        spent.consume(1_000);
        let result = kernel
            .execute(
                PipelineRequest::new(Payload::new())
                    .with_capabilities(CapabilitySet::from([Capability::EventPublish]))
                    .with_fuel(spent),
            )
            .await;

        let analysis = result.phase(PipelinePhase::Analysis).unwrap();
        assert_eq!(analysis.status, PhaseStatus::Failed);
        assert_eq!(analysis.attempts, 1);
        assert!(analysis.overlay_results[0]
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("fuel exhausted"));
        assert_eq!(module.invocations.load(Ordering::SeqCst), 0);
        assert_eq!(kernel.manager().circuit_state(&id), CircuitState::Closed);

        let sandbox = kernel.sandbox().summary();
        assert_eq!(sandbox.total_invocations, 0);
        assert!(sandbox
            .instances
            .iter()
            .all(|i| i.state == ExecutionState::Ready));
        kernel.shutdown(Duration::from_secs(5)).await;
    }
}
