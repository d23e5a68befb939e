//! # Integration Scenarios
//!
//! Every scenario wires real components together; only overlays and
//! sandbox modules are doubles.

pub mod circuit_breaking;
pub mod event_routing;
pub mod kernel_lifecycle;
pub mod pipeline_flows;
pub mod sandbox_isolation;

#[cfg(test)]
pub(crate) mod support {
    use kernel_runtime::{Kernel, KernelConfig};
    use serde_json::json;
    use shared_bus::{handler_fn, Event, EventHandler};
    use shared_types::Payload;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Kernel built from `KG_*` style overrides.
    pub fn kernel_with(pairs: &[(&str, &str)]) -> Kernel {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let config = KernelConfig::from_lookup(|key| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        })
        .unwrap();
        Kernel::new(config, None, None).unwrap()
    }

    pub fn payload(key: &str, value: i64) -> Payload {
        let mut p = Payload::new();
        p.insert(key.into(), json!(value));
        p
    }

    /// Handler counting every delivery.
    pub fn counting(counter: Arc<AtomicU32>) -> Arc<dyn EventHandler> {
        handler_fn(move |_event: Arc<Event>| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    /// Poll `done` every 5ms for up to two seconds.
    pub async fn eventually(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..400 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }
}
