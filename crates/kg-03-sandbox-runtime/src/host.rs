//! # Host Context
//!
//! The only handle instance code gets on the host. It carries the instance's
//! binding table, built at load time from the declared capabilities: a
//! function whose capability was not declared has no entry, so there is
//! nothing to call, not merely a permission to fail.
//!
//! The table is shared with the instance record. `terminate` clears it, which
//! also cuts off a call still in flight.

use crate::domain::HostFunction;
use crate::errors::HostError;
use crate::ports::{ExternalHost, QueryExecutor};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{json, Value};
use shared_bus::{overlay_source, Event, EventBus, EventType};
use shared_types::{CapabilitySet, Payload};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// =============================================================================
// PORTS AND BINDINGS
// =============================================================================

/// Backends available to the runtime. Missing backends leave the matching
/// host functions unbound even when the capability is declared.
#[derive(Clone, Default)]
pub struct HostPorts {
    pub storage: Option<Arc<dyn QueryExecutor>>,
    pub bus: Option<EventBus>,
    pub external: Option<Arc<dyn ExternalHost>>,
}

impl HostPorts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn QueryExecutor>) -> Self {
        self.storage = Some(storage);
        self
    }

    #[must_use]
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    #[must_use]
    pub fn with_external(mut self, external: Arc<dyn ExternalHost>) -> Self {
        self.external = Some(external);
        self
    }
}

#[derive(Clone)]
enum Binding {
    Builtin,
    Storage(Arc<dyn QueryExecutor>),
    Bus(EventBus),
    External(Arc<dyn ExternalHost>),
}

/// Host functions bound for one instance.
#[derive(Clone, Default)]
pub(crate) struct BindingTable(HashMap<HostFunction, Binding>);

impl BindingTable {
    /// Bind every function unlocked by `granted` that has a backend.
    pub(crate) fn build(granted: &CapabilitySet, ports: &HostPorts) -> Self {
        let mut table = HashMap::new();
        for function in HostFunction::ALL {
            if !function.is_unlocked_by(granted) {
                continue;
            }
            let binding = match function {
                HostFunction::Log | HostFunction::Now => Some(Binding::Builtin),
                HostFunction::DbQuery | HostFunction::DbQuerySingle | HostFunction::DbWrite => {
                    ports.storage.clone().map(Binding::Storage)
                }
                HostFunction::PublishEvent => ports.bus.clone().map(Binding::Bus),
                _ => ports.external.clone().map(Binding::External),
            };
            match binding {
                Some(binding) => {
                    table.insert(function, binding);
                }
                None => debug!(%function, "No backend, host function left unbound"),
            }
        }
        Self(table)
    }

    pub(crate) fn functions(&self) -> Vec<HostFunction> {
        let mut functions: Vec<_> = self.0.keys().copied().collect();
        functions.sort();
        functions
    }

    pub(crate) fn clear(&mut self) {
        self.0.clear();
    }

    fn get(&self, function: HostFunction) -> Option<Binding> {
        self.0.get(&function).cloned()
    }
}

pub(crate) type SharedBindings = Arc<RwLock<BindingTable>>;

// =============================================================================
// HOST CONTEXT
// =============================================================================

/// Per-call handle on the host.
pub struct HostContext {
    instance_id: String,
    instance_name: String,
    bindings: SharedBindings,
    host_call_cost: u64,
    allowance: u64,
    host_calls: AtomicU64,
    cancellation: CancellationToken,
}

impl HostContext {
    pub(crate) fn new(
        instance_id: String,
        instance_name: String,
        bindings: SharedBindings,
        host_call_cost: u64,
        allowance: u64,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            instance_id,
            instance_name,
            bindings,
            host_call_cost,
            allowance,
            host_calls: AtomicU64::new(0),
            cancellation,
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[must_use]
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Returns true if `function` is in the binding table.
    #[must_use]
    pub fn is_bound(&self, function: HostFunction) -> bool {
        self.bindings.read().get(function).is_some()
    }

    #[must_use]
    pub fn bound_functions(&self) -> Vec<HostFunction> {
        self.bindings.read().functions()
    }

    /// Host calls made so far in this call.
    #[must_use]
    pub fn host_calls(&self) -> u64 {
        self.host_calls.load(Ordering::SeqCst)
    }

    /// Cooperative cancellation for long-running instance code.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Look up the binding and charge one host call.
    fn enter(&self, function: HostFunction) -> Result<Binding, HostError> {
        let binding = self
            .bindings
            .read()
            .get(function)
            .ok_or(HostError::NotBound(function))?;
        let calls = self.host_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if calls.saturating_mul(self.host_call_cost) > self.allowance {
            return Err(HostError::OutOfFuel { calls });
        }
        Ok(binding)
    }

    // =========================================================================
    // TYPED HOST FUNCTIONS
    // =========================================================================

    pub fn log(&self, message: &str) -> Result<(), HostError> {
        self.enter(HostFunction::Log)?;
        info!(
            instance = %self.instance_name,
            instance_id = %self.instance_id,
            message,
            "Sandbox log"
        );
        Ok(())
    }

    pub fn now(&self) -> Result<DateTime<Utc>, HostError> {
        self.enter(HostFunction::Now)?;
        Ok(Utc::now())
    }

    pub async fn query(&self, query: &str, params: &Payload) -> Result<Vec<Payload>, HostError> {
        match self.enter(HostFunction::DbQuery)? {
            Binding::Storage(storage) => Ok(storage.execute(query, params).await?),
            _ => Err(HostError::NotBound(HostFunction::DbQuery)),
        }
    }

    pub async fn query_single(
        &self,
        query: &str,
        params: &Payload,
    ) -> Result<Option<Payload>, HostError> {
        match self.enter(HostFunction::DbQuerySingle)? {
            Binding::Storage(storage) => Ok(storage.execute_single(query, params).await?),
            _ => Err(HostError::NotBound(HostFunction::DbQuerySingle)),
        }
    }

    pub async fn write(&self, query: &str, params: &Payload) -> Result<u64, HostError> {
        match self.enter(HostFunction::DbWrite)? {
            Binding::Storage(storage) => Ok(storage.execute_write(query, params).await?),
            _ => Err(HostError::NotBound(HostFunction::DbWrite)),
        }
    }

    /// Publish on the bus as `overlay:<instance name>`. Returns the event id.
    pub async fn publish(&self, event_type: EventType, payload: Payload) -> Result<String, HostError> {
        match self.enter(HostFunction::PublishEvent)? {
            Binding::Bus(bus) => {
                let event = Event::new(event_type, overlay_source(&self.instance_name), payload);
                let event = bus
                    .publish_event(event)
                    .await
                    .map_err(|e| HostError::Backend(e.to_string()))?;
                Ok(event.id.clone())
            }
            _ => Err(HostError::NotBound(HostFunction::PublishEvent)),
        }
    }

    // =========================================================================
    // GENERIC DISPATCH
    // =========================================================================

    /// Call any host function with JSON arguments.
    ///
    /// | Function | Arguments |
    /// |----------|-----------|
    /// | `log` | `message` |
    /// | `db_query`, `db_query_single`, `db_write` | `query`, optional `params` |
    /// | `publish_event` | `event_type` (wire name), optional `payload` |
    /// | everything else | passed through to the [`ExternalHost`] |
    pub async fn call(&self, function: HostFunction, args: Payload) -> Result<Value, HostError> {
        match function {
            HostFunction::Log => {
                self.log(str_arg(function, &args, "message")?)?;
                Ok(Value::Null)
            }
            HostFunction::Now => Ok(json!(self.now()?.to_rfc3339())),
            HostFunction::DbQuery => {
                let rows = self
                    .query(str_arg(function, &args, "query")?, &object_arg(&args, "params"))
                    .await?;
                Ok(Value::Array(rows.into_iter().map(Value::Object).collect()))
            }
            HostFunction::DbQuerySingle => {
                let row = self
                    .query_single(str_arg(function, &args, "query")?, &object_arg(&args, "params"))
                    .await?;
                Ok(row.map_or(Value::Null, Value::Object))
            }
            HostFunction::DbWrite => {
                let affected = self
                    .write(str_arg(function, &args, "query")?, &object_arg(&args, "params"))
                    .await?;
                Ok(json!(affected))
            }
            HostFunction::PublishEvent => {
                let raw = args.get("event_type").cloned().unwrap_or(Value::Null);
                let event_type: EventType =
                    serde_json::from_value(raw).map_err(|e| HostError::InvalidArguments {
                        function,
                        reason: e.to_string(),
                    })?;
                let id = self.publish(event_type, object_arg(&args, "payload")).await?;
                Ok(json!(id))
            }
            _ => match self.enter(function)? {
                Binding::External(external) => external.invoke(function, args).await,
                _ => Err(HostError::NotBound(function)),
            },
        }
    }
}

fn str_arg<'a>(function: HostFunction, args: &'a Payload, key: &str) -> Result<&'a str, HostError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| HostError::InvalidArguments {
            function,
            reason: format!("missing string argument `{key}`"),
        })
}

fn object_arg(args: &Payload, key: &str) -> Payload {
    args.get(key)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}
