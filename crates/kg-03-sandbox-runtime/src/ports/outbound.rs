//! # Driven Ports
//!
//! Backends behind the host functions. The runtime never talks to storage or
//! the outside world except through these traits.

use crate::domain::HostFunction;
use crate::errors::{HostError, QueryError};
use async_trait::async_trait;
use serde_json::Value;
use shared_types::Payload;

// =============================================================================
// GRAPH STORAGE
// =============================================================================

/// Generic query executor provided by the graph storage layer.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Run a read query and return every row.
    async fn execute(&self, query: &str, params: &Payload) -> Result<Vec<Payload>, QueryError>;

    /// Run a read query and return the first row.
    async fn execute_single(
        &self,
        query: &str,
        params: &Payload,
    ) -> Result<Option<Payload>, QueryError> {
        Ok(self.execute(query, params).await?.into_iter().next())
    }

    /// Run a write query. Returns the number of affected records.
    async fn execute_write(&self, query: &str, params: &Payload) -> Result<u64, QueryError>;
}

// =============================================================================
// EVERYTHING ELSE
// =============================================================================

/// Serves capsule, governance, network, LLM and file host functions.
///
/// Only ever called for functions present in the caller's binding table.
#[async_trait]
pub trait ExternalHost: Send + Sync {
    async fn invoke(&self, function: HostFunction, args: Payload) -> Result<Value, HostError>;
}
