//! # In-Memory Storage
//!
//! Storage port for testing. Reads return rows registered per query text;
//! writes are recorded in order.

use crate::errors::QueryError;
use crate::ports::QueryExecutor;
use async_trait::async_trait;
use parking_lot::RwLock;
use shared_types::Payload;
use std::collections::HashMap;

/// In-memory query executor.
#[derive(Debug, Default)]
pub struct InMemoryQueryExecutor {
    results: RwLock<HashMap<String, Vec<Payload>>>,
    writes: RwLock<Vec<(String, Payload)>>,
    reads: RwLock<Vec<String>>,
}

impl InMemoryQueryExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows returned for `query`.
    pub fn set_result(&self, query: impl Into<String>, rows: Vec<Payload>) {
        self.results.write().insert(query.into(), rows);
    }

    /// Builder-style [`set_result`](Self::set_result).
    #[must_use]
    pub fn with_result(self, query: impl Into<String>, rows: Vec<Payload>) -> Self {
        self.set_result(query, rows);
        self
    }

    /// Every write seen so far, oldest first.
    #[must_use]
    pub fn writes(&self) -> Vec<(String, Payload)> {
        self.writes.read().clone()
    }

    /// Every read query seen so far, oldest first.
    #[must_use]
    pub fn reads(&self) -> Vec<String> {
        self.reads.read().clone()
    }
}

#[async_trait]
impl QueryExecutor for InMemoryQueryExecutor {
    async fn execute(&self, query: &str, _params: &Payload) -> Result<Vec<Payload>, QueryError> {
        self.reads.write().push(query.to_string());
        Ok(self.results.read().get(query).cloned().unwrap_or_default())
    }

    async fn execute_write(&self, query: &str, params: &Payload) -> Result<u64, QueryError> {
        self.writes.write().push((query.to_string(), params.clone()));
        Ok(1)
    }
}
