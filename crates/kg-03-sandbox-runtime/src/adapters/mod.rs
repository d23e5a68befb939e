//! # Adapters
//!
//! - [`InMemoryQueryExecutor`]: storage port backed by canned rows, for tests
//!   and embedded use.
//! - [`SandboxedOverlay`]: plugs a sandbox instance into the overlay contract.

pub mod in_memory;
pub mod overlay_bridge;

pub use in_memory::InMemoryQueryExecutor;
pub use overlay_bridge::SandboxedOverlay;
