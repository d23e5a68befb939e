//! # Ports
//!
//! - Inbound: [`SandboxModule`], the code an instance runs.
//! - Outbound: [`QueryExecutor`] and [`ExternalHost`], the backends host
//!   functions are served by.

pub mod inbound;
pub mod outbound;

pub use inbound::SandboxModule;
pub use outbound::{ExternalHost, QueryExecutor};
