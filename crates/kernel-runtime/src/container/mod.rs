//! # Container
//!
//! Configuration and wiring of the kernel components.

pub mod config;

pub use config::{ConfigError, KernelConfig};
