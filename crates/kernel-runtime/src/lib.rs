//! # Kernel Runtime Library
//!
//! Composition root of the knowledge-graph kernel. Every component is an
//! owned object built here and handed to its collaborators; there are no
//! process-wide singletons.
//!
//! ## Modular Structure
//!
//! - `container/` - configuration with `KG_*` environment overrides
//! - `kernel` - component wiring and startup/shutdown ordering
//!
//! The binary in `main.rs` adds logging and signal handling.

#![warn(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod container;
pub mod kernel;

pub use container::{ConfigError, KernelConfig};
pub use kernel::{Kernel, KernelError, KernelSnapshot, KernelState};
