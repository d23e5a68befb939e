//! # Shared Types Crate
//!
//! Primitives shared by every kernel crate: the event bus, the overlay
//! contract, the overlay manager, the sandbox runtime and the pipeline.
//!
//! ## Design Principles
//!
//! - **Closed sets**: capabilities, trust levels and overlay states are enums,
//!   never free-form strings.
//! - **Monotonic fuel**: a [`FuelBudget`] only ever moves towards exhaustion.
//! - **Bounded memory**: every in-memory history is a [`BoundedHistory`].

pub mod entities;
pub mod errors;
pub mod fuel;
pub mod history;

pub use entities::*;
pub use errors::*;
pub use fuel::FuelBudget;
pub use history::BoundedHistory;
