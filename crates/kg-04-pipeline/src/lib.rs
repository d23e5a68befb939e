//! # KG-04 Pipeline Scheduler
//!
//! Drives every unit of work through seven fixed phases, running the overlays
//! registered for each phase through the overlay manager.
//!
//! ## Phases
//!
//! ```text
//! Ingestion ──► Analysis ──► Validation ──► Consensus ──► Execution ──► Propagation ──► Settlement
//!  required     optional      required       optional      required      optional        required
//!  sequential   parallel      parallel       sequential    sequential    parallel        sequential
//! ```
//!
//! ## Guarantees
//!
//! | Guarantee | Enforcement |
//! |-----------|-------------|
//! | Results always in phase order | `service.rs` - single loop over `PipelinePhase::ALL` |
//! | A slow overlay never stalls siblings | per-overlay `timeout_at` under one phase deadline |
//! | Optional phases never fail the run | failures become `PipelineResult::warnings` |
//! | Callers always get an answer | `Pipeline::execute` returns a result, never an error |
//!
//! ## Events Published
//!
//! | Event | When |
//! |-------|------|
//! | `PipelineStarted` | run admitted |
//! | `PipelinePhaseComplete` | after every phase that ran |
//! | `PipelineCompleted` / `PipelineFailed` | terminal status reached |

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod domain;
pub mod errors;
pub mod ports;
pub mod service;

pub use domain::{
    ActivePipeline, PhaseConfig, PhaseResult, PhaseStatus, PipelineContext, PipelinePhase,
    PipelineRequest, PipelineResult, PipelineStats, PipelineStatus,
};
pub use errors::PipelineError;
pub use ports::{PhaseHandler, PhaseHook};
pub use service::{Pipeline, PipelineConfig, PIPELINE_SOURCE};
