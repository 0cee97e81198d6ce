//! Core orchestration logic.
//!
//! This module contains:
//! - EventStore: Append-only event logging
//! - Pipeline: Pipeline definitions and loading
//! - Safety: Safety limits and enforcement
//! - StepError: Why a step failed
//! - Orchestrator: Main execution engine

pub mod error;
pub mod event_store;
pub mod orchestrator;
pub mod pipeline;
pub mod safety;

// Re-export commonly used types
pub use error::StepError;
pub use event_store::EventStore;
pub use orchestrator::{Components, Orchestrator};
pub use pipeline::{Pipeline, RetryPolicy, Step, RUN_VARIABLES};
pub use safety::{SafetyLimits, SafetyTracker, SafetyViolation};
