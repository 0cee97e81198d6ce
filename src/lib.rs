//! ferry - Release pipeline orchestrator
//!
//! Takes a source checkout through provision, build, sign, package and
//! publish, as a pipeline of named steps described in YAML.
//!
//! # Architecture
//!
//! - A pipeline is data: ordered steps, each of one kind with string options
//! - One orchestrator loop interprets the steps, halting on the first failure
//! - Step outputs flow forward through `${step.key}` interpolation
//! - Every external tool sits behind a component trait, so runs are testable
//!   with fakes
//! - Every state change is recorded as an event; run state is derived by
//!   replaying them
//!
//! # Modules
//!
//! - `adapters`: Component traits and their implementations (rustup, cargo,
//!   tar.gz, Ed25519, registry)
//! - `core`: Orchestration logic (EventStore, Pipeline, Safety, Orchestrator)
//! - `domain`: Data structures (Event, PipelineRun, Artifact, Package)
//! - `secrets`: Redacting credential handle
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a pipeline
//! ferry run release --platform x86-windows --channel nightly
//!
//! # Check run status
//! ferry status <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod secrets;

// Re-export main types at crate root for convenience
pub use core::{Components, Orchestrator, Pipeline};
pub use domain::{Event, EventType, PipelineRun, ReleaseCoordinates, RunState};
pub use secrets::Secret;
