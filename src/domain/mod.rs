//! Domain types for the ferry orchestrator.
//!
//! This module contains the core data structures:
//! - Events: Immutable records of run state changes
//! - Run: Pipeline execution state and step results
//! - Artifact / Package: Build outputs and distributable archives
//! - Release: Platform, version, channel and trigger
//! - Outputs: The shared step output mapping

pub mod artifact;
pub mod events;
pub mod outputs;
pub mod package;
pub mod release;
pub mod run;

// Re-export commonly used types
pub use artifact::{hash_file, Artifact, SignatureInfo};
pub use events::{Event, EventType, RunInfo, StepStatus};
pub use outputs::{InterpolationError, OutputMap, Reference};
pub use package::{ManifestEntry, Package, PackageManifest};
pub use release::{check_path_segment, compute_version, Platform, ReleaseCoordinates, Trigger};
pub use run::{DeclaredStep, PipelineRun, RunState, StepKind, StepResult};
