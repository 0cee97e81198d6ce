//! Event types for the run log.
//!
//! Every state change of a run is recorded as an immutable event in an
//! append-only log. Secrets never appear in events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::release::{ReleaseCoordinates, Trigger};
use super::run::DeclaredStep;

/// A single event in the append-only event log.
///
/// The state of any run can be reconstructed by replaying its events in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Step name (if applicable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,

    /// Position of the step in the pipeline (if applicable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,

    pub event_type: EventType,

    /// Human-readable summary (NO secrets)
    pub summary: String,

    pub status: StepStatus,

    /// Time taken in milliseconds (for finished steps)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Outputs declared by a succeeded step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<BTreeMap<String, String>>,

    /// Run metadata, carried by `RunStarted`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_info: Option<RunInfo>,
}

/// What was started: recorded once per run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub pipeline_name: String,
    pub release: ReleaseCoordinates,
    pub trigger: Trigger,
    /// Declared steps, in order
    pub steps: Vec<DeclaredStep>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        event_type: EventType,
        summary: impl Into<String>,
        status: StepStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            step: None,
            step_index: None,
            event_type,
            summary: summary.into(),
            status,
            duration_ms: None,
            error: None,
            outputs: None,
            run_info: None,
        }
    }

    /// Attach the step this event is about
    pub fn for_step(mut self, index: usize, name: impl Into<String>) -> Self {
        self.step_index = Some(index);
        self.step = Some(name.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_outputs(mut self, outputs: BTreeMap<String, String>) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn with_run_info(mut self, info: RunInfo) -> Self {
        self.run_info = Some(info);
        self
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    RunSucceeded,
    RunFailed,
    StepStarted,
    StepSucceeded,

    /// A step failed permanently
    StepFailed,

    /// A step attempt failed with a transient error and will be retried
    StepRetrying,

    /// A step was not executed because an earlier step failed
    StepSkipped,
}

/// Status of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet started
    Pending,

    /// Currently executing
    Running,

    Succeeded,

    Failed,

    /// Not executed (fail-fast after an earlier failure)
    Skipped,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}
