//! Pipeline runs and their state machine.
//!
//! `Pending -> Running(i) -> {Succeeded, Failed(i, reason)}`. A run is
//! created at trigger time and is not modified once it reaches a terminal
//! state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{Event, EventType, RunInfo, StepStatus};
use super::outputs::OutputMap;
use super::release::{ReleaseCoordinates, Trigger};

/// Kind of work a step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Provision,
    Build,
    Sign,
    Package,
    Publish,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Build => "build",
            Self::Sign => "sign",
            Self::Package => "package",
            Self::Publish => "publish",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step as declared by the pipeline (name and kind only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredStep {
    pub name: String,
    pub kind: StepKind,
}

/// Result of one step within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub kind: StepKind,
    pub status: StepStatus,
    pub outputs: BTreeMap<String, String>,
    pub attempts: u32,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl StepResult {
    fn pending(step: &DeclaredStep) -> Self {
        Self {
            name: step.name.clone(),
            kind: step.kind,
            status: StepStatus::Pending,
            outputs: BTreeMap::new(),
            attempts: 0,
            duration_ms: None,
            error: None,
        }
    }
}

/// One execution of a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub pipeline_name: String,
    pub trigger: Trigger,
    pub release: ReleaseCoordinates,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// One entry per declared step, in declaration order
    pub steps: Vec<StepResult>,

    /// Outputs of succeeded steps, keyed by step name
    pub outputs: OutputMap,
}

impl PipelineRun {
    /// Create a pending run for the given steps
    pub fn new(
        id: Uuid,
        pipeline_name: String,
        trigger: Trigger,
        release: ReleaseCoordinates,
        steps: &[DeclaredStep],
    ) -> Self {
        Self {
            id,
            pipeline_name,
            trigger,
            release,
            state: RunState::Pending,
            started_at: Utc::now(),
            completed_at: None,
            steps: steps.iter().map(StepResult::pending).collect(),
            outputs: OutputMap::new(),
        }
    }

    /// Run metadata recorded in the `RunStarted` event
    pub fn info(&self) -> RunInfo {
        RunInfo {
            pipeline_name: self.pipeline_name.clone(),
            release: self.release.clone(),
            trigger: self.trigger.clone(),
            steps: self
                .steps
                .iter()
                .map(|s| DeclaredStep {
                    name: s.name.clone(),
                    kind: s.kind,
                })
                .collect(),
        }
    }

    /// Rebuild a run from its event log
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first = events.first()?;
        let info = events.iter().find_map(|e| e.run_info.clone())?;

        let mut run = Self::new(
            first.run_id,
            info.pipeline_name,
            info.trigger,
            info.release,
            &info.steps,
        );
        run.started_at = first.timestamp;

        for event in events {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &Event) {
        let index = event.step_index;

        match event.event_type {
            EventType::RunStarted => {
                self.started_at = event.timestamp;
            }
            EventType::RunSucceeded => {
                self.state = RunState::Succeeded;
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunFailed => {
                let step = index.unwrap_or(0);
                self.state = RunState::Failed {
                    step,
                    step_name: event.step.clone().unwrap_or_default(),
                    reason: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::StepStarted => {
                if let Some(i) = index {
                    self.state = RunState::Running { step: i };
                    if let Some(result) = self.steps.get_mut(i) {
                        result.status = StepStatus::Running;
                        result.attempts += 1;
                    }
                }
            }
            EventType::StepRetrying => {
                if let Some(result) = index.and_then(|i| self.steps.get_mut(i)) {
                    result.error = event.error.clone();
                }
            }
            EventType::StepSucceeded => {
                if let Some(result) = index.and_then(|i| self.steps.get_mut(i)) {
                    let outputs = event.outputs.clone().unwrap_or_default();
                    result.status = StepStatus::Succeeded;
                    result.duration_ms = event.duration_ms;
                    result.error = None;
                    result.outputs = outputs.clone();
                    self.outputs.insert(&result.name, outputs);
                }
            }
            EventType::StepFailed => {
                if let Some(result) = index.and_then(|i| self.steps.get_mut(i)) {
                    result.status = StepStatus::Failed;
                    result.duration_ms = event.duration_ms;
                    result.error = event.error.clone();
                }
            }
            EventType::StepSkipped => {
                if let Some(result) = index.and_then(|i| self.steps.get_mut(i)) {
                    result.status = StepStatus::Skipped;
                }
            }
        }
    }

    /// Whether the run reached a terminal state
    pub fn is_finished(&self) -> bool {
        matches!(self.state, RunState::Succeeded | RunState::Failed { .. })
    }

    /// Process exit code for this run: 0 on success, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        self.state.exit_code()
    }

    /// Steps that actually executed (succeeded or failed), in order
    pub fn executed_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Succeeded | StepStatus::Failed))
    }
}

/// State of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Created, no step started yet
    Pending,

    /// Executing the step at this index
    Running { step: usize },

    /// Every step succeeded
    Succeeded,

    /// The step at `step` failed; no later step ran
    Failed {
        step: usize,
        step_name: String,
        reason: String,
    },
}

impl RunState {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Succeeded => 0,
            _ => 1,
        }
    }

    /// Short lowercase label for listings
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running { .. } => "running",
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::Pending
    }
}
