//! Pipeline definitions and loading.
//!
//! Pipelines are defined in YAML and consist of ordered steps, each of one
//! kind (`provision`, `build`, `sign`, `package`, `publish`) with a string
//! option map. Option and env values may reference earlier step outputs as
//! `${step.key}` and run variables as `${run.version}`.
//!
//! ```yaml
//! name: release
//! description: Ship the CLI
//! steps:
//!   - name: toolchain
//!     kind: provision
//!     options: { channel: stable }
//!   - name: build
//!     kind: build
//!     options:
//!       binary: app
//!       toolchain: ${toolchain.toolchain}
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::outputs::{references, RUN_SCOPE};
use crate::domain::{DeclaredStep, StepKind};

use super::safety::SafetyLimits;

/// Run variables available as `${run.<key>}`
pub const RUN_VARIABLES: &[&str] = &["id", "version", "channel", "platform", "target"];

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name (used in CLI and run records)
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Safety limits for this pipeline
    #[serde(default)]
    pub limits: SafetyLimits,

    /// Ordered list of steps to execute
    pub steps: Vec<Step>,
}

impl Pipeline {
    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Load a pipeline, using `defaults` when it declares no `limits`
    pub fn from_file_with_defaults(path: &Path, defaults: &SafetyLimits) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        let mut value: serde_yaml::Value =
            serde_yaml::from_str(&content).context("Failed to parse pipeline YAML")?;

        if let Some(map) = value.as_mapping_mut() {
            let key = serde_yaml::Value::from("limits");
            if !map.contains_key(&key) {
                map.insert(key, serde_yaml::to_value(defaults)?);
            }
        }

        serde_yaml::from_value(value).context("Failed to parse pipeline YAML")
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Pipeline name cannot be empty");
        }

        if self.steps.is_empty() {
            anyhow::bail!("Pipeline must have at least one step");
        }

        if self.steps.len() as u64 > u64::from(self.limits.max_steps) {
            anyhow::bail!(
                "Pipeline has {} steps, limit is {}",
                self.steps.len(),
                self.limits.max_steps
            );
        }

        for (i, step) in self.steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                anyhow::bail!("Step {} has an empty name", i);
            }

            if step.name == RUN_SCOPE {
                anyhow::bail!("Step name '{}' is reserved", RUN_SCOPE);
            }

            if self.steps[..i].iter().any(|s| s.name == step.name) {
                anyhow::bail!("Duplicate step name '{}'", step.name);
            }

            if step.retry_policy.max_attempts == 0 {
                anyhow::bail!("Step '{}' has max_attempts 0", step.name);
            }

            self.validate_references(i, step)?;

            if step.kind == StepKind::Build && !step.options.contains_key("binary") {
                anyhow::bail!("Build step '{}' requires a 'binary' option", step.name);
            }

            if step.kind == StepKind::Publish {
                self.validate_publish(i, step)?;
            }
        }

        Ok(())
    }

    /// Every `${scope.key}` must name a run variable or an earlier step
    fn validate_references(&self, index: usize, step: &Step) -> Result<()> {
        for (key, value) in step.options.iter().chain(step.env.iter()) {
            let refs = references(value)
                .with_context(|| format!("Step '{}': invalid value for '{}'", step.name, key))?;

            for reference in refs {
                if reference.scope == RUN_SCOPE {
                    if !RUN_VARIABLES.contains(&reference.key.as_str()) {
                        anyhow::bail!(
                            "Step '{}' references unknown run variable {}",
                            step.name,
                            reference
                        );
                    }
                    continue;
                }

                match self.step_index(&reference.scope) {
                    Some(idx) if idx >= index => anyhow::bail!(
                        "Step '{}' references future step '{}' (forward references not allowed)",
                        step.name,
                        reference.scope
                    ),
                    None => anyhow::bail!(
                        "Step '{}' references non-existent step '{}'",
                        step.name,
                        reference.scope
                    ),
                    _ => {}
                }
            }
        }

        Ok(())
    }

    /// A publish step needs an earlier package step, itself preceded by a sign step
    fn validate_publish(&self, index: usize, step: &Step) -> Result<()> {
        let package_index = self
            .package_step_for(index)
            .with_context(|| format!("Publish step '{}' has no package step before it", step.name))?;

        let package_step = &self.steps[package_index];
        if package_step.kind != StepKind::Package {
            anyhow::bail!(
                "Publish step '{}' names '{}', which is not a package step",
                step.name,
                package_step.name
            );
        }

        let signed_before = self.steps[..package_index]
            .iter()
            .any(|s| s.kind == StepKind::Sign);
        if !signed_before {
            anyhow::bail!(
                "Package step '{}' feeds publish step '{}' but no sign step runs before it",
                package_step.name,
                step.name
            );
        }

        Ok(())
    }

    /// Index of the package step a publish step consumes: the `package`
    /// option if given, otherwise the nearest earlier package step.
    pub fn package_step_for(&self, publish_index: usize) -> Option<usize> {
        let step = self.steps.get(publish_index)?;
        match step.options.get("package") {
            Some(name) => self
                .step_index(name)
                .filter(|&idx| idx < publish_index),
            None => self.steps[..publish_index]
                .iter()
                .rposition(|s| s.kind == StepKind::Package),
        }
    }

    /// Get a step by name
    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Get the index of a step by name
    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Step names and kinds, in order
    pub fn declared_steps(&self) -> Vec<DeclaredStep> {
        self.steps
            .iter()
            .map(|s| DeclaredStep {
                name: s.name.clone(),
                kind: s.kind,
            })
            .collect()
    }
}

/// A single step in a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step name (unique within pipeline)
    pub name: String,

    pub kind: StepKind,

    /// Kind-specific options; values may contain `${...}` references
    #[serde(default)]
    pub options: BTreeMap<String, String>,

    /// Environment for processes the step spawns
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Retry policy for this step
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Override timeout for this step (uses limits.step_timeout_seconds if not set)
    pub timeout_seconds: Option<u64>,
}

impl Step {
    /// Get the effective timeout for this step
    pub fn timeout(&self, limits: &SafetyLimits) -> Duration {
        limits.step_timeout(self.timeout_seconds)
    }
}

/// Retry policy for failed steps. Only transient errors are retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    1
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
