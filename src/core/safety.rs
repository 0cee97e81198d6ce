//! Safety limits and enforcement for pipeline runs.
//!
//! Bounds a run through configurable limits on:
//! - Number of steps
//! - Per-step and whole-run timeouts
//! - Package size
//! - Denylist patterns (so key material never ends up in a package)

use std::time::{Duration, Instant};

use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Safety limits for pipeline execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Maximum number of steps per run (default: 20)
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Per-step timeout in seconds (default: 1800 = 30 min)
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,

    /// Total run timeout in seconds (default: 7200 = 2 hours)
    #[serde(default = "default_run_timeout")]
    pub run_timeout_seconds: u64,

    /// Largest package the publisher may upload (default: 512MB)
    #[serde(default = "default_max_package_bytes")]
    pub max_package_bytes: u64,

    /// Glob patterns for files that must never be packaged
    #[serde(default = "default_denylist")]
    pub denylist_patterns: Vec<String>,
}

fn default_max_steps() -> u32 {
    20
}
fn default_step_timeout() -> u64 {
    1800
}
fn default_run_timeout() -> u64 {
    7200
}
fn default_max_package_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_denylist() -> Vec<String> {
    vec![
        "**/.env*".to_string(),
        "**/secrets*".to_string(),
        "**/*credential*".to_string(),
        "**/*.pem".to_string(),
        "**/*.key".to_string(),
        "**/*.pfx".to_string(),
    ]
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            step_timeout_seconds: default_step_timeout(),
            run_timeout_seconds: default_run_timeout(),
            max_package_bytes: default_max_package_bytes(),
            denylist_patterns: default_denylist(),
        }
    }
}

impl SafetyLimits {
    /// Check if a path matches any denylist pattern
    pub fn is_denylisted(&self, path: &str) -> bool {
        self.denylist_patterns
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .any(|pattern| pattern.matches(path))
    }

    /// Timeout for a step, honoring a per-step override
    pub fn step_timeout(&self, override_seconds: Option<u64>) -> Duration {
        Duration::from_secs(override_seconds.unwrap_or(self.step_timeout_seconds))
    }

    /// Reject packages over the size limit
    pub fn validate_package_size(&self, size_bytes: u64) -> Result<(), SafetyViolation> {
        if size_bytes > self.max_package_bytes {
            return Err(SafetyViolation::MaxPackageBytes {
                actual: size_bytes,
                limit: self.max_package_bytes,
            });
        }
        Ok(())
    }

    /// Time left before the run timeout
    pub fn run_time_remaining(&self, tracker: &SafetyTracker) -> Duration {
        Duration::from_secs(self.run_timeout_seconds).saturating_sub(tracker.started_at.elapsed())
    }

    /// The violation reported when the run budget expires mid-step
    pub fn run_timeout_violation(&self, tracker: &SafetyTracker) -> SafetyViolation {
        SafetyViolation::RunTimeout {
            elapsed_seconds: tracker.elapsed_seconds(),
            limit_seconds: self.run_timeout_seconds,
        }
    }

    /// Check current tracker state before starting another step
    pub fn check(&self, tracker: &SafetyTracker) -> Result<(), SafetyViolation> {
        if tracker.steps_executed >= self.max_steps {
            return Err(SafetyViolation::MaxSteps {
                actual: tracker.steps_executed,
                limit: self.max_steps,
            });
        }

        let elapsed = tracker.elapsed_seconds();
        if elapsed >= self.run_timeout_seconds {
            return Err(SafetyViolation::RunTimeout {
                elapsed_seconds: elapsed,
                limit_seconds: self.run_timeout_seconds,
            });
        }

        Ok(())
    }
}

/// Tracks resource usage during a run
#[derive(Debug, Clone)]
pub struct SafetyTracker {
    /// Number of step attempts executed
    pub steps_executed: u32,

    /// When the run started
    pub started_at: Instant,
}

impl Default for SafetyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyTracker {
    pub fn new() -> Self {
        Self {
            steps_executed: 0,
            started_at: Instant::now(),
        }
    }

    pub fn record_step(&mut self) {
        self.steps_executed += 1;
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Safety violation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyViolation {
    #[error("Maximum steps exceeded: {actual} >= {limit}")]
    MaxSteps { actual: u32, limit: u32 },

    #[error("Run timeout: {elapsed_seconds}s >= {limit_seconds}s")]
    RunTimeout {
        elapsed_seconds: u64,
        limit_seconds: u64,
    },

    #[error("Package too large: {actual} bytes > {limit} bytes")]
    MaxPackageBytes { actual: u64, limit: u64 },
}
