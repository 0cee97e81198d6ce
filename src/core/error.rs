//! Step-level error taxonomy.

use std::time::Duration;

use thiserror::Error;

use crate::adapters::{BuildError, PackagingError, ProvisionError, PublishError, SigningError};
use crate::domain::InterpolationError;

use super::safety::SafetyViolation;

/// Why a step failed
#[derive(Debug, Error)]
pub enum StepError {
    #[error("provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error("build failed: {0}")]
    Build(#[from] BuildError),

    #[error("signing failed: {0}")]
    Sign(#[from] SigningError),

    #[error("packaging failed: {0}")]
    Package(#[from] PackagingError),

    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error("invalid step configuration: {0}")]
    Config(String),

    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    #[error("no {0} configured")]
    Unavailable(String),

    #[error("safety limit reached: {0}")]
    Safety(#[from] SafetyViolation),
}

impl From<InterpolationError> for StepError {
    fn from(err: InterpolationError) -> Self {
        Self::Config(err.to_string())
    }
}

impl StepError {
    /// Whether the step may be retried under its retry policy
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Provision(e) => e.is_transient(),
            Self::Publish(e) => e.is_transient(),
            Self::Timeout(_) => true,
            _ => false,
        }
    }
}
