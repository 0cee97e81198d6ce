//! Shared step output mapping and `${step.key}` interpolation.
//!
//! Outputs are appended by the orchestrator after each successful step, keyed
//! by step name. A step can only ever see the outputs of steps that ran
//! before it, because later steps have not been inserted yet.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Reserved scope for run-level variables (`${run.version}` etc.)
pub const RUN_SCOPE: &str = "run";

/// Outputs of completed steps, keyed by step name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMap {
    /// Step names in insertion order
    order: Vec<String>,
    values: BTreeMap<String, BTreeMap<String, String>>,
}

impl OutputMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outputs of a step. Later inserts for the same step replace
    /// the earlier entry but keep its position.
    pub fn insert(&mut self, step: &str, outputs: BTreeMap<String, String>) {
        if !self.values.contains_key(step) {
            self.order.push(step.to_string());
        }
        self.values.insert(step.to_string(), outputs);
    }

    pub fn get(&self, step: &str, key: &str) -> Option<&str> {
        self.values.get(step)?.get(key).map(String::as_str)
    }

    pub fn step(&self, step: &str) -> Option<&BTreeMap<String, String>> {
        self.values.get(step)
    }

    pub fn contains_step(&self, step: &str) -> bool {
        self.values.contains_key(step)
    }

    /// Step names in the order they were recorded
    pub fn steps(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Expand `${scope.key}` references in `template`.
    ///
    /// `scope` is either `run` (looked up in `run_vars`) or the name of a step
    /// already present in this map. `$$` escapes a literal `$`.
    pub fn interpolate(
        &self,
        template: &str,
        run_vars: &BTreeMap<String, String>,
    ) -> Result<String, InterpolationError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];

            if let Some(stripped) = after.strip_prefix('$') {
                out.push('$');
                rest = stripped;
                continue;
            }

            if let Some(body) = after.strip_prefix('{') {
                let end = body
                    .find('}')
                    .ok_or_else(|| InterpolationError::Unterminated(template.to_string()))?;
                let reference = parse_reference(&body[..end])?;

                let value = if reference.scope == RUN_SCOPE {
                    run_vars.get(&reference.key).map(String::as_str)
                } else {
                    self.get(&reference.scope, &reference.key)
                };

                match value {
                    Some(v) => out.push_str(v),
                    None => return Err(InterpolationError::Unresolved(reference.to_string())),
                }
                rest = &body[end + 1..];
                continue;
            }

            out.push('$');
            rest = after;
        }

        out.push_str(rest);
        Ok(out)
    }
}

/// A `${scope.key}` reference found in a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub scope: String,
    pub key: String,
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${{{}.{}}}", self.scope, self.key)
    }
}

fn parse_reference(body: &str) -> Result<Reference, InterpolationError> {
    match body.trim().split_once('.') {
        Some((scope, key)) if !scope.is_empty() && !key.is_empty() => Ok(Reference {
            scope: scope.to_string(),
            key: key.to_string(),
        }),
        _ => Err(InterpolationError::Malformed(body.to_string())),
    }
}

/// List every `${scope.key}` reference in a template, for validation
pub fn references(template: &str) -> Result<Vec<Reference>, InterpolationError> {
    let mut refs = Vec::new();
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        let after = &rest[pos + 1..];
        if let Some(stripped) = after.strip_prefix('$') {
            rest = stripped;
        } else if let Some(body) = after.strip_prefix('{') {
            let end = body
                .find('}')
                .ok_or_else(|| InterpolationError::Unterminated(template.to_string()))?;
            refs.push(parse_reference(&body[..end])?);
            rest = &body[end + 1..];
        } else {
            rest = after;
        }
    }

    Ok(refs)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterpolationError {
    #[error("unterminated reference in '{0}'")]
    Unterminated(String),

    #[error("malformed reference '${{{0}}}' (expected ${{step.key}})")]
    Malformed(String),

    #[error("unresolved reference {0}")]
    Unresolved(String),
}
