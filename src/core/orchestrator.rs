//! Main orchestrator for pipeline execution.
//!
//! Interprets pipeline steps one at a time, dispatching each to the component
//! for its kind. Handles option interpolation, timeouts, retries of transient
//! failures, event logging and safety limit enforcement. The first failing
//! step ends the run; every later step is recorded as skipped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    BuildMode, BuildRequest, Builder, PackageRequest, Packager, Provisioner, PublishTarget,
    Publisher, Signer, ToolchainChannel, ToolchainSpec,
};
use crate::domain::{
    check_path_segment, Artifact, Event, EventType, Package, PipelineRun, ReleaseCoordinates,
    StepKind, StepStatus, Trigger,
};

use super::error::StepError;
use super::event_store::EventStore;
use super::pipeline::{Pipeline, Step};
use super::safety::SafetyTracker;

/// The collaborators a run dispatches to.
///
/// Signer and publisher are optional: they hold credentials, and a pipeline
/// that never signs or publishes should not need any.
#[derive(Clone)]
pub struct Components {
    pub provisioner: Arc<dyn Provisioner>,
    pub builder: Arc<dyn Builder>,
    pub packager: Arc<dyn Packager>,
    pub signer: Option<Arc<dyn Signer>>,
    pub publisher: Option<Arc<dyn Publisher>>,

    /// Registry URL recorded on publish targets
    pub registry: String,
}

/// What a successful step hands to later steps besides its outputs
enum StepEffect {
    None,
    Artifacts(Vec<Artifact>),
    Package(Package),
}

/// Working state of one run, never persisted
struct RunContext {
    source_dir: PathBuf,
    work_dir: PathBuf,
    run_vars: BTreeMap<String, String>,

    /// Current artifacts in the order they were built
    artifacts: Vec<Artifact>,

    /// Packages keyed by producing step
    packages: BTreeMap<String, Package>,
}

impl RunContext {
    fn apply(&mut self, step: &Step, effect: StepEffect) {
        match effect {
            StepEffect::None => {}
            StepEffect::Artifacts(updated) => {
                for artifact in updated {
                    match self.artifacts.iter_mut().find(|a| a.name == artifact.name) {
                        Some(existing) => *existing = artifact,
                        None => self.artifacts.push(artifact),
                    }
                }
            }
            StepEffect::Package(package) => {
                self.packages.insert(step.name.clone(), package);
            }
        }
    }

    /// Artifacts named in a comma-separated list, or all of them
    fn select_artifacts(&self, names: Option<&str>) -> Result<Vec<Artifact>, StepError> {
        let Some(names) = names else {
            return Ok(self.artifacts.clone());
        };

        split_list(names)
            .into_iter()
            .map(|name| {
                self.artifacts
                    .iter()
                    .find(|a| a.name == name)
                    .cloned()
                    .ok_or_else(|| StepError::Config(format!("no artifact named '{}'", name)))
            })
            .collect()
    }
}

/// Main pipeline orchestrator
pub struct Orchestrator {
    components: Components,

    /// Where run event logs are kept
    runs_dir: PathBuf,
}

impl Orchestrator {
    /// Create an orchestrator recording runs in the configured runs directory
    pub fn new(components: Components) -> Result<Self> {
        Ok(Self::with_runs_dir(components, crate::config::runs_dir()?))
    }

    pub fn with_runs_dir(components: Components, runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            components,
            runs_dir: runs_dir.into(),
        }
    }

    /// Execute a pipeline for one release.
    ///
    /// Step failures are not errors: they produce a run in the `Failed`
    /// state. `Err` is reserved for problems recording the run itself.
    #[instrument(skip(self, pipeline, release, trigger, source_dir), fields(pipeline = %pipeline.name))]
    pub async fn run_pipeline(
        &self,
        pipeline: &Pipeline,
        release: ReleaseCoordinates,
        trigger: Trigger,
        source_dir: &Path,
    ) -> Result<PipelineRun> {
        pipeline.validate()?;

        // Components spawn tools in other directories, so every path they
        // receive is absolute
        let source_dir = tokio::fs::canonicalize(source_dir)
            .await
            .with_context(|| format!("Source checkout not found: {}", source_dir.display()))?;

        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            platform = %release.platform,
            version = %release.version,
            channel = %release.channel,
            "Starting pipeline execution"
        );

        let store = EventStore::open_in(&self.runs_dir, run_id).await?;

        let mut run = PipelineRun::new(
            run_id,
            pipeline.name.clone(),
            trigger,
            release,
            &pipeline.declared_steps(),
        );
        let mut ctx = RunContext {
            source_dir,
            work_dir: store.work_dir().to_path_buf(),
            run_vars: run_variables(&run),
            artifacts: Vec::new(),
            packages: BTreeMap::new(),
        };
        let mut tracker = SafetyTracker::new();

        let start_event = Event::new(
            run_id,
            EventType::RunStarted,
            format!("Pipeline '{}' started", pipeline.name),
            StepStatus::Running,
        )
        .with_run_info(run.info());
        record(&store, &mut run, start_event).await?;

        for (index, step) in pipeline.steps.iter().enumerate() {
            let result = self
                .execute_step_with_retry(&store, &mut run, &mut ctx, &mut tracker, pipeline, index)
                .await?;

            if let Err(e) = result {
                return self.fail_run(&store, &mut run, pipeline, index, step, e).await;
            }
        }

        self.complete_run(&store, &mut run).await
    }

    /// Execute a step, retrying transient failures per its retry policy.
    ///
    /// The outer `Result` is for event log failures; the inner one is the
    /// step outcome.
    async fn execute_step_with_retry(
        &self,
        store: &EventStore,
        run: &mut PipelineRun,
        ctx: &mut RunContext,
        tracker: &mut SafetyTracker,
        pipeline: &Pipeline,
        index: usize,
    ) -> Result<Result<(), StepError>> {
        let step = &pipeline.steps[index];
        let step_timeout = step.timeout(&pipeline.limits);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if let Err(violation) = pipeline.limits.check(tracker) {
                error!(step = %step.name, %violation, "Safety limit reached");

                let fail_event = Event::new(
                    run.id,
                    EventType::StepFailed,
                    format!("Step '{}' not started: safety limit reached", step.name),
                    StepStatus::Failed,
                )
                .for_step(index, &step.name)
                .with_error(violation.to_string());
                record(store, run, fail_event).await?;

                return Ok(Err(violation.into()));
            }
            tracker.record_step();

            let step_start = Instant::now();
            let start_event = Event::new(
                run.id,
                EventType::StepStarted,
                format!("Step '{}' ({}) attempt {}", step.name, step.kind, attempt),
                StepStatus::Running,
            )
            .for_step(index, &step.name);
            record(store, run, start_event).await?;

            // Bounded by whichever runs out first: the step or the run
            let budget = step_timeout.min(pipeline.limits.run_time_remaining(tracker));
            let outcome = match tokio::time::timeout(
                budget,
                self.execute_step(run, ctx, pipeline, index),
            )
            .await
            {
                Ok(result) => result,
                Err(_) if budget < step_timeout => {
                    Err(pipeline.limits.run_timeout_violation(tracker).into())
                }
                Err(_) => Err(StepError::Timeout(step_timeout)),
            };

            let duration_ms = step_start.elapsed().as_millis() as u64;

            match outcome {
                Ok((outputs, effect)) => {
                    ctx.apply(step, effect);

                    let complete_event = Event::new(
                        run.id,
                        EventType::StepSucceeded,
                        format!("Step '{}' succeeded in {}ms", step.name, duration_ms),
                        StepStatus::Succeeded,
                    )
                    .for_step(index, &step.name)
                    .with_duration(duration_ms)
                    .with_outputs(outputs);
                    record(store, run, complete_event).await?;

                    info!(step = %step.name, duration_ms, "Step succeeded");
                    return Ok(Ok(()));
                }
                Err(e) if e.is_transient() && step.retry_policy.should_retry(attempt) => {
                    // A backoff past the run budget ends at the next limit check
                    let delay = step
                        .retry_policy
                        .delay_for_attempt(attempt)
                        .min(pipeline.limits.run_time_remaining(tracker));

                    let retry_event = Event::new(
                        run.id,
                        EventType::StepRetrying,
                        format!("Step '{}' failed, retrying in {:?}", step.name, delay),
                        StepStatus::Running,
                    )
                    .for_step(index, &step.name)
                    .with_error(e.to_string());
                    record(store, run, retry_event).await?;

                    warn!(
                        step = %step.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Step failed, retrying"
                    );

                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let fail_event = Event::new(
                        run.id,
                        EventType::StepFailed,
                        format!("Step '{}' failed after {} attempt(s)", step.name, attempt),
                        StepStatus::Failed,
                    )
                    .for_step(index, &step.name)
                    .with_duration(duration_ms)
                    .with_error(e.to_string());
                    record(store, run, fail_event).await?;

                    error!(step = %step.name, attempt, error = %e, "Step failed permanently");
                    return Ok(Err(e));
                }
            }
        }
    }

    /// One attempt of one step
    async fn execute_step(
        &self,
        run: &PipelineRun,
        ctx: &RunContext,
        pipeline: &Pipeline,
        index: usize,
    ) -> Result<(BTreeMap<String, String>, StepEffect), StepError> {
        let step = &pipeline.steps[index];
        let options = resolve(run, ctx, &step.options)?;
        let env = resolve(run, ctx, &step.env)?;

        debug!(step = %step.name, kind = %step.kind, ?options, "Executing step");

        match step.kind {
            StepKind::Provision => self.provision(run, &options).await,
            StepKind::Build => self.build(run, ctx, step, &options, env).await,
            StepKind::Sign => self.sign(ctx, &options).await,
            StepKind::Package => self.package(run, ctx, pipeline, step, &options).await,
            StepKind::Publish => self.publish(run, ctx, pipeline, index, &options).await,
        }
    }

    async fn provision(
        &self,
        run: &PipelineRun,
        options: &BTreeMap<String, String>,
    ) -> Result<(BTreeMap<String, String>, StepEffect), StepError> {
        let channel: ToolchainChannel = options
            .get("channel")
            .map(String::as_str)
            .unwrap_or("stable")
            .parse()?;
        let target = options
            .get("target")
            .cloned()
            .unwrap_or_else(|| run.release.platform.target_triple().to_string());

        let outcome = self
            .components
            .provisioner
            .provision(&ToolchainSpec { channel, target })
            .await?;

        let outputs = outputs([
            ("toolchain", outcome.toolchain),
            ("target", outcome.target),
            ("installed", outcome.newly_installed.to_string()),
        ]);
        Ok((outputs, StepEffect::None))
    }

    async fn build(
        &self,
        run: &PipelineRun,
        ctx: &RunContext,
        step: &Step,
        options: &BTreeMap<String, String>,
        env: BTreeMap<String, String>,
    ) -> Result<(BTreeMap<String, String>, StepEffect), StepError> {
        let binary = options
            .get("binary")
            .cloned()
            .ok_or_else(|| StepError::Config("build step needs a 'binary' option".to_string()))?;

        let mode = match options.get("mode") {
            Some(mode) => mode.parse::<BuildMode>().map_err(StepError::Config)?,
            None => BuildMode::default(),
        };

        let source_dir = options
            .get("source_dir")
            .map(|dir| ctx.source_dir.join(dir))
            .unwrap_or_else(|| ctx.source_dir.clone());

        let request = BuildRequest {
            step_name: step.name.clone(),
            source_dir,
            target: options
                .get("target")
                .cloned()
                .unwrap_or_else(|| run.release.platform.target_triple().to_string()),
            mode,
            binary,
            toolchain: options.get("toolchain").filter(|t| !t.is_empty()).cloned(),
            features: options
                .get("features")
                .map(|f| split_list(f))
                .unwrap_or_default(),
            target_dir: options.get("target_dir").map(|dir| ctx.source_dir.join(dir)),
            env,
        };

        let artifact = self.components.builder.build(&request).await?;

        let outputs = outputs([
            ("artifact", artifact.name.clone()),
            ("artifact_path", artifact.path.to_string_lossy().to_string()),
            ("sha256", artifact.sha256.clone()),
            ("target", request.target),
        ]);
        Ok((outputs, StepEffect::Artifacts(vec![artifact])))
    }

    async fn sign(
        &self,
        ctx: &RunContext,
        options: &BTreeMap<String, String>,
    ) -> Result<(BTreeMap<String, String>, StepEffect), StepError> {
        let signer = self
            .components
            .signer
            .as_ref()
            .ok_or_else(|| StepError::Unavailable("signer".to_string()))?;

        let artifacts = ctx.select_artifacts(options.get("artifacts").map(String::as_str))?;
        if artifacts.is_empty() {
            return Err(StepError::Config("no artifacts to sign".to_string()));
        }

        let signed = signer.sign(&artifacts).await?;

        let names: Vec<&str> = signed.iter().map(|a| a.name.as_str()).collect();
        let outputs = outputs([
            ("signed", names.join(",")),
            ("count", signed.len().to_string()),
        ]);
        Ok((outputs, StepEffect::Artifacts(signed)))
    }

    async fn package(
        &self,
        run: &PipelineRun,
        ctx: &RunContext,
        pipeline: &Pipeline,
        step: &Step,
        options: &BTreeMap<String, String>,
    ) -> Result<(BTreeMap<String, String>, StepEffect), StepError> {
        let artifacts = ctx.select_artifacts(options.get("artifacts").map(String::as_str))?;
        let step_dir = ctx.work_dir.join(&step.name);

        let package_id = options
            .get("package_id")
            .cloned()
            .unwrap_or_else(|| pipeline.name.clone());
        check_path_segment("package id", &package_id)
            .map_err(|e| StepError::Config(e.to_string()))?;

        let request = PackageRequest {
            step_name: step.name.clone(),
            package_id,
            release: run.release.clone(),
            artifacts,
            staging_dir: step_dir.join("staging"),
            output_dir: step_dir,
        };

        let package = self.components.packager.package(&request).await?;

        let outputs = outputs([
            ("package_id", package.manifest.package_id.clone()),
            ("package_path", package.path.to_string_lossy().to_string()),
            ("sha256", package.sha256.clone()),
            ("artifact_count", package.manifest.artifacts.len().to_string()),
        ]);
        Ok((outputs, StepEffect::Package(package)))
    }

    async fn publish(
        &self,
        run: &PipelineRun,
        ctx: &RunContext,
        pipeline: &Pipeline,
        index: usize,
        options: &BTreeMap<String, String>,
    ) -> Result<(BTreeMap<String, String>, StepEffect), StepError> {
        let publisher = self
            .components
            .publisher
            .as_ref()
            .ok_or_else(|| StepError::Unavailable("publisher".to_string()))?;

        let registry = options
            .get("registry")
            .cloned()
            .unwrap_or_else(|| self.components.registry.clone());
        if registry.is_empty() {
            return Err(StepError::Unavailable("registry".to_string()));
        }

        let package_step = pipeline
            .package_step_for(index)
            .map(|i| pipeline.steps[i].name.as_str())
            .ok_or_else(|| StepError::Config("no package step to publish".to_string()))?;
        let package = ctx.packages.get(package_step).ok_or_else(|| {
            StepError::Config(format!("step '{}' produced no package", package_step))
        })?;

        pipeline.limits.validate_package_size(package.size_bytes)?;

        let target = PublishTarget {
            registry,
            release: run.release.clone(),
        };

        let receipt = publisher.publish(package, &target).await?;

        let outputs = outputs([
            ("url", receipt.url),
            ("package_id", receipt.package_id),
            ("platform", receipt.platform),
            ("version", receipt.version),
            ("channel", receipt.channel),
        ]);
        Ok((outputs, StepEffect::None))
    }

    /// Record the failure of step `index` and skip everything after it
    async fn fail_run(
        &self,
        store: &EventStore,
        run: &mut PipelineRun,
        pipeline: &Pipeline,
        index: usize,
        step: &Step,
        error: StepError,
    ) -> Result<PipelineRun> {
        for (later, skipped) in pipeline.steps.iter().enumerate().skip(index + 1) {
            let skip_event = Event::new(
                run.id,
                EventType::StepSkipped,
                format!("Step '{}' skipped after '{}' failed", skipped.name, step.name),
                StepStatus::Skipped,
            )
            .for_step(later, &skipped.name);
            record(store, run, skip_event).await?;
        }

        let error_msg = error.to_string();
        error!(step = %step.name, %error_msg, "Run failed");

        let event = Event::new(
            run.id,
            EventType::RunFailed,
            format!("Run failed at step '{}'", step.name),
            StepStatus::Failed,
        )
        .for_step(index, &step.name)
        .with_error(error_msg);
        record(store, run, event).await?;

        Ok(run.clone())
    }

    /// Complete a successful run
    async fn complete_run(&self, store: &EventStore, run: &mut PipelineRun) -> Result<PipelineRun> {
        info!(run_id = %run.id, "Run completed successfully");

        let event = Event::new(
            run.id,
            EventType::RunSucceeded,
            format!("Pipeline '{}' succeeded", run.pipeline_name),
            StepStatus::Succeeded,
        );
        record(store, run, event).await?;

        Ok(run.clone())
    }

    /// Get status of a run by ID
    pub async fn get_run_status(&self, run_id: Uuid) -> Result<PipelineRun> {
        let run_dir = self.runs_dir.join(run_id.to_string());
        if !run_dir.is_dir() {
            anyhow::bail!("Run {} not found", run_id);
        }

        let store = EventStore::open_in(&self.runs_dir, run_id).await?;
        store
            .load_run()
            .await?
            .with_context(|| format!("Run {} has no recorded start", run_id))
    }

    /// List recent runs, most recent first
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<PipelineRun>> {
        let run_ids = EventStore::list_runs_in(&self.runs_dir).await?;
        let mut runs = Vec::new();

        for run_id in run_ids {
            if let Ok(run) = self.get_run_status(run_id).await {
                runs.push(run);
            }
        }

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);

        Ok(runs)
    }
}

/// Append an event to the log and fold it into the in-memory run
async fn record(store: &EventStore, run: &mut PipelineRun, event: Event) -> Result<()> {
    store.append(&event).await?;
    run.apply_event(&event);
    Ok(())
}

/// Values available as `${run.<key>}`
fn run_variables(run: &PipelineRun) -> BTreeMap<String, String> {
    outputs([
        ("id", run.id.to_string()),
        ("version", run.release.version.clone()),
        ("channel", run.release.channel.clone()),
        ("platform", run.release.platform.to_string()),
        ("target", run.release.platform.target_triple().to_string()),
    ])
}

/// Interpolate every value of an option or env map
fn resolve(
    run: &PipelineRun,
    ctx: &RunContext,
    values: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, StepError> {
    values
        .iter()
        .map(|(key, template)| {
            let value = run.outputs.interpolate(template, &ctx.run_vars)?;
            Ok((key.clone(), value))
        })
        .collect()
}

fn outputs<const N: usize>(pairs: [(&str, String); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
