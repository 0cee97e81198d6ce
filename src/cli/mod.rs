//! Command-line interface for ferry.
//!
//! Provides commands for running and validating pipelines, provisioning a
//! toolchain, checking run status and listing runs.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use uuid::Uuid;

use crate::adapters::{
    CargoBuilder, CommandSigner, KeySigner, Provisioner, Publisher, RegistryRouter,
    RustupProvisioner, Signer, TarballPackager, ToolchainChannel, ToolchainSpec,
};
use crate::config::{self, ResolvedConfig, SigningMethod};
use crate::core::{Components, Orchestrator, Pipeline};
use crate::domain::{compute_version, PipelineRun, Platform, ReleaseCoordinates, RunState, Trigger};
use crate::secrets::Secret;

/// ferry - Release pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "ferry")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a release pipeline
    Run {
        /// Pipeline file, or name (looks for pipelines/<name>.yaml)
        pipeline: String,

        /// Platform tag (e.g. x86-windows); defaults to config
        #[arg(short, long, env = "FERRY_PLATFORM")]
        platform: Option<String>,

        /// Release version; read from the source Cargo.toml if omitted
        #[arg(long)]
        version: Option<String>,

        /// Release channel (e.g. nightly); defaults to config
        #[arg(short, long, env = "FERRY_CHANNEL")]
        channel: Option<String>,

        /// Source checkout to build
        #[arg(short, long, default_value = ".")]
        source: PathBuf,

        /// Registry URL, overriding config and FERRY_REGISTRY_URL
        #[arg(long)]
        registry: Option<String>,
    },

    /// Check a pipeline definition without running it
    Validate {
        /// Pipeline file or name
        pipeline: String,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Install a toolchain and target (no-op if already present)
    Provision {
        /// stable, beta, nightly or a version such as 1.75
        #[arg(short, long, default_value = "stable")]
        channel: String,

        /// Platform tag or target triple; defaults to config
        #[arg(short, long)]
        platform: Option<String>,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command, returning the process exit code
    pub async fn execute(self) -> Result<ExitCode> {
        match self.command {
            Commands::Run {
                pipeline,
                platform,
                version,
                channel,
                source,
                registry,
            } => run_pipeline(&pipeline, platform, version, channel, &source, registry).await,
            Commands::Validate { pipeline } => validate_pipeline(&pipeline),
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Provision { channel, platform } => provision(&channel, platform).await,
            Commands::Config => show_config(),
        }
    }
}

/// Run a pipeline for one release
async fn run_pipeline(
    pipeline_ref: &str,
    platform: Option<String>,
    version: Option<String>,
    channel: Option<String>,
    source: &Path,
    registry: Option<String>,
) -> Result<ExitCode> {
    let cfg = config::config()?;
    let pipeline = load_pipeline(pipeline_ref, cfg)?;

    let version = match version {
        Some(v) => v,
        None => compute_version(source)?,
    };
    let release = ReleaseCoordinates::new(
        platform.unwrap_or_else(|| cfg.default_platform.clone()),
        version,
        channel.unwrap_or_else(|| cfg.default_channel.clone()),
    )?;

    let components = components_from_config(cfg, registry)?;
    let orchestrator = Orchestrator::new(components)?;
    let run = orchestrator
        .run_pipeline(&pipeline, release, Trigger::from_env(), source)
        .await?;

    print_run_summary(&run);
    Ok(ExitCode::from(run.exit_code() as u8))
}

/// Build the components from configuration, reading secrets from the environment
pub fn components_from_config(
    cfg: &ResolvedConfig,
    registry_override: Option<String>,
) -> Result<Components> {
    let signer: Option<Arc<dyn Signer>> = match cfg.signing.method {
        SigningMethod::Key => match Secret::from_env(&cfg.signing.key_env) {
            Some(key) => {
                let signer = KeySigner::from_secret(&key).context("Failed to load signing key")?;
                Some(Arc::new(signer) as Arc<dyn Signer>)
            }
            None => {
                warn!(env = %cfg.signing.key_env, "No signing key set; sign steps will fail");
                None
            }
        },
        SigningMethod::Command => {
            let program = cfg
                .signing
                .command
                .clone()
                .context("signing.command is not set")?;
            match Secret::from_env(&cfg.signing.credential_env) {
                Some(credential) => Some(Arc::new(CommandSigner::new(
                    program,
                    cfg.signing.args.clone(),
                    credential,
                    cfg.signing.credential_env.clone(),
                )) as Arc<dyn Signer>),
                None => {
                    warn!(env = %cfg.signing.credential_env, "No signing credential set; sign steps will fail");
                    None
                }
            }
        }
    };

    let registry = registry_override.or_else(|| cfg.registry_url.clone());
    let token = Secret::from_env(&cfg.registry_token_env);
    let needs_token = registry
        .as_deref()
        .is_some_and(|url| url.starts_with("https://") || url.starts_with("http://"));
    if needs_token && token.is_none() {
        warn!(env = %cfg.registry_token_env, "No registry token set; publish steps will fail");
    }

    // Publish steps may name their own registry, so the publisher is picked per target
    let publisher: Arc<dyn Publisher> = Arc::new(RegistryRouter::new(token));

    Ok(Components {
        signer,
        publisher: Some(publisher),
        registry: registry.unwrap_or_default(),
        ..base_components(cfg)
    })
}

/// Components that need no credentials
fn base_components(cfg: &ResolvedConfig) -> Components {
    Components {
        provisioner: Arc::new(RustupProvisioner::with_binary_path(&cfg.rustup)),
        builder: Arc::new(CargoBuilder::with_binary_path(&cfg.cargo)),
        packager: Arc::new(TarballPackager::with_limits(cfg.limits.clone())),
        signer: None,
        publisher: None,
        registry: String::new(),
    }
}

fn print_run_summary(run: &PipelineRun) {
    for step in &run.steps {
        println!("  {:<10} {:<20} {:?}", step.kind.as_str(), step.name, step.status);
        for (key, value) in &step.outputs {
            println!("      {} = {}", key, value);
        }
    }

    match &run.state {
        RunState::Succeeded => {
            eprintln!(
                "\n[Run {} succeeded: {} {} ({}, {})]",
                run.id,
                run.pipeline_name,
                run.release.version,
                run.release.platform,
                run.release.channel
            );
        }
        RunState::Failed {
            step,
            step_name,
            reason,
        } => {
            eprintln!(
                "\n[Run {} failed at step {} '{}': {}]",
                run.id, step, step_name, reason
            );
        }
        other => {
            eprintln!("\n[Run {} in state: {}]", run.id, other.label());
        }
    }
}

/// Validate a pipeline definition
fn validate_pipeline(pipeline_ref: &str) -> Result<ExitCode> {
    let cfg = config::config()?;
    let pipeline = load_pipeline(pipeline_ref, cfg)?;

    println!("Pipeline '{}' is valid", pipeline.name);
    for (i, step) in pipeline.steps.iter().enumerate() {
        println!("  {}. {} ({})", i + 1, step.name, step.kind);
    }

    Ok(ExitCode::SUCCESS)
}

/// Show the status of a run
async fn show_status(run_id_str: &str) -> Result<ExitCode> {
    let run_id = Uuid::parse_str(run_id_str)
        .with_context(|| format!("Invalid run ID: {}", run_id_str))?;

    let orchestrator = Orchestrator::new(base_components(config::config()?))?;
    let run = orchestrator.get_run_status(run_id).await?;

    println!("Run ID: {}", run.id);
    println!("Pipeline: {}", run.pipeline_name);
    println!(
        "Release: {} {} ({})",
        run.release.version, run.release.platform, run.release.channel
    );
    println!("Trigger: {}", run.trigger.event);
    println!("State: {}", run.state.label());
    if let RunState::Failed { step_name, reason, .. } = &run.state {
        println!("Failed step: {} ({})", step_name, reason);
    }
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    println!("\nSteps:");
    for step in &run.steps {
        println!(
            "  {}: {:?} (attempts: {})",
            step.name, step.status, step.attempts
        );
    }

    Ok(ExitCode::SUCCESS)
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<ExitCode> {
    let orchestrator = Orchestrator::new(base_components(config::config()?))?;
    let runs = orchestrator.list_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{:<38} {:<16} {:<12} {:<14} {:<10}",
        "RUN ID", "PIPELINE", "VERSION", "PLATFORM", "STATE"
    );
    println!("{}", "-".repeat(92));

    for run in runs {
        println!(
            "{:<38} {:<16} {:<12} {:<14} {:<10}",
            run.id,
            run.pipeline_name,
            run.release.version,
            run.release.platform,
            run.state.label()
        );
    }

    Ok(ExitCode::SUCCESS)
}

/// Provision a toolchain outside of a pipeline
async fn provision(channel: &str, platform: Option<String>) -> Result<ExitCode> {
    let cfg = config::config()?;
    let platform = Platform::new(platform.unwrap_or_else(|| cfg.default_platform.clone()));

    let spec = ToolchainSpec {
        channel: channel.parse::<ToolchainChannel>()?,
        target: platform.target_triple().to_string(),
    };

    let provisioner = RustupProvisioner::with_binary_path(&cfg.rustup);
    let outcome = provisioner.provision(&spec).await?;

    if outcome.newly_installed {
        println!("Installed {} for {}", outcome.toolchain, outcome.target);
    } else {
        println!("{} for {} already installed", outcome.toolchain, outcome.target);
    }

    Ok(ExitCode::SUCCESS)
}

/// Show resolved configuration
fn show_config() -> Result<ExitCode> {
    let cfg = config::config()?;

    println!("ferry configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home: {}", cfg.home.display());
    println!("  Runs: {}", cfg.home.join("runs").display());
    println!();
    println!("Registry:");
    println!(
        "  URL:       {}",
        cfg.registry_url.as_deref().unwrap_or("(not configured)")
    );
    println!("  Token env: {} ({})", cfg.registry_token_env, env_state(&cfg.registry_token_env));
    println!();
    println!("Signing:");
    match cfg.signing.method {
        SigningMethod::Key => {
            println!("  Method:  Ed25519 key");
            println!("  Key env: {} ({})", cfg.signing.key_env, env_state(&cfg.signing.key_env));
        }
        SigningMethod::Command => {
            println!(
                "  Method:         command ({})",
                cfg.signing.command.as_deref().unwrap_or("?")
            );
            println!(
                "  Credential env: {} ({})",
                cfg.signing.credential_env,
                env_state(&cfg.signing.credential_env)
            );
        }
    }
    println!();
    println!("Tools:");
    println!("  rustup: {}", cfg.rustup);
    println!("  cargo:  {}", cfg.cargo);
    println!();
    println!("Defaults:");
    println!("  Platform: {}", cfg.default_platform);
    println!("  Channel:  {}", cfg.default_channel);
    println!();
    println!("Safety limits:");
    println!("  Max steps:    {}", cfg.limits.max_steps);
    println!("  Step timeout: {}s", cfg.limits.step_timeout_seconds);
    println!("  Run timeout:  {}s", cfg.limits.run_timeout_seconds);
    println!("  Max package:  {} bytes", cfg.limits.max_package_bytes);

    Ok(ExitCode::SUCCESS)
}

/// Whether a secret variable is set, without revealing it
fn env_state(name: &str) -> &'static str {
    if Secret::from_env(name).is_some() {
        "set"
    } else {
        "unset"
    }
}

/// Load and validate a pipeline by path or name
fn load_pipeline(reference: &str, cfg: &ResolvedConfig) -> Result<Pipeline> {
    let candidates = [
        PathBuf::from(reference),
        PathBuf::from("pipelines").join(format!("{}.yaml", reference)),
        PathBuf::from(format!("{}.yaml", reference)),
    ];

    let path = candidates.iter().find(|p| p.is_file()).with_context(|| {
        format!(
            "Pipeline '{}' not found. Looked for:\n  - {}\n  - {}\n  - {}",
            reference,
            candidates[0].display(),
            candidates[1].display(),
            candidates[2].display()
        )
    })?;

    let pipeline = Pipeline::from_file_with_defaults(path, &cfg.limits)?;
    pipeline
        .validate()
        .with_context(|| format!("Invalid pipeline: {}", path.display()))?;
    Ok(pipeline)
}
