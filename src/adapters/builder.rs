//! Release builds via `cargo build`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::domain::Artifact;

use super::process::{exit_label, run_captured, tail};
use super::Builder;

/// Cargo build profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildMode {
    Debug,
    #[default]
    Release,
}

impl BuildMode {
    /// Directory cargo writes this profile to
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Release => "release",
        }
    }
}

impl FromStr for BuildMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "release" => Ok(Self::Release),
            other => Err(format!("unknown build mode '{}' (expected debug or release)", other)),
        }
    }
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// One binary to build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Step requesting the build (recorded on the artifact)
    pub step_name: String,

    /// Source checkout containing `Cargo.toml`
    pub source_dir: PathBuf,

    /// Rust target triple
    pub target: String,

    pub mode: BuildMode,

    /// Binary target name (`--bin`)
    pub binary: String,

    /// Toolchain override (`cargo +<toolchain>`)
    pub toolchain: Option<String>,

    pub features: Vec<String>,

    /// Defaults to `<source_dir>/target`
    pub target_dir: Option<PathBuf>,

    /// Extra environment for the compiler process
    pub env: BTreeMap<String, String>,
}

impl BuildRequest {
    /// The request with `source_dir` and `target_dir` made absolute against
    /// the current directory. Cargo runs inside `source_dir`, where relative
    /// paths would resolve differently.
    pub fn with_absolute_paths(&self) -> std::io::Result<Self> {
        let cwd = std::env::current_dir()?;
        let absolute = |path: &Path| {
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                cwd.join(path)
            }
        };

        Ok(Self {
            source_dir: absolute(&self.source_dir),
            target_dir: self.target_dir.as_deref().map(|dir| absolute(dir)),
            ..self.clone()
        })
    }

    /// Where cargo will place the binary
    pub fn output_path(&self) -> PathBuf {
        let target_dir = self
            .target_dir
            .clone()
            .unwrap_or_else(|| self.source_dir.join("target"));

        let suffix = if self.target.contains("windows") {
            ".exe"
        } else {
            ""
        };

        target_dir
            .join(&self.target)
            .join(self.mode.dir_name())
            .join(format!("{}{}", self.binary, suffix))
    }

    /// Arguments passed to cargo
    pub fn cargo_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(toolchain) = &self.toolchain {
            args.push(format!("+{}", toolchain));
        }

        args.push("build".to_string());
        if self.mode == BuildMode::Release {
            args.push("--release".to_string());
        }
        args.extend([
            "--target".to_string(),
            self.target.clone(),
            "--bin".to_string(),
            self.binary.clone(),
            "--manifest-path".to_string(),
            self.source_dir.join("Cargo.toml").to_string_lossy().to_string(),
        ]);

        if !self.features.is_empty() {
            args.push("--features".to_string());
            args.push(self.features.join(","));
        }

        if let Some(target_dir) = &self.target_dir {
            args.push("--target-dir".to_string());
            args.push(target_dir.to_string_lossy().to_string());
        }

        args
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("build of '{binary}' failed with {status}:\n{stderr}")]
    Compile {
        binary: String,
        status: String,
        stderr: String,
    },

    #[error("build succeeded but output is missing: {0}")]
    MissingOutput(PathBuf),

    #[error("failed to read build output: {0}")]
    Io(#[from] std::io::Error),
}

/// Builder backed by the `cargo` CLI
pub struct CargoBuilder {
    binary_path: String,
}

impl Default for CargoBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CargoBuilder {
    pub fn new() -> Self {
        Self::with_binary_path("cargo")
    }

    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }
}

#[async_trait]
impl Builder for CargoBuilder {
    fn name(&self) -> &str {
        "cargo"
    }

    async fn build(&self, request: &BuildRequest) -> Result<Artifact, BuildError> {
        let request = request.with_absolute_paths()?;
        let args = request.cargo_args();
        info!(binary = %request.binary, target = %request.target, mode = %request.mode, "Building");
        debug!(cargo = %self.binary_path, ?args, "Running cargo");

        let mut command = Command::new(&self.binary_path);
        command
            .args(&args)
            .current_dir(&request.source_dir)
            .envs(&request.env);

        let output = run_captured(&mut command)
            .await
            .map_err(|source| BuildError::Spawn {
                tool: self.binary_path.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(BuildError::Compile {
                binary: request.binary.clone(),
                status: exit_label(&output),
                stderr: tail(&output.stderr, 20),
            });
        }

        let path = request.output_path();
        if !path.is_file() {
            return Err(BuildError::MissingOutput(path));
        }

        Ok(Artifact::from_build_output(
            &request.binary,
            path,
            &request.step_name,
        )?)
    }
}
