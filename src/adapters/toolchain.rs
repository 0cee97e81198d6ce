//! Toolchain provisioning via `rustup`.
//!
//! Checks what is already installed before touching anything, so running a
//! provision step against a host that already has the toolchain and target
//! is a no-op.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use super::process::{exit_label, run_captured, tail};
use super::Provisioner;

/// Which toolchain to install
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolchainChannel {
    Stable,
    Beta,
    Nightly,
    /// A pinned release, possibly partial (`1`, `1.75`, `1.75.0`)
    Version(PartialVersion),
}

impl ToolchainChannel {
    /// Whether an installed toolchain name (as printed by
    /// `rustup toolchain list`) satisfies this channel
    pub fn matches(&self, installed: &str) -> bool {
        match self {
            Self::Stable => installed == "stable" || installed.starts_with("stable-"),
            Self::Beta => installed == "beta" || installed.starts_with("beta-"),
            Self::Nightly => installed == "nightly" || installed.starts_with("nightly-"),
            Self::Version(wanted) => installed
                .split('-')
                .next()
                .and_then(|v| v.parse::<PartialVersion>().ok())
                .map(|have| wanted.is_satisfied_by(&have))
                .unwrap_or(false),
        }
    }
}

impl FromStr for ToolchainChannel {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "stable" => Ok(Self::Stable),
            "beta" => Ok(Self::Beta),
            "nightly" => Ok(Self::Nightly),
            other => other
                .parse::<PartialVersion>()
                .map(Self::Version)
                .map_err(|_| ProvisionError::InvalidChannel(s.to_string())),
        }
    }
}

impl fmt::Display for ToolchainChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stable => f.write_str("stable"),
            Self::Beta => f.write_str("beta"),
            Self::Nightly => f.write_str("nightly"),
            Self::Version(v) => write!(f, "{}", v),
        }
    }
}

/// `MAJOR[.MINOR[.PATCH]]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialVersion {
    pub major: u64,
    pub minor: Option<u64>,
    pub patch: Option<u64>,
}

impl PartialVersion {
    /// Component-wise match: every component given in `self` must equal the
    /// corresponding component of `installed`.
    pub fn is_satisfied_by(&self, installed: &PartialVersion) -> bool {
        self.major == installed.major
            && self.minor.map_or(true, |m| installed.minor == Some(m))
            && self.patch.map_or(true, |p| installed.patch == Some(p))
    }
}

impl FromStr for PartialVersion {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '.');
        let major = parts.next().unwrap_or_default().parse()?;
        let minor = parts.next().map(str::parse).transpose()?;
        let patch = parts.next().map(str::parse).transpose()?;

        Ok(Self {
            major,
            minor,
            patch,
        })
    }
}

impl fmt::Display for PartialVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.major)?;
        if let Some(minor) = self.minor {
            write!(f, ".{}", minor)?;
            if let Some(patch) = self.patch {
                write!(f, ".{}", patch)?;
            }
        }
        Ok(())
    }
}

/// What the provisioner is asked to make available
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainSpec {
    pub channel: ToolchainChannel,
    /// Rust target triple, e.g. `i686-pc-windows-msvc`
    pub target: String,
}

/// Result of a provision call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionOutcome {
    /// Toolchain name usable with `cargo +<toolchain>`
    pub toolchain: String,
    pub target: String,
    /// False when everything was already installed
    pub newly_installed: bool,
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid toolchain channel '{0}' (expected stable, beta, nightly or a version)")]
    InvalidChannel(String),

    #[error("failed to run {tool}: {source}")]
    ToolMissing {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("toolchain {toolchain} for target {target} is unavailable: {detail}")]
    Unavailable {
        toolchain: String,
        target: String,
        detail: String,
    },

    #[error("network error while installing toolchain: {0}")]
    Network(String),
}

impl ProvisionError {
    /// Whether a retry could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// Provisioner backed by the `rustup` CLI
pub struct RustupProvisioner {
    /// Path to the rustup binary (default: "rustup")
    binary_path: String,
}

impl Default for RustupProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl RustupProvisioner {
    pub fn new() -> Self {
        Self::with_binary_path("rustup")
    }

    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    async fn rustup(&self, args: &[&str]) -> Result<std::process::Output, ProvisionError> {
        debug!(rustup = %self.binary_path, ?args, "Running rustup");
        run_captured(Command::new(&self.binary_path).args(args))
            .await
            .map_err(|source| ProvisionError::ToolMissing {
                tool: self.binary_path.clone(),
                source,
            })
    }

    /// Names of installed toolchains
    pub async fn installed_toolchains(&self) -> Result<Vec<String>, ProvisionError> {
        let output = self.rustup(&["toolchain", "list"]).await?;
        if !output.status.success() {
            return Err(ProvisionError::Unavailable {
                toolchain: "*".to_string(),
                target: "*".to_string(),
                detail: format!("rustup toolchain list failed: {}", tail(&output.stderr, 5)),
            });
        }
        Ok(parse_listing(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Installed targets of a toolchain
    pub async fn installed_targets(&self, toolchain: &str) -> Result<Vec<String>, ProvisionError> {
        let output = self
            .rustup(&["target", "list", "--installed", "--toolchain", toolchain])
            .await?;
        if !output.status.success() {
            return Ok(Vec::new());
        }
        Ok(parse_listing(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn install_toolchain(&self, spec: &ToolchainSpec) -> Result<(), ProvisionError> {
        let channel = spec.channel.to_string();
        info!(toolchain = %channel, target = %spec.target, "Installing toolchain");

        let output = self
            .rustup(&[
                "toolchain",
                "install",
                &channel,
                "--profile",
                "minimal",
                "--target",
                &spec.target,
            ])
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(classify_failure(&channel, &spec.target, &output))
        }
    }

    async fn add_target(&self, toolchain: &str, target: &str) -> Result<(), ProvisionError> {
        info!(%toolchain, %target, "Adding target");

        let output = self
            .rustup(&["target", "add", "--toolchain", toolchain, target])
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(classify_failure(toolchain, target, &output))
        }
    }
}

#[async_trait]
impl Provisioner for RustupProvisioner {
    fn name(&self) -> &str {
        "rustup"
    }

    async fn provision(&self, spec: &ToolchainSpec) -> Result<ProvisionOutcome, ProvisionError> {
        let installed = self.installed_toolchains().await?;

        if let Some(toolchain) = find_installed(&spec.channel, &installed) {
            let targets = self.installed_targets(&toolchain).await?;
            if targets.iter().any(|t| *t == spec.target) {
                info!(%toolchain, target = %spec.target, "Toolchain already installed");
                return Ok(ProvisionOutcome {
                    toolchain,
                    target: spec.target.clone(),
                    newly_installed: false,
                });
            }

            self.add_target(&toolchain, &spec.target).await?;
            return Ok(ProvisionOutcome {
                toolchain,
                target: spec.target.clone(),
                newly_installed: true,
            });
        }

        self.install_toolchain(spec).await?;

        // Resolve the installed name (e.g. `1.75-x86_64-pc-windows-msvc`)
        let installed = self.installed_toolchains().await?;
        let toolchain =
            find_installed(&spec.channel, &installed).unwrap_or_else(|| spec.channel.to_string());

        Ok(ProvisionOutcome {
            toolchain,
            target: spec.target.clone(),
            newly_installed: true,
        })
    }
}

/// First whitespace-separated token of every non-empty line.
///
/// `rustup toolchain list` prints `stable-x86_64-unknown-linux-gnu (default)`.
fn parse_listing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter(|line| !line.trim_start().starts_with("no "))
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

fn find_installed(channel: &ToolchainChannel, installed: &[String]) -> Option<String> {
    installed.iter().find(|name| channel.matches(name)).cloned()
}

fn classify_failure(toolchain: &str, target: &str, output: &std::process::Output) -> ProvisionError {
    let stderr = tail(&output.stderr, 5);
    let lowered = stderr.to_lowercase();

    let network = ["could not download", "failed to connect", "timed out", "connection reset"];
    if network.iter().any(|needle| lowered.contains(needle)) {
        return ProvisionError::Network(stderr);
    }

    ProvisionError::Unavailable {
        toolchain: toolchain.to_string(),
        target: target.to_string(),
        detail: format!("rustup failed with {}: {}", exit_label(output), stderr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_parsing() {
        assert_eq!("stable".parse::<ToolchainChannel>().unwrap(), ToolchainChannel::Stable);
        assert_eq!(
            "1.75".parse::<ToolchainChannel>().unwrap(),
            ToolchainChannel::Version(PartialVersion {
                major: 1,
                minor: Some(75),
                patch: None
            })
        );
        assert!(matches!(
            "latest".parse::<ToolchainChannel>(),
            Err(ProvisionError::InvalidChannel(_))
        ));
        assert!("1.75.0.1".parse::<ToolchainChannel>().is_err());
    }

    #[test]
    fn test_partial_version_display_roundtrip() {
        for text in ["1", "1.75", "1.75.2"] {
            let version: PartialVersion = text.parse().unwrap();
            assert_eq!(version.to_string(), text);
        }
    }

    #[test]
    fn test_version_matching() {
        let channel: ToolchainChannel = "1.75".parse().unwrap();
        assert!(channel.matches("1.75.0-x86_64-unknown-linux-gnu"));
        assert!(channel.matches("1.75.2-x86_64-pc-windows-msvc"));
        assert!(channel.matches("1.75-x86_64-unknown-linux-gnu"));
        assert!(!channel.matches("1.76.0-x86_64-unknown-linux-gnu"));
        assert!(!channel.matches("stable-x86_64-unknown-linux-gnu"));

        let exact: ToolchainChannel = "1.75.2".parse().unwrap();
        assert!(!exact.matches("1.75-x86_64-unknown-linux-gnu"));
        assert!(exact.matches("1.75.2-x86_64-unknown-linux-gnu"));
    }

    #[test]
    fn test_named_channel_matching() {
        assert!(ToolchainChannel::Stable.matches("stable-x86_64-unknown-linux-gnu"));
        assert!(ToolchainChannel::Nightly.matches("nightly-2024-05-01-x86_64-unknown-linux-gnu"));
        assert!(!ToolchainChannel::Beta.matches("stable-x86_64-unknown-linux-gnu"));
    }

    #[test]
    fn test_parse_listing() {
        let stdout = "stable-x86_64-unknown-linux-gnu (default)\n1.75.0-x86_64-unknown-linux-gnu\n\n";
        assert_eq!(
            parse_listing(stdout),
            vec![
                "stable-x86_64-unknown-linux-gnu".to_string(),
                "1.75.0-x86_64-unknown-linux-gnu".to_string()
            ]
        );
        assert!(parse_listing("no installed toolchains\n").is_empty());
    }

    #[tokio::test]
    async fn test_missing_rustup_binary() {
        let provisioner = RustupProvisioner::with_binary_path("/nonexistent/ferry-rustup");
        let spec = ToolchainSpec {
            channel: ToolchainChannel::Stable,
            target: "x86_64-unknown-linux-gnu".to_string(),
        };

        let err = provisioner.provision(&spec).await.unwrap_err();
        assert!(matches!(err, ProvisionError::ToolMissing { .. }));
        assert!(!err.is_transient());
    }
}
