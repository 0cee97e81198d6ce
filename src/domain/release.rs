//! Release coordinates: what is being shipped, for which platform, on which channel.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Platform tag a package is published under (e.g. `x86-windows`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Platform(String);

/// Known platform tags and the Rust target triple each one builds for
const PLATFORM_TRIPLES: &[(&str, &str)] = &[
    ("x86-windows", "i686-pc-windows-msvc"),
    ("x64-windows", "x86_64-pc-windows-msvc"),
    ("arm64-windows", "aarch64-pc-windows-msvc"),
    ("x64-linux", "x86_64-unknown-linux-gnu"),
    ("arm64-linux", "aarch64-unknown-linux-gnu"),
    ("x64-macos", "x86_64-apple-darwin"),
    ("arm64-macos", "aarch64-apple-darwin"),
];

impl Platform {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rust target triple for this platform.
    ///
    /// Unknown tags are assumed to already be a target triple.
    pub fn target_triple(&self) -> &str {
        PLATFORM_TRIPLES
            .iter()
            .find(|(tag, _)| *tag == self.0)
            .map(|(_, triple)| *triple)
            .unwrap_or(self.0.as_str())
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Platform, version and channel of a single release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseCoordinates {
    pub platform: Platform,

    /// Semantic version string (validated)
    pub version: String,

    /// Release track, e.g. `nightly` or `stable`
    pub channel: String,
}

impl ReleaseCoordinates {
    /// Build coordinates, validating the version as semver
    pub fn new(
        platform: impl Into<String>,
        version: impl Into<String>,
        channel: impl Into<String>,
    ) -> Result<Self> {
        let version = version.into();
        semver::Version::parse(&version)
            .with_context(|| format!("Invalid release version '{}'", version))?;

        let platform = platform.into();
        check_path_segment("platform", &platform)?;

        let channel = channel.into();
        check_path_segment("release channel", &channel)?;

        Ok(Self {
            platform: Platform::new(platform),
            version,
            channel,
        })
    }
}

/// Check a value used as one segment of a registry path or URL.
///
/// Rejects empty values, separators, `..`, URL delimiters and control
/// characters.
pub fn check_path_segment(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{} cannot be empty", what);
    }

    let forbidden = ['/', '\\', '?', '#', '%'];
    if value.contains(&forbidden[..])
        || value.contains("..")
        || value.chars().any(char::is_control)
    {
        anyhow::bail!(
            "Invalid {} '{}': must be a single path segment",
            what,
            value.escape_debug()
        );
    }

    Ok(())
}

/// The event that started a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Event name, e.g. `push` or `manual`
    pub event: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

impl Trigger {
    pub fn manual() -> Self {
        Self {
            event: "manual".to_string(),
            git_ref: None,
            commit: None,
        }
    }

    /// Describe the trigger from CI environment variables, if present
    pub fn from_env() -> Self {
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        Self {
            event: env("GITHUB_EVENT_NAME").unwrap_or_else(|| "manual".to_string()),
            git_ref: env("GITHUB_REF"),
            commit: env("GITHUB_SHA"),
        }
    }
}

impl Default for Trigger {
    fn default() -> Self {
        Self::manual()
    }
}

/// Compute the release version from `<source_dir>/Cargo.toml`.
///
/// Uses `package.version`, falling back to `workspace.package.version`.
pub fn compute_version(source_dir: &Path) -> Result<String> {
    let manifest_path = source_dir.join("Cargo.toml");
    let content = std::fs::read_to_string(&manifest_path)
        .with_context(|| format!("Failed to read manifest: {}", manifest_path.display()))?;

    version_from_manifest(&content)
        .with_context(|| format!("No usable version in {}", manifest_path.display()))
}

fn version_from_manifest(content: &str) -> Result<String> {
    let manifest: toml::Table = toml::from_str(content).context("Failed to parse Cargo.toml")?;

    let lookup = |path: &[&str]| -> Option<String> {
        let mut value = manifest.get(path[0])?;
        for key in &path[1..] {
            value = value.get(*key)?;
        }
        value.as_str().map(str::to_string)
    };

    let version = lookup(&["package", "version"])
        .or_else(|| lookup(&["workspace", "package", "version"]))
        .ok_or_else(|| anyhow::anyhow!("Manifest has no package version"))?;

    semver::Version::parse(&version)
        .with_context(|| format!("Manifest version '{}' is not semver", version))?;

    Ok(version)
}
