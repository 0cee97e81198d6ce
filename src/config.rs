//! Configuration for ferry.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (FERRY_HOME, FERRY_REGISTRY_URL)
//! 2. Config file (.ferry/config.yaml)
//! 3. Defaults (~/.ferry)
//!
//! Config file discovery:
//! - Searches current directory and parents for .ferry/config.yaml
//! - Paths in config file are relative to the .ferry/ directory
//!
//! Secrets are never stored here. The config only names the environment
//! variables they are read from.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::SafetyLimits;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

pub const DEFAULT_SIGNING_KEY_ENV: &str = "FERRY_SIGNING_KEY";
pub const DEFAULT_REGISTRY_TOKEN_ENV: &str = "FERRY_REGISTRY_TOKEN";
pub const DEFAULT_SIGNING_CREDENTIAL_ENV: &str = "SIGNING_PASSWORD";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub limits: Option<SafetyLimits>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .ferry/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryConfig {
    /// `https://...` or `file:///...`
    pub url: Option<String>,
    /// Environment variable holding the upload token
    pub token_env: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SigningConfig {
    #[serde(default)]
    pub method: SigningMethod,
    /// Environment variable holding the base64 Ed25519 seed (method: key)
    pub key_env: Option<String>,
    /// External signing program (method: command)
    pub command: Option<String>,
    /// Arguments for the signing program; `{file}` is the artifact path
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variable the credential is read from and passed on as
    pub credential_env: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningMethod {
    #[default]
    Key,
    Command,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolsConfig {
    pub rustup: Option<String>,
    pub cargo: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultsConfig {
    pub platform: Option<String>,
    pub channel: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Absolute path to ferry home (run logs)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub registry_url: Option<String>,
    pub registry_token_env: String,
    pub signing: SigningSettings,
    pub rustup: String,
    pub cargo: String,
    pub default_platform: String,
    pub default_channel: String,
    /// Limits applied to pipelines that declare none
    pub limits: SafetyLimits,
}

#[derive(Debug, Clone, Serialize)]
pub struct SigningSettings {
    pub method: SigningMethod,
    pub key_env: String,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub credential_env: String,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".ferry").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to a base directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let config_file = find_config_file();
    let config = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    resolve_config(config_file, config)
}

/// Merge a parsed config file with environment overrides and defaults
fn resolve_config(config_file: Option<PathBuf>, config: ConfigFile) -> Result<ResolvedConfig> {
    let home = match (env_var("FERRY_HOME"), &config.paths.home, &config_file) {
        (Some(env_home), _, _) => PathBuf::from(env_home),
        (None, Some(home_path), Some(config_path)) => {
            // home is relative to .ferry/
            let ferry_dir = config_path.parent().unwrap_or(Path::new("."));
            resolve_path(ferry_dir, home_path)
        }
        _ => dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".ferry"),
    };

    let registry_url = env_var("FERRY_REGISTRY_URL").or(config.registry.url);

    let signing = SigningSettings {
        method: config.signing.method,
        key_env: config
            .signing
            .key_env
            .unwrap_or_else(|| DEFAULT_SIGNING_KEY_ENV.to_string()),
        command: config.signing.command,
        args: config.signing.args,
        credential_env: config
            .signing
            .credential_env
            .unwrap_or_else(|| DEFAULT_SIGNING_CREDENTIAL_ENV.to_string()),
    };

    if signing.method == SigningMethod::Command && signing.command.is_none() {
        anyhow::bail!("signing.method is 'command' but signing.command is not set");
    }

    Ok(ResolvedConfig {
        home,
        config_file,
        registry_url,
        registry_token_env: config
            .registry
            .token_env
            .unwrap_or_else(|| DEFAULT_REGISTRY_TOKEN_ENV.to_string()),
        signing,
        rustup: config.tools.rustup.unwrap_or_else(|| "rustup".to_string()),
        cargo: config.tools.cargo.unwrap_or_else(|| "cargo".to_string()),
        default_platform: config
            .defaults
            .platform
            .unwrap_or_else(|| "x64-linux".to_string()),
        default_channel: config
            .defaults
            .channel
            .unwrap_or_else(|| "stable".to_string()),
        limits: config.limits.unwrap_or_default(),
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the ferry home directory
pub fn ferry_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the runs directory ($FERRY_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.home.join("runs"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CONFIG_YAML: &str = r#"
version: "1"
paths:
  home: ./state
registry:
  url: https://packages.example.com
  token_env: CI_REGISTRY_TOKEN
signing:
  method: command
  command: osslsigncode
  args: ["sign", "-pass", "env:SIGN_PASS", "-in", "{file}"]
  credential_env: SIGN_PASS
tools:
  cargo: /opt/cargo/bin/cargo
defaults:
  platform: x86-windows
  channel: nightly
limits:
  step_timeout_seconds: 60
"#;

    #[test]
    fn test_config_file_parsing() {
        let config: ConfigFile = serde_yaml::from_str(CONFIG_YAML).unwrap();

        assert_eq!(config.version.as_deref(), Some("1"));
        assert_eq!(config.paths.home.as_deref(), Some("./state"));
        assert_eq!(config.signing.method, SigningMethod::Command);
        assert_eq!(config.signing.args.len(), 5);
        assert_eq!(config.limits.unwrap().step_timeout_seconds, 60);
    }

    #[test]
    fn test_resolve_applies_defaults() {
        let resolved = resolve_config(None, ConfigFile::default()).unwrap();

        assert_eq!(resolved.signing.method, SigningMethod::Key);
        assert_eq!(resolved.signing.key_env, DEFAULT_SIGNING_KEY_ENV);
        assert_eq!(resolved.registry_token_env, DEFAULT_REGISTRY_TOKEN_ENV);
        assert_eq!(resolved.rustup, "rustup");
        assert_eq!(resolved.cargo, "cargo");
        assert_eq!(resolved.default_channel, "stable");
        assert_eq!(resolved.limits, SafetyLimits::default());
        assert!(resolved.config_file.is_none());
    }

    #[test]
    fn test_resolve_from_file() {
        let temp = TempDir::new().unwrap();
        let ferry_dir = temp.path().join(".ferry");
        std::fs::create_dir_all(&ferry_dir).unwrap();
        let config_path = ferry_dir.join("config.yaml");
        std::fs::write(&config_path, CONFIG_YAML).unwrap();

        let config = load_config_file(&config_path).unwrap();
        let resolved = resolve_config(Some(config_path.clone()), config).unwrap();

        if std::env::var("FERRY_HOME").is_err() {
            assert_eq!(resolved.home, ferry_dir.join("state"));
        }
        assert_eq!(resolved.registry_token_env, "CI_REGISTRY_TOKEN");
        assert_eq!(resolved.signing.command.as_deref(), Some("osslsigncode"));
        assert_eq!(resolved.cargo, "/opt/cargo/bin/cargo");
        assert_eq!(resolved.default_platform, "x86-windows");
        assert_eq!(resolved.limits.step_timeout_seconds, 60);
        assert_eq!(resolved.config_file, Some(config_path));
    }

    #[test]
    fn test_command_signing_requires_command() {
        let config: ConfigFile = serde_yaml::from_str("signing:\n  method: command\n").unwrap();
        assert!(resolve_config(None, config).is_err());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project/.ferry");

        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(
            resolve_path(&base, "runs"),
            PathBuf::from("/home/user/project/.ferry/runs")
        );
    }
}
