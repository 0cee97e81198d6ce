//! Toolchain Provisioning Integration Tests
//!
//! Drives `RustupProvisioner` against a fake `rustup` script that records
//! its installs in a state directory.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use ferry::adapters::{
    ProvisionError, Provisioner, RustupProvisioner, ToolchainChannel, ToolchainSpec,
};
use tempfile::TempDir;

const TARGET: &str = "i686-pc-windows-msvc";

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("rustup");
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A rustup that keeps installed toolchains and targets in plain files
fn fake_rustup(state: &Path) -> PathBuf {
    let body = format!(
        r#"STATE="{state}"
echo "$@" >> "$STATE/calls.log"
case "$1 $2" in
  "toolchain list") cat "$STATE/toolchains" 2>/dev/null; exit 0 ;;
  "toolchain install")
    echo "$3-x86_64-unknown-linux-gnu" >> "$STATE/toolchains"
    echo "$7" >> "$STATE/targets"
    exit 0 ;;
  "target list") cat "$STATE/targets" 2>/dev/null; exit 0 ;;
  "target add") echo "$5" >> "$STATE/targets"; exit 0 ;;
esac
echo "unexpected: $@" >&2
exit 1
"#,
        state = state.display()
    );
    write_script(state, &body)
}

fn calls(state: &Path) -> Vec<String> {
    std::fs::read_to_string(state.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn installs(state: &Path) -> usize {
    calls(state)
        .iter()
        .filter(|c| c.starts_with("toolchain install") || c.starts_with("target add"))
        .count()
}

#[tokio::test]
async fn test_provision_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let rustup = fake_rustup(temp.path());
    let provisioner = RustupProvisioner::with_binary_path(rustup.display().to_string());
    let spec = ToolchainSpec {
        channel: "1.75".parse().unwrap(),
        target: TARGET.to_string(),
    };

    let first = provisioner.provision(&spec).await.unwrap();
    assert!(first.newly_installed);
    assert_eq!(first.toolchain, "1.75-x86_64-unknown-linux-gnu");
    assert_eq!(first.target, TARGET);
    assert_eq!(installs(temp.path()), 1);

    let second = provisioner.provision(&spec).await.unwrap();
    assert!(!second.newly_installed);
    assert_eq!(second.toolchain, first.toolchain);
    assert_eq!(installs(temp.path()), 1);
}

#[tokio::test]
async fn test_missing_target_is_added_to_installed_toolchain() {
    let temp = TempDir::new().unwrap();
    std::fs::write(
        temp.path().join("toolchains"),
        "stable-x86_64-unknown-linux-gnu (default)\n",
    )
    .unwrap();
    std::fs::write(temp.path().join("targets"), "x86_64-unknown-linux-gnu\n").unwrap();

    let rustup = fake_rustup(temp.path());
    let provisioner = RustupProvisioner::with_binary_path(rustup.display().to_string());
    let spec = ToolchainSpec {
        channel: ToolchainChannel::Stable,
        target: TARGET.to_string(),
    };

    let outcome = provisioner.provision(&spec).await.unwrap();
    assert!(outcome.newly_installed);
    assert_eq!(outcome.toolchain, "stable-x86_64-unknown-linux-gnu");

    let log = calls(temp.path());
    assert!(log.iter().any(|c| c.starts_with("target add")));
    assert!(!log.iter().any(|c| c.starts_with("toolchain install")));
}

#[tokio::test]
async fn test_download_failure_is_transient() {
    let temp = TempDir::new().unwrap();
    let script = write_script(
        temp.path(),
        r#"case "$1 $2" in
  "toolchain list") exit 0 ;;
esac
echo "error: could not download file from 'https://static.rust-lang.org'" >&2
exit 1
"#,
    );

    let provisioner = RustupProvisioner::with_binary_path(script.display().to_string());
    let spec = ToolchainSpec {
        channel: ToolchainChannel::Nightly,
        target: TARGET.to_string(),
    };

    let err = provisioner.provision(&spec).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Network(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_unknown_toolchain_is_permanent() {
    let temp = TempDir::new().unwrap();
    let script = write_script(
        temp.path(),
        r#"case "$1 $2" in
  "toolchain list") exit 0 ;;
esac
echo "error: toolchain '0.1' is not installable" >&2
exit 1
"#,
    );

    let provisioner = RustupProvisioner::with_binary_path(script.display().to_string());
    let spec = ToolchainSpec {
        channel: "0.1".parse().unwrap(),
        target: TARGET.to_string(),
    };

    let err = provisioner.provision(&spec).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Unavailable { .. }));
    assert!(!err.is_transient());
}
