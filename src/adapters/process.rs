//! Subprocess helpers shared by the command-backed adapters.

use std::process::{Output, Stdio};

use tokio::process::Command;

/// Run a command to completion, capturing stdout and stderr.
///
/// The child is killed if the returned future is dropped, so a step timeout
/// in the orchestrator also stops the tool it was waiting on.
pub(crate) async fn run_captured(cmd: &mut Command) -> std::io::Result<Output> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
}

/// Last `lines` lines of a process stream, lossily decoded and trimmed
pub(crate) fn tail(bytes: &[u8], lines: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let all: Vec<&str> = text.trim_end().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Human-readable exit status (`exit code 101`, `signal`)
pub(crate) fn exit_label(output: &Output) -> String {
    match output.status.code() {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}
