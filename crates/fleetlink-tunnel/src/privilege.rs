//! Privileged command execution.
//!
//! Residual-process cleanup and optional privileged launch go through the
//! `su` helper. The runner is a trait so the sweep logic can be exercised
//! against a recording fake in tests.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Result of one privileged command.
#[derive(Debug, Clone)]
pub struct RunnerOutput {
    pub success: bool,
    pub stdout: String,
}

/// Runs a single shell command through the privilege helper.
#[async_trait]
pub trait PrivilegedRunner: Send + Sync {
    async fn run(&self, command: &str) -> std::io::Result<RunnerOutput>;
}

/// Production runner: `su -c <command>`.
#[derive(Debug, Default, Clone)]
pub struct SuRunner;

#[async_trait]
impl PrivilegedRunner for SuRunner {
    async fn run(&self, command: &str) -> std::io::Result<RunnerOutput> {
        let output = Command::new("su").arg("-c").arg(command).output().await?;
        Ok(RunnerOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}

/// Whether privileged access is actually usable: the helper must resolve on
/// `PATH` and a trivial command through it must succeed.
pub async fn detect_privileged_access(runner: &dyn PrivilegedRunner) -> bool {
    if which::which("su").is_err() {
        debug!("No su helper on PATH");
        return false;
    }
    match runner.run("true").await {
        Ok(output) => output.success,
        Err(err) => {
            debug!(error = %err, "Privilege probe failed");
            false
        }
    }
}

/// Kill stray instances of the tunnel binary left over from a previous run.
///
/// Best-effort by contract: every failure is logged and swallowed so a
/// sweep can never block a subsequent start.
pub async fn sweep_residual_processes(runner: &dyn PrivilegedRunner, binary_name: &str) {
    let pids = match find_residual_pids(runner, binary_name).await {
        Some(pids) if !pids.is_empty() => pids,
        _ => {
            info!(binary = binary_name, "No residual tunnel processes");
            return;
        }
    };

    let pid_list = pids.join(" ");
    info!(pids = %pid_list, "Killing residual tunnel processes");
    match runner.run(&format!("kill {pid_list}")).await {
        Ok(output) if output.success => {}
        Ok(_) => {
            warn!(pids = %pid_list, "Plain kill failed, forcing");
            if let Err(err) = runner.run(&format!("kill -9 {pid_list}")).await {
                warn!(error = %err, "Forced kill failed");
            }
        }
        Err(err) => {
            warn!(error = %err, "Residual process kill failed");
        }
    }
}

/// Look up stray PIDs with `pidof`, falling back to a pattern `pgrep`.
async fn find_residual_pids(
    runner: &dyn PrivilegedRunner,
    binary_name: &str,
) -> Option<Vec<String>> {
    let lookup = runner.run(&format!("pidof {binary_name}")).await.ok();
    let stdout = match lookup {
        Some(output) if output.success && !output.stdout.trim().is_empty() => output.stdout,
        _ => {
            debug!(binary = binary_name, "pidof found nothing, trying pgrep");
            let fallback = runner.run(&format!("pgrep -f {binary_name}")).await.ok()?;
            if !fallback.success {
                return None;
            }
            fallback.stdout
        }
    };

    Some(
        stdout
            .split_whitespace()
            .filter(|pid| pid.chars().all(|c| c.is_ascii_digit()))
            .map(str::to_string)
            .collect(),
    )
}
