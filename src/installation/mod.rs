// Installation logic
//
// The orchestrator state machine and its collaborators (fetch, extract, launcher
// registration, path resolution, per-framework locking), plus a small runner for the
// desktop tools the launcher shells out to.

pub mod extract;
pub mod fetch;
pub mod files;
pub mod launcher;
pub mod lock;
pub mod orchestrator;
pub mod paths;
pub mod session;

use anyhow::{Context, Result};
use log::{debug, warn};
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run `program` once and capture its output. The child is killed when the timeout
/// expires. A non-zero exit is not an error; the caller decides.
pub async fn run_command(
    program: &Path,
    args: &[String],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    let started = Instant::now();
    debug!(
        "[PHASE: installation] [STEP: cmd] {} -> {:?} {:?} (timeout_ms={})",
        operation,
        program,
        args,
        timeout_dur.as_millis()
    );

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn {:?} ({})", program, operation))?;

    let output = match timeout(timeout_dur, child.wait_with_output()).await {
        Ok(output) => output.with_context(|| format!("{:?} failed ({})", program, operation))?,
        Err(_) => {
            warn!(
                "[PHASE: installation] [STEP: cmd] {} timed out after {}ms; process killed",
                operation,
                timeout_dur.as_millis()
            );
            return Err(anyhow::anyhow!(
                "{:?} timed out after {}ms ({})",
                program,
                timeout_dur.as_millis(),
                operation
            ));
        }
    };

    let out = CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    debug!(
        "[PHASE: installation] [STEP: cmd] {} exited with {:?} after {}ms",
        operation,
        out.exit_code,
        started.elapsed().as_millis()
    );
    Ok(out)
}
