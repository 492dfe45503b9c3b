//! Agent process spawning.
//!
//! The child gets piped stdio, its own process group (setsid), and
//! `kill_on_drop` as a safety net. Prompts go in over stdin with a bounded
//! write timeout so a wedged child cannot stall the supervisor.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::warn;

const STDIN_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Verify the agent binary resolves on PATH before claiming work.
pub fn check_agent_installed(program: &str) -> Result<()> {
    which::which(program)
        .map(|_| ())
        .with_context(|| format!("Agent '{program}' is not installed or not in PATH"))
}

/// Spawn the agent with the prompt piped to stdin.
pub async fn spawn_agent(
    program: &str,
    args: &[String],
    working_dir: &Path,
    prompt: &str,
) -> Result<Child> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(working_dir)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    // Isolate the child in its own process group so a group kill reaches
    // any grandchildren it spawns.
    // SAFETY: setsid() is async-signal-safe and runs before exec.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn agent '{program}'"))?;

    if let Some(mut stdin) = child.stdin.take() {
        let payload = prompt.as_bytes().to_vec();
        tokio::spawn(async move {
            match tokio::time::timeout(STDIN_WRITE_TIMEOUT, async {
                stdin.write_all(&payload).await?;
                stdin.shutdown().await?;
                Ok::<_, std::io::Error>(())
            })
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("agent stdin write error: {e}"),
                Err(_) => warn!(
                    timeout_secs = STDIN_WRITE_TIMEOUT.as_secs(),
                    "agent stdin write timed out"
                ),
            }
        });
    } else {
        warn!("agent stdin requested but no piped handle was available");
    }

    Ok(child)
}

/// Kill the child's whole process group by PID. A missing PID means the
/// child is already reaped; `kill_on_drop` remains the safety net.
pub fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: kill() is async-signal-safe; the negative PID targets
        // the process group created by setsid in pre_exec.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}
