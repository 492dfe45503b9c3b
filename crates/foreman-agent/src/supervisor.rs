//! Per-agent supervision: run one agent process, translate its stdout
//! stream into events, enforce the circuit breakers, and report how the
//! run ended.
//!
//! Three cooperating tasks run per agent: a reader draining stdout line by
//! line (feeding the watchdog), a monitor polling the breaker flag, and a
//! watchdog monitor killing agents that go silent for the idle timeout.
//! The supervisor returns in bounded time:
//! min(process exit, configured timeout, idle timeout, cancellation).

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use foreman_core::event::{AgentEvent, EventKind, Severity};
use foreman_store::Store;

use crate::breaker::CircuitBreaker;
use crate::protocol::{EventContext, convert_json_to_events};
use crate::spawn::{kill_process_group, spawn_agent};
use crate::watchdog::Watchdog;

/// How often the monitor task reads the breaker flag.
const MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(25);
/// How often the watchdog monitor checks for a silent agent.
const WATCHDOG_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Everything needed to run one agent against one issue.
#[derive(Clone, Debug)]
pub struct AgentRunConfig {
    pub issue_id: String,
    pub executor_id: String,
    pub agent_id: String,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Duration,
    /// Max silence (no stdout) before the watchdog kills the agent.
    pub idle_timeout: Duration,
    /// Agent emits line-delimited JSON; when false, output is only captured.
    pub streaming_json: bool,
}

/// Final report for one agent run.
#[derive(Clone, Debug)]
pub struct AgentResult {
    pub success: bool,
    pub exit_code: i32,
    pub duration: Duration,
    pub output: Vec<String>,
    pub timed_out: bool,
    /// Shutdown cancellation, as opposed to a breaker trip.
    pub canceled: bool,
    pub loop_reason: Option<String>,
}

impl AgentResult {
    pub fn joined_output(&self) -> String {
        self.output.join("\n")
    }
}

pub struct AgentSupervisor {
    store: Arc<dyn Store>,
    watchdog: Arc<Watchdog>,
    breaker: Arc<CircuitBreaker>,
    config: AgentRunConfig,
}

impl AgentSupervisor {
    pub fn new(store: Arc<dyn Store>, watchdog: Arc<Watchdog>, config: AgentRunConfig) -> Self {
        Self {
            store,
            watchdog,
            breaker: Arc::new(CircuitBreaker::new()),
            config,
        }
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }

    fn event(&self, kind: EventKind, severity: Severity, message: String) -> AgentEvent {
        AgentEvent::new(
            self.config.issue_id.clone(),
            self.config.executor_id.clone(),
            kind,
            severity,
            message,
        )
        .with_agent(self.config.agent_id.clone())
    }

    /// Spawn the agent, feed it `prompt`, and wait for completion.
    pub async fn run(&self, prompt: &str, cancel: CancellationToken) -> Result<AgentResult> {
        let started = Instant::now();
        // The idle clock starts at spawn, not supervisor construction.
        self.watchdog.feed();
        let mut child = spawn_agent(
            &self.config.program,
            &self.config.args,
            &self.config.working_dir,
            prompt,
        )
        .await?;

        if let Err(e) = self
            .store
            .append_event(self.event(
                EventKind::AgentSpawned,
                Severity::Info,
                format!("spawned agent '{}'", self.config.program),
            ))
            .await
        {
            warn!("failed to record agent_spawned event: {e:#}");
        }

        let stdout = child.stdout.take().context("Failed to capture agent stdout")?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr));
        }

        let reader = tokio::spawn(read_stream(
            stdout,
            Arc::clone(&self.store),
            Arc::clone(&self.breaker),
            Arc::clone(&self.watchdog),
            EventContext {
                issue_id: self.config.issue_id.clone(),
                executor_id: self.config.executor_id.clone(),
                agent_id: self.config.agent_id.clone(),
            },
            self.config.streaming_json,
        ));

        // The monitors own the only paths from "breaker tripped" / "agent
        // silent" to "process dies": each cancels the agent token, which
        // the wait loop observes.
        let agent_cancel = cancel.child_token();
        let monitor = tokio::spawn(monitor_breaker(
            Arc::clone(&self.breaker),
            agent_cancel.clone(),
        ));
        let idle_tripped = Arc::new(AtomicBool::new(false));
        let watchdog_monitor = tokio::spawn(monitor_watchdog(
            Arc::clone(&self.watchdog),
            self.config.idle_timeout,
            Arc::clone(&idle_tripped),
            agent_cancel.clone(),
        ));

        // The wait loop only ever kills by PID, so no arm needs the child
        // handle while `wait()` borrows it.
        let pid = child.id();
        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);
        let mut timed_out = false;
        let mut canceled = false;
        let mut kill_sent = false;
        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.context("Failed to wait for agent")?;
                }
                _ = agent_cancel.cancelled(), if !kill_sent => {
                    if idle_tripped.load(Ordering::Acquire) {
                        timed_out = true;
                        warn!(
                            issue = %self.config.issue_id,
                            idle_secs = self.config.idle_timeout.as_secs(),
                            "agent idle timeout"
                        );
                    } else {
                        canceled = !self.breaker.tripped();
                    }
                    kill_process_group(pid);
                    kill_sent = true;
                }
                _ = &mut deadline, if !kill_sent => {
                    timed_out = true;
                    warn!(
                        issue = %self.config.issue_id,
                        timeout_secs = self.config.timeout.as_secs(),
                        "agent run timed out"
                    );
                    kill_process_group(pid);
                    kill_sent = true;
                }
            }
        };
        monitor.abort();
        watchdog_monitor.abort();

        let output = match reader.await {
            Ok(lines) => lines,
            Err(e) => {
                warn!("agent stdout reader task failed: {e}");
                Vec::new()
            }
        };

        let loop_reason = self.breaker.loop_reason();
        let exit_code = status.code().unwrap_or(if timed_out { 137 } else { 1 });
        let success = status.success() && !timed_out && !canceled && loop_reason.is_none();

        let (severity, message) = if success {
            (Severity::Info, format!("agent exited {exit_code}"))
        } else if let Some(reason) = &loop_reason {
            (Severity::Warning, format!("agent loop detected: {reason}"))
        } else if timed_out {
            (Severity::Warning, "agent timed out".to_string())
        } else if canceled {
            (Severity::Info, "agent cancelled by shutdown".to_string())
        } else {
            (Severity::Warning, format!("agent exited {exit_code}"))
        };
        if let Err(e) = self
            .store
            .append_event(self.event(EventKind::AgentCompleted, severity, message))
            .await
        {
            warn!("failed to record agent_completed event: {e:#}");
        }

        Ok(AgentResult {
            success,
            exit_code,
            duration: started.elapsed(),
            output,
            timed_out,
            canceled,
            loop_reason,
        })
    }
}

async fn read_stream(
    stdout: tokio::process::ChildStdout,
    store: Arc<dyn Store>,
    breaker: Arc<CircuitBreaker>,
    watchdog: Arc<Watchdog>,
    ctx: EventContext,
    streaming_json: bool,
) -> Vec<String> {
    let mut lines = BufReader::new(stdout).lines();
    let mut output = Vec::new();
    let mut line_no = 0u64;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                watchdog.feed();
                if streaming_json {
                    for event in convert_json_to_events(&line, line_no, &breaker, &ctx) {
                        if let Err(e) = store.append_event(event).await {
                            warn!("failed to persist agent event: {e:#}");
                        }
                    }
                }
                output.push(line);
                line_no += 1;
            }
            Ok(None) => break,
            Err(e) => {
                debug!("agent stdout read error: {e}");
                break;
            }
        }
    }
    output
}

async fn monitor_breaker(breaker: Arc<CircuitBreaker>, agent_cancel: CancellationToken) {
    let mut interval = tokio::time::interval(MONITOR_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = agent_cancel.cancelled() => return,
            _ = interval.tick() => {
                if breaker.tripped() {
                    agent_cancel.cancel();
                    return;
                }
            }
        }
    }
}

/// Kill agents that go silent: when the watchdog has not been fed for the
/// idle timeout, flag the trip and cancel the agent token.
async fn monitor_watchdog(
    watchdog: Arc<Watchdog>,
    idle_timeout: Duration,
    idle_tripped: Arc<AtomicBool>,
    agent_cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(WATCHDOG_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = agent_cancel.cancelled() => return,
            _ = interval.tick() => {
                if watchdog.is_stale(idle_timeout) {
                    idle_tripped.store(true, Ordering::Release);
                    agent_cancel.cancel();
                    return;
                }
            }
        }
    }
}

async fn drain_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "agent_stderr", "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::event::EventKind;
    use foreman_store::MemoryStore;

    fn config(program: &str, args: &[&str], timeout: Duration) -> AgentRunConfig {
        AgentRunConfig {
            issue_id: "fm-1".into(),
            executor_id: "exec-a".into(),
            agent_id: "agent-1".into(),
            program: program.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            working_dir: std::env::temp_dir(),
            timeout,
            idle_timeout: Duration::from_secs(60),
            streaming_json: true,
        }
    }

    fn supervisor(store: Arc<MemoryStore>, cfg: AgentRunConfig) -> AgentSupervisor {
        AgentSupervisor::new(store, Arc::new(Watchdog::new()), cfg)
    }

    #[tokio::test]
    async fn test_successful_run_captures_output_and_events() {
        let store = Arc::new(MemoryStore::new());
        let script = r#"
printf '%s\n' '{"type":"tool_use","name":"Read","input":{"path":"src/a.rs"}}'
printf '%s\n' '{"type":"tool_use","name":"Bash","input":{"cmd":"ls"}}'
printf '%s\n' 'plain text line'
"#;
        let sup = supervisor(
            Arc::clone(&store),
            config("sh", &["-c", script], Duration::from_secs(10)),
        );
        let result = sup.run("", CancellationToken::new()).await.unwrap();

        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output.len(), 3);
        assert!(!result.timed_out);
        assert!(result.loop_reason.is_none());

        let events = store.events_for_issue("fm-1", 100).await.unwrap();
        let tool_uses = events
            .iter()
            .filter(|e| e.kind == EventKind::AgentToolUse)
            .count();
        assert_eq!(tool_uses, 2);
        assert!(events.iter().any(|e| e.kind == EventKind::AgentSpawned));
        assert!(events.iter().any(|e| e.kind == EventKind::AgentCompleted));
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_failure() {
        let store = Arc::new(MemoryStore::new());
        let sup = supervisor(
            Arc::clone(&store),
            config("sh", &["-c", "exit 3"], Duration::from_secs(10)),
        );
        let result = sup.run("", CancellationToken::new()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn test_circuit_breaker_trip_cancels_agent() {
        let store = Arc::new(MemoryStore::new());
        // 25 identical reads then hang; the breaker must kill it long
        // before the sleep finishes.
        let script = r#"
i=0
while [ $i -lt 25 ]; do
  printf '%s\n' '{"type":"tool_use","name":"Read","input":{"path":"/etc/hosts"}}'
  i=$((i+1))
done
sleep 30
"#;
        let sup = supervisor(
            Arc::clone(&store),
            config("sh", &["-c", script], Duration::from_secs(20)),
        );
        let result = sup.run("", CancellationToken::new()).await.unwrap();

        assert!(!result.success);
        assert!(!result.canceled, "breaker trip is not a shutdown cancel");
        assert!(result.loop_reason.is_some());
        assert!(result.duration < Duration::from_secs(15));

        let events = store.events_for_issue("fm-1", 100).await.unwrap();
        let tool_uses = events
            .iter()
            .filter(|e| e.kind == EventKind::AgentToolUse)
            .count();
        assert_eq!(tool_uses, 20, "exactly the cap produces events");
    }

    #[tokio::test]
    async fn test_timeout_flags_result() {
        let store = Arc::new(MemoryStore::new());
        let sup = supervisor(
            Arc::clone(&store),
            config("sleep", &["30"], Duration::from_millis(200)),
        );
        let result = sup.run("", CancellationToken::new()).await.unwrap();
        assert!(!result.success);
        assert!(result.timed_out);
        assert!(!result.canceled);
        assert!(result.duration < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_silent_agent_killed_by_watchdog() {
        let store = Arc::new(MemoryStore::new());
        // Never produces output; the idle watchdog must kill it long
        // before the total timeout.
        let mut cfg = config("sleep", &["30"], Duration::from_secs(60));
        cfg.idle_timeout = Duration::from_millis(300);
        let sup = supervisor(Arc::clone(&store), cfg);
        let result = sup.run("", CancellationToken::new()).await.unwrap();

        assert!(!result.success);
        assert!(result.timed_out, "idle kill reports as a timeout");
        assert!(!result.canceled, "idle kill is not a shutdown cancel");
        assert!(result.loop_reason.is_none());
        assert!(result.duration < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_shutdown_cancel_is_distinguished() {
        let store = Arc::new(MemoryStore::new());
        let sup = supervisor(
            Arc::clone(&store),
            config("sleep", &["30"], Duration::from_secs(60)),
        );
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            })
        };
        let result = sup.run("", cancel).await.unwrap();
        handle.await.unwrap();

        assert!(!result.success);
        assert!(result.canceled);
        assert!(!result.timed_out);
        assert!(result.loop_reason.is_none());
    }

    #[tokio::test]
    async fn test_events_carry_monotonic_source_lines() {
        let store = Arc::new(MemoryStore::new());
        let script = r#"
printf '%s\n' 'noise'
printf '%s\n' '{"type":"tool_use","name":"Read","input":{"path":"a.rs"}}'
printf '%s\n' '{"type":"tool_use","name":"Read","input":{"path":"b.rs"}}'
"#;
        let sup = supervisor(
            Arc::clone(&store),
            config("sh", &["-c", script], Duration::from_secs(10)),
        );
        sup.run("", CancellationToken::new()).await.unwrap();

        let mut events = store.events_for_issue("fm-1", 100).await.unwrap();
        events.retain(|e| e.kind == EventKind::AgentToolUse);
        events.reverse();
        let lines: Vec<_> = events.iter().filter_map(|e| e.source_line).collect();
        assert_eq!(lines, vec![1, 2]);
    }
}
