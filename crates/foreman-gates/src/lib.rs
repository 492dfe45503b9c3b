//! Quality-gate runner.
//!
//! Runs an ordered sequence of verification gates with progress callbacks,
//! an overall timeout, and cancellation. Timeout and shutdown-cancel are
//! distinguished so the caller can pick retry semantics (timeout blocks
//! the issue, cancel reopens it). The runner never touches the tracker;
//! the caller owns all result handling.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use foreman_core::config::GateCommandConfig;
use foreman_core::event::GateProgress;

/// Heartbeat cadence for long-running gates.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Result of one gate.
#[derive(Clone, Debug)]
pub struct GateOutcome {
    pub gate: String,
    pub passed: bool,
    pub output: String,
    pub error: Option<String>,
}

#[async_trait]
pub trait Gate: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, dir: &Path) -> GateOutcome;
}

/// Gate that shells out to a command in the target directory; the gate
/// passes iff the command exits zero.
#[derive(Clone, Debug)]
pub struct CommandGate {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandGate {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &GateCommandConfig) -> Self {
        Self::new(&config.name, &config.program, config.args.clone())
    }
}

#[async_trait]
impl Gate for CommandGate {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, dir: &Path) -> GateOutcome {
        debug!(gate = %self.name, dir = %dir.display(), "running gate");
        match Command::new(&self.program)
            .args(&self.args)
            .current_dir(dir)
            .output()
            .await
        {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.trim().is_empty() {
                    if !text.is_empty() && !text.ends_with('\n') {
                        text.push('\n');
                    }
                    text.push_str(&stderr);
                }
                GateOutcome {
                    gate: self.name.clone(),
                    passed: output.status.success(),
                    output: text,
                    error: None,
                }
            }
            Err(e) => GateOutcome {
                gate: self.name.clone(),
                passed: false,
                output: String::new(),
                error: Some(format!("failed to run {}: {e}", self.program)),
            },
        }
    }
}

/// Collected result of a gate sequence.
#[derive(Clone, Debug, Default)]
pub struct GatesResult {
    pub passed: bool,
    pub timed_out: bool,
    pub canceled: bool,
    pub outcomes: Vec<GateOutcome>,
    pub elapsed: Duration,
}

impl GatesResult {
    pub fn passed_names(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.passed)
            .map(|o| o.gate.clone())
            .collect()
    }

    pub fn failed_names(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| !o.passed)
            .map(|o| o.gate.clone())
            .collect()
    }
}

pub type ProgressCallback = Arc<dyn Fn(GateProgress) + Send + Sync>;

pub struct GateRunner {
    timeout: Duration,
    heartbeat: Duration,
}

impl GateRunner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            heartbeat: HEARTBEAT_INTERVAL,
        }
    }

    /// Shorter heartbeat for tests.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Run all gates in order. The progress callback fires (a) before each
    /// gate starts, (b) on a heartbeat while a gate runs, and (c) at each
    /// gate's completion. The sequence stops at the first timeout or
    /// cancellation; gate failures do not stop it early — the caller
    /// decides what failure means.
    pub async fn run(
        &self,
        gates: &[Box<dyn Gate>],
        dir: &Path,
        cancel: &CancellationToken,
        progress: &ProgressCallback,
    ) -> GatesResult {
        let started = Instant::now();
        let total = gates.len();
        let mut result = GatesResult::default();
        let notify: &(dyn Fn(GateProgress) + Send + Sync) = progress.as_ref();

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        'gates: for (index, gate) in gates.iter().enumerate() {
            notify(GateProgress {
                current_gate: gate.name().to_string(),
                gates_completed: index,
                total_gates: total,
                elapsed_seconds: started.elapsed().as_secs(),
                message: format!("running gate {}", gate.name()),
            });

            let mut heartbeat = tokio::time::interval_at(
                tokio::time::Instant::now() + self.heartbeat,
                self.heartbeat,
            );
            let gate_run = gate.run(dir);
            tokio::pin!(gate_run);

            loop {
                tokio::select! {
                    outcome = &mut gate_run => {
                        notify(GateProgress {
                            current_gate: gate.name().to_string(),
                            gates_completed: index + 1,
                            total_gates: total,
                            elapsed_seconds: started.elapsed().as_secs(),
                            message: format!(
                                "gate {} {}",
                                gate.name(),
                                if outcome.passed { "passed" } else { "failed" }
                            ),
                        });
                        result.outcomes.push(outcome);
                        continue 'gates;
                    }
                    _ = &mut deadline => {
                        result.timed_out = true;
                        break 'gates;
                    }
                    _ = cancel.cancelled() => {
                        result.canceled = true;
                        break 'gates;
                    }
                    _ = heartbeat.tick() => {
                        notify(GateProgress {
                            current_gate: gate.name().to_string(),
                            gates_completed: index,
                            total_gates: total,
                            elapsed_seconds: started.elapsed().as_secs(),
                            message: format!(
                                "still running {} ({}s)",
                                gate.name(),
                                started.elapsed().as_secs()
                            ),
                        });
                    }
                }
            }
        }

        result.elapsed = started.elapsed();
        result.passed = !result.timed_out
            && !result.canceled
            && result.outcomes.len() == total
            && result.outcomes.iter().all(|o| o.passed);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct SleepGate {
        name: String,
        duration: Duration,
        passes: bool,
    }

    #[async_trait]
    impl Gate for SleepGate {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, _dir: &Path) -> GateOutcome {
            tokio::time::sleep(self.duration).await;
            GateOutcome {
                gate: self.name.clone(),
                passed: self.passes,
                output: String::new(),
                error: None,
            }
        }
    }

    fn sleep_gate(name: &str, millis: u64, passes: bool) -> Box<dyn Gate> {
        Box::new(SleepGate {
            name: name.into(),
            duration: Duration::from_millis(millis),
            passes,
        })
    }

    fn collector() -> (ProgressCallback, Arc<Mutex<Vec<GateProgress>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ProgressCallback = Arc::new(move |p| sink.lock().unwrap().push(p));
        (callback, seen)
    }

    #[tokio::test]
    async fn test_all_passing_gates() {
        let gates = vec![sleep_gate("test", 5, true), sleep_gate("lint", 5, true)];
        let (progress, seen) = collector();
        let result = GateRunner::new(Duration::from_secs(10))
            .run(&gates, Path::new("."), &CancellationToken::new(), &progress)
            .await;

        assert!(result.passed);
        assert!(!result.timed_out && !result.canceled);
        assert_eq!(result.passed_names(), vec!["test", "lint"]);

        let seen = seen.lock().unwrap();
        // start + complete for each gate.
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0].message, "running gate test");
        assert_eq!(seen[0].gates_completed, 0);
        assert_eq!(seen[1].message, "gate test passed");
        assert_eq!(seen[1].gates_completed, 1);
        assert_eq!(seen[3].gates_completed, 2);
        assert!(seen.iter().all(|p| p.total_gates == 2));
    }

    #[tokio::test]
    async fn test_failed_gate_recorded_and_sequence_continues() {
        let gates = vec![sleep_gate("test", 1, false), sleep_gate("lint", 1, true)];
        let (progress, _) = collector();
        let result = GateRunner::new(Duration::from_secs(10))
            .run(&gates, Path::new("."), &CancellationToken::new(), &progress)
            .await;

        assert!(!result.passed);
        assert_eq!(result.failed_names(), vec!["test"]);
        assert_eq!(result.passed_names(), vec!["lint"]);
    }

    #[tokio::test]
    async fn test_timeout_distinct_from_cancel() {
        let gates = vec![sleep_gate("slow", 5_000, true)];
        let (progress, _) = collector();
        let result = GateRunner::new(Duration::from_millis(50))
            .run(&gates, Path::new("."), &CancellationToken::new(), &progress)
            .await;
        assert!(result.timed_out);
        assert!(!result.canceled);
        assert!(!result.passed);
    }

    #[tokio::test]
    async fn test_cancel_distinct_from_timeout() {
        let gates = vec![sleep_gate("slow", 5_000, true)];
        let (progress, _) = collector();
        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                cancel.cancel();
            })
        };
        let result = GateRunner::new(Duration::from_secs(60))
            .run(&gates, Path::new("."), &cancel, &progress)
            .await;
        canceller.await.unwrap();
        assert!(result.canceled);
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_heartbeat_fires_for_long_gate() {
        let gates = vec![sleep_gate("slow", 300, true)];
        let (progress, seen) = collector();
        let result = GateRunner::new(Duration::from_secs(10))
            .with_heartbeat(Duration::from_millis(50))
            .run(&gates, Path::new("."), &CancellationToken::new(), &progress)
            .await;

        assert!(result.passed);
        let seen = seen.lock().unwrap();
        let heartbeats = seen
            .iter()
            .filter(|p| p.message.starts_with("still running"))
            .count();
        assert!(heartbeats >= 2, "expected heartbeats, saw {heartbeats}");
    }

    #[tokio::test]
    async fn test_command_gate_pass_and_fail() {
        let tmp = tempfile::tempdir().unwrap();
        let pass = CommandGate::new("true-gate", "sh", vec!["-c".into(), "echo ok".into()]);
        let outcome = pass.run(tmp.path()).await;
        assert!(outcome.passed);
        assert!(outcome.output.contains("ok"));

        let fail = CommandGate::new("fail-gate", "sh", vec!["-c".into(), "echo bad >&2; exit 1".into()]);
        let outcome = fail.run(tmp.path()).await;
        assert!(!outcome.passed);
        assert!(outcome.output.contains("bad"));
    }

    #[tokio::test]
    async fn test_command_gate_missing_binary_sets_error() {
        let gate = CommandGate::new("ghost", "definitely-not-a-binary-xyz", vec![]);
        let outcome = gate.run(Path::new(".")).await;
        assert!(!outcome.passed);
        assert!(outcome.error.is_some());
    }
}
