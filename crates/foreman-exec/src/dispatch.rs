//! Dispatch loop: claim a ready issue, drive it through assessment and
//! execution, hand the raw result to the results processor, release.
//!
//! A single dispatch loop runs per executor. Cancellation is checked at
//! the top of every iteration and flows into the in-flight agent through
//! the intervention controller.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use foreman_agent::{AgentRunConfig, AgentSupervisor, InterventionController, Watchdog};
use foreman_ai::{Assessment, Oracle};
use foreman_core::config::ExecutorConfig;
use foreman_core::event::{AgentEvent, EventKind, Severity};
use foreman_core::{env, labels};
use foreman_core::types::{ExecState, Issue, NewIssue, Priority, Sandbox};
use foreman_git::GitOps;
use foreman_store::Store;

use crate::approval::ApprovalGate;
use crate::processor::ResultsProcessor;
use crate::state::{ReleaseOutcome, StateDriver};

/// Idle poll when no issue is ready.
const DISPATCH_IDLE_POLL: Duration = Duration::from_secs(2);
/// How much agent output feeds a loop diagnosis request.
const DIAGNOSIS_TAIL_CHARS: usize = 2_000;

pub struct Dispatcher {
    store: Arc<dyn Store>,
    oracle: Arc<dyn Oracle>,
    processor: ResultsProcessor,
    intervention: Arc<InterventionController>,
    config: ExecutorConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        oracle: Arc<dyn Oracle>,
        git: Arc<dyn GitOps>,
        approval: Arc<dyn ApprovalGate>,
        config: ExecutorConfig,
        root_cancel: CancellationToken,
    ) -> Self {
        let processor = ResultsProcessor::new(
            Arc::clone(&store),
            Arc::clone(&oracle),
            git,
            approval,
            config.clone(),
        );
        Self {
            store,
            oracle,
            processor,
            intervention: Arc::new(InterventionController::new(root_cancel)),
            config,
        }
    }

    pub fn intervention(&self) -> Arc<InterventionController> {
        Arc::clone(&self.intervention)
    }

    /// Main loop. Returns when `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.store.register_instance(&self.config.executor_id).await?;
        self.check_bootstrap_mode().await;

        loop {
            if cancel.is_cancelled() {
                info!("dispatch loop stopping");
                return Ok(());
            }
            if let Err(e) = self.store.heartbeat_instance(&self.config.executor_id).await {
                warn!("instance heartbeat failed: {e:#}");
            }

            match self.run_once(&cancel).await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(DISPATCH_IDLE_POLL) => {}
                    }
                }
                Err(e) => {
                    warn!("dispatch iteration failed: {e:#}");
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(DISPATCH_IDLE_POLL) => {}
                    }
                }
            }
        }
    }

    /// Claim and execute at most one ready issue. Returns whether any work
    /// was picked up.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<bool> {
        let Some(issue) = self.store.next_ready_issue().await? else {
            return Ok(false);
        };
        info!(issue = %issue.id, title = %issue.title, "dispatching issue");
        self.execute_issue(issue, cancel).await?;
        Ok(true)
    }

    /// When gates are configured away there is no verification baseline:
    /// announce bootstrap mode and file a baseline-test task once.
    async fn check_bootstrap_mode(&self) {
        if !self.config.gates.enabled || !self.config.gates.commands.is_empty() {
            return;
        }
        let event = AgentEvent::new(
            "",
            &self.config.executor_id,
            EventKind::BootstrapModeActivated,
            Severity::Warning,
            "no quality gates configured; executing without a verification baseline".to_string(),
        );
        if let Err(e) = self.store.append_event(event).await {
            warn!("failed to record bootstrap event: {e:#}");
        }

        let existing = match self.store.search_issues(Default::default()).await {
            Ok(issues) => issues
                .iter()
                .any(|i| i.labels.contains(labels::BASELINE_TESTS)),
            Err(e) => {
                warn!("baseline-task lookup failed: {e:#}");
                return;
            }
        };
        if !existing {
            let created = self
                .store
                .create_issue(NewIssue {
                    title: "Establish baseline test suite".into(),
                    description: "The executor is running without quality gates. Add a \
                                  minimal test suite so gates can be enabled."
                        .into(),
                    priority: Some(Priority::P1),
                    labels: [labels::BASELINE_TESTS.to_string()].into(),
                    ..Default::default()
                })
                .await;
            match created {
                Ok(issue) => info!(issue = %issue.id, "filed baseline test task"),
                Err(e) => warn!("failed to file baseline test task: {e:#}"),
            }
        }
    }

    async fn execute_issue(&self, issue: Issue, cancel: &CancellationToken) -> Result<()> {
        let (driver, record) = StateDriver::claim(
            Arc::clone(&self.store),
            &self.config.executor_id,
            &issue.id,
            Duration::from_secs(self.config.heartbeat_interval_secs),
        )
        .await?;
        debug!(issue = %issue.id, attempt = record.attempt, "claimed");

        let heartbeat_cancel = cancel.child_token();
        let heartbeat = driver.spawn_heartbeat(heartbeat_cancel.clone());

        let outcome = self.run_pipeline(&issue, &driver, cancel).await;

        heartbeat_cancel.cancel();
        let _ = heartbeat.await;

        if let Err(e) = outcome {
            warn!(issue = %issue.id, "pipeline failed: {e:#}");
            let reason = format!("{e:#}");
            if let Err(release_err) = driver.release(ReleaseOutcome::Failure(&reason)).await {
                warn!(issue = %issue.id, "release after failure also failed: {release_err:#}");
            }
        }
        Ok(())
    }

    async fn run_pipeline(
        &self,
        issue: &Issue,
        driver: &StateDriver,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // Assessment. The transition happens even when AI is disabled so
        // the audit history is the same shape for every run.
        driver.advance(ExecState::Assessing).await?;
        self.emit(&issue.id, EventKind::AssessmentStarted, Severity::Info, "assessing issue").await;
        let assessment = if self.config.ai_enabled {
            match self.oracle.assess_issue_state(issue).await {
                Ok(assessment) => Some(assessment),
                Err(e) => {
                    warn!(issue = %issue.id, "assessment degraded: {e:#}");
                    None
                }
            }
        } else {
            None
        };
        self.emit(
            &issue.id,
            EventKind::AssessmentCompleted,
            Severity::Info,
            "assessment completed",
        )
        .await;

        // Execution.
        driver.advance(ExecState::Executing).await?;
        let sandbox = self.store.get_mission_sandbox(&issue.id).await?;
        let working_dir = sandbox
            .as_ref()
            .map(|s| s.path.clone())
            .unwrap_or_else(|| self.config.repo_root.clone());

        let agent_id = format!("agent-{}", ulid::Ulid::new().to_string().to_lowercase());
        let agent_cancel = self.intervention.register(&agent_id);
        let prompt = build_prompt(issue, assessment.as_ref(), sandbox.as_ref());
        foreman_ai::log_prompt("execute_issue", &prompt);
        let supervisor = AgentSupervisor::new(
            Arc::clone(&self.store),
            Arc::new(Watchdog::new()),
            AgentRunConfig {
                issue_id: issue.id.clone(),
                executor_id: self.config.executor_id.clone(),
                agent_id: agent_id.clone(),
                program: self.config.agent.program.clone(),
                args: self.config.agent.args.clone(),
                working_dir: working_dir.clone(),
                timeout: Duration::from_secs(self.config.agent.timeout_secs),
                idle_timeout: Duration::from_secs(self.config.agent.idle_timeout_secs),
                streaming_json: self.config.agent.streaming_json,
            },
        );
        let run = supervisor.run(&prompt, agent_cancel).await;
        self.intervention.deregister(&agent_id);
        let agent_result = run.context("agent supervision failed")?;

        if agent_result.canceled {
            driver.release(ReleaseOutcome::Canceled).await?;
            return Ok(());
        }

        // AI-side loop diagnosis, unless explicitly left to the breakers.
        if agent_result.loop_reason.is_some()
            && self.config.ai_enabled
            && !env::flag(env::DISABLE_AI_LOOP_DETECTION)
        {
            let tail = output_tail(&agent_result.output, DIAGNOSIS_TAIL_CHARS);
            match self.oracle.summarize_agent_output(&tail).await {
                Ok(diagnosis) => {
                    if let Err(e) = self
                        .store
                        .add_comment(
                            &issue.id,
                            &self.config.executor_id,
                            &format!("Loop diagnosis: {diagnosis}"),
                        )
                        .await
                    {
                        warn!("failed to record loop diagnosis: {e:#}");
                    }
                }
                Err(e) => debug!("loop diagnosis skipped: {e:#}"),
            }
        }

        self.processor
            .process(issue, driver, &agent_result, &working_dir, sandbox.as_ref(), cancel)
            .await?;
        Ok(())
    }

    async fn emit(&self, issue_id: &str, kind: EventKind, severity: Severity, message: &str) {
        let event = AgentEvent::new(issue_id, &self.config.executor_id, kind, severity, message);
        if let Err(e) = self.store.append_event(event).await {
            warn!("failed to append event: {e:#}");
        }
    }
}

/// Prompt handed to the agent: the issue, the oracle's strategy notes, and
/// the report contract the results processor parses.
fn build_prompt(issue: &Issue, assessment: Option<&Assessment>, sandbox: Option<&Sandbox>) -> String {
    let mut prompt = format!(
        "You are working on issue {id}: {title}\n\n{description}\n",
        id = issue.id,
        title = issue.title,
        description = issue.description,
    );
    if !issue.acceptance_criteria.is_empty() {
        prompt.push_str(&format!("\nAcceptance criteria:\n{}\n", issue.acceptance_criteria));
    }
    if let Some(assessment) = assessment {
        if !assessment.strategy.is_empty() {
            prompt.push_str(&format!("\nStrategy notes:\n{}\n", assessment.strategy));
        }
    }
    if let Some(sandbox) = sandbox {
        prompt.push_str(&format!(
            "\nYou are in sandbox branch {} (base {}).\n",
            sandbox.branch, sandbox.base_branch
        ));
    }
    prompt.push_str(
        "\nWhen finished, print a JSON report between the lines \
         `=== AGENT REPORT ===` and `=== END AGENT REPORT ===` with a \
         `status` field of completed, blocked, partial, or decomposed, and a \
         `summary`.\n",
    );
    prompt
}

fn output_tail(lines: &[String], max_chars: usize) -> String {
    let mut tail = String::new();
    for line in lines.iter().rev() {
        if tail.len() + line.len() + 1 > max_chars {
            break;
        }
        if tail.is_empty() {
            tail = line.clone();
        } else {
            tail = format!("{line}\n{tail}");
        }
    }
    tail
}
