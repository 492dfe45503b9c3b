//! Results processor: the post-execution pipeline.
//!
//! A linear sequence with well-defined early exits. Every step appends to
//! the audit stream; most failures degrade (log and continue) rather than
//! abort, because the claim must always be released.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use foreman_agent::AgentResult;
use foreman_ai::Oracle;
use foreman_core::config::ExecutorConfig;
use foreman_core::event::{AgentEvent, EventData, EventKind, Severity};
use foreman_core::labels;
use foreman_core::report::extract_report;
use foreman_core::types::{
    DepKind, Dependency, ExecState, Issue, IssueKind, IssueStatus, NewIssue, Priority, Sandbox,
};
use foreman_gates::{CommandGate, Gate, GateRunner, GatesResult, ProgressCallback};
use foreman_git::{CommitOptions, GitOps};
use foreman_mission::{HandledReport, ReportHandler};
use foreman_store::Store;

use crate::approval::{Approval, ApprovalGate};
use crate::state::{ReleaseOutcome, StateDriver};

/// Marker counted by incomplete-work handling; the comment scan is
/// authoritative over attempt history.
pub const INCOMPLETE_MARKER: &str = "Incomplete Work Detected";
/// Lines kept when the oracle cannot summarize raw output.
const OUTPUT_TAIL_LINES: usize = 50;
/// Cap on the test sample fed to coverage analysis.
const TEST_SAMPLE_MAX_BYTES: usize = 4 * 1024;

/// Accumulated outcome of one pipeline run.
#[derive(Clone, Debug, Default)]
pub struct ProcessingResult {
    pub completed: bool,
    pub gates_passed: bool,
    /// Ids of follow-on issues created along the way.
    pub discovered: Vec<String>,
    pub commit_hash: Option<String>,
    pub analysis: Option<String>,
    pub summary: String,
}

pub struct ResultsProcessor {
    store: Arc<dyn Store>,
    oracle: Arc<dyn Oracle>,
    git: Arc<dyn GitOps>,
    approval: Arc<dyn ApprovalGate>,
    config: ExecutorConfig,
}

impl ResultsProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        oracle: Arc<dyn Oracle>,
        git: Arc<dyn GitOps>,
        approval: Arc<dyn ApprovalGate>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            oracle,
            git,
            approval,
            config,
        }
    }

    fn event(&self, issue_id: &str, kind: EventKind, severity: Severity, message: String) -> AgentEvent {
        AgentEvent::new(issue_id, &self.config.executor_id, kind, severity, message)
    }

    async fn emit(&self, event: AgentEvent) {
        if let Err(e) = self.store.append_event(event).await {
            warn!("failed to append event: {e:#}");
        }
    }

    async fn comment(&self, issue_id: &str, body: &str) {
        if let Err(e) = self
            .store
            .add_comment(issue_id, &self.config.executor_id, body)
            .await
        {
            warn!("failed to add comment: {e:#}");
        }
    }

    /// Run the pipeline. The driver must be in `executing` state.
    pub async fn process(
        &self,
        issue: &Issue,
        driver: &StateDriver,
        agent_result: &AgentResult,
        working_dir: &Path,
        sandbox: Option<&Sandbox>,
        cancel: &CancellationToken,
    ) -> Result<ProcessingResult> {
        self.emit(self.event(
            &issue.id,
            EventKind::ResultsProcessingStarted,
            Severity::Info,
            format!("processing results for {}", issue.id),
        ))
        .await;

        let mut result = ProcessingResult::default();
        let output = agent_result.joined_output();

        // Step 1: output extraction, with a clearly-marked raw fallback.
        result.summary = match self.oracle.summarize_agent_output(&output).await {
            Ok(summary) => summary,
            Err(e) => {
                debug!("summarize degraded to raw tail: {e:#}");
                raw_tail(&output)
            }
        };

        // Step 2: structured report.
        let mut report_handled = false;
        let mut close_intent = false;
        if let Some(report) = extract_report(&output) {
            let handler = ReportHandler::new(self.store.as_ref(), &self.config.executor_id);
            match handler.handle(issue, &report).await {
                Ok(HandledReport::Blocked) => {
                    driver.release(ReleaseOutcome::Success).await?;
                    self.finish(&issue.id, &result).await;
                    return Ok(result);
                }
                Ok(HandledReport::Decomposed) => {
                    driver.release(ReleaseOutcome::Success).await?;
                    self.finish(&issue.id, &result).await;
                    return Ok(result);
                }
                Ok(HandledReport::CloseIntent) => {
                    report_handled = true;
                    close_intent = true;
                }
                Ok(HandledReport::Partial) => {
                    report_handled = true;
                }
                Err(e) => {
                    warn!(issue = %issue.id, "report handler failed, falling back to analysis: {e:#}");
                }
            }
        }

        // Step 3: AI analysis. The transition always happens so the audit
        // trail shows the state even when the work is skipped.
        driver.advance(ExecState::Analyzing).await?;
        let mut ai_verdict: Option<bool> = None;
        if !report_handled && self.config.ai_enabled {
            self.emit(self.event(
                &issue.id,
                EventKind::AnalysisStarted,
                Severity::Info,
                "analyzing execution result".into(),
            ))
            .await;
            match self.oracle.analyze_execution_result(issue, &output).await {
                Ok(analysis) => {
                    ai_verdict = Some(analysis.completed);
                    result.analysis = Some(analysis.summary.clone());
                    if !analysis.discovered.is_empty() {
                        match self
                            .oracle
                            .create_discovered_issues(issue, analysis.discovered)
                            .await
                        {
                            Ok(deduped) => {
                                for d in deduped {
                                    let id = self
                                        .create_followon(
                                            issue,
                                            d.title,
                                            d.description,
                                            d.kind,
                                            d.priority,
                                            DepKind::DiscoveredFrom,
                                        )
                                        .await?;
                                    result.discovered.push(id);
                                }
                            }
                            Err(e) => warn!("discovered-issue dedup failed: {e:#}"),
                        }
                    }
                    self.emit(self.event(
                        &issue.id,
                        EventKind::AnalysisCompleted,
                        Severity::Info,
                        format!("analysis: completed={}", analysis.completed),
                    ))
                    .await;
                }
                Err(e) => warn!(issue = %issue.id, "AI analysis degraded: {e:#}"),
            }
        }

        // Step 4: mission epics delegate gates to the QA workers.
        if issue.is_mission() && self.config.gates.enabled {
            self.store.add_label(&issue.id, labels::NEEDS_QUALITY_GATES).await?;
            self.emit(self.event(
                &issue.id,
                EventKind::QualityGatesDeferred,
                Severity::Info,
                "mission gates deferred to QA workers".into(),
            ))
            .await;
            driver.release(ReleaseOutcome::Success).await?;
            self.finish(&issue.id, &result).await;
            return Ok(result);
        }

        // Step 5: quality gates.
        driver.advance(ExecState::Gates).await?;
        let in_repo = working_dir.starts_with(&self.config.repo_root);
        let should_run_gates = agent_result.success
            && self.config.gates.enabled
            && !self.config.gates.commands.is_empty()
            && in_repo;
        let mut gates_ran = false;
        let mut passed_names = Vec::new();
        if should_run_gates {
            gates_ran = true;
            let gates_result = self.run_gates(&issue.id, working_dir, cancel).await;

            if gates_result.canceled {
                self.comment(
                    &issue.id,
                    &format!(
                        "Quality gates canceled by shutdown after {}s; partial results: {}",
                        gates_result.elapsed.as_secs(),
                        summarize_outcomes(&gates_result)
                    ),
                )
                .await;
                self.emit(self.event(
                    &issue.id,
                    EventKind::QualityGatesCompleted,
                    Severity::Info,
                    "quality gates canceled".into(),
                ))
                .await;
                driver.release(ReleaseOutcome::Canceled).await?;
                self.finish(&issue.id, &result).await;
                return Ok(result);
            }

            result.gates_passed = gates_result.passed;
            passed_names = gates_result.passed_names();
            self.emit(
                self.event(
                    &issue.id,
                    EventKind::QualityGatesCompleted,
                    if gates_result.passed { Severity::Info } else { Severity::Warning },
                    if gates_result.timed_out {
                        "quality gates timed out".to_string()
                    } else {
                        format!("quality gates {}", if gates_result.passed { "passed" } else { "failed" })
                    },
                )
                .with_data(EventData::GateSummary {
                    passed: gates_result.passed_names(),
                    failed: gates_result.failed_names(),
                }),
            )
            .await;

            if !gates_result.passed {
                let mut comment = gate_failure_comment(&gates_result);
                if self.config.ai_enabled {
                    if let Some(failed) = gates_result.outcomes.iter().find(|o| !o.passed) {
                        match self.oracle.diagnose_test_failure(&failed.output).await {
                            Ok(diagnosis) => {
                                comment.push_str(&format!("\nDiagnosis: {diagnosis}"));
                            }
                            Err(e) => debug!("gate-failure diagnosis skipped: {e:#}"),
                        }
                    }
                }
                self.comment(&issue.id, &comment).await;
                self.store
                    .set_issue_status(&issue.id, IssueStatus::Blocked)
                    .await?;
                driver
                    .release(ReleaseOutcome::Failure(&format!(
                        "quality gates failed: {}",
                        gates_result.failed_names().join(", ")
                    )))
                    .await?;
                self.finish(&issue.id, &result).await;
                return Ok(result);
            }
        } else {
            let reason = if !agent_result.success {
                "agent failed"
            } else if !self.config.gates.enabled {
                "gates disabled"
            } else if self.config.gates.commands.is_empty() {
                "no gates configured"
            } else {
                "working directory outside target repo"
            };
            self.emit(self.event(
                &issue.id,
                EventKind::QualityGatesSkipped,
                Severity::Info,
                format!("quality gates skipped: {reason}"),
            ))
            .await;
            result.gates_passed = agent_result.success;
        }

        // Step 6: human approval, only for sandboxed work that passed gates.
        if let Some(sandbox) = sandbox {
            if result.gates_passed {
                match self.approval.decide(issue, sandbox).await {
                    Ok(Approval::Approved) => {}
                    Ok(Approval::Rejected { reason }) => {
                        self.store.add_label(&issue.id, labels::NEEDS_REVIEW).await?;
                        self.store
                            .set_issue_status(&issue.id, IssueStatus::Blocked)
                            .await?;
                        self.comment(&issue.id, &format!("Changes rejected by approval gate: {reason}"))
                            .await;
                        driver.release(ReleaseOutcome::Success).await?;
                        self.finish(&issue.id, &result).await;
                        return Ok(result);
                    }
                    Err(e) => warn!("approval gate degraded to approved: {e:#}"),
                }
            }
        }

        // Step 7: committing, always transitioned before any git mutation.
        driver.advance(ExecState::Committing).await?;

        let diff = match self.git.diff(working_dir).await {
            Ok(diff) => diff,
            Err(e) => {
                debug!("diff unavailable: {e:#}");
                String::new()
            }
        };

        // Step 8: test-coverage analysis, best effort.
        if self.config.ai_enabled && !diff.is_empty() {
            let sample = sample_tests(working_dir);
            match self.oracle.analyze_test_coverage(&diff, &sample).await {
                Ok(report) => {
                    for gap in report.gaps {
                        let id = self
                            .create_followon(
                                issue,
                                gap.title,
                                gap.description,
                                gap.kind,
                                gap.priority,
                                DepKind::DiscoveredFrom,
                            )
                            .await?;
                        result.discovered.push(id);
                    }
                }
                Err(e) => debug!("coverage analysis skipped: {e:#}"),
            }
        }

        // Step 9: auto-commit.
        if self.config.auto_commit {
            match self.git.has_uncommitted_changes(working_dir).await {
                Ok(true) => {
                    let message = match self.oracle.generate_commit_message(issue, &diff).await {
                        Ok(message) => message,
                        Err(_) => format!("{}: {}", issue.id, issue.title),
                    };
                    match self
                        .git
                        .commit_changes(
                            working_dir,
                            &CommitOptions {
                                message,
                                co_author: self.config.co_author.clone(),
                            },
                        )
                        .await
                    {
                        Ok(hash) => {
                            self.comment(&issue.id, &format!("Committed changes as {hash}")).await;
                            result.commit_hash = Some(hash);
                        }
                        Err(e) => {
                            warn!(issue = %issue.id, "auto-commit failed: {e:#}");
                            self.emit(
                                self.event(
                                    &issue.id,
                                    EventKind::Error,
                                    Severity::Error,
                                    "auto-commit failed".to_string(),
                                )
                                .with_data(EventData::ErrorDetail {
                                    detail: format!("{e:#}"),
                                }),
                            )
                            .await;
                        }
                    }
                }
                Ok(false) => debug!(issue = %issue.id, "no changes to commit"),
                Err(e) => warn!("uncommitted-changes check failed: {e:#}"),
            }
        }

        // Step 10: code-review decision; low confidence forces review.
        if self.config.ai_enabled && !diff.is_empty() {
            match self.oracle.analyze_code_review_need(issue, &diff).await {
                Ok(decision) => {
                    let forced = decision.confidence < self.config.review_confidence_threshold;
                    if decision.needs_review || forced {
                        if forced {
                            info!(
                                issue = %issue.id,
                                confidence = decision.confidence,
                                "low confidence forces code review"
                            );
                        }
                        match self.oracle.analyze_code_quality(issue, &diff).await {
                            Ok(findings) => {
                                for finding in findings {
                                    let id = self
                                        .create_followon(
                                            issue,
                                            finding.title,
                                            finding.description,
                                            IssueKind::Task,
                                            finding.priority,
                                            DepKind::Blocks,
                                        )
                                        .await?;
                                    result.discovered.push(id);
                                }
                            }
                            Err(e) => warn!("quality analysis degraded: {e:#}"),
                        }
                    }
                }
                Err(e) => warn!("review decision degraded: {e:#}"),
            }
        }

        // Step 11: close, or hand off to incomplete-work handling.
        let verdict = if close_intent {
            true
        } else if report_handled {
            // Partial report: remaining work exists by definition.
            false
        } else {
            ai_verdict.unwrap_or(agent_result.success)
        };

        if agent_result.success && result.gates_passed && verdict {
            let reason = if gates_ran {
                format!("Completed: gates passed ({})", passed_names.join(", "))
            } else {
                "Completed: gates skipped".to_string()
            };
            self.store.set_issue_status(&issue.id, IssueStatus::Closed).await?;
            self.comment(&issue.id, &reason).await;
            if issue.labels.contains(labels::BASELINE_TESTS) {
                self.emit(self.event(
                    &issue.id,
                    EventKind::BaselineTestFixCompleted,
                    Severity::Info,
                    "baseline test task closed".into(),
                ))
                .await;
            }
            driver.advance(ExecState::Completed).await?;
            driver.release(ReleaseOutcome::Success).await?;
            result.completed = true;

            // Step 12: convergence bookkeeping, close-time only.
            self.convergence_check(issue).await;
        } else if !agent_result.success {
            let reason = agent_failure_reason(agent_result);
            self.comment(&issue.id, &format!("Agent run failed: {reason}")).await;
            self.emit(
                self.event(
                    &issue.id,
                    EventKind::Error,
                    Severity::Warning,
                    format!("agent run failed: {reason}"),
                )
                .with_data(EventData::ErrorDetail {
                    detail: reason.clone(),
                }),
            )
            .await;
            driver.release(ReleaseOutcome::Failure(&reason)).await?;
        } else {
            self.handle_incomplete(issue, driver).await?;
        }

        self.finish(&issue.id, &result).await;
        Ok(result)
    }

    async fn run_gates(
        &self,
        issue_id: &str,
        working_dir: &Path,
        cancel: &CancellationToken,
    ) -> GatesResult {
        self.emit(self.event(
            issue_id,
            EventKind::QualityGatesStarted,
            Severity::Info,
            format!("running {} quality gates", self.config.gates.commands.len()),
        ))
        .await;

        let gates: Vec<Box<dyn Gate>> = self
            .config
            .gates
            .commands
            .iter()
            .map(|c| Box::new(CommandGate::from_config(c)) as Box<dyn Gate>)
            .collect();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let store = Arc::clone(&self.store);
        let issue_id_owned = issue_id.to_string();
        let executor_id = self.config.executor_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                let event = AgentEvent::new(
                    issue_id_owned.clone(),
                    executor_id.clone(),
                    EventKind::QualityGatesProgress,
                    Severity::Info,
                    progress_message(&progress),
                )
                .with_data(EventData::GateProgress(progress));
                if let Err(e) = store.append_event(event).await {
                    warn!("failed to append gate progress event: {e:#}");
                }
            }
        });

        let progress: ProgressCallback = Arc::new(move |p| {
            let _ = tx.send(p);
        });
        let runner = GateRunner::new(Duration::from_secs(self.config.gates.timeout_secs));
        let gates_result = runner.run(&gates, working_dir, cancel, &progress).await;
        drop(progress);
        let _ = forwarder.await;
        gates_result
    }

    async fn create_followon(
        &self,
        parent: &Issue,
        title: String,
        description: String,
        kind: IssueKind,
        priority: Priority,
        dep_kind: DepKind,
    ) -> Result<String> {
        let child = self
            .store
            .create_issue(NewIssue {
                title,
                description,
                kind: Some(kind),
                priority: Some(priority),
                ..Default::default()
            })
            .await?;
        let dep = match dep_kind {
            // Fix issues block the parent; the parent depends on them.
            DepKind::Blocks => Dependency {
                from: parent.id.clone(),
                to: child.id.clone(),
                kind: DepKind::Blocks,
            },
            _ => Dependency {
                from: child.id.clone(),
                to: parent.id.clone(),
                kind: dep_kind,
            },
        };
        self.store.add_dependency(dep).await?;
        Ok(child.id)
    }

    /// Incomplete-work handling: comment-scan driven retry, then escalate.
    async fn handle_incomplete(&self, issue: &Issue, driver: &StateDriver) -> Result<()> {
        let comments = self.store.comments_for(&issue.id).await?;
        let prior = comments
            .iter()
            .filter(|c| c.message.contains(INCOMPLETE_MARKER))
            .count() as u32;

        if prior <= self.config.max_incomplete_retries {
            self.comment(
                &issue.id,
                &format!(
                    "{INCOMPLETE_MARKER}: run finished without a completed verdict; releasing for retry {}",
                    prior + 1
                ),
            )
            .await;
            driver.release(ReleaseOutcome::Incomplete).await?;
        } else {
            self.store.add_label(&issue.id, labels::NEEDS_HUMAN_REVIEW).await?;
            self.store
                .set_issue_status(&issue.id, IssueStatus::Blocked)
                .await?;
            self.comment(
                &issue.id,
                &format!(
                    "{INCOMPLETE_MARKER}: retries exhausted after {prior} attempts; escalating to a human"
                ),
            )
            .await;
            driver.release(ReleaseOutcome::Escalated).await?;
        }
        Ok(())
    }

    /// Close-time convergence: auto-close epics, then check the mission
    /// root for convergence or explosion. All best-effort.
    async fn convergence_check(&self, issue: &Issue) {
        match foreman_mission::auto_close_epics(self.store.as_ref(), &issue.id).await {
            Ok(closed) => {
                for epic_id in closed {
                    self.comment(&epic_id, "All children closed; epic closed").await;
                }
            }
            Err(e) => warn!("epic auto-close failed: {e:#}"),
        }

        let root = match foreman_mission::mission_root(self.store.as_ref(), &issue.id).await {
            Ok(root) => root,
            Err(e) => {
                warn!(issue = %issue.id, "mission root walk failed: {e:#}");
                return;
            }
        };
        if root == issue.id {
            return;
        }
        let Ok(root_issue) = self.store.get_issue(&root).await else {
            return;
        };
        if !root_issue.is_mission() {
            return;
        }

        match foreman_mission::has_mission_converged(self.store.as_ref(), &root).await {
            Ok(true) => {
                if let Err(e) = self.store.set_issue_status(&root, IssueStatus::Closed).await {
                    warn!("failed to close converged mission: {e:#}");
                } else {
                    self.comment(&root, "Mission converged: all discoveries closed").await;
                }
            }
            Ok(false) => {}
            Err(e) => warn!("convergence check failed: {e:#}"),
        }

        match foreman_mission::check_mission_explosion(self.store.as_ref(), &root).await {
            Ok(true) => {
                self.emit(self.event(
                    &root,
                    EventKind::Progress,
                    Severity::Warning,
                    "mission discovery set exceeded the explosion threshold".into(),
                ))
                .await;
            }
            Ok(false) => {}
            Err(e) => warn!("explosion check failed: {e:#}"),
        }
    }

    async fn finish(&self, issue_id: &str, result: &ProcessingResult) {
        self.emit(self.event(
            issue_id,
            EventKind::ResultsProcessingCompleted,
            Severity::Info,
            format!(
                "processing completed: completed={} gates_passed={}",
                result.completed, result.gates_passed
            ),
        ))
        .await;
    }
}

fn progress_message(progress: &foreman_core::event::GateProgress) -> String {
    format!(
        "[{}/{}] {}",
        progress.gates_completed, progress.total_gates, progress.message
    )
}

fn raw_tail(output: &str) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    format!(
        "Raw agent output (last {} lines):\n{}",
        lines.len() - start,
        lines[start..].join("\n")
    )
}

fn summarize_outcomes(result: &GatesResult) -> String {
    if result.outcomes.is_empty() {
        return "none finished".to_string();
    }
    result
        .outcomes
        .iter()
        .map(|o| format!("{} {}", o.gate, if o.passed { "passed" } else { "failed" }))
        .collect::<Vec<_>>()
        .join(", ")
}

fn gate_failure_comment(result: &GatesResult) -> String {
    let failed = result.failed_names();
    let passed = result.passed_names();
    let mut comment = if result.timed_out {
        "Quality gates timed out.".to_string()
    } else {
        "Quality gates failed.".to_string()
    };
    if !failed.is_empty() {
        comment.push_str(&format!("\nFailed: {}", failed.join(", ")));
    }
    if !passed.is_empty() {
        comment.push_str(&format!("\nPassed: {}", passed.join(", ")));
    }
    comment
}

fn agent_failure_reason(agent_result: &AgentResult) -> String {
    if let Some(reason) = &agent_result.loop_reason {
        format!("loop detected: {reason}")
    } else if agent_result.timed_out {
        "timed out".to_string()
    } else {
        format!("exit code {}", agent_result.exit_code)
    }
}

fn sample_tests(working_dir: &Path) -> String {
    let tests_dir = working_dir.join("tests");
    let Ok(entries) = std::fs::read_dir(&tests_dir) else {
        return String::new();
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "rs") {
            if let Ok(mut content) = std::fs::read_to_string(&path) {
                content.truncate(TEST_SAMPLE_MAX_BYTES);
                return content;
            }
        }
    }
    String::new()
}

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;
