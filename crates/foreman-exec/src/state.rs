//! Execution state-machine driver.
//!
//! One driver exists per claimed issue. It advances the claim through the
//! forward-only state chain, keeps the heartbeat fresh from a background
//! task, and owns release — including the repeated-failure policy that
//! blocks an issue after too many failed attempts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use foreman_core::event::{AgentEvent, EventKind, Severity};
use foreman_core::types::{ExecState, ExecutionRecord, IssueStatus};
use foreman_store::Store;

/// Failed attempts in a row before release-with-error blocks the issue.
pub const REPEATED_FAILURE_WINDOW: usize = 3;

/// How a claim is being released.
#[derive(Clone, Copy, Debug)]
pub enum ReleaseOutcome<'a> {
    /// Attempt recorded as success; issue status left as the pipeline set it.
    Success,
    /// Shutdown: no attempt recorded, in-progress issues reopen for resume.
    Canceled,
    /// Incomplete work retry: failed attempt, reopen. The comment scan is
    /// the authority for escalation, not the attempt history.
    Incomplete,
    /// Escalated to a human: failed attempt, status left as set (blocked).
    Escalated,
    /// Agent failure: failed attempt, then the repeated-failure policy.
    Failure(&'a str),
}

pub struct StateDriver {
    store: Arc<dyn Store>,
    executor_id: String,
    issue_id: String,
    heartbeat_interval: Duration,
}

impl StateDriver {
    /// Claim the issue and emit `issue_claimed`.
    pub async fn claim(
        store: Arc<dyn Store>,
        executor_id: &str,
        issue_id: &str,
        heartbeat_interval: Duration,
    ) -> Result<(Self, ExecutionRecord)> {
        let record = store.claim_execution(issue_id, executor_id).await?;
        let event = AgentEvent::new(
            issue_id,
            executor_id,
            EventKind::IssueClaimed,
            Severity::Info,
            format!("claimed by {executor_id} (attempt {})", record.attempt),
        );
        if let Err(e) = store.append_event(event).await {
            warn!("failed to record issue_claimed event: {e:#}");
        }
        Ok((
            Self {
                store,
                executor_id: executor_id.to_string(),
                issue_id: issue_id.to_string(),
                heartbeat_interval,
            },
            record,
        ))
    }

    pub fn issue_id(&self) -> &str {
        &self.issue_id
    }

    pub fn executor_id(&self) -> &str {
        &self.executor_id
    }

    /// Advance to the next state. The store rejects skips and backward moves.
    pub async fn advance(&self, state: ExecState) -> Result<()> {
        self.store
            .update_execution_state(&self.issue_id, &self.executor_id, state)
            .await
    }

    /// Background heartbeat until cancelled or the claim disappears.
    pub fn spawn_heartbeat(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let issue_id = self.issue_id.clone();
        let executor_id = self.executor_id.clone();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = store.heartbeat_execution(&issue_id, &executor_id).await {
                            warn!(issue = %issue_id, "heartbeat failed: {e:#}");
                        }
                    }
                }
            }
        })
    }

    /// Release the claim. Idempotent with respect to cleanup races: if the
    /// record is already gone, the goal is met and the call succeeds.
    pub async fn release(&self, outcome: ReleaseOutcome<'_>) -> Result<()> {
        match outcome {
            ReleaseOutcome::Success => {
                self.store.record_attempt(&self.issue_id, true).await?;
            }
            ReleaseOutcome::Canceled => {
                self.reopen_if_in_progress().await?;
            }
            ReleaseOutcome::Incomplete => {
                self.store.record_attempt(&self.issue_id, false).await?;
                self.reopen_if_in_progress().await?;
            }
            ReleaseOutcome::Escalated => {
                self.store.record_attempt(&self.issue_id, false).await?;
            }
            ReleaseOutcome::Failure(reason) => {
                self.store.record_attempt(&self.issue_id, false).await?;
                self.apply_repeated_failure_policy(reason).await?;
            }
        }
        self.store.release_execution(&self.issue_id).await
    }

    async fn reopen_if_in_progress(&self) -> Result<()> {
        let issue = self.store.get_issue(&self.issue_id).await?;
        if issue.status == IssueStatus::InProgress {
            self.store
                .set_issue_status(&self.issue_id, IssueStatus::Open)
                .await?;
        }
        Ok(())
    }

    /// Blocked after `REPEATED_FAILURE_WINDOW` consecutive failures;
    /// reopened otherwise.
    async fn apply_repeated_failure_policy(&self, reason: &str) -> Result<()> {
        let history = self.store.execution_history(&self.issue_id).await?;
        let recent_failures = history
            .iter()
            .rev()
            .take(REPEATED_FAILURE_WINDOW)
            .filter(|a| !a.success)
            .count();
        if history.len() >= REPEATED_FAILURE_WINDOW && recent_failures == REPEATED_FAILURE_WINDOW {
            info!(issue = %self.issue_id, "blocking after repeated failures");
            self.store
                .set_issue_status(&self.issue_id, IssueStatus::Blocked)
                .await?;
            self.store
                .add_comment(
                    &self.issue_id,
                    &self.executor_id,
                    &format!(
                        "Blocked after {REPEATED_FAILURE_WINDOW} consecutive failed attempts. Last error: {reason}"
                    ),
                )
                .await?;
        } else {
            self.store
                .add_comment(
                    &self.issue_id,
                    &self.executor_id,
                    &format!("Execution failed: {reason}"),
                )
                .await?;
            self.reopen_if_in_progress().await?;
        }
        Ok(())
    }
}
