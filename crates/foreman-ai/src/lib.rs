//! AI supervisor contract.
//!
//! The oracle is a pure request/response collaborator: it assesses issues
//! before execution, analyzes results after, summarizes raw output, and
//! makes code-review decisions. Every method may fail; callers degrade
//! gracefully (log and continue) except where a result is required.
//!
//! Outgoing prompts are logged when `VC_DEBUG_PROMPTS` is set.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use foreman_core::env;
use foreman_core::types::{Issue, IssueKind, Priority};

/// Pre-execution assessment of an issue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Assessment {
    /// Free-form strategy notes injected into the agent prompt.
    pub strategy: String,
    /// Issues the oracle believes are already in a terminal state.
    pub already_complete: bool,
}

/// Post-execution analysis of an agent run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Analysis {
    pub completed: bool,
    pub summary: String,
    #[serde(default)]
    pub discovered: Vec<DiscoveredIssue>,
}

/// A follow-on issue surfaced by analysis, pre-deduplication.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredIssue {
    pub title: String,
    pub description: String,
    pub kind: IssueKind,
    pub priority: Priority,
}

/// Code-review decision for a finished change.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub needs_review: bool,
    /// Oracle confidence in its own decision, 0.0..=1.0. Low confidence
    /// forces review regardless of `needs_review`.
    pub confidence: f64,
}

/// One granular fix surfaced by automated quality analysis.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QualityFinding {
    pub title: String,
    pub description: String,
    pub priority: Priority,
}

/// Test-coverage gaps for the current diff.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CoverageReport {
    #[serde(default)]
    pub gaps: Vec<DiscoveredIssue>,
}

#[async_trait]
pub trait Oracle: Send + Sync {
    async fn assess_issue_state(&self, issue: &Issue) -> Result<Assessment>;
    async fn analyze_execution_result(&self, issue: &Issue, output: &str) -> Result<Analysis>;
    async fn summarize_agent_output(&self, output: &str) -> Result<String>;
    async fn analyze_code_review_need(&self, issue: &Issue, diff: &str) -> Result<ReviewDecision>;
    async fn analyze_code_quality(&self, issue: &Issue, diff: &str) -> Result<Vec<QualityFinding>>;
    async fn analyze_test_coverage(&self, diff: &str, test_sample: &str) -> Result<CoverageReport>;
    async fn diagnose_test_failure(&self, gate_output: &str) -> Result<String>;
    /// Deduplicate candidate discoveries against the tracker before creation.
    async fn create_discovered_issues(
        &self,
        issue: &Issue,
        candidates: Vec<DiscoveredIssue>,
    ) -> Result<Vec<DiscoveredIssue>>;
    async fn generate_commit_message(&self, issue: &Issue, diff: &str) -> Result<String>;
}

/// Log an outgoing prompt when `VC_DEBUG_PROMPTS` is enabled. Real oracle
/// implementations call this before every request.
pub fn log_prompt(method: &str, prompt: &str) {
    if env::flag(env::DEBUG_PROMPTS) {
        tracing::debug!(method, prompt, "outgoing oracle prompt");
    }
}

/// Oracle used when AI is disabled: every method fails, and callers fall
/// back to their non-AI paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledOracle;

macro_rules! disabled {
    () => {
        Err(anyhow::anyhow!("AI supervisor is disabled"))
    };
}

#[async_trait]
impl Oracle for DisabledOracle {
    async fn assess_issue_state(&self, _issue: &Issue) -> Result<Assessment> {
        disabled!()
    }

    async fn analyze_execution_result(&self, _issue: &Issue, _output: &str) -> Result<Analysis> {
        disabled!()
    }

    async fn summarize_agent_output(&self, _output: &str) -> Result<String> {
        disabled!()
    }

    async fn analyze_code_review_need(
        &self,
        _issue: &Issue,
        _diff: &str,
    ) -> Result<ReviewDecision> {
        disabled!()
    }

    async fn analyze_code_quality(
        &self,
        _issue: &Issue,
        _diff: &str,
    ) -> Result<Vec<QualityFinding>> {
        disabled!()
    }

    async fn analyze_test_coverage(
        &self,
        _diff: &str,
        _test_sample: &str,
    ) -> Result<CoverageReport> {
        disabled!()
    }

    async fn diagnose_test_failure(&self, _gate_output: &str) -> Result<String> {
        disabled!()
    }

    async fn create_discovered_issues(
        &self,
        _issue: &Issue,
        _candidates: Vec<DiscoveredIssue>,
    ) -> Result<Vec<DiscoveredIssue>> {
        disabled!()
    }

    async fn generate_commit_message(&self, _issue: &Issue, _diff: &str) -> Result<String> {
        disabled!()
    }
}
