//! Append-only audit events. Every observable action the executor takes is
//! mirrored into the event stream; comments on issues are events too.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Event taxonomy produced by the core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    IssueClaimed,
    AssessmentStarted,
    AssessmentCompleted,
    AgentSpawned,
    AgentToolUse,
    AgentCompleted,
    AnalysisStarted,
    AnalysisCompleted,
    QualityGatesStarted,
    QualityGatesProgress,
    QualityGatesCompleted,
    QualityGatesSkipped,
    QualityGatesDeferred,
    SandboxRebase,
    BootstrapModeActivated,
    BaselineTestFixCompleted,
    ResultsProcessingStarted,
    ResultsProcessingCompleted,
    Progress,
    Comment,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IssueClaimed => "issue_claimed",
            Self::AssessmentStarted => "assessment_started",
            Self::AssessmentCompleted => "assessment_completed",
            Self::AgentSpawned => "agent_spawned",
            Self::AgentToolUse => "agent_tool_use",
            Self::AgentCompleted => "agent_completed",
            Self::AnalysisStarted => "analysis_started",
            Self::AnalysisCompleted => "analysis_completed",
            Self::QualityGatesStarted => "quality_gates_started",
            Self::QualityGatesProgress => "quality_gates_progress",
            Self::QualityGatesCompleted => "quality_gates_completed",
            Self::QualityGatesSkipped => "quality_gates_skipped",
            Self::QualityGatesDeferred => "quality_gates_deferred",
            Self::SandboxRebase => "sandbox_rebase",
            Self::BootstrapModeActivated => "bootstrap_mode_activated",
            Self::BaselineTestFixCompleted => "baseline_test_fix_completed",
            Self::ResultsProcessingStarted => "results_processing_started",
            Self::ResultsProcessingCompleted => "results_processing_completed",
            Self::Progress => "progress",
            Self::Comment => "comment",
            Self::Error => "error",
        }
    }
}

/// Tool-use payload extracted from an agent's stream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUseData {
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Progress payload emitted while quality gates run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateProgress {
    pub current_gate: String,
    pub gates_completed: usize,
    pub total_gates: usize,
    pub elapsed_seconds: u64,
    pub message: String,
}

/// Metrics emitted by each event-retention cleanup cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupMetrics {
    pub deleted_by_age: u64,
    pub deleted_by_issue_cap: u64,
    pub deleted_by_global_cap: u64,
    pub vacuumed: bool,
    pub duration_ms: u64,
}

/// Typed event payload. Structured error details are mirrored here so
/// tooling can aggregate without parsing messages.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventData {
    #[default]
    None,
    ToolUse(ToolUseData),
    GateProgress(GateProgress),
    GateSummary {
        passed: Vec<String>,
        failed: Vec<String>,
    },
    Cleanup(CleanupMetrics),
    ErrorDetail {
        detail: String,
    },
}

/// Immutable audit log record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentEvent {
    pub id: String,
    pub ts: DateTime<Utc>,
    pub issue_id: String,
    pub executor_id: String,
    #[serde(default)]
    pub agent_id: String,
    pub kind: EventKind,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub data: EventData,
    /// Stdout line index the event was parsed from, for replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_line: Option<u64>,
}

impl AgentEvent {
    pub fn new(
        issue_id: impl Into<String>,
        executor_id: impl Into<String>,
        kind: EventKind,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            ts: Utc::now(),
            issue_id: issue_id.into(),
            executor_id: executor_id.into(),
            agent_id: String::new(),
            kind,
            severity,
            message: message.into(),
            data: EventData::None,
            source_line: None,
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn with_data(mut self, data: EventData) -> Self {
        self.data = data;
        self
    }

    pub fn with_source_line(mut self, line: u64) -> Self {
        self.source_line = Some(line);
        self
    }
}
