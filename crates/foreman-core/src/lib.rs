//! Core data model shared by every foreman crate: issues, dependency
//! edges, missions, sandboxes, execution state, agent events, agent
//! reports, and executor configuration.

pub mod config;
pub mod env;
pub mod error;
pub mod event;
pub mod labels;
pub mod report;
pub mod types;

pub use config::{ExecutorConfig, GateCommandConfig, RetentionConfig};
pub use error::AppError;
pub use event::{AgentEvent, CleanupMetrics, EventData, EventKind, GateProgress, Severity, ToolUseData};
pub use report::{AgentReport, ChildSpec, EpicSpec, extract_report};
pub use types::{
    ApprovalStatus, AttemptRecord, DepKind, Dependency, ExecState, ExecutionRecord,
    ExecutorInstance, InstanceStatus, Issue, IssueFilter, IssueKind, IssueStatus, IssueSubtype,
    NewIssue, Priority, Sandbox, SandboxStatus,
};
