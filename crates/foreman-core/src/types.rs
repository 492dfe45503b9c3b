//! Issue, dependency, mission, sandbox, and execution-state types.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Issue lifecycle status in the tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    InProgress,
    Blocked,
    Closed,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Issue priority, P0 highest through P3 lowest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

impl Priority {
    /// Numeric rank: 0 (highest) through 3.
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::P0 => 0,
            Self::P1 => 1,
            Self::P2 => 2,
            Self::P3 => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P0 => "P0",
            Self::P1 => "P1",
            Self::P2 => "P2",
            Self::P3 => "P3",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "P0" | "0" => Ok(Self::P0),
            "P1" | "1" => Ok(Self::P1),
            "P2" | "2" => Ok(Self::P2),
            "P3" | "3" => Ok(Self::P3),
            other => Err(format!("invalid priority '{other}': expected P0..P3")),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Work item category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueKind {
    Task,
    Bug,
    Feature,
    Chore,
    Epic,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Bug => "bug",
            Self::Feature => "feature",
            Self::Chore => "chore",
            Self::Epic => "epic",
        }
    }
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Epic subtype. Missions are epics carrying a long-lived sandbox.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSubtype {
    #[default]
    None,
    Mission,
}

/// A unit of work in the tracker. Created elsewhere; the executor only
/// mutates status, labels, and (for decomposition) title/description/kind.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: String,
    pub status: IssueStatus,
    pub priority: Priority,
    pub kind: IssueKind,
    #[serde(default)]
    pub subtype: IssueSubtype,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Issue {
    pub fn is_mission(&self) -> bool {
        self.kind == IssueKind::Epic && self.subtype == IssueSubtype::Mission
    }
}

/// Fields for creating a new issue through the store.
#[derive(Clone, Debug, Default)]
pub struct NewIssue {
    pub title: String,
    pub description: String,
    pub acceptance_criteria: String,
    pub kind: Option<IssueKind>,
    pub subtype: IssueSubtype,
    pub priority: Option<Priority>,
    pub labels: BTreeSet<String>,
}

/// Directed, labeled edge between two issues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DepKind {
    Blocks,
    ParentChild,
    DiscoveredFrom,
}

impl DepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::ParentChild => "parent-child",
            Self::DiscoveredFrom => "discovered-from",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub from: String,
    pub to: String,
    pub kind: DepKind,
}

/// Search filter for `Store::search_issues`.
#[derive(Clone, Copy, Debug, Default)]
pub struct IssueFilter {
    pub kind: Option<IssueKind>,
    pub subtype: Option<IssueSubtype>,
    pub status: Option<IssueStatus>,
}

/// Sandbox lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Active,
    Completed,
    Failed,
}

/// Human-approval status of a sandbox's pending changes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    #[default]
    None,
    Approved,
    Rejected,
}

/// Isolated working directory backed by a dedicated git branch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
    pub status: SandboxStatus,
    #[serde(default)]
    pub approval: ApprovalStatus,
    pub created_at: DateTime<Utc>,
}

/// Per-issue execution lifecycle state. Transitions are strictly forward;
/// every state is traversed even when its work is skipped, so the audit
/// trail stays coherent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecState {
    Claimed,
    Assessing,
    Executing,
    Analyzing,
    Gates,
    Committing,
    Completed,
}

impl ExecState {
    pub fn rank(&self) -> u8 {
        match self {
            Self::Claimed => 0,
            Self::Assessing => 1,
            Self::Executing => 2,
            Self::Analyzing => 3,
            Self::Gates => 4,
            Self::Committing => 5,
            Self::Completed => 6,
        }
    }

    /// Whether `next` is the single allowed successor of `self`.
    pub fn can_advance_to(&self, next: ExecState) -> bool {
        next.rank() == self.rank() + 1
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claimed => "claimed",
            Self::Assessing => "assessing",
            Self::Executing => "executing",
            Self::Analyzing => "analyzing",
            Self::Gates => "gates",
            Self::Committing => "committing",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for ExecState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The live claim record for one issue. At most one non-terminal record
/// exists per issue; release removes it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub issue_id: String,
    pub executor_id: String,
    pub state: ExecState,
    pub last_heartbeat: DateTime<Utc>,
    pub attempt: u32,
}

/// One completed execution attempt, kept as history after release.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub success: bool,
    pub completed_at: DateTime<Utc>,
}

/// Executor process liveness status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Running,
    Stopped,
}

/// A registered executor process, used by stale-claim cleanup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutorInstance {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: InstanceStatus,
}
