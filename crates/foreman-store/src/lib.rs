//! Tracker store contract.
//!
//! The executor treats the store as linearizable: claim/release are atomic,
//! events are append-only, and state transitions for one issue are only
//! ever written by the claiming executor. [`MemoryStore`] is the reference
//! implementation used for wiring and tests; a production deployment backs
//! this trait with the real tracker.

pub mod memory;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_core::event::AgentEvent;
use foreman_core::types::{
    AttemptRecord, DepKind, Dependency, ExecState, ExecutionRecord, Issue, IssueFilter,
    IssueStatus, NewIssue, Sandbox,
};

pub use memory::MemoryStore;

#[async_trait]
pub trait Store: Send + Sync {
    // ── Issues ────────────────────────────────────────────────────────

    async fn create_issue(&self, new: NewIssue) -> Result<Issue>;
    async fn get_issue(&self, id: &str) -> Result<Issue>;
    /// Full-row rewrite; used by decomposition to convert an issue in place.
    async fn update_issue(&self, issue: &Issue) -> Result<()>;
    async fn set_issue_status(&self, id: &str, status: IssueStatus) -> Result<()>;
    async fn add_label(&self, id: &str, label: &str) -> Result<()>;
    async fn search_issues(&self, filter: IssueFilter) -> Result<Vec<Issue>>;
    /// Highest-priority open issue with no live claim, no open blockers,
    /// and no `no-auto-claim` label.
    async fn next_ready_issue(&self) -> Result<Option<Issue>>;

    // ── Dependencies ──────────────────────────────────────────────────

    async fn add_dependency(&self, dep: Dependency) -> Result<()>;
    /// Edges of `kind` leaving `id` (id depends on / descends from the targets).
    async fn dependencies_from(&self, id: &str, kind: DepKind) -> Result<Vec<Dependency>>;
    /// Edges of `kind` arriving at `id` (the dependents of id).
    async fn dependencies_to(&self, id: &str, kind: DepKind) -> Result<Vec<Dependency>>;

    // ── Comments (audit stream) ───────────────────────────────────────

    async fn add_comment(&self, issue_id: &str, executor_id: &str, body: &str) -> Result<()>;
    async fn comments_for(&self, issue_id: &str) -> Result<Vec<AgentEvent>>;

    // ── Execution claims ──────────────────────────────────────────────

    async fn claim_execution(&self, issue_id: &str, executor_id: &str) -> Result<ExecutionRecord>;
    async fn get_execution(&self, issue_id: &str) -> Result<Option<ExecutionRecord>>;
    async fn update_execution_state(
        &self,
        issue_id: &str,
        executor_id: &str,
        state: ExecState,
    ) -> Result<()>;
    async fn heartbeat_execution(&self, issue_id: &str, executor_id: &str) -> Result<()>;
    /// Idempotent: releasing an already-released claim succeeds silently.
    async fn release_execution(&self, issue_id: &str) -> Result<()>;
    async fn record_attempt(&self, issue_id: &str, success: bool) -> Result<()>;
    /// Attempt history, oldest first.
    async fn execution_history(&self, issue_id: &str) -> Result<Vec<AttemptRecord>>;

    // ── Executor instances ────────────────────────────────────────────

    async fn register_instance(&self, executor_id: &str) -> Result<()>;
    async fn heartbeat_instance(&self, executor_id: &str) -> Result<()>;
    /// Mark instances silent for longer than `threshold` as stopped and
    /// release their claims atomically. Returns released issue ids.
    async fn cleanup_stale_instances(&self, threshold: Duration) -> Result<Vec<String>>;
    async fn delete_old_stopped_instances(&self, max_age: Duration, keep: usize) -> Result<u64>;

    // ── Events ────────────────────────────────────────────────────────

    async fn append_event(&self, event: AgentEvent) -> Result<()>;
    /// Most recent events for an issue, newest first, capped at `limit`.
    async fn events_for_issue(&self, issue_id: &str, limit: usize) -> Result<Vec<AgentEvent>>;
    async fn count_events(&self) -> Result<u64>;
    /// Delete events older than `cutoff`; error-severity events use the
    /// (older) `critical_cutoff` instead. Cutoffs are inclusive. At most
    /// `batch` rows are removed per call.
    async fn prune_events_by_age(
        &self,
        cutoff: DateTime<Utc>,
        critical_cutoff: DateTime<Utc>,
        batch: u64,
    ) -> Result<u64>;
    /// Trim each issue's events to `cap`, oldest first, at most `batch` rows.
    async fn prune_events_per_issue(&self, cap: u64, batch: u64) -> Result<u64>;
    /// Trim the global event count to `cap`, oldest first, at most `batch` rows.
    async fn prune_events_global(&self, cap: u64, batch: u64) -> Result<u64>;
    async fn vacuum(&self) -> Result<()>;

    // ── Missions & sandboxes ──────────────────────────────────────────

    async fn set_mission_sandbox(&self, mission_id: &str, sandbox: Option<Sandbox>) -> Result<()>;
    async fn get_mission_sandbox(&self, mission_id: &str) -> Result<Option<Sandbox>>;
    /// All `(mission_id, sandbox)` pairs currently recorded.
    async fn list_sandboxes(&self) -> Result<Vec<(String, Sandbox)>>;
}
