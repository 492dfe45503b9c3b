//! In-memory reference store.
//!
//! Linearizability comes from one mutex around the whole state; every
//! operation is a single critical section. Suitable for tests and for
//! running the executor against a scratch tracker.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_core::error::AppError;
use foreman_core::event::{AgentEvent, EventKind, Severity};
use foreman_core::types::{
    AttemptRecord, DepKind, Dependency, ExecState, ExecutionRecord, ExecutorInstance,
    InstanceStatus, Issue, IssueFilter, IssueKind, IssueStatus, NewIssue, Priority, Sandbox,
};

use crate::Store;

use foreman_core::labels::NO_AUTO_CLAIM;

#[derive(Default)]
struct Inner {
    next_id: u64,
    issues: HashMap<String, Issue>,
    deps: Vec<Dependency>,
    executions: HashMap<String, ExecutionRecord>,
    history: HashMap<String, Vec<AttemptRecord>>,
    instances: HashMap<String, ExecutorInstance>,
    events: Vec<AgentEvent>,
    sandboxes: HashMap<String, Sandbox>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Poisoning only happens if a holder panicked; the data is still
        // consistent because every critical section is a whole operation.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Test helper: seed an issue with an explicit id.
    pub fn seed_issue(&self, issue: Issue) {
        self.lock().issues.insert(issue.id.clone(), issue);
    }
}

fn is_ready(inner: &Inner, issue: &Issue) -> bool {
    if issue.status != IssueStatus::Open || issue.labels.contains(NO_AUTO_CLAIM) {
        return false;
    }
    if inner.executions.contains_key(&issue.id) {
        return false;
    }
    // Every blocker the issue depends on must be closed.
    inner
        .deps
        .iter()
        .filter(|d| d.kind == DepKind::Blocks && d.from == issue.id)
        .all(|d| {
            inner
                .issues
                .get(&d.to)
                .is_none_or(|blocker| blocker.status == IssueStatus::Closed)
        })
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_issue(&self, new: NewIssue) -> Result<Issue> {
        let mut inner = self.lock();
        inner.next_id += 1;
        let now = Utc::now();
        let issue = Issue {
            id: format!("fm-{}", inner.next_id),
            title: new.title,
            description: new.description,
            acceptance_criteria: new.acceptance_criteria,
            status: IssueStatus::Open,
            priority: new.priority.unwrap_or(Priority::P2),
            kind: new.kind.unwrap_or(IssueKind::Task),
            subtype: new.subtype,
            labels: new.labels,
            created_at: now,
            updated_at: now,
        };
        inner.issues.insert(issue.id.clone(), issue.clone());
        Ok(issue)
    }

    async fn get_issue(&self, id: &str) -> Result<Issue> {
        self.lock()
            .issues
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::IssueNotFound(id.to_string()).into())
    }

    async fn update_issue(&self, issue: &Issue) -> Result<()> {
        let mut inner = self.lock();
        if !inner.issues.contains_key(&issue.id) {
            return Err(AppError::IssueNotFound(issue.id.clone()).into());
        }
        let mut updated = issue.clone();
        updated.updated_at = Utc::now();
        inner.issues.insert(issue.id.clone(), updated);
        Ok(())
    }

    async fn set_issue_status(&self, id: &str, status: IssueStatus) -> Result<()> {
        let mut inner = self.lock();
        let issue = inner
            .issues
            .get_mut(id)
            .ok_or_else(|| AppError::IssueNotFound(id.to_string()))?;
        issue.status = status;
        issue.updated_at = Utc::now();
        Ok(())
    }

    async fn add_label(&self, id: &str, label: &str) -> Result<()> {
        let mut inner = self.lock();
        let issue = inner
            .issues
            .get_mut(id)
            .ok_or_else(|| AppError::IssueNotFound(id.to_string()))?;
        issue.labels.insert(label.to_string());
        issue.updated_at = Utc::now();
        Ok(())
    }

    async fn search_issues(&self, filter: IssueFilter) -> Result<Vec<Issue>> {
        let inner = self.lock();
        let mut found: Vec<Issue> = inner
            .issues
            .values()
            .filter(|i| filter.kind.is_none_or(|k| i.kind == k))
            .filter(|i| filter.subtype.is_none_or(|s| i.subtype == s))
            .filter(|i| filter.status.is_none_or(|s| i.status == s))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn next_ready_issue(&self) -> Result<Option<Issue>> {
        let inner = self.lock();
        let mut ready: Vec<&Issue> = inner
            .issues
            .values()
            .filter(|i| is_ready(&inner, i))
            .collect();
        ready.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(ready.first().map(|i| (*i).clone()))
    }

    async fn add_dependency(&self, dep: Dependency) -> Result<()> {
        let mut inner = self.lock();
        if !inner.deps.contains(&dep) {
            inner.deps.push(dep);
        }
        Ok(())
    }

    async fn dependencies_from(&self, id: &str, kind: DepKind) -> Result<Vec<Dependency>> {
        Ok(self
            .lock()
            .deps
            .iter()
            .filter(|d| d.kind == kind && d.from == id)
            .cloned()
            .collect())
    }

    async fn dependencies_to(&self, id: &str, kind: DepKind) -> Result<Vec<Dependency>> {
        Ok(self
            .lock()
            .deps
            .iter()
            .filter(|d| d.kind == kind && d.to == id)
            .cloned()
            .collect())
    }

    async fn add_comment(&self, issue_id: &str, executor_id: &str, body: &str) -> Result<()> {
        let event = AgentEvent::new(issue_id, executor_id, EventKind::Comment, Severity::Info, body);
        self.lock().events.push(event);
        Ok(())
    }

    async fn comments_for(&self, issue_id: &str) -> Result<Vec<AgentEvent>> {
        Ok(self
            .lock()
            .events
            .iter()
            .filter(|e| e.kind == EventKind::Comment && e.issue_id == issue_id)
            .cloned()
            .collect())
    }

    async fn claim_execution(&self, issue_id: &str, executor_id: &str) -> Result<ExecutionRecord> {
        let mut inner = self.lock();
        if !inner.issues.contains_key(issue_id) {
            return Err(AppError::IssueNotFound(issue_id.to_string()).into());
        }
        if let Some(existing) = inner.executions.get(issue_id) {
            return Err(AppError::AlreadyClaimed {
                issue: issue_id.to_string(),
                holder: existing.executor_id.clone(),
            }
            .into());
        }
        let attempt = inner
            .history
            .get(issue_id)
            .and_then(|h| h.last())
            .map(|a| a.attempt + 1)
            .unwrap_or(1);
        let record = ExecutionRecord {
            issue_id: issue_id.to_string(),
            executor_id: executor_id.to_string(),
            state: ExecState::Claimed,
            last_heartbeat: Utc::now(),
            attempt,
        };
        inner.executions.insert(issue_id.to_string(), record.clone());
        if let Some(issue) = inner.issues.get_mut(issue_id) {
            issue.status = IssueStatus::InProgress;
            issue.updated_at = Utc::now();
        }
        Ok(record)
    }

    async fn get_execution(&self, issue_id: &str) -> Result<Option<ExecutionRecord>> {
        Ok(self.lock().executions.get(issue_id).cloned())
    }

    async fn update_execution_state(
        &self,
        issue_id: &str,
        executor_id: &str,
        state: ExecState,
    ) -> Result<()> {
        let mut inner = self.lock();
        let record = inner
            .executions
            .get_mut(issue_id)
            .ok_or_else(|| AppError::NotClaimed(issue_id.to_string()))?;
        if record.executor_id != executor_id {
            return Err(AppError::AlreadyClaimed {
                issue: issue_id.to_string(),
                holder: record.executor_id.clone(),
            }
            .into());
        }
        if !record.state.can_advance_to(state) {
            return Err(AppError::InvalidTransition {
                from: record.state,
                to: state,
            }
            .into());
        }
        record.state = state;
        record.last_heartbeat = Utc::now();
        Ok(())
    }

    async fn heartbeat_execution(&self, issue_id: &str, executor_id: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(record) = inner.executions.get_mut(issue_id) {
            if record.executor_id == executor_id {
                record.last_heartbeat = Utc::now();
            }
        }
        Ok(())
    }

    async fn release_execution(&self, issue_id: &str) -> Result<()> {
        // "Already gone" is the goal state, so a second release succeeds.
        self.lock().executions.remove(issue_id);
        Ok(())
    }

    async fn record_attempt(&self, issue_id: &str, success: bool) -> Result<()> {
        let mut inner = self.lock();
        let attempt = inner
            .executions
            .get(issue_id)
            .map(|r| r.attempt)
            .or_else(|| {
                inner
                    .history
                    .get(issue_id)
                    .and_then(|h| h.last())
                    .map(|a| a.attempt + 1)
            })
            .unwrap_or(1);
        inner
            .history
            .entry(issue_id.to_string())
            .or_default()
            .push(AttemptRecord {
                attempt,
                success,
                completed_at: Utc::now(),
            });
        Ok(())
    }

    async fn execution_history(&self, issue_id: &str) -> Result<Vec<AttemptRecord>> {
        Ok(self.lock().history.get(issue_id).cloned().unwrap_or_default())
    }

    async fn register_instance(&self, executor_id: &str) -> Result<()> {
        let mut inner = self.lock();
        let now = Utc::now();
        inner.instances.insert(
            executor_id.to_string(),
            ExecutorInstance {
                id: executor_id.to_string(),
                started_at: now,
                last_heartbeat: now,
                status: InstanceStatus::Running,
            },
        );
        Ok(())
    }

    async fn heartbeat_instance(&self, executor_id: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(instance) = inner.instances.get_mut(executor_id) {
            instance.last_heartbeat = Utc::now();
        }
        Ok(())
    }

    async fn cleanup_stale_instances(&self, threshold: Duration) -> Result<Vec<String>> {
        let mut inner = self.lock();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::zero());

        let stale_instances: BTreeSet<String> = inner
            .instances
            .values()
            .filter(|i| i.status == InstanceStatus::Running && i.last_heartbeat <= cutoff)
            .map(|i| i.id.clone())
            .collect();
        for id in &stale_instances {
            if let Some(instance) = inner.instances.get_mut(id) {
                instance.status = InstanceStatus::Stopped;
            }
        }

        // Release claims held by stale instances or with stale heartbeats.
        let released: Vec<String> = inner
            .executions
            .values()
            .filter(|r| stale_instances.contains(&r.executor_id) || r.last_heartbeat <= cutoff)
            .map(|r| r.issue_id.clone())
            .collect();
        for issue_id in &released {
            inner.executions.remove(issue_id);
            if let Some(issue) = inner.issues.get_mut(issue_id) {
                if issue.status == IssueStatus::InProgress {
                    issue.status = IssueStatus::Open;
                    issue.updated_at = Utc::now();
                }
            }
        }
        Ok(released)
    }

    async fn delete_old_stopped_instances(&self, max_age: Duration, keep: usize) -> Result<u64> {
        let mut inner = self.lock();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let mut stopped: Vec<(String, DateTime<Utc>)> = inner
            .instances
            .values()
            .filter(|i| i.status == InstanceStatus::Stopped)
            .map(|i| (i.id.clone(), i.last_heartbeat))
            .collect();
        // Keep the most recent `keep` regardless of age.
        stopped.sort_by(|a, b| b.1.cmp(&a.1));
        let mut deleted = 0u64;
        for (id, heartbeat) in stopped.into_iter().skip(keep) {
            if heartbeat <= cutoff {
                inner.instances.remove(&id);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn append_event(&self, event: AgentEvent) -> Result<()> {
        self.lock().events.push(event);
        Ok(())
    }

    async fn events_for_issue(&self, issue_id: &str, limit: usize) -> Result<Vec<AgentEvent>> {
        let inner = self.lock();
        let mut events: Vec<AgentEvent> = inner
            .events
            .iter()
            .filter(|e| e.issue_id == issue_id)
            .cloned()
            .collect();
        events.reverse();
        events.truncate(limit);
        Ok(events)
    }

    async fn count_events(&self) -> Result<u64> {
        Ok(self.lock().events.len() as u64)
    }

    async fn prune_events_by_age(
        &self,
        cutoff: DateTime<Utc>,
        critical_cutoff: DateTime<Utc>,
        batch: u64,
    ) -> Result<u64> {
        let mut inner = self.lock();
        let mut deleted = 0u64;
        inner.events.retain(|e| {
            if deleted >= batch {
                return true;
            }
            let event_cutoff = if e.severity == Severity::Error {
                critical_cutoff
            } else {
                cutoff
            };
            if e.ts <= event_cutoff {
                deleted += 1;
                false
            } else {
                true
            }
        });
        Ok(deleted)
    }

    async fn prune_events_per_issue(&self, cap: u64, batch: u64) -> Result<u64> {
        let mut inner = self.lock();
        let mut per_issue: HashMap<String, u64> = HashMap::new();
        for event in &inner.events {
            *per_issue.entry(event.issue_id.clone()).or_default() += 1;
        }
        let mut excess: HashMap<String, u64> = per_issue
            .into_iter()
            .filter(|(_, n)| *n > cap)
            .map(|(id, n)| (id, n - cap))
            .collect();
        let mut deleted = 0u64;
        // Events are stored oldest-first, so retain drops the oldest excess.
        inner.events.retain(|e| {
            if deleted >= batch {
                return true;
            }
            match excess.get_mut(&e.issue_id) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    deleted += 1;
                    false
                }
                _ => true,
            }
        });
        Ok(deleted)
    }

    async fn prune_events_global(&self, cap: u64, batch: u64) -> Result<u64> {
        let mut inner = self.lock();
        let total = inner.events.len() as u64;
        if total <= cap {
            return Ok(0);
        }
        let deleted = (total - cap).min(batch);
        inner.events.drain(..deleted as usize);
        Ok(deleted)
    }

    async fn vacuum(&self) -> Result<()> {
        self.lock().events.shrink_to_fit();
        Ok(())
    }

    async fn set_mission_sandbox(&self, mission_id: &str, sandbox: Option<Sandbox>) -> Result<()> {
        let mut inner = self.lock();
        if !inner.issues.contains_key(mission_id) {
            return Err(AppError::MissionNotFound(mission_id.to_string()).into());
        }
        match sandbox {
            Some(sandbox) => inner.sandboxes.insert(mission_id.to_string(), sandbox),
            None => inner.sandboxes.remove(mission_id),
        };
        Ok(())
    }

    async fn get_mission_sandbox(&self, mission_id: &str) -> Result<Option<Sandbox>> {
        Ok(self.lock().sandboxes.get(mission_id).cloned())
    }

    async fn list_sandboxes(&self) -> Result<Vec<(String, Sandbox)>> {
        let inner = self.lock();
        let mut pairs: Vec<(String, Sandbox)> = inner
            .sandboxes
            .iter()
            .map(|(id, sb)| (id.clone(), sb.clone()))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_issue(title: &str) -> NewIssue {
        NewIssue {
            title: title.into(),
            description: "desc".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = MemoryStore::new();
        let issue = store.create_issue(new_issue("a")).await.unwrap();
        store.claim_execution(&issue.id, "exec-a").await.unwrap();
        let err = store.claim_execution(&issue.id, "exec-b").await.unwrap_err();
        assert!(err.to_string().contains("already claimed"));
    }

    #[tokio::test]
    async fn test_claim_moves_issue_in_progress() {
        let store = MemoryStore::new();
        let issue = store.create_issue(new_issue("a")).await.unwrap();
        store.claim_execution(&issue.id, "exec-a").await.unwrap();
        let reread = store.get_issue(&issue.id).await.unwrap();
        assert_eq!(reread.status, IssueStatus::InProgress);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let store = MemoryStore::new();
        let issue = store.create_issue(new_issue("a")).await.unwrap();
        store.claim_execution(&issue.id, "exec-a").await.unwrap();
        store.release_execution(&issue.id).await.unwrap();
        // Second release: the record is gone, which is the goal.
        store.release_execution(&issue.id).await.unwrap();
        assert!(store.get_execution(&issue.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_state_transitions_are_forward_only() {
        let store = MemoryStore::new();
        let issue = store.create_issue(new_issue("a")).await.unwrap();
        store.claim_execution(&issue.id, "exec-a").await.unwrap();
        store
            .update_execution_state(&issue.id, "exec-a", ExecState::Assessing)
            .await
            .unwrap();
        store
            .update_execution_state(&issue.id, "exec-a", ExecState::Executing)
            .await
            .unwrap();
        let err = store
            .update_execution_state(&issue.id, "exec-a", ExecState::Claimed)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid execution transition"));
        // Skipping a state is also rejected.
        let err = store
            .update_execution_state(&issue.id, "exec-a", ExecState::Gates)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid execution transition"));
    }

    #[tokio::test]
    async fn test_next_ready_respects_blocks_and_priority() {
        let store = MemoryStore::new();
        let low = store
            .create_issue(NewIssue {
                priority: Some(Priority::P3),
                ..new_issue("low")
            })
            .await
            .unwrap();
        let high = store
            .create_issue(NewIssue {
                priority: Some(Priority::P0),
                ..new_issue("high")
            })
            .await
            .unwrap();
        let blocker = store.create_issue(new_issue("blocker")).await.unwrap();
        store
            .add_dependency(Dependency {
                from: high.id.clone(),
                to: blocker.id.clone(),
                kind: DepKind::Blocks,
            })
            .await
            .unwrap();

        // "high" is blocked by an open blocker, so "blocker" (P2) beats "low" (P3).
        let ready = store.next_ready_issue().await.unwrap().unwrap();
        assert_eq!(ready.id, blocker.id);

        store
            .set_issue_status(&blocker.id, IssueStatus::Closed)
            .await
            .unwrap();
        let ready = store.next_ready_issue().await.unwrap().unwrap();
        assert_eq!(ready.id, high.id);
        let _ = low;
    }

    #[tokio::test]
    async fn test_next_ready_skips_no_auto_claim() {
        let store = MemoryStore::new();
        let issue = store.create_issue(new_issue("manual")).await.unwrap();
        store.add_label(&issue.id, NO_AUTO_CLAIM).await.unwrap();
        assert!(store.next_ready_issue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_stale_releases_and_reopens() {
        let store = MemoryStore::new();
        let issue = store.create_issue(new_issue("a")).await.unwrap();
        store.register_instance("exec-a").await.unwrap();
        store.claim_execution(&issue.id, "exec-a").await.unwrap();

        // Zero threshold: everything is stale.
        let released = store.cleanup_stale_instances(Duration::ZERO).await.unwrap();
        assert_eq!(released, vec![issue.id.clone()]);
        assert!(store.get_execution(&issue.id).await.unwrap().is_none());
        assert_eq!(
            store.get_issue(&issue.id).await.unwrap().status,
            IssueStatus::Open
        );
    }

    #[tokio::test]
    async fn test_attempt_counter_increments_across_claims() {
        let store = MemoryStore::new();
        let issue = store.create_issue(new_issue("a")).await.unwrap();
        let record = store.claim_execution(&issue.id, "exec-a").await.unwrap();
        assert_eq!(record.attempt, 1);
        store.record_attempt(&issue.id, false).await.unwrap();
        store.release_execution(&issue.id).await.unwrap();
        store.set_issue_status(&issue.id, IssueStatus::Open).await.unwrap();
        let record = store.claim_execution(&issue.id, "exec-a").await.unwrap();
        assert_eq!(record.attempt, 2);
    }

    #[tokio::test]
    async fn test_prune_by_age_keeps_critical_longer() {
        let store = MemoryStore::new();
        let old = Utc::now() - chrono::Duration::days(40);
        let mut info = AgentEvent::new("fm-1", "e", EventKind::Progress, Severity::Info, "old info");
        info.ts = old;
        let mut error = AgentEvent::new("fm-1", "e", EventKind::Error, Severity::Error, "old error");
        error.ts = old;
        store.append_event(info).await.unwrap();
        store.append_event(error).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(30);
        let critical_cutoff = Utc::now() - chrono::Duration::days(90);
        let deleted = store
            .prune_events_by_age(cutoff, critical_cutoff, 100)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count_events().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_prune_per_issue_drops_oldest() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .append_event(AgentEvent::new(
                    "fm-1",
                    "e",
                    EventKind::Progress,
                    Severity::Info,
                    format!("event {i}"),
                ))
                .await
                .unwrap();
        }
        let deleted = store.prune_events_per_issue(3, 100).await.unwrap();
        assert_eq!(deleted, 2);
        let remaining = store.events_for_issue("fm-1", 10).await.unwrap();
        assert_eq!(remaining.len(), 3);
        // Newest first; oldest two ("event 0", "event 1") were dropped.
        assert_eq!(remaining.last().unwrap().message, "event 2");
    }

    #[tokio::test]
    async fn test_prune_global_respects_batch() {
        let store = MemoryStore::new();
        for i in 0..10 {
            store
                .append_event(AgentEvent::new(
                    format!("fm-{i}"),
                    "e",
                    EventKind::Progress,
                    Severity::Info,
                    "x",
                ))
                .await
                .unwrap();
        }
        assert_eq!(store.prune_events_global(4, 3).await.unwrap(), 3);
        assert_eq!(store.count_events().await.unwrap(), 7);
        assert_eq!(store.prune_events_global(4, 100).await.unwrap(), 3);
        assert_eq!(store.count_events().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_delete_old_stopped_keeps_most_recent() {
        let store = MemoryStore::new();
        for i in 0..4 {
            let id = format!("exec-{i}");
            store.register_instance(&id).await.unwrap();
        }
        store.cleanup_stale_instances(Duration::ZERO).await.unwrap();
        // All four stopped; keep 2 most recent, age limit zero.
        let deleted = store
            .delete_old_stopped_instances(Duration::ZERO, 2)
            .await
            .unwrap();
        assert_eq!(deleted, 2);
    }
}
