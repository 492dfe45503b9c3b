//! Startup sandbox rebase.
//!
//! Long-lived mission sandboxes drift behind their base branch between
//! executor runs. At startup each active sandbox is fetched and rebased;
//! conflicts become a P0 conflict-resolution task blocking the mission,
//! other failures are logged and skipped.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use foreman_core::event::{AgentEvent, EventKind, Severity};
use foreman_core::labels;
use foreman_core::types::{DepKind, Dependency, NewIssue, Priority, SandboxStatus};
use foreman_git::{GitOps, RebaseOutcome};
use foreman_store::Store;

/// Rebase every active mission sandbox onto its base branch. Returns true
/// when at least one sandbox actually rebased, so the caller can decide to
/// re-run its preflight checks.
pub async fn rebase_active_sandboxes(
    store: &Arc<dyn Store>,
    git: &Arc<dyn GitOps>,
    executor_id: &str,
) -> Result<bool> {
    let mut any_rebased = false;

    for (mission_id, sandbox) in store.list_sandboxes().await? {
        if sandbox.status != SandboxStatus::Active {
            continue;
        }
        if !sandbox.path.exists() {
            warn!(
                mission = %mission_id,
                path = %sandbox.path.display(),
                "skipping rebase: sandbox path missing"
            );
            continue;
        }

        if let Err(e) = git.fetch(&sandbox.path, &sandbox.base_branch).await {
            emit(
                store,
                &mission_id,
                executor_id,
                Severity::Error,
                format!("fetch before rebase failed: {e:#}"),
            )
            .await;
            continue;
        }

        match git.rebase_onto_base(&sandbox.path, &sandbox.base_branch).await {
            Ok(RebaseOutcome::Success) => {
                info!(mission = %mission_id, branch = %sandbox.branch, "sandbox rebased");
                emit(
                    store,
                    &mission_id,
                    executor_id,
                    Severity::Info,
                    format!("rebased {} onto origin/{}", sandbox.branch, sandbox.base_branch),
                )
                .await;
                any_rebased = true;
            }
            Ok(RebaseOutcome::Conflict { output }) => {
                git.rebase_abort(&sandbox.path).await;
                let task = store
                    .create_issue(NewIssue {
                        title: format!(
                            "Resolve rebase conflict: {} onto {}",
                            sandbox.branch, sandbox.base_branch
                        ),
                        description: format!(
                            "Rebasing sandbox {} hit conflicts and was aborted.\n\n{output}",
                            sandbox.id
                        ),
                        priority: Some(Priority::P0),
                        labels: [
                            labels::REBASE_CONFLICT.to_string(),
                            labels::NO_AUTO_CLAIM.to_string(),
                        ]
                        .into(),
                        ..Default::default()
                    })
                    .await?;
                store
                    .add_dependency(Dependency {
                        from: mission_id.clone(),
                        to: task.id.clone(),
                        kind: DepKind::Blocks,
                    })
                    .await?;
                emit(
                    store,
                    &mission_id,
                    executor_id,
                    Severity::Warning,
                    format!("rebase conflict; filed {} for manual resolution", task.id),
                )
                .await;
            }
            Ok(RebaseOutcome::Error { output }) => {
                emit(
                    store,
                    &mission_id,
                    executor_id,
                    Severity::Error,
                    format!("rebase failed: {}", first_line(&output)),
                )
                .await;
            }
            Err(e) => {
                emit(
                    store,
                    &mission_id,
                    executor_id,
                    Severity::Error,
                    format!("rebase failed: {e:#}"),
                )
                .await;
            }
        }
    }

    Ok(any_rebased)
}

async fn emit(
    store: &Arc<dyn Store>,
    mission_id: &str,
    executor_id: &str,
    severity: Severity,
    message: String,
) {
    let event = AgentEvent::new(mission_id, executor_id, EventKind::SandboxRebase, severity, message);
    if let Err(e) = store.append_event(event).await {
        warn!("failed to record sandbox_rebase event: {e:#}");
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use foreman_core::types::{ApprovalStatus, IssueFilter, Sandbox};
    use foreman_git::CommitOptions;
    use foreman_store::MemoryStore;

    /// Scripted git double: maps sandbox path -> rebase outcome.
    #[derive(Default)]
    struct ScriptedGit {
        outcomes: Mutex<HashMap<std::path::PathBuf, RebaseOutcome>>,
        aborts: Mutex<Vec<std::path::PathBuf>>,
        fail_fetch: bool,
    }

    #[async_trait]
    impl GitOps for ScriptedGit {
        async fn has_uncommitted_changes(&self, _dir: &Path) -> Result<bool> {
            Ok(false)
        }
        async fn status(&self, _dir: &Path) -> Result<String> {
            Ok(String::new())
        }
        async fn diff(&self, _dir: &Path) -> Result<String> {
            Ok(String::new())
        }
        async fn commit_changes(&self, _dir: &Path, _opts: &CommitOptions) -> Result<String> {
            Ok("abc1234".into())
        }
        async fn cleanup_orphaned_branches(
            &self,
            _dir: &Path,
            _retention_days: u32,
            _dry_run: bool,
        ) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn fetch(&self, _dir: &Path, _base: &str) -> Result<()> {
            if self.fail_fetch {
                anyhow::bail!("network down");
            }
            Ok(())
        }
        async fn rebase_onto_base(&self, dir: &Path, _base: &str) -> Result<RebaseOutcome> {
            Ok(self
                .outcomes
                .lock()
                .unwrap()
                .get(dir)
                .cloned()
                .unwrap_or(RebaseOutcome::Success))
        }
        async fn rebase_abort(&self, dir: &Path) {
            self.aborts.lock().unwrap().push(dir.to_path_buf());
        }
    }

    async fn seed_mission_with_sandbox(
        store: &MemoryStore,
        root: &Path,
        name: &str,
    ) -> (String, std::path::PathBuf) {
        let mission = store
            .create_issue(NewIssue {
                title: name.into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let path = root.join(name);
        std::fs::create_dir_all(&path).unwrap();
        store
            .set_mission_sandbox(
                &mission.id,
                Some(Sandbox {
                    id: format!("sbx-{name}"),
                    path: path.clone(),
                    branch: format!("sandbox/{}", mission.id),
                    base_branch: "main".into(),
                    status: SandboxStatus::Active,
                    approval: ApprovalStatus::None,
                    created_at: Utc::now(),
                }),
            )
            .await
            .unwrap();
        (mission.id, path)
    }

    #[tokio::test]
    async fn test_successful_rebase_reports_any_rebased() {
        let tmp = tempfile::tempdir().unwrap();
        let concrete = Arc::new(MemoryStore::new());
        let (mission_id, _path) = seed_mission_with_sandbox(&concrete, tmp.path(), "m1").await;
        let store: Arc<dyn Store> = concrete.clone();
        let git: Arc<dyn GitOps> = Arc::new(ScriptedGit::default());

        let any = rebase_active_sandboxes(&store, &git, "exec-a").await.unwrap();
        assert!(any);
        let events = concrete.events_for_issue(&mission_id, 10).await.unwrap();
        assert!(events.iter().any(|e| e.kind == EventKind::SandboxRebase
            && e.severity == Severity::Info));
    }

    #[tokio::test]
    async fn test_conflict_files_p0_task_and_aborts() {
        let tmp = tempfile::tempdir().unwrap();
        let concrete = Arc::new(MemoryStore::new());
        let (mission_id, path) = seed_mission_with_sandbox(&concrete, tmp.path(), "m1").await;

        let git_impl = ScriptedGit::default();
        git_impl.outcomes.lock().unwrap().insert(
            path.clone(),
            RebaseOutcome::Conflict {
                output: "CONFLICT (content): Merge conflict in src/lib.rs".into(),
            },
        );
        let store: Arc<dyn Store> = concrete.clone();
        let git: Arc<dyn GitOps> = Arc::new(git_impl);

        let any = rebase_active_sandboxes(&store, &git, "exec-a").await.unwrap();
        assert!(!any);

        let all = concrete.search_issues(IssueFilter::default()).await.unwrap();
        let task = all
            .iter()
            .find(|i| i.labels.contains(labels::REBASE_CONFLICT))
            .expect("conflict task filed");
        assert_eq!(task.priority, Priority::P0);
        assert!(task.labels.contains(labels::NO_AUTO_CLAIM));

        let edges = concrete
            .dependencies_from(&mission_id, DepKind::Blocks)
            .await
            .unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].to, task.id);

        let events = concrete.events_for_issue(&mission_id, 10).await.unwrap();
        assert!(events.iter().any(|e| e.kind == EventKind::SandboxRebase
            && e.severity == Severity::Warning));
    }

    #[tokio::test]
    async fn test_other_error_emits_error_event_and_skips() {
        let tmp = tempfile::tempdir().unwrap();
        let concrete = Arc::new(MemoryStore::new());
        let (mission_id, path) = seed_mission_with_sandbox(&concrete, tmp.path(), "m1").await;

        let git_impl = ScriptedGit::default();
        git_impl.outcomes.lock().unwrap().insert(
            path,
            RebaseOutcome::Error {
                output: "fatal: not a git repository".into(),
            },
        );
        let store: Arc<dyn Store> = concrete.clone();
        let git: Arc<dyn GitOps> = Arc::new(git_impl);

        rebase_active_sandboxes(&store, &git, "exec-a").await.unwrap();

        let all = concrete.search_issues(IssueFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1, "no conflict task filed");
        let events = concrete.events_for_issue(&mission_id, 10).await.unwrap();
        assert!(events.iter().any(|e| e.kind == EventKind::SandboxRebase
            && e.severity == Severity::Error));
    }

    #[tokio::test]
    async fn test_missing_path_and_inactive_sandboxes_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let concrete = Arc::new(MemoryStore::new());
        let (_mission_id, path) = seed_mission_with_sandbox(&concrete, tmp.path(), "m1").await;
        std::fs::remove_dir_all(&path).unwrap();

        let store: Arc<dyn Store> = concrete.clone();
        let git: Arc<dyn GitOps> = Arc::new(ScriptedGit::default());
        let any = rebase_active_sandboxes(&store, &git, "exec-a").await.unwrap();
        assert!(!any);
    }
}
