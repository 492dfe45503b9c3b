//! Structured-report handler: translate a validated [`AgentReport`] into
//! tracker mutations.

use anyhow::Result;
use tracing::info;

use foreman_core::labels;
use foreman_core::report::AgentReport;
use foreman_core::types::{DepKind, Dependency, Issue, IssueKind, IssueStatus, NewIssue};
use foreman_store::Store;

/// What the handler did, used by the results processor to decide whether
/// the pipeline continues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandledReport {
    /// Completed report: the pipeline should close the issue if gates agree.
    CloseIntent,
    /// Blocked: blocker children created, issue blocked; pipeline stops.
    Blocked,
    /// Decomposed: issue became an epic with children; pipeline stops.
    Decomposed,
    /// Partial: follow-ons created; pipeline continues to gates.
    Partial,
}

pub struct ReportHandler<'a> {
    store: &'a dyn Store,
    executor_id: &'a str,
}

impl<'a> ReportHandler<'a> {
    pub fn new(store: &'a dyn Store, executor_id: &'a str) -> Self {
        Self { store, executor_id }
    }

    pub async fn handle(&self, issue: &Issue, report: &AgentReport) -> Result<HandledReport> {
        report.validate()?;
        match report {
            AgentReport::Completed { .. } => Ok(HandledReport::CloseIntent),
            AgentReport::Blocked { summary, blockers } => {
                self.handle_blocked(issue, summary, blockers).await
            }
            AgentReport::Partial { remaining, completed, .. } => {
                self.handle_partial(issue, remaining, completed).await
            }
            AgentReport::Decomposed {
                reasoning,
                epic,
                children,
                ..
            } => self.handle_decomposed(issue, reasoning, epic, children).await,
        }
    }

    /// One child per blocker, priority inherited, with a `blocks` edge from
    /// the parent so the parent stays unclaimable until the blocker closes.
    async fn handle_blocked(
        &self,
        issue: &Issue,
        summary: &str,
        blockers: &[String],
    ) -> Result<HandledReport> {
        for blocker in blockers {
            let child = self
                .store
                .create_issue(NewIssue {
                    title: format!("Blocker: {blocker}"),
                    description: format!("Reported while executing {}: {blocker}", issue.id),
                    priority: Some(issue.priority),
                    labels: [labels::DISCOVERED_SUPERVISOR.to_string()].into(),
                    ..Default::default()
                })
                .await?;
            self.store
                .add_dependency(Dependency {
                    from: issue.id.clone(),
                    to: child.id.clone(),
                    kind: DepKind::Blocks,
                })
                .await?;
            info!(parent = %issue.id, child = %child.id, "created blocker issue");
        }
        self.store
            .set_issue_status(&issue.id, IssueStatus::Blocked)
            .await?;
        self.store
            .add_comment(
                &issue.id,
                self.executor_id,
                &format!("Agent reported blocked: {summary}"),
            )
            .await?;
        Ok(HandledReport::Blocked)
    }

    /// One follow-on per remaining item, connected by `discovered-from`.
    async fn handle_partial(
        &self,
        issue: &Issue,
        remaining: &[String],
        completed: &[String],
    ) -> Result<HandledReport> {
        for item in remaining {
            let child = self
                .store
                .create_issue(NewIssue {
                    title: item.clone(),
                    description: format!("Remaining work from {}", issue.id),
                    priority: Some(issue.priority),
                    ..Default::default()
                })
                .await?;
            self.store
                .add_dependency(Dependency {
                    from: child.id.clone(),
                    to: issue.id.clone(),
                    kind: DepKind::DiscoveredFrom,
                })
                .await?;
        }
        if !completed.is_empty() {
            self.store
                .add_comment(
                    &issue.id,
                    self.executor_id,
                    &format!("Agent completed: {}", completed.join(", ")),
                )
                .await?;
        }
        Ok(HandledReport::Partial)
    }

    /// Convert the issue into an epic in place and create its children.
    async fn handle_decomposed(
        &self,
        issue: &Issue,
        reasoning: &str,
        epic: &foreman_core::report::EpicSpec,
        children: &[foreman_core::report::ChildSpec],
    ) -> Result<HandledReport> {
        let mut converted = issue.clone();
        converted.title = epic.title.clone();
        converted.description = epic.description.clone();
        converted.kind = IssueKind::Epic;
        self.store.update_issue(&converted).await?;

        for spec in children {
            let child = self
                .store
                .create_issue(NewIssue {
                    title: spec.title.clone(),
                    description: spec.description.clone(),
                    kind: Some(spec.kind),
                    priority: Some(spec.priority),
                    ..Default::default()
                })
                .await?;
            self.store
                .add_dependency(Dependency {
                    from: child.id.clone(),
                    to: issue.id.clone(),
                    kind: DepKind::ParentChild,
                })
                .await?;
        }
        self.store
            .add_comment(
                &issue.id,
                self.executor_id,
                &format!("Decomposed into {} children: {reasoning}", children.len()),
            )
            .await?;
        Ok(HandledReport::Decomposed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::report::{ChildSpec, EpicSpec};
    use foreman_core::types::{IssueFilter, Priority};
    use foreman_store::MemoryStore;

    async fn parent(store: &MemoryStore, priority: Priority) -> Issue {
        store
            .create_issue(NewIssue {
                title: "parent".into(),
                priority: Some(priority),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_blocked_creates_blocker_children() {
        let store = MemoryStore::new();
        let issue = parent(&store, Priority::P0).await;
        let handler = ReportHandler::new(&store, "exec-a");

        let report = AgentReport::Blocked {
            summary: "needs api key".into(),
            blockers: vec!["Missing ANTHROPIC_KEY env".into()],
        };
        let handled = handler.handle(&issue, &report).await.unwrap();
        assert_eq!(handled, HandledReport::Blocked);

        let all = store.search_issues(IssueFilter::default()).await.unwrap();
        let blocker = all
            .iter()
            .find(|i| i.title == "Blocker: Missing ANTHROPIC_KEY env")
            .expect("blocker child created");
        assert_eq!(blocker.priority, Priority::P0, "priority inherited");
        assert!(blocker.labels.contains(labels::DISCOVERED_SUPERVISOR));

        let edges = store
            .dependencies_from(&issue.id, DepKind::Blocks)
            .await
            .unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].to, blocker.id);

        assert_eq!(
            store.get_issue(&issue.id).await.unwrap().status,
            IssueStatus::Blocked
        );
    }

    #[tokio::test]
    async fn test_partial_creates_discovered_from_followons() {
        let store = MemoryStore::new();
        let issue = parent(&store, Priority::P1).await;
        let handler = ReportHandler::new(&store, "exec-a");

        let report = AgentReport::Partial {
            summary: "half done".into(),
            remaining: vec!["wire the cli".into(), "add docs".into()],
            completed: vec!["core types".into()],
        };
        let handled = handler.handle(&issue, &report).await.unwrap();
        assert_eq!(handled, HandledReport::Partial);

        let edges = store
            .dependencies_to(&issue.id, DepKind::DiscoveredFrom)
            .await
            .unwrap();
        assert_eq!(edges.len(), 2);
        // Parent stays in whatever state the pipeline leaves it; the
        // handler itself does not block or close partial work.
        assert_ne!(
            store.get_issue(&issue.id).await.unwrap().status,
            IssueStatus::Blocked
        );
    }

    #[tokio::test]
    async fn test_decomposed_converts_issue_in_place() {
        let store = MemoryStore::new();
        let issue = parent(&store, Priority::P1).await;
        let handler = ReportHandler::new(&store, "exec-a");

        let report = AgentReport::Decomposed {
            summary: String::new(),
            reasoning: "too big".into(),
            epic: EpicSpec {
                title: "E".into(),
                description: "the epic".into(),
            },
            children: vec![
                ChildSpec {
                    title: "A".into(),
                    description: "a".into(),
                    kind: IssueKind::Task,
                    priority: Priority::P1,
                },
                ChildSpec {
                    title: "B".into(),
                    description: "b".into(),
                    kind: IssueKind::Bug,
                    priority: Priority::P2,
                },
            ],
        };
        let handled = handler.handle(&issue, &report).await.unwrap();
        assert_eq!(handled, HandledReport::Decomposed);

        let converted = store.get_issue(&issue.id).await.unwrap();
        assert_eq!(converted.kind, IssueKind::Epic);
        assert_eq!(converted.title, "E");
        assert_eq!(converted.description, "the epic");

        let children = store
            .dependencies_to(&issue.id, DepKind::ParentChild)
            .await
            .unwrap();
        assert_eq!(children.len(), 2);
        let b = store
            .search_issues(IssueFilter::default())
            .await
            .unwrap()
            .into_iter()
            .find(|i| i.title == "B")
            .unwrap();
        assert_eq!(b.kind, IssueKind::Bug);
        assert_eq!(b.priority, Priority::P2);
    }

    #[tokio::test]
    async fn test_completed_is_close_intent_without_mutation() {
        let store = MemoryStore::new();
        let issue = parent(&store, Priority::P2).await;
        let handler = ReportHandler::new(&store, "exec-a");

        let report = AgentReport::Completed { summary: "ok".into() };
        let handled = handler.handle(&issue, &report).await.unwrap();
        assert_eq!(handled, HandledReport::CloseIntent);
        // Closing is the pipeline's decision, not the handler's.
        assert_ne!(
            store.get_issue(&issue.id).await.unwrap().status,
            IssueStatus::Closed
        );
    }

    #[tokio::test]
    async fn test_invalid_report_rejected() {
        let store = MemoryStore::new();
        let issue = parent(&store, Priority::P2).await;
        let handler = ReportHandler::new(&store, "exec-a");
        let report = AgentReport::Blocked {
            summary: "s".into(),
            blockers: vec![],
        };
        assert!(handler.handle(&issue, &report).await.is_err());
    }
}
