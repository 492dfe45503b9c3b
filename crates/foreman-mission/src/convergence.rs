//! Discovery-graph walks and epic convergence.
//!
//! The store should never hand back a cyclic discovered-from graph, but
//! manual edits occasionally reintroduce cycles, so every walk carries a
//! visited set and fails instead of looping.

use std::collections::{HashSet, VecDeque};

use anyhow::Result;

use foreman_core::error::AppError;
use foreman_core::types::{DepKind, IssueKind, IssueStatus};
use foreman_store::Store;

/// Discovery sets larger than this surface the mission for human attention.
pub const EXPLOSION_THRESHOLD: usize = 20;

/// Walk `discovered-from` edges upward until an issue with no origin is
/// found. Cycles produce an error, never a hang.
pub async fn mission_root(store: &dyn Store, issue_id: &str) -> Result<String> {
    let mut current = issue_id.to_string();
    let mut visited = HashSet::new();
    loop {
        if !visited.insert(current.clone()) {
            return Err(AppError::DiscoveryCycle(current).into());
        }
        let edges = store.dependencies_from(&current, DepKind::DiscoveredFrom).await?;
        match edges.first() {
            Some(edge) => current = edge.to.clone(),
            None => return Ok(current),
        }
    }
}

/// Transitive closure of issues discovered from `mission_id`, breadth
/// first. The visited set guards against cycles.
pub async fn mission_discoveries(store: &dyn Store, mission_id: &str) -> Result<Vec<String>> {
    let mut queue = VecDeque::from([mission_id.to_string()]);
    let mut visited: HashSet<String> = HashSet::from([mission_id.to_string()]);
    let mut discoveries = Vec::new();
    while let Some(id) = queue.pop_front() {
        for edge in store.dependencies_to(&id, DepKind::DiscoveredFrom).await? {
            if visited.insert(edge.from.clone()) {
                discoveries.push(edge.from.clone());
                queue.push_back(edge.from);
            }
        }
    }
    Ok(discoveries)
}

/// A mission has converged iff its discovery set is non-empty and every
/// member is closed.
pub async fn has_mission_converged(store: &dyn Store, mission_id: &str) -> Result<bool> {
    let discoveries = mission_discoveries(store, mission_id).await?;
    if discoveries.is_empty() {
        return Ok(false);
    }
    for id in &discoveries {
        if store.get_issue(id).await?.status != IssueStatus::Closed {
            return Ok(false);
        }
    }
    Ok(true)
}

pub async fn check_mission_explosion(store: &dyn Store, mission_id: &str) -> Result<bool> {
    Ok(mission_discoveries(store, mission_id).await?.len() > EXPLOSION_THRESHOLD)
}

/// Close epics whose children have all closed, triggered by `closed_id`
/// closing. Safe to re-run; already-closed epics are skipped. Returns the
/// ids of epics closed by this call.
pub async fn auto_close_epics(store: &dyn Store, closed_id: &str) -> Result<Vec<String>> {
    let mut closed = Vec::new();
    for edge in store.dependencies_to(closed_id, DepKind::Blocks).await? {
        let dependent = store.get_issue(&edge.from).await?;
        if dependent.kind != IssueKind::Epic || dependent.status == IssueStatus::Closed {
            continue;
        }
        let children = store.dependencies_to(&dependent.id, DepKind::ParentChild).await?;
        if children.is_empty() {
            continue;
        }
        let mut all_closed = true;
        for child in &children {
            if store.get_issue(&child.from).await?.status != IssueStatus::Closed {
                all_closed = false;
                break;
            }
        }
        if all_closed {
            store.set_issue_status(&dependent.id, IssueStatus::Closed).await?;
            closed.push(dependent.id);
        }
    }
    Ok(closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::types::{Dependency, NewIssue};
    use foreman_store::MemoryStore;

    async fn issue(store: &MemoryStore, title: &str) -> String {
        store
            .create_issue(NewIssue {
                title: title.into(),
                ..Default::default()
            })
            .await
            .unwrap()
            .id
    }

    async fn discovered_from(store: &MemoryStore, discovery: &str, origin: &str) {
        store
            .add_dependency(Dependency {
                from: discovery.into(),
                to: origin.into(),
                kind: DepKind::DiscoveredFrom,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mission_root_walks_upward() {
        let store = MemoryStore::new();
        let mission = issue(&store, "mission").await;
        let d1 = issue(&store, "d1").await;
        let d2 = issue(&store, "d2").await;
        discovered_from(&store, &d1, &mission).await;
        discovered_from(&store, &d2, &d1).await;

        assert_eq!(mission_root(&store, &d2).await.unwrap(), mission);
        assert_eq!(mission_root(&store, &mission).await.unwrap(), mission);
    }

    #[tokio::test]
    async fn test_mission_root_detects_cycle() {
        let store = MemoryStore::new();
        let a = issue(&store, "a").await;
        let b = issue(&store, "b").await;
        discovered_from(&store, &a, &b).await;
        discovered_from(&store, &b, &a).await;

        let err = mission_root(&store, &a).await.unwrap_err();
        assert!(err.to_string().contains("cycle"), "got: {err}");
    }

    #[tokio::test]
    async fn test_discoveries_closure_guards_cycles() {
        let store = MemoryStore::new();
        let mission = issue(&store, "m").await;
        let d1 = issue(&store, "d1").await;
        let d2 = issue(&store, "d2").await;
        discovered_from(&store, &d1, &mission).await;
        discovered_from(&store, &d2, &d1).await;
        // Manual edit reintroduced a back edge.
        discovered_from(&store, &mission, &d2).await;

        let discoveries = mission_discoveries(&store, &mission).await.unwrap();
        assert_eq!(discoveries.len(), 2);
    }

    #[tokio::test]
    async fn test_convergence_requires_all_closed_and_nonempty() {
        let store = MemoryStore::new();
        let mission = issue(&store, "m").await;
        assert!(!has_mission_converged(&store, &mission).await.unwrap());

        let mut descendants = Vec::new();
        for name in ["d1", "d2", "d3"] {
            let id = issue(&store, name).await;
            discovered_from(&store, &id, &mission).await;
            descendants.push(id);
        }
        store
            .set_issue_status(&descendants[0], IssueStatus::Closed)
            .await
            .unwrap();
        store
            .set_issue_status(&descendants[1], IssueStatus::Closed)
            .await
            .unwrap();
        assert!(!has_mission_converged(&store, &mission).await.unwrap());

        store
            .set_issue_status(&descendants[2], IssueStatus::Closed)
            .await
            .unwrap();
        assert!(has_mission_converged(&store, &mission).await.unwrap());
    }

    #[tokio::test]
    async fn test_explosion_threshold_boundary() {
        let store = MemoryStore::new();
        let mission = issue(&store, "m").await;
        for i in 0..EXPLOSION_THRESHOLD {
            let id = issue(&store, &format!("d{i}")).await;
            discovered_from(&store, &id, &mission).await;
        }
        assert!(!check_mission_explosion(&store, &mission).await.unwrap());

        let extra = issue(&store, "one-more").await;
        discovered_from(&store, &extra, &mission).await;
        assert!(check_mission_explosion(&store, &mission).await.unwrap());
    }

    #[tokio::test]
    async fn test_epic_auto_close_is_idempotent() {
        let store = MemoryStore::new();
        let epic = store
            .create_issue(NewIssue {
                title: "epic".into(),
                kind: Some(IssueKind::Epic),
                ..Default::default()
            })
            .await
            .unwrap();
        let child_a = issue(&store, "a").await;
        let child_b = issue(&store, "b").await;
        for child in [&child_a, &child_b] {
            store
                .add_dependency(Dependency {
                    from: child.clone(),
                    to: epic.id.clone(),
                    kind: DepKind::ParentChild,
                })
                .await
                .unwrap();
            store
                .add_dependency(Dependency {
                    from: epic.id.clone(),
                    to: child.clone(),
                    kind: DepKind::Blocks,
                })
                .await
                .unwrap();
        }

        store.set_issue_status(&child_a, IssueStatus::Closed).await.unwrap();
        assert!(auto_close_epics(&store, &child_a).await.unwrap().is_empty());

        store.set_issue_status(&child_b, IssueStatus::Closed).await.unwrap();
        let closed = auto_close_epics(&store, &child_b).await.unwrap();
        assert_eq!(closed, vec![epic.id.clone()]);
        assert_eq!(
            store.get_issue(&epic.id).await.unwrap().status,
            IssueStatus::Closed
        );

        // Re-running finds the epic already closed and does nothing.
        assert!(auto_close_epics(&store, &child_b).await.unwrap().is_empty());
    }
}
