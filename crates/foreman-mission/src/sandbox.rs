//! Sandbox lifecycle: creation, status flips, and failed-sandbox retention.
//!
//! The filesystem mechanics (worktree checkout) live outside this crate;
//! this is the record-keeping half of the contract plus directory
//! housekeeping.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use foreman_core::types::{ApprovalStatus, Sandbox, SandboxStatus};
use foreman_store::Store;

pub struct SandboxManager {
    store: Arc<dyn Store>,
}

impl SandboxManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Create a sandbox record (and its directory) for a mission.
    pub async fn create(
        &self,
        mission_id: &str,
        sandboxes_root: &Path,
        base_branch: &str,
    ) -> Result<Sandbox> {
        let id = format!("sbx-{}", ulid::Ulid::new().to_string().to_lowercase());
        let path = sandboxes_root.join(&id);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create sandbox dir: {}", path.display()))?;
        let sandbox = Sandbox {
            id: id.clone(),
            path,
            branch: format!("sandbox/{mission_id}"),
            base_branch: base_branch.to_string(),
            status: SandboxStatus::Active,
            approval: ApprovalStatus::None,
            created_at: Utc::now(),
        };
        self.store
            .set_mission_sandbox(mission_id, Some(sandbox.clone()))
            .await?;
        info!(mission = mission_id, sandbox = %id, "created sandbox");
        Ok(sandbox)
    }

    pub async fn set_status(&self, mission_id: &str, status: SandboxStatus) -> Result<()> {
        let Some(mut sandbox) = self.store.get_mission_sandbox(mission_id).await? else {
            return Ok(());
        };
        sandbox.status = status;
        self.store.set_mission_sandbox(mission_id, Some(sandbox)).await
    }

    pub async fn set_approval(&self, mission_id: &str, approval: ApprovalStatus) -> Result<()> {
        let Some(mut sandbox) = self.store.get_mission_sandbox(mission_id).await? else {
            return Ok(());
        };
        sandbox.approval = approval;
        self.store.set_mission_sandbox(mission_id, Some(sandbox)).await
    }

    /// Drop failed sandboxes beyond the `keep` most recent. Directory
    /// removal is best effort; the record always goes.
    pub async fn cleanup_failed(&self, keep: usize) -> Result<u64> {
        let mut failed: Vec<(String, Sandbox)> = self
            .store
            .list_sandboxes()
            .await?
            .into_iter()
            .filter(|(_, sb)| sb.status == SandboxStatus::Failed)
            .collect();
        failed.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at));

        let mut deleted = 0u64;
        for (mission_id, sandbox) in failed.into_iter().skip(keep) {
            if sandbox.path.exists() {
                if let Err(e) = std::fs::remove_dir_all(&sandbox.path) {
                    warn!(
                        path = %sandbox.path.display(),
                        "failed to remove sandbox dir: {e}"
                    );
                }
            }
            self.store.set_mission_sandbox(&mission_id, None).await?;
            deleted += 1;
        }
        Ok(deleted)
    }
}
