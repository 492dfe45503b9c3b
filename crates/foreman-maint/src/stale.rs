//! Stale-instance reclamation.
//!
//! Executors can die holding claims. On each tick, instances with old
//! heartbeats are marked stopped and their claims released atomically by
//! the store, failed sandboxes beyond the retention count are dropped, and
//! old stopped instance rows are pruned.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use foreman_core::config::ExecutorConfig;
use foreman_core::event::{AgentEvent, EventKind, Severity};
use foreman_mission::SandboxManager;
use foreman_store::Store;

#[derive(Clone, Copy, Debug, Default)]
pub struct StaleCycleStats {
    pub claims_released: usize,
    pub sandboxes_deleted: u64,
    pub instances_deleted: u64,
}

/// One reclamation pass.
pub async fn stale_cleanup_cycle(
    store: &Arc<dyn Store>,
    sandboxes: &SandboxManager,
    config: &ExecutorConfig,
) -> Result<StaleCycleStats> {
    let mut stats = StaleCycleStats::default();

    let released = store
        .cleanup_stale_instances(Duration::from_secs(config.stale_threshold_secs))
        .await?;
    stats.claims_released = released.len();
    for issue_id in &released {
        info!(issue = %issue_id, "released stale claim");
        let event = AgentEvent::new(
            issue_id,
            &config.executor_id,
            EventKind::Progress,
            Severity::Warning,
            "stale claim released; issue reopened for retry",
        );
        if let Err(e) = store.append_event(event).await {
            warn!("failed to record stale-release event: {e:#}");
        }
    }

    stats.sandboxes_deleted = sandboxes
        .cleanup_failed(config.failed_sandbox_retention as usize)
        .await?;

    stats.instances_deleted = store
        .delete_old_stopped_instances(
            Duration::from_secs(u64::from(config.stopped_instance_max_age_days) * 86_400),
            config.stopped_instance_keep as usize,
        )
        .await?;

    Ok(stats)
}

/// Ticker loop around [`stale_cleanup_cycle`]. Exits promptly on cancel,
/// even mid-cleanup (the cycle itself is short; the select covers the
/// wait).
pub async fn run_stale_cleanup_loop(
    store: Arc<dyn Store>,
    sandboxes: Arc<SandboxManager>,
    config: ExecutorConfig,
    cancel: CancellationToken,
) {
    let interval = Duration::from_secs(config.stale_check_interval_secs);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("stale cleanup loop stopping");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("stale cleanup loop stopping");
                return;
            }
            result = stale_cleanup_cycle(&store, &sandboxes, &config) => {
                match result {
                    Ok(stats) if stats.claims_released > 0 => {
                        info!(released = stats.claims_released, "stale cleanup reclaimed work");
                    }
                    Ok(_) => {}
                    Err(e) => warn!("stale cleanup cycle failed: {e:#}"),
                }
            }
        }
    }
}
