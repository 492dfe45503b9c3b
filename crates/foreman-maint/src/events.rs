//! Event-retention loop.
//!
//! Three cascading deletions run per cycle, each in batches: age-based
//! (error-severity events keep a longer window), per-issue cap, then a
//! global cap at 95% of the configured limit. A metrics event is appended
//! after every cycle. Invalid retention config disables the loop loudly
//! instead of aborting the executor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use foreman_core::config::RetentionConfig;
use foreman_core::event::{AgentEvent, CleanupMetrics, EventData, EventKind, Severity};
use foreman_store::Store;

/// Global cap is enforced at this percentage of the configured limit.
const GLOBAL_CAP_PERCENT: u64 = 95;

/// One retention pass over the event store.
pub async fn run_cleanup_cycle(
    store: &Arc<dyn Store>,
    retention: &RetentionConfig,
    executor_id: &str,
) -> Result<CleanupMetrics> {
    let started = Instant::now();
    let mut metrics = CleanupMetrics::default();
    let batch = retention.cleanup_batch_size;

    let now = Utc::now();
    let cutoff = now - chrono::Duration::days(i64::from(retention.retention_days));
    let critical_cutoff = now - chrono::Duration::days(i64::from(retention.retention_critical_days));

    loop {
        let deleted = store.prune_events_by_age(cutoff, critical_cutoff, batch).await?;
        metrics.deleted_by_age += deleted;
        if deleted < batch {
            break;
        }
    }

    loop {
        let deleted = store
            .prune_events_per_issue(retention.per_issue_limit_events, batch)
            .await?;
        metrics.deleted_by_issue_cap += deleted;
        if deleted < batch {
            break;
        }
    }

    let global_cap = retention.global_limit_events * GLOBAL_CAP_PERCENT / 100;
    loop {
        let deleted = store.prune_events_global(global_cap, batch).await?;
        metrics.deleted_by_global_cap += deleted;
        if deleted < batch {
            break;
        }
    }

    let any_deleted = metrics.deleted_by_age + metrics.deleted_by_issue_cap + metrics.deleted_by_global_cap > 0;
    if any_deleted && retention.cleanup_vacuum {
        store.vacuum().await?;
        metrics.vacuumed = true;
    }
    metrics.duration_ms = started.elapsed().as_millis() as u64;

    let event = AgentEvent::new(
        "",
        executor_id,
        EventKind::Progress,
        Severity::Info,
        format!(
            "event cleanup: {} by age, {} by issue cap, {} by global cap",
            metrics.deleted_by_age, metrics.deleted_by_issue_cap, metrics.deleted_by_global_cap
        ),
    )
    .with_data(EventData::Cleanup(metrics));
    if let Err(e) = store.append_event(event).await {
        warn!("failed to record cleanup metrics event: {e:#}");
    }

    Ok(metrics)
}

/// Interval loop around [`run_cleanup_cycle`].
pub async fn run_event_cleanup_loop(
    store: Arc<dyn Store>,
    retention: RetentionConfig,
    executor_id: String,
    cancel: CancellationToken,
) {
    if !retention.cleanup_enabled {
        info!("event cleanup disabled by configuration");
        return;
    }
    if let Err(e) = retention.validate() {
        error!("event cleanup DISABLED: invalid retention config: {e}");
        return;
    }

    let interval = Duration::from_secs(retention.cleanup_interval_hours * 3_600);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("event cleanup loop stopping");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }
        match run_cleanup_cycle(&store, &retention, &executor_id).await {
            Ok(metrics) => {
                let total =
                    metrics.deleted_by_age + metrics.deleted_by_issue_cap + metrics.deleted_by_global_cap;
                if total > 0 {
                    info!(deleted = total, vacuumed = metrics.vacuumed, "event cleanup cycle done");
                }
            }
            Err(e) => warn!("event cleanup cycle failed: {e:#}"),
        }
    }
}
