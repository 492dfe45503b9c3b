use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod cli;

use cli::{Cli, Commands};
use foreman_agent::check_agent_installed;
use foreman_ai::{DisabledOracle, Oracle};
use foreman_core::config::ExecutorConfig;
use foreman_exec::{AutoApprove, Dispatcher};
use foreman_git::{GitOps, SystemGit};
use foreman_maint::{run_event_cleanup_loop, run_stale_cleanup_loop};
use foreman_mission::{SandboxManager, rebase_active_sandboxes};
use foreman_store::{MemoryStore, Store};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout stays clean for command output.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Check { config } => check_config(&cli::resolve_config_path(config)),
        Commands::Gc {
            config,
            retention_days,
            dry_run,
        } => gc_branches(&cli::resolve_config_path(config), retention_days, dry_run).await,
        Commands::Run { config, once } => {
            run_executor(&cli::resolve_config_path(config), once).await
        }
    }
}

fn load_validated(path: &Path) -> Result<ExecutorConfig> {
    let config = ExecutorConfig::load(path)?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_validated(path)?;
    match config.retention.validate() {
        Ok(()) => println!("config ok (executor {})", config.executor_id),
        Err(e) => println!(
            "config ok (executor {}), but event cleanup will be disabled: {e}",
            config.executor_id
        ),
    }
    Ok(())
}

async fn gc_branches(path: &Path, retention_days: u32, dry_run: bool) -> Result<()> {
    let config = load_validated(path)?;
    let git = SystemGit;
    let deleted = git
        .cleanup_orphaned_branches(&config.repo_root, retention_days, dry_run)
        .await?;
    for branch in &deleted {
        println!("{}{branch}", if dry_run { "would delete " } else { "deleted " });
    }
    println!("{} branch(es)", deleted.len());
    Ok(())
}

async fn run_executor(path: &Path, once: bool) -> Result<()> {
    let config = load_validated(path)?;

    // Fatal preflight: a missing agent binary means nothing can run.
    check_agent_installed(&config.agent.program)?;

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let git: Arc<dyn GitOps> = Arc::new(SystemGit);
    // The AI supervisor is deployment-specific; without one, every AI step
    // degrades to its non-AI fallback.
    let oracle: Arc<dyn Oracle> = Arc::new(DisabledOracle);

    let root_cancel = CancellationToken::new();
    {
        let cancel = root_cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                cancel.cancel();
            }
        });
    }

    // Startup rebase of long-lived mission sandboxes. A rebase changes the
    // world under the agent binary, so re-run the preflight afterwards.
    match rebase_active_sandboxes(&store, &git, &config.executor_id).await {
        Ok(true) => {
            check_agent_installed(&config.agent.program)?;
        }
        Ok(false) => {}
        Err(e) => warn!("startup sandbox rebase failed: {e:#}"),
    }

    let sandboxes = Arc::new(SandboxManager::new(Arc::clone(&store)));
    let stale_loop = tokio::spawn(run_stale_cleanup_loop(
        Arc::clone(&store),
        Arc::clone(&sandboxes),
        config.clone(),
        root_cancel.clone(),
    ));
    let event_loop = tokio::spawn(run_event_cleanup_loop(
        Arc::clone(&store),
        config.retention,
        config.executor_id.clone(),
        root_cancel.clone(),
    ));

    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        oracle,
        git,
        Arc::new(AutoApprove),
        config,
        root_cancel.clone(),
    );

    if once {
        let worked = dispatcher.run_once(&root_cancel).await?;
        info!(worked, "single dispatch finished");
        root_cancel.cancel();
    } else {
        dispatcher.run(root_cancel.clone()).await?;
    }

    let _ = stale_loop.await;
    let _ = event_loop.await;
    Ok(())
}
