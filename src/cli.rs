//! CLI commands.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::config::Config;
use crate::jobs::JobQueue;
use crate::provider::{vm::new_vm_provider, DockerProvider, SandboxProvider};
use crate::reconcile;
use crate::session::{EventBus, GitCloner, GitCommitter, SessionService, StateStore};
use crate::web::{start_web_server, AppState};

#[derive(Parser)]
#[command(name = "denbox", about = "denbox — sandbox provisioning daemon")]
struct Cli {
    /// Path to the config file (default: ~/.denbox/config.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon: reconcile, resume jobs, serve the API.
    Serve,

    /// Run the reconciliation passes once and exit.
    Reconcile,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    match cli.command {
        Commands::Serve => {
            crate::logging::init_logging(&config)?;
            cmd_serve(config).await
        }
        // one-shot pass, stdout only
        Commands::Reconcile => {
            crate::logging::init_simple_logging();
            cmd_reconcile(config).await
        }
    }
}

fn build_provider(config: &Config) -> Result<Arc<dyn SandboxProvider>> {
    match config.provider.as_str() {
        "docker" => Ok(Arc::new(
            DockerProvider::new(&config.docker).context("Failed to create Docker provider")?,
        )),
        "vm" => {
            new_vm_provider(&config.vm, &config.data_dir()).context("Failed to create VM provider")
        }
        other => anyhow::bail!("unknown provider '{}', expected 'docker' or 'vm'", other),
    }
}

fn build_service(
    config: &Config,
    provider: Arc<dyn SandboxProvider>,
) -> Result<(Arc<SessionService>, Arc<JobQueue>, Arc<StateStore>)> {
    let data_dir = config.data_dir();
    let store = Arc::new(StateStore::open(&data_dir).context("Failed to open state store")?);
    let jobs = Arc::new(JobQueue::new(&data_dir).context("Failed to open job queue")?);
    let service = SessionService::new(
        Arc::clone(&store),
        EventBus::new(),
        provider,
        Arc::clone(&jobs),
        Arc::new(GitCommitter),
        Arc::new(GitCloner),
    );
    Ok((service, jobs, store))
}

async fn cmd_serve(config: Config) -> Result<()> {
    let provider = build_provider(&config)?;
    let (service, jobs, store) = build_service(&config, Arc::clone(&provider))?;

    // startup drift repair before traffic is accepted
    let containers = reconcile::reconcile_containers(&store, &provider)
        .await
        .context("Container reconciliation failed")?;
    reinitialize_missing(&service, &containers.missing).await;
    let probe = reconcile::HttpAgentProbe::new(&config.agent.base_url);
    reconcile::reconcile_running(&store, &probe, &config.reconcile)
        .await
        .context("Running-state reconciliation failed")?;

    let resumed = jobs.resume().await.context("Failed to resume jobs")?;
    if resumed > 0 {
        info!(resumed, "resumed persisted jobs");
    }

    let state = AppState::new(service, Arc::clone(&provider));
    start_web_server(config.web.clone(), state).await?;

    provider.close().await.ok();
    Ok(())
}

/// Rebuild the sandbox behind each ready session the container pass found
/// without one. A failed rebuild marks that session `error` and moves on.
async fn reinitialize_missing(service: &Arc<SessionService>, session_ids: &[String]) {
    for session_id in session_ids {
        if let Err(e) = service.reinitialize(session_id).await {
            warn!(session = %session_id, error = %e, "failed to rebuild missing sandbox");
        }
    }
}

async fn cmd_reconcile(config: Config) -> Result<()> {
    let provider = build_provider(&config)?;
    let (service, _jobs, store) = build_service(&config, Arc::clone(&provider))?;

    let containers = reconcile::reconcile_containers(&store, &provider).await?;
    reinitialize_missing(&service, &containers.missing).await;
    println!(
        "containers: {} orphans removed, {} recreated, {} unchanged, {} rebuilt from missing",
        containers.removed_orphans.len(),
        containers.recreated.len(),
        containers.unchanged.len(),
        containers.missing.len()
    );

    let probe = reconcile::HttpAgentProbe::new(&config.agent.base_url);
    let running = reconcile::reconcile_running(&store, &probe, &config.reconcile).await?;
    println!(
        "running state: {} reset, {} confirmed",
        running.reset.len(),
        running.confirmed.len()
    );

    provider.close().await.ok();
    Ok(())
}
