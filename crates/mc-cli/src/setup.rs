//! Shared wiring: config loading and component construction.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use mc_core::backend::LocalBackend;
use mc_core::config::MissionConfig;
use mc_core::events::EventStream;
use mc_core::green::GreenBranchManager;
use mc_core::planner::SubprocessPlanner;
use mc_core::round::RoundController;
use mc_core::workspace::WorkspacePool;
use mc_db::{Store, default_migrations_path};

/// Load the mission config from a TOML file.
pub fn load_config(path: &Path) -> Result<MissionConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    let config: MissionConfig =
        toml::from_str(&raw).with_context(|| format!("invalid config at {}", path.display()))?;
    Ok(config)
}

/// Default database path: under the user's local data dir, falling back
/// to the working directory.
pub fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mission-control")
        .join("mission-control.db")
}

pub async fn open_store(db_path: &Path) -> Result<Arc<Store>> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Store::open(db_path).await?;
    store.migrate(default_migrations_path()).await?;
    Ok(Arc::new(store))
}

/// Everything a mission run needs, wired together.
pub struct MissionComponents {
    pub config: Arc<MissionConfig>,
    pub store: Arc<Store>,
    pub pool: Arc<WorkspacePool>,
    pub backend: Arc<LocalBackend>,
    pub green: Arc<GreenBranchManager>,
    pub stream: Arc<EventStream>,
}

/// Build and initialize the pool, backend, and green-branch manager.
pub async fn build_components(
    config: MissionConfig,
    store: Arc<Store>,
    db_path: &Path,
) -> Result<MissionComponents> {
    let config = Arc::new(config);
    let source_repo = config.target.path.clone();

    let pool_dir = config
        .scheduler
        .parallel
        .pool_dir
        .clone()
        .unwrap_or_else(|| {
            source_repo
                .parent()
                .map(|p| p.join(".mc-pool"))
                .unwrap_or_else(|| PathBuf::from(".mc-pool"))
        });

    // Headroom beyond the worker bound: the green-branch manager keeps one
    // clone, and pinned verification and fixup candidates borrow more.
    let max_clones = config.scheduler.parallel.num_workers
        + config.green_branch.fixup_candidates
        + 2;

    let pool = Arc::new(WorkspacePool::new(
        &source_repo,
        &pool_dir,
        max_clones,
        &config.target.branch,
        Some(config.green_branch.green_branch.clone()),
    ));
    pool.initialize(config.scheduler.parallel.warm_clones)
        .await?;

    let backend = Arc::new(LocalBackend::new(
        Arc::clone(&pool),
        config.scheduler.max_output_bytes,
    ));

    let gb_workspace = pool
        .acquire()
        .await?
        .context("workspace pool could not provide the green-branch workspace")?;
    let green = Arc::new(GreenBranchManager::new(
        (*config).clone(),
        Arc::clone(&store),
        Arc::clone(&pool),
        gb_workspace,
    ));
    green.initialize().await?;

    let stream_path = db_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("events.jsonl");
    let stream = Arc::new(EventStream::new(stream_path));
    if let Err(e) = stream.open() {
        tracing::warn!(error = %e, "could not open JSONL event stream");
    }

    Ok(MissionComponents {
        config,
        store,
        pool,
        backend,
        green,
        stream,
    })
}

/// Build a round controller over prepared components.
pub fn build_controller(components: &MissionComponents) -> RoundController {
    let planner = Arc::new(SubprocessPlanner::new(Arc::clone(&components.config)));
    RoundController::new(
        Arc::clone(&components.config),
        Arc::clone(&components.store),
        planner,
        components.backend.clone(),
        Arc::clone(&components.green),
        components.green.clone(),
        Some(Arc::clone(&components.stream)),
    )
}
