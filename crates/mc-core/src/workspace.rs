//! Workspace pool: shared git clones for worker isolation.
//!
//! Each workspace is a `git clone --shared` of the source repo, hardlinked
//! to its object store, so creation is instant and cheap on disk. The pool
//! enforces a ceiling on total clones and resets each clone to the latest
//! green state between uses.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::git::{git, git_ok};
use mc_db::models::new_id;

/// Errors from workspace pool operations.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to create shared clone at {path}: {output}")]
    CloneFailed { path: PathBuf, output: String },

    #[error("workspace pool io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git invocation failed: {0}")]
    Git(String),
}

impl From<anyhow::Error> for WorkspaceError {
    fn from(e: anyhow::Error) -> Self {
        Self::Git(format!("{e:#}"))
    }
}

#[derive(Debug, Default)]
struct PoolState {
    available: Vec<PathBuf>,
    in_use: HashSet<PathBuf>,
}

/// Pool of shared git clones for parallel worker isolation.
#[derive(Debug)]
pub struct WorkspacePool {
    source_repo: PathBuf,
    pool_dir: PathBuf,
    max_clones: usize,
    base_branch: String,
    green_branch: Option<String>,
    state: Mutex<PoolState>,
}

impl WorkspacePool {
    pub fn new(
        source_repo: impl Into<PathBuf>,
        pool_dir: impl Into<PathBuf>,
        max_clones: usize,
        base_branch: impl Into<String>,
        green_branch: Option<String>,
    ) -> Self {
        Self {
            source_repo: source_repo.into(),
            pool_dir: pool_dir.into(),
            max_clones,
            base_branch: base_branch.into(),
            green_branch,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn source_repo(&self) -> &Path {
        &self.source_repo
    }

    /// Total clones (available + in use).
    pub async fn total_clones(&self) -> usize {
        let state = self.state.lock().await;
        state.available.len() + state.in_use.len()
    }

    /// Create the pool directory and optionally pre-warm clones.
    pub async fn initialize(&self, warm_count: usize) -> Result<(), WorkspaceError> {
        std::fs::create_dir_all(&self.pool_dir)?;
        for _ in 0..warm_count {
            let mut state = self.state.lock().await;
            if state.available.len() + state.in_use.len() >= self.max_clones {
                break;
            }
            drop(state);
            let clone = self.create_clone().await?;
            state = self.state.lock().await;
            state.available.push(clone);
        }
        Ok(())
    }

    /// Get a workspace from the pool, creating one if under the ceiling.
    ///
    /// Returns `None` when the pool is at `max_clones` and nothing is idle;
    /// the caller must wait or fail.
    pub async fn acquire(&self) -> Result<Option<PathBuf>, WorkspaceError> {
        {
            let mut state = self.state.lock().await;
            if let Some(workspace) = state.available.pop() {
                state.in_use.insert(workspace.clone());
                return Ok(Some(workspace));
            }
            if state.available.len() + state.in_use.len() >= self.max_clones {
                return Ok(None);
            }
        }

        let clone = self.create_clone().await?;
        let mut state = self.state.lock().await;
        state.in_use.insert(clone.clone());
        Ok(Some(clone))
    }

    /// Return a workspace to the pool after resetting it.
    ///
    /// Releasing a path the pool does not hold is a no-op.
    pub async fn release(&self, workspace: &Path) -> Result<(), WorkspaceError> {
        {
            let mut state = self.state.lock().await;
            if !state.in_use.remove(workspace) {
                return Ok(());
            }
        }

        self.reset_clone(workspace).await?;

        let mut state = self.state.lock().await;
        state.available.push(workspace.to_path_buf());
        Ok(())
    }

    /// Delete all clones and the pool directory.
    pub async fn cleanup(&self) -> Result<(), WorkspaceError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        for clone in state.available.drain(..).chain(state.in_use.drain()) {
            if clone.exists() {
                std::fs::remove_dir_all(&clone)?;
            }
        }
        if self.pool_dir.exists() {
            std::fs::remove_dir_all(&self.pool_dir)?;
        }
        Ok(())
    }

    async fn create_clone(&self) -> Result<PathBuf, WorkspaceError> {
        let name = format!("worker-{}", &new_id()[..8]);
        let clone_path = self.pool_dir.join(name);

        let source = self.source_repo.to_string_lossy().into_owned();
        let dest = clone_path.to_string_lossy().into_owned();
        let result = git(&self.pool_dir, &["clone", "--shared", &source, &dest]).await?;

        if !result.ok {
            return Err(WorkspaceError::CloneFailed {
                path: clone_path,
                output: result.output,
            });
        }

        info!(path = %clone_path.display(), "created shared clone");
        Ok(clone_path)
    }

    /// Reset a clone to a clean state: checkout base, fetch, hard-reset,
    /// `clean -fdx`.
    ///
    /// The base branch MUST be checked out before the reset so that the
    /// reset only moves the base branch ref, not a unit branch ref that the
    /// green-branch manager has yet to fetch from this clone.
    ///
    /// Resets to `origin/<green>` (latest merged state) when that ref
    /// exists, falling back to `origin/<base>`.
    async fn reset_clone(&self, clone_path: &Path) -> Result<(), WorkspaceError> {
        if !git_ok(clone_path, &["checkout", &self.base_branch]).await? {
            warn!(
                path = %clone_path.display(),
                branch = %self.base_branch,
                "failed to checkout base branch during reset"
            );
        }
        git_ok(clone_path, &["fetch", "origin"]).await?;

        let mut reset_ref = format!("origin/{}", self.base_branch);
        if let Some(ref green) = self.green_branch {
            let candidate = format!("origin/{green}");
            if git_ok(clone_path, &["rev-parse", "--verify", &candidate]).await? {
                reset_ref = candidate;
            }
        }

        git_ok(clone_path, &["reset", "--hard", &reset_ref]).await?;
        git_ok(clone_path, &["clean", "-fdx"]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mc_test_utils::{commit_file, create_temp_repo, git as run_git};
    use tempfile::TempDir;

    fn make_pool(repo: &Path, pool_dir: &Path, max_clones: usize) -> WorkspacePool {
        WorkspacePool::new(repo, pool_dir, max_clones, "main", None)
    }

    #[tokio::test]
    async fn acquire_creates_and_reuses_clones() {
        let (_repo_dir, repo) = create_temp_repo();
        let pool_dir = TempDir::new().unwrap();
        let pool = make_pool(&repo, pool_dir.path(), 2);
        pool.initialize(0).await.unwrap();

        let ws = pool.acquire().await.unwrap().expect("should create clone");
        assert!(ws.join("README.md").exists());
        assert_eq!(pool.total_clones().await, 1);

        pool.release(&ws).await.unwrap();
        let ws2 = pool.acquire().await.unwrap().expect("should reuse clone");
        assert_eq!(ws, ws2);
        assert_eq!(pool.total_clones().await, 1);
    }

    #[tokio::test]
    async fn acquire_respects_ceiling() {
        let (_repo_dir, repo) = create_temp_repo();
        let pool_dir = TempDir::new().unwrap();
        let pool = make_pool(&repo, pool_dir.path(), 1);
        pool.initialize(0).await.unwrap();

        let ws = pool.acquire().await.unwrap();
        assert!(ws.is_some());
        let blocked = pool.acquire().await.unwrap();
        assert!(blocked.is_none(), "pool at ceiling should return None");
    }

    #[tokio::test]
    async fn release_resets_dirty_workspace() {
        let (_repo_dir, repo) = create_temp_repo();
        let pool_dir = TempDir::new().unwrap();
        let pool = make_pool(&repo, pool_dir.path(), 2);
        pool.initialize(0).await.unwrap();

        let ws = pool.acquire().await.unwrap().unwrap();
        std::fs::write(ws.join("scratch.txt"), "dirty\n").unwrap();
        run_git(&ws, &["checkout", "-b", "mc/unit-test"]).unwrap();

        pool.release(&ws).await.unwrap();

        let ws2 = pool.acquire().await.unwrap().unwrap();
        assert_eq!(ws, ws2);
        assert!(!ws2.join("scratch.txt").exists(), "clean -fdx should remove scratch");
        let branch = run_git(&ws2, &["branch", "--show-current"]).unwrap();
        assert_eq!(branch.trim(), "main");
    }

    #[tokio::test]
    async fn release_preserves_unit_branch_ref() {
        let (_repo_dir, repo) = create_temp_repo();
        let pool_dir = TempDir::new().unwrap();
        let pool = make_pool(&repo, pool_dir.path(), 2);
        pool.initialize(0).await.unwrap();

        let ws = pool.acquire().await.unwrap().unwrap();
        run_git(&ws, &["config", "user.email", "w@mc.dev"]).unwrap();
        run_git(&ws, &["config", "user.name", "w"]).unwrap();
        run_git(&ws, &["checkout", "-b", "mc/unit-keepme"]).unwrap();
        let commit = commit_file(&ws, "work.txt", "unit work\n", "unit commit");

        pool.release(&ws).await.unwrap();

        // The unit branch ref must survive the reset so the merge
        // serializer can still fetch the commit.
        let head = run_git(&ws, &["rev-parse", "mc/unit-keepme"]).unwrap();
        assert_eq!(head.trim(), commit);
    }

    #[tokio::test]
    async fn release_of_unknown_path_is_noop() {
        let (_repo_dir, repo) = create_temp_repo();
        let pool_dir = TempDir::new().unwrap();
        let pool = make_pool(&repo, pool_dir.path(), 1);
        pool.release(Path::new("/nonexistent/workspace"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cleanup_removes_everything() {
        let (_repo_dir, repo) = create_temp_repo();
        let pool_dir = TempDir::new().unwrap();
        let pool_path = pool_dir.path().join("pool");
        let pool = make_pool(&repo, &pool_path, 2);
        pool.initialize(1).await.unwrap();

        assert!(pool_path.exists());
        pool.cleanup().await.unwrap();
        assert!(!pool_path.exists());
        assert_eq!(pool.total_clones().await, 0);
    }
}
