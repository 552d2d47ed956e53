//! Local worker backend: workspace pool + child processes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

use super::{ExecHandle, ExecStatus, WorkerBackend};
use crate::workspace::WorkspacePool;

/// Per-child state machine: Spawned -> Running -> Completed | Killed |
/// TimedOut. The terminal distinction collapses into [`ExecStatus`];
/// killed and timed-out children report `Failed`.
#[derive(Debug)]
struct ChildState {
    child: Option<Child>,
    buffer: Vec<u8>,
    status: ExecStatus,
    deadline: Instant,
}

/// Backend that runs workers as local child processes inside pool clones.
pub struct LocalBackend {
    pool: Arc<WorkspacePool>,
    max_output_bytes: usize,
    next_id: AtomicU64,
    children: Mutex<HashMap<u64, Arc<Mutex<ChildState>>>>,
}

impl LocalBackend {
    pub fn new(pool: Arc<WorkspacePool>, max_output_bytes: usize) -> Self {
        Self {
            pool,
            max_output_bytes,
            next_id: AtomicU64::new(1),
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<WorkspacePool> {
        &self.pool
    }

    async fn child_state(&self, handle: &ExecHandle) -> Option<Arc<Mutex<ChildState>>> {
        self.children.lock().await.get(&handle.id).cloned()
    }
}

/// Append a chunk to a bounded buffer, keeping the tail on overflow.
fn push_bounded(buffer: &mut Vec<u8>, chunk: &[u8], cap: usize) {
    buffer.extend_from_slice(chunk);
    if buffer.len() > cap {
        let excess = buffer.len() - cap;
        buffer.drain(..excess);
    }
}

#[async_trait]
impl WorkerBackend for LocalBackend {
    async fn provision_workspace(
        &self,
        unit_id: &str,
        _source: &Path,
        _base_branch: &str,
    ) -> Result<PathBuf> {
        match self.pool.acquire().await? {
            Some(workspace) => Ok(workspace),
            None => bail!(
                "workspace pool exhausted while provisioning for unit {unit_id}"
            ),
        }
    }

    async fn spawn(
        &self,
        unit_id: &str,
        workspace: &Path,
        argv: &[String],
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<ExecHandle> {
        let (program, args) = argv
            .split_first()
            .context("worker argv must not be empty")?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(workspace)
            .env_clear()
            .envs(env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn worker for unit {unit_id}"))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let state = Arc::new(Mutex::new(ChildState {
            child: Some(child),
            buffer: Vec::new(),
            status: ExecStatus::Running,
            deadline: Instant::now() + timeout,
        }));

        let cap = self.max_output_bytes;
        if let Some(mut pipe) = stdout {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                while let Ok(n) = pipe.read(&mut chunk).await {
                    if n == 0 {
                        break;
                    }
                    push_bounded(&mut state.lock().await.buffer, &chunk[..n], cap);
                }
            });
        }
        if let Some(mut pipe) = stderr {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                while let Ok(n) = pipe.read(&mut chunk).await {
                    if n == 0 {
                        break;
                    }
                    push_bounded(&mut state.lock().await.buffer, &chunk[..n], cap);
                }
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.children.lock().await.insert(id, state);

        Ok(ExecHandle {
            id,
            unit_id: unit_id.to_owned(),
        })
    }

    async fn check_status(&self, handle: &ExecHandle) -> ExecStatus {
        let Some(state) = self.child_state(handle).await else {
            return ExecStatus::Failed;
        };
        let mut state = state.lock().await;

        if state.status != ExecStatus::Running {
            return state.status;
        }

        let deadline = state.deadline;
        if let Some(ref mut child) = state.child {
            match child.try_wait() {
                Ok(Some(exit)) => {
                    state.status = if exit.success() {
                        ExecStatus::Completed
                    } else {
                        ExecStatus::Failed
                    };
                }
                Ok(None) => {
                    // Still running; enforce the deadline.
                    if Instant::now() >= deadline {
                        warn!(unit_id = %handle.unit_id, "worker exceeded deadline, killing");
                        let _ = child.kill().await;
                        state.status = ExecStatus::Failed;
                    }
                }
                Err(e) => {
                    warn!(unit_id = %handle.unit_id, error = %e, "failed to poll worker");
                    state.status = ExecStatus::Failed;
                }
            }
        }

        state.status
    }

    async fn get_output(&self, handle: &ExecHandle) -> String {
        match self.child_state(handle).await {
            Some(state) => String::from_utf8_lossy(&state.lock().await.buffer).into_owned(),
            None => String::new(),
        }
    }

    async fn kill(&self, handle: &ExecHandle) -> Result<()> {
        let Some(state) = self.child_state(handle).await else {
            return Ok(());
        };
        let mut state = state.lock().await;
        if let Some(ref mut child) = state.child {
            let _ = child.kill().await;
        }
        state.status = ExecStatus::Failed;
        Ok(())
    }

    async fn release_workspace(&self, workspace: &Path) -> Result<()> {
        self.pool.release(workspace).await?;
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        let children: Vec<_> = self.children.lock().await.drain().collect();
        for (_, state) in children {
            let mut state = state.lock().await;
            if let Some(ref mut child) = state.child {
                let _ = child.kill().await;
            }
        }
        self.pool.cleanup().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_buffer_keeps_tail() {
        let mut buffer = Vec::new();
        push_bounded(&mut buffer, b"aaaa", 8);
        push_bounded(&mut buffer, b"bbbb", 8);
        push_bounded(&mut buffer, b"cccc", 8);
        assert_eq!(buffer, b"bbbbcccc");
    }

    #[tokio::test]
    async fn spawn_collects_output_and_completes() {
        use mc_test_utils::create_temp_repo;
        use tempfile::TempDir;

        let (_repo_dir, repo) = create_temp_repo();
        let pool_dir = TempDir::new().unwrap();
        let pool = Arc::new(WorkspacePool::new(
            &repo,
            pool_dir.path(),
            2,
            "main",
            None,
        ));
        pool.initialize(0).await.unwrap();
        let backend = LocalBackend::new(pool, 1024 * 1024);

        let workspace = backend
            .provision_workspace("u1", &repo, "main")
            .await
            .unwrap();

        let argv = vec![
            "sh".to_owned(),
            "-c".to_owned(),
            "echo hello-from-worker".to_owned(),
        ];
        let mut env = HashMap::new();
        env.insert("PATH".to_owned(), std::env::var("PATH").unwrap_or_default());

        let handle = backend
            .spawn("u1", &workspace, &argv, &env, Duration::from_secs(30))
            .await
            .unwrap();

        let mut status = ExecStatus::Running;
        for _ in 0..100 {
            status = backend.check_status(&handle).await;
            if status != ExecStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(status, ExecStatus::Completed);

        // Drain tasks may still be flushing the last chunk.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let output = backend.get_output(&handle).await;
        assert!(output.contains("hello-from-worker"), "got: {output:?}");

        backend.release_workspace(&workspace).await.unwrap();
    }

    #[tokio::test]
    async fn deadline_kills_slow_worker() {
        use mc_test_utils::create_temp_repo;
        use tempfile::TempDir;

        let (_repo_dir, repo) = create_temp_repo();
        let pool_dir = TempDir::new().unwrap();
        let pool = Arc::new(WorkspacePool::new(
            &repo,
            pool_dir.path(),
            2,
            "main",
            None,
        ));
        pool.initialize(0).await.unwrap();
        let backend = LocalBackend::new(pool, 1024);

        let workspace = backend
            .provision_workspace("u1", &repo, "main")
            .await
            .unwrap();

        let argv = vec!["sleep".to_owned(), "60".to_owned()];
        let mut env = HashMap::new();
        env.insert("PATH".to_owned(), std::env::var("PATH").unwrap_or_default());

        let handle = backend
            .spawn("u1", &workspace, &argv, &env, Duration::from_millis(200))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = backend.check_status(&handle).await;
        assert_eq!(status, ExecStatus::Failed);

        backend.release_workspace(&workspace).await.unwrap();
    }
}
