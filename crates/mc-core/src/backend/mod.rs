//! The worker-backend contract.
//!
//! A backend provisions an isolated workspace, spawns the worker
//! subprocess, and exposes a poll-based view of its execution. The local
//! backend composes the workspace pool with child processes; remote
//! backends (shell, container) implement the same trait out of core.

pub mod local;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub use local::LocalBackend;

/// Execution state of a spawned worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Running,
    Completed,
    Failed,
}

/// Opaque handle to a spawned worker process.
#[derive(Debug, Clone)]
pub struct ExecHandle {
    pub id: u64,
    pub unit_id: String,
}

/// Adapter interface for running worker subprocesses in workspaces.
///
/// Object-safe so orchestration code can hold `Arc<dyn WorkerBackend>` and
/// tests can substitute scripted implementations.
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Provision an isolated workspace for a unit, based on the given
    /// branch of the source repository.
    async fn provision_workspace(
        &self,
        unit_id: &str,
        source: &Path,
        base_branch: &str,
    ) -> Result<PathBuf>;

    /// Spawn the worker subprocess in a workspace. The deadline is
    /// enforced by the backend; on expiry the child is killed and reported
    /// failed.
    async fn spawn(
        &self,
        unit_id: &str,
        workspace: &Path,
        argv: &[String],
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<ExecHandle>;

    async fn check_status(&self, handle: &ExecHandle) -> ExecStatus;

    /// The output collected so far (bounded; tail kept on overflow).
    async fn get_output(&self, handle: &ExecHandle) -> String;

    async fn kill(&self, handle: &ExecHandle) -> Result<()>;

    async fn release_workspace(&self, workspace: &Path) -> Result<()>;

    /// Tear down all resources: kill children, delete workspaces.
    async fn cleanup(&self) -> Result<()>;
}

// Compile-time assertion: the trait must stay object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn WorkerBackend) {}
};
