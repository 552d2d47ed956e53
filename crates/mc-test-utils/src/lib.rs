//! Shared fixtures for mission-control tests: migrated in-memory stores,
//! throwaway git repositories, and scripted worker stubs.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use tempfile::TempDir;

use mc_db::{Store, default_migrations_path};

/// Open an in-memory store with all migrations applied.
pub async fn test_store() -> Result<Store> {
    let store = Store::open_in_memory().await?;
    store.migrate(default_migrations_path()).await?;
    Ok(store)
}

/// Run a git command in `dir`, failing the test on a non-zero exit.
pub fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("failed to run git {}", args.join(" ")))?;

    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Create a temporary git repository with one initial commit on `main`.
///
/// Returns the TempDir (must be held alive) and the repo path.
pub fn create_temp_repo() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let repo_path = dir.path().to_path_buf();

    git(&repo_path, &["init", "-b", "main"]).expect("git init failed");
    git(&repo_path, &["config", "user.email", "test@mc.dev"]).expect("config email");
    git(&repo_path, &["config", "user.name", "MC Test"]).expect("config name");

    std::fs::write(repo_path.join("README.md"), "# Test repo\n").expect("write README");
    git(&repo_path, &["add", "."]).expect("git add");
    git(&repo_path, &["commit", "-m", "Initial commit"]).expect("git commit");

    (dir, repo_path)
}

/// Commit a file with the given content on the current branch.
pub fn commit_file(repo: &Path, name: &str, content: &str, message: &str) -> String {
    std::fs::write(repo.join(name), content).expect("write file");
    git(repo, &["add", name]).expect("git add");
    git(repo, &["commit", "-m", message]).expect("git commit");
    git(repo, &["rev-parse", "HEAD"])
        .expect("rev-parse")
        .trim()
        .to_owned()
}

/// Write an executable shell script for use as a stand-in worker command.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write script");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&path).expect("stat script").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod script");
    }

    path
}

/// Write an executable stub script that prints the given stdout and exits
/// with the given code. Used in place of a real worker command.
pub fn write_stub_worker(dir: &Path, name: &str, stdout: &str, exit_code: i32) -> PathBuf {
    let body =
        format!("cat <<'MC_STDOUT_EOF'\n{stdout}\nMC_STDOUT_EOF\nexit {exit_code}\n");
    write_script(dir, name, &body)
}
