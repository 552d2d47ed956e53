//! Thin async wrapper over the `git` binary.
//!
//! Every invocation captures combined stdout+stderr; callers branch on the
//! exit status rather than on parsed errors, since most git failures here
//! (rebase conflicts, missing refs) are expected control flow.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Outcome of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub ok: bool,
    pub output: String,
}

/// Run `git <args>` in `dir`, capturing combined stdout+stderr.
///
/// Returns `Err` only when the process could not be spawned or waited on;
/// a non-zero exit is reported through [`GitOutput::ok`].
pub async fn git(dir: &Path, args: &[&str]) -> Result<GitOutput> {
    let mut child = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn git {}", args.join(" ")))?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let read_stdout = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stdout_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        buf
    };
    let read_stderr = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stderr_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        buf
    };

    let (status, out, err) = tokio::join!(child.wait(), read_stdout, read_stderr);
    let status = status.with_context(|| format!("failed to wait on git {}", args.join(" ")))?;

    let mut combined = String::from_utf8_lossy(&out).into_owned();
    combined.push_str(&String::from_utf8_lossy(&err));

    Ok(GitOutput {
        ok: status.success(),
        output: combined,
    })
}

/// Run git and return only whether it succeeded.
pub async fn git_ok(dir: &Path, args: &[&str]) -> Result<bool> {
    Ok(git(dir, args).await?.ok)
}

/// `git rev-parse <rev>`, trimmed, or `None` when the rev does not resolve.
pub async fn rev_parse(dir: &Path, rev: &str) -> Result<Option<String>> {
    let result = git(dir, &["rev-parse", "--verify", rev]).await?;
    if result.ok {
        Ok(Some(result.output.trim().to_owned()))
    } else {
        Ok(None)
    }
}
