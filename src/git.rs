use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use tracing::warn;

/// Commit checked out at `checkout_path`.
pub(crate) fn current_commit_id(checkout_path: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(checkout_path)
        .output()
        .context("failed to run git rev-parse")?;
    if !output.status.success() {
        anyhow::bail!(
            "git rev-parse HEAD failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let commit = String::from_utf8(output.stdout).context("git output is not UTF-8")?;
    let commit = commit.trim();
    if commit.is_empty() {
        anyhow::bail!("git rev-parse HEAD printed nothing");
    }
    Ok(commit.to_string())
}

/// Like `current_commit_id`, falling back to `fallback` when git cannot tell.
pub(crate) fn commit_oid_or(checkout_path: &Path, fallback: &str) -> String {
    match current_commit_id(checkout_path) {
        Ok(commit) => commit,
        Err(err) => {
            warn!(
                "could not determine the commit checked out at {}, using {fallback}: {err:#}",
                checkout_path.display()
            );
            fallback.to_string()
        }
    }
}
