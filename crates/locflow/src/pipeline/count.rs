use std::path::Path;
use thiserror::Error;
use tokio::process::Command;

/// Only a missing/unreadable workspace is fatal; every per-repository
/// problem degrades to a zero contribution.
#[derive(Debug, Error)]
pub enum CountError {
    #[error("workspace {0} is missing or unreadable")]
    WorkspaceMissing(String),
}

/// Sum the line counts of every materialized repository under `workspace`.
///
/// Each immediate subdirectory is treated as one repository and counted by
/// an external tool invocation; stray files are ignored. A repository whose
/// count fails or produces unparseable output contributes 0. The sum is
/// commutative, so directory iteration order does not matter.
pub async fn count_workspace(workspace: &Path) -> Result<u64, CountError> {
    let mut entries = tokio::fs::read_dir(workspace)
        .await
        .map_err(|_| CountError::WorkspaceMissing(workspace.display().to_string()))?;

    let mut total: u64 = 0;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|_| CountError::WorkspaceMissing(workspace.display().to_string()))?
    {
        let path = entry.path();
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }

        match count_repo(&path).await {
            Some(lines) => {
                tracing::debug!(repo = %path.display(), lines, "counted repository");
                total += lines;
            }
            None => {
                tracing::warn!(repo = %path.display(), "could not determine line count, counting 0");
            }
        }
    }

    Ok(total)
}

/// One repository's total via the tracked-files line counter. Returns None
/// when the tool fails or its output lacks a trailing total.
async fn count_repo(repo_path: &Path) -> Option<u64> {
    let output = Command::new("sh")
        .arg("-c")
        .arg("git ls-files | xargs wc -l | tail -n 1")
        .current_dir(repo_path)
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    parse_total(&String::from_utf8_lossy(&output.stdout))
}

/// Find a trailing `<integer> total` in the counter's output.
pub fn parse_total(output: &str) -> Option<u64> {
    for line in output.lines().rev() {
        let mut tokens = line.split_whitespace();
        if let (Some(first), Some("total")) = (tokens.next(), tokens.next()) {
            if let Ok(n) = first.parse::<u64>() {
                return Some(n);
            }
        }
    }
    None
}
