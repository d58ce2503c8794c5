use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Workspace for one pipeline run: `storage_root/<user_id>/<run_id>/`.
/// Namespacing by run id keeps two concurrent runs for the same user from
/// ever sharing a path; the run id travels clone -> count -> cleanup.
pub fn run_workspace(storage_root: &Path, user_id: &str, run_id: Uuid) -> PathBuf {
    storage_root.join(user_id).join(run_id.to_string())
}

/// Best-effort reclamation of a run's scratch space. Never fails the job:
/// a leftover workspace is an operational concern, not a correctness one.
pub async fn cleanup(workspace: &Path) {
    match tokio::fs::remove_dir_all(workspace).await {
        Ok(()) => {
            tracing::debug!(workspace = %workspace.display(), "workspace removed");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(workspace = %workspace.display(), error = %e, "workspace cleanup failed");
        }
    }

    // Drop the per-user parent too once its last run is gone.
    if let Some(parent) = workspace.parent() {
        let _ = tokio::fs::remove_dir(parent).await;
    }
}
