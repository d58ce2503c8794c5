use crate::pipeline::lister::RepoSummary;
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;

/// Per-repository failure. The caller logs and moves on to the next
/// repository; one bad clone never aborts the rest of the job.
#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("failed to prepare workspace: {0}")]
    Workspace(std::io::Error),
    #[error("refusing repository name {0:?}")]
    InvalidName(String),
    #[error("failed to clone {repo}: {detail}")]
    CloneFailed { repo: String, detail: String },
}

/// Fetch one repository's full content into `workspace/<repo.name>`.
///
/// The workspace mkdir is idempotent, and an existing destination from an
/// earlier attempt is removed before re-cloning, so the whole operation is
/// safe to repeat on retry. The credential is embedded only in the transient
/// clone URL and is scrubbed from anything that leaves this function.
pub async fn materialize(
    repo: &RepoSummary,
    token: &str,
    workspace: &Path,
) -> Result<(), MaterializeError> {
    if !is_safe_name(&repo.name) {
        return Err(MaterializeError::InvalidName(repo.name.clone()));
    }

    tokio::fs::create_dir_all(workspace)
        .await
        .map_err(MaterializeError::Workspace)?;

    let dest = workspace.join(&repo.name);
    if tokio::fs::metadata(&dest).await.is_ok() {
        tokio::fs::remove_dir_all(&dest)
            .await
            .map_err(MaterializeError::Workspace)?;
    }

    let clone_url = tokenized_clone_url(&repo.clone_url, token);

    let output = Command::new("git")
        .arg("clone")
        .arg(&clone_url)
        .arg(&dest)
        .output()
        .await
        .map_err(|e| MaterializeError::CloneFailed {
            repo: repo.name.clone(),
            detail: redact(&e.to_string(), token),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(MaterializeError::CloneFailed {
            repo: repo.name.clone(),
            detail: redact(stderr.trim(), token),
        });
    }

    Ok(())
}

/// Embed the bearer credential into the fetch locator for authentication.
pub fn tokenized_clone_url(clone_url: &str, token: &str) -> String {
    clone_url.replacen("https://", &format!("https://{token}@"), 1)
}

/// Scrub the credential from text that may be logged or stored.
pub fn redact(text: &str, token: &str) -> String {
    if token.is_empty() {
        return text.to_string();
    }
    text.replace(token, "***")
}

/// Repository names come from an external API; only accept plain path
/// components so the destination stays inside the workspace.
fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}
