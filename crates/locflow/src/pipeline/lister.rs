use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

const PER_PAGE: u32 = 100;

/// One repository owned by the authenticated principal, as returned by the
/// provider listing API. Consumed once by the materializer.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoSummary {
    pub name: String,
    pub clone_url: String,
}

/// Listing is all-or-nothing: any page failure fails the whole listing and
/// the job attempt, which the coordinator may retry as a whole.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("error fetching repositories: {0}")]
    Api(String),
    #[error("repository listing request failed: {0}")]
    Transport(String),
}

/// Page through the provider's repository listing until an empty page,
/// accumulating every repository in order. The credential travels in the
/// Authorization header only.
pub async fn list_repos(
    client: &Client,
    api_base: &str,
    token: &str,
) -> Result<Vec<RepoSummary>, ProviderError> {
    let url = format!("{}/user/repos", api_base.trim_end_matches('/'));
    let mut repos = Vec::new();
    let mut page: u32 = 1;

    loop {
        let response = client
            .get(&url)
            .query(&[("page", page), ("per_page", PER_PAGE)])
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/vnd.github.v3+json")
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.without_url().to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ProviderError::Transport(e.without_url().to_string()))?;

        if !status.is_success() {
            return Err(ProviderError::Api(provider_message(status.as_u16(), &body)));
        }

        let page_repos: Vec<RepoSummary> = serde_json::from_slice(&body)
            .map_err(|e| ProviderError::Api(format!("unexpected listing response: {e}")))?;

        if page_repos.is_empty() {
            break;
        }
        repos.extend(page_repos);
        page += 1;
    }

    Ok(repos)
}

/// Pull the provider's own "message" field out of an error body when there
/// is one, falling back to the HTTP status.
fn provider_message(status: u16, body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str().map(String::from)))
        .unwrap_or_else(|| format!("provider returned status {status}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_message_prefers_body_message() {
        let body = br#"{"message": "Bad credentials"}"#;
        assert_eq!(provider_message(401, body), "Bad credentials");
    }

    #[test]
    fn provider_message_falls_back_to_status() {
        assert_eq!(
            provider_message(502, b"<html>gateway</html>"),
            "provider returned status 502"
        );
        assert_eq!(provider_message(500, br#"{"ok": true}"#), "provider returned status 500");
    }

    #[test]
    fn repo_page_deserializes_and_ignores_extra_fields() {
        let body = r#"[
            {"name": "alpha", "clone_url": "https://example.com/u/alpha.git", "fork": false},
            {"name": "beta", "clone_url": "https://example.com/u/beta.git", "stargazers_count": 3}
        ]"#;
        let page: Vec<RepoSummary> = serde_json::from_str(body).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].name, "alpha");
        assert_eq!(page[1].clone_url, "https://example.com/u/beta.git");
    }

    #[test]
    fn empty_page_deserializes() {
        let page: Vec<RepoSummary> = serde_json::from_str("[]").unwrap();
        assert!(page.is_empty());
    }
}
