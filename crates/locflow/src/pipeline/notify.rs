use crate::config::Config;
use crate::jobs::model::NotifyPayload;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;

/// Retryable up to the notify job's own budget; after that the degradation
/// is logged and accepted.
#[derive(Debug, Error)]
#[error("notification delivery failed: {0}")]
pub struct DeliveryError(pub String);

#[derive(Serialize)]
struct OutboundEmail<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html: String,
}

/// Delivers the terminal report through the external email sink.
#[derive(Clone)]
pub struct Notifier {
    client: Client,
    api_url: String,
    api_key: String,
    from: String,
    fallback_to: String,
}

impl Notifier {
    pub fn new(cfg: &Config, client: Client) -> Self {
        Self {
            client,
            api_url: cfg.notify_api_url.clone(),
            api_key: cfg.notify_api_key.clone(),
            from: cfg.notify_from.clone(),
            fallback_to: cfg.notify_fallback_to.clone(),
        }
    }

    pub async fn send_report(&self, payload: &NotifyPayload) -> Result<(), DeliveryError> {
        let to = self.recipient(payload);
        let email = OutboundEmail {
            from: &self.from,
            to,
            subject: "Your total lines of code report",
            html: render_report(payload),
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&email)
            .send()
            .await
            .map_err(|e| DeliveryError(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail: String = body.chars().take(200).collect();
            return Err(DeliveryError(format!("sink returned {status}: {detail}")));
        }

        tracing::info!(user_id = %payload.user_id, to, "report delivered");
        Ok(())
    }

    fn recipient<'a>(&'a self, payload: &'a NotifyPayload) -> &'a str {
        payload
            .email
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .unwrap_or(&self.fallback_to)
    }
}

fn render_report(payload: &NotifyPayload) -> String {
    match &payload.error {
        Some(error) => format!(
            "<h2>Total lines of code</h2>\
             <p>Your code analysis could not be completed: {error}</p>\
             <p>Please try again later.</p>",
        ),
        None => format!(
            "<h2>Total lines of code</h2>\
             <p>Your code analysis has finished.</p>\
             <h3>{} lines written</h3>\
             <p>Thank you for waiting!</p>",
            payload.total_lines
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(email: Option<&str>, total: u64, error: Option<&str>) -> NotifyPayload {
        NotifyPayload {
            user_id: "42".into(),
            email: email.map(String::from),
            total_lines: total,
            error: error.map(String::from),
        }
    }

    fn notifier() -> Notifier {
        Notifier {
            client: Client::new(),
            api_url: "http://localhost:0".into(),
            api_key: String::new(),
            from: "reports@locflow.local".into(),
            fallback_to: "ops@locflow.local".into(),
        }
    }

    #[test]
    fn report_body_contains_the_total() {
        let body = render_report(&payload(None, 12345, None));
        assert!(body.contains("12345 lines written"));
    }

    #[test]
    fn report_body_surfaces_the_error() {
        let body = render_report(&payload(None, 0, Some("workspace storage/42 is missing")));
        assert!(body.contains("could not be completed"));
        assert!(body.contains("workspace storage/42 is missing"));
        assert!(!body.contains("lines written"));
    }

    #[test]
    fn recipient_falls_back_when_email_is_absent_or_blank() {
        let n = notifier();
        assert_eq!(n.recipient(&payload(Some("me@example.com"), 0, None)), "me@example.com");
        assert_eq!(n.recipient(&payload(Some("   "), 0, None)), "ops@locflow.local");
        assert_eq!(n.recipient(&payload(None, 0, None)), "ops@locflow.local");
    }
}
