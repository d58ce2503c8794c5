use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One durable unit of work. Owned by the queue substrate for its lifetime;
/// the payload is opaque here and interpreted by the stage handler.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub payload_json: Value,
    pub run_at: DateTime<Utc>,
    pub status: String,
    pub max_attempts: i32,

    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,

    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,

    pub dlq_reason_code: Option<String>,
    pub dlq_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: String,
    pub payload_json: Value,
    pub run_at: DateTime<Utc>,
    pub max_attempts: i32,
}

pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Dlq,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Dlq => "dlq",
        }
    }
}

/// The three pipeline stages, each backed by its own queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Clone,
    Count,
    Notify,
}

impl Stage {
    pub fn queue(&self) -> &'static str {
        match self {
            Stage::Clone => "clone-repos",
            Stage::Count => "count-lines",
            Stage::Notify => "send-report",
        }
    }

    pub fn from_queue(queue: &str) -> Option<Stage> {
        match queue {
            "clone-repos" => Some(Stage::Clone),
            "count-lines" => Some(Stage::Count),
            "send-report" => Some(Stage::Notify),
            _ => None,
        }
    }
}

/// Payload for the clone stage. Carries the only copy of the credential;
/// it lives exactly as long as this job and is never logged.
#[derive(Clone, Serialize, Deserialize)]
pub struct ClonePayload {
    pub user_id: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub run_id: Uuid,
}

impl std::fmt::Debug for ClonePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClonePayload")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .field("email", &self.email)
            .field("run_id", &self.run_id)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountPayload {
    pub user_id: String,
    pub run_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Aggregation result handed to the notify stage; the terminal artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyPayload {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub total_lines: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
