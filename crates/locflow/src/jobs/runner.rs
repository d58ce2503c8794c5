use crate::jobs::{
    attempts::AttemptsRepo,
    queue::JobsRepo,
    retry::{classify_error, next_delay_seconds, ErrorClass, RetryConfig},
};
use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, SeedableRng};
use uuid::Uuid;

/// What the coordinator decided to do with a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    Rescheduled { next_run_at: DateTime<Utc> },
    DeadLettered { reason_code: &'static str },
}

/// Applies the retry policy after each attempt: success acks the job;
/// failure either reschedules with backoff or dead-letters, and tells the
/// caller which, so terminal handoffs can happen deterministically.
#[derive(Clone)]
pub struct JobRunner {
    jobs: JobsRepo,
    attempts: AttemptsRepo,
    retry_cfg: RetryConfig,
}

impl JobRunner {
    pub fn new(jobs: JobsRepo, attempts: AttemptsRepo, retry_cfg: RetryConfig) -> Self {
        Self {
            jobs,
            attempts,
            retry_cfg,
        }
    }

    pub async fn on_success(
        &self,
        job_id: Uuid,
        attempt_id: Uuid,
        worker_id: &str,
        latency_ms: i32,
    ) -> anyhow::Result<()> {
        self.attempts
            .finish_succeeded(attempt_id, latency_ms)
            .await?;
        self.jobs.mark_succeeded(job_id, worker_id).await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn on_failure(
        &self,
        job_id: Uuid,
        attempt_id: Uuid,
        worker_id: &str,
        latency_ms: i32,
        error_code: &str,
        error_message: &str,
        attempt_no: i32,
        max_attempts: i32,
    ) -> anyhow::Result<FailureOutcome> {
        // Close out the attempt row first (audit trail).
        self.attempts
            .finish_failed(attempt_id, latency_ms, error_code, error_message)
            .await?;

        let class = classify_error(error_code);
        let can_retry = class == ErrorClass::Retryable && attempt_no < max_attempts;

        if can_retry {
            let mut rng = StdRng::from_entropy();
            let delay_secs = next_delay_seconds(attempt_no, &self.retry_cfg, &mut rng);
            let next_run_at = Utc::now() + chrono::Duration::seconds(delay_secs);

            self.jobs
                .reschedule_for_retry(
                    job_id,
                    worker_id,
                    next_run_at,
                    Some(error_code),
                    Some(error_message),
                )
                .await?;

            Ok(FailureOutcome::Rescheduled { next_run_at })
        } else {
            let reason_code = match class {
                ErrorClass::NonRetryable => "NON_RETRYABLE",
                ErrorClass::Retryable => "MAX_ATTEMPTS_EXCEEDED",
            };

            self.jobs
                .mark_dlq(
                    job_id,
                    worker_id,
                    reason_code,
                    Some(error_code),
                    Some(error_message),
                )
                .await?;

            Ok(FailureOutcome::DeadLettered { reason_code })
        }
    }
}
