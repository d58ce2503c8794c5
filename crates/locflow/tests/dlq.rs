mod common;

use locflow::jobs::retry::RetryConfig;
use locflow::jobs::{AttemptsRepo, FailureOutcome, JobRunner, JobsRepo};
use serial_test::serial;

#[tokio::test]
#[serial]
async fn bad_payload_goes_straight_to_dlq() {
    let Some(pool) = common::try_setup().await else {
        return;
    };
    let jobs = JobsRepo::new(pool.clone());
    let attempts = AttemptsRepo::new(pool.clone());
    let runner = JobRunner::new(jobs.clone(), attempts.clone(), RetryConfig::default());

    let job_id = common::insert_job(&pool, "clone-repos", 5).await;
    let job = jobs
        .lease_one_job("clone-repos", "worker-a", 30)
        .await
        .unwrap()
        .unwrap();
    let attempt = attempts.start_attempt(job.id, "worker-a").await.unwrap();

    let outcome = runner
        .on_failure(
            job.id,
            attempt.id,
            "worker-a",
            5,
            "BAD_PAYLOAD",
            "missing field `token`",
            attempt.attempt_no,
            job.max_attempts,
        )
        .await
        .unwrap();

    assert_eq!(
        outcome,
        FailureOutcome::DeadLettered {
            reason_code: "NON_RETRYABLE"
        }
    );

    let stored = jobs.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, "dlq");
    assert!(stored.dlq_at.is_some());
    assert_eq!(stored.dlq_reason_code.as_deref(), Some("NON_RETRYABLE"));
    assert_eq!(stored.last_error_code.as_deref(), Some("BAD_PAYLOAD"));
}

#[tokio::test]
#[serial]
async fn exhausted_attempts_dead_letter_and_stay_there() {
    let Some(pool) = common::try_setup().await else {
        return;
    };
    let jobs = JobsRepo::new(pool.clone());
    let attempts = AttemptsRepo::new(pool.clone());
    let runner = JobRunner::new(
        jobs.clone(),
        attempts.clone(),
        RetryConfig {
            base_seconds: 1,
            max_seconds: 60,
            jitter_pct: 0.0,
        },
    );

    let job_id = common::insert_job(&pool, "send-report", 2).await;

    // Attempt 1: retryable failure, rescheduled.
    let job = jobs
        .lease_one_job("send-report", "worker-a", 30)
        .await
        .unwrap()
        .unwrap();
    let attempt = attempts.start_attempt(job.id, "worker-a").await.unwrap();
    let outcome = runner
        .on_failure(
            job.id,
            attempt.id,
            "worker-a",
            5,
            "DELIVERY",
            "sink returned 503",
            attempt.attempt_no,
            job.max_attempts,
        )
        .await
        .unwrap();
    assert!(matches!(outcome, FailureOutcome::Rescheduled { .. }));

    common::force_runnable(&pool, job_id).await;

    // Attempt 2 hits max_attempts: dead-lettered.
    let job = jobs
        .lease_one_job("send-report", "worker-a", 30)
        .await
        .unwrap()
        .unwrap();
    let attempt = attempts.start_attempt(job.id, "worker-a").await.unwrap();
    assert_eq!(attempt.attempt_no, 2);
    let outcome = runner
        .on_failure(
            job.id,
            attempt.id,
            "worker-a",
            5,
            "DELIVERY",
            "sink returned 503",
            attempt.attempt_no,
            job.max_attempts,
        )
        .await
        .unwrap();
    assert_eq!(
        outcome,
        FailureOutcome::DeadLettered {
            reason_code: "MAX_ATTEMPTS_EXCEEDED"
        }
    );

    let stored = jobs.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, "dlq");

    // Dead-lettered jobs are never leased again.
    assert!(jobs
        .lease_one_job("send-report", "worker-a", 30)
        .await
        .unwrap()
        .is_none());
}
