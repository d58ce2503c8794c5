mod common;

use locflow::jobs::{cutoff_hours, AttemptsRepo, JobsRepo, MaintenanceRepo};
use serial_test::serial;
use uuid::Uuid;

async fn age_job(pool: &sqlx::PgPool, job_id: Uuid, status: &str, hours_old: i64) {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = $2,
            updated_at = now() - ($3::bigint * interval '1 hour')
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(status)
    .bind(hours_old)
    .execute(pool)
    .await
    .unwrap();
}

#[tokio::test]
#[serial]
async fn succeeded_jobs_are_purged_with_their_attempts() {
    let Some(pool) = common::try_setup().await else {
        return;
    };
    let jobs = JobsRepo::new(pool.clone());
    let attempts = AttemptsRepo::new(pool.clone());
    let maintenance = MaintenanceRepo::new(pool.clone());

    let old_id = common::insert_job(&pool, "clone-repos", 3).await;
    let fresh_id = common::insert_job(&pool, "clone-repos", 3).await;
    attempts.start_attempt(old_id, "worker-a").await.unwrap();

    age_job(&pool, old_id, "succeeded", 48).await;
    age_job(&pool, fresh_id, "succeeded", 1).await;

    let purged = maintenance
        .purge_succeeded_older_than(cutoff_hours(24), 500)
        .await
        .unwrap();
    assert_eq!(purged, 1);

    assert!(jobs.get_job(old_id).await.unwrap().is_none());
    assert!(jobs.get_job(fresh_id).await.unwrap().is_some());

    // Attempt rows follow the job out (FK cascade).
    let left = attempts.list_attempts_for_job(old_id).await.unwrap();
    assert!(left.is_empty());
}

#[tokio::test]
#[serial]
async fn dlq_jobs_outlive_succeeded_ones() {
    let Some(pool) = common::try_setup().await else {
        return;
    };
    let jobs = JobsRepo::new(pool.clone());
    let maintenance = MaintenanceRepo::new(pool.clone());

    let dlq_recent = common::insert_job(&pool, "send-report", 3).await;
    let dlq_ancient = common::insert_job(&pool, "send-report", 3).await;
    age_job(&pool, dlq_recent, "dlq", 48).await;
    age_job(&pool, dlq_ancient, "dlq", 24 * 8).await;

    // 48h-old DLQ entry survives the succeeded window...
    let purged = maintenance
        .purge_succeeded_older_than(cutoff_hours(24), 500)
        .await
        .unwrap();
    assert_eq!(purged, 0);

    // ...and only week-old entries fall to the DLQ window.
    let purged = maintenance
        .purge_dlq_older_than(cutoff_hours(24 * 7), 500)
        .await
        .unwrap();
    assert_eq!(purged, 1);

    assert!(jobs.get_job(dlq_recent).await.unwrap().is_some());
    assert!(jobs.get_job(dlq_ancient).await.unwrap().is_none());
}
