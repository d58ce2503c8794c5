use crate::api::models::JobListItem;
use crate::jobs::model::{Job, JobStatus, NewJob, Stage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

/// Durable queue primitives over the `jobs` table: enqueue, lease,
/// acknowledge, fail. One shared handle per process, cloned into each worker.
#[derive(Clone)]
pub struct JobsRepo {
    pool: PgPool,
}

impl JobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ----------------------------
    // Enqueue
    // ----------------------------

    /// Serialize a typed stage payload and enqueue it for immediate pickup.
    /// Payloads are validated by construction: only the per-stage schema
    /// types can be handed in here.
    pub async fn enqueue_stage<P: Serialize>(
        &self,
        stage: Stage,
        payload: &P,
        max_attempts: i32,
    ) -> anyhow::Result<Uuid> {
        self.enqueue(NewJob {
            queue: stage.queue().to_string(),
            payload_json: serde_json::to_value(payload)?,
            run_at: Utc::now(),
            max_attempts,
        })
        .await
    }

    pub async fn enqueue(&self, job: NewJob) -> anyhow::Result<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (queue, payload_json, run_at, status, max_attempts)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&job.queue)
        .bind(&job.payload_json)
        .bind(job.run_at)
        .bind(JobStatus::Queued.as_str())
        .bind(job.max_attempts)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn get_job(&self, job_id: Uuid) -> anyhow::Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// Recent jobs, optionally filtered by queue/status. Inspection only.
    pub async fn list_jobs(
        &self,
        queue: Option<&str>,
        status: Option<&str>,
        limit: i64,
    ) -> anyhow::Result<Vec<JobListItem>> {
        let limit = limit.clamp(1, 500);

        let rows = sqlx::query_as::<_, JobListItem>(
            r#"
            SELECT
                id, queue, status, run_at, max_attempts,
                last_error_code, last_error_message,
                dlq_reason_code,
                created_at, updated_at
            FROM jobs
            WHERE ($1::text IS NULL OR queue = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#,
        )
        .bind(queue)
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ----------------------------
    // Leasing
    // ----------------------------

    /// Lease exactly one runnable job from `queue` for this worker.
    ///
    /// Correctness: SELECT ... FOR UPDATE SKIP LOCKED inside one transaction,
    /// so no two workers can claim the same job. The lease expires after
    /// `lease_seconds`; the reaper requeues anything a dead worker held.
    pub async fn lease_one_job(
        &self,
        queue: &str,
        worker_id: &str,
        lease_seconds: i64,
    ) -> anyhow::Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        let candidate = sqlx::query_as::<_, Job>(
            r#"
            SELECT *
            FROM jobs
            WHERE queue = $1
              AND status = 'queued'
              AND run_at <= now()
            ORDER BY run_at ASC, created_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .bind(queue)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };

        let leased = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET status = 'running',
                locked_by = $2,
                locked_at = now(),
                lock_expires_at = now() + ($3::int * interval '1 second'),
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(worker_id)
        .bind(lease_seconds)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(leased))
    }

    /// Push the lease forward while a long handler is still running.
    /// Returns false when the caller no longer holds the job: the lease
    /// expired and the reaper already requeued it for someone else.
    pub async fn extend_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_seconds: i64,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET lock_expires_at = now() + ($3::int * interval '1 second'),
                updated_at = now()
            WHERE id = $1
              AND locked_by = $2
              AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(lease_seconds)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// Requeue running jobs whose lease expired (worker crash replay).
    pub async fn reap_expired_locks(&self) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued',
                locked_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE status = 'running'
              AND lock_expires_at IS NOT NULL
              AND lock_expires_at < now()
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    // ----------------------------
    // State transitions
    // ----------------------------

    pub async fn mark_succeeded(&self, job_id: Uuid, worker_id: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'succeeded',
                locked_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Same job id, later run_at: the retry path. The attempt number lives
    /// in job_attempts and increments on the next lease. Guarded by
    /// locked_by so a worker whose lease was reaped cannot reschedule a
    /// job another worker now holds.
    pub async fn reschedule_for_retry(
        &self,
        job_id: Uuid,
        worker_id: &str,
        next_run_at: DateTime<Utc>,
        last_error_code: Option<&str>,
        last_error_message: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued',
                run_at = $3,
                locked_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now(),
                last_error_code = $4,
                last_error_message = $5
            WHERE id = $1
              AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(next_run_at)
        .bind(last_error_code)
        .bind(last_error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_dlq(
        &self,
        job_id: Uuid,
        worker_id: &str,
        reason_code: &str,
        last_error_code: Option<&str>,
        last_error_message: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'dlq',
                dlq_reason_code = $3,
                dlq_at = now(),
                locked_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now(),
                last_error_code = $4,
                last_error_message = $5
            WHERE id = $1
              AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(reason_code)
        .bind(last_error_code)
        .bind(last_error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
