use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

/// Retention: completed jobs are purged quickly, dead-lettered jobs are
/// kept longer for auditing. Attempt rows go with the job (FK cascade).
#[derive(Clone)]
pub struct MaintenanceRepo {
    pool: PgPool,
}

impl MaintenanceRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn purge_succeeded_older_than(
        &self,
        cutoff: DateTime<Utc>,
        batch: i64,
    ) -> anyhow::Result<u64> {
        self.purge_status_older_than("succeeded", cutoff, batch)
            .await
    }

    pub async fn purge_dlq_older_than(
        &self,
        cutoff: DateTime<Utc>,
        batch: i64,
    ) -> anyhow::Result<u64> {
        self.purge_status_older_than("dlq", cutoff, batch).await
    }

    async fn purge_status_older_than(
        &self,
        status: &str,
        cutoff: DateTime<Utc>,
        batch: i64,
    ) -> anyhow::Result<u64> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE id IN (
                SELECT id
                FROM jobs
                WHERE status = $1
                  AND updated_at < $2
                ORDER BY updated_at ASC
                LIMIT $3
            )
            "#,
        )
        .bind(status)
        .bind(cutoff)
        .bind(batch)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(deleted)
    }
}

/// Convenience: compute cutoff like "now - N hours".
pub fn cutoff_hours(hours: i64) -> DateTime<Utc> {
    Utc::now() - Duration::hours(hours)
}
