use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

/// Connect to TEST_DATABASE_URL, run migrations, and start from a clean
/// slate. Returns None (and the caller skips) when the variable is unset,
/// so the suite passes on machines without a Postgres instance.
pub async fn try_setup() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let url = match std::env::var("TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("TEST_DATABASE_URL not set, skipping db-backed test");
            return None;
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE job_attempts, jobs RESTART IDENTITY CASCADE")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}

#[allow(dead_code)]
pub async fn insert_job(pool: &PgPool, queue: &str, max_attempts: i32) -> Uuid {
    sqlx::query_scalar(
        r#"
        INSERT INTO jobs (queue, payload_json, run_at, status, max_attempts)
        VALUES ($1, '{}'::jsonb, now(), 'queued', $2)
        RETURNING id
        "#,
    )
    .bind(queue)
    .bind(max_attempts)
    .fetch_one(pool)
    .await
    .expect("failed to insert job")
}

#[allow(dead_code)]
pub async fn force_runnable(pool: &PgPool, job_id: Uuid) {
    sqlx::query("UPDATE jobs SET run_at = now() WHERE id = $1")
        .bind(job_id)
        .execute(pool)
        .await
        .expect("failed to reset run_at");
}
