use locflow::jobs::model::{ClonePayload, CountPayload, Job, NotifyPayload, Stage};
use locflow::jobs::queue::JobsRepo;
use locflow::pipeline::{count_workspace, list_repos, materialize, run_workspace, CountError, Notifier};
use serde::Deserialize;
use std::{collections::HashMap, path::PathBuf, pin::Pin, sync::Arc, time::Duration};
use tokio::time::timeout;

pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
type HandlerFn =
    dyn for<'a> Fn(&'a Job, &'a JobContext) -> BoxFuture<'a, Result<(), JobError>> + Send + Sync;

/// Stage-handler failure with a stable code driving the retry classifier.
#[derive(Debug)]
pub struct JobError {
    pub code: &'static str,
    pub message: String,
}

impl JobError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Everything a stage handler needs, constructed once at startup and shared
/// by all worker pools. No process-wide singletons.
#[derive(Clone)]
pub struct JobContext {
    pub jobs: JobsRepo,
    pub http: reqwest::Client,
    pub notifier: Notifier,
    pub storage_root: PathBuf,
    pub github_api_base: String,
    pub max_attempts: i32,
}

#[derive(Clone)]
pub struct HandlerEntry {
    handler: Arc<HandlerFn>,
    timeout: Option<Duration>,
}

impl HandlerEntry {
    pub async fn run(&self, job: &Job, ctx: &JobContext) -> Result<(), JobError> {
        let fut = (self.handler)(job, ctx);
        match self.timeout {
            Some(dur) => match timeout(dur, fut).await {
                Ok(inner) => inner,
                Err(_) => Err(JobError::new(
                    "TIMEOUT",
                    format!("handler timeout after {}ms", dur.as_millis()),
                )),
            },
            None => fut.await,
        }
    }
}

/// One handler per stage queue; concurrency is bounded by the pool size.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, queue: &str, handler: F, timeout: Option<Duration>)
    where
        F: for<'a> Fn(&'a Job, &'a JobContext) -> BoxFuture<'a, Result<(), JobError>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(
            queue.to_string(),
            HandlerEntry {
                handler: Arc::new(handler),
                timeout,
            },
        );
    }

    pub fn handler_for(&self, queue: &str) -> Option<HandlerEntry> {
        self.handlers.get(queue).cloned()
    }
}

fn parse_payload<T: for<'de> Deserialize<'de>>(job: &Job) -> Result<T, JobError> {
    serde_json::from_value(job.payload_json.clone())
        .map_err(|e| JobError::new("BAD_PAYLOAD", e.to_string()))
}

fn boxed<'a, T>(fut: impl std::future::Future<Output = T> + Send + 'a) -> BoxFuture<'a, T> {
    Box::pin(fut)
}

fn clone_entry<'a>(job: &'a Job, ctx: &'a JobContext) -> BoxFuture<'a, Result<(), JobError>> {
    boxed(handle_clone(job, ctx))
}

fn count_entry<'a>(job: &'a Job, ctx: &'a JobContext) -> BoxFuture<'a, Result<(), JobError>> {
    boxed(handle_count(job, ctx))
}

fn notify_entry<'a>(job: &'a Job, ctx: &'a JobContext) -> BoxFuture<'a, Result<(), JobError>> {
    boxed(handle_notify(job, ctx))
}

pub fn build_registry() -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();

    registry.register(
        Stage::Clone.queue(),
        clone_entry,
        Some(Duration::from_secs(20 * 60)),
    );
    registry.register(
        Stage::Count.queue(),
        count_entry,
        Some(Duration::from_secs(10 * 60)),
    );
    registry.register(
        Stage::Notify.queue(),
        notify_entry,
        Some(Duration::from_secs(30)),
    );

    Arc::new(registry)
}

/// Clone stage: list every repository, materialize each into the run
/// workspace (skipping failures), then hand off to the count stage. An
/// empty listing short-circuits straight to the notifier.
async fn handle_clone(job: &Job, ctx: &JobContext) -> Result<(), JobError> {
    let payload: ClonePayload = parse_payload(job)?;

    let repos = list_repos(&ctx.http, &ctx.github_api_base, &payload.token)
        .await
        .map_err(|e| JobError::new("PROVIDER", e.to_string()))?;

    if repos.is_empty() {
        tracing::info!(user_id = %payload.user_id, "no repositories, notifying directly");
        ctx.jobs
            .enqueue_stage(
                Stage::Notify,
                &NotifyPayload {
                    user_id: payload.user_id,
                    email: payload.email,
                    total_lines: 0,
                    error: None,
                },
                ctx.max_attempts,
            )
            .await
            .map_err(|e| JobError::new("DB", e.to_string()))?;
        return Ok(());
    }

    let workspace = run_workspace(&ctx.storage_root, &payload.user_id, payload.run_id);
    let mut materialized = 0usize;

    for repo in &repos {
        match materialize(repo, &payload.token, &workspace).await {
            Ok(()) => materialized += 1,
            Err(e) => {
                // Per-repository failure: log, skip, keep going.
                tracing::warn!(repo = %repo.name, error = %e, "skipping repository");
            }
        }
    }

    tracing::info!(
        user_id = %payload.user_id,
        run_id = %payload.run_id,
        materialized,
        listed = repos.len(),
        "repositories materialized"
    );

    ctx.jobs
        .enqueue_stage(
            Stage::Count,
            &CountPayload {
                user_id: payload.user_id,
                run_id: payload.run_id,
                email: payload.email,
            },
            ctx.max_attempts,
        )
        .await
        .map_err(|e| JobError::new("DB", e.to_string()))?;

    Ok(())
}

/// Count stage: aggregate the total, clean the workspace whatever happened,
/// and enqueue exactly one notify job. A missing workspace (every clone
/// failed) becomes an error report, not a retry: a fresh attempt would find
/// the same nothing.
async fn handle_count(job: &Job, ctx: &JobContext) -> Result<(), JobError> {
    let payload: CountPayload = parse_payload(job)?;
    let workspace = run_workspace(&ctx.storage_root, &payload.user_id, payload.run_id);

    let counted = count_workspace(&workspace).await;
    locflow::pipeline::cleanup(&workspace).await;

    let notify = match counted {
        Ok(total_lines) => {
            tracing::info!(user_id = %payload.user_id, total_lines, "line count complete");
            NotifyPayload {
                user_id: payload.user_id,
                email: payload.email,
                total_lines,
                error: None,
            }
        }
        Err(e @ CountError::WorkspaceMissing(_)) => {
            tracing::warn!(user_id = %payload.user_id, error = %e, "count failed, reporting error");
            NotifyPayload {
                user_id: payload.user_id,
                email: payload.email,
                total_lines: 0,
                error: Some(e.to_string()),
            }
        }
    };

    ctx.jobs
        .enqueue_stage(Stage::Notify, &notify, ctx.max_attempts)
        .await
        .map_err(|e| JobError::new("DB", e.to_string()))?;

    Ok(())
}

async fn handle_notify(job: &Job, ctx: &JobContext) -> Result<(), JobError> {
    let payload: NotifyPayload = parse_payload(job)?;
    ctx.notifier
        .send_report(&payload)
        .await
        .map_err(|e| JobError::new("DELIVERY", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use locflow::config::Config;
    use serial_test::serial;
    use sqlx::postgres::PgPoolOptions;
    use sqlx::PgPool;
    use uuid::Uuid;

    async fn try_setup() -> Option<PgPool> {
        let _ = dotenvy::dotenv();

        let url = match std::env::var("TEST_DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                eprintln!("TEST_DATABASE_URL not set, skipping db-backed test");
                return None;
            }
        };

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .expect("failed to connect to TEST_DATABASE_URL");

        locflow::db::run_migrations(&pool)
            .await
            .expect("migrations failed");

        sqlx::query("TRUNCATE TABLE job_attempts, jobs RESTART IDENTITY CASCADE")
            .execute(&pool)
            .await
            .expect("truncate failed");

        Some(pool)
    }

    fn test_context(pool: PgPool, storage_root: PathBuf, api_base: String) -> JobContext {
        let http = reqwest::Client::new();
        let cfg = Config {
            database_url: String::new(),
            worker_id: "test-worker".into(),
            intake_addr: None,
            storage_root: storage_root.clone(),
            lease_seconds: 60,
            max_attempts: 3,
            clone_workers: 1,
            count_workers: 1,
            notify_workers: 1,
            reap_interval_ms: 1_000,
            maintenance_interval_secs: 3_600,
            keep_succeeded_hours: 24,
            keep_dlq_hours: 168,
            github_api_base: api_base.clone(),
            notify_api_url: "http://127.0.0.1:9/emails".into(),
            notify_api_key: "test-key".into(),
            notify_from: "reports@example.com".into(),
            notify_fallback_to: "ops@example.com".into(),
            migrate_on_startup: false,
            shutdown_grace_secs: 5,
        };

        JobContext {
            jobs: JobsRepo::new(pool),
            http: http.clone(),
            notifier: Notifier::new(&cfg, http),
            storage_root,
            github_api_base: api_base,
            max_attempts: 3,
        }
    }

    async fn fetch_job(jobs: &JobsRepo, id: Uuid) -> Job {
        jobs.get_job(id).await.unwrap().expect("job should exist")
    }

    async fn sole_notify_payload(jobs: &JobsRepo) -> NotifyPayload {
        let listed = jobs
            .list_jobs(Some(Stage::Notify.queue()), None, 10)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1, "expected exactly one notify job");
        let job = fetch_job(jobs, listed[0].id).await;
        serde_json::from_value(job.payload_json).unwrap()
    }

    #[test]
    fn registry_covers_every_stage() {
        let registry = build_registry();
        assert!(registry.handler_for(Stage::Clone.queue()).is_some());
        assert!(registry.handler_for(Stage::Count.queue()).is_some());
        assert!(registry.handler_for(Stage::Notify.queue()).is_some());
        assert!(registry.handler_for("no-such-queue").is_none());
    }

    #[tokio::test]
    #[serial]
    async fn count_job_reports_total_and_cleans_workspace() {
        let Some(pool) = try_setup().await else {
            return;
        };
        let storage = tempfile::tempdir().unwrap();
        let ctx = test_context(pool, storage.path().to_path_buf(), String::new());

        let run_id = Uuid::new_v4();
        let workspace = run_workspace(storage.path(), "user-9", run_id);
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::write(workspace.join("stray.txt"), "not a repository\n").unwrap();

        let job_id = ctx
            .jobs
            .enqueue_stage(
                Stage::Count,
                &CountPayload {
                    user_id: "user-9".into(),
                    run_id,
                    email: Some("me@example.com".into()),
                },
                3,
            )
            .await
            .unwrap();

        let job = fetch_job(&ctx.jobs, job_id).await;
        handle_count(&job, &ctx).await.unwrap();

        assert!(!workspace.exists(), "workspace should be cleaned after count");

        let notify = sole_notify_payload(&ctx.jobs).await;
        assert_eq!(notify.user_id, "user-9");
        assert_eq!(notify.total_lines, 0);
        assert!(notify.error.is_none());
    }

    #[tokio::test]
    #[serial]
    async fn count_job_with_missing_workspace_reports_error_once() {
        let Some(pool) = try_setup().await else {
            return;
        };
        let storage = tempfile::tempdir().unwrap();
        let ctx = test_context(pool, storage.path().to_path_buf(), String::new());

        let job_id = ctx
            .jobs
            .enqueue_stage(
                Stage::Count,
                &CountPayload {
                    user_id: "user-9".into(),
                    run_id: Uuid::new_v4(),
                    email: None,
                },
                3,
            )
            .await
            .unwrap();

        // Every clone failed: no workspace. Retrying would find the same
        // nothing, so the handler acks and reports the error instead.
        let job = fetch_job(&ctx.jobs, job_id).await;
        handle_count(&job, &ctx).await.unwrap();

        let notify = sole_notify_payload(&ctx.jobs).await;
        assert_eq!(notify.total_lines, 0);
        assert!(notify.error.is_some());
    }

    #[tokio::test]
    #[serial]
    async fn empty_listing_short_circuits_to_notify() {
        let Some(pool) = try_setup().await else {
            return;
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route(
            "/user/repos",
            axum::routing::get(|| async { axum::Json(serde_json::json!([])) }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let storage = tempfile::tempdir().unwrap();
        let ctx = test_context(
            pool,
            storage.path().to_path_buf(),
            format!("http://{addr}"),
        );

        let job_id = ctx
            .jobs
            .enqueue_stage(
                Stage::Clone,
                &ClonePayload {
                    user_id: "user-9".into(),
                    token: "tok-empty".into(),
                    email: Some("me@example.com".into()),
                    run_id: Uuid::new_v4(),
                },
                3,
            )
            .await
            .unwrap();

        let job = fetch_job(&ctx.jobs, job_id).await;
        handle_clone(&job, &ctx).await.unwrap();

        // No repositories: straight to the notifier, no count stage.
        let count_jobs = ctx
            .jobs
            .list_jobs(Some(Stage::Count.queue()), None, 10)
            .await
            .unwrap();
        assert!(count_jobs.is_empty());

        let notify = sole_notify_payload(&ctx.jobs).await;
        assert_eq!(notify.total_lines, 0);
        assert!(notify.error.is_none());
    }
}
