use locflow::api;
use locflow::config::Config;
use locflow::db;
use locflow::jobs::retry::RetryConfig;
use locflow::jobs::{
    cutoff_hours, AttemptsRepo, FailureOutcome, JobsRepo, MaintenanceRepo, JobRunner, NotifyPayload,
    Stage,
};
use locflow::pipeline::Notifier;

use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod handlers;
use handlers::{build_registry, HandlerRegistry, JobContext, JobError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = Config::from_env()?;

    tracing::info!(
        worker_id = %cfg.worker_id,
        clone_workers = cfg.clone_workers,
        count_workers = cfg.count_workers,
        notify_workers = cfg.notify_workers,
        lease_seconds = cfg.lease_seconds,
        max_attempts = cfg.max_attempts,
        storage_root = %cfg.storage_root.display(),
        intake = %cfg.intake_addr.clone().unwrap_or_else(|| "disabled".into()),
        "locflow worker starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let jobs_repo = JobsRepo::new(pool.clone());
    let attempts_repo = AttemptsRepo::new(pool.clone());
    let maintenance_repo = MaintenanceRepo::new(pool.clone());
    let runner = JobRunner::new(
        jobs_repo.clone(),
        attempts_repo.clone(),
        RetryConfig::default(),
    );

    let http = reqwest::Client::builder()
        .user_agent("locflow")
        .timeout(Duration::from_secs(30))
        .build()?;

    let registry = build_registry();
    let ctx = JobContext {
        jobs: jobs_repo.clone(),
        http: http.clone(),
        notifier: Notifier::new(&cfg, http),
        storage_root: cfg.storage_root.clone(),
        github_api_base: cfg.github_api_base.clone(),
        max_attempts: cfg.max_attempts,
    };

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    // ---- Intake + inspection API ----
    if let Some(addr) = cfg.intake_addr.clone() {
        let app = api::router(api::ApiState {
            jobs: jobs_repo.clone(),
            max_attempts: cfg.max_attempts,
        });
        let token = shutdown.clone();
        tasks.spawn(async move {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!(%addr, "intake api listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await?;
            Ok::<(), anyhow::Error>(())
        });
    }

    // ---- Lock reaper: replay jobs a crashed worker left leased ----
    {
        let jobs = jobs_repo.clone();
        let token = shutdown.clone();
        let interval = Duration::from_millis(cfg.reap_interval_ms);
        tasks.spawn(async move {
            loop {
                match jobs.reap_expired_locks().await {
                    Ok(n) if n > 0 => tracing::info!(reaped = n, "requeued expired leases"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "lease reap failed"),
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            Ok::<(), anyhow::Error>(())
        });
    }

    // ---- Retention maintenance ----
    {
        let maintenance = maintenance_repo.clone();
        let token = shutdown.clone();
        let interval = Duration::from_secs(cfg.maintenance_interval_secs);
        let keep_succeeded_hours = cfg.keep_succeeded_hours;
        let keep_dlq_hours = cfg.keep_dlq_hours;
        tasks.spawn(async move {
            loop {
                match maintenance
                    .purge_succeeded_older_than(cutoff_hours(keep_succeeded_hours), 500)
                    .await
                {
                    Ok(n) if n > 0 => tracing::info!(purged = n, "purged succeeded jobs"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "succeeded purge failed"),
                }
                match maintenance
                    .purge_dlq_older_than(cutoff_hours(keep_dlq_hours), 500)
                    .await
                {
                    Ok(n) if n > 0 => tracing::info!(purged = n, "purged dead-lettered jobs"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "dlq purge failed"),
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            Ok::<(), anyhow::Error>(())
        });
    }

    // ---- Stage worker pools ----
    let pools: [(Stage, usize); 3] = [
        (Stage::Clone, cfg.clone_workers),
        (Stage::Count, cfg.count_workers),
        (Stage::Notify, cfg.notify_workers),
    ];

    for (stage, size) in pools {
        for n in 0..size {
            let worker_id = format!("{}:{}:{}", cfg.worker_id, stage.queue(), n + 1);
            let loop_ctx = StageLoop {
                stage,
                worker_id,
                jobs: jobs_repo.clone(),
                attempts: attempts_repo.clone(),
                runner: runner.clone(),
                registry: registry.clone(),
                ctx: ctx.clone(),
                lease_seconds: cfg.lease_seconds,
                max_attempts: cfg.max_attempts,
                shutdown: shutdown.clone(),
            };
            tasks.spawn(loop_ctx.run());
        }
    }

    // ---- Graceful shutdown: stop leasing, drain in-flight, then exit ----
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining workers");
    shutdown.cancel();

    let grace = Duration::from_secs(cfg.shutdown_grace_secs);
    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "task finished with error"),
                Err(e) => tracing::warn!(error = %e, "task panicked"),
            }
        }
    })
    .await;

    if drained.is_err() {
        tracing::warn!(grace_secs = cfg.shutdown_grace_secs, "drain deadline hit, aborting remaining tasks");
        tasks.shutdown().await;
    }

    tracing::info!("locflow worker stopped");
    Ok(())
}

/// Recipient fields shared by the clone and count payloads, pulled out of
/// the raw payload when a dead-lettered job still owes the user a message.
#[derive(Deserialize)]
struct TerminalTarget {
    user_id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    run_id: Option<uuid::Uuid>,
}

/// A clone/count job that dead-letters leaves its run workspace behind;
/// the count stage that would have removed it never runs.
async fn cleanup_dead_letter_workspace(storage_root: &std::path::Path, target: &TerminalTarget) {
    if let Some(run_id) = target.run_id {
        let workspace = locflow::pipeline::run_workspace(storage_root, &target.user_id, run_id);
        locflow::pipeline::cleanup(&workspace).await;
    }
}

struct StageLoop {
    stage: Stage,
    worker_id: String,
    jobs: JobsRepo,
    attempts: AttemptsRepo,
    runner: JobRunner,
    registry: Arc<HandlerRegistry>,
    ctx: JobContext,
    lease_seconds: i64,
    max_attempts: i32,
    shutdown: CancellationToken,
}

impl StageLoop {
    async fn run(self) -> anyhow::Result<()> {
        let queue = self.stage.queue();
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let leased = match self
                .jobs
                .lease_one_job(queue, &self.worker_id, self.lease_seconds)
                .await
            {
                Ok(leased) => leased,
                Err(e) => {
                    tracing::warn!(worker = %self.worker_id, error = %e, "lease failed");
                    self.idle(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let Some(job) = leased else {
                self.idle(Duration::from_millis(250)).await;
                continue;
            };

            if let Err(e) = self.process(job).await {
                // Book-keeping failure (db down mid-job); the lease reaper
                // will replay the job once the lock expires.
                tracing::warn!(worker = %self.worker_id, error = %e, "job bookkeeping failed");
                self.idle(Duration::from_secs(1)).await;
            }
        }
        Ok(())
    }

    async fn process(&self, job: locflow::jobs::Job) -> anyhow::Result<()> {
        let attempt = self.attempts.start_attempt(job.id, &self.worker_id).await?;

        tracing::debug!(
            worker = %self.worker_id,
            job_id = %job.id,
            attempt_no = attempt.attempt_no,
            "running job"
        );

        // Keep the lease ahead of the clock while the handler runs, so a
        // legitimately slow job is never reaped and double-executed. The
        // reaper only ever requeues jobs whose worker stopped heartbeating.
        let heartbeat = {
            let jobs = self.jobs.clone();
            let worker_id = self.worker_id.clone();
            let job_id = job.id;
            let lease_seconds = self.lease_seconds;
            let every = Duration::from_secs((lease_seconds.max(3) as u64) / 3);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(every).await;
                    match jobs.extend_lease(job_id, &worker_id, lease_seconds).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::warn!(worker = %worker_id, job_id = %job_id, "lease lost mid-job");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(worker = %worker_id, job_id = %job_id, error = %e, "lease heartbeat failed");
                        }
                    }
                }
            })
        };

        let start = Instant::now();
        let result: Result<(), JobError> = match self.registry.handler_for(&job.queue) {
            Some(entry) => entry.run(&job, &self.ctx).await,
            None => Err(JobError::new(
                "UNKNOWN_QUEUE",
                format!("no handler for queue={}", job.queue),
            )),
        };
        let latency_ms = start.elapsed().as_millis() as i32;
        heartbeat.abort();

        match result {
            Ok(()) => {
                self.runner
                    .on_success(job.id, attempt.id, &self.worker_id, latency_ms)
                    .await?;
                tracing::debug!(worker = %self.worker_id, job_id = %job.id, latency_ms, "job succeeded");
            }
            Err(err) => {
                let outcome = self
                    .runner
                    .on_failure(
                        job.id,
                        attempt.id,
                        &self.worker_id,
                        latency_ms,
                        err.code,
                        &err.message,
                        attempt.attempt_no,
                        job.max_attempts,
                    )
                    .await?;

                match outcome {
                    FailureOutcome::Rescheduled { next_run_at } => {
                        tracing::warn!(
                            worker = %self.worker_id,
                            job_id = %job.id,
                            code = err.code,
                            attempt_no = attempt.attempt_no,
                            %next_run_at,
                            "job failed, retry scheduled"
                        );
                    }
                    FailureOutcome::DeadLettered { reason_code } => {
                        tracing::error!(
                            worker = %self.worker_id,
                            job_id = %job.id,
                            code = err.code,
                            reason = reason_code,
                            attempt_no = attempt.attempt_no,
                            "job dead-lettered"
                        );
                        self.notify_dead_letter(&job, &err).await;
                    }
                }
            }
        }

        Ok(())
    }

    /// One terminal notification per run: a clone/count job that exhausts
    /// its budget still owes the user an error report. A dead-lettered
    /// notify job is the accepted silent degradation.
    async fn notify_dead_letter(&self, job: &locflow::jobs::Job, err: &JobError) {
        if self.stage == Stage::Notify {
            return;
        }

        let target: TerminalTarget = match serde_json::from_value(job.payload_json.clone()) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "cannot notify for dead-lettered job");
                return;
            }
        };

        cleanup_dead_letter_workspace(&self.ctx.storage_root, &target).await;

        let payload = NotifyPayload {
            user_id: target.user_id,
            email: target.email,
            total_lines: 0,
            error: Some(err.message.clone()),
        };

        if let Err(e) = self
            .jobs
            .enqueue_stage(Stage::Notify, &payload, self.max_attempts)
            .await
        {
            tracing::warn!(job_id = %job.id, error = %e, "failed to enqueue dead-letter notification");
        }
    }

    async fn idle(&self, dur: Duration) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(dur) => {}
        }
    }
}
