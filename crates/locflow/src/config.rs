use std::path::PathBuf;

/// Runtime configuration, loaded once from the environment at startup and
/// passed explicitly to everything that needs it.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,

    /// Address for the intake + inspection API. `None` disables it.
    pub intake_addr: Option<String>,

    /// Root directory under which per-run workspaces are created.
    pub storage_root: PathBuf,

    pub lease_seconds: i64,
    pub max_attempts: i32,

    pub clone_workers: usize,
    pub count_workers: usize,
    pub notify_workers: usize,

    pub reap_interval_ms: u64,
    pub maintenance_interval_secs: u64,
    pub keep_succeeded_hours: i64,
    pub keep_dlq_hours: i64,

    pub github_api_base: String,

    pub notify_api_url: String,
    pub notify_api_key: String,
    pub notify_from: String,
    pub notify_fallback_to: String,

    pub migrate_on_startup: bool,
    pub shutdown_grace_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let worker_id = env_or_fallback("LOCFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let intake_addr = env_or_fallback("LOCFLOW_INTAKE_ADDR", "INTAKE_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let storage_root = env_or_fallback("LOCFLOW_STORAGE_ROOT", "STORAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("storage"));

        let lease_seconds = env_or_fallback("LOCFLOW_LEASE_SECONDS", "LEASE_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);

        let max_attempts = env_or_fallback("LOCFLOW_MAX_ATTEMPTS", "MAX_ATTEMPTS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);

        let clone_workers = env_usize("LOCFLOW_CLONE_WORKERS").unwrap_or(3);
        let count_workers = env_usize("LOCFLOW_COUNT_WORKERS").unwrap_or(2);
        let notify_workers = env_usize("LOCFLOW_NOTIFY_WORKERS").unwrap_or(2);

        let reap_interval_ms = env_or_fallback("LOCFLOW_REAP_INTERVAL_MS", "REAP_INTERVAL_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(5_000);

        let maintenance_interval_secs = std::env::var("LOCFLOW_MAINTENANCE_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        // Completed jobs are kept for a day, dead-lettered ones for a week.
        let keep_succeeded_hours = std::env::var("LOCFLOW_KEEP_SUCCEEDED_HOURS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(24);
        let keep_dlq_hours = std::env::var("LOCFLOW_KEEP_DLQ_HOURS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(24 * 7);

        let github_api_base = env_or_fallback("LOCFLOW_GITHUB_API_BASE", "GITHUB_API_BASE")
            .unwrap_or_else(|| "https://api.github.com".to_string());

        let notify_api_url = env_or_fallback("LOCFLOW_NOTIFY_API_URL", "NOTIFY_API_URL")
            .unwrap_or_else(|| "https://api.resend.com/emails".to_string());
        let notify_api_key =
            env_or_fallback("LOCFLOW_NOTIFY_API_KEY", "NOTIFY_API_KEY").unwrap_or_default();
        let notify_from = env_or_fallback("LOCFLOW_NOTIFY_FROM", "NOTIFY_FROM")
            .unwrap_or_else(|| "reports@locflow.local".to_string());
        let notify_fallback_to = env_or_fallback("LOCFLOW_NOTIFY_FALLBACK_TO", "NOTIFY_FALLBACK_TO")
            .unwrap_or_else(|| "ops@locflow.local".to_string());

        let migrate_on_startup = env_bool("LOCFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        let shutdown_grace_secs = std::env::var("LOCFLOW_SHUTDOWN_GRACE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Ok(Self {
            database_url,
            worker_id,
            intake_addr,
            storage_root,
            lease_seconds,
            max_attempts,
            clone_workers,
            count_workers,
            notify_workers,
            reap_interval_ms,
            maintenance_interval_secs,
            keep_succeeded_hours,
            keep_dlq_hours,
            github_api_base,
            notify_api_url,
            notify_api_key,
            notify_from,
            notify_fallback_to,
            migrate_on_startup,
            shutdown_grace_secs,
        })
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|n| *n > 0)
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
