use std::env;
use std::time::Duration;

use crate::services::health_monitor::MonitorSettings;
use crate::services::sync_engine::EngineSettings;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub environment: String,
    pub api_prefix: String,
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub database_url: Option<String>,
    pub db_pool_max_connections: u32,
    pub db_pool_min_connections: u32,
    pub db_pool_acquire_timeout_seconds: u64,
    pub db_pool_idle_timeout_seconds: u64,
    pub sync_transaction_timeout_ms: u64,
    pub sync_log_capacity: usize,
    pub sync_monitor_enabled: bool,
    pub sync_monitor_interval_seconds: u64,
    pub sync_stale_pending_minutes: i64,
    pub sync_pending_threshold: usize,
    pub sync_auto_fix_enabled: bool,
    pub run_migrations_on_startup: bool,
    pub stripe_webhook_secret: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            app_name: env_or("APP_NAME", "Lease Sync API"),
            environment: env_or("ENVIRONMENT", "development"),
            api_prefix: normalize_prefix(&env_or("API_PREFIX", "/v1")),
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse_or("PORT", 8000),
            cors_origins: parse_csv(&env_or("CORS_ORIGINS", "http://localhost:3000")),
            database_url: env_opt("DATABASE_URL"),
            db_pool_max_connections: env_parse_or("DB_POOL_MAX_CONNECTIONS", 5),
            db_pool_min_connections: env_parse_or("DB_POOL_MIN_CONNECTIONS", 1),
            db_pool_acquire_timeout_seconds: env_parse_or("DB_POOL_ACQUIRE_TIMEOUT_SECONDS", 5),
            db_pool_idle_timeout_seconds: env_parse_or("DB_POOL_IDLE_TIMEOUT_SECONDS", 600),
            sync_transaction_timeout_ms: env_parse_or("SYNC_TRANSACTION_TIMEOUT_MS", 5000),
            sync_log_capacity: env_parse_or("SYNC_LOG_CAPACITY", 1000),
            sync_monitor_enabled: env_parse_bool_or("SYNC_MONITOR_ENABLED", true),
            sync_monitor_interval_seconds: env_parse_or("SYNC_MONITOR_INTERVAL_SECONDS", 300),
            sync_stale_pending_minutes: env_parse_or("SYNC_STALE_PENDING_MINUTES", 30),
            sync_pending_threshold: env_parse_or("SYNC_PENDING_THRESHOLD", 10),
            sync_auto_fix_enabled: env_parse_bool_or("SYNC_AUTO_FIX_ENABLED", true),
            run_migrations_on_startup: env_parse_bool_or("RUN_MIGRATIONS_ON_STARTUP", false),
            stripe_webhook_secret: env_opt("STRIPE_WEBHOOK_SECRET"),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.trim().eq_ignore_ascii_case("production")
    }

    /// The in-memory ledger is a development convenience only.
    pub fn memory_store_allowed(&self) -> bool {
        !self.is_production()
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            transaction_timeout: Duration::from_millis(self.sync_transaction_timeout_ms.max(1)),
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            interval: Duration::from_secs(self.sync_monitor_interval_seconds.max(1)),
            stale_pending_after: chrono::Duration::minutes(self.sync_stale_pending_minutes.max(0)),
            pending_sync_threshold: self.sync_pending_threshold,
            auto_fix: self.sync_auto_fix_enabled,
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    env_opt(key)
        .and_then(|raw| raw.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_parse_bool_or(key: &str, default: bool) -> bool {
    parse_bool(env_opt(key).as_deref()).unwrap_or(default)
}

fn parse_bool(raw: Option<&str>) -> Option<bool> {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        Some("1" | "true" | "yes" | "on") => Some(true),
        Some("0" | "false" | "no" | "off") => Some(false),
        _ => None,
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn normalize_prefix(raw: &str) -> String {
    let mut prefix = raw.trim().to_string();
    if prefix.is_empty() {
        return "/v1".to_string();
    }
    if !prefix.starts_with('/') {
        prefix.insert(0, '/');
    }
    while prefix.ends_with('/') && prefix.len() > 1 {
        prefix.pop();
    }
    prefix
}
