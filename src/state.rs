use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;

use crate::{
    clock::{Clock, SystemClock},
    config::AppConfig,
    error::{AppError, AppResult},
    repository::{memory::MemoryStore, postgres::PgLedgerStore, LedgerStore},
    services::{
        health_monitor::HealthMonitor, migration::SchemaMigration, sync_engine::SyncEngine,
        sync_log::SyncLog,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn LedgerStore>,
    pub clock: Arc<dyn Clock>,
    pub sync_log: Arc<SyncLog>,
    pub migration: Arc<SchemaMigration>,
    pub engine: Arc<SyncEngine>,
    pub monitor: Arc<HealthMonitor>,
}

impl AppState {
    pub fn build(config: AppConfig) -> AppResult<Self> {
        let store: Arc<dyn LedgerStore> = match config.database_url.as_deref() {
            Some(database_url) => {
                let pool = PgPoolOptions::new()
                    .max_connections(config.db_pool_max_connections.max(1))
                    .min_connections(config.db_pool_min_connections)
                    .acquire_timeout(Duration::from_secs(config.db_pool_acquire_timeout_seconds))
                    .idle_timeout(Duration::from_secs(config.db_pool_idle_timeout_seconds))
                    .connect_lazy(database_url)
                    .map_err(|error| {
                        AppError::Internal(format!("Invalid DATABASE_URL: {error}"))
                    })?;
                Arc::new(PgLedgerStore::new(pool))
            }
            None if config.memory_store_allowed() => {
                tracing::warn!("DATABASE_URL is not set; using the in-memory ledger");
                Arc::new(MemoryStore::new())
            }
            None => {
                return Err(AppError::Internal(
                    "DATABASE_URL is required in production.".to_string(),
                ))
            }
        };
        Ok(Self::with_store(config, store, Arc::new(SystemClock)))
    }

    pub fn with_store(config: AppConfig, store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        let sync_log = Arc::new(SyncLog::new(config.sync_log_capacity, clock.clone()));
        let migration = Arc::new(SchemaMigration::new(store.clone(), clock.clone()));
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            clock.clone(),
            sync_log.clone(),
            migration.clone(),
            config.engine_settings(),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            store.clone(),
            engine.clone(),
            sync_log.clone(),
            migration.clone(),
            clock.clone(),
            config.monitor_settings(),
        ));

        Self {
            config: Arc::new(config),
            store,
            clock,
            sync_log,
            migration,
            engine,
            monitor,
        }
    }
}
