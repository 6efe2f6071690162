use std::str::FromStr;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde_json::{json, Value};

use crate::{
    error::{AppError, AppResult},
    schemas::{
        clamp_limit_in_range, validate_input, LeasePath, RecentErrorsQuery, StartMonitoringInput,
        SyncLeaseInput, SyncLogsQuery, SyncStatsQuery,
    },
    services::{
        consistency::ValidationResult, health_monitor::HealthReport,
        migration::{MigrationReport, MigrationStatus},
        sync_engine::SyncResult,
        sync_log::{FailurePatterns, StatsWindow, SyncStats},
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/leases/{lease_id}/sync", axum::routing::post(sync_lease))
        .route(
            "/leases/{lease_id}/consistency",
            axum::routing::get(lease_consistency),
        )
        .route("/sync/failures", axum::routing::get(sync_failures))
        .route("/sync/health-report", axum::routing::get(health_report))
        .route(
            "/sync/health-report/latest",
            axum::routing::get(latest_health_report),
        )
        .route(
            "/sync/monitoring/start",
            axum::routing::post(start_monitoring),
        )
        .route("/sync/monitoring/stop", axum::routing::post(stop_monitoring))
        .route("/sync/logs", axum::routing::get(sync_logs))
        .route("/sync/logs/errors", axum::routing::get(recent_errors))
        .route("/sync/logs/stats", axum::routing::get(sync_stats))
        .route("/sync/logs/patterns", axum::routing::get(failure_patterns))
        .route("/sync/migration/status", axum::routing::get(migration_status))
        .route("/sync/migration/up", axum::routing::post(migration_up))
        .route("/sync/migration/down", axum::routing::post(migration_down))
}

async fn sync_lease(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    payload: Option<Json<SyncLeaseInput>>,
) -> AppResult<Json<SyncResult>> {
    let options = payload.map(|Json(input)| input).unwrap_or_default();
    let result = state.engine.sync_lease(&path.lease_id, options.into()).await?;
    Ok(Json(result))
}

async fn lease_consistency(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
) -> AppResult<Json<ValidationResult>> {
    let result = state
        .engine
        .validate_lease_payment_consistency(&path.lease_id)
        .await?;
    Ok(Json(result))
}

async fn sync_failures(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let failures = state.monitor.detect_sync_failures().await?;
    Ok(Json(json!({ "data": failures })))
}

async fn health_report(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.monitor.generate_health_report().await)
}

async fn latest_health_report(State(state): State<AppState>) -> AppResult<Json<HealthReport>> {
    state
        .monitor
        .last_report()
        .map(Json)
        .ok_or_else(|| AppError::NotFound("No health report has been generated yet.".to_string()))
}

async fn start_monitoring(
    State(state): State<AppState>,
    payload: Option<Json<StartMonitoringInput>>,
) -> AppResult<Json<Value>> {
    let input = payload.map(|Json(input)| input).unwrap_or_default();
    validate_input(&input)?;

    let started = state
        .monitor
        .start(input.interval_seconds.map(Duration::from_secs));
    Ok(Json(json!({
        "started": started,
        "running": state.monitor.is_running(),
    })))
}

async fn stop_monitoring(State(state): State<AppState>) -> Json<Value> {
    let stopped = state.monitor.stop().await;
    Json(json!({
        "stopped": stopped,
        "running": state.monitor.is_running(),
    }))
}

async fn sync_logs(
    State(state): State<AppState>,
    Query(query): Query<SyncLogsQuery>,
) -> AppResult<Json<Value>> {
    validate_input(&query)?;
    let entries = state.sync_log.entries_for(&query.payment_id);
    Ok(Json(json!({ "data": entries })))
}

async fn recent_errors(
    State(state): State<AppState>,
    Query(query): Query<RecentErrorsQuery>,
) -> Json<Value> {
    let limit = clamp_limit_in_range(query.limit, 1, 500) as usize;
    Json(json!({ "data": state.sync_log.recent_errors(limit) }))
}

async fn sync_stats(
    State(state): State<AppState>,
    Query(query): Query<SyncStatsQuery>,
) -> AppResult<Json<SyncStats>> {
    let window = StatsWindow::from_str(&query.window)?;
    Ok(Json(state.sync_log.stats(window)))
}

async fn failure_patterns(State(state): State<AppState>) -> Json<FailurePatterns> {
    Json(state.sync_log.detect_failure_patterns())
}

async fn migration_status(State(state): State<AppState>) -> AppResult<Json<MigrationStatus>> {
    Ok(Json(state.migration.status().await?))
}

async fn migration_up(State(state): State<AppState>) -> AppResult<Json<MigrationReport>> {
    Ok(Json(state.migration.up().await?))
}

async fn migration_down(State(state): State<AppState>) -> AppResult<Json<MigrationReport>> {
    Ok(Json(state.migration.down().await?))
}
