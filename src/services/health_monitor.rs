//! Periodic detection and repair of lease/payment drift.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::{
    clock::Clock,
    error::AppResult,
    models::{
        max_severity, IssueKind, Lease, Payment, Severity, SyncAction, SyncIssue, SyncOutcome,
        SyncStatus, BALANCE_TOLERANCE,
    },
    repository::LedgerStore,
    services::{
        consistency,
        migration::SchemaMigration,
        sync_engine::{SyncEngine, SyncOptions},
        sync_log::{StatsWindow, SyncLog},
    },
};

/// Pending counts above this multiple of the threshold escalate to high.
const PERFORMANCE_ESCALATION_FACTOR: usize = 5;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub stale_pending_after: chrono::Duration,
    pub pending_sync_threshold: usize,
    pub auto_fix: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            stale_pending_after: chrono::Duration::minutes(30),
            pending_sync_threshold: 10,
            auto_fix: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthMetrics {
    pub synced_payments: usize,
    pub pending_payments: usize,
    pub failed_payments: usize,
    pub success_rate_last_hour: f64,
    pub auto_fix_attempted: usize,
    pub auto_fix_succeeded: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub total_leases: usize,
    pub total_payments: usize,
    pub issues: Vec<SyncIssue>,
    pub metrics: HealthMetrics,
    pub recommendations: Vec<String>,
    /// Detectors that could not run.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaseSyncFailures {
    pub lease_id: String,
    pub issues: Vec<SyncIssue>,
}

struct MonitorLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct HealthMonitor {
    store: Arc<dyn LedgerStore>,
    engine: Arc<SyncEngine>,
    log: Arc<SyncLog>,
    migration: Arc<SchemaMigration>,
    clock: Arc<dyn Clock>,
    settings: MonitorSettings,
    last_report: Mutex<Option<HealthReport>>,
    runner: Mutex<Option<MonitorLoop>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn issue(
    kind: IssueKind,
    severity: Severity,
    description: String,
    lease_ids: Vec<String>,
    payment_ids: Vec<String>,
    auto_fixable: bool,
) -> SyncIssue {
    SyncIssue {
        kind,
        severity,
        description,
        lease_ids,
        payment_ids,
        auto_fixable,
    }
}

/// Failed payments and payments stuck in `pending`, one issue per lease and
/// kind.
pub fn sync_failure_issues(
    payments: &[Payment],
    now: DateTime<Utc>,
    stale_after: chrono::Duration,
) -> Vec<SyncIssue> {
    let mut failed: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    let mut stale: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for payment in payments {
        match payment.sync_status {
            Some(SyncStatus::Failed) => failed
                .entry(payment.lease_id.as_str())
                .or_default()
                .push(payment.id.clone()),
            Some(SyncStatus::Pending) => {
                let is_stale = payment
                    .last_synced_at
                    .map_or(true, |synced_at| now - synced_at > stale_after);
                if is_stale {
                    stale
                        .entry(payment.lease_id.as_str())
                        .or_default()
                        .push(payment.id.clone());
                }
            }
            Some(SyncStatus::Synced) | None => {}
        }
    }

    let mut issues = Vec::new();
    for (lease_id, payment_ids) in failed {
        issues.push(issue(
            IssueKind::SyncFailure,
            Severity::High,
            format!(
                "{} payment(s) on lease {lease_id} failed to sync.",
                payment_ids.len()
            ),
            vec![lease_id.to_string()],
            payment_ids,
            true,
        ));
    }
    for (lease_id, payment_ids) in stale {
        issues.push(issue(
            IssueKind::SyncFailure,
            Severity::Medium,
            format!(
                "{} payment(s) on lease {lease_id} have been pending sync for more than {} minutes.",
                payment_ids.len(),
                stale_after.num_minutes()
            ),
            vec![lease_id.to_string()],
            payment_ids,
            true,
        ));
    }
    issues
}

pub fn performance_issues(payments: &[Payment], threshold: usize) -> Vec<SyncIssue> {
    let pending: Vec<String> = payments
        .iter()
        .filter(|payment| payment.sync_status == Some(SyncStatus::Pending))
        .map(|payment| payment.id.clone())
        .collect();
    if pending.len() <= threshold {
        return Vec::new();
    }
    let severity = if pending.len() > threshold.saturating_mul(PERFORMANCE_ESCALATION_FACTOR) {
        Severity::High
    } else {
        Severity::Medium
    };
    vec![issue(
        IssueKind::PerformanceIssue,
        severity,
        format!(
            "{} payments are waiting to sync (threshold {threshold}).",
            pending.len()
        ),
        Vec::new(),
        pending,
        false,
    )]
}

fn payments_on_known_leases(leases: &[Lease], payments: &[Payment]) -> Vec<Payment> {
    let known: HashSet<&str> = leases.iter().map(|lease| lease.id.as_str()).collect();
    payments
        .iter()
        .filter(|payment| known.contains(payment.lease_id.as_str()))
        .cloned()
        .collect()
}

pub fn orphan_issues(leases: &[Lease], payments: &[Payment]) -> Vec<SyncIssue> {
    let known: HashSet<&str> = leases.iter().map(|lease| lease.id.as_str()).collect();
    let mut orphans: BTreeMap<&str, Vec<&Payment>> = BTreeMap::new();
    for payment in payments
        .iter()
        .filter(|payment| !known.contains(payment.lease_id.as_str()))
    {
        orphans
            .entry(payment.lease_id.as_str())
            .or_default()
            .push(payment);
    }

    orphans
        .into_iter()
        .map(|(lease_id, payments)| {
            let received: f64 = payments.iter().map(|payment| payment.amount_paid).sum();
            let severity = if received > BALANCE_TOLERANCE {
                Severity::Critical
            } else {
                Severity::High
            };
            issue(
                IssueKind::OrphanedData,
                severity,
                format!(
                    "{} payment(s) reference missing lease {lease_id} ({received:.2} received).",
                    payments.len()
                ),
                vec![lease_id.to_string()],
                payments.iter().map(|payment| payment.id.clone()).collect(),
                false,
            )
        })
        .collect()
}

fn recommendation_for(kind: IssueKind) -> &'static str {
    match kind {
        IssueKind::DataInconsistency => {
            "Review payments whose tenant, property or due date disagrees with their lease."
        }
        IssueKind::SyncFailure => {
            "Investigate payments stuck in failed or pending sync status and re-run the sync."
        }
        IssueKind::PerformanceIssue => {
            "Sync backlog is growing; check database latency and the sync transaction timeout."
        }
        IssueKind::OrphanedData => {
            "Reassign or archive payments whose lease no longer exists; refund review may be needed."
        }
    }
}

impl HealthMonitor {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        engine: Arc<SyncEngine>,
        log: Arc<SyncLog>,
        migration: Arc<SchemaMigration>,
        clock: Arc<dyn Clock>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            store,
            engine,
            log,
            migration,
            clock,
            settings,
            last_report: Mutex::new(None),
            runner: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        lock(&self.runner).is_some()
    }

    pub fn last_report(&self) -> Option<HealthReport> {
        lock(&self.last_report).clone()
    }

    /// Spawns the monitoring loop. Returns `false` if it is already running.
    pub fn start(self: &Arc<Self>, interval: Option<Duration>) -> bool {
        let mut runner = lock(&self.runner);
        if runner.is_some() {
            return false;
        }

        let interval = interval
            .unwrap_or(self.settings.interval)
            .max(Duration::from_secs(1));
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "Health monitor started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = monitor.generate_health_report().await;
                        tracing::info!(
                            issues = report.issues.len(),
                            auto_fix_succeeded = report.metrics.auto_fix_succeeded,
                            duration_ms = report.metrics.duration_ms,
                            "Health monitor: report generated"
                        );
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Health monitor stopped");
        });

        *runner = Some(MonitorLoop { shutdown, handle });
        true
    }

    /// Stops the loop and waits for it to exit. Returns `false` if it was
    /// not running.
    pub async fn stop(&self) -> bool {
        let running = lock(&self.runner).take();
        let Some(running) = running else {
            return false;
        };
        let _ = running.shutdown.send(true);
        if let Err(error) = running.handle.await {
            tracing::warn!("Health monitor loop ended abnormally: {error}");
        }
        true
    }

    pub async fn generate_health_report(&self) -> HealthReport {
        let started = Instant::now();
        let now = self.clock.now();
        let mut warnings = Vec::new();

        let leases = match self.store.list_leases().await {
            Ok(leases) => Some(leases),
            Err(error) => {
                warnings.push(format!("Could not load leases: {error}"));
                None
            }
        };
        let payments = match self.store.list_payments().await {
            Ok(payments) => Some(payments),
            Err(error) => {
                warnings.push(format!("Could not load payments: {error}"));
                None
            }
        };

        let mut issues = Vec::new();
        if let Some(leases) = &leases {
            match self.detect_data_inconsistencies(leases).await {
                Ok(found) => issues.extend(found),
                Err(error) => warnings.push(format!("Data inconsistency check failed: {error}")),
            }
        }
        if let Some(payments) = &payments {
            // Orphans are reported by the orphan detector; a sync of a
            // missing lease can never repair them.
            let attached: Vec<Payment> = match &leases {
                Some(leases) => payments_on_known_leases(leases, payments),
                None => payments.clone(),
            };
            issues.extend(sync_failure_issues(
                &attached,
                now,
                self.settings.stale_pending_after,
            ));
            issues.extend(performance_issues(
                payments,
                self.settings.pending_sync_threshold,
            ));
        }
        if let (Some(leases), Some(payments)) = (&leases, &payments) {
            issues.extend(orphan_issues(leases, payments));
        }

        let schema_ready = match self.migration.ensure_ready().await {
            Ok(ready) => ready,
            Err(error) => {
                warnings.push(format!("Schema check failed: {error}"));
                false
            }
        };

        let mut metrics = HealthMetrics::default();
        let fixed_leases = if schema_ready && self.settings.auto_fix {
            self.auto_fix(&issues, &mut metrics).await
        } else {
            BTreeSet::new()
        };

        // Fixed issues below high severity are only counted in the metrics.
        issues.retain(|issue| {
            let fixed = issue.auto_fixable
                && !issue.lease_ids.is_empty()
                && issue
                    .lease_ids
                    .iter()
                    .all(|lease_id| fixed_leases.contains(lease_id));
            !fixed || issue.severity.is_escalated()
        });

        if let Some(payments) = &payments {
            for payment in payments {
                match payment.sync_status {
                    Some(SyncStatus::Synced) => metrics.synced_payments += 1,
                    Some(SyncStatus::Pending) => metrics.pending_payments += 1,
                    Some(SyncStatus::Failed) => metrics.failed_payments += 1,
                    None => {}
                }
            }
        }
        metrics.success_rate_last_hour = self.log.stats(StatsWindow::Hour).success_rate;

        let mut recommendations: Vec<String> = Vec::new();
        let kinds: BTreeSet<&'static str> = issues
            .iter()
            .map(|issue| recommendation_for(issue.kind))
            .collect();
        recommendations.extend(kinds.into_iter().map(ToOwned::to_owned));
        if !schema_ready {
            recommendations.push(
                "Schema migration pending: run the migration before relying on automatic fixes."
                    .to_string(),
            );
        }
        recommendations.extend(self.log.detect_failure_patterns().recommendations);
        recommendations.push(match max_severity(&issues) {
            Some(severity) => format!(
                "{} open issue(s); highest severity {}.",
                issues.len(),
                severity.as_str()
            ),
            None => "No open sync issues.".to_string(),
        });

        metrics.duration_ms = started.elapsed().as_millis() as u64;
        let report = HealthReport {
            generated_at: now,
            total_leases: leases.as_ref().map_or(0, Vec::len),
            total_payments: payments.as_ref().map_or(0, Vec::len),
            issues,
            metrics,
            recommendations,
            warnings,
        };
        *lock(&self.last_report) = Some(report.clone());
        report
    }

    async fn detect_data_inconsistencies(&self, leases: &[Lease]) -> AppResult<Vec<SyncIssue>> {
        let mut issues = Vec::new();
        for lease in leases {
            let payments = self.store.payments_for_lease(&lease.id).await?;
            issues.extend(
                consistency::check_references(lease, &payments)
                    .into_iter()
                    .chain(consistency::check_due_dates(lease, &payments))
                    .map(|finding| finding.issue),
            );
        }
        Ok(issues)
    }

    /// Dispatches auto-fixable issues per lease. Returns the leases repaired.
    async fn auto_fix(&self, issues: &[SyncIssue], metrics: &mut HealthMetrics) -> BTreeSet<String> {
        let mut targets: BTreeMap<&str, bool> = BTreeMap::new();
        for issue in issues.iter().filter(|issue| issue.auto_fixable) {
            let needs_confirmation = issue.kind == IssueKind::DataInconsistency;
            for lease_id in &issue.lease_ids {
                let entry = targets.entry(lease_id.as_str()).or_insert(false);
                *entry |= needs_confirmation;
            }
        }

        let mut fixed = BTreeSet::new();
        for (lease_id, needs_confirmation) in targets {
            if needs_confirmation {
                match self.engine.validate_lease_payment_consistency(lease_id).await {
                    Ok(validation) if validation.is_valid => {
                        // Drift resolved since detection.
                        fixed.insert(lease_id.to_string());
                        continue;
                    }
                    Ok(_) => {}
                    Err(error) => {
                        tracing::warn!(lease_id, "Could not re-validate lease: {error}");
                        continue;
                    }
                }
            }

            metrics.auto_fix_attempted += 1;
            let (outcome, details) = match self
                .engine
                .sync_lease(lease_id, SyncOptions::forced())
                .await
            {
                Ok(result) if result.success => {
                    metrics.auto_fix_succeeded += 1;
                    fixed.insert(lease_id.to_string());
                    (
                        SyncOutcome::Success,
                        format!(
                            "Auto-fix synced lease {lease_id}: {} payment(s) written.",
                            result.payments_updated
                        ),
                    )
                }
                Ok(result) => (
                    SyncOutcome::Error,
                    format!(
                        "Auto-fix of lease {lease_id} failed: {}",
                        result
                            .errors
                            .iter()
                            .chain(result.warnings.iter())
                            .cloned()
                            .collect::<Vec<_>>()
                            .join("; ")
                    ),
                ),
                Err(error) => (
                    SyncOutcome::Error,
                    format!("Auto-fix of lease {lease_id} failed: {error}"),
                ),
            };
            self.log.log_event(
                None,
                Some(lease_id),
                SyncAction::RecoveryAttempted,
                outcome,
                details,
                json!({ "revalidated": needs_confirmation }),
            );
        }
        fixed
    }

    /// Leases with blocking validation errors or payments that failed or
    /// stalled during sync.
    pub async fn detect_sync_failures(&self) -> AppResult<Vec<LeaseSyncFailures>> {
        let now = self.clock.now();
        let today = now.date_naive();
        let leases = self.store.list_leases().await?;
        let payments = self.store.list_payments().await?;

        let mut by_lease: BTreeMap<&str, Vec<Payment>> = BTreeMap::new();
        for payment in &payments {
            by_lease
                .entry(payment.lease_id.as_str())
                .or_default()
                .push(payment.clone());
        }

        let mut failures = Vec::new();
        for lease in &leases {
            let lease_payments = by_lease.remove(lease.id.as_str()).unwrap_or_default();
            let mut issues: Vec<SyncIssue> = consistency::validate(lease, &lease_payments, today)
                .error_issues()
                .cloned()
                .collect();
            issues.extend(sync_failure_issues(
                &lease_payments,
                now,
                self.settings.stale_pending_after,
            ));
            if !issues.is_empty() {
                failures.push(LeaseSyncFailures {
                    lease_id: lease.id.clone(),
                    issues,
                });
            }
        }
        Ok(failures)
    }
}
