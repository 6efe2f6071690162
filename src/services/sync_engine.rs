//! Transactional reconciliation of a lease with its payments.
//!
//! A reconciliation re-reads the lease and its payments inside one
//! transaction, applies the status rules, derives the lease-level payment
//! status, and commits only when something changed. Every outcome is written
//! to the sync event log.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    clock::Clock,
    error::{AppError, AppResult},
    models::{
        LeasePaymentStatus, Payment, PaymentStatus, SyncAction, SyncOutcome, SyncStatus,
        BALANCE_TOLERANCE,
    },
    repository::{LedgerStore, LedgerTransaction},
    services::{
        consistency::{self, ValidationResult},
        migration::SchemaMigration,
        payment_rules::{
            derive_lease_payment_status, derive_payment_update, summarize, PaymentStatusChange,
            PaymentSummary,
        },
        sync_log::SyncLog,
    },
};

const MAX_ATTEMPTS: u32 = 2;
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncOptions {
    pub skip_validation: bool,
    /// Proceed past blocking validation errors and realign payment
    /// references with the lease.
    pub force_sync: bool,
}

impl SyncOptions {
    pub fn forced() -> Self {
        Self {
            skip_validation: false,
            force_sync: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncResult {
    pub success: bool,
    pub lease_updated: bool,
    pub payments_updated: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl SyncResult {
    fn failed(error: impl Into<String>, warnings: Vec<String>) -> Self {
        Self {
            success: false,
            errors: vec![error.into()],
            warnings,
            ..Self::default()
        }
    }
}

/// Result of a gateway charge applied to one payment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentSettlement {
    pub status: PaymentStatus,
    pub amount_paid: f64,
    pub paid_date: Option<NaiveDate>,
    pub gateway_transaction_id: Option<String>,
    pub note: Option<String>,
}

impl PaymentSettlement {
    /// True when the payment already carries this settlement, as after a
    /// redelivered gateway event.
    fn is_applied_to(&self, payment: &Payment) -> bool {
        payment.status == self.status
            && (payment.amount_paid - self.amount_paid).abs() <= BALANCE_TOLERANCE
            && (self.gateway_transaction_id.is_none()
                || payment.gateway_transaction_id == self.gateway_transaction_id)
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub transaction_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            transaction_timeout: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct AppliedPaymentChange {
    payment_id: String,
    status_change: Option<PaymentStatusChange>,
    settled: bool,
    relinked: bool,
}

impl AppliedPaymentChange {
    fn is_marker_only(&self) -> bool {
        self.status_change.is_none() && !self.settled && !self.relinked
    }
}

#[derive(Debug, Clone)]
struct Reconciliation {
    previous_lease_status: Option<LeasePaymentStatus>,
    lease_payment_status: LeasePaymentStatus,
    lease_updated: bool,
    payments: Vec<AppliedPaymentChange>,
    summary: PaymentSummary,
}

impl Reconciliation {
    fn has_writes(&self) -> bool {
        self.lease_updated || !self.payments.is_empty()
    }
}

/// Releases the lease's in-progress claim when dropped.
struct LeaseClaim<'a> {
    in_progress: &'a Mutex<HashSet<String>>,
    lease_id: String,
}

impl Drop for LeaseClaim<'_> {
    fn drop(&mut self) {
        lock_set(self.in_progress).remove(&self.lease_id);
    }
}

fn lock_set(set: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn append_note(existing: Option<&str>, note: &str) -> String {
    match existing.map(str::trim).filter(|value| !value.is_empty()) {
        Some(existing) => format!("{existing}\n{note}"),
        None => note.to_string(),
    }
}

pub struct SyncEngine {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    log: Arc<SyncLog>,
    migration: Arc<SchemaMigration>,
    settings: EngineSettings,
    in_progress: Mutex<HashSet<String>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        log: Arc<SyncLog>,
        migration: Arc<SchemaMigration>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            clock,
            log,
            migration,
            settings,
            in_progress: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_in_progress(&self, lease_id: &str) -> bool {
        lock_set(&self.in_progress).contains(lease_id)
    }

    fn try_claim(&self, lease_id: &str) -> Option<LeaseClaim<'_>> {
        if !lock_set(&self.in_progress).insert(lease_id.to_string()) {
            return None;
        }
        Some(LeaseClaim {
            in_progress: &self.in_progress,
            lease_id: lease_id.to_string(),
        })
    }

    /// Waits up to the transaction timeout for a running sync of the lease
    /// to release its claim.
    async fn wait_for_claim(&self, lease_id: &str) -> Option<LeaseClaim<'_>> {
        let deadline = tokio::time::Instant::now() + self.settings.transaction_timeout;
        loop {
            if let Some(claim) = self.try_claim(lease_id) {
                return Some(claim);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(CLAIM_POLL_INTERVAL).await;
        }
    }

    pub async fn validate_lease_payment_consistency(
        &self,
        lease_id: &str,
    ) -> AppResult<ValidationResult> {
        let lease = self
            .store
            .get_lease(lease_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Lease {lease_id} not found.")))?;
        let payments = self.store.payments_for_lease(lease_id).await?;
        Ok(consistency::validate(&lease, &payments, self.clock.today()))
    }

    /// Reconciles one lease. Only an unreachable database surfaces as `Err`;
    /// every other failure is reported inside the returned result.
    pub async fn sync_lease(&self, lease_id: &str, options: SyncOptions) -> AppResult<SyncResult> {
        self.run(lease_id, options, None).await
    }

    /// Applies a gateway settlement to a payment and reconciles its lease in
    /// the same transaction.
    pub async fn process_payment_and_sync(
        &self,
        payment_id: &str,
        settlement: PaymentSettlement,
    ) -> AppResult<SyncResult> {
        let payment = match self.store.get_payment(payment_id).await {
            Ok(Some(payment)) => payment,
            Ok(None) => {
                let message = format!("Payment {payment_id} not found.");
                self.log.log_event(
                    Some(payment_id),
                    None,
                    SyncAction::FailureDetected,
                    SyncOutcome::Error,
                    &message,
                    json!({}),
                );
                return Ok(SyncResult::failed(message, Vec::new()));
            }
            Err(error) => return self.surface_error(None, Some(payment_id), error, Vec::new()),
        };

        self.run(
            &payment.lease_id,
            SyncOptions {
                skip_validation: true,
                force_sync: false,
            },
            Some((payment_id, &settlement)),
        )
        .await
    }

    async fn run(
        &self,
        lease_id: &str,
        options: SyncOptions,
        settlement: Option<(&str, &PaymentSettlement)>,
    ) -> AppResult<SyncResult> {
        let payment_id = settlement.map(|(payment_id, _)| payment_id);

        match self.migration.ensure_ready().await {
            Ok(true) => {}
            Ok(false) => {
                let message = "Schema migration pending; run the bootstrap before syncing.";
                self.log.log_event(
                    payment_id,
                    Some(lease_id),
                    SyncAction::FailureDetected,
                    SyncOutcome::Error,
                    message,
                    json!({ "reason": "schema_migration_pending" }),
                );
                return Ok(SyncResult::failed(message, Vec::new()));
            }
            Err(error) => return self.surface_error(Some(lease_id), payment_id, error, Vec::new()),
        }

        // A settlement cannot be dropped, so it queues behind a running sync.
        let claim = match settlement {
            Some(_) => self.wait_for_claim(lease_id).await,
            None => self.try_claim(lease_id),
        };
        let Some(_claim) = claim else {
            let warning = format!("Sync already in progress for lease {lease_id}");
            self.log.log_event(
                payment_id,
                Some(lease_id),
                SyncAction::ManualTrigger,
                SyncOutcome::Warning,
                &warning,
                json!({}),
            );
            return Ok(SyncResult {
                success: false,
                warnings: vec![warning],
                ..SyncResult::default()
            });
        };

        let lease = match self.store.get_lease(lease_id).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                let message = format!("Lease {lease_id} not found.");
                self.log.log_event(
                    payment_id,
                    Some(lease_id),
                    SyncAction::FailureDetected,
                    SyncOutcome::Error,
                    &message,
                    json!({}),
                );
                return Ok(SyncResult::failed(message, Vec::new()));
            }
            Err(error) => return self.surface_error(Some(lease_id), payment_id, error, Vec::new()),
        };
        let payments = match self.store.payments_for_lease(lease_id).await {
            Ok(payments) => payments,
            Err(error) => return self.surface_error(Some(lease_id), payment_id, error, Vec::new()),
        };
        let affected: Vec<String> = payments.iter().map(|payment| payment.id.clone()).collect();

        let mut warnings = Vec::new();
        if !options.skip_validation {
            let validation = consistency::validate(&lease, &payments, self.clock.today());
            warnings.extend(validation.warnings.iter().cloned());
            if !validation.is_valid {
                if !options.force_sync {
                    self.log.log_event(
                        payment_id,
                        Some(lease_id),
                        SyncAction::FailureDetected,
                        SyncOutcome::Error,
                        format!(
                            "Validation blocked sync of lease {lease_id}: {} error(s).",
                            validation.errors.len()
                        ),
                        json!({ "errors": validation.errors }),
                    );
                    return Ok(SyncResult {
                        success: false,
                        errors: validation.errors,
                        warnings,
                        ..SyncResult::default()
                    });
                }
                warnings.push(format!(
                    "Forced sync despite {} validation error(s).",
                    validation.errors.len()
                ));
                warnings.extend(validation.errors);
            }
        }

        let mut attempt = 1;
        let outcome = loop {
            match self.reconcile_with_timeout(lease_id, options.force_sync, settlement).await {
                Err(error) if error.is_conflict() && attempt < MAX_ATTEMPTS => {
                    tracing::warn!(lease_id, attempt, "Version conflict, retrying: {error}");
                    attempt += 1;
                }
                other => break other,
            }
        };

        match outcome {
            Ok(reconciliation) => {
                self.record_success(lease_id, settlement, &reconciliation, attempt);
                Ok(SyncResult {
                    success: true,
                    lease_updated: reconciliation.lease_updated,
                    payments_updated: reconciliation.payments.len(),
                    errors: Vec::new(),
                    warnings,
                })
            }
            Err(error) => {
                let marker = match &error {
                    AppError::Timeout(_) => Some(SyncStatus::Pending),
                    AppError::Dependency(_) | AppError::Internal(_) => Some(SyncStatus::Failed),
                    _ => None,
                };
                if let Some(status) = marker {
                    self.mark_best_effort(lease_id, &affected, status).await;
                }
                self.surface_error(Some(lease_id), payment_id, error, warnings)
            }
        }
    }

    async fn reconcile_with_timeout(
        &self,
        lease_id: &str,
        force_sync: bool,
        settlement: Option<(&str, &PaymentSettlement)>,
    ) -> AppResult<Reconciliation> {
        let timeout = self.settings.transaction_timeout;
        match tokio::time::timeout(timeout, self.reconcile(lease_id, force_sync, settlement)).await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(format!(
                "Reconciliation of lease {lease_id} exceeded {} ms.",
                timeout.as_millis()
            ))),
        }
    }

    async fn reconcile(
        &self,
        lease_id: &str,
        force_sync: bool,
        settlement: Option<(&str, &PaymentSettlement)>,
    ) -> AppResult<Reconciliation> {
        let mut tx = self.store.begin().await?;
        let outcome = self
            .reconcile_in(tx.as_mut(), lease_id, force_sync, settlement)
            .await;
        match outcome {
            Ok(reconciliation) => {
                if reconciliation.has_writes() {
                    tx.commit().await?;
                } else {
                    tx.rollback().await?;
                }
                Ok(reconciliation)
            }
            Err(error) => {
                if let Err(rollback_error) = tx.rollback().await {
                    tracing::warn!(lease_id, "Rollback failed: {rollback_error}");
                }
                Err(error)
            }
        }
    }

    async fn reconcile_in(
        &self,
        tx: &mut dyn LedgerTransaction,
        lease_id: &str,
        force_sync: bool,
        settlement: Option<(&str, &PaymentSettlement)>,
    ) -> AppResult<Reconciliation> {
        let now = self.clock.now();
        let today = now.date_naive();

        let lease = tx
            .lease_for_update(lease_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Lease {lease_id} not found.")))?;
        let payments = tx.payments_for_update(lease_id).await?;

        if let Some((payment_id, _)) = settlement {
            if !payments.iter().any(|payment| payment.id == payment_id) {
                return Err(AppError::NotFound(format!(
                    "Payment {payment_id} not found on lease {lease_id}."
                )));
            }
        }

        let mut projected: Vec<Payment> = Vec::with_capacity(payments.len());
        let mut applied = Vec::new();
        for payment in payments {
            let read_version = payment.current_version();
            let mut next = payment.clone();
            let mut change = AppliedPaymentChange {
                payment_id: payment.id.clone(),
                status_change: None,
                settled: false,
                relinked: false,
            };

            if let Some((_, settlement)) = settlement
                .filter(|(id, _)| *id == payment.id)
                .filter(|(_, settlement)| !settlement.is_applied_to(&payment))
            {
                next.status = settlement.status;
                next.amount_paid = settlement.amount_paid;
                next.paid_date = settlement.paid_date;
                if settlement.gateway_transaction_id.is_some() {
                    next.gateway_transaction_id = settlement.gateway_transaction_id.clone();
                }
                if let Some(note) = &settlement.note {
                    next.notes = Some(append_note(next.notes.as_deref(), note));
                }
                change.settled = true;
            }

            if force_sync
                && (next.tenant_id != lease.tenant_id || next.property_id != lease.property_id)
            {
                next.tenant_id = lease.tenant_id.clone();
                next.property_id = lease.property_id.clone();
                change.relinked = true;
            }

            if let Some(status_change) = derive_payment_update(&lease, &next, today) {
                next.status = status_change.to;
                if let Some(note) = &status_change.note {
                    next.notes = Some(append_note(next.notes.as_deref(), note));
                }
                change.status_change = Some(PaymentStatusChange {
                    from: payment.status,
                    ..status_change
                });
            }

            if !change.is_marker_only() || next.sync_status != Some(SyncStatus::Synced) {
                next.sync_status = Some(SyncStatus::Synced);
                next.last_synced_at = Some(now);
                next.version = Some(read_version + 1);
                tx.update_payment(&next, read_version).await?;
                applied.push(change);
            }
            projected.push(next);
        }

        let lease_payment_status =
            derive_lease_payment_status(projected.iter().map(|payment| payment.status));
        let lease_updated = lease.payment_status != Some(lease_payment_status);
        if lease_updated {
            tx.set_lease_payment_status(lease_id, lease_payment_status)
                .await?;
        }

        Ok(Reconciliation {
            previous_lease_status: lease.payment_status,
            lease_payment_status,
            lease_updated,
            payments: applied,
            summary: summarize(&projected, today),
        })
    }

    fn record_success(
        &self,
        lease_id: &str,
        settlement: Option<(&str, &PaymentSettlement)>,
        reconciliation: &Reconciliation,
        attempts: u32,
    ) {
        for change in &reconciliation.payments {
            if change.settled {
                if let Some((_, settlement)) = settlement {
                    self.log.log_event(
                        Some(&change.payment_id),
                        Some(lease_id),
                        SyncAction::InvoiceApplicationAdded,
                        SyncOutcome::Success,
                        format!(
                            "Applied {} settlement to payment {}.",
                            settlement.status.as_str(),
                            change.payment_id
                        ),
                        json!({
                            "amount_paid": settlement.amount_paid,
                            "gateway_transaction_id": settlement.gateway_transaction_id,
                        }),
                    );
                }
            }
            if change.relinked {
                self.log.log_event(
                    Some(&change.payment_id),
                    Some(lease_id),
                    SyncAction::LinkageCreated,
                    SyncOutcome::Success,
                    format!(
                        "Realigned payment {} with lease {lease_id}.",
                        change.payment_id
                    ),
                    json!({}),
                );
            }
            if let Some(status_change) = &change.status_change {
                self.log.log_event(
                    Some(&change.payment_id),
                    Some(lease_id),
                    SyncAction::StatusUpdated,
                    SyncOutcome::Success,
                    format!(
                        "Payment {} moved from {} to {}.",
                        change.payment_id,
                        status_change.from.as_str(),
                        status_change.to.as_str()
                    ),
                    json!({ "from": status_change.from, "to": status_change.to }),
                );
            }
        }

        let details = if reconciliation.has_writes() {
            format!(
                "Synced lease {lease_id}: {} payment(s) written, lease status {}.",
                reconciliation.payments.len(),
                reconciliation.lease_payment_status.as_str()
            )
        } else {
            format!("Lease {lease_id} already consistent.")
        };
        self.log.log_event(
            None,
            Some(lease_id),
            SyncAction::ManualTrigger,
            SyncOutcome::Success,
            details,
            json!({
                "lease_updated": reconciliation.lease_updated,
                "previous_payment_status": reconciliation.previous_lease_status,
                "payment_status": reconciliation.lease_payment_status,
                "payments_updated": reconciliation.payments.len(),
                "attempts": attempts,
                "summary": reconciliation.summary,
            }),
        );
        tracing::info!(
            lease_id,
            payments_updated = reconciliation.payments.len(),
            lease_updated = reconciliation.lease_updated,
            "Lease sync finished"
        );
    }

    async fn mark_best_effort(&self, lease_id: &str, payment_ids: &[String], status: SyncStatus) {
        if payment_ids.is_empty() {
            return;
        }
        if let Err(error) = self.store.mark_sync_status(payment_ids, status).await {
            tracing::warn!(
                lease_id,
                status = status.as_str(),
                "Could not mark sync status: {error}"
            );
        }
    }

    fn surface_error(
        &self,
        lease_id: Option<&str>,
        payment_id: Option<&str>,
        error: AppError,
        warnings: Vec<String>,
    ) -> AppResult<SyncResult> {
        self.log.log_event(
            payment_id,
            lease_id,
            SyncAction::FailureDetected,
            SyncOutcome::Error,
            error.to_string(),
            json!({ "status": error.status_code().as_u16() }),
        );
        match error {
            AppError::Unavailable(_) => Err(error),
            other => Ok(SyncResult::failed(other.to_string(), warnings)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{EngineSettings, PaymentSettlement, SyncEngine, SyncOptions};
    use crate::clock::ManualClock;
    use crate::models::{
        Lease, LeasePaymentStatus, LeaseStatus, Payment, PaymentStatus, PaymentType, SyncAction,
        SyncOutcome, SyncStatus,
    };
    use crate::repository::memory::MemoryStore;
    use crate::services::migration::SchemaMigration;
    use crate::services::sync_log::SyncLog;
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::sync::Arc;
    use std::time::Duration;

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("valid date")
    }

    fn lease() -> Lease {
        Lease {
            id: "lease-1".to_string(),
            tenant_id: "user-1".to_string(),
            property_id: "prop-1".to_string(),
            start_date: date("2026-01-01"),
            end_date: date("2026-12-31"),
            status: LeaseStatus::Active,
            rent_amount: 1200.0,
            rent_due_day: 1,
            payment_status: Some(LeasePaymentStatus::Pending),
        }
    }

    fn payment(id: &str, due: &str) -> Payment {
        Payment {
            id: id.to_string(),
            lease_id: "lease-1".to_string(),
            tenant_id: "user-1".to_string(),
            property_id: "prop-1".to_string(),
            payment_type: PaymentType::Rent,
            amount: 1200.0,
            amount_paid: 0.0,
            due_date: date(due),
            paid_date: None,
            status: PaymentStatus::Pending,
            notes: None,
            gateway_transaction_id: None,
            version: Some(0),
            last_synced_at: Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
            sync_status: Some(SyncStatus::Synced),
            deleted_at: None,
        }
    }

    struct Harness {
        store: MemoryStore,
        log: Arc<SyncLog>,
        engine: Arc<SyncEngine>,
    }

    async fn harness(payments: Vec<Payment>, timeout: Duration) -> Harness {
        let store = MemoryStore::new();
        store.upsert_lease(lease());
        for payment in payments {
            store.insert_payment(payment).expect("insert");
        }
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap(),
        ));
        let log = Arc::new(SyncLog::new(100, clock.clone()));
        let migration = Arc::new(SchemaMigration::new(Arc::new(store.clone()), clock.clone()));
        migration.up().await.expect("migration");
        let engine = Arc::new(SyncEngine::new(
            Arc::new(store.clone()),
            clock,
            log.clone(),
            migration,
            EngineSettings {
                transaction_timeout: timeout,
            },
        ));
        Harness { store, log, engine }
    }

    async fn january_fixture() -> Harness {
        harness(
            vec![payment("p1", "2026-01-01"), payment("p2", "2026-02-01")],
            Duration::from_secs(5),
        )
        .await
    }

    #[tokio::test]
    async fn promotes_past_due_payment_and_derives_lease_status() {
        let h = january_fixture().await;
        let result = h
            .engine
            .sync_lease("lease-1", SyncOptions::default())
            .await
            .expect("sync");

        assert!(result.success, "{result:?}");
        assert!(result.lease_updated);
        assert_eq!(result.payments_updated, 1);
        let p1 = h.store.payment("p1").expect("p1");
        assert_eq!(p1.status, PaymentStatus::Overdue);
        assert_eq!(p1.version, Some(1));
        assert_eq!(h.store.payment("p2").expect("p2").status, PaymentStatus::Pending);
        assert_eq!(
            h.store.lease("lease-1").expect("lease").payment_status,
            Some(LeasePaymentStatus::Overdue)
        );
        assert_eq!(h.log.entries_for("p1")[0].action, SyncAction::StatusUpdated);
    }

    #[tokio::test]
    async fn second_sync_writes_nothing() {
        let h = january_fixture().await;
        h.engine
            .sync_lease("lease-1", SyncOptions::default())
            .await
            .expect("first");
        let commits = h.store.commit_count();

        let second = h
            .engine
            .sync_lease("lease-1", SyncOptions::default())
            .await
            .expect("second");
        assert!(second.success);
        assert_eq!(second.payments_updated, 0);
        assert!(!second.lease_updated);
        assert_eq!(h.store.commit_count(), commits);
    }

    #[tokio::test]
    async fn fully_paid_past_due_payment_keeps_status() {
        let mut paid = payment("p2", "2026-01-14");
        paid.payment_type = PaymentType::LateFee;
        paid.amount_paid = 1200.0;
        let h = harness(
            vec![payment("p1", "2026-01-14"), paid],
            Duration::from_secs(5),
        )
        .await;

        h.engine
            .sync_lease("lease-1", SyncOptions::default())
            .await
            .expect("sync");
        assert_eq!(h.store.payment("p1").expect("p1").status, PaymentStatus::Overdue);
        assert_eq!(h.store.payment("p2").expect("p2").status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn termination_cancels_future_payments() {
        let h = harness(vec![payment("p3", "2026-03-01")], Duration::from_secs(5)).await;
        h.store.set_lease_status("lease-1", LeaseStatus::Terminated);

        let result = h
            .engine
            .sync_lease("lease-1", SyncOptions::default())
            .await
            .expect("sync");
        assert!(result.success);
        let p3 = h.store.payment("p3").expect("p3");
        assert_eq!(p3.status, PaymentStatus::Cancelled);
        assert!(p3.notes.is_some_and(|note| !note.is_empty()));
        assert_eq!(
            h.store.lease("lease-1").expect("lease").payment_status,
            Some(LeasePaymentStatus::Current)
        );
    }

    #[tokio::test]
    async fn reference_mismatch_blocks_unless_forced() {
        let mut stray = payment("p2", "2026-02-01");
        stray.property_id = "prop-9".to_string();
        let h = harness(vec![stray], Duration::from_secs(5)).await;

        let blocked = h
            .engine
            .sync_lease("lease-1", SyncOptions::default())
            .await
            .expect("sync");
        assert!(!blocked.success);
        assert_eq!(blocked.errors.len(), 1);
        assert_eq!(h.store.commit_count(), 0);

        let forced = h
            .engine
            .sync_lease("lease-1", SyncOptions::forced())
            .await
            .expect("forced");
        assert!(forced.success, "{forced:?}");
        let revalidated = h
            .engine
            .validate_lease_payment_consistency("lease-1")
            .await
            .expect("validate");
        assert!(revalidated.errors.is_empty());
        assert_eq!(h.store.payment("p2").expect("p2").property_id, "prop-1");
        assert_eq!(h.log.entries_for("p2")[0].action, SyncAction::LinkageCreated);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_syncs_commit_once() {
        let h = january_fixture().await;
        h.store.set_commit_delay(Some(Duration::from_millis(100)));

        let (first, second) = tokio::join!(
            h.engine.sync_lease("lease-1", SyncOptions::default()),
            h.engine.sync_lease("lease-1", SyncOptions::default()),
        );
        let first = first.expect("first");
        let second = second.expect("second");

        assert!(first.success);
        assert!(!second.success);
        assert!(second.warnings[0].contains("already in progress"));
        assert_eq!(h.store.commit_count(), 1);
        assert!(!h.engine.is_in_progress("lease-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_once_after_version_conflict() {
        let h = january_fixture().await;
        h.store.set_commit_delay(Some(Duration::from_millis(100)));
        let store = h.store.clone();

        let (result, _) = tokio::join!(
            h.engine.sync_lease("lease-1", SyncOptions::default()),
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                store.modify_payment("p1", |payment| payment.version = Some(10));
            }
        );
        let result = result.expect("sync");

        assert!(result.success, "{result:?}");
        let p1 = h.store.payment("p1").expect("p1");
        assert_eq!(p1.status, PaymentStatus::Overdue);
        assert_eq!(p1.version, Some(11));
    }

    #[tokio::test(start_paused = true)]
    async fn surfaces_conflict_after_retry() {
        let h = january_fixture().await;
        h.store.set_commit_delay(Some(Duration::from_millis(100)));
        let store = h.store.clone();

        let (result, _) = tokio::join!(
            h.engine.sync_lease("lease-1", SyncOptions::default()),
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                store.modify_payment("p1", |payment| payment.version = Some(10));
                tokio::time::sleep(Duration::from_millis(100)).await;
                store.modify_payment("p1", |payment| payment.version = Some(20));
            }
        );
        let result = result.expect("sync");

        assert!(!result.success);
        assert!(result.errors[0].contains("changed during reconciliation"));
        assert_eq!(h.store.payment("p1").expect("p1").status, PaymentStatus::Pending);
        assert_eq!(h.store.commit_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rolls_back_and_marks_pending() {
        let h = harness(
            vec![payment("p1", "2026-01-01"), payment("p2", "2026-02-01")],
            Duration::from_millis(500),
        )
        .await;
        h.store.set_commit_delay(Some(Duration::from_secs(5)));

        let result = h
            .engine
            .sync_lease("lease-1", SyncOptions::default())
            .await
            .expect("sync");

        assert!(!result.success);
        assert!(result.errors[0].contains("exceeded"));
        let p1 = h.store.payment("p1").expect("p1");
        assert_eq!(p1.status, PaymentStatus::Pending);
        assert_eq!(p1.sync_status, Some(SyncStatus::Pending));
        assert_eq!(h.store.commit_count(), 0);
        assert_eq!(h.log.recent_errors(1)[0].outcome, SyncOutcome::Error);
    }

    #[tokio::test]
    async fn unknown_lease_is_a_failed_result() {
        let h = january_fixture().await;
        let result = h
            .engine
            .sync_lease("missing", SyncOptions::default())
            .await
            .expect("sync");
        assert!(!result.success);
        assert!(result.errors[0].contains("not found"));
    }

    #[tokio::test]
    async fn pending_migration_blocks_sync() {
        let store = MemoryStore::new();
        store.upsert_lease(lease());
        let mut unmigrated = payment("p1", "2026-01-01");
        unmigrated.version = None;
        store.insert_payment(unmigrated).expect("insert");
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap(),
        ));
        let log = Arc::new(SyncLog::new(10, clock.clone()));
        let migration = Arc::new(SchemaMigration::new(Arc::new(store.clone()), clock.clone()));
        let engine = SyncEngine::new(
            Arc::new(store.clone()),
            clock,
            log,
            migration,
            EngineSettings::default(),
        );

        let result = engine
            .sync_lease("lease-1", SyncOptions::default())
            .await
            .expect("sync");
        assert!(!result.success);
        assert!(result.errors[0].contains("migration"));
        assert_eq!(store.payment("p1").expect("p1").status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn settlement_and_lease_status_commit_together() {
        let h = january_fixture().await;
        let result = h
            .engine
            .process_payment_and_sync(
                "p1",
                PaymentSettlement {
                    status: PaymentStatus::Paid,
                    amount_paid: 1200.0,
                    paid_date: Some(date("2026-01-15")),
                    gateway_transaction_id: Some("pi_123".to_string()),
                    note: None,
                },
            )
            .await
            .expect("process");

        assert!(result.success, "{result:?}");
        assert_eq!(h.store.commit_count(), 1);
        let p1 = h.store.payment("p1").expect("p1");
        assert_eq!(p1.status, PaymentStatus::Paid);
        assert_eq!(p1.gateway_transaction_id.as_deref(), Some("pi_123"));
        assert_eq!(
            h.store.lease("lease-1").expect("lease").payment_status,
            Some(LeasePaymentStatus::Pending)
        );
        assert!(h
            .log
            .entries_for("p1")
            .iter()
            .any(|entry| entry.action == SyncAction::InvoiceApplicationAdded));
    }

    #[tokio::test]
    async fn settlement_for_unknown_payment_fails() {
        let h = january_fixture().await;
        let result = h
            .engine
            .process_payment_and_sync(
                "nope",
                PaymentSettlement {
                    status: PaymentStatus::Paid,
                    amount_paid: 1.0,
                    paid_date: None,
                    gateway_transaction_id: None,
                    note: None,
                },
            )
            .await
            .expect("process");
        assert!(!result.success);
    }
}
