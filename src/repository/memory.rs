use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::{
    error::{AppError, AppResult},
    models::{Lease, LeasePaymentStatus, LeaseStatus, Payment, PaymentType, SyncStatus, TenantRecord},
    repository::{
        DuplicatePaymentKey, LedgerStore, LedgerTransaction, StaleTenantReference, SyncIndex,
    },
};

#[derive(Debug, Default)]
struct Dataset {
    leases: BTreeMap<String, Lease>,
    payments: BTreeMap<String, Payment>,
    tenants: BTreeMap<String, TenantRecord>,
    indexes: BTreeSet<SyncIndex>,
    commits: u64,
    commit_delay: Option<Duration>,
    failing_lease_reads: bool,
}

/// In-process ledger with snapshot transactions.
///
/// A transaction reads a snapshot taken at `begin`; `commit` re-checks every
/// written payment's version against the live data before applying anything.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<Dataset>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Dataset> {
        lock_dataset(&self.data)
    }

    pub fn upsert_lease(&self, lease: Lease) {
        self.lock().leases.insert(lease.id.clone(), lease);
    }

    /// Inserts a payment, enforcing the unique `(lease_id, type, due_date)`
    /// index when it exists.
    pub fn insert_payment(&self, payment: Payment) -> AppResult<()> {
        let mut data = self.lock();
        if data.indexes.contains(&SyncIndex::LeaseTypeDueUnique) && !payment.is_deleted() {
            let clash = data.payments.values().any(|existing| {
                existing.id != payment.id
                    && !existing.is_deleted()
                    && existing.lease_id == payment.lease_id
                    && existing.payment_type == payment.payment_type
                    && existing.due_date == payment.due_date
            });
            if clash {
                return Err(AppError::Conflict(
                    "Duplicate value violates a unique constraint.".to_string(),
                ));
            }
        }
        data.payments.insert(payment.id.clone(), payment);
        Ok(())
    }

    pub fn upsert_tenant(&self, tenant: TenantRecord) {
        self.lock().tenants.insert(tenant.id.clone(), tenant);
    }

    pub fn lease(&self, lease_id: &str) -> Option<Lease> {
        self.lock().leases.get(lease_id).cloned()
    }

    /// Raw read that also returns soft-deleted payments.
    pub fn payment(&self, payment_id: &str) -> Option<Payment> {
        self.lock().payments.get(payment_id).cloned()
    }

    pub fn set_lease_status(&self, lease_id: &str, status: LeaseStatus) {
        if let Some(lease) = self.lock().leases.get_mut(lease_id) {
            lease.status = status;
        }
    }

    pub fn remove_lease(&self, lease_id: &str) {
        self.lock().leases.remove(lease_id);
    }

    /// Applies `change` directly to a stored payment, bypassing transactions.
    pub fn modify_payment(&self, payment_id: &str, change: impl FnOnce(&mut Payment)) {
        if let Some(payment) = self.lock().payments.get_mut(payment_id) {
            change(payment);
        }
    }

    pub fn commit_count(&self) -> u64 {
        self.lock().commits
    }

    /// Delays every commit, simulating a slow database.
    pub fn set_commit_delay(&self, delay: Option<Duration>) {
        self.lock().commit_delay = delay;
    }

    /// Makes `payments_for_lease` fail, simulating a flaky per-lease query.
    pub fn set_lease_reads_failing(&self, failing: bool) {
        self.lock().failing_lease_reads = failing;
    }

    fn live_payments(data: &Dataset) -> impl Iterator<Item = &Payment> {
        data.payments.values().filter(|payment| !payment.is_deleted())
    }
}

fn lock_dataset(data: &Mutex<Dataset>) -> MutexGuard<'_, Dataset> {
    data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn sorted_by_due_date(mut payments: Vec<Payment>) -> Vec<Payment> {
    payments.sort_by(|a, b| a.due_date.cmp(&b.due_date).then_with(|| a.id.cmp(&b.id)));
    payments
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }

    async fn get_lease(&self, lease_id: &str) -> AppResult<Option<Lease>> {
        Ok(self.lock().leases.get(lease_id).cloned())
    }

    async fn list_leases(&self) -> AppResult<Vec<Lease>> {
        Ok(self.lock().leases.values().cloned().collect())
    }

    async fn get_payment(&self, payment_id: &str) -> AppResult<Option<Payment>> {
        Ok(self
            .lock()
            .payments
            .get(payment_id)
            .filter(|payment| !payment.is_deleted())
            .cloned())
    }

    async fn payments_for_lease(&self, lease_id: &str) -> AppResult<Vec<Payment>> {
        let data = self.lock();
        if data.failing_lease_reads {
            return Err(AppError::Dependency(format!(
                "Payments query for lease {lease_id} failed."
            )));
        }
        Ok(sorted_by_due_date(
            Self::live_payments(&data)
                .filter(|payment| payment.lease_id == lease_id)
                .cloned()
                .collect(),
        ))
    }

    async fn list_payments(&self) -> AppResult<Vec<Payment>> {
        let data = self.lock();
        Ok(sorted_by_due_date(
            Self::live_payments(&data).cloned().collect(),
        ))
    }

    async fn find_payment_by_transaction(
        &self,
        transaction_id: &str,
    ) -> AppResult<Option<Payment>> {
        let data = self.lock();
        let found = Self::live_payments(&data)
            .find(|payment| payment.gateway_transaction_id.as_deref() == Some(transaction_id))
            .cloned();
        Ok(found)
    }

    async fn mark_sync_status(
        &self,
        payment_ids: &[String],
        status: SyncStatus,
    ) -> AppResult<u64> {
        let mut data = self.lock();
        let mut touched = 0;
        for payment_id in payment_ids {
            if let Some(payment) = data.payments.get_mut(payment_id) {
                if payment.is_deleted() {
                    continue;
                }
                payment.sync_status = Some(status);
                payment.version = Some(payment.current_version() + 1);
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn begin(&self) -> AppResult<Box<dyn LedgerTransaction>> {
        let data = self.lock();
        Ok(Box::new(MemoryTransaction {
            data: Arc::clone(&self.data),
            leases: data.leases.clone(),
            payments: data.payments.clone(),
            lease_writes: BTreeMap::new(),
            payment_writes: BTreeMap::new(),
            commit_delay: data.commit_delay,
        }))
    }

    async fn count_missing_sync_fields(&self) -> AppResult<u64> {
        let data = self.lock();
        Ok(data
            .payments
            .values()
            .filter(|payment| payment.missing_sync_fields())
            .count() as u64)
    }

    async fn backfill_sync_fields(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let mut data = self.lock();
        let mut touched = 0;
        for payment in data.payments.values_mut() {
            if !payment.missing_sync_fields() {
                continue;
            }
            payment.version.get_or_insert(0);
            payment.sync_status.get_or_insert(SyncStatus::Synced);
            payment.last_synced_at.get_or_insert(now);
            touched += 1;
        }
        Ok(touched)
    }

    async fn clear_sync_fields(&self) -> AppResult<u64> {
        let mut data = self.lock();
        let mut touched = 0;
        for payment in data.payments.values_mut() {
            if payment.version.is_none()
                && payment.sync_status.is_none()
                && payment.last_synced_at.is_none()
            {
                continue;
            }
            payment.version = None;
            payment.sync_status = None;
            payment.last_synced_at = None;
            touched += 1;
        }
        Ok(touched)
    }

    async fn stale_tenant_references(&self) -> AppResult<Vec<StaleTenantReference>> {
        let data = self.lock();
        Ok(Self::live_payments(&data)
            .filter_map(|payment| {
                data.tenants
                    .get(&payment.tenant_id)
                    .map(|tenant| StaleTenantReference {
                        payment_id: payment.id.clone(),
                        tenant_record_id: tenant.id.clone(),
                        canonical_user_id: tenant.user_id.clone(),
                    })
            })
            .collect())
    }

    async fn repair_tenant_references(&self) -> AppResult<u64> {
        let mut data = self.lock();
        let canonical: BTreeMap<String, String> = data
            .tenants
            .values()
            .filter_map(|tenant| {
                tenant
                    .user_id
                    .clone()
                    .map(|user_id| (tenant.id.clone(), user_id))
            })
            .collect();

        let mut repaired = 0;
        for payment in data.payments.values_mut() {
            if payment.is_deleted() {
                continue;
            }
            if let Some(user_id) = canonical.get(&payment.tenant_id) {
                payment.tenant_id = user_id.clone();
                repaired += 1;
            }
        }
        Ok(repaired)
    }

    async fn duplicate_payment_keys(&self) -> AppResult<Vec<DuplicatePaymentKey>> {
        let data = self.lock();
        let mut groups: BTreeMap<(String, PaymentType, NaiveDate), Vec<String>> = BTreeMap::new();
        for payment in Self::live_payments(&data) {
            groups
                .entry((
                    payment.lease_id.clone(),
                    payment.payment_type,
                    payment.due_date,
                ))
                .or_default()
                .push(payment.id.clone());
        }
        Ok(groups
            .into_iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(
                |((lease_id, payment_type, due_date), payment_ids)| DuplicatePaymentKey {
                    lease_id,
                    payment_type,
                    due_date,
                    payment_ids,
                },
            )
            .collect())
    }

    async fn existing_indexes(&self) -> AppResult<Vec<SyncIndex>> {
        Ok(self.lock().indexes.iter().copied().collect())
    }

    async fn create_index(&self, index: SyncIndex) -> AppResult<()> {
        self.lock().indexes.insert(index);
        Ok(())
    }

    async fn drop_index(&self, index: SyncIndex) -> AppResult<()> {
        self.lock().indexes.remove(&index);
        Ok(())
    }
}

pub struct MemoryTransaction {
    data: Arc<Mutex<Dataset>>,
    leases: BTreeMap<String, Lease>,
    payments: BTreeMap<String, Payment>,
    lease_writes: BTreeMap<String, LeasePaymentStatus>,
    /// Payment id -> (new state, version it was read at).
    payment_writes: BTreeMap<String, (Payment, i64)>,
    commit_delay: Option<Duration>,
}

impl MemoryTransaction {
    fn visible_payment(&self, payment_id: &str) -> Option<Payment> {
        self.payment_writes
            .get(payment_id)
            .map(|(payment, _)| payment.clone())
            .or_else(|| self.payments.get(payment_id).cloned())
            .filter(|payment| !payment.is_deleted())
    }
}

#[async_trait]
impl LedgerTransaction for MemoryTransaction {
    async fn lease_for_update(&mut self, lease_id: &str) -> AppResult<Option<Lease>> {
        Ok(self.leases.get(lease_id).cloned().map(|mut lease| {
            if let Some(status) = self.lease_writes.get(lease_id) {
                lease.payment_status = Some(*status);
            }
            lease
        }))
    }

    async fn payment_for_update(&mut self, payment_id: &str) -> AppResult<Option<Payment>> {
        Ok(self.visible_payment(payment_id))
    }

    async fn payments_for_update(&mut self, lease_id: &str) -> AppResult<Vec<Payment>> {
        let ids: Vec<String> = self
            .payments
            .values()
            .filter(|payment| payment.lease_id == lease_id)
            .map(|payment| payment.id.clone())
            .collect();
        Ok(sorted_by_due_date(
            ids.iter()
                .filter_map(|payment_id| self.visible_payment(payment_id))
                .collect(),
        ))
    }

    async fn set_lease_payment_status(
        &mut self,
        lease_id: &str,
        status: LeasePaymentStatus,
    ) -> AppResult<()> {
        if !self.leases.contains_key(lease_id) {
            return Err(AppError::NotFound(format!("Lease {lease_id} not found.")));
        }
        self.lease_writes.insert(lease_id.to_string(), status);
        Ok(())
    }

    async fn update_payment(&mut self, payment: &Payment, expected_version: i64) -> AppResult<()> {
        let current = self
            .visible_payment(&payment.id)
            .ok_or_else(|| AppError::NotFound(format!("Payment {} not found.", payment.id)))?;
        if current.current_version() != expected_version {
            return Err(AppError::Conflict(format!(
                "Payment {} changed during reconciliation.",
                payment.id
            )));
        }
        let read_version = self
            .payment_writes
            .get(&payment.id)
            .map(|(_, read_at)| *read_at)
            .unwrap_or(expected_version);
        self.payment_writes
            .insert(payment.id.clone(), (payment.clone(), read_version));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        if let Some(delay) = self.commit_delay {
            tokio::time::sleep(delay).await;
        }

        let mut data = lock_dataset(&self.data);
        for (payment_id, (_, read_version)) in &self.payment_writes {
            let live_version = data
                .payments
                .get(payment_id)
                .map(Payment::current_version)
                .ok_or_else(|| AppError::NotFound(format!("Payment {payment_id} not found.")))?;
            if live_version != *read_version {
                return Err(AppError::Conflict(format!(
                    "Payment {payment_id} changed during reconciliation."
                )));
            }
        }

        for (lease_id, status) in self.lease_writes {
            if let Some(lease) = data.leases.get_mut(&lease_id) {
                lease.payment_status = Some(status);
            }
        }
        for (payment_id, (payment, _)) in self.payment_writes {
            data.payments.insert(payment_id, payment);
        }
        data.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryStore;
    use crate::error::AppError;
    use crate::models::{
        Lease, LeaseStatus, Payment, PaymentStatus, PaymentType, SyncStatus, TenantRecord,
    };
    use crate::repository::{LedgerStore, SyncIndex};
    use chrono::NaiveDate;

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
            payment_status: None,
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
            last_synced_at: None,
            sync_status: Some(SyncStatus::Pending),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn commit_rejects_payment_changed_after_begin() {
        let store = MemoryStore::new();
        store.upsert_lease(lease());
        store.insert_payment(payment("p1", "2026-01-01")).expect("insert");

        let mut tx = store.begin().await.expect("begin");
        let mut read = tx.payment_for_update("p1").await.expect("read").expect("exists");
        store.modify_payment("p1", |p| p.version = Some(7));

        read.status = PaymentStatus::Overdue;
        read.version = Some(1);
        tx.update_payment(&read, 0).await.expect("staged");
        let error = tx.commit().await.expect_err("stale write must fail");
        assert!(matches!(error, AppError::Conflict(_)));
        assert_eq!(store.payment("p1").map(|p| p.status), Some(PaymentStatus::Pending));
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn dropped_transaction_applies_nothing() {
        let store = MemoryStore::new();
        store.upsert_lease(lease());
        store.insert_payment(payment("p1", "2026-01-01")).expect("insert");

        {
            let mut tx = store.begin().await.expect("begin");
            let mut read = tx.payment_for_update("p1").await.expect("read").expect("exists");
            read.status = PaymentStatus::Paid;
            tx.update_payment(&read, 0).await.expect("staged");
        }
        assert_eq!(store.payment("p1").map(|p| p.status), Some(PaymentStatus::Pending));
    }

    #[tokio::test]
    async fn soft_deleted_payments_are_invisible() {
        let store = MemoryStore::new();
        store.upsert_lease(lease());
        let mut deleted = payment("p2", "2026-02-01");
        deleted.deleted_at = Some(chrono::Utc::now());
        store.insert_payment(payment("p1", "2026-01-01")).expect("insert");
        store.insert_payment(deleted).expect("insert");

        let payments = store.payments_for_lease("lease-1").await.expect("list");
        assert_eq!(payments.len(), 1);
        assert!(store.get_payment("p2").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn finds_live_payment_by_gateway_transaction() {
        let store = MemoryStore::new();
        store.upsert_lease(lease());
        let mut live = payment("p1", "2026-01-01");
        live.gateway_transaction_id = Some("pi_live".to_string());
        let mut deleted = payment("p2", "2026-02-01");
        deleted.gateway_transaction_id = Some("pi_gone".to_string());
        deleted.deleted_at = Some(chrono::Utc::now());
        store.insert_payment(live).expect("insert");
        store.insert_payment(deleted).expect("insert");

        let found = store
            .find_payment_by_transaction("pi_live")
            .await
            .expect("lookup")
            .expect("match");
        assert_eq!(found.id, "p1");
        assert!(store
            .find_payment_by_transaction("pi_gone")
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn unique_index_rejects_duplicate_keys() {
        let store = MemoryStore::new();
        store.create_index(SyncIndex::LeaseTypeDueUnique).await.expect("index");
        store.insert_payment(payment("p1", "2026-01-01")).expect("insert");
        let error = store
            .insert_payment(payment("p2", "2026-01-01"))
            .expect_err("duplicate key");
        assert!(matches!(error, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn repairs_tenant_references_with_canonical_user() {
        let store = MemoryStore::new();
        store.upsert_tenant(TenantRecord {
            id: "tenant-old".to_string(),
            user_id: Some("user-1".to_string()),
        });
        let mut stale = payment("p1", "2026-01-01");
        stale.tenant_id = "tenant-old".to_string();
        store.insert_payment(stale).expect("insert");

        assert_eq!(store.stale_tenant_references().await.expect("scan").len(), 1);
        assert_eq!(store.repair_tenant_references().await.expect("repair"), 1);
        assert_eq!(store.payment("p1").map(|p| p.tenant_id), Some("user-1".to_string()));
        assert!(store.stale_tenant_references().await.expect("scan").is_empty());
    }
}
