use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::{
    error::AppResult,
    models::{Lease, LeasePaymentStatus, Payment, PaymentType, SyncStatus},
};

pub mod memory;
pub mod postgres;

/// Indexes the sync engine relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncIndex {
    /// Unique `(lease_id, type, due_date)` over non-deleted payments.
    LeaseTypeDueUnique,
    SyncStatusLastSynced,
    Version,
}

impl SyncIndex {
    pub const ALL: [SyncIndex; 3] = [
        SyncIndex::LeaseTypeDueUnique,
        SyncIndex::SyncStatusLastSynced,
        SyncIndex::Version,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::LeaseTypeDueUnique => "payments_lease_type_due_unique",
            Self::SyncStatusLastSynced => "payments_sync_status_last_synced",
            Self::Version => "payments_version",
        }
    }
}

/// A payment whose tenant reference points at a deprecated tenant record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaleTenantReference {
    pub payment_id: String,
    pub tenant_record_id: String,
    pub canonical_user_id: Option<String>,
}

/// Non-deleted payments sharing one `(lease_id, type, due_date)` key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicatePaymentKey {
    pub lease_id: String,
    pub payment_type: PaymentType,
    pub due_date: NaiveDate,
    pub payment_ids: Vec<String>,
}

/// Access to the `leases` and `payments` collections.
///
/// Soft-deleted payments are never returned by any read.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn ping(&self) -> AppResult<()>;

    async fn get_lease(&self, lease_id: &str) -> AppResult<Option<Lease>>;
    async fn list_leases(&self) -> AppResult<Vec<Lease>>;
    async fn get_payment(&self, payment_id: &str) -> AppResult<Option<Payment>>;
    async fn payments_for_lease(&self, lease_id: &str) -> AppResult<Vec<Payment>>;
    async fn list_payments(&self) -> AppResult<Vec<Payment>>;
    async fn find_payment_by_transaction(
        &self,
        transaction_id: &str,
    ) -> AppResult<Option<Payment>>;

    /// Flag-only write outside a transaction, used after failed reconciliations.
    async fn mark_sync_status(&self, payment_ids: &[String], status: SyncStatus)
        -> AppResult<u64>;

    async fn begin(&self) -> AppResult<Box<dyn LedgerTransaction>>;

    async fn count_missing_sync_fields(&self) -> AppResult<u64>;
    async fn backfill_sync_fields(&self, now: DateTime<Utc>) -> AppResult<u64>;
    async fn clear_sync_fields(&self) -> AppResult<u64>;
    async fn stale_tenant_references(&self) -> AppResult<Vec<StaleTenantReference>>;
    async fn repair_tenant_references(&self) -> AppResult<u64>;
    async fn duplicate_payment_keys(&self) -> AppResult<Vec<DuplicatePaymentKey>>;
    async fn existing_indexes(&self) -> AppResult<Vec<SyncIndex>>;
    async fn create_index(&self, index: SyncIndex) -> AppResult<()>;
    async fn drop_index(&self, index: SyncIndex) -> AppResult<()>;
}

/// One atomic unit of work across both collections.
///
/// Dropping a transaction without committing discards every staged write.
#[async_trait]
pub trait LedgerTransaction: Send {
    async fn lease_for_update(&mut self, lease_id: &str) -> AppResult<Option<Lease>>;
    async fn payment_for_update(&mut self, payment_id: &str) -> AppResult<Option<Payment>>;
    async fn payments_for_update(&mut self, lease_id: &str) -> AppResult<Vec<Payment>>;
    async fn set_lease_payment_status(
        &mut self,
        lease_id: &str,
        status: LeasePaymentStatus,
    ) -> AppResult<()>;
    /// Persists `payment` only if the stored version still equals `expected_version`;
    /// otherwise fails with `AppError::Conflict`.
    async fn update_payment(&mut self, payment: &Payment, expected_version: i64)
        -> AppResult<()>;
    async fn commit(self: Box<Self>) -> AppResult<()>;
    async fn rollback(self: Box<Self>) -> AppResult<()>;
}
