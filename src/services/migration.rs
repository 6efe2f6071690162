use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    clock::Clock,
    error::AppResult,
    repository::{DuplicatePaymentKey, LedgerStore, StaleTenantReference, SyncIndex},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStatus {
    pub needed: bool,
    pub payments_missing_sync_fields: u64,
    pub stale_tenant_references: Vec<StaleTenantReference>,
    pub missing_indexes: Vec<SyncIndex>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationReport {
    pub direction: MigrationDirection,
    /// Payments whose sync-control fields were backfilled (up) or cleared (down).
    pub fields_updated: u64,
    pub references_repaired: u64,
    pub indexes_created: Vec<SyncIndex>,
    pub indexes_dropped: Vec<SyncIndex>,
    pub duplicate_keys: Vec<DuplicatePaymentKey>,
    pub inconsistencies: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

impl MigrationReport {
    fn new(direction: MigrationDirection, completed_at: DateTime<Utc>) -> Self {
        Self {
            direction,
            fields_updated: 0,
            references_repaired: 0,
            indexes_created: Vec::new(),
            indexes_dropped: Vec::new(),
            duplicate_keys: Vec::new(),
            inconsistencies: Vec::new(),
            completed_at,
        }
    }
}

/// Idempotent bootstrap of the sync-control fields, tenant references and
/// payment indexes, plus the readiness gate consulted by the engine and the
/// monitor.
pub struct SchemaMigration {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    ready: AtomicBool,
}

impl SchemaMigration {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            ready: AtomicBool::new(false),
        }
    }

    pub async fn status(&self) -> AppResult<MigrationStatus> {
        let payments_missing_sync_fields = self.store.count_missing_sync_fields().await?;
        let stale_tenant_references = self.store.stale_tenant_references().await?;
        let existing = self.store.existing_indexes().await?;
        let missing_indexes: Vec<SyncIndex> = SyncIndex::ALL
            .into_iter()
            .filter(|index| !existing.contains(index))
            .collect();

        // References without a canonical user cannot be repaired here.
        let repairable = stale_tenant_references
            .iter()
            .any(|reference| reference.canonical_user_id.is_some());
        let needed =
            payments_missing_sync_fields > 0 || repairable || !missing_indexes.is_empty();

        self.ready.store(!needed, Ordering::Release);
        Ok(MigrationStatus {
            needed,
            payments_missing_sync_fields,
            stale_tenant_references,
            missing_indexes,
            checked_at: self.clock.now(),
        })
    }

    pub async fn is_needed(&self) -> AppResult<bool> {
        Ok(self.status().await?.needed)
    }

    /// True once the schema has been observed fully migrated. The positive
    /// answer is cached; `up` and `down` refresh it.
    pub async fn ensure_ready(&self) -> AppResult<bool> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(true);
        }
        Ok(!self.status().await?.needed)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub async fn up(&self) -> AppResult<MigrationReport> {
        let now = self.clock.now();
        let mut report = MigrationReport::new(MigrationDirection::Up, now);

        report.fields_updated = self.store.backfill_sync_fields(now).await?;

        let stale = self.store.stale_tenant_references().await?;
        for reference in stale
            .iter()
            .filter(|reference| reference.canonical_user_id.is_none())
        {
            report.inconsistencies.push(format!(
                "Payment {} references tenant record {} which has no linked user.",
                reference.payment_id, reference.tenant_record_id
            ));
        }
        if stale
            .iter()
            .any(|reference| reference.canonical_user_id.is_some())
        {
            report.references_repaired = self.store.repair_tenant_references().await?;
        }

        let existing = self.store.existing_indexes().await?;
        for index in SyncIndex::ALL {
            if existing.contains(&index) {
                continue;
            }
            if index == SyncIndex::LeaseTypeDueUnique {
                let duplicates = self.store.duplicate_payment_keys().await?;
                if !duplicates.is_empty() {
                    for duplicate in &duplicates {
                        report.inconsistencies.push(format!(
                            "Lease {} has {} {} payments due {}: {}.",
                            duplicate.lease_id,
                            duplicate.payment_ids.len(),
                            duplicate.payment_type.as_str(),
                            duplicate.due_date,
                            duplicate.payment_ids.join(", ")
                        ));
                    }
                    report.duplicate_keys = duplicates;
                    tracing::warn!(
                        index = index.name(),
                        duplicates = report.duplicate_keys.len(),
                        "Duplicate payments block unique index"
                    );
                    continue;
                }
            }
            self.store.create_index(index).await?;
            report.indexes_created.push(index);
        }

        let status = self.status().await?;
        tracing::info!(
            fields_updated = report.fields_updated,
            references_repaired = report.references_repaired,
            indexes_created = report.indexes_created.len(),
            inconsistencies = report.inconsistencies.len(),
            still_needed = status.needed,
            "Schema migration up finished"
        );
        Ok(report)
    }

    pub async fn down(&self) -> AppResult<MigrationReport> {
        let mut report = MigrationReport::new(MigrationDirection::Down, self.clock.now());
        self.ready.store(false, Ordering::Release);

        report.fields_updated = self.store.clear_sync_fields().await?;
        for index in self.store.existing_indexes().await? {
            self.store.drop_index(index).await?;
            report.indexes_dropped.push(index);
        }

        tracing::info!(
            fields_updated = report.fields_updated,
            indexes_dropped = report.indexes_dropped.len(),
            "Schema migration down finished"
        );
        Ok(report)
    }
}
