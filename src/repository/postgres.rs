use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::{
    error::{AppError, AppResult},
    models::{
        Lease, LeasePaymentStatus, LeaseStatus, Payment, PaymentStatus, PaymentType, SyncStatus,
    },
    repository::{
        DuplicatePaymentKey, LedgerStore, LedgerTransaction, StaleTenantReference, SyncIndex,
    },
};

const LEASE_COLUMNS: &str = "id::text AS id, tenant_id::text AS tenant_id, \
     property_id::text AS property_id, start_date, end_date, status::text AS status, \
     rent_amount::float8 AS rent_amount, rent_due_day::int4 AS rent_due_day, \
     payment_status::text AS payment_status";

const PAYMENT_COLUMNS: &str = "id::text AS id, lease_id::text AS lease_id, \
     tenant_id::text AS tenant_id, property_id::text AS property_id, \
     type::text AS payment_type, amount::float8 AS amount, \
     COALESCE(amount_paid, 0)::float8 AS amount_paid, due_date, paid_date, \
     status::text AS status, notes, gateway_transaction_id, version::int8 AS version, \
     last_synced_at, sync_status::text AS sync_status, deleted_at";

const SYNC_COLUMNS: [&str; 3] = ["version", "last_synced_at", "sync_status"];

#[derive(sqlx::FromRow)]
struct LeaseRow {
    id: String,
    tenant_id: String,
    property_id: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
    status: String,
    rent_amount: f64,
    rent_due_day: i32,
    payment_status: Option<String>,
}

impl TryFrom<LeaseRow> for Lease {
    type Error = AppError;

    fn try_from(row: LeaseRow) -> Result<Self, Self::Error> {
        Ok(Lease {
            id: row.id,
            tenant_id: row.tenant_id,
            property_id: row.property_id,
            start_date: row.start_date,
            end_date: row.end_date,
            status: LeaseStatus::from_str(&row.status)?,
            rent_amount: row.rent_amount,
            rent_due_day: row.rent_due_day.clamp(1, 31) as u32,
            payment_status: row
                .payment_status
                .as_deref()
                .map(LeasePaymentStatus::from_str)
                .transpose()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: String,
    lease_id: String,
    tenant_id: String,
    property_id: String,
    payment_type: String,
    amount: f64,
    amount_paid: f64,
    due_date: NaiveDate,
    paid_date: Option<NaiveDate>,
    status: String,
    notes: Option<String>,
    gateway_transaction_id: Option<String>,
    version: Option<i64>,
    last_synced_at: Option<DateTime<Utc>>,
    sync_status: Option<String>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = AppError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: row.id,
            lease_id: row.lease_id,
            tenant_id: row.tenant_id,
            property_id: row.property_id,
            payment_type: PaymentType::from_str(&row.payment_type)?,
            amount: row.amount,
            amount_paid: row.amount_paid,
            due_date: row.due_date,
            paid_date: row.paid_date,
            status: PaymentStatus::from_str(&row.status)?,
            notes: row.notes,
            gateway_transaction_id: row.gateway_transaction_id,
            version: row.version,
            last_synced_at: row.last_synced_at,
            sync_status: row
                .sync_status
                .as_deref()
                .map(SyncStatus::from_str)
                .transpose()?,
            deleted_at: row.deleted_at,
        })
    }
}

fn into_leases(rows: Vec<LeaseRow>) -> AppResult<Vec<Lease>> {
    rows.into_iter().map(Lease::try_from).collect()
}

fn into_payments(rows: Vec<PaymentRow>) -> AppResult<Vec<Payment>> {
    rows.into_iter().map(Payment::try_from).collect()
}

fn index_ddl(index: SyncIndex) -> &'static str {
    match index {
        SyncIndex::LeaseTypeDueUnique => {
            "CREATE UNIQUE INDEX IF NOT EXISTS payments_lease_type_due_unique \
             ON payments (lease_id, type, due_date) WHERE deleted_at IS NULL"
        }
        SyncIndex::SyncStatusLastSynced => {
            "CREATE INDEX IF NOT EXISTS payments_sync_status_last_synced \
             ON payments (sync_status, last_synced_at)"
        }
        SyncIndex::Version => "CREATE INDEX IF NOT EXISTS payments_version ON payments (version)",
    }
}

fn drop_index_ddl(index: SyncIndex) -> &'static str {
    match index {
        SyncIndex::LeaseTypeDueUnique => "DROP INDEX IF EXISTS payments_lease_type_due_unique",
        SyncIndex::SyncStatusLastSynced => "DROP INDEX IF EXISTS payments_sync_status_last_synced",
        SyncIndex::Version => "DROP INDEX IF EXISTS payments_version",
    }
}

/// Postgres-backed ledger over the `leases`, `payments` and `tenants` tables.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn sync_columns_present(&self) -> AppResult<bool> {
        let present = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*)::bigint FROM information_schema.columns
             WHERE table_schema = current_schema()
               AND table_name = 'payments'
               AND column_name::text = ANY($1)",
        )
        .bind(SYNC_COLUMNS.iter().map(ToString::to_string).collect::<Vec<_>>())
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(present as usize == SYNC_COLUMNS.len())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(())
    }

    async fn get_lease(&self, lease_id: &str) -> AppResult<Option<Lease>> {
        let sql = format!("SELECT {LEASE_COLUMNS} FROM leases WHERE id = $1::uuid LIMIT 1");
        sqlx::query_as::<_, LeaseRow>(&sql)
            .bind(lease_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?
            .map(Lease::try_from)
            .transpose()
    }

    async fn list_leases(&self) -> AppResult<Vec<Lease>> {
        let sql = format!("SELECT {LEASE_COLUMNS} FROM leases ORDER BY start_date");
        let rows = sqlx::query_as::<_, LeaseRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)?;
        into_leases(rows)
    }

    async fn get_payment(&self, payment_id: &str) -> AppResult<Option<Payment>> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE id = $1::uuid AND deleted_at IS NULL LIMIT 1"
        );
        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?
            .map(Payment::try_from)
            .transpose()
    }

    async fn payments_for_lease(&self, lease_id: &str) -> AppResult<Vec<Payment>> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE lease_id = $1::uuid AND deleted_at IS NULL
             ORDER BY due_date, id"
        );
        let rows = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(lease_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)?;
        into_payments(rows)
    }

    async fn list_payments(&self) -> AppResult<Vec<Payment>> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE deleted_at IS NULL ORDER BY due_date, id"
        );
        let rows = sqlx::query_as::<_, PaymentRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)?;
        into_payments(rows)
    }

    async fn find_payment_by_transaction(
        &self,
        transaction_id: &str,
    ) -> AppResult<Option<Payment>> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE gateway_transaction_id = $1 AND deleted_at IS NULL LIMIT 1"
        );
        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?
            .map(Payment::try_from)
            .transpose()
    }

    async fn mark_sync_status(
        &self,
        payment_ids: &[String],
        status: SyncStatus,
    ) -> AppResult<u64> {
        if payment_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE payments
             SET sync_status = $1, version = COALESCE(version, 0) + 1
             WHERE id::text = ANY($2) AND deleted_at IS NULL",
        )
        .bind(status.as_str())
        .bind(payment_ids.to_vec())
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(result.rows_affected())
    }

    async fn begin(&self) -> AppResult<Box<dyn LedgerTransaction>> {
        let tx = self.pool.begin().await.map_err(map_db_error)?;
        Ok(Box::new(PgLedgerTransaction { tx }))
    }

    async fn count_missing_sync_fields(&self) -> AppResult<u64> {
        if !self.sync_columns_present().await? {
            let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*)::bigint FROM payments")
                .fetch_one(&self.pool)
                .await
                .map_err(map_db_error)?;
            return Ok(total.max(0) as u64);
        }
        let missing = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*)::bigint FROM payments
             WHERE version IS NULL OR last_synced_at IS NULL OR sync_status IS NULL",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(missing.max(0) as u64)
    }

    async fn backfill_sync_fields(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;
        for ddl in [
            "ALTER TABLE payments ADD COLUMN IF NOT EXISTS version BIGINT",
            "ALTER TABLE payments ADD COLUMN IF NOT EXISTS last_synced_at TIMESTAMPTZ",
            "ALTER TABLE payments ADD COLUMN IF NOT EXISTS sync_status TEXT",
        ] {
            sqlx::query(ddl)
                .execute(&mut *tx)
                .await
                .map_err(map_db_error)?;
        }
        let result = sqlx::query(
            "UPDATE payments
             SET version = COALESCE(version, 0),
                 sync_status = COALESCE(sync_status, 'synced'),
                 last_synced_at = COALESCE(last_synced_at, $1)
             WHERE version IS NULL OR last_synced_at IS NULL OR sync_status IS NULL",
        )
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;
        tx.commit().await.map_err(map_db_error)?;
        Ok(result.rows_affected())
    }

    async fn clear_sync_fields(&self) -> AppResult<u64> {
        if !self.sync_columns_present().await? {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE payments
             SET version = NULL, last_synced_at = NULL, sync_status = NULL
             WHERE version IS NOT NULL OR last_synced_at IS NOT NULL OR sync_status IS NOT NULL",
        )
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(result.rows_affected())
    }

    async fn stale_tenant_references(&self) -> AppResult<Vec<StaleTenantReference>> {
        let rows = sqlx::query_as::<_, (String, String, Option<String>)>(
            "SELECT p.id::text, t.id::text, t.user_id::text
             FROM payments p
             JOIN tenants t ON t.id = p.tenant_id
             WHERE p.deleted_at IS NULL
             ORDER BY p.id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;

        Ok(rows
            .into_iter()
            .map(
                |(payment_id, tenant_record_id, canonical_user_id)| StaleTenantReference {
                    payment_id,
                    tenant_record_id,
                    canonical_user_id,
                },
            )
            .collect())
    }

    async fn repair_tenant_references(&self) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE payments p
             SET tenant_id = t.user_id
             FROM tenants t
             WHERE p.tenant_id = t.id
               AND t.user_id IS NOT NULL
               AND p.deleted_at IS NULL",
        )
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(result.rows_affected())
    }

    async fn duplicate_payment_keys(&self) -> AppResult<Vec<DuplicatePaymentKey>> {
        let rows = sqlx::query_as::<_, (String, String, NaiveDate, Vec<String>)>(
            "SELECT lease_id::text, type::text, due_date, array_agg(id::text ORDER BY id)
             FROM payments
             WHERE deleted_at IS NULL
             GROUP BY lease_id, type, due_date
             HAVING COUNT(*) > 1",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;

        rows.into_iter()
            .map(|(lease_id, payment_type, due_date, payment_ids)| {
                Ok(DuplicatePaymentKey {
                    lease_id,
                    payment_type: PaymentType::from_str(&payment_type)?,
                    due_date,
                    payment_ids,
                })
            })
            .collect()
    }

    async fn existing_indexes(&self) -> AppResult<Vec<SyncIndex>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT indexname::text FROM pg_indexes
             WHERE schemaname = current_schema() AND tablename = 'payments'",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;

        Ok(SyncIndex::ALL
            .into_iter()
            .filter(|index| names.iter().any(|name| name == index.name()))
            .collect())
    }

    async fn create_index(&self, index: SyncIndex) -> AppResult<()> {
        sqlx::query(index_ddl(index))
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(())
    }

    async fn drop_index(&self, index: SyncIndex) -> AppResult<()> {
        sqlx::query(drop_index_ddl(index))
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(())
    }
}

pub struct PgLedgerTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTransaction for PgLedgerTransaction {
    async fn lease_for_update(&mut self, lease_id: &str) -> AppResult<Option<Lease>> {
        let sql = format!("SELECT {LEASE_COLUMNS} FROM leases WHERE id = $1::uuid FOR UPDATE");
        sqlx::query_as::<_, LeaseRow>(&sql)
            .bind(lease_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_error)?
            .map(Lease::try_from)
            .transpose()
    }

    async fn payment_for_update(&mut self, payment_id: &str) -> AppResult<Option<Payment>> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE id = $1::uuid AND deleted_at IS NULL FOR UPDATE"
        );
        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(payment_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_error)?
            .map(Payment::try_from)
            .transpose()
    }

    async fn payments_for_update(&mut self, lease_id: &str) -> AppResult<Vec<Payment>> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE lease_id = $1::uuid AND deleted_at IS NULL
             ORDER BY due_date, id FOR UPDATE"
        );
        let rows = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(lease_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_db_error)?;
        into_payments(rows)
    }

    async fn set_lease_payment_status(
        &mut self,
        lease_id: &str,
        status: LeasePaymentStatus,
    ) -> AppResult<()> {
        let result = sqlx::query("UPDATE leases SET payment_status = $2 WHERE id = $1::uuid")
            .bind(lease_id)
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(map_db_error)?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Lease {lease_id} not found.")));
        }
        Ok(())
    }

    async fn update_payment(&mut self, payment: &Payment, expected_version: i64) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE payments
             SET status = $3,
                 amount_paid = $4,
                 paid_date = $5,
                 notes = $6,
                 tenant_id = $7::uuid,
                 property_id = $8::uuid,
                 gateway_transaction_id = $9,
                 sync_status = $10,
                 last_synced_at = $11,
                 version = $12
             WHERE id = $1::uuid
               AND COALESCE(version, 0) = $2
               AND deleted_at IS NULL",
        )
        .bind(&payment.id)
        .bind(expected_version)
        .bind(payment.status.as_str())
        .bind(payment.amount_paid)
        .bind(payment.paid_date)
        .bind(payment.notes.as_deref())
        .bind(&payment.tenant_id)
        .bind(&payment.property_id)
        .bind(payment.gateway_transaction_id.as_deref())
        .bind(payment.sync_status.map(SyncStatus::as_str))
        .bind(payment.last_synced_at)
        .bind(payment.version)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "Payment {} changed during reconciliation.",
                payment.id
            )));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        self.tx.commit().await.map_err(map_db_error)
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        self.tx.rollback().await.map_err(map_db_error)
    }
}

fn map_db_error(error: sqlx::Error) -> AppError {
    let message = error.to_string();
    tracing::error!(db_error = %message, "Database query failed");

    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            return AppError::Unavailable("Database is unreachable.".to_string());
        }
        _ => {}
    }

    if message.contains("23505")
        || message
            .to_ascii_lowercase()
            .contains("duplicate key value violates unique constraint")
    {
        return AppError::Conflict("Duplicate value violates a unique constraint.".to_string());
    }
    AppError::Dependency("Database operation failed.".to_string())
}

#[cfg(test)]
mod tests {
    use super::{drop_index_ddl, index_ddl, map_db_error, PaymentRow};
    use crate::error::AppError;
    use crate::models::{Payment, PaymentStatus, PaymentType};
    use crate::repository::SyncIndex;
    use chrono::NaiveDate;

    #[test]
    fn unique_index_is_scoped_to_live_payments() {
        let ddl = index_ddl(SyncIndex::LeaseTypeDueUnique);
        assert!(ddl.contains("UNIQUE"));
        assert!(ddl.contains("(lease_id, type, due_date)"));
        assert!(ddl.contains("WHERE deleted_at IS NULL"));
        for index in SyncIndex::ALL {
            assert!(index_ddl(index).contains(index.name()));
            assert!(drop_index_ddl(index).ends_with(index.name()));
        }
    }

    #[test]
    fn pool_timeouts_map_to_unavailable() {
        assert!(matches!(
            map_db_error(sqlx::Error::PoolTimedOut),
            AppError::Unavailable(_)
        ));
        assert!(matches!(
            map_db_error(sqlx::Error::RowNotFound),
            AppError::Dependency(_)
        ));
    }

    #[test]
    fn converts_rows_with_unknown_type_to_other() {
        let row = PaymentRow {
            id: "p1".to_string(),
            lease_id: "l1".to_string(),
            tenant_id: "t1".to_string(),
            property_id: "pr1".to_string(),
            payment_type: "parking".to_string(),
            amount: 50.0,
            amount_paid: 0.0,
            due_date: NaiveDate::from_ymd_opt(2026, 3, 1).expect("valid date"),
            paid_date: None,
            status: "pending".to_string(),
            notes: None,
            gateway_transaction_id: None,
            version: None,
            last_synced_at: None,
            sync_status: None,
            deleted_at: None,
        };
        let payment = Payment::try_from(row).expect("valid row");
        assert_eq!(payment.payment_type, PaymentType::Other);
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert!(payment.missing_sync_fields());
    }
}
