use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;

/// Amounts closer than this are treated as equal.
pub const BALANCE_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    Draft,
    Pending,
    Active,
    Terminated,
    Expired,
}

impl LeaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Terminated => "terminated",
            Self::Expired => "expired",
        }
    }

    /// Terminated and expired leases no longer accrue obligations.
    pub fn is_closed(self) -> bool {
        match self {
            Self::Terminated | Self::Expired => true,
            Self::Draft | Self::Pending | Self::Active => false,
        }
    }
}

impl FromStr for LeaseStatus {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(Self::Draft),
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "terminated" => Ok(Self::Terminated),
            "expired" => Ok(Self::Expired),
            other => Err(unknown_value("lease status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeasePaymentStatus {
    Current,
    Pending,
    Overdue,
}

impl LeasePaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Pending => "pending",
            Self::Overdue => "overdue",
        }
    }
}

impl FromStr for LeasePaymentStatus {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "current" => Ok(Self::Current),
            "pending" => Ok(Self::Pending),
            "overdue" => Ok(Self::Overdue),
            other => Err(unknown_value("lease payment status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Scheduled,
    Pending,
    Processing,
    PartiallyPaid,
    Paid,
    Overdue,
    Failed,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::PartiallyPaid => "partially_paid",
            Self::Paid => "paid",
            Self::Overdue => "overdue",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }

    /// Statuses that may still be advanced to `overdue`.
    pub fn is_pre_overdue(self) -> bool {
        match self {
            Self::Scheduled | Self::Pending | Self::PartiallyPaid | Self::Failed => true,
            Self::Processing
            | Self::Paid
            | Self::Overdue
            | Self::Cancelled
            | Self::Refunded => false,
        }
    }

    /// Statuses still waiting for the tenant to pay.
    pub fn is_awaiting_payment(self) -> bool {
        match self {
            Self::Scheduled | Self::Pending => true,
            Self::Processing
            | Self::PartiallyPaid
            | Self::Paid
            | Self::Overdue
            | Self::Failed
            | Self::Cancelled
            | Self::Refunded => false,
        }
    }

    pub fn is_outstanding(self) -> bool {
        match self {
            Self::Scheduled
            | Self::Pending
            | Self::Processing
            | Self::PartiallyPaid
            | Self::Failed
            | Self::Overdue => true,
            Self::Paid | Self::Cancelled | Self::Refunded => false,
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "scheduled" => Ok(Self::Scheduled),
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "partially_paid" => Ok(Self::PartiallyPaid),
            "paid" => Ok(Self::Paid),
            "overdue" => Ok(Self::Overdue),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            "refunded" => Ok(Self::Refunded),
            other => Err(unknown_value("payment status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    Rent,
    SecurityDeposit,
    LateFee,
    Utility,
    Other,
}

impl PaymentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rent => "rent",
            Self::SecurityDeposit => "security_deposit",
            Self::LateFee => "late_fee",
            Self::Utility => "utility",
            Self::Other => "other",
        }
    }
}

impl FromStr for PaymentType {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "rent" => Ok(Self::Rent),
            "security_deposit" => Ok(Self::SecurityDeposit),
            "late_fee" => Ok(Self::LateFee),
            "utility" => Ok(Self::Utility),
            _ => Ok(Self::Other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "failed" => Ok(Self::Failed),
            other => Err(unknown_value("sync status", other)),
        }
    }
}

fn unknown_value(kind: &str, value: &str) -> AppError {
    AppError::Internal(format!("Unknown {kind} '{value}'."))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,
    pub tenant_id: String,
    pub property_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: LeaseStatus,
    pub rent_amount: f64,
    pub rent_due_day: u32,
    /// Derived by the sync engine, never written by users.
    pub payment_status: Option<LeasePaymentStatus>,
}

impl Lease {
    pub fn covers(&self, date: NaiveDate) -> bool {
        date >= self.start_date && date <= self.end_date
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub lease_id: String,
    pub tenant_id: String,
    pub property_id: String,
    pub payment_type: PaymentType,
    pub amount: f64,
    pub amount_paid: f64,
    pub due_date: NaiveDate,
    pub paid_date: Option<NaiveDate>,
    pub status: PaymentStatus,
    pub notes: Option<String>,
    pub gateway_transaction_id: Option<String>,
    pub version: Option<i64>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub sync_status: Option<SyncStatus>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn current_version(&self) -> i64 {
        self.version.unwrap_or(0)
    }

    pub fn balance_remaining(&self) -> f64 {
        (self.amount - self.amount_paid).max(0.0)
    }

    pub fn has_balance(&self) -> bool {
        self.balance_remaining() > BALANCE_TOLERANCE
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn missing_sync_fields(&self) -> bool {
        self.version.is_none() || self.last_synced_at.is_none() || self.sync_status.is_none()
    }
}

/// Deprecated tenant document; payments should reference `user_id` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Always surfaced to operators, even once auto-fixed.
    pub fn is_escalated(self) -> bool {
        self >= Self::High
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    DataInconsistency,
    SyncFailure,
    PerformanceIssue,
    OrphanedData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncIssue {
    #[serde(rename = "type")]
    pub kind: IssueKind,
    pub severity: Severity,
    pub description: String,
    pub lease_ids: Vec<String>,
    pub payment_ids: Vec<String>,
    pub auto_fixable: bool,
}

/// Highest severity in a set of issues.
pub fn max_severity<'a>(issues: impl IntoIterator<Item = &'a SyncIssue>) -> Option<Severity> {
    issues.into_iter().map(|issue| issue.severity).max()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    WebhookReceived,
    StatusUpdated,
    InvoiceApplicationAdded,
    LinkageCreated,
    LinkageRemoved,
    FailureDetected,
    RecoveryAttempted,
    ManualTrigger,
}

impl SyncAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebhookReceived => "webhook_received",
            Self::StatusUpdated => "status_updated",
            Self::InvoiceApplicationAdded => "invoice_application_added",
            Self::LinkageCreated => "linkage_created",
            Self::LinkageRemoved => "linkage_removed",
            Self::FailureDetected => "failure_detected",
            Self::RecoveryAttempted => "recovery_attempted",
            Self::ManualTrigger => "manual_trigger",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: u64,
    pub payment_id: Option<String>,
    pub lease_id: Option<String>,
    pub action: SyncAction,
    pub outcome: SyncOutcome,
    pub details: String,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

impl SyncLogEntry {
    /// Key used to cluster failures: the payment, or the lease for lease-wide events.
    pub fn subject(&self) -> Option<&str> {
        self.payment_id.as_deref().or(self.lease_id.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::{PaymentStatus, Severity};
    use std::str::FromStr;

    #[test]
    fn severity_orders_low_to_critical() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(
            [Severity::Medium, Severity::Critical, Severity::Low]
                .into_iter()
                .max(),
            Some(Severity::Critical)
        );
        assert!(Severity::High.is_escalated());
        assert!(!Severity::Medium.is_escalated());
    }

    #[test]
    fn parses_payment_status_aliases() {
        assert_eq!(
            PaymentStatus::from_str("canceled").ok(),
            Some(PaymentStatus::Cancelled)
        );
        assert_eq!(
            PaymentStatus::from_str(" Partially_Paid ").ok(),
            Some(PaymentStatus::PartiallyPaid)
        );
        assert!(PaymentStatus::from_str("bogus").is_err());
    }

    #[test]
    fn classifies_payment_statuses() {
        assert!(PaymentStatus::Pending.is_pre_overdue());
        assert!(!PaymentStatus::Processing.is_pre_overdue());
        assert!(PaymentStatus::Scheduled.is_awaiting_payment());
        assert!(!PaymentStatus::Failed.is_awaiting_payment());
        assert!(PaymentStatus::Overdue.is_outstanding());
        assert!(!PaymentStatus::Refunded.is_outstanding());
    }
}
