//! Lease/payment invariant checks.
//!
//! Every function here is pure: given the same lease, payments and date it
//! returns the same findings, which lets the sync engine and the health
//! monitor share one definition of drift.

use chrono::NaiveDate;
use serde::Serialize;

use crate::{
    models::{IssueKind, Lease, Payment, Severity, SyncIssue},
    services::payment_rules::{
        derive_lease_payment_status, derive_payment_update, is_cancellable_on_close,
        is_overdue_eligible,
    },
};

/// Whether a finding blocks a non-forced sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inconsistency {
    pub level: IssueLevel,
    #[serde(flatten)]
    pub issue: SyncIssue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub inconsistencies: Vec<Inconsistency>,
}

impl ValidationResult {
    fn from_findings(inconsistencies: Vec<Inconsistency>) -> Self {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        for finding in &inconsistencies {
            match finding.level {
                IssueLevel::Error => errors.push(finding.issue.description.clone()),
                IssueLevel::Warning => warnings.push(finding.issue.description.clone()),
            }
        }
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
            inconsistencies,
        }
    }

    pub fn error_issues(&self) -> impl Iterator<Item = &SyncIssue> {
        self.inconsistencies
            .iter()
            .filter(|finding| finding.level == IssueLevel::Error)
            .map(|finding| &finding.issue)
    }
}

pub fn validate(lease: &Lease, payments: &[Payment], today: NaiveDate) -> ValidationResult {
    let mut findings = Vec::new();
    findings.extend(check_references(lease, payments));
    findings.extend(check_due_dates(lease, payments));
    findings.extend(check_closed_lease_payments(lease, payments, today));
    findings.extend(check_overdue_promotion(lease, payments, today));
    findings.extend(check_lease_payment_status(lease, payments, today));
    ValidationResult::from_findings(findings)
}

fn finding(
    level: IssueLevel,
    severity: Severity,
    description: String,
    lease: &Lease,
    payment_ids: Vec<String>,
    auto_fixable: bool,
) -> Inconsistency {
    Inconsistency {
        level,
        issue: SyncIssue {
            kind: IssueKind::DataInconsistency,
            severity,
            description,
            lease_ids: vec![lease.id.clone()],
            payment_ids,
            auto_fixable,
        },
    }
}

/// Payments whose tenant or property differs from the lease's.
pub fn check_references(lease: &Lease, payments: &[Payment]) -> Vec<Inconsistency> {
    payments
        .iter()
        .filter(|payment| !payment.is_deleted())
        .filter_map(|payment| {
            let mut mismatched = Vec::new();
            if payment.tenant_id != lease.tenant_id {
                mismatched.push(format!(
                    "tenant {} != {}",
                    payment.tenant_id, lease.tenant_id
                ));
            }
            if payment.property_id != lease.property_id {
                mismatched.push(format!(
                    "property {} != {}",
                    payment.property_id, lease.property_id
                ));
            }
            if mismatched.is_empty() {
                return None;
            }
            Some(finding(
                IssueLevel::Error,
                Severity::High,
                format!(
                    "Payment {} references do not match lease {}: {}.",
                    payment.id,
                    lease.id,
                    mismatched.join(", ")
                ),
                lease,
                vec![payment.id.clone()],
                true,
            ))
        })
        .collect()
}

pub fn check_due_dates(lease: &Lease, payments: &[Payment]) -> Vec<Inconsistency> {
    payments
        .iter()
        .filter(|payment| !payment.is_deleted() && !lease.covers(payment.due_date))
        .map(|payment| {
            finding(
                IssueLevel::Warning,
                Severity::Medium,
                format!(
                    "Payment {} is due {} outside lease {} period {}..{}.",
                    payment.id, payment.due_date, lease.id, lease.start_date, lease.end_date
                ),
                lease,
                vec![payment.id.clone()],
                false,
            )
        })
        .collect()
}

pub fn check_closed_lease_payments(
    lease: &Lease,
    payments: &[Payment],
    today: NaiveDate,
) -> Vec<Inconsistency> {
    let affected: Vec<String> = payments
        .iter()
        .filter(|payment| !payment.is_deleted() && is_cancellable_on_close(lease, payment, today))
        .map(|payment| payment.id.clone())
        .collect();
    if affected.is_empty() {
        return Vec::new();
    }
    vec![finding(
        IssueLevel::Warning,
        Severity::High,
        format!(
            "Lease {} is {} but {} future payment(s) are still awaiting payment.",
            lease.id,
            lease.status.as_str(),
            affected.len()
        ),
        lease,
        affected,
        true,
    )]
}

pub fn check_overdue_promotion(
    lease: &Lease,
    payments: &[Payment],
    today: NaiveDate,
) -> Vec<Inconsistency> {
    let affected: Vec<String> = payments
        .iter()
        .filter(|payment| !payment.is_deleted() && is_overdue_eligible(payment, today))
        .map(|payment| payment.id.clone())
        .collect();
    if affected.is_empty() {
        return Vec::new();
    }
    vec![finding(
        IssueLevel::Warning,
        Severity::Medium,
        format!(
            "{} unpaid past-due payment(s) on lease {} are not marked overdue.",
            affected.len(),
            lease.id
        ),
        lease,
        affected,
        true,
    )]
}

/// Compares the stored lease payment status with the one its payments imply
/// once the status rules have run.
pub fn check_lease_payment_status(
    lease: &Lease,
    payments: &[Payment],
    today: NaiveDate,
) -> Vec<Inconsistency> {
    let expected = derive_lease_payment_status(
        payments
            .iter()
            .filter(|payment| !payment.is_deleted())
            .map(|payment| {
                derive_payment_update(lease, payment, today)
                    .map(|change| change.to)
                    .unwrap_or(payment.status)
            }),
    );
    if lease.payment_status == Some(expected) {
        return Vec::new();
    }
    let stored = lease
        .payment_status
        .map(|status| status.as_str())
        .unwrap_or("unset");
    vec![finding(
        IssueLevel::Warning,
        Severity::Low,
        format!(
            "Lease {} payment status is {stored}, expected {}.",
            lease.id,
            expected.as_str()
        ),
        lease,
        Vec::new(),
        true,
    )]
}
