use chrono::NaiveDate;
use serde::Serialize;

use crate::models::{Lease, LeasePaymentStatus, Payment, PaymentStatus};

/// Aggregate view of a lease's payments.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PaymentSummary {
    pub total_due: f64,
    pub total_paid: f64,
    pub total_overdue: f64,
    pub total_pending: f64,
    pub payment_count: usize,
    pub paid_count: usize,
    pub overdue_count: usize,
    pub pending_count: usize,
    pub next_due_date: Option<NaiveDate>,
}

/// A status transition derived for one payment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentStatusChange {
    pub from: PaymentStatus,
    pub to: PaymentStatus,
    pub note: Option<String>,
}

/// Unpaid and past due, but not yet marked overdue.
pub fn is_overdue_eligible(payment: &Payment, today: NaiveDate) -> bool {
    payment.status.is_pre_overdue() && payment.due_date < today && payment.has_balance()
}

/// Awaiting payment on a closed lease with a due date still ahead.
pub fn is_cancellable_on_close(lease: &Lease, payment: &Payment, today: NaiveDate) -> bool {
    lease.status.is_closed()
        && payment.status.is_awaiting_payment()
        && payment.due_date > today
        && payment.has_balance()
}

pub fn summarize(payments: &[Payment], today: NaiveDate) -> PaymentSummary {
    let mut summary = PaymentSummary::default();
    for payment in payments {
        summary.payment_count += 1;
        summary.total_paid += payment.amount_paid;

        match payment.status {
            PaymentStatus::Cancelled | PaymentStatus::Refunded => continue,
            PaymentStatus::Paid => summary.paid_count += 1,
            PaymentStatus::Overdue => {
                summary.overdue_count += 1;
                summary.total_overdue += payment.balance_remaining();
            }
            PaymentStatus::Scheduled
            | PaymentStatus::Pending
            | PaymentStatus::Processing
            | PaymentStatus::PartiallyPaid
            | PaymentStatus::Failed => {
                summary.pending_count += 1;
                summary.total_pending += payment.balance_remaining();
            }
        }
        summary.total_due += payment.amount;

        if payment.status.is_outstanding() && payment.due_date >= today {
            summary.next_due_date = Some(match summary.next_due_date {
                Some(current) => current.min(payment.due_date),
                None => payment.due_date,
            });
        }
    }
    summary
}

/// Lease-level payment status as a pure function of its payments' statuses.
pub fn derive_lease_payment_status(
    statuses: impl IntoIterator<Item = PaymentStatus>,
) -> LeasePaymentStatus {
    let mut outstanding = false;
    for status in statuses {
        match status {
            PaymentStatus::Overdue => return LeasePaymentStatus::Overdue,
            PaymentStatus::Scheduled
            | PaymentStatus::Pending
            | PaymentStatus::Processing
            | PaymentStatus::PartiallyPaid
            | PaymentStatus::Failed => outstanding = true,
            PaymentStatus::Paid | PaymentStatus::Cancelled | PaymentStatus::Refunded => {}
        }
    }
    if outstanding {
        LeasePaymentStatus::Pending
    } else {
        LeasePaymentStatus::Current
    }
}

/// Status rules applied in order: overdue promotion, then cancellation on a
/// closed lease.
pub fn derive_payment_update(
    lease: &Lease,
    payment: &Payment,
    today: NaiveDate,
) -> Option<PaymentStatusChange> {
    if is_overdue_eligible(payment, today) {
        return Some(PaymentStatusChange {
            from: payment.status,
            to: PaymentStatus::Overdue,
            note: None,
        });
    }
    if is_cancellable_on_close(lease, payment, today) {
        return Some(PaymentStatusChange {
            from: payment.status,
            to: PaymentStatus::Cancelled,
            note: Some(format!(
                "Cancelled automatically: lease {} is {} (due {}).",
                lease.id,
                lease.status.as_str(),
                payment.due_date
            )),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{derive_lease_payment_status, derive_payment_update, summarize};
    use crate::models::{
        Lease, LeasePaymentStatus, LeaseStatus, Payment, PaymentStatus, PaymentType,
    };
    use chrono::NaiveDate;

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("valid date")
    }

    fn lease(status: LeaseStatus) -> Lease {
        Lease {
            id: "lease-1".to_string(),
            tenant_id: "user-1".to_string(),
            property_id: "prop-1".to_string(),
            start_date: date("2026-01-01"),
            end_date: date("2026-12-31"),
            status,
            rent_amount: 1200.0,
            rent_due_day: 1,
            payment_status: None,
        }
    }

    fn payment(status: PaymentStatus, due: &str, paid: f64) -> Payment {
        Payment {
            id: format!("p-{due}"),
            lease_id: "lease-1".to_string(),
            tenant_id: "user-1".to_string(),
            property_id: "prop-1".to_string(),
            payment_type: PaymentType::Rent,
            amount: 1200.0,
            amount_paid: paid,
            due_date: date(due),
            paid_date: None,
            status,
            notes: None,
            gateway_transaction_id: None,
            version: Some(0),
            last_synced_at: None,
            sync_status: None,
            deleted_at: None,
        }
    }

    #[test]
    fn lease_status_follows_payment_statuses() {
        assert_eq!(
            derive_lease_payment_status([PaymentStatus::Paid, PaymentStatus::Overdue]),
            LeasePaymentStatus::Overdue
        );
        assert_eq!(
            derive_lease_payment_status([PaymentStatus::Paid, PaymentStatus::Cancelled]),
            LeasePaymentStatus::Current
        );
        assert_eq!(
            derive_lease_payment_status([PaymentStatus::Paid, PaymentStatus::Scheduled]),
            LeasePaymentStatus::Pending
        );
        assert_eq!(derive_lease_payment_status([]), LeasePaymentStatus::Current);
    }

    #[test]
    fn promotes_unpaid_past_due_to_overdue() {
        let today = date("2026-01-15");
        let change = derive_payment_update(
            &lease(LeaseStatus::Active),
            &payment(PaymentStatus::Pending, "2026-01-14", 0.0),
            today,
        )
        .expect("overdue");
        assert_eq!(change.to, PaymentStatus::Overdue);

        assert!(derive_payment_update(
            &lease(LeaseStatus::Active),
            &payment(PaymentStatus::Pending, "2026-01-14", 1200.0),
            today,
        )
        .is_none());
        assert!(derive_payment_update(
            &lease(LeaseStatus::Active),
            &payment(PaymentStatus::Processing, "2026-01-14", 0.0),
            today,
        )
        .is_none());
    }

    #[test]
    fn cancels_future_payments_on_closed_lease() {
        let today = date("2026-03-10");
        let change = derive_payment_update(
            &lease(LeaseStatus::Terminated),
            &payment(PaymentStatus::Scheduled, "2026-04-01", 0.0),
            today,
        )
        .expect("cancelled");
        assert_eq!(change.to, PaymentStatus::Cancelled);
        assert!(change.note.is_some_and(|note| !note.is_empty()));

        assert!(derive_payment_update(
            &lease(LeaseStatus::Active),
            &payment(PaymentStatus::Scheduled, "2026-04-01", 0.0),
            today,
        )
        .is_none());
    }

    #[test]
    fn summarizes_totals_and_next_due() {
        let today = date("2026-02-15");
        let payments = vec![
            payment(PaymentStatus::Paid, "2026-01-01", 1200.0),
            payment(PaymentStatus::Overdue, "2026-02-01", 200.0),
            payment(PaymentStatus::Pending, "2026-03-01", 0.0),
            payment(PaymentStatus::Cancelled, "2026-04-01", 0.0),
        ];
        let summary = summarize(&payments, today);
        assert_eq!(summary.payment_count, 4);
        assert_eq!(summary.paid_count, 1);
        assert_eq!(summary.overdue_count, 1);
        assert_eq!(summary.pending_count, 1);
        assert!((summary.total_due - 3600.0).abs() < 0.001);
        assert!((summary.total_paid - 1400.0).abs() < 0.001);
        assert!((summary.total_overdue - 1000.0).abs() < 0.001);
        assert!((summary.total_pending - 1200.0).abs() < 0.001);
        assert_eq!(summary.next_due_date, Some(date("2026-03-01")));
    }
}
