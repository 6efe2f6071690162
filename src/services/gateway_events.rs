use chrono::NaiveDate;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::{
    error::{AppError, AppResult},
    models::{Payment, PaymentStatus, SyncAction, SyncOutcome, BALANCE_TOLERANCE},
    repository::LedgerStore,
    services::{
        sync_engine::{PaymentSettlement, SyncEngine, SyncResult},
        sync_log::SyncLog,
    },
};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayResult {
    Succeeded,
    Failed,
    Processing,
    Canceled,
    Refunded,
}

impl GatewayResult {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Processing => "processing",
            Self::Canceled => "canceled",
            Self::Refunded => "refunded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayEvent {
    pub event_id: Option<String>,
    pub transaction_id: String,
    pub result: GatewayResult,
    /// Amount collected by the transaction, in major currency units.
    pub amount_received: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GatewayOutcome {
    Ignored { event_type: String },
    Unmatched { transaction_id: String },
    Processed { payment_id: String, sync: SyncResult },
}

/// Verify a Stripe webhook signature using HMAC-SHA256.
///
/// The header has the form `t=<timestamp>,v1=<signature>`; the signed
/// payload is `<timestamp>.<body>`. Signatures more than 5 minutes away from
/// `now_unix` are rejected.
pub fn verify_stripe_signature(
    payload: &str,
    signature_header: &str,
    webhook_secret: &str,
    now_unix: i64,
) -> bool {
    let mut timestamp: Option<&str> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in signature_header.split(',') {
        let part = part.trim();
        if let Some(t) = part.strip_prefix("t=") {
            timestamp = Some(t);
        } else if let Some(v1) = part.strip_prefix("v1=") {
            signatures.push(v1);
        }
    }

    let Some(ts_str) = timestamp else {
        return false;
    };
    let Ok(ts) = ts_str.parse::<i64>() else {
        return false;
    };

    let delta = (now_unix - ts).abs();
    if delta > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(delta, "Stripe webhook signature outside tolerance");
        return false;
    }

    let signed_payload = format!("{ts_str}.{payload}");
    signatures.into_iter().any(|expected_hex| {
        let Ok(expected_bytes) = hex_decode(expected_hex) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(webhook_secret.as_bytes()) else {
            return false;
        };
        mac.update(signed_payload.as_bytes());
        mac.verify_slice(&expected_bytes).is_ok()
    })
}

fn hex_decode(hex: &str) -> Result<Vec<u8>, ()> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return Err(());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

fn cents(object: &Value, key: &str) -> Option<f64> {
    object.get(key).and_then(Value::as_i64).map(|value| value as f64 / 100.0)
}

/// Maps a Stripe webhook payload onto a gateway event. Event types that do
/// not affect payments yield `None`.
pub fn parse_stripe_event(payload: &Value) -> Option<GatewayEvent> {
    let event_type = payload.get("type").and_then(Value::as_str)?;
    let object = payload.get("data").and_then(|data| data.get("object"))?;
    let event_id = payload
        .get("id")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);

    let (result, transaction_key, amount) = match event_type {
        "payment_intent.succeeded" => (
            GatewayResult::Succeeded,
            "id",
            cents(object, "amount_received"),
        ),
        "payment_intent.payment_failed" => (GatewayResult::Failed, "id", None),
        "payment_intent.processing" => (GatewayResult::Processing, "id", None),
        "payment_intent.canceled" => (GatewayResult::Canceled, "id", None),
        "charge.refunded" => (
            GatewayResult::Refunded,
            "payment_intent",
            cents(object, "amount_refunded"),
        ),
        _ => return None,
    };

    let transaction_id = object
        .get(transaction_key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())?
        .to_string();

    Some(GatewayEvent {
        event_id,
        transaction_id,
        result,
        amount_received: amount,
    })
}

/// The payment fields a gateway result implies.
pub fn settlement_for(payment: &Payment, event: &GatewayEvent, today: NaiveDate) -> PaymentSettlement {
    let note = Some(format!(
        "Gateway {} for transaction {}.",
        event.result.as_str(),
        event.transaction_id
    ));
    let gateway_transaction_id = Some(event.transaction_id.clone());

    match event.result {
        GatewayResult::Succeeded => {
            // Redelivered events report the same cumulative amount.
            let received = event.amount_received.unwrap_or(payment.amount);
            let amount_paid = payment.amount_paid.max(received);
            let status = if payment.amount - amount_paid <= BALANCE_TOLERANCE {
                PaymentStatus::Paid
            } else {
                PaymentStatus::PartiallyPaid
            };
            PaymentSettlement {
                status,
                amount_paid,
                paid_date: Some(today),
                gateway_transaction_id,
                note,
            }
        }
        GatewayResult::Failed => PaymentSettlement {
            status: PaymentStatus::Failed,
            amount_paid: payment.amount_paid,
            paid_date: payment.paid_date,
            gateway_transaction_id,
            note,
        },
        GatewayResult::Processing => PaymentSettlement {
            status: PaymentStatus::Processing,
            amount_paid: payment.amount_paid,
            paid_date: payment.paid_date,
            gateway_transaction_id,
            note,
        },
        GatewayResult::Canceled => PaymentSettlement {
            status: PaymentStatus::Pending,
            amount_paid: payment.amount_paid,
            paid_date: payment.paid_date,
            gateway_transaction_id,
            note,
        },
        GatewayResult::Refunded => PaymentSettlement {
            status: PaymentStatus::Refunded,
            amount_paid: 0.0,
            paid_date: None,
            gateway_transaction_id,
            note,
        },
    }
}

pub async fn handle_gateway_event(
    store: &dyn LedgerStore,
    engine: &SyncEngine,
    log: &SyncLog,
    today: NaiveDate,
    event: &GatewayEvent,
) -> AppResult<GatewayOutcome> {
    let Some(payment) = store
        .find_payment_by_transaction(&event.transaction_id)
        .await?
    else {
        log.log_event(
            None,
            None,
            SyncAction::WebhookReceived,
            SyncOutcome::Warning,
            format!(
                "No payment matches gateway transaction {}.",
                event.transaction_id
            ),
            json!({ "event_id": event.event_id, "result": event.result }),
        );
        return Ok(GatewayOutcome::Unmatched {
            transaction_id: event.transaction_id.clone(),
        });
    };

    log.log_event(
        Some(&payment.id),
        Some(&payment.lease_id),
        SyncAction::WebhookReceived,
        SyncOutcome::Success,
        format!(
            "Gateway reported {} for payment {}.",
            event.result.as_str(),
            payment.id
        ),
        json!({
            "event_id": event.event_id,
            "transaction_id": event.transaction_id,
            "amount_received": event.amount_received,
        }),
    );

    let settlement = settlement_for(&payment, event, today);
    let sync = engine.process_payment_and_sync(&payment.id, settlement).await?;
    if !sync.success {
        // A non-2xx answer makes the gateway redeliver the event.
        let reasons = sync
            .errors
            .iter()
            .chain(&sync.warnings)
            .cloned()
            .collect::<Vec<_>>()
            .join("; ");
        tracing::warn!(
            payment_id = %payment.id,
            transaction_id = %event.transaction_id,
            "Gateway settlement not applied: {reasons}"
        );
        let message = format!(
            "Settlement of payment {} was not applied: {reasons}",
            payment.id
        );
        return Err(if sync.errors.is_empty() {
            AppError::Conflict(message)
        } else {
            AppError::Dependency(message)
        });
    }
    Ok(GatewayOutcome::Processed {
        payment_id: payment.id,
        sync,
    })
}
