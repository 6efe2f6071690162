use axum::{routing::get, Router};

use crate::state::AppState;

pub mod health;
pub mod sync;
pub mod webhooks;

pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .merge(sync::router())
        .merge(webhooks::router())
}

#[cfg(test)]
mod tests {
    use super::v1_router;
    use crate::clock::ManualClock;
    use crate::config::AppConfig;
    use crate::models::{
        Lease, LeasePaymentStatus, LeaseStatus, Payment, PaymentStatus, PaymentType, SyncStatus,
    };
    use crate::repository::memory::MemoryStore;
    use crate::state::AppState;
    use axum::body::{to_bytes, Body};
    use axum::http::{header::CONTENT_TYPE, Request, StatusCode};
    use axum::Router;
    use chrono::{NaiveDate, TimeZone, Utc};
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("valid date")
    }

    async fn app(webhook_secret: Option<&str>) -> (Router, MemoryStore) {
        let store = MemoryStore::new();
        store.upsert_lease(Lease {
            id: "lease-1".to_string(),
            tenant_id: "user-1".to_string(),
            property_id: "prop-1".to_string(),
            start_date: date("2026-01-01"),
            end_date: date("2026-12-31"),
            status: LeaseStatus::Active,
            rent_amount: 1200.0,
            rent_due_day: 1,
            payment_status: Some(LeasePaymentStatus::Pending),
        });
        store
            .insert_payment(Payment {
                id: "p1".to_string(),
                lease_id: "lease-1".to_string(),
                tenant_id: "user-1".to_string(),
                property_id: "prop-1".to_string(),
                payment_type: PaymentType::Rent,
                amount: 1200.0,
                amount_paid: 0.0,
                due_date: date("2026-01-01"),
                paid_date: None,
                status: PaymentStatus::Pending,
                notes: None,
                gateway_transaction_id: Some("pi_1".to_string()),
                version: Some(0),
                last_synced_at: Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
                sync_status: Some(SyncStatus::Synced),
                deleted_at: None,
            })
            .expect("insert");

        let mut config = AppConfig::from_env();
        config.stripe_webhook_secret = webhook_secret.map(ToOwned::to_owned);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap(),
        ));
        let state = AppState::with_store(config, Arc::new(store.clone()), clock);
        state.migration.up().await.expect("migration");
        let router = Router::new().nest("/v1", v1_router()).with_state(state);
        (router, store)
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn health_reports_schema_and_db() {
        let (router, _) = app(None).await;
        let (status, body) = send(
            router,
            Request::get("/v1/health").body(Body::empty()).expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["schema_ready"], true);
    }

    #[tokio::test]
    async fn sync_endpoint_returns_result() {
        let (router, store) = app(None).await;
        let (status, body) = send(
            router,
            Request::post("/v1/leases/lease-1/sync")
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"force_sync": false}"#))
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["payments_updated"], 1);
        assert_eq!(store.payment("p1").expect("p1").status, PaymentStatus::Overdue);
    }

    #[tokio::test]
    async fn consistency_of_unknown_lease_is_not_found() {
        let (router, _) = app(None).await;
        let (status, body) = send(
            router,
            Request::get("/v1/leases/missing/consistency")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().is_some());
    }

    #[tokio::test]
    async fn rejects_unknown_stats_window() {
        let (router, _) = app(None).await;
        let (status, _) = send(
            router,
            Request::get("/v1/sync/logs/stats?window=month")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_requires_valid_signature_when_configured() {
        let (router, _) = app(Some("whsec_test")).await;
        let (status, _) = send(
            router,
            Request::post("/v1/webhooks/stripe")
                .header("stripe-signature", "t=1,v1=00")
                .body(Body::from(r#"{"type":"payment_intent.succeeded"}"#))
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_settles_payment() {
        let (router, store) = app(None).await;
        let payload = r#"{
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "data": { "object": { "id": "pi_1", "amount_received": 120000 } }
        }"#;
        let (status, body) = send(
            router,
            Request::post("/v1/webhooks/stripe")
                .body(Body::from(payload))
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["outcome"], "processed");
        assert_eq!(store.payment("p1").expect("p1").status, PaymentStatus::Paid);
    }
}
