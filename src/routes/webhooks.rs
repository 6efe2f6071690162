use axum::{extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};

use crate::{
    error::{AppError, AppResult},
    services::gateway_events::{
        handle_gateway_event, parse_stripe_event, verify_stripe_signature, GatewayOutcome,
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new().route("/webhooks/stripe", axum::routing::post(stripe_webhook))
}

/// Stripe webhook handler: applies payment intent results to payments.
async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> AppResult<Json<Value>> {
    if let Some(secret) = state.config.stripe_webhook_secret.as_deref() {
        let signature = headers
            .get("stripe-signature")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !verify_stripe_signature(&body, signature, secret, state.clock.now().timestamp()) {
            return Err(AppError::BadRequest(
                "Invalid Stripe webhook signature.".to_string(),
            ));
        }
    }

    let payload: Value = serde_json::from_str(&body)
        .map_err(|error| AppError::BadRequest(format!("Invalid webhook payload: {error}")))?;

    let outcome = match parse_stripe_event(&payload) {
        Some(event) => {
            handle_gateway_event(
                state.store.as_ref(),
                &state.engine,
                &state.sync_log,
                state.clock.today(),
                &event,
            )
            .await?
        }
        None => GatewayOutcome::Ignored {
            event_type: payload
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
    };

    Ok(Json(json!({ "received": true, "result": outcome })))
}
