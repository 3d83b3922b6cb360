//! Payment provider webhook endpoint.
//!
//! The body is taken as a raw `String` so the signature is checked against
//! the exact bytes the provider signed.

use crate::dtos::WebhookAck;
use crate::services::payments::WebhookOutcome;
use crate::startup::AppState;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use service_core::error::AppError;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";
pub const EVENT_ID_HEADER: &str = "x-webhook-id";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<WebhookAck>), AppError> {
    let (Some(signature), Some(timestamp)) = (
        header(&headers, SIGNATURE_HEADER),
        header(&headers, TIMESTAMP_HEADER),
    ) else {
        tracing::warn!("Webhook missing signature or timestamp header");
        return Err(AppError::Unauthorized(anyhow::anyhow!(
            "Missing webhook signature headers"
        )));
    };

    let outcome = state
        .payments
        .process_webhook(&body, signature, timestamp, header(&headers, EVENT_ID_HEADER))
        .await?;

    let ack = match outcome {
        WebhookOutcome::Processed { webhook_id } => WebhookAck {
            status: "processed",
            webhook_id,
        },
        WebhookOutcome::Duplicate { webhook_id } => WebhookAck {
            status: "duplicate",
            webhook_id,
        },
    };

    Ok((StatusCode::OK, Json(ack)))
}
