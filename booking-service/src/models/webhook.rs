//! Persisted webhook deliveries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookEventStatus {
    Received,
    Processed,
    Failed,
}

impl WebhookEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "processed" => Self::Processed,
            "failed" => Self::Failed,
            _ => Self::Received,
        }
    }
}

/// Event types the reconciliation engine reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEventType {
    PaymentSuccess,
    PaymentFailed,
    PaymentUserDropped,
    PaymentPending,
    RefundStatus,
    Other(String),
}

impl WebhookEventType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "PAYMENT_SUCCESS_WEBHOOK" => Self::PaymentSuccess,
            "PAYMENT_FAILED_WEBHOOK" => Self::PaymentFailed,
            "PAYMENT_USER_DROPPED_WEBHOOK" => Self::PaymentUserDropped,
            "PAYMENT_PENDING_WEBHOOK" => Self::PaymentPending,
            "REFUND_STATUS_WEBHOOK" => Self::RefundStatus,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::PaymentSuccess => "PAYMENT_SUCCESS_WEBHOOK",
            Self::PaymentFailed => "PAYMENT_FAILED_WEBHOOK",
            Self::PaymentUserDropped => "PAYMENT_USER_DROPPED_WEBHOOK",
            Self::PaymentPending => "PAYMENT_PENDING_WEBHOOK",
            Self::RefundStatus => "REFUND_STATUS_WEBHOOK",
            Self::Other(raw) => raw,
        }
    }

    pub fn is_payment_event(&self) -> bool {
        matches!(
            self,
            Self::PaymentSuccess
                | Self::PaymentFailed
                | Self::PaymentUserDropped
                | Self::PaymentPending
        )
    }
}

impl std::fmt::Display for WebhookEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PaymentWebhookEvent {
    pub webhook_id: Uuid,
    pub provider_id: Uuid,
    pub event_type: String,
    pub dedup_key: String,
    pub order_id: Option<String>,
    pub payload: serde_json::Value,
    pub raw_body: String,
    pub signature: String,
    pub webhook_timestamp: String,
    pub status: String,
    pub attempts: i32,
    pub delivery_count: i32,
    pub last_error: Option<String>,
    pub received_utc: DateTime<Utc>,
    pub processed_utc: Option<DateTime<Utc>>,
}

impl PaymentWebhookEvent {
    pub fn parsed_status(&self) -> WebhookEventStatus {
        WebhookEventStatus::from_str(&self.status)
    }
}

/// Values for recording a verified delivery.
#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub provider_id: Uuid,
    pub event_type: String,
    pub dedup_key: String,
    pub order_id: Option<String>,
    pub payload: serde_json::Value,
    pub raw_body: String,
    pub signature: String,
    pub webhook_timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_event_types_are_preserved() {
        let event = WebhookEventType::parse("SETTLEMENT_WEBHOOK");
        assert_eq!(event, WebhookEventType::Other("SETTLEMENT_WEBHOOK".to_string()));
        assert_eq!(event.as_str(), "SETTLEMENT_WEBHOOK");
        assert!(!event.is_payment_event());
    }

    #[test]
    fn payment_events_are_recognised() {
        assert!(WebhookEventType::parse("PAYMENT_USER_DROPPED_WEBHOOK").is_payment_event());
        assert!(!WebhookEventType::parse("REFUND_STATUS_WEBHOOK").is_payment_event());
    }
}
