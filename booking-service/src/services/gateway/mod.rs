//! Payment gateway abstraction.
//!
//! The reconciliation engine talks to the provider only through
//! [`PaymentGateway`], so the Cashfree client can be swapped for the mock in
//! tests. Statuses coming back are raw provider strings; mapping them is the
//! engine's job.

pub mod cashfree;
pub mod mock;

pub use cashfree::{webhook_signature, CashfreeClient};
pub use mock::MockGateway;

use crate::models::{CustomerDetails, Metadata, RefundSpeed, WebhookEventType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use thiserror::Error;

/// Error type for gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("{operation}: provider credentials not configured")]
    NotConfigured { operation: &'static str },

    #[error("{operation} rejected with HTTP {status}: {message}")]
    Api {
        operation: &'static str,
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    #[error("{operation} transport error: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    #[error("{operation} returned an unreadable response: {message}")]
    Decode {
        operation: &'static str,
        message: String,
    },
}

impl GatewayError {
    pub fn operation(&self) -> &'static str {
        match self {
            Self::NotConfigured { operation }
            | Self::Api { operation, .. }
            | Self::Timeout { operation }
            | Self::Transport { operation, .. }
            | Self::Decode { operation, .. } => operation,
        }
    }

    /// Whether the provider may have acted on the request despite the error.
    ///
    /// Timeouts, dropped connections, unreadable responses and provider 5xx
    /// leave the outcome open. Only a configuration error or a 4xx rejection
    /// proves nothing happened upstream.
    pub fn outcome_unknown(&self) -> bool {
        match self {
            Self::NotConfigured { .. } => false,
            Self::Api { status, .. } => *status >= 500,
            Self::Timeout { .. } | Self::Transport { .. } | Self::Decode { .. } => true,
        }
    }

    /// Message safe to show end users: the operation and failure class only.
    pub fn public_message(&self) -> String {
        match self {
            Self::NotConfigured { operation } => format!("{} unavailable", operation),
            Self::Api {
                operation, code, ..
            } => match code {
                Some(code) => format!("{} rejected by provider ({})", operation, code),
                None => format!("{} rejected by provider", operation),
            },
            Self::Timeout { operation } => format!("{} timed out", operation),
            Self::Transport { operation, .. } | Self::Decode { operation, .. } => {
                format!("{} failed", operation)
            }
        }
    }
}

/// Order creation request.
#[derive(Debug, Clone)]
pub struct CreateOrderParams {
    pub order_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub customer: CustomerDetails,
    pub return_url: Option<String>,
    pub notify_url: Option<String>,
    pub note: Option<String>,
    pub tags: Metadata,
    pub expiry_time: Option<DateTime<Utc>>,
}

/// Order as seen by the provider.
#[derive(Debug, Clone)]
pub struct GatewayOrder {
    pub provider_order_id: Option<String>,
    pub order_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    pub payment_session_id: Option<String>,
    pub expiry_time: Option<DateTime<Utc>>,
}

/// One payment attempt as seen by the provider.
#[derive(Debug, Clone)]
pub struct GatewayPayment {
    pub provider_payment_id: String,
    pub order_id: Option<String>,
    pub amount: Decimal,
    pub currency: Option<String>,
    pub status: String,
    pub message: Option<String>,
    pub payment_time: Option<DateTime<Utc>>,
    pub bank_reference: Option<String>,
    pub auth_id: Option<String>,
    pub payment_group: Option<String>,
    pub payment_method: serde_json::Value,
    pub failure_reason: Option<String>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct CreateLinkParams {
    pub link_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub purpose: String,
    pub customer: CustomerDetails,
    pub return_url: Option<String>,
    pub notify_url: Option<String>,
    pub notes: Metadata,
    pub expiry_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct GatewayLink {
    pub provider_link_id: Option<String>,
    pub link_id: String,
    pub link_url: String,
    pub status: String,
    pub expiry_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CreateRefundParams {
    pub refund_id: String,
    pub amount: Decimal,
    pub note: Option<String>,
    pub speed: RefundSpeed,
}

/// Refund as seen by the provider.
#[derive(Debug, Clone)]
pub struct GatewayRefund {
    pub provider_refund_id: Option<String>,
    pub refund_id: String,
    pub order_id: Option<String>,
    pub amount: Decimal,
    pub status: String,
    pub arn: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub raw: serde_json::Value,
}

/// The parts of a verified webhook body stored before it is interpreted.
///
/// Reading it never fails: a body that is not JSON has a `null` payload and
/// an unknown event type.
#[derive(Debug, Clone)]
pub struct WebhookEnvelope {
    pub event_type: WebhookEventType,
    pub order_id: Option<String>,
    pub payload: serde_json::Value,
}

/// Provider-neutral view of a verified webhook body.
#[derive(Debug, Clone)]
pub struct WebhookNotification {
    pub event_type: WebhookEventType,
    pub order_id: Option<String>,
    pub payment: Option<GatewayPayment>,
    pub refund: Option<GatewayRefund>,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Name matching `payment_providers.provider_name`.
    fn provider_name(&self) -> &'static str;

    async fn create_order(&self, params: &CreateOrderParams) -> Result<GatewayOrder, GatewayError>;

    async fn get_order(&self, order_id: &str) -> Result<GatewayOrder, GatewayError>;

    async fn get_order_payments(&self, order_id: &str)
        -> Result<Vec<GatewayPayment>, GatewayError>;

    async fn create_payment_link(
        &self,
        params: &CreateLinkParams,
    ) -> Result<GatewayLink, GatewayError>;

    async fn create_refund(
        &self,
        order_id: &str,
        params: &CreateRefundParams,
    ) -> Result<GatewayRefund, GatewayError>;

    async fn get_order_refunds(&self, order_id: &str) -> Result<Vec<GatewayRefund>, GatewayError>;

    /// Check `signature` against the exact raw body bytes and timestamp header.
    fn verify_webhook_signature(&self, signature: &str, raw_body: &str, timestamp: &str) -> bool;

    /// Event type, order id and JSON payload of a verified body, for storage.
    fn webhook_envelope(&self, raw_body: &str) -> WebhookEnvelope;

    /// Parse a body that already passed [`Self::verify_webhook_signature`].
    fn parse_webhook(&self, raw_body: &str) -> Result<WebhookNotification, GatewayError>;
}

fn random_hex_suffix() -> String {
    format!("{:08X}", rand::thread_rng().gen::<u32>())
}

/// `<PREFIX>_<epoch millis>_<8 hex>`, e.g. `METRO_1736500000000_9F2C41AB`.
pub fn generate_order_id(prefix: &str) -> String {
    format!(
        "{}_{}_{}",
        prefix,
        Utc::now().timestamp_millis(),
        random_hex_suffix()
    )
}

pub fn generate_refund_id() -> String {
    generate_order_id("REF")
}

pub fn generate_link_id() -> String {
    format!("LINK_{}", uuid::Uuid::new_v4().simple().to_string().to_uppercase())
}
