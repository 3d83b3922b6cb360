//! Cashfree Payment Gateway (PG) client.
//!
//! Covers the Orders, Payments, Refunds and Payment Links APIs plus webhook
//! signature verification. Requests authenticate with the
//! `x-client-id`/`x-client-secret` header pair and pin `x-api-version`.

use super::{
    CreateLinkParams, CreateOrderParams, CreateRefundParams, GatewayError, GatewayLink,
    GatewayOrder, GatewayPayment, GatewayRefund, PaymentGateway, WebhookEnvelope,
    WebhookNotification,
};
use crate::config::CashfreeConfig;
use crate::models::{CustomerDetails, Metadata, WebhookEventType};
use crate::services::metrics::GATEWAY_REQUEST_DURATION;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use service_core::observability::{TracedClientExt, TracedRequest};
use service_core::utils::signature::{constant_time_eq, hmac_sha256_base64};

pub const PROVIDER_NAME: &str = "cashfree";

/// Cashfree client for interacting with the PG API.
#[derive(Clone)]
pub struct CashfreeClient {
    client: Client,
    config: CashfreeConfig,
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct CfCustomerDetails<'a> {
    customer_id: &'a str,
    customer_phone: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    customer_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    customer_email: Option<&'a str>,
}

impl<'a> From<&'a CustomerDetails> for CfCustomerDetails<'a> {
    fn from(c: &'a CustomerDetails) -> Self {
        Self {
            customer_id: &c.customer_id,
            customer_phone: &c.phone,
            customer_name: c.name.as_deref(),
            customer_email: c.email.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CfMeta<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    return_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notify_url: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct CfCreateOrderRequest<'a> {
    order_id: &'a str,
    #[serde(with = "rust_decimal::serde::float")]
    order_amount: Decimal,
    order_currency: &'a str,
    customer_details: CfCustomerDetails<'a>,
    order_meta: CfMeta<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    order_note: Option<&'a str>,
    order_tags: &'a Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    order_expiry_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CfOrder {
    #[serde(default, deserialize_with = "de_opt_id")]
    cf_order_id: Option<String>,
    order_id: String,
    order_amount: Decimal,
    order_currency: String,
    order_status: String,
    #[serde(default)]
    payment_session_id: Option<String>,
    #[serde(default)]
    order_expiry_time: Option<String>,
}

impl From<CfOrder> for GatewayOrder {
    fn from(o: CfOrder) -> Self {
        Self {
            provider_order_id: o.cf_order_id,
            order_id: o.order_id,
            amount: o.order_amount,
            currency: o.order_currency,
            status: o.order_status,
            payment_session_id: o.payment_session_id,
            expiry_time: parse_time(o.order_expiry_time.as_deref()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CfErrorDetails {
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    error_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CfPayment {
    #[serde(deserialize_with = "de_id")]
    cf_payment_id: String,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    payment_amount: Decimal,
    #[serde(default)]
    payment_currency: Option<String>,
    payment_status: String,
    #[serde(default)]
    payment_message: Option<String>,
    #[serde(default)]
    payment_time: Option<String>,
    #[serde(default)]
    bank_reference: Option<String>,
    #[serde(default)]
    auth_id: Option<String>,
    #[serde(default)]
    payment_group: Option<String>,
    #[serde(default)]
    payment_method: Option<serde_json::Value>,
    #[serde(default)]
    error_details: Option<CfErrorDetails>,
}

impl CfPayment {
    fn into_gateway(self, raw: serde_json::Value) -> GatewayPayment {
        let failure_reason = self
            .error_details
            .and_then(|e| e.error_reason.or(e.error_description));
        GatewayPayment {
            provider_payment_id: self.cf_payment_id,
            order_id: self.order_id,
            amount: self.payment_amount,
            currency: self.payment_currency,
            status: self.payment_status,
            message: self.payment_message,
            payment_time: parse_time(self.payment_time.as_deref()),
            bank_reference: self.bank_reference,
            auth_id: self.auth_id,
            payment_group: self.payment_group,
            payment_method: self.payment_method.unwrap_or(serde_json::Value::Null),
            failure_reason,
            raw,
        }
    }
}

#[derive(Debug, Serialize)]
struct CfCreateRefundRequest<'a> {
    refund_id: &'a str,
    #[serde(with = "rust_decimal::serde::float")]
    refund_amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    refund_note: Option<&'a str>,
    refund_speed: &'a str,
}

#[derive(Debug, Deserialize)]
struct CfRefund {
    #[serde(default, deserialize_with = "de_opt_id")]
    cf_refund_id: Option<String>,
    refund_id: String,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    refund_amount: Decimal,
    refund_status: String,
    #[serde(default)]
    refund_arn: Option<String>,
    #[serde(default)]
    processed_at: Option<String>,
}

impl CfRefund {
    fn into_gateway(self, raw: serde_json::Value) -> GatewayRefund {
        GatewayRefund {
            provider_refund_id: self.cf_refund_id,
            refund_id: self.refund_id,
            order_id: self.order_id,
            amount: self.refund_amount,
            status: self.refund_status,
            arn: self.refund_arn,
            processed_at: parse_time(self.processed_at.as_deref()),
            raw,
        }
    }
}

#[derive(Debug, Serialize)]
struct CfCreateLinkRequest<'a> {
    link_id: &'a str,
    #[serde(with = "rust_decimal::serde::float")]
    link_amount: Decimal,
    link_currency: &'a str,
    link_purpose: &'a str,
    customer_details: CfCustomerDetails<'a>,
    link_meta: CfMeta<'a>,
    link_notes: &'a Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    link_expiry_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CfLink {
    #[serde(default, deserialize_with = "de_opt_id")]
    cf_link_id: Option<String>,
    link_id: String,
    link_url: String,
    link_status: String,
    #[serde(default)]
    link_expiry_time: Option<String>,
}

/// Error body returned on non-2xx responses.
#[derive(Debug, Default, Deserialize)]
struct CfApiError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CfWebhookEnvelope {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CfWebhookOrder {
    order_id: String,
}

fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    de_opt_id(deserializer)?.ok_or_else(|| serde::de::Error::custom("missing identifier"))
}

/// Cashfree ids arrive as JSON strings or numbers depending on the endpoint.
fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        match Option::<serde_json::Value>::deserialize(deserializer)? {
            Some(serde_json::Value::String(s)) => Some(s),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        },
    )
}

fn parse_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn format_time(time: Option<DateTime<Utc>>) -> Option<String> {
    time.map(|t| t.to_rfc3339())
}

// ============================================================================
// Client
// ============================================================================

impl CashfreeClient {
    pub fn new(config: CashfreeConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| GatewayError::Transport {
                operation: "client_init",
                message: e.to_string(),
            })?;

        Ok(Self { client, config })
    }

    /// Check if Cashfree is configured (credentials are set).
    pub fn is_configured(&self) -> bool {
        !self.config.client_id.is_empty() && !self.config.client_secret.expose_secret().is_empty()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, request: TracedRequest) -> TracedRequest {
        request
            .header("x-client-id", &self.config.client_id)
            .header("x-client-secret", self.config.client_secret.expose_secret())
            .header("x-api-version", &self.config.api_version)
    }

    /// Send a request and decode the success body as `T`.
    async fn execute<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: TracedRequest,
    ) -> Result<T, GatewayError> {
        if !self.is_configured() {
            return Err(GatewayError::NotConfigured { operation });
        }

        let timer = GATEWAY_REQUEST_DURATION
            .with_label_values(&[operation])
            .start_timer();

        let response = self.authorized(request).send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout { operation }
            } else {
                GatewayError::Transport {
                    operation,
                    message: e.to_string(),
                }
            }
        });
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                timer.observe_duration();
                tracing::error!(operation, error = %e, "Cashfree request failed");
                return Err(e);
            }
        };

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout { operation }
            } else {
                GatewayError::Transport {
                    operation,
                    message: e.to_string(),
                }
            }
        });
        timer.observe_duration();
        let body = body?;

        tracing::debug!(operation, status = %status, "Cashfree response");

        if !status.is_success() {
            let error: CfApiError = serde_json::from_str(&body).unwrap_or_default();
            tracing::error!(
                operation,
                status = status.as_u16(),
                code = ?error.code,
                "Cashfree rejected request"
            );
            return Err(GatewayError::Api {
                operation,
                status: status.as_u16(),
                code: error.code,
                message: error.message.unwrap_or(body),
            });
        }

        serde_json::from_str(&body).map_err(|e| GatewayError::Decode {
            operation,
            message: e.to_string(),
        })
    }

    fn decode_payment(
        operation: &'static str,
        raw: serde_json::Value,
    ) -> Result<GatewayPayment, GatewayError> {
        let payment: CfPayment =
            serde_json::from_value(raw.clone()).map_err(|e| GatewayError::Decode {
                operation,
                message: e.to_string(),
            })?;
        Ok(payment.into_gateway(raw))
    }

    fn decode_refund(
        operation: &'static str,
        raw: serde_json::Value,
    ) -> Result<GatewayRefund, GatewayError> {
        let refund: CfRefund =
            serde_json::from_value(raw.clone()).map_err(|e| GatewayError::Decode {
                operation,
                message: e.to_string(),
            })?;
        Ok(refund.into_gateway(raw))
    }

    fn compute_signature(&self, timestamp: &str, raw_body: &str) -> Result<String, anyhow::Error> {
        webhook_signature(self.config.client_secret.expose_secret(), timestamp, raw_body)
    }
}

#[async_trait]
impl PaymentGateway for CashfreeClient {
    fn provider_name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn create_order(&self, params: &CreateOrderParams) -> Result<GatewayOrder, GatewayError> {
        let body = CfCreateOrderRequest {
            order_id: &params.order_id,
            order_amount: params.amount,
            order_currency: &params.currency,
            customer_details: (&params.customer).into(),
            order_meta: CfMeta {
                return_url: params.return_url.as_deref(),
                notify_url: params.notify_url.as_deref(),
            },
            order_note: params.note.as_deref(),
            order_tags: &params.tags,
            order_expiry_time: format_time(params.expiry_time),
        };

        let request = self.client.traced_post(&self.url("/orders")).json(&body);
        let order: CfOrder = self.execute("create_order", request).await?;

        tracing::info!(
            order_id = %order.order_id,
            amount = %order.order_amount,
            status = %order.order_status,
            "Cashfree order created"
        );
        Ok(order.into())
    }

    async fn get_order(&self, order_id: &str) -> Result<GatewayOrder, GatewayError> {
        let request = self
            .client
            .traced_get(&self.url(&format!("/orders/{}", order_id)));
        let order: CfOrder = self.execute("get_order", request).await?;
        Ok(order.into())
    }

    async fn get_order_payments(
        &self,
        order_id: &str,
    ) -> Result<Vec<GatewayPayment>, GatewayError> {
        let request = self
            .client
            .traced_get(&self.url(&format!("/orders/{}/payments", order_id)));
        let raw: Vec<serde_json::Value> = self.execute("get_order_payments", request).await?;
        raw.into_iter()
            .map(|p| Self::decode_payment("get_order_payments", p))
            .collect()
    }

    async fn create_payment_link(
        &self,
        params: &CreateLinkParams,
    ) -> Result<GatewayLink, GatewayError> {
        let body = CfCreateLinkRequest {
            link_id: &params.link_id,
            link_amount: params.amount,
            link_currency: &params.currency,
            link_purpose: &params.purpose,
            customer_details: (&params.customer).into(),
            link_meta: CfMeta {
                return_url: params.return_url.as_deref(),
                notify_url: params.notify_url.as_deref(),
            },
            link_notes: &params.notes,
            link_expiry_time: format_time(params.expiry_time),
        };

        let request = self.client.traced_post(&self.url("/links")).json(&body);
        let link: CfLink = self.execute("create_payment_link", request).await?;

        tracing::info!(link_id = %link.link_id, status = %link.link_status, "Cashfree link created");
        Ok(GatewayLink {
            provider_link_id: link.cf_link_id,
            link_id: link.link_id,
            link_url: link.link_url,
            status: link.link_status,
            expiry_time: parse_time(link.link_expiry_time.as_deref()),
        })
    }

    async fn create_refund(
        &self,
        order_id: &str,
        params: &CreateRefundParams,
    ) -> Result<GatewayRefund, GatewayError> {
        let body = CfCreateRefundRequest {
            refund_id: &params.refund_id,
            refund_amount: params.amount,
            refund_note: params.note.as_deref(),
            refund_speed: params.speed.as_str(),
        };

        let request = self
            .client
            .traced_post(&self.url(&format!("/orders/{}/refunds", order_id)))
            .json(&body);
        let raw: serde_json::Value = self.execute("create_refund", request).await?;
        let refund = Self::decode_refund("create_refund", raw)?;

        tracing::info!(
            order_id,
            refund_id = %refund.refund_id,
            status = %refund.status,
            "Cashfree refund created"
        );
        Ok(refund)
    }

    async fn get_order_refunds(&self, order_id: &str) -> Result<Vec<GatewayRefund>, GatewayError> {
        let request = self
            .client
            .traced_get(&self.url(&format!("/orders/{}/refunds", order_id)));
        let raw: Vec<serde_json::Value> = self.execute("get_order_refunds", request).await?;
        raw.into_iter()
            .map(|r| Self::decode_refund("get_order_refunds", r))
            .collect()
    }

    fn verify_webhook_signature(&self, signature: &str, raw_body: &str, timestamp: &str) -> bool {
        if !self.is_configured() {
            tracing::warn!("Webhook received but Cashfree credentials are not configured");
            return false;
        }

        let expected = match self.compute_signature(timestamp, raw_body) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "Failed to compute webhook signature");
                return false;
            }
        };

        let is_valid = constant_time_eq(&expected, signature.trim());
        if !is_valid {
            tracing::warn!("Webhook signature verification failed");
        }
        is_valid
    }

    fn webhook_envelope(&self, raw_body: &str) -> WebhookEnvelope {
        read_webhook_envelope(raw_body)
    }

    fn parse_webhook(&self, raw_body: &str) -> Result<WebhookNotification, GatewayError> {
        parse_webhook_body(raw_body)
    }
}

/// Event type stored for bodies that do not name one.
const UNKNOWN_EVENT_TYPE: &str = "UNKNOWN";
/// Width of the `event_type` and `order_id` columns.
const MAX_STORED_ID_LEN: usize = 64;

/// Pick the storable fields out of a webhook body of any shape.
pub(crate) fn read_webhook_envelope(raw_body: &str) -> WebhookEnvelope {
    let payload =
        serde_json::from_str::<serde_json::Value>(raw_body).unwrap_or(serde_json::Value::Null);
    let short_str = |pointer: &str| {
        payload
            .pointer(pointer)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty() && s.len() <= MAX_STORED_ID_LEN)
            .map(str::to_string)
    };

    let event_type = short_str("/type").unwrap_or_else(|| UNKNOWN_EVENT_TYPE.to_string());
    let order_id =
        short_str("/data/order/order_id").or_else(|| short_str("/data/refund/order_id"));

    WebhookEnvelope {
        event_type: WebhookEventType::parse(&event_type),
        order_id,
        payload,
    }
}

/// Decode a Cashfree webhook body into the provider-neutral notification.
pub(crate) fn parse_webhook_body(raw_body: &str) -> Result<WebhookNotification, GatewayError> {
    const OPERATION: &str = "parse_webhook";
    let decode_err = |e: serde_json::Error| GatewayError::Decode {
        operation: OPERATION,
        message: e.to_string(),
    };

    let payload: serde_json::Value = serde_json::from_str(raw_body).map_err(decode_err)?;
    let envelope: CfWebhookEnvelope =
        serde_json::from_value(payload.clone()).map_err(decode_err)?;

    let order_id = envelope
        .data
        .get("order")
        .cloned()
        .and_then(|o| serde_json::from_value::<CfWebhookOrder>(o).ok())
        .map(|o| o.order_id);

    let payment = match envelope.data.get("payment") {
        Some(raw) if !raw.is_null() => {
            let mut raw = raw.clone();
            // The payment object omits these; they sit beside it under `data`.
            if let Some(obj) = raw.as_object_mut() {
                if let Some(details) = envelope.data.get("error_details") {
                    obj.entry("error_details").or_insert(details.clone());
                }
                if let Some(id) = &order_id {
                    obj.entry("order_id")
                        .or_insert(serde_json::Value::String(id.clone()));
                }
            }
            Some(CashfreeClient::decode_payment(OPERATION, raw)?)
        }
        _ => None,
    };

    let refund = match envelope.data.get("refund") {
        Some(raw) if !raw.is_null() => Some(CashfreeClient::decode_refund(OPERATION, raw.clone())?),
        _ => None,
    };

    let order_id = order_id.or_else(|| refund.as_ref().and_then(|r| r.order_id.clone()));

    Ok(WebhookNotification {
        event_type: WebhookEventType::parse(&envelope.event_type),
        order_id,
        payment,
        refund,
        payload,
    })
}

/// `base64(HMAC-SHA256(timestamp || raw_body, secret))`.
pub fn webhook_signature(
    secret: &str,
    timestamp: &str,
    raw_body: &str,
) -> Result<String, anyhow::Error> {
    hmac_sha256_base64(
        secret.as_bytes(),
        &[timestamp.as_bytes(), raw_body.as_bytes()],
    )
}
