//! In-memory gateway for tests and local development.
//!
//! Speaks the Cashfree webhook dialect so signed bodies built for the real
//! client verify and parse the same way here.

use super::cashfree::{parse_webhook_body, read_webhook_envelope, webhook_signature};
use super::{
    CreateLinkParams, CreateOrderParams, CreateRefundParams, GatewayError, GatewayLink,
    GatewayOrder, GatewayPayment, GatewayRefund, PaymentGateway, WebhookEnvelope,
    WebhookNotification,
};
use async_trait::async_trait;
use service_core::utils::signature::constant_time_eq;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    /// Provider 500 before anything happens.
    ServerError,
    /// Provider 400 before anything happens.
    Rejected,
    /// The call takes effect but the response never arrives.
    TimedOut,
}

#[derive(Default)]
struct MockState {
    orders: HashMap<String, GatewayOrder>,
    payments: HashMap<String, Vec<GatewayPayment>>,
    refunds: HashMap<String, Vec<GatewayRefund>>,
    failing: HashMap<&'static str, Failure>,
    refund_status: Option<String>,
    calls: Vec<&'static str>,
}

/// Mock payment gateway.
pub struct MockGateway {
    secret: String,
    state: Mutex<MockState>,
}

impl MockGateway {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every call to `operation` fail with a provider 500.
    pub fn fail(&self, operation: &'static str) {
        self.state().failing.insert(operation, Failure::ServerError);
    }

    /// Make every call to `operation` fail with a provider 400.
    pub fn reject(&self, operation: &'static str) {
        self.state().failing.insert(operation, Failure::Rejected);
    }

    /// Apply every call to `operation` but report a timeout to the caller.
    pub fn time_out(&self, operation: &'static str) {
        self.state().failing.insert(operation, Failure::TimedOut);
    }

    pub fn recover(&self, operation: &'static str) {
        self.state().failing.remove(operation);
    }

    /// Provider status returned for refunds created from now on.
    pub fn set_refund_status(&self, status: &str) {
        self.state().refund_status = Some(status.to_string());
    }

    pub fn set_payments(&self, order_id: &str, payments: Vec<GatewayPayment>) {
        self.state().payments.insert(order_id.to_string(), payments);
    }

    /// Change the status the provider reports for an existing refund.
    pub fn settle_refund(&self, refund_id: &str, status: &str) {
        let mut state = self.state();
        for refund in state.refunds.values_mut().flatten() {
            if refund.refund_id == refund_id {
                refund.status = status.to_string();
            }
        }
    }

    /// Operations invoked so far, in call order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.state().calls.iter().filter(|c| **c == operation).count()
    }

    /// Sign `raw_body` the way the provider would.
    pub fn sign(&self, timestamp: &str, raw_body: &str) -> String {
        webhook_signature(&self.secret, timestamp, raw_body).unwrap_or_default()
    }

    fn enter(&self, operation: &'static str) -> Result<MutexGuard<'_, MockState>, GatewayError> {
        let mut state = self.state();
        state.calls.push(operation);
        let status = match state.failing.get(operation).copied() {
            Some(Failure::ServerError) => 500,
            Some(Failure::Rejected) => 400,
            Some(Failure::TimedOut) | None => return Ok(state),
        };
        Err(GatewayError::Api {
            operation,
            status,
            code: Some("mock_failure".to_string()),
            message: format!("{} forced to fail", operation),
        })
    }

    fn respond<T>(state: &MockState, operation: &'static str, value: T) -> Result<T, GatewayError> {
        match state.failing.get(operation) {
            Some(Failure::TimedOut) => Err(GatewayError::Timeout { operation }),
            _ => Ok(value),
        }
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn provider_name(&self) -> &'static str {
        "cashfree"
    }

    async fn create_order(&self, params: &CreateOrderParams) -> Result<GatewayOrder, GatewayError> {
        let mut state = self.enter("create_order")?;
        let order = GatewayOrder {
            provider_order_id: Some(format!("cf_{}", state.orders.len() + 1)),
            order_id: params.order_id.clone(),
            amount: params.amount,
            currency: params.currency.clone(),
            status: "ACTIVE".to_string(),
            payment_session_id: Some(format!("session_{}", params.order_id)),
            expiry_time: params.expiry_time,
        };
        state.orders.insert(params.order_id.clone(), order.clone());
        Self::respond(&state, "create_order", order)
    }

    async fn get_order(&self, order_id: &str) -> Result<GatewayOrder, GatewayError> {
        let state = self.enter("get_order")?;
        let order = state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| GatewayError::Api {
                operation: "get_order",
                status: 404,
                code: Some("order_not_found".to_string()),
                message: format!("order {} not found", order_id),
            })?;
        Self::respond(&state, "get_order", order)
    }

    async fn get_order_payments(
        &self,
        order_id: &str,
    ) -> Result<Vec<GatewayPayment>, GatewayError> {
        let state = self.enter("get_order_payments")?;
        let payments = state.payments.get(order_id).cloned().unwrap_or_default();
        Self::respond(&state, "get_order_payments", payments)
    }

    async fn create_payment_link(
        &self,
        params: &CreateLinkParams,
    ) -> Result<GatewayLink, GatewayError> {
        let state = self.enter("create_payment_link")?;
        let link = GatewayLink {
            provider_link_id: Some(format!("cf_{}", params.link_id)),
            link_id: params.link_id.clone(),
            link_url: format!("https://payments.test/links/{}", params.link_id),
            status: "ACTIVE".to_string(),
            expiry_time: params.expiry_time,
        };
        Self::respond(&state, "create_payment_link", link)
    }

    async fn create_refund(
        &self,
        order_id: &str,
        params: &CreateRefundParams,
    ) -> Result<GatewayRefund, GatewayError> {
        let mut state = self.enter("create_refund")?;
        let status = state
            .refund_status
            .clone()
            .unwrap_or_else(|| "PENDING".to_string());
        let refund = GatewayRefund {
            provider_refund_id: Some(format!("cf_{}", params.refund_id)),
            refund_id: params.refund_id.clone(),
            order_id: Some(order_id.to_string()),
            amount: params.amount,
            status,
            arn: None,
            processed_at: None,
            raw: serde_json::json!({ "refund_id": params.refund_id }),
        };
        state
            .refunds
            .entry(order_id.to_string())
            .or_default()
            .push(refund.clone());
        Self::respond(&state, "create_refund", refund)
    }

    async fn get_order_refunds(&self, order_id: &str) -> Result<Vec<GatewayRefund>, GatewayError> {
        let state = self.enter("get_order_refunds")?;
        let refunds = state.refunds.get(order_id).cloned().unwrap_or_default();
        Self::respond(&state, "get_order_refunds", refunds)
    }

    fn verify_webhook_signature(&self, signature: &str, raw_body: &str, timestamp: &str) -> bool {
        constant_time_eq(&self.sign(timestamp, raw_body), signature)
    }

    fn webhook_envelope(&self, raw_body: &str) -> WebhookEnvelope {
        read_webhook_envelope(raw_body)
    }

    fn parse_webhook(&self, raw_body: &str) -> Result<WebhookNotification, GatewayError> {
        parse_webhook_body(raw_body)
    }
}
