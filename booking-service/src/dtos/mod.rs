use crate::models::{CustomerDetails, PodStatus, RefundSpeed};
use crate::services::payments::{BookingPaymentRequest, PaymentLinkRequest, RefundRequest};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ============================================================================
// Bookings and pods
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateBookingRequest {
    pub pod_id: Uuid,
    pub check_in: DateTime<Utc>,
    pub check_out: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePodStatusRequest {
    pub status: PodStatus,
}

// ============================================================================
// Payments
// ============================================================================

/// Customer contact as sent by clients; the customer id is the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct CustomerInput {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: String,
}

impl CustomerInput {
    pub fn into_details(self, user_id: Uuid) -> CustomerDetails {
        CustomerDetails {
            customer_id: user_id.to_string(),
            name: self.name,
            email: self.email,
            phone: self.phone,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreatePaymentOrderRequest {
    pub booking_id: Uuid,
    pub amount: Decimal,
    pub customer_details: CustomerInput,
    pub note: Option<String>,
    pub return_url: Option<String>,
    pub notify_url: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub discount_amount: Decimal,
    #[serde(default)]
    pub tax_amount: Decimal,
    #[serde(default)]
    pub convenience_fee: Decimal,
}

impl CreatePaymentOrderRequest {
    pub fn into_request(self, user_id: Uuid) -> BookingPaymentRequest {
        BookingPaymentRequest {
            user_id,
            booking_id: self.booking_id,
            amount: self.amount,
            customer: self.customer_details.into_details(user_id),
            note: self.note,
            return_url: self.return_url,
            notify_url: self.notify_url,
            tags: self.tags,
            discount_amount: self.discount_amount,
            tax_amount: self.tax_amount,
            convenience_fee: self.convenience_fee,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateRefundRequest {
    pub order_id: String,
    pub refund_amount: Decimal,
    pub refund_reason: Option<String>,
    pub refund_note: Option<String>,
    #[serde(default)]
    pub refund_speed: RefundSpeed,
}

impl From<CreateRefundRequest> for RefundRequest {
    fn from(req: CreateRefundRequest) -> Self {
        RefundRequest {
            order_id: req.order_id,
            amount: req.refund_amount,
            reason: req.refund_reason,
            note: req.refund_note,
            speed: req.refund_speed,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreatePaymentLinkRequest {
    pub amount: Decimal,
    pub purpose: String,
    pub customer_details: CustomerInput,
    pub return_url: Option<String>,
    pub notify_url: Option<String>,
    #[serde(default)]
    pub notes: BTreeMap<String, String>,
    pub expiry_time: Option<DateTime<Utc>>,
    pub usage_limit: Option<i32>,
}

impl CreatePaymentLinkRequest {
    pub fn into_request(self, user_id: Uuid) -> PaymentLinkRequest {
        PaymentLinkRequest {
            user_id,
            amount: self.amount,
            purpose: self.purpose,
            customer: self.customer_details.into_details(user_id),
            return_url: self.return_url,
            notify_url: self.notify_url,
            notes: self.notes,
            expiry_time: self.expiry_time,
            usage_limit: self.usage_limit,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PaymentHistoryQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub status: &'static str,
    pub webhook_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refund_request_defaults_to_standard_speed() {
        let req: CreateRefundRequest =
            serde_json::from_str(r#"{"order_id":"METRO_1","refund_amount":"250.00"}"#).unwrap();
        let refund = RefundRequest::from(req);
        assert_eq!(refund.speed, RefundSpeed::Standard);
        assert_eq!(refund.amount, Decimal::new(25000, 2));
    }

    #[test]
    fn payment_order_request_uses_caller_as_customer() {
        let user_id = Uuid::new_v4();
        let req: CreatePaymentOrderRequest = serde_json::from_value(serde_json::json!({
            "booking_id": Uuid::new_v4(),
            "amount": 500,
            "customer_details": { "name": "Asha", "phone": "9999999999" }
        }))
        .unwrap();

        let request = req.into_request(user_id);
        assert_eq!(request.customer.customer_id, user_id.to_string());
        assert_eq!(request.discount_amount, Decimal::ZERO);
        assert!(request.tags.is_empty());
    }
}
