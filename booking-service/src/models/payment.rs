//! Payment order, transaction, refund and link models.
//!
//! These enums are the internal vocabulary. Provider status strings never reach
//! them directly; see [`super::provider`] for the mapping.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

// ============================================================================
// Order status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Active,
    Paid,
    Expired,
    Cancelled,
    PartiallyRefunded,
    FullyRefunded,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 7] = [
        Self::Created,
        Self::Active,
        Self::Paid,
        Self::Expired,
        Self::Cancelled,
        Self::PartiallyRefunded,
        Self::FullyRefunded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Paid => "paid",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
            Self::PartiallyRefunded => "partially_refunded",
            Self::FullyRefunded => "fully_refunded",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "paid" => Self::Paid,
            "expired" => Self::Expired,
            "cancelled" => Self::Cancelled,
            "partially_refunded" => Self::PartiallyRefunded,
            "fully_refunded" => Self::FullyRefunded,
            _ => Self::Created,
        }
    }

    /// Whether money has been captured for this order.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::Paid | Self::PartiallyRefunded | Self::FullyRefunded
        )
    }

    /// Fold a status observed from the provider into the current one.
    ///
    /// Settled orders only move forward through the refund states, nothing
    /// returns to `created`, and refund states are reachable only from `paid`.
    /// `expired` and `cancelled` are soft-terminal: a later `active` or `paid`
    /// reopens them.
    pub fn next_state(self, observed: OrderStatus) -> OrderStatus {
        use OrderStatus::*;

        match (self, observed) {
            (current, incoming) if current == incoming => current,
            (FullyRefunded, _) => FullyRefunded,
            (PartiallyRefunded, FullyRefunded) => FullyRefunded,
            (PartiallyRefunded, _) => PartiallyRefunded,
            (Paid, PartiallyRefunded | FullyRefunded) => observed,
            (Paid, _) => Paid,
            (_, Created | PartiallyRefunded | FullyRefunded) => self,
            (_, Paid | Active | Expired | Cancelled) => observed,
        }
    }

    /// Status after a refund is accepted, or `None` if the order cannot be refunded.
    pub fn after_refund(self, fully_refunded: bool) -> Option<OrderStatus> {
        match self {
            Self::Paid | Self::PartiallyRefunded => Some(if fully_refunded {
                Self::FullyRefunded
            } else {
                Self::PartiallyRefunded
            }),
            Self::FullyRefunded if fully_refunded => Some(Self::FullyRefunded),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Payment (transaction) status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Initiated,
    Pending,
    Success,
    Failed,
    Cancelled,
    Timeout,
    UserDropped,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::UserDropped => "user_dropped",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "success" => Self::Success,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            "timeout" => Self::Timeout,
            "user_dropped" => Self::UserDropped,
            _ => Self::Initiated,
        }
    }

    /// Progress ordering used by the transaction upsert: a stored status is
    /// only replaced by one of equal or higher rank.
    pub fn rank(&self) -> i16 {
        match self {
            Self::Initiated => 0,
            Self::Pending => 1,
            Self::Failed | Self::Cancelled | Self::Timeout | Self::UserDropped => 2,
            Self::Success => 3,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Refunds
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefundStatus {
    Initiated,
    Pending,
    Processed,
    Successful,
    Failed,
    Cancelled,
}

impl RefundStatus {
    pub const ALL: [RefundStatus; 6] = [
        Self::Initiated,
        Self::Pending,
        Self::Processed,
        Self::Successful,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Successful => "successful",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "processed" => Self::Processed,
            "successful" => Self::Successful,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Initiated,
        }
    }

    /// Refunds in these states still count against the refundable balance.
    pub fn holds_funds(&self) -> bool {
        !matches!(self, Self::Failed | Self::Cancelled)
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Successful | Self::Processed | Self::Failed | Self::Cancelled
        )
    }

    pub fn rank(&self) -> i16 {
        match self {
            Self::Initiated => 0,
            Self::Pending => 1,
            _ => 2,
        }
    }

    /// Fold a status reported by the provider into the stored one.
    ///
    /// Reports never lower the rank and a final status is kept. Reinstating
    /// a released refund is an eligibility decision and is not made here.
    pub fn next_state(self, observed: RefundStatus) -> RefundStatus {
        if self.is_final() || observed.rank() < self.rank() {
            self
        } else {
            observed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefundType {
    Full,
    Partial,
    Cancellation,
    Dispute,
    Goodwill,
}

impl RefundType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Partial => "partial",
            Self::Cancellation => "cancellation",
            Self::Dispute => "dispute",
            Self::Goodwill => "goodwill",
        }
    }

    pub fn for_amount(amount: Decimal, order_amount: Decimal) -> Self {
        if amount >= order_amount {
            Self::Full
        } else {
            Self::Partial
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RefundSpeed {
    #[default]
    Standard,
    Instant,
}

impl RefundSpeed {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "STANDARD",
            Self::Instant => "INSTANT",
        }
    }
}

// ============================================================================
// Links
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Active,
    Paid,
    Expired,
    Cancelled,
    Inactive,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paid => "paid",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
            Self::Inactive => "inactive",
        }
    }
}

// ============================================================================
// Metadata and customer details
// ============================================================================

/// Tags carried on orders and links.
///
/// Recognised keys are typed; anything else lands in `extra` so tags written
/// by newer clients survive a round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl Metadata {
    pub const SOURCE: &'static str = "metropodz_app";

    pub fn for_booking(booking_id: Uuid, user_id: Uuid) -> Self {
        Self {
            booking_id: Some(booking_id),
            user_id: Some(user_id),
            source: Some(Self::SOURCE.to_string()),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerDetails {
    pub customer_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: String,
}

/// Return/notify URLs stored with an order or link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_url: Option<String>,
}

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PaymentProvider {
    pub provider_id: Uuid,
    pub provider_name: String,
    pub is_active: bool,
    pub is_default: bool,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PaymentOrder {
    pub internal_order_id: Uuid,
    pub order_id: String,
    pub user_id: Uuid,
    pub booking_id: Option<Uuid>,
    pub provider_id: Uuid,
    pub provider_order_id: Option<String>,
    pub payment_session_id: Option<String>,
    pub order_amount: Decimal,
    pub order_currency: String,
    pub order_status: String,
    pub customer_details: Json<CustomerDetails>,
    pub order_note: Option<String>,
    pub order_tags: Json<Metadata>,
    pub order_meta: Json<OrderMeta>,
    pub discount_amount: Decimal,
    pub tax_amount: Decimal,
    pub convenience_fee: Decimal,
    pub order_expiry_time: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl PaymentOrder {
    pub fn parsed_status(&self) -> OrderStatus {
        OrderStatus::from_str(&self.order_status)
    }

    /// Booking this order pays for: the column first, then the tags.
    pub fn tagged_booking_id(&self) -> Option<Uuid> {
        self.booking_id.or(self.order_tags.0.booking_id)
    }
}

/// Values for a new order row.
#[derive(Debug, Clone)]
pub struct NewPaymentOrder {
    pub order_id: String,
    pub user_id: Uuid,
    pub booking_id: Option<Uuid>,
    pub provider_id: Uuid,
    pub provider_order_id: Option<String>,
    pub payment_session_id: Option<String>,
    pub order_amount: Decimal,
    pub order_currency: String,
    pub order_status: OrderStatus,
    pub customer_details: CustomerDetails,
    pub order_note: Option<String>,
    pub order_tags: Metadata,
    pub order_meta: OrderMeta,
    pub discount_amount: Decimal,
    pub tax_amount: Decimal,
    pub convenience_fee: Decimal,
    pub order_expiry_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PaymentTransaction {
    pub transaction_id: String,
    pub order_id: String,
    pub provider_payment_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub payment_status: String,
    pub status_rank: i16,
    pub payment_method: Option<String>,
    pub payment_method_details: serde_json::Value,
    pub bank_reference: Option<String>,
    pub auth_id: Option<String>,
    pub payment_message: Option<String>,
    pub failure_reason: Option<String>,
    pub gateway_response: serde_json::Value,
    pub transaction_time: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl PaymentTransaction {
    pub fn parsed_status(&self) -> PaymentStatus {
        PaymentStatus::from_str(&self.payment_status)
    }

    pub fn transaction_id_for(provider_payment_id: &str) -> String {
        format!("TXN_{}", provider_payment_id)
    }
}

/// Values for a transaction upsert.
#[derive(Debug, Clone)]
pub struct TransactionUpsert {
    pub order_id: String,
    pub provider_payment_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub payment_method: Option<String>,
    pub payment_method_details: serde_json::Value,
    pub bank_reference: Option<String>,
    pub auth_id: Option<String>,
    pub payment_message: Option<String>,
    pub failure_reason: Option<String>,
    pub gateway_response: serde_json::Value,
    pub transaction_time: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PaymentRefund {
    pub internal_refund_id: Uuid,
    pub refund_id: String,
    pub order_id: String,
    pub transaction_id: Option<String>,
    pub provider_id: Uuid,
    pub provider_refund_id: Option<String>,
    pub refund_amount: Decimal,
    pub refund_currency: String,
    pub refund_type: String,
    pub refund_status: String,
    pub refund_reason: Option<String>,
    pub refund_note: Option<String>,
    pub refund_speed: String,
    pub refund_arn: Option<String>,
    pub provider_response: serde_json::Value,
    pub refund_initiated_at: DateTime<Utc>,
    pub refund_processed_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl PaymentRefund {
    pub fn parsed_status(&self) -> RefundStatus {
        RefundStatus::from_str(&self.refund_status)
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PaymentLink {
    pub internal_link_id: Uuid,
    pub link_id: String,
    pub created_by_user_id: Uuid,
    pub provider_id: Uuid,
    pub provider_link_id: Option<String>,
    pub link_url: String,
    pub link_purpose: String,
    pub link_amount: Decimal,
    pub link_currency: String,
    pub link_status: String,
    pub customer_details: Json<CustomerDetails>,
    pub link_notes: Json<Metadata>,
    pub link_meta: Json<OrderMeta>,
    pub link_expiry_time: Option<DateTime<Utc>>,
    pub usage_limit: i32,
    pub usage_count: i32,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn settled_orders_never_regress() {
        for observed in OrderStatus::ALL {
            let next = OrderStatus::Paid.next_state(observed);
            assert!(next.is_settled(), "paid moved to {next} on {observed}");
        }
        assert_eq!(
            OrderStatus::FullyRefunded.next_state(OrderStatus::Active),
            OrderStatus::FullyRefunded
        );
        assert_eq!(
            OrderStatus::PartiallyRefunded.next_state(OrderStatus::Paid),
            OrderStatus::PartiallyRefunded
        );
    }

    #[test]
    fn nothing_returns_to_created() {
        for current in OrderStatus::ALL {
            let next = current.next_state(OrderStatus::Created);
            assert_eq!(next, current);
        }
    }

    #[test]
    fn refund_states_require_payment() {
        for current in [
            OrderStatus::Created,
            OrderStatus::Active,
            OrderStatus::Expired,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(current.next_state(OrderStatus::FullyRefunded), current);
            assert_eq!(current.after_refund(false), None);
        }
        assert_eq!(
            OrderStatus::Paid.after_refund(false),
            Some(OrderStatus::PartiallyRefunded)
        );
        assert_eq!(
            OrderStatus::PartiallyRefunded.after_refund(true),
            Some(OrderStatus::FullyRefunded)
        );
    }

    #[test]
    fn soft_terminal_orders_can_reopen() {
        assert_eq!(
            OrderStatus::Expired.next_state(OrderStatus::Paid),
            OrderStatus::Paid
        );
        assert_eq!(
            OrderStatus::Cancelled.next_state(OrderStatus::Active),
            OrderStatus::Active
        );
        assert_eq!(
            OrderStatus::Active.next_state(OrderStatus::Cancelled),
            OrderStatus::Cancelled
        );
    }

    #[test]
    fn success_outranks_terminal_failures() {
        assert!(PaymentStatus::Success.rank() > PaymentStatus::Failed.rank());
        assert!(PaymentStatus::Failed.rank() > PaymentStatus::Pending.rank());
        assert!(PaymentStatus::Pending.rank() > PaymentStatus::Initiated.rank());
    }

    #[test]
    fn refund_status_only_moves_forward() {
        use RefundStatus::*;

        assert_eq!(Initiated.next_state(Pending), Pending);
        assert_eq!(Pending.next_state(Successful), Successful);
        assert_eq!(Pending.next_state(Initiated), Pending);
        assert_eq!(Successful.next_state(Pending), Successful);
        assert_eq!(Successful.next_state(Failed), Successful);
        assert_eq!(Failed.next_state(Successful), Failed);
        assert_eq!(Pending.next_state(Pending), Pending);
        for status in [Successful, Processed, Failed, Cancelled] {
            assert!(status.is_final());
            assert_eq!(status.next_state(Initiated), status);
        }
    }

    #[test]
    fn released_refunds_hold_no_funds() {
        assert!(RefundStatus::Pending.holds_funds());
        assert!(RefundStatus::Successful.holds_funds());
        assert!(!RefundStatus::Failed.holds_funds());
        assert!(!RefundStatus::Cancelled.holds_funds());
    }

    #[test]
    fn refund_type_from_amount() {
        assert_eq!(
            RefundType::for_amount(dec("500.00"), dec("500")),
            RefundType::Full
        );
        assert_eq!(
            RefundType::for_amount(dec("499.99"), dec("500")),
            RefundType::Partial
        );
    }

    #[test]
    fn metadata_keeps_unknown_tags() {
        let raw = r#"{"booking_id":"4f8a1c1e-3b1f-4c55-8a0e-2b7c7d0f9a11","source":"metropodz_app","campaign":"diwali"}"#;
        let tags: Metadata = serde_json::from_str(raw).unwrap();
        assert_eq!(tags.source.as_deref(), Some("metropodz_app"));
        assert_eq!(tags.extra.get("campaign").map(String::as_str), Some("diwali"));
        assert!(tags.user_id.is_none());

        let back = serde_json::to_value(&tags).unwrap();
        assert_eq!(back["campaign"], "diwali");
        assert!(back.get("user_id").is_none());
    }
}
