//! Payment provider status vocabulary and its mapping to internal statuses.
//!
//! Every mapping is total: unrecognised provider strings are logged and fall
//! back to the safe default instead of failing, so one odd status never causes
//! a whole webhook to be dropped.

use super::payment::{LinkStatus, OrderStatus, PaymentStatus, RefundStatus};

fn normalize(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Order status as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderOrderStatus {
    Active,
    Paid,
    Expired,
    Cancelled,
    Unknown(String),
}

impl ProviderOrderStatus {
    pub fn parse(raw: &str) -> Self {
        match normalize(raw).as_str() {
            "ACTIVE" => Self::Active,
            "PAID" => Self::Paid,
            "EXPIRED" => Self::Expired,
            "CANCELLED" => Self::Cancelled,
            _ => Self::Unknown(raw.to_string()),
        }
    }

    pub fn to_internal(&self) -> OrderStatus {
        match self {
            Self::Active => OrderStatus::Active,
            Self::Paid => OrderStatus::Paid,
            Self::Expired => OrderStatus::Expired,
            Self::Cancelled => OrderStatus::Cancelled,
            Self::Unknown(raw) => {
                tracing::warn!(provider_status = %raw, "Unrecognised order status, defaulting to created");
                OrderStatus::Created
            }
        }
    }
}

/// Payment attempt status as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderPaymentStatus {
    Success,
    Failed,
    Pending,
    UserDropped,
    Cancelled,
    Timeout,
    Unknown(String),
}

impl ProviderPaymentStatus {
    pub fn parse(raw: &str) -> Self {
        match normalize(raw).as_str() {
            "SUCCESS" => Self::Success,
            "FAILED" => Self::Failed,
            "PENDING" => Self::Pending,
            "USER_DROPPED" => Self::UserDropped,
            "CANCELLED" => Self::Cancelled,
            "TIMEOUT" => Self::Timeout,
            _ => Self::Unknown(raw.to_string()),
        }
    }

    pub fn to_internal(&self) -> PaymentStatus {
        match self {
            Self::Success => PaymentStatus::Success,
            Self::Failed => PaymentStatus::Failed,
            Self::Pending => PaymentStatus::Pending,
            Self::UserDropped => PaymentStatus::UserDropped,
            Self::Cancelled => PaymentStatus::Cancelled,
            Self::Timeout => PaymentStatus::Timeout,
            Self::Unknown(raw) => {
                tracing::warn!(provider_status = %raw, "Unrecognised payment status, defaulting to initiated");
                PaymentStatus::Initiated
            }
        }
    }

    /// Order status implied by this payment attempt.
    pub fn order_status(&self) -> OrderStatus {
        match self {
            Self::Success => OrderStatus::Paid,
            Self::Failed | Self::UserDropped => OrderStatus::Cancelled,
            Self::Pending => OrderStatus::Active,
            Self::Cancelled | Self::Timeout | Self::Unknown(_) => OrderStatus::Created,
        }
    }
}

/// Refund status as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderRefundStatus {
    Success,
    Pending,
    OnHold,
    Cancelled,
    Failed,
    Unknown(String),
}

impl ProviderRefundStatus {
    pub fn parse(raw: &str) -> Self {
        match normalize(raw).as_str() {
            "SUCCESS" => Self::Success,
            "PENDING" => Self::Pending,
            "ONHOLD" => Self::OnHold,
            "CANCELLED" => Self::Cancelled,
            "FAILED" => Self::Failed,
            _ => Self::Unknown(raw.to_string()),
        }
    }

    pub fn to_internal(&self) -> RefundStatus {
        match self {
            Self::Success => RefundStatus::Successful,
            Self::Pending | Self::OnHold => RefundStatus::Pending,
            Self::Cancelled => RefundStatus::Cancelled,
            Self::Failed => RefundStatus::Failed,
            Self::Unknown(raw) => {
                tracing::warn!(provider_status = %raw, "Unrecognised refund status, defaulting to initiated");
                RefundStatus::Initiated
            }
        }
    }
}

/// Payment link status as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderLinkStatus {
    Active,
    PartiallyPaid,
    Paid,
    Expired,
    Cancelled,
    Unknown(String),
}

impl ProviderLinkStatus {
    pub fn parse(raw: &str) -> Self {
        match normalize(raw).as_str() {
            "ACTIVE" => Self::Active,
            "PARTIALLY_PAID" => Self::PartiallyPaid,
            "PAID" => Self::Paid,
            "EXPIRED" => Self::Expired,
            "CANCELLED" => Self::Cancelled,
            _ => Self::Unknown(raw.to_string()),
        }
    }

    pub fn to_internal(&self) -> LinkStatus {
        match self {
            Self::Active | Self::PartiallyPaid => LinkStatus::Active,
            Self::Paid => LinkStatus::Paid,
            Self::Expired => LinkStatus::Expired,
            Self::Cancelled => LinkStatus::Cancelled,
            Self::Unknown(raw) => {
                tracing::warn!(provider_status = %raw, "Unrecognised link status, defaulting to active");
                LinkStatus::Active
            }
        }
    }
}

pub fn map_order_status(raw: &str) -> OrderStatus {
    ProviderOrderStatus::parse(raw).to_internal()
}

pub fn map_payment_status(raw: &str) -> PaymentStatus {
    ProviderPaymentStatus::parse(raw).to_internal()
}

pub fn map_refund_status(raw: &str) -> RefundStatus {
    ProviderRefundStatus::parse(raw).to_internal()
}

pub fn map_payment_to_order_status(raw: &str) -> OrderStatus {
    ProviderPaymentStatus::parse(raw).order_status()
}

pub fn map_link_status(raw: &str) -> LinkStatus {
    ProviderLinkStatus::parse(raw).to_internal()
}
