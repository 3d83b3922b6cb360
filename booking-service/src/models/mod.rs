//! Domain models for booking-service.

#![allow(clippy::should_implement_trait)]

pub mod booking;
pub mod payment;
pub mod pod;
pub mod provider;
pub mod webhook;

pub use booking::{
    AccessCode, AccessCodeStatus, Booking, BookingDetail, BookingStatus, BookingWithAccessCode,
};
pub(crate) use booking::BookingDetailRow;
pub use payment::{
    CustomerDetails, LinkStatus, Metadata, NewPaymentOrder, OrderMeta, OrderStatus, PaymentLink,
    PaymentOrder, PaymentProvider, PaymentRefund, PaymentStatus, PaymentTransaction, RefundSpeed,
    RefundStatus, RefundType, TransactionUpsert,
};
pub use pod::{NewPod, Pod, PodSearch, PodSearchResult, PodStatus, PodSummary, UserSummary};
pub use provider::{
    map_link_status, map_order_status, map_payment_status, map_payment_to_order_status,
    map_refund_status, ProviderOrderStatus, ProviderPaymentStatus, ProviderRefundStatus,
};
pub use webhook::{NewWebhookEvent, PaymentWebhookEvent, WebhookEventStatus, WebhookEventType};
