//! Payment reconciliation engine.
//!
//! Keeps local orders, transactions and refunds consistent with what the
//! provider reports, whether the news arrives by webhook, by status polling or
//! by the replay worker re-driving stored webhook events.

use crate::config::{PaymentConfig, WebhookReplayConfig};
use crate::models::{
    map_link_status, map_order_status, map_payment_status, map_payment_to_order_status,
    map_refund_status, CustomerDetails, Metadata, NewPaymentOrder, NewWebhookEvent, OrderMeta,
    OrderStatus, PaymentOrder, PaymentProvider, PaymentRefund, PaymentTransaction,
    PaymentWebhookEvent, RefundSpeed, RefundStatus, RefundType, TransactionUpsert,
    WebhookEventStatus, WebhookEventType,
};
use crate::services::database::Database;
use crate::services::error::ServiceError;
use crate::services::gateway::{
    generate_link_id, generate_order_id, generate_refund_id, CreateLinkParams,
    CreateOrderParams, CreateRefundParams, GatewayPayment, GatewayRefund, PaymentGateway,
    WebhookNotification,
};
use crate::services::metrics::{record_payment_operation, record_webhook};
use crate::services::payment_repository::{self as repo, NewLink, NewRefund, RefundUpdate};
use crate::services::reservation::{confirm_in_tx, ConfirmOutcome};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::utils::signature::sha256_hex;
use sqlx::PgConnection;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const ORDER_ID_PREFIX: &str = "METRO";
const DEFAULT_REFUND_NOTE: &str = "Metropodz booking refund";
const DEFAULT_HISTORY_LIMIT: i64 = 20;
const MAX_HISTORY_LIMIT: i64 = 100;

// ============================================================================
// Inputs and results
// ============================================================================

#[derive(Debug, Clone)]
pub struct BookingPaymentRequest {
    pub user_id: Uuid,
    pub booking_id: Uuid,
    pub amount: Decimal,
    pub customer: CustomerDetails,
    pub note: Option<String>,
    pub return_url: Option<String>,
    pub notify_url: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub discount_amount: Decimal,
    pub tax_amount: Decimal,
    pub convenience_fee: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentOrderResult {
    pub order_id: String,
    pub booking_id: Option<Uuid>,
    pub provider_name: String,
    pub provider_order_id: Option<String>,
    pub payment_session_id: Option<String>,
    pub order_status: OrderStatus,
    pub order_amount: Decimal,
    pub order_currency: String,
    pub order_expiry_time: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

impl PaymentOrderResult {
    fn from_order(order: &PaymentOrder, provider_name: &str) -> Self {
        Self {
            order_id: order.order_id.clone(),
            booking_id: order.tagged_booking_id(),
            provider_name: provider_name.to_string(),
            provider_order_id: order.provider_order_id.clone(),
            payment_session_id: order.payment_session_id.clone(),
            order_status: order.parsed_status(),
            order_amount: order.order_amount,
            order_currency: order.order_currency.clone(),
            order_expiry_time: order.order_expiry_time,
            created_utc: order.created_utc,
        }
    }
}

/// Local order merged with the provider's live view.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub order_id: String,
    pub booking_id: Option<Uuid>,
    pub provider_order_id: Option<String>,
    pub provider_status: String,
    pub previous_status: OrderStatus,
    pub order_status: OrderStatus,
    pub order_amount: Decimal,
    pub order_currency: String,
    pub paid_amount: Decimal,
    pub refunded_amount: Decimal,
    pub order_expiry_time: Option<DateTime<Utc>>,
    pub transactions: Vec<PaymentTransaction>,
    pub refunds: Vec<PaymentRefund>,
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub order_id: String,
    pub amount: Decimal,
    pub reason: Option<String>,
    pub note: Option<String>,
    pub speed: RefundSpeed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundResult {
    pub refund_id: String,
    pub order_id: String,
    pub provider_refund_id: Option<String>,
    pub refund_amount: Decimal,
    pub refund_status: RefundStatus,
    pub refund_type: RefundType,
    pub refund_arn: Option<String>,
    pub order_status: OrderStatus,
    pub remaining_refundable: Decimal,
}

#[derive(Debug, Clone)]
pub struct PaymentLinkRequest {
    pub user_id: Uuid,
    pub amount: Decimal,
    pub purpose: String,
    pub customer: CustomerDetails,
    pub return_url: Option<String>,
    pub notify_url: Option<String>,
    pub notes: BTreeMap<String, String>,
    pub expiry_time: Option<DateTime<Utc>>,
    pub usage_limit: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentLinkResult {
    pub link_id: String,
    pub link_url: String,
    pub link_status: String,
    pub amount: Decimal,
    pub currency: String,
    pub purpose: String,
    pub expiry_time: Option<DateTime<Utc>>,
    pub usage_limit: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentHistoryPage {
    pub orders: Vec<PaymentOrder>,
    pub page: i64,
    pub limit: i64,
    pub total: i64,
    pub has_more: bool,
}

/// What happened to a verified webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed { webhook_id: Uuid },
    /// Already applied by an earlier delivery.
    Duplicate { webhook_id: Uuid },
}

/// Counts from one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
}

// ============================================================================
// Pure helpers
// ============================================================================

/// Amount still refundable: captured minus refunds holding funds, floored at zero.
pub fn refundable_balance(paid: Decimal, committed_refunds: Decimal) -> Decimal {
    (paid - committed_refunds).max(Decimal::ZERO)
}

/// Order status once `committed_refunds` of `paid` are out, if it changes.
pub fn refund_progress(
    current: OrderStatus,
    paid: Decimal,
    committed_refunds: Decimal,
) -> Option<OrderStatus> {
    if committed_refunds <= Decimal::ZERO {
        return None;
    }
    current
        .after_refund(committed_refunds >= paid)
        .filter(|next| *next != current)
}

/// Redelivery key: the provider's event id when sent, else a body digest.
pub fn webhook_dedup_key(event_id: Option<&str>, raw_body: &str) -> String {
    match event_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => format!("id:{}", id),
        None => format!("sha256:{}", sha256_hex(raw_body.as_bytes())),
    }
}

fn transaction_from_payment(order_id: &str, currency: &str, payment: &GatewayPayment) -> TransactionUpsert {
    TransactionUpsert {
        order_id: order_id.to_string(),
        provider_payment_id: payment.provider_payment_id.clone(),
        amount: payment.amount,
        currency: payment
            .currency
            .clone()
            .unwrap_or_else(|| currency.to_string()),
        status: map_payment_status(&payment.status),
        payment_method: payment.payment_group.clone(),
        payment_method_details: payment.payment_method.clone(),
        bank_reference: payment.bank_reference.clone(),
        auth_id: payment.auth_id.clone(),
        payment_message: payment.message.clone(),
        failure_reason: payment.failure_reason.clone(),
        gateway_response: payment.raw.clone(),
        transaction_time: payment.payment_time.unwrap_or_else(Utc::now),
    }
}

fn require_positive(amount: Decimal, field: &str) -> Result<(), ServiceError> {
    if amount <= Decimal::ZERO {
        return Err(ServiceError::InvalidInput(format!(
            "{} must be greater than zero",
            field
        )));
    }
    Ok(())
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Clone)]
pub struct PaymentEngine {
    db: Database,
    gateway: Arc<dyn PaymentGateway>,
    payments: PaymentConfig,
    replay: WebhookReplayConfig,
}

impl PaymentEngine {
    pub fn new(
        db: Database,
        gateway: Arc<dyn PaymentGateway>,
        payments: PaymentConfig,
        replay: WebhookReplayConfig,
    ) -> Self {
        Self {
            db,
            gateway,
            payments,
            replay,
        }
    }

    pub fn replay_config(&self) -> &WebhookReplayConfig {
        &self.replay
    }

    async fn default_provider(&self) -> Result<PaymentProvider, ServiceError> {
        let mut conn = self.db.pool().acquire().await?;
        repo::default_provider(&mut *conn)
            .await?
            .ok_or(ServiceError::NoProviderConfigured)
    }

    /// Open a provider order for a booking and persist it locally.
    ///
    /// Nothing is written when the provider call fails. If the local insert
    /// fails afterwards the provider order is orphaned until status polling
    /// picks it up; the provider order id is logged for that.
    #[instrument(skip(self, request), fields(user_id = %request.user_id, booking_id = %request.booking_id))]
    pub async fn create_booking_payment(
        &self,
        request: BookingPaymentRequest,
    ) -> Result<PaymentOrderResult, ServiceError> {
        require_positive(request.amount, "amount")?;
        if request.customer.phone.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "customer phone is required".to_string(),
            ));
        }

        let provider = self.default_provider().await?;

        {
            let mut conn = self.db.pool().acquire().await?;
            match repo::booking_owner(&mut *conn, request.booking_id).await? {
                None => return Err(ServiceError::not_found("Booking", request.booking_id)),
                Some(owner) if owner != request.user_id => {
                    return Err(ServiceError::Unauthorized(
                        "booking belongs to another user".to_string(),
                    ))
                }
                Some(_) => {}
            }
        }

        let order_id = generate_order_id(ORDER_ID_PREFIX);
        let mut tags = Metadata::for_booking(request.booking_id, request.user_id);
        tags.extra = request.tags.clone();
        let meta = OrderMeta {
            return_url: request
                .return_url
                .clone()
                .or_else(|| self.payments.return_url.clone()),
            notify_url: request
                .notify_url
                .clone()
                .or_else(|| self.payments.notify_url.clone()),
        };
        let note = request
            .note
            .clone()
            .unwrap_or_else(|| format!("Metropodz booking payment for {}", request.booking_id));

        let params = CreateOrderParams {
            order_id: order_id.clone(),
            amount: request.amount,
            currency: self.payments.currency.clone(),
            customer: request.customer.clone(),
            return_url: meta.return_url.clone(),
            notify_url: meta.notify_url.clone(),
            note: Some(note.clone()),
            tags: tags.clone(),
            expiry_time: None,
        };

        let gateway_order = match self.gateway.create_order(&params).await {
            Ok(order) => order,
            Err(e) => {
                error!(order_id = %order_id, error = %e, "Provider order creation failed");
                record_payment_operation("create_order", "gateway_error");
                return Err(ServiceError::PaymentCreationFailed(e.to_string()));
            }
        };

        let new_order = NewPaymentOrder {
            order_id: order_id.clone(),
            user_id: request.user_id,
            booking_id: Some(request.booking_id),
            provider_id: provider.provider_id,
            provider_order_id: gateway_order.provider_order_id.clone(),
            payment_session_id: gateway_order.payment_session_id.clone(),
            order_amount: request.amount,
            order_currency: self.payments.currency.clone(),
            order_status: map_order_status(&gateway_order.status),
            customer_details: request.customer,
            order_note: Some(note),
            order_tags: tags,
            order_meta: meta,
            discount_amount: request.discount_amount,
            tax_amount: request.tax_amount,
            convenience_fee: request.convenience_fee,
            order_expiry_time: gateway_order.expiry_time,
        };

        let mut conn = self.db.pool().acquire().await?;
        let order = match repo::insert_order(&mut *conn, &new_order).await {
            Ok(order) => order,
            Err(e) => {
                error!(
                    order_id = %order_id,
                    provider_order_id = ?gateway_order.provider_order_id,
                    error = %e,
                    "Provider order created but local persistence failed"
                );
                record_payment_operation("create_order", "persist_error");
                return Err(ServiceError::PaymentCreationFailed(format!(
                    "order {} could not be stored",
                    order_id
                )));
            }
        };

        record_payment_operation("create_order", "success");
        info!(
            order_id = %order.order_id,
            order_status = %order.order_status,
            "Payment order created"
        );

        Ok(PaymentOrderResult::from_order(&order, &provider.provider_name))
    }

    /// Fail unless `user_id` owns the order.
    pub async fn authorize_order(&self, order_id: &str, user_id: Uuid) -> Result<(), ServiceError> {
        let mut conn = self.db.pool().acquire().await?;
        let order = repo::find_order(&mut *conn, order_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("PaymentOrder", order_id))?;
        if order.user_id != user_id {
            return Err(ServiceError::Unauthorized(
                "order belongs to another user".to_string(),
            ));
        }
        Ok(())
    }

    /// Pull the provider's view of an order and fold it into the local row.
    ///
    /// Refunds whose creation call timed out are settled here from the
    /// provider's refund list.
    #[instrument(skip(self))]
    pub async fn get_payment_status(&self, order_id: &str) -> Result<StatusSnapshot, ServiceError> {
        {
            let mut conn = self.db.pool().acquire().await?;
            if repo::find_order(&mut *conn, order_id).await?.is_none() {
                return Err(ServiceError::not_found("PaymentOrder", order_id));
            }
        }

        let gateway_order = self.gateway.get_order(order_id).await?;
        let payments = self.gateway.get_order_payments(order_id).await?;
        let reported_refunds = self.gateway.get_order_refunds(order_id).await?;

        let mut tx = self.db.pool().begin().await?;
        let order = repo::lock_order(&mut *tx, order_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("PaymentOrder", order_id))?;

        let previous = order.parsed_status();
        let mut next = previous.next_state(map_order_status(&gateway_order.status));

        for payment in &payments {
            let txn = transaction_from_payment(order_id, &order.order_currency, payment);
            repo::upsert_transaction(&mut *tx, &txn).await?;
        }

        if next.is_settled() && !previous.is_settled() {
            confirm_paid_booking(&mut *tx, &order).await?;
        }

        for report in &reported_refunds {
            match repo::lock_refund(&mut *tx, &report.refund_id).await? {
                Some(stored) if stored.order_id == order_id => {
                    fold_refund(&mut *tx, stored, report).await?;
                }
                _ => warn!(
                    order_id = %order_id,
                    refund_id = %report.refund_id,
                    "Provider lists a refund with no local record"
                ),
            }
        }

        let paid_amount = repo::paid_amount(&mut *tx, order_id).await?;
        let refunded_amount = repo::committed_refunds(&mut *tx, order_id).await?;
        if let Some(after_refunds) = refund_progress(next, paid_amount, refunded_amount) {
            next = after_refunds;
        }
        if next != previous {
            repo::set_order_status(&mut *tx, order_id, next).await?;
            info!(order_id = %order_id, from = %previous, to = %next, "Order status updated from provider");
        }
        let transactions = repo::order_transactions(&mut *tx, order_id).await?;
        let refunds = repo::order_refunds(&mut *tx, order_id).await?;
        tx.commit().await?;

        Ok(StatusSnapshot {
            order_id: order.order_id.clone(),
            booking_id: order.tagged_booking_id(),
            provider_order_id: order.provider_order_id.clone(),
            provider_status: gateway_order.status,
            previous_status: previous,
            order_status: next,
            order_amount: order.order_amount,
            order_currency: order.order_currency.clone(),
            paid_amount,
            refunded_amount,
            order_expiry_time: gateway_order.expiry_time.or(order.order_expiry_time),
            transactions,
            refunds,
        })
    }

    /// Verify, record and apply one webhook delivery.
    ///
    /// Any body that passes verification is stored before it is decoded or
    /// applied. If decoding or applying fails the row is left `failed` for
    /// the replay worker and the error is returned so the provider retries too.
    #[instrument(skip(self, raw_body, signature, timestamp))]
    pub async fn process_webhook(
        &self,
        raw_body: &str,
        signature: &str,
        timestamp: &str,
        event_id: Option<&str>,
    ) -> Result<WebhookOutcome, ServiceError> {
        if !self
            .gateway
            .verify_webhook_signature(signature, raw_body, timestamp)
        {
            warn!("Webhook signature verification failed");
            record_webhook("unknown", "invalid_signature");
            return Err(ServiceError::InvalidSignature);
        }

        let envelope = self.gateway.webhook_envelope(raw_body);
        let event_type = envelope.event_type.as_str().to_string();

        let provider = self.default_provider().await?;
        let event = {
            let mut conn = self.db.pool().acquire().await?;
            repo::record_webhook_event(
                &mut *conn,
                &NewWebhookEvent {
                    provider_id: provider.provider_id,
                    event_type: event_type.clone(),
                    dedup_key: webhook_dedup_key(event_id, raw_body),
                    order_id: envelope.order_id,
                    payload: envelope.payload,
                    raw_body: raw_body.to_string(),
                    signature: signature.to_string(),
                    webhook_timestamp: timestamp.to_string(),
                },
            )
            .await?
        };

        if event.parsed_status() == WebhookEventStatus::Processed {
            info!(webhook_id = %event.webhook_id, deliveries = event.delivery_count, "Duplicate webhook delivery");
            record_webhook(&event_type, "duplicate");
            return Ok(WebhookOutcome::Duplicate {
                webhook_id: event.webhook_id,
            });
        }

        match self.apply_event(event.webhook_id).await {
            Ok(true) => {
                record_webhook(&event_type, "processed");
                Ok(WebhookOutcome::Processed {
                    webhook_id: event.webhook_id,
                })
            }
            Ok(false) => {
                record_webhook(&event_type, "duplicate");
                Ok(WebhookOutcome::Duplicate {
                    webhook_id: event.webhook_id,
                })
            }
            Err(e) => {
                error!(webhook_id = %event.webhook_id, error = %e, "Webhook processing failed");
                record_webhook(&event_type, e.label());
                self.record_event_failure(event.webhook_id, &e).await;
                Err(e)
            }
        }
    }

    /// Apply a stored event under its row lock. Returns `false` if it was
    /// already processed by a concurrent delivery.
    async fn apply_event(&self, webhook_id: Uuid) -> Result<bool, ServiceError> {
        let mut tx = self.db.pool().begin().await?;
        let Some(event) = repo::lock_webhook_event(&mut *tx, webhook_id).await? else {
            return Err(ServiceError::not_found("WebhookEvent", webhook_id));
        };
        if event.parsed_status() == WebhookEventStatus::Processed {
            return Ok(false);
        }

        let notification = self.decode_event(&event)?;
        reconcile(&mut *tx, &notification).await?;
        repo::mark_webhook_processed(&mut *tx, webhook_id).await?;
        tx.commit().await?;
        Ok(true)
    }

    fn decode_event(&self, event: &PaymentWebhookEvent) -> Result<WebhookNotification, ServiceError> {
        self.gateway
            .parse_webhook(&event.raw_body)
            .map_err(|e| ServiceError::InvalidInput(format!("malformed webhook body: {}", e)))
    }

    async fn record_event_failure(&self, webhook_id: Uuid, err: &ServiceError) {
        let result = match self.db.pool().acquire().await {
            Ok(mut conn) => repo::mark_webhook_failed(&mut *conn, webhook_id, &err.to_string()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(webhook_id = %webhook_id, error = %e, "Failed to record webhook failure");
        }
    }

    /// Re-drive stored events that were never applied.
    #[instrument(skip(self))]
    pub async fn replay_pending_webhooks(&self, batch: i64) -> Result<ReplaySummary, ServiceError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.replay.min_age_secs);
        let ids = {
            let mut conn = self.db.pool().acquire().await?;
            repo::replayable_webhook_ids(&mut *conn, cutoff, self.replay.max_attempts, batch).await?
        };

        let mut summary = ReplaySummary::default();
        for webhook_id in ids {
            match self.replay_one(webhook_id).await {
                Ok(true) => summary.processed += 1,
                Ok(false) => summary.skipped += 1,
                Err(e) => {
                    warn!(webhook_id = %webhook_id, error = %e, "Webhook replay failed");
                    self.record_event_failure(webhook_id, &e).await;
                    summary.failed += 1;
                }
            }
        }

        if summary != ReplaySummary::default() {
            info!(
                processed = summary.processed,
                failed = summary.failed,
                skipped = summary.skipped,
                "Webhook replay pass finished"
            );
        }
        Ok(summary)
    }

    async fn replay_one(&self, webhook_id: Uuid) -> Result<bool, ServiceError> {
        let mut tx = self.db.pool().begin().await?;
        let Some(event) = repo::try_lock_pending_webhook_event(&mut *tx, webhook_id).await? else {
            return Ok(false);
        };

        let notification = self.decode_event(&event)?;

        reconcile(&mut *tx, &notification).await?;
        repo::mark_webhook_processed(&mut *tx, webhook_id).await?;
        tx.commit().await?;

        record_webhook(notification.event_type.as_str(), "replayed");
        info!(webhook_id = %webhook_id, attempts = event.attempts + 1, "Webhook replayed");
        Ok(true)
    }

    /// Refund part or all of an order's captured amount.
    ///
    /// The refund is reserved locally under the order lock before the
    /// provider is called, so concurrent requests cannot overdraw the order.
    /// A provider rejection releases the reservation. When the outcome is
    /// unknown (timeout, transport error, 5xx) it stays `pending` and keeps
    /// holding funds until a webhook or status poll settles it.
    #[instrument(skip(self, request), fields(order_id = %request.order_id, amount = %request.amount))]
    pub async fn create_refund(&self, request: RefundRequest) -> Result<RefundResult, ServiceError> {
        require_positive(request.amount, "refund amount")?;
        let provider = self.default_provider().await?;
        let refund_id = generate_refund_id();

        let mut tx = self.db.pool().begin().await?;
        let order = repo::lock_order(&mut *tx, &request.order_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("PaymentOrder", &request.order_id))?;

        let paid = repo::paid_amount(&mut *tx, &order.order_id).await?;
        let committed = repo::committed_refunds(&mut *tx, &order.order_id).await?;
        let eligible = refundable_balance(paid, committed);
        if request.amount > eligible {
            record_payment_operation("create_refund", "exceeds_eligible");
            return Err(ServiceError::RefundExceedsEligible {
                requested: request.amount,
                eligible,
            });
        }

        let refund_type = RefundType::for_amount(request.amount, order.order_amount);
        let source_txn = repo::latest_successful_transaction(&mut *tx, &order.order_id).await?;
        repo::insert_refund(
            &mut *tx,
            &NewRefund {
                refund_id: refund_id.clone(),
                order_id: order.order_id.clone(),
                transaction_id: source_txn.map(|t| t.transaction_id),
                provider_id: provider.provider_id,
                amount: request.amount,
                currency: order.order_currency.clone(),
                refund_type,
                reason: request.reason.clone(),
                note: request.note.clone(),
                speed: request.speed,
            },
        )
        .await?;
        tx.commit().await?;

        let params = CreateRefundParams {
            refund_id: refund_id.clone(),
            amount: request.amount,
            note: Some(
                request
                    .note
                    .clone()
                    .unwrap_or_else(|| DEFAULT_REFUND_NOTE.to_string()),
            ),
            speed: request.speed,
        };

        let gateway_refund = match self.gateway.create_refund(&order.order_id, &params).await {
            Ok(refund) => refund,
            Err(e) => {
                let mut conn = self.db.pool().acquire().await?;
                if e.outcome_unknown() {
                    warn!(refund_id = %refund_id, error = %e, "Provider refund outcome unknown, holding reservation");
                    repo::record_refund_error(
                        &mut *conn,
                        &refund_id,
                        RefundStatus::Pending,
                        &e.to_string(),
                    )
                    .await?;
                    record_payment_operation("create_refund", "gateway_unconfirmed");
                } else {
                    error!(refund_id = %refund_id, error = %e, "Provider refund rejected, releasing reservation");
                    repo::record_refund_error(
                        &mut *conn,
                        &refund_id,
                        RefundStatus::Failed,
                        &e.to_string(),
                    )
                    .await?;
                    record_payment_operation("create_refund", "gateway_error");
                }
                return Err(ServiceError::ExternalService(e));
            }
        };

        let mut tx = self.db.pool().begin().await?;
        let order = repo::lock_order(&mut *tx, &order.order_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("PaymentOrder", &request.order_id))?;
        let stored = repo::lock_refund(&mut *tx, &refund_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("PaymentRefund", &refund_id))?;
        let refund = fold_refund(&mut *tx, stored, &gateway_refund).await?;

        let committed = repo::committed_refunds(&mut *tx, &order.order_id).await?;
        let mut order_status = order.parsed_status();
        if let Some(next) = refund_progress(order_status, paid, committed) {
            repo::set_order_status(&mut *tx, &order.order_id, next).await?;
            order_status = next;
        }
        tx.commit().await?;

        record_payment_operation("create_refund", "success");
        info!(
            refund_id = %refund_id,
            refund_status = %refund.refund_status,
            order_status = %order_status,
            "Refund created"
        );

        Ok(RefundResult {
            refund_id,
            order_id: order.order_id,
            provider_refund_id: refund.provider_refund_id.clone(),
            refund_amount: refund.refund_amount,
            refund_status: refund.parsed_status(),
            refund_type,
            refund_arn: refund.refund_arn.clone(),
            order_status,
            remaining_refundable: refundable_balance(paid, committed),
        })
    }

    #[instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn create_payment_link(
        &self,
        request: PaymentLinkRequest,
    ) -> Result<PaymentLinkResult, ServiceError> {
        require_positive(request.amount, "amount")?;
        if request.purpose.trim().is_empty() {
            return Err(ServiceError::InvalidInput("purpose is required".to_string()));
        }
        let usage_limit = request.usage_limit.unwrap_or(1);
        if usage_limit < 1 {
            return Err(ServiceError::InvalidInput(
                "usage_limit must be at least 1".to_string(),
            ));
        }

        let provider = self.default_provider().await?;
        let link_id = generate_link_id();
        let notes = Metadata {
            booking_id: None,
            user_id: Some(request.user_id),
            source: Some(Metadata::SOURCE.to_string()),
            extra: request.notes.clone(),
        };
        let meta = OrderMeta {
            return_url: request
                .return_url
                .clone()
                .or_else(|| self.payments.return_url.clone()),
            notify_url: request
                .notify_url
                .clone()
                .or_else(|| self.payments.notify_url.clone()),
        };

        let link = self
            .gateway
            .create_payment_link(&CreateLinkParams {
                link_id: link_id.clone(),
                amount: request.amount,
                currency: self.payments.currency.clone(),
                purpose: request.purpose.clone(),
                customer: request.customer.clone(),
                return_url: meta.return_url.clone(),
                notify_url: meta.notify_url.clone(),
                notes: notes.clone(),
                expiry_time: request.expiry_time,
            })
            .await
            .map_err(|e| {
                record_payment_operation("create_link", "gateway_error");
                ServiceError::ExternalService(e)
            })?;

        let mut conn = self.db.pool().acquire().await?;
        let stored = repo::insert_link(
            &mut *conn,
            &NewLink {
                link_id: link_id.clone(),
                created_by_user_id: request.user_id,
                provider_id: provider.provider_id,
                provider_link_id: link.provider_link_id.clone(),
                link_url: link.link_url.clone(),
                purpose: request.purpose.clone(),
                amount: request.amount,
                currency: self.payments.currency.clone(),
                status: map_link_status(&link.status),
                customer_details: request.customer,
                notes,
                meta,
                expiry_time: link.expiry_time.or(request.expiry_time),
                usage_limit,
            },
        )
        .await?;

        record_payment_operation("create_link", "success");
        info!(link_id = %stored.link_id, "Payment link created");

        Ok(PaymentLinkResult {
            link_id: stored.link_id,
            link_url: stored.link_url,
            link_status: stored.link_status,
            amount: stored.link_amount,
            currency: stored.link_currency,
            purpose: stored.link_purpose,
            expiry_time: stored.link_expiry_time,
            usage_limit: stored.usage_limit,
        })
    }

    /// A page of the user's orders, newest first. Pages start at 1.
    #[instrument(skip(self))]
    pub async fn get_user_payment_history(
        &self,
        user_id: Uuid,
        page: Option<i64>,
        limit: Option<i64>,
    ) -> Result<PaymentHistoryPage, ServiceError> {
        let page = page.unwrap_or(1).max(1);
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        let offset = (page - 1) * limit;

        let mut conn = self.db.pool().acquire().await?;
        let (orders, total) = repo::user_orders(&mut *conn, user_id, limit, offset).await?;

        Ok(PaymentHistoryPage {
            has_more: offset + (orders.len() as i64) < total,
            orders,
            page,
            limit,
            total,
        })
    }
}

// ============================================================================
// Reconciliation
// ============================================================================

/// Apply a verified notification inside the caller's transaction.
async fn reconcile(
    conn: &mut PgConnection,
    notification: &WebhookNotification,
) -> Result<(), ServiceError> {
    match &notification.event_type {
        event if event.is_payment_event() => reconcile_payment(conn, notification).await,
        WebhookEventType::RefundStatus => reconcile_refund(conn, notification).await,
        other => {
            info!(event_type = %other, "Ignoring webhook event type");
            Ok(())
        }
    }
}

async fn reconcile_payment(
    conn: &mut PgConnection,
    notification: &WebhookNotification,
) -> Result<(), ServiceError> {
    let payment = notification.payment.as_ref().ok_or_else(|| {
        ServiceError::InvalidInput("payment webhook without payment data".to_string())
    })?;
    let order_id = notification
        .order_id
        .as_deref()
        .or(payment.order_id.as_deref())
        .ok_or_else(|| ServiceError::InvalidInput("payment webhook without order id".to_string()))?;

    let order = repo::lock_order(&mut *conn, order_id)
        .await?
        .ok_or_else(|| ServiceError::not_found("PaymentOrder", order_id))?;

    let current = order.parsed_status();
    let next = current.next_state(map_payment_to_order_status(&payment.status));
    if next != current {
        repo::set_order_status(&mut *conn, order_id, next).await?;
        info!(order_id = %order_id, from = %current, to = %next, "Order status updated from webhook");
    }

    let txn = transaction_from_payment(order_id, &order.order_currency, payment);
    let stored = repo::upsert_transaction(&mut *conn, &txn).await?;
    if stored.parsed_status() != txn.status {
        info!(
            provider_payment_id = %txn.provider_payment_id,
            stored = %stored.payment_status,
            incoming = %txn.status,
            "Kept higher-ranked transaction status"
        );
    }

    match notification.event_type {
        WebhookEventType::PaymentSuccess => confirm_paid_booking(conn, &order).await?,
        WebhookEventType::PaymentFailed => warn!(
            order_id = %order_id,
            reason = ?payment.failure_reason.as_deref().or(payment.message.as_deref()),
            "Payment failed"
        ),
        WebhookEventType::PaymentUserDropped => info!(order_id = %order_id, "Payment dropped by user"),
        WebhookEventType::PaymentPending => info!(order_id = %order_id, "Payment pending"),
        _ => {}
    }
    Ok(())
}

/// Confirm the booking a paid order is tagged with. Repeats are harmless.
async fn confirm_paid_booking(
    conn: &mut PgConnection,
    order: &PaymentOrder,
) -> Result<(), ServiceError> {
    let Some(booking_id) = order.tagged_booking_id() else {
        return Ok(());
    };

    match confirm_in_tx(conn, booking_id).await? {
        ConfirmOutcome::Confirmed(_) => {
            info!(order_id = %order.order_id, booking_id = %booking_id, "Booking confirmed by payment");
        }
        ConfirmOutcome::AlreadyConfirmed(_) => {}
        ConfirmOutcome::NotPending(booking) => warn!(
            order_id = %order.order_id,
            booking_id = %booking_id,
            booking_status = %booking.status,
            "Paid booking is no longer pending"
        ),
        ConfirmOutcome::SlotTaken(_) => warn!(
            order_id = %order.order_id,
            booking_id = %booking_id,
            "Paid booking lost its slot to another confirmed booking"
        ),
        ConfirmOutcome::Missing => warn!(
            order_id = %order.order_id,
            booking_id = %booking_id,
            "Paid order tagged with unknown booking"
        ),
    }
    Ok(())
}

async fn reconcile_refund(
    conn: &mut PgConnection,
    notification: &WebhookNotification,
) -> Result<(), ServiceError> {
    let refund = notification.refund.as_ref().ok_or_else(|| {
        ServiceError::InvalidInput("refund webhook without refund data".to_string())
    })?;
    let order_id = notification
        .order_id
        .as_deref()
        .or(refund.order_id.as_deref())
        .ok_or_else(|| ServiceError::InvalidInput("refund webhook without order id".to_string()))?;

    let order = repo::lock_order(&mut *conn, order_id)
        .await?
        .ok_or_else(|| ServiceError::not_found("PaymentOrder", order_id))?;

    let Some(stored) = repo::lock_refund(&mut *conn, &refund.refund_id).await? else {
        warn!(order_id = %order_id, refund_id = %refund.refund_id, "Refund webhook for unknown refund");
        return Ok(());
    };

    let updated = fold_refund(&mut *conn, stored, refund).await?;

    let paid = repo::paid_amount(&mut *conn, order_id).await?;
    let committed = repo::committed_refunds(&mut *conn, order_id).await?;
    if let Some(next) = refund_progress(order.parsed_status(), paid, committed) {
        repo::set_order_status(&mut *conn, order_id, next).await?;
    }

    info!(
        order_id = %order_id,
        refund_id = %updated.refund_id,
        refund_status = %updated.refund_status,
        "Refund status updated from webhook"
    );
    Ok(())
}

/// Fold a provider refund report into the locked local row and return the
/// row as stored.
///
/// Statuses move by [`RefundStatus::next_state`]. A refund released locally
/// that the provider reports as going through is reinstated only while the
/// order can still cover it; otherwise the report is logged and the row
/// stays released.
async fn fold_refund(
    conn: &mut PgConnection,
    stored: PaymentRefund,
    report: &GatewayRefund,
) -> Result<PaymentRefund, ServiceError> {
    let current = stored.parsed_status();
    let observed = map_refund_status(&report.status);

    let next = if !current.holds_funds() && observed.holds_funds() {
        let paid = repo::paid_amount(&mut *conn, &stored.order_id).await?;
        let committed = repo::committed_refunds(&mut *conn, &stored.order_id).await?;
        let eligible = refundable_balance(paid, committed);
        if stored.refund_amount > eligible {
            error!(
                refund_id = %stored.refund_id,
                order_id = %stored.order_id,
                reported = %report.status,
                refund_amount = %stored.refund_amount,
                eligible = %eligible,
                "Provider reports a released refund the order can no longer cover"
            );
            record_payment_operation("reconcile_refund", "exceeds_eligible");
            return Ok(stored);
        }
        warn!(refund_id = %stored.refund_id, reported = %report.status, "Released refund reinstated by provider");
        observed
    } else {
        current.next_state(observed)
    };

    if next != observed {
        info!(
            refund_id = %stored.refund_id,
            stored = current.as_str(),
            incoming = observed.as_str(),
            "Kept later refund status"
        );
        return Ok(stored);
    }

    let updated = repo::update_refund(
        &mut *conn,
        &stored.refund_id,
        &RefundUpdate {
            status: next,
            provider_refund_id: report.provider_refund_id.clone(),
            arn: report.arn.clone(),
            provider_response: report.raw.clone(),
            processed_at: report.processed_at,
        },
    )
    .await?;
    Ok(updated)
}
