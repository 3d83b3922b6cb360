//! SQL for payment orders, transactions, refunds, links and webhook events.
//!
//! Every function takes a `&mut PgConnection` so callers decide the
//! transaction boundary: pass `&mut *tx` inside a transaction or a pooled
//! connection for one-off reads.

use crate::models::{
    CustomerDetails, LinkStatus, Metadata, NewPaymentOrder, NewWebhookEvent, OrderMeta,
    OrderStatus, PaymentLink, PaymentOrder, PaymentProvider, PaymentRefund, PaymentStatus,
    PaymentTransaction, PaymentWebhookEvent, RefundSpeed, RefundStatus, RefundType,
    TransactionUpsert, WebhookEventStatus,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::PgConnection;
use uuid::Uuid;

// ============================================================================
// Providers
// ============================================================================

pub async fn default_provider(
    conn: &mut PgConnection,
) -> Result<Option<PaymentProvider>, sqlx::Error> {
    sqlx::query_as::<_, PaymentProvider>(
        r#"
        SELECT provider_id, provider_name, is_active, is_default
        FROM payment_providers
        WHERE is_default AND is_active
        LIMIT 1
        "#,
    )
    .fetch_optional(conn)
    .await
}

// ============================================================================
// Orders
// ============================================================================

/// Owner of a booking, if it exists.
pub async fn booking_owner(
    conn: &mut PgConnection,
    booking_id: Uuid,
) -> Result<Option<Uuid>, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>("SELECT user_id FROM bookings WHERE booking_id = $1")
        .bind(booking_id)
        .fetch_optional(conn)
        .await
}

pub async fn insert_order(
    conn: &mut PgConnection,
    order: &NewPaymentOrder,
) -> Result<PaymentOrder, sqlx::Error> {
    sqlx::query_as::<_, PaymentOrder>(
        r#"
        INSERT INTO payment_orders (
            internal_order_id, order_id, user_id, booking_id, provider_id, provider_order_id,
            payment_session_id, order_amount, order_currency, order_status, customer_details,
            order_note, order_tags, order_meta, discount_amount, tax_amount, convenience_fee,
            order_expiry_time
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&order.order_id)
    .bind(order.user_id)
    .bind(order.booking_id)
    .bind(order.provider_id)
    .bind(&order.provider_order_id)
    .bind(&order.payment_session_id)
    .bind(order.order_amount)
    .bind(&order.order_currency)
    .bind(order.order_status.as_str())
    .bind(Json(&order.customer_details))
    .bind(&order.order_note)
    .bind(Json(&order.order_tags))
    .bind(Json(&order.order_meta))
    .bind(order.discount_amount)
    .bind(order.tax_amount)
    .bind(order.convenience_fee)
    .bind(order.order_expiry_time)
    .fetch_one(conn)
    .await
}

pub async fn find_order(
    conn: &mut PgConnection,
    order_id: &str,
) -> Result<Option<PaymentOrder>, sqlx::Error> {
    sqlx::query_as::<_, PaymentOrder>("SELECT * FROM payment_orders WHERE order_id = $1")
        .bind(order_id)
        .fetch_optional(conn)
        .await
}

/// Load an order and hold its row lock until the transaction ends.
pub async fn lock_order(
    conn: &mut PgConnection,
    order_id: &str,
) -> Result<Option<PaymentOrder>, sqlx::Error> {
    sqlx::query_as::<_, PaymentOrder>(
        "SELECT * FROM payment_orders WHERE order_id = $1 FOR UPDATE",
    )
    .bind(order_id)
    .fetch_optional(conn)
    .await
}

pub async fn set_order_status(
    conn: &mut PgConnection,
    order_id: &str,
    status: OrderStatus,
) -> Result<PaymentOrder, sqlx::Error> {
    sqlx::query_as::<_, PaymentOrder>(
        r#"
        UPDATE payment_orders
        SET order_status = $2, updated_utc = NOW()
        WHERE order_id = $1
        RETURNING *
        "#,
    )
    .bind(order_id)
    .bind(status.as_str())
    .fetch_one(conn)
    .await
}

/// One page of a user's orders, newest first, plus the total count.
pub async fn user_orders(
    conn: &mut PgConnection,
    user_id: Uuid,
    limit: i64,
    offset: i64,
) -> Result<(Vec<PaymentOrder>, i64), sqlx::Error> {
    let orders = sqlx::query_as::<_, PaymentOrder>(
        r#"
        SELECT * FROM payment_orders
        WHERE user_id = $1
        ORDER BY created_utc DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(&mut *conn)
    .await?;

    let total =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM payment_orders WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&mut *conn)
            .await?;

    Ok((orders, total))
}

// ============================================================================
// Transactions
// ============================================================================

/// Insert or update the transaction for a provider payment id.
///
/// An existing row is only overwritten by a status of equal or higher rank,
/// so a late `PENDING` never clobbers a stored `SUCCESS`. Returns the row as
/// stored after the statement, whether or not it changed.
pub async fn upsert_transaction(
    conn: &mut PgConnection,
    txn: &TransactionUpsert,
) -> Result<PaymentTransaction, sqlx::Error> {
    let written = sqlx::query_as::<_, PaymentTransaction>(
        r#"
        INSERT INTO payment_transactions (
            transaction_id, order_id, provider_payment_id, amount, currency, payment_status,
            status_rank, payment_method, payment_method_details, bank_reference, auth_id,
            payment_message, failure_reason, gateway_response, transaction_time
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT ON CONSTRAINT payment_transactions_provider_payment_id_key DO UPDATE SET
            payment_status = EXCLUDED.payment_status,
            status_rank = EXCLUDED.status_rank,
            amount = EXCLUDED.amount,
            payment_method = COALESCE(EXCLUDED.payment_method, payment_transactions.payment_method),
            payment_method_details = EXCLUDED.payment_method_details,
            bank_reference = COALESCE(EXCLUDED.bank_reference, payment_transactions.bank_reference),
            auth_id = COALESCE(EXCLUDED.auth_id, payment_transactions.auth_id),
            payment_message = EXCLUDED.payment_message,
            failure_reason = EXCLUDED.failure_reason,
            gateway_response = EXCLUDED.gateway_response,
            transaction_time = EXCLUDED.transaction_time,
            updated_utc = NOW()
        WHERE payment_transactions.status_rank <= EXCLUDED.status_rank
        RETURNING *
        "#,
    )
    .bind(PaymentTransaction::transaction_id_for(&txn.provider_payment_id))
    .bind(&txn.order_id)
    .bind(&txn.provider_payment_id)
    .bind(txn.amount)
    .bind(&txn.currency)
    .bind(txn.status.as_str())
    .bind(txn.status.rank())
    .bind(&txn.payment_method)
    .bind(&txn.payment_method_details)
    .bind(&txn.bank_reference)
    .bind(&txn.auth_id)
    .bind(&txn.payment_message)
    .bind(&txn.failure_reason)
    .bind(&txn.gateway_response)
    .bind(txn.transaction_time)
    .fetch_optional(&mut *conn)
    .await?;

    match written {
        Some(row) => Ok(row),
        None => {
            sqlx::query_as::<_, PaymentTransaction>(
                "SELECT * FROM payment_transactions WHERE provider_payment_id = $1",
            )
            .bind(&txn.provider_payment_id)
            .fetch_one(conn)
            .await
        }
    }
}

pub async fn order_transactions(
    conn: &mut PgConnection,
    order_id: &str,
) -> Result<Vec<PaymentTransaction>, sqlx::Error> {
    sqlx::query_as::<_, PaymentTransaction>(
        "SELECT * FROM payment_transactions WHERE order_id = $1 ORDER BY transaction_time",
    )
    .bind(order_id)
    .fetch_all(conn)
    .await
}

/// Gross captured amount: the sum of `success` transactions.
pub async fn paid_amount(conn: &mut PgConnection, order_id: &str) -> Result<Decimal, sqlx::Error> {
    sqlx::query_scalar::<_, Decimal>(
        r#"
        SELECT COALESCE(SUM(amount), 0)
        FROM payment_transactions
        WHERE order_id = $1 AND payment_status = $2
        "#,
    )
    .bind(order_id)
    .bind(PaymentStatus::Success.as_str())
    .fetch_one(conn)
    .await
}

/// The successful transaction a refund is taken against, if any.
pub async fn latest_successful_transaction(
    conn: &mut PgConnection,
    order_id: &str,
) -> Result<Option<PaymentTransaction>, sqlx::Error> {
    sqlx::query_as::<_, PaymentTransaction>(
        r#"
        SELECT * FROM payment_transactions
        WHERE order_id = $1 AND payment_status = $2
        ORDER BY transaction_time DESC
        LIMIT 1
        "#,
    )
    .bind(order_id)
    .bind(PaymentStatus::Success.as_str())
    .fetch_optional(conn)
    .await
}

// ============================================================================
// Refunds
// ============================================================================

/// Values for a refund reservation.
#[derive(Debug, Clone)]
pub struct NewRefund {
    pub refund_id: String,
    pub order_id: String,
    pub transaction_id: Option<String>,
    pub provider_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub refund_type: RefundType,
    pub reason: Option<String>,
    pub note: Option<String>,
    pub speed: RefundSpeed,
}

/// Provider-reported refund state to store.
#[derive(Debug, Clone)]
pub struct RefundUpdate {
    pub status: RefundStatus,
    pub provider_refund_id: Option<String>,
    pub arn: Option<String>,
    pub provider_response: serde_json::Value,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Sum of refunds still holding funds, see [`RefundStatus::holds_funds`].
pub async fn committed_refunds(
    conn: &mut PgConnection,
    order_id: &str,
) -> Result<Decimal, sqlx::Error> {
    let holding: Vec<String> = RefundStatus::ALL
        .iter()
        .filter(|status| status.holds_funds())
        .map(|status| status.as_str().to_string())
        .collect();

    sqlx::query_scalar::<_, Decimal>(
        r#"
        SELECT COALESCE(SUM(refund_amount), 0)
        FROM payment_refunds
        WHERE order_id = $1 AND refund_status = ANY($2)
        "#,
    )
    .bind(order_id)
    .bind(holding)
    .fetch_one(conn)
    .await
}

pub async fn insert_refund(
    conn: &mut PgConnection,
    refund: &NewRefund,
) -> Result<PaymentRefund, sqlx::Error> {
    sqlx::query_as::<_, PaymentRefund>(
        r#"
        INSERT INTO payment_refunds (
            internal_refund_id, refund_id, order_id, transaction_id, provider_id, refund_amount,
            refund_currency, refund_type, refund_status, refund_reason, refund_note, refund_speed
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&refund.refund_id)
    .bind(&refund.order_id)
    .bind(&refund.transaction_id)
    .bind(refund.provider_id)
    .bind(refund.amount)
    .bind(&refund.currency)
    .bind(refund.refund_type.as_str())
    .bind(RefundStatus::Initiated.as_str())
    .bind(&refund.reason)
    .bind(&refund.note)
    .bind(refund.speed.as_str())
    .fetch_one(conn)
    .await
}

pub async fn lock_refund(
    conn: &mut PgConnection,
    refund_id: &str,
) -> Result<Option<PaymentRefund>, sqlx::Error> {
    sqlx::query_as::<_, PaymentRefund>(
        "SELECT * FROM payment_refunds WHERE refund_id = $1 FOR UPDATE",
    )
    .bind(refund_id)
    .fetch_optional(conn)
    .await
}

/// Overwrite a refund with a provider report. Callers hold the row lock and
/// have already folded the status through [`RefundStatus::next_state`].
pub async fn update_refund(
    conn: &mut PgConnection,
    refund_id: &str,
    update: &RefundUpdate,
) -> Result<PaymentRefund, sqlx::Error> {
    sqlx::query_as::<_, PaymentRefund>(
        r#"
        UPDATE payment_refunds
        SET refund_status = $2,
            provider_refund_id = COALESCE($3, provider_refund_id),
            refund_arn = COALESCE($4, refund_arn),
            provider_response = $5,
            refund_processed_at = COALESCE($6, refund_processed_at),
            updated_utc = NOW()
        WHERE refund_id = $1
        RETURNING *
        "#,
    )
    .bind(refund_id)
    .bind(update.status.as_str())
    .bind(&update.provider_refund_id)
    .bind(&update.arn)
    .bind(&update.provider_response)
    .bind(update.processed_at)
    .fetch_one(conn)
    .await
}

/// Settle a reservation whose gateway call errored: `failed` releases it,
/// `pending` keeps it held until the provider's view is reconciled. Rows a
/// webhook already moved past `initiated` are left alone.
pub async fn record_refund_error(
    conn: &mut PgConnection,
    refund_id: &str,
    status: RefundStatus,
    error: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE payment_refunds
        SET refund_status = $2,
            provider_response = jsonb_build_object('error', $3::TEXT),
            updated_utc = NOW()
        WHERE refund_id = $1 AND refund_status = $4
        "#,
    )
    .bind(refund_id)
    .bind(status.as_str())
    .bind(error)
    .bind(RefundStatus::Initiated.as_str())
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn order_refunds(
    conn: &mut PgConnection,
    order_id: &str,
) -> Result<Vec<PaymentRefund>, sqlx::Error> {
    sqlx::query_as::<_, PaymentRefund>(
        "SELECT * FROM payment_refunds WHERE order_id = $1 ORDER BY refund_initiated_at",
    )
    .bind(order_id)
    .fetch_all(conn)
    .await
}

// ============================================================================
// Links
// ============================================================================

#[derive(Debug, Clone)]
pub struct NewLink {
    pub link_id: String,
    pub created_by_user_id: Uuid,
    pub provider_id: Uuid,
    pub provider_link_id: Option<String>,
    pub link_url: String,
    pub purpose: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: LinkStatus,
    pub customer_details: CustomerDetails,
    pub notes: Metadata,
    pub meta: OrderMeta,
    pub expiry_time: Option<DateTime<Utc>>,
    pub usage_limit: i32,
}

pub async fn insert_link(
    conn: &mut PgConnection,
    link: &NewLink,
) -> Result<PaymentLink, sqlx::Error> {
    sqlx::query_as::<_, PaymentLink>(
        r#"
        INSERT INTO payment_links (
            internal_link_id, link_id, created_by_user_id, provider_id, provider_link_id,
            link_url, link_purpose, link_amount, link_currency, link_status, customer_details,
            link_notes, link_meta, link_expiry_time, usage_limit
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&link.link_id)
    .bind(link.created_by_user_id)
    .bind(link.provider_id)
    .bind(&link.provider_link_id)
    .bind(&link.link_url)
    .bind(&link.purpose)
    .bind(link.amount)
    .bind(&link.currency)
    .bind(link.status.as_str())
    .bind(Json(&link.customer_details))
    .bind(Json(&link.notes))
    .bind(Json(&link.meta))
    .bind(link.expiry_time)
    .bind(link.usage_limit)
    .fetch_one(conn)
    .await
}

// ============================================================================
// Webhook events
// ============================================================================

/// Record a verified delivery. A redelivery with the same dedup key bumps
/// `delivery_count` and returns the existing row.
pub async fn record_webhook_event(
    conn: &mut PgConnection,
    event: &NewWebhookEvent,
) -> Result<PaymentWebhookEvent, sqlx::Error> {
    sqlx::query_as::<_, PaymentWebhookEvent>(
        r#"
        INSERT INTO payment_webhook_events (
            webhook_id, provider_id, event_type, dedup_key, order_id, payload, raw_body,
            signature, webhook_timestamp, status
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (dedup_key) DO UPDATE SET
            delivery_count = payment_webhook_events.delivery_count + 1
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(event.provider_id)
    .bind(&event.event_type)
    .bind(&event.dedup_key)
    .bind(&event.order_id)
    .bind(&event.payload)
    .bind(&event.raw_body)
    .bind(&event.signature)
    .bind(&event.webhook_timestamp)
    .bind(WebhookEventStatus::Received.as_str())
    .fetch_one(conn)
    .await
}

pub async fn lock_webhook_event(
    conn: &mut PgConnection,
    webhook_id: Uuid,
) -> Result<Option<PaymentWebhookEvent>, sqlx::Error> {
    sqlx::query_as::<_, PaymentWebhookEvent>(
        "SELECT * FROM payment_webhook_events WHERE webhook_id = $1 FOR UPDATE",
    )
    .bind(webhook_id)
    .fetch_optional(conn)
    .await
}

/// Lock an unprocessed event unless another worker already holds it.
pub async fn try_lock_pending_webhook_event(
    conn: &mut PgConnection,
    webhook_id: Uuid,
) -> Result<Option<PaymentWebhookEvent>, sqlx::Error> {
    sqlx::query_as::<_, PaymentWebhookEvent>(
        r#"
        SELECT * FROM payment_webhook_events
        WHERE webhook_id = $1 AND status <> $2
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(webhook_id)
    .bind(WebhookEventStatus::Processed.as_str())
    .fetch_optional(conn)
    .await
}

pub async fn mark_webhook_processed(
    conn: &mut PgConnection,
    webhook_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE payment_webhook_events
        SET status = $2, attempts = attempts + 1, last_error = NULL, processed_utc = NOW()
        WHERE webhook_id = $1
        "#,
    )
    .bind(webhook_id)
    .bind(WebhookEventStatus::Processed.as_str())
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn mark_webhook_failed(
    conn: &mut PgConnection,
    webhook_id: Uuid,
    error: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE payment_webhook_events
        SET status = $2, attempts = attempts + 1, last_error = $3
        WHERE webhook_id = $1 AND status <> $4
        "#,
    )
    .bind(webhook_id)
    .bind(WebhookEventStatus::Failed.as_str())
    .bind(error)
    .bind(WebhookEventStatus::Processed.as_str())
    .execute(conn)
    .await?;
    Ok(())
}

/// Ids of unprocessed events old enough to replay, oldest first.
pub async fn replayable_webhook_ids(
    conn: &mut PgConnection,
    received_before: DateTime<Utc>,
    max_attempts: i32,
    limit: i64,
) -> Result<Vec<Uuid>, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT webhook_id FROM payment_webhook_events
        WHERE status <> $1 AND received_utc < $2 AND attempts < $3
        ORDER BY received_utc
        LIMIT $4
        "#,
    )
    .bind(WebhookEventStatus::Processed.as_str())
    .bind(received_before)
    .bind(max_attempts)
    .bind(limit)
    .fetch_all(conn)
    .await
}
