//! Integration tests for payment reconciliation: orders, webhooks and refunds.

mod common;

use booking_service::dtos::CustomerInput;
use booking_service::models::{BookingStatus, OrderStatus, RefundSpeed, RefundStatus};
use booking_service::services::payments::{
    BookingPaymentRequest, PaymentOrderResult, RefundRequest, WebhookOutcome,
};
use booking_service::services::ErrorKind;
use common::{
    at, create_pod, create_user, payment_success_webhook, payment_webhook, refund_status_webhook,
    signed, test_context, TestContext,
};
use rust_decimal::Decimal;
use serial_test::serial;
use std::collections::BTreeMap;
use uuid::Uuid;

fn payment_request(user_id: Uuid, booking_id: Uuid, amount: Decimal) -> BookingPaymentRequest {
    BookingPaymentRequest {
        user_id,
        booking_id,
        amount,
        customer: CustomerInput {
            name: Some("Test User".to_string()),
            email: Some("test@example.com".to_string()),
            phone: "9999999999".to_string(),
        }
        .into_details(user_id),
        note: None,
        return_url: None,
        notify_url: None,
        tags: BTreeMap::new(),
        discount_amount: Decimal::ZERO,
        tax_amount: Decimal::ZERO,
        convenience_fee: Decimal::ZERO,
    }
}

fn refund(order_id: &str, amount: i64) -> RefundRequest {
    RefundRequest {
        order_id: order_id.to_string(),
        amount: Decimal::new(amount, 0),
        reason: Some("Customer cancelled".to_string()),
        note: None,
        speed: RefundSpeed::Standard,
    }
}

/// Book a 2-hour slot at 500/h and open a 1000 order for it.
async fn booked_order(ctx: &TestContext, start_hour: u32) -> (Uuid, Uuid, PaymentOrderResult) {
    let user = create_user(&ctx.db).await;
    let pod = create_pod(&ctx.db, Decimal::new(500, 0)).await;
    let booking = ctx
        .reservations
        .create_booking(user.user_id, pod.pod_id, at(start_hour), at(start_hour + 2))
        .await
        .unwrap();
    let booking_id = booking.booking.booking_id;

    let order = ctx
        .payments
        .create_booking_payment(payment_request(
            user.user_id,
            booking_id,
            booking.booking.total_price,
        ))
        .await
        .unwrap();
    (user.user_id, booking_id, order)
}

/// Provider payment ids are globally unique; derive one per order.
fn provider_payment_id(order_id: &str) -> u64 {
    let digest = service_core::utils::signature::sha256_hex(order_id.as_bytes());
    u64::from_str_radix(&digest[..12], 16).unwrap()
}

/// Deliver a signed success webhook for the whole order amount.
async fn pay(ctx: &TestContext, order: &PaymentOrderResult, event_id: &str) -> WebhookOutcome {
    let (body, signature, timestamp) = payment_success_webhook(
        &ctx.gateway,
        &order.order_id,
        provider_payment_id(&order.order_id),
        order.order_amount,
    );
    ctx.payments
        .process_webhook(&body, &signature, &timestamp, Some(event_id))
        .await
        .unwrap()
}

/// `(refund_id, refund_status, refund_amount)` for an order, oldest first.
async fn refund_rows(ctx: &TestContext, order_id: &str) -> Vec<(String, String, Decimal)> {
    sqlx::query_as(
        r#"
        SELECT refund_id, refund_status, refund_amount
        FROM payment_refunds WHERE order_id = $1
        ORDER BY refund_initiated_at, created_utc
        "#,
    )
    .bind(order_id)
    .fetch_all(ctx.db.pool())
    .await
    .unwrap()
}

async fn committed_refunds(ctx: &TestContext, order_id: &str) -> Decimal {
    let (sum,): (Decimal,) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(refund_amount), 0) FROM payment_refunds
        WHERE order_id = $1 AND refund_status NOT IN ('failed', 'cancelled')
        "#,
    )
    .bind(order_id)
    .fetch_one(ctx.db.pool())
    .await
    .unwrap();
    sum
}

async fn order_status(ctx: &TestContext, order_id: &str) -> OrderStatus {
    let (status,): (String,) =
        sqlx::query_as("SELECT order_status FROM payment_orders WHERE order_id = $1")
            .bind(order_id)
            .fetch_one(ctx.db.pool())
            .await
            .unwrap();
    OrderStatus::from_str(&status)
}

async fn deliver(ctx: &TestContext, webhook: (String, String, String)) -> WebhookOutcome {
    let (body, signature, timestamp) = webhook;
    let event_id = format!("evt_{}", Uuid::new_v4());
    ctx.payments
        .process_webhook(&body, &signature, &timestamp, Some(&event_id))
        .await
        .unwrap()
}

#[tokio::test]
#[serial]
#[ignore = "requires TEST_DATABASE_URL"]
async fn redelivered_success_webhook_is_applied_once() {
    let ctx = test_context().await;
    let (_, booking_id, order) = booked_order(&ctx, 10).await;
    assert_eq!(order.order_status, OrderStatus::Active);
    assert_eq!(order.booking_id, Some(booking_id));

    let event_id = format!("evt_{}", Uuid::new_v4());
    let first = pay(&ctx, &order, &event_id).await;
    assert!(matches!(first, WebhookOutcome::Processed { .. }));

    let second = pay(&ctx, &order, &event_id).await;
    match (first, second) {
        (
            WebhookOutcome::Processed { webhook_id: a },
            WebhookOutcome::Duplicate { webhook_id: b },
        ) => assert_eq!(a, b),
        other => panic!("unexpected outcomes: {:?}", other),
    }

    let (transactions,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM payment_transactions WHERE order_id = $1")
            .bind(&order.order_id)
            .fetch_one(ctx.db.pool())
            .await
            .unwrap();
    assert_eq!(transactions, 1);

    let (order_status,): (String,) =
        sqlx::query_as("SELECT order_status FROM payment_orders WHERE order_id = $1")
            .bind(&order.order_id)
            .fetch_one(ctx.db.pool())
            .await
            .unwrap();
    assert_eq!(OrderStatus::from_str(&order_status), OrderStatus::Paid);

    let booking = ctx.reservations.get_booking_by_id(booking_id).await.unwrap();
    assert_eq!(booking.booking.parsed_status(), BookingStatus::Confirmed);
}

#[tokio::test]
#[serial]
#[ignore = "requires TEST_DATABASE_URL"]
async fn rejects_tampered_webhook_without_recording_it() {
    let ctx = test_context().await;
    let (_, _, order) = booked_order(&ctx, 13).await;

    let (body, signature, timestamp) =
        payment_success_webhook(&ctx.gateway, &order.order_id, 42, order.order_amount);
    let tampered = body.replace("SUCCESS", "FAILED");

    let err = ctx
        .payments
        .process_webhook(&tampered, &signature, &timestamp, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSignature);

    let (events,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM payment_webhook_events WHERE order_id = $1")
            .bind(&order.order_id)
            .fetch_one(ctx.db.pool())
            .await
            .unwrap();
    assert_eq!(events, 0);
}

#[tokio::test]
#[serial]
#[ignore = "requires TEST_DATABASE_URL"]
async fn unappliable_webhook_is_kept_for_replay() {
    let ctx = test_context().await;
    let unknown_order = format!("METRO_{}", Uuid::new_v4().simple());
    let (body, signature, timestamp) =
        payment_success_webhook(&ctx.gateway, &unknown_order, 7, Decimal::new(100, 0));
    let event_id = format!("evt_{}", Uuid::new_v4());

    for _ in 0..2 {
        let err = ctx
            .payments
            .process_webhook(&body, &signature, &timestamp, Some(&event_id))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    let (status, attempts, deliveries, last_error): (String, i32, i32, Option<String>) =
        sqlx::query_as(
            r#"
            SELECT status, attempts, delivery_count, last_error
            FROM payment_webhook_events WHERE order_id = $1
            "#,
        )
        .bind(&unknown_order)
        .fetch_one(ctx.db.pool())
        .await
        .unwrap();
    assert_eq!(status, "failed");
    assert_eq!(attempts, 2);
    assert_eq!(deliveries, 2);
    assert!(last_error.is_some());
}

#[tokio::test]
#[serial]
#[ignore = "requires TEST_DATABASE_URL"]
async fn refunds_never_exceed_captured_amount() {
    let ctx = test_context().await;
    let (_, _, order) = booked_order(&ctx, 16).await;
    assert_eq!(order.order_amount, Decimal::new(1000, 0));
    pay(&ctx, &order, &format!("evt_{}", Uuid::new_v4())).await;

    let partial = ctx.payments.create_refund(refund(&order.order_id, 400)).await.unwrap();
    assert_eq!(partial.refund_status, RefundStatus::Pending);
    assert_eq!(partial.order_status, OrderStatus::PartiallyRefunded);
    assert_eq!(partial.remaining_refundable, Decimal::new(600, 0));

    let err = ctx
        .payments
        .create_refund(refund(&order.order_id, 700))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvariantViolation);

    // A provider rejection releases the reservation.
    ctx.gateway.reject("create_refund");
    let err = ctx
        .payments
        .create_refund(refund(&order.order_id, 600))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExternalServiceError);
    ctx.gateway.recover("create_refund");

    let rest = ctx.payments.create_refund(refund(&order.order_id, 600)).await.unwrap();
    assert_eq!(rest.order_status, OrderStatus::FullyRefunded);
    assert_eq!(rest.remaining_refundable, Decimal::ZERO);

    let err = ctx
        .payments
        .create_refund(refund(&order.order_id, 1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvariantViolation);
}

#[tokio::test]
#[serial]
#[ignore = "requires TEST_DATABASE_URL"]
async fn status_poll_folds_provider_payments() {
    use booking_service::services::gateway::GatewayPayment;

    let ctx = test_context().await;
    let (user_id, booking_id, order) = booked_order(&ctx, 19).await;

    ctx.gateway.set_payments(
        &order.order_id,
        vec![GatewayPayment {
            provider_payment_id: format!("poll_{}", order.order_id),
            order_id: Some(order.order_id.clone()),
            amount: order.order_amount,
            currency: Some("INR".to_string()),
            status: "SUCCESS".to_string(),
            message: None,
            payment_time: None,
            bank_reference: Some("UTR123".to_string()),
            auth_id: None,
            payment_group: Some("upi".to_string()),
            payment_method: serde_json::json!({}),
            failure_reason: None,
            raw: serde_json::json!({ "cf_payment_id": 991 }),
        }],
    );

    // The mock still reports the order ACTIVE; captured payments alone do not move it.
    let snapshot = ctx.payments.get_payment_status(&order.order_id).await.unwrap();
    assert_eq!(snapshot.transactions.len(), 1);
    assert_eq!(snapshot.paid_amount, order.order_amount);
    assert_eq!(snapshot.booking_id, Some(booking_id));

    let history = ctx
        .payments
        .get_user_payment_history(user_id, None, None)
        .await
        .unwrap();
    assert_eq!(history.total, 1);
    assert_eq!(history.orders[0].order_id, order.order_id);
    assert!(!history.has_more);
}

#[tokio::test]
#[serial]
#[ignore = "requires TEST_DATABASE_URL"]
async fn only_the_booking_owner_can_open_an_order() {
    let ctx = test_context().await;
    let owner = create_user(&ctx.db).await;
    let stranger = create_user(&ctx.db).await;
    let pod = create_pod(&ctx.db, Decimal::new(100, 0)).await;
    let booking = ctx
        .reservations
        .create_booking(owner.user_id, pod.pod_id, at(6), at(7))
        .await
        .unwrap();

    let err = ctx
        .payments
        .create_booking_payment(payment_request(
            stranger.user_id,
            booking.booking.booking_id,
            Decimal::new(100, 0),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    assert_eq!(ctx.gateway.call_count("create_order"), 0);
}

#[tokio::test]
#[serial]
#[ignore = "requires TEST_DATABASE_URL"]
async fn late_pending_and_failed_reports_do_not_undo_a_capture() {
    let ctx = test_context().await;
    let (_, booking_id, order) = booked_order(&ctx, 8).await;
    pay(&ctx, &order, &format!("evt_{}", Uuid::new_v4())).await;

    let payment_id = provider_payment_id(&order.order_id);
    for (event_type, status) in [
        ("PAYMENT_PENDING_WEBHOOK", "PENDING"),
        ("PAYMENT_FAILED_WEBHOOK", "FAILED"),
    ] {
        let outcome = deliver(
            &ctx,
            payment_webhook(
                &ctx.gateway,
                event_type,
                status,
                &order.order_id,
                payment_id,
                order.order_amount,
            ),
        )
        .await;
        assert!(matches!(outcome, WebhookOutcome::Processed { .. }));
    }

    let (payment_status,): (String,) = sqlx::query_as(
        "SELECT payment_status FROM payment_transactions WHERE order_id = $1",
    )
    .bind(&order.order_id)
    .fetch_one(ctx.db.pool())
    .await
    .unwrap();
    assert_eq!(payment_status, "success");
    assert_eq!(order_status(&ctx, &order.order_id).await, OrderStatus::Paid);

    let booking = ctx.reservations.get_booking_by_id(booking_id).await.unwrap();
    assert_eq!(booking.booking.parsed_status(), BookingStatus::Confirmed);
}

#[tokio::test]
#[serial]
#[ignore = "requires TEST_DATABASE_URL"]
async fn verified_webhook_that_does_not_decode_is_stored_as_failed() {
    let ctx = test_context().await;
    let order_id = format!("METRO_{}", Uuid::new_v4().simple());
    let (body, signature, timestamp) = signed(
        &ctx.gateway,
        serde_json::json!({
            "type": "PAYMENT_SUCCESS_WEBHOOK",
            "data": {
                "order": { "order_id": order_id },
                "payment": { "cf_payment_id": 77, "payment_amount": 100 }
            }
        }),
    );

    let err = ctx
        .payments
        .process_webhook(&body, &signature, &timestamp, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let (event_type, status, attempts, last_error, raw_body): (
        String,
        String,
        i32,
        Option<String>,
        String,
    ) = sqlx::query_as(
        r#"
        SELECT event_type, status, attempts, last_error, raw_body
        FROM payment_webhook_events WHERE order_id = $1
        "#,
    )
    .bind(&order_id)
    .fetch_one(ctx.db.pool())
    .await
    .unwrap();
    assert_eq!(event_type, "PAYMENT_SUCCESS_WEBHOOK");
    assert_eq!(status, "failed");
    assert_eq!(attempts, 1);
    assert_eq!(raw_body, body);
    assert!(last_error.unwrap().contains("payment_status"));
}

#[tokio::test]
#[serial]
#[ignore = "requires TEST_DATABASE_URL"]
async fn replay_applies_a_stored_event_once_its_order_exists() {
    let ctx = test_context().await;
    let (_, booking_id, order) = booked_order(&ctx, 20).await;
    let parked = format!("{}_P", order.order_id);

    // The webhook races ahead of the order row.
    sqlx::query("UPDATE payment_orders SET order_id = $2 WHERE order_id = $1")
        .bind(&order.order_id)
        .bind(&parked)
        .execute(ctx.db.pool())
        .await
        .unwrap();
    let (body, signature, timestamp) = payment_success_webhook(
        &ctx.gateway,
        &order.order_id,
        provider_payment_id(&order.order_id),
        order.order_amount,
    );
    let err = ctx
        .payments
        .process_webhook(&body, &signature, &timestamp, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    sqlx::query("UPDATE payment_orders SET order_id = $2 WHERE order_id = $1")
        .bind(&parked)
        .bind(&order.order_id)
        .execute(ctx.db.pool())
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let summary = ctx.payments.replay_pending_webhooks(100).await.unwrap();
    assert!(summary.processed >= 1);

    let (status, attempts): (String, i32) = sqlx::query_as(
        "SELECT status, attempts FROM payment_webhook_events WHERE order_id = $1",
    )
    .bind(&order.order_id)
    .fetch_one(ctx.db.pool())
    .await
    .unwrap();
    assert_eq!(status, "processed");
    assert_eq!(attempts, 2);
    assert_eq!(order_status(&ctx, &order.order_id).await, OrderStatus::Paid);

    let booking = ctx.reservations.get_booking_by_id(booking_id).await.unwrap();
    assert_eq!(booking.booking.parsed_status(), BookingStatus::Confirmed);

    // A provider retry of the same body is now a duplicate.
    let outcome = ctx
        .payments
        .process_webhook(&body, &signature, &timestamp, None)
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::Duplicate { .. }));
}

#[tokio::test]
#[serial]
#[ignore = "requires TEST_DATABASE_URL"]
async fn refund_webhook_settles_refund_and_stale_reports_do_not_undo_it() {
    let ctx = test_context().await;
    let (_, _, order) = booked_order(&ctx, 11).await;
    pay(&ctx, &order, &format!("evt_{}", Uuid::new_v4())).await;

    let created = ctx.payments.create_refund(refund(&order.order_id, 400)).await.unwrap();
    assert_eq!(created.refund_status, RefundStatus::Pending);

    let outcome = deliver(
        &ctx,
        refund_status_webhook(
            &ctx.gateway,
            &order.order_id,
            &created.refund_id,
            Decimal::new(400, 0),
            "SUCCESS",
        ),
    )
    .await;
    assert!(matches!(outcome, WebhookOutcome::Processed { .. }));

    let (status, arn): (String, Option<String>) =
        sqlx::query_as("SELECT refund_status, refund_arn FROM payment_refunds WHERE refund_id = $1")
            .bind(&created.refund_id)
            .fetch_one(ctx.db.pool())
            .await
            .unwrap();
    assert_eq!(status, "successful");
    assert_eq!(arn.as_deref(), Some("ARN0001"));

    // The provider's refund list still says PENDING; a poll must not regress it.
    let snapshot = ctx.payments.get_payment_status(&order.order_id).await.unwrap();
    assert_eq!(snapshot.refunds.len(), 1);
    assert_eq!(snapshot.refunds[0].parsed_status(), RefundStatus::Successful);
    assert_eq!(snapshot.order_status, OrderStatus::PartiallyRefunded);
    assert_eq!(snapshot.refunded_amount, Decimal::new(400, 0));

    deliver(
        &ctx,
        refund_status_webhook(
            &ctx.gateway,
            &order.order_id,
            &created.refund_id,
            Decimal::new(400, 0),
            "PENDING",
        ),
    )
    .await;
    let rows = refund_rows(&ctx, &order.order_id).await;
    assert_eq!(rows[0].1, "successful");
}

#[tokio::test]
#[serial]
#[ignore = "requires TEST_DATABASE_URL"]
async fn refund_with_unknown_outcome_keeps_holding_funds() {
    let ctx = test_context().await;
    let (_, _, order) = booked_order(&ctx, 14).await;
    pay(&ctx, &order, &format!("evt_{}", Uuid::new_v4())).await;

    ctx.gateway.time_out("create_refund");
    let err = ctx
        .payments
        .create_refund(refund(&order.order_id, 1000))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExternalServiceError);
    ctx.gateway.recover("create_refund");

    let rows = refund_rows(&ctx, &order.order_id).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1, "pending");
    let (first_refund_id, _, _) = rows[0].clone();

    // The provider may have taken it, so the balance is still spoken for.
    let err = ctx
        .payments
        .create_refund(refund(&order.order_id, 1000))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvariantViolation);

    deliver(
        &ctx,
        refund_status_webhook(
            &ctx.gateway,
            &order.order_id,
            &first_refund_id,
            Decimal::new(1000, 0),
            "SUCCESS",
        ),
    )
    .await;

    let rows = refund_rows(&ctx, &order.order_id).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1, "successful");
    assert_eq!(committed_refunds(&ctx, &order.order_id).await, Decimal::new(1000, 0));
    assert_eq!(order_status(&ctx, &order.order_id).await, OrderStatus::FullyRefunded);
}

#[tokio::test]
#[serial]
#[ignore = "requires TEST_DATABASE_URL"]
async fn status_poll_settles_refund_with_unknown_outcome() {
    let ctx = test_context().await;
    let (_, _, order) = booked_order(&ctx, 17).await;
    pay(&ctx, &order, &format!("evt_{}", Uuid::new_v4())).await;

    ctx.gateway.time_out("create_refund");
    ctx.payments
        .create_refund(refund(&order.order_id, 400))
        .await
        .unwrap_err();
    ctx.gateway.recover("create_refund");

    let (refund_id, status, _) = refund_rows(&ctx, &order.order_id).await.remove(0);
    assert_eq!(status, "pending");
    ctx.gateway.settle_refund(&refund_id, "SUCCESS");

    let snapshot = ctx.payments.get_payment_status(&order.order_id).await.unwrap();
    assert_eq!(snapshot.refunds.len(), 1);
    assert_eq!(snapshot.refunds[0].parsed_status(), RefundStatus::Successful);
    assert_eq!(snapshot.refunded_amount, Decimal::new(400, 0));
    assert_eq!(snapshot.order_status, OrderStatus::PartiallyRefunded);
    assert_eq!(
        order_status(&ctx, &order.order_id).await,
        OrderStatus::PartiallyRefunded
    );
}

#[tokio::test]
#[serial]
#[ignore = "requires TEST_DATABASE_URL"]
async fn released_refund_reported_successful_cannot_overdraw_the_order() {
    let ctx = test_context().await;
    let (_, _, order) = booked_order(&ctx, 21).await;
    pay(&ctx, &order, &format!("evt_{}", Uuid::new_v4())).await;

    ctx.gateway.reject("create_refund");
    let err = ctx
        .payments
        .create_refund(refund(&order.order_id, 1000))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExternalServiceError);
    ctx.gateway.recover("create_refund");

    let rows = refund_rows(&ctx, &order.order_id).await;
    assert_eq!(rows[0].1, "failed");
    let (released_id, _, _) = rows[0].clone();

    let retry = ctx.payments.create_refund(refund(&order.order_id, 1000)).await.unwrap();
    assert_eq!(retry.order_status, OrderStatus::FullyRefunded);

    let outcome = deliver(
        &ctx,
        refund_status_webhook(
            &ctx.gateway,
            &order.order_id,
            &released_id,
            Decimal::new(1000, 0),
            "SUCCESS",
        ),
    )
    .await;
    assert!(matches!(outcome, WebhookOutcome::Processed { .. }));

    let rows = refund_rows(&ctx, &order.order_id).await;
    let released = rows.iter().find(|(id, _, _)| *id == released_id).unwrap();
    assert_eq!(released.1, "failed");
    assert_eq!(committed_refunds(&ctx, &order.order_id).await, Decimal::new(1000, 0));
}

#[tokio::test]
#[serial]
#[ignore = "requires TEST_DATABASE_URL"]
async fn only_the_order_owner_may_poll_or_refund() {
    let ctx = test_context().await;
    let (owner, _, order) = booked_order(&ctx, 7).await;
    let stranger = create_user(&ctx.db).await;

    ctx.payments
        .authorize_order(&order.order_id, owner)
        .await
        .unwrap();

    let err = ctx
        .payments
        .authorize_order(&order.order_id, stranger.user_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let err = ctx
        .payments
        .authorize_order("METRO_0_00000000", owner)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
