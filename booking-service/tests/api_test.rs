//! HTTP-level tests against a running booking-service.

mod common;

use common::{at, create_pod, create_user, payment_success_webhook, spawn_app};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use uuid::Uuid;

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn health_reports_service_identity() {
    let app = spawn_app().await;

    let response = app
        .client
        .get(format!("{}/health", app.address))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "booking-service-test");
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn booking_routes_require_caller_identity() {
    let app = spawn_app().await;

    let response = app
        .client
        .get(format!("{}/bookings", app.address))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .client
        .get(format!("{}/bookings", app.address))
        .header("X-User-ID", "not-a-uuid")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn overlapping_booking_is_a_conflict() {
    let app = spawn_app().await;
    let user = create_user(&app.db).await;
    let pod = create_pod(&app.db, Decimal::new(100, 0)).await;

    let response = app
        .client
        .post(format!("{}/bookings", app.address))
        .header("X-User-ID", user.user_id.to_string())
        .json(&json!({ "pod_id": pod.pod_id, "check_in": at(10), "check_out": at(12) }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created: Value = response.json().await.unwrap();
    let booking_id = created["booking"]["booking_id"].as_str().unwrap().to_string();
    assert_eq!(created["booking"]["status"], "pending");

    let response = app
        .client
        .post(format!("{}/bookings", app.address))
        .header("X-User-ID", user.user_id.to_string())
        .json(&json!({ "pod_id": pod.pod_id, "check_in": at(11), "check_out": at(13) }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Someone else's booking is invisible.
    let response = app
        .client
        .get(format!("{}/bookings/{}", app.address, booking_id))
        .header("X-User-ID", Uuid::new_v4().to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .client
        .post(format!("{}/bookings/{}/cancel", app.address, booking_id))
        .header("X-User-ID", user.user_id.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cancelled: Value = response.json().await.unwrap();
    assert_eq!(cancelled["status"], "cancelled");
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn webhook_requires_a_valid_signature() {
    let app = spawn_app().await;
    let (body, signature, timestamp) = payment_success_webhook(
        &app.gateway,
        &format!("METRO_{}", Uuid::new_v4().simple()),
        1,
        Decimal::new(100, 0),
    );

    let response = app
        .client
        .post(format!("{}/payments/webhook", app.address))
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .client
        .post(format!("{}/payments/webhook", app.address))
        .header("x-webhook-signature", signature)
        .header("x-webhook-timestamp", format!("{}0", timestamp))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn metrics_expose_domain_and_http_series() {
    let app = spawn_app().await;
    app.client
        .get(format!("{}/health", app.address))
        .send()
        .await
        .unwrap();

    let body = app
        .client
        .get(format!("{}/metrics", app.address))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("booking_db_query_duration_seconds"));
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn orders_are_visible_and_refundable_only_by_their_owner() {
    let app = spawn_app().await;
    let user = create_user(&app.db).await;
    let pod = create_pod(&app.db, Decimal::new(100, 0)).await;

    let response = app
        .client
        .post(format!("{}/bookings", app.address))
        .header("X-User-ID", user.user_id.to_string())
        .json(&json!({ "pod_id": pod.pod_id, "check_in": at(15), "check_out": at(17) }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created: Value = response.json().await.unwrap();
    let booking_id = created["booking"]["booking_id"].as_str().unwrap().to_string();

    let response = app
        .client
        .post(format!("{}/payments/orders", app.address))
        .header("X-User-ID", user.user_id.to_string())
        .json(&json!({
            "booking_id": booking_id,
            "amount": "200",
            "customer_details": { "name": "Owner", "phone": "9999999999" }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let order: Value = response.json().await.unwrap();
    let order_id = order["order_id"].as_str().unwrap().to_string();

    let stranger = Uuid::new_v4().to_string();
    let response = app
        .client
        .get(format!("{}/payments/orders/{}/status", app.address, order_id))
        .header("X-User-ID", &stranger)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .client
        .post(format!("{}/payments/refunds", app.address))
        .header("X-User-ID", &stranger)
        .json(&json!({ "order_id": order_id, "refund_amount": "50" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(app.gateway.call_count("create_refund"), 0);

    let response = app
        .client
        .get(format!("{}/payments/orders/{}/status", app.address, order_id))
        .header("X-User-ID", user.user_id.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status: Value = response.json().await.unwrap();
    assert_eq!(status["order_id"], order_id.as_str());
}
