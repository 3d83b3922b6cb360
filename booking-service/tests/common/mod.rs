//! Common test utilities for booking-service integration tests.
//!
//! Tests need a migrated PostgreSQL database at `TEST_DATABASE_URL`.

#![allow(dead_code)]

use booking_service::config::{
    BookingConfig, CashfreeConfig, DatabaseConfig, PaymentConfig, ReservationConfig,
    WebhookReplayConfig,
};
use booking_service::models::{NewPod, Pod, UserSummary};
use booking_service::services::{
    AccessCodeIssuer, Database, MockGateway, PaymentEngine, PaymentGateway, QrAccessCodeIssuer,
    ReservationEngine,
};
use booking_service::startup::Application;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use secrecy::Secret;
use service_core::config::Config as CommonConfig;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Once};
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "test_secret";

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,booking_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn database_url() -> String {
    std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must point at a PostgreSQL database")
}

pub fn test_config() -> BookingConfig {
    BookingConfig {
        common: CommonConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
        },
        service_name: "booking-service-test".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: database_url(),
            max_connections: 10,
            min_connections: 1,
        },
        cashfree: CashfreeConfig {
            client_id: String::new(),
            client_secret: Secret::new(WEBHOOK_SECRET.to_string()),
            api_base_url: "http://127.0.0.1:1".to_string(),
            api_version: "2023-08-01".to_string(),
            timeout_secs: 1,
        },
        payments: PaymentConfig {
            currency: "INR".to_string(),
            return_url: None,
            notify_url: None,
        },
        reservations: ReservationConfig {
            pending_hold_minutes: 15,
        },
        webhook_replay: WebhookReplayConfig {
            enabled: false,
            interval_secs: 60,
            min_age_secs: 0,
            batch_size: 50,
            max_attempts: 10,
        },
    }
}

/// Engines wired to a real database and the in-memory gateway.
pub struct TestContext {
    pub db: Database,
    pub gateway: Arc<MockGateway>,
    pub reservations: ReservationEngine,
    pub payments: PaymentEngine,
}

pub async fn test_context() -> TestContext {
    test_context_with_issuer(Arc::new(QrAccessCodeIssuer)).await
}

pub async fn test_context_with_issuer(issuer: Arc<dyn AccessCodeIssuer>) -> TestContext {
    init_tracing();
    let config = test_config();

    let db = Database::new(&config.database.url, 10, 1)
        .await
        .expect("Failed to connect to test database");
    db.run_migrations().await.expect("Failed to run migrations");

    let gateway = Arc::new(MockGateway::new(WEBHOOK_SECRET));
    let reservations =
        ReservationEngine::new(db.clone(), issuer, config.reservations.pending_hold());
    let payments = PaymentEngine::new(
        db.clone(),
        gateway.clone() as Arc<dyn PaymentGateway>,
        config.payments.clone(),
        config.webhook_replay.clone(),
    );

    TestContext {
        db,
        gateway,
        reservations,
        payments,
    }
}

pub async fn create_user(db: &Database) -> UserSummary {
    db.create_user("Test User", Some("test@example.com"), Some("9999999999"))
        .await
        .expect("Failed to create user")
}

/// A fresh pod so tests never share a calendar.
pub async fn create_pod(db: &Database, price_per_hour: Decimal) -> Pod {
    db.create_pod(&NewPod {
        pod_number: format!("TEST-{}", Uuid::new_v4().simple()),
        description: Some("Integration test pod".to_string()),
        address: Some("MG Road, Bengaluru".to_string()),
        price_per_hour,
        max_capacity: 2,
        latitude: 12.9716,
        longitude: 77.5946,
    })
    .await
    .expect("Failed to create pod")
}

/// `hour:00` UTC on a fixed future day.
pub fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2031, 3, 14, hour, 0, 0).unwrap()
}

/// Sign a webhook body with the gateway's secret: `(body, signature, timestamp)`.
pub fn signed(gateway: &MockGateway, body: serde_json::Value) -> (String, String, String) {
    let body = body.to_string();
    let timestamp = Utc::now().timestamp().to_string();
    let signature = gateway.sign(&timestamp, &body);
    (body, signature, timestamp)
}

/// Signed payment webhook of `event_type` reporting `payment_status`.
pub fn payment_webhook(
    gateway: &MockGateway,
    event_type: &str,
    payment_status: &str,
    order_id: &str,
    provider_payment_id: u64,
    amount: Decimal,
) -> (String, String, String) {
    signed(
        gateway,
        serde_json::json!({
            "type": event_type,
            "event_time": "2031-03-14T10:00:00+05:30",
            "data": {
                "order": { "order_id": order_id, "order_amount": amount },
                "payment": {
                    "cf_payment_id": provider_payment_id,
                    "payment_status": payment_status,
                    "payment_amount": amount,
                    "payment_currency": "INR",
                    "payment_time": "2031-03-14T10:00:00+05:30",
                    "payment_group": "upi"
                }
            }
        }),
    )
}

/// Signed payment-success webhook body for `order_id`.
pub fn payment_success_webhook(
    gateway: &MockGateway,
    order_id: &str,
    provider_payment_id: u64,
    amount: Decimal,
) -> (String, String, String) {
    payment_webhook(
        gateway,
        "PAYMENT_SUCCESS_WEBHOOK",
        "SUCCESS",
        order_id,
        provider_payment_id,
        amount,
    )
}

/// Signed refund-status webhook for a refund created through the engine.
pub fn refund_status_webhook(
    gateway: &MockGateway,
    order_id: &str,
    refund_id: &str,
    amount: Decimal,
    refund_status: &str,
) -> (String, String, String) {
    signed(
        gateway,
        serde_json::json!({
            "type": "REFUND_STATUS_WEBHOOK",
            "event_time": "2031-03-14T12:00:00+05:30",
            "data": {
                "refund": {
                    "cf_refund_id": format!("cf_{}", refund_id),
                    "refund_id": refund_id,
                    "order_id": order_id,
                    "refund_amount": amount,
                    "refund_currency": "INR",
                    "refund_status": refund_status,
                    "refund_arn": "ARN0001"
                }
            }
        }),
    )
}

/// Running HTTP application.
pub struct TestApp {
    pub address: String,
    pub http_port: u16,
    pub db: Database,
    pub gateway: Arc<MockGateway>,
    pub client: reqwest::Client,
}

/// Spawn the HTTP application on a random port.
pub async fn spawn_app() -> TestApp {
    init_tracing();

    let gateway = Arc::new(MockGateway::new(WEBHOOK_SECRET));
    let app = Application::build_without_migrations(
        test_config(),
        gateway.clone() as Arc<dyn PaymentGateway>,
    )
    .await
    .expect("Failed to build application");
    app.db()
        .run_migrations()
        .await
        .expect("Failed to run migrations");

    let http_port = app.http_port();
    let db = app.db().clone();

    tokio::spawn(async move {
        app.run_until_stopped().await.ok();
    });

    let address = format!("http://127.0.0.1:{}", http_port);
    let client = reqwest::Client::new();

    // Wait for the listener to answer.
    let mut attempts = 0;
    loop {
        match client.get(format!("{}/health", address)).send().await {
            Ok(_) => break,
            Err(_) if attempts < 20 => {
                attempts += 1;
                tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
            }
            Err(e) => panic!("Service did not come up after 20 attempts: {}", e),
        }
    }

    TestApp {
        address,
        http_port,
        db,
        gateway,
        client,
    }
}
