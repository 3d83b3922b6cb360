//! Prometheus metrics for booking-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// Booking lifecycle operations by outcome.
pub static BOOKING_OPERATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "booking_operations_total",
        "Total number of booking lifecycle operations",
        &["operation", "outcome"]
    )
    .expect("Failed to register booking_operations_total")
});

/// Payment orders, refunds and links by outcome.
pub static PAYMENT_OPERATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "booking_payment_operations_total",
        "Total number of payment operations",
        &["operation", "outcome"]
    )
    .expect("Failed to register payment_operations_total")
});

/// Webhook deliveries by event type and outcome.
pub static WEBHOOKS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "booking_webhooks_total",
        "Total number of payment webhooks received",
        &["event_type", "outcome"]
    )
    .expect("Failed to register webhooks_total")
});

/// Outbound payment gateway call latency.
pub static GATEWAY_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "booking_gateway_request_duration_seconds",
        "Payment gateway request duration in seconds",
        &["operation"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("Failed to register gateway_request_duration")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "booking_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&BOOKING_OPERATIONS_TOTAL);
    Lazy::force(&PAYMENT_OPERATIONS_TOTAL);
    Lazy::force(&WEBHOOKS_TOTAL);
    Lazy::force(&GATEWAY_REQUEST_DURATION);
    Lazy::force(&DB_QUERY_DURATION);
}

pub fn record_booking_operation(operation: &str, outcome: &str) {
    BOOKING_OPERATIONS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
}

pub fn record_payment_operation(operation: &str, outcome: &str) {
    PAYMENT_OPERATIONS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
}

pub fn record_webhook(event_type: &str, outcome: &str) {
    WEBHOOKS_TOTAL.with_label_values(&[event_type, outcome]).inc();
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
