//! Application startup and lifecycle management.

use crate::config::BookingConfig;
use crate::handlers;
use crate::services::{
    init_metrics, AccessCodeIssuer, CashfreeClient, Database, PaymentEngine, PaymentGateway,
    QrAccessCodeIssuer, ReservationEngine,
};
use crate::workers::WebhookReplayWorker;
use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::metrics::{install_metrics_recorder, metrics_middleware};
use service_core::middleware::tracing::request_id_middleware;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: BookingConfig,
    pub db: Database,
    pub reservations: ReservationEngine,
    pub payments: PaymentEngine,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route(
            "/bookings",
            post(handlers::bookings::create_booking).get(handlers::bookings::list_bookings),
        )
        .route("/bookings/:id", get(handlers::bookings::get_booking))
        .route(
            "/bookings/:id/confirm",
            post(handlers::bookings::confirm_booking),
        )
        .route(
            "/bookings/:id/cancel",
            post(handlers::bookings::cancel_booking),
        )
        .route("/pods", post(handlers::pods::create_pod))
        .route("/pods/search", get(handlers::pods::search_pods))
        .route("/pods/:id", get(handlers::pods::get_pod))
        .route("/pods/:id/status", put(handlers::pods::update_pod_status))
        .route("/payments/orders", post(handlers::payments::create_order))
        .route(
            "/payments/orders/:order_id/status",
            get(handlers::payments::get_status),
        )
        .route("/payments/history", get(handlers::payments::history))
        .route("/payments/links", post(handlers::payments::create_link))
        .route("/payments/refunds", post(handlers::payments::create_refund))
        .route(
            "/payments/webhook",
            post(handlers::webhook::payment_webhook),
        )
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    user_id = tracing::field::Empty,
                )
            }),
        )
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
    replay_worker: Option<WebhookReplayWorker>,
}

impl Application {
    /// Build the application with the Cashfree gateway.
    pub async fn build(config: BookingConfig) -> Result<Self, AppError> {
        let gateway = CashfreeClient::new(config.cashfree.clone()).map_err(|e| {
            tracing::error!(error = %e, "Failed to build Cashfree client");
            AppError::InternalError(anyhow::anyhow!("Gateway client error: {}", e))
        })?;
        if gateway.is_configured() {
            tracing::info!("Cashfree client initialized");
        } else {
            tracing::warn!("Cashfree credentials not configured - payment features will be limited");
        }

        Self::build_internal(config, Arc::new(gateway), true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(
        config: BookingConfig,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Result<Self, AppError> {
        Self::build_internal(config, gateway, false).await
    }

    async fn build_internal(
        config: BookingConfig,
        gateway: Arc<dyn PaymentGateway>,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();
        install_metrics_recorder();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let issuer: Arc<dyn AccessCodeIssuer> = Arc::new(QrAccessCodeIssuer);
        let reservations =
            ReservationEngine::new(db.clone(), issuer, config.reservations.pending_hold());
        let payments = PaymentEngine::new(
            db.clone(),
            gateway,
            config.payments.clone(),
            config.webhook_replay.clone(),
        );

        let replay_worker = Some(WebhookReplayWorker::new(payments.clone()));

        let state = AppState {
            config: config.clone(),
            db,
            reservations,
            payments,
        };

        // Port 0 binds a random port for tests.
        let http_addr = config.common.socket_addr();
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", http_addr, e);
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Booking service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state,
            replay_worker,
        })
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn db(&self) -> &Database {
        &self.state.db
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Serve HTTP and run the webhook replay worker until the server exits.
    pub async fn run_until_stopped(mut self) -> std::io::Result<()> {
        let replay_shutdown = match self.replay_worker.take() {
            Some(worker) => {
                let token = worker.shutdown_token();
                worker.start();
                token
            }
            None => CancellationToken::new(),
        };

        tracing::info!(
            service = %self.state.config.service_name,
            version = %self.state.config.service_version,
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        let app = router(self.state);
        let result = axum::serve(self.http_listener, app).await;
        replay_shutdown.cancel();

        if let Err(e) = result {
            tracing::error!(error = %e, "HTTP server error");
            return Err(std::io::Error::other(format!("HTTP server error: {}", e)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        CashfreeConfig, DatabaseConfig, PaymentConfig, ReservationConfig, WebhookReplayConfig,
    };
    use crate::services::MockGateway;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use secrecy::Secret;
    use sqlx::postgres::PgPoolOptions;
    use tower::ServiceExt;

    fn test_config() -> BookingConfig {
        BookingConfig {
            common: service_core::config::Config::default(),
            service_name: "booking-service".to_string(),
            service_version: "test".to_string(),
            log_level: "debug".to_string(),
            otlp_endpoint: None,
            database: DatabaseConfig {
                url: "postgres://localhost/unused".to_string(),
                max_connections: 1,
                min_connections: 0,
            },
            cashfree: CashfreeConfig {
                client_id: String::new(),
                client_secret: Secret::new(String::new()),
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
                min_age_secs: 30,
                batch_size: 10,
                max_attempts: 3,
            },
        }
    }

    /// Router over a pool that never connects; only routes that fail before
    /// touching the database are exercised.
    fn offline_router() -> Router {
        let config = test_config();
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy(&config.database.url)
            .unwrap();
        let db = Database::from_pool(pool);
        let issuer: Arc<dyn AccessCodeIssuer> = Arc::new(QrAccessCodeIssuer);
        let reservations =
            ReservationEngine::new(db.clone(), issuer, config.reservations.pending_hold());
        let payments = PaymentEngine::new(
            db.clone(),
            Arc::new(MockGateway::new("secret")),
            config.payments.clone(),
            config.webhook_replay.clone(),
        );

        router(AppState {
            config,
            db,
            reservations,
            payments,
        })
    }

    #[tokio::test]
    async fn booking_routes_reject_anonymous_callers() {
        let response = offline_router()
            .oneshot(Request::builder().uri("/bookings").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn unsigned_webhook_is_rejected() {
        let response = offline_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/payments/webhook")
                    .body(Body::from(r#"{"type":"PAYMENT_SUCCESS_WEBHOOK","data":{}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let response = offline_router()
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
