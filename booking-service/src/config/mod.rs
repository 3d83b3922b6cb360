//! Configuration module for booking-service.

use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BookingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub cashfree: CashfreeConfig,
    pub payments: PaymentConfig,
    pub reservations: ReservationConfig,
    pub webhook_replay: WebhookReplayConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct CashfreeConfig {
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub api_base_url: String,
    pub api_version: String,
    pub timeout_secs: u64,
}

impl CashfreeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone)]
pub struct PaymentConfig {
    pub currency: String,
    pub return_url: Option<String>,
    pub notify_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReservationConfig {
    /// How long an unpaid `pending` booking keeps its slot.
    pub pending_hold_minutes: i64,
}

impl ReservationConfig {
    pub fn pending_hold(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.pending_hold_minutes)
    }
}

#[derive(Debug, Clone)]
pub struct WebhookReplayConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub min_age_secs: i64,
    pub batch_size: i64,
    pub max_attempts: i32,
}

impl WebhookReplayConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl BookingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "booking-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 2),
            },
            cashfree: CashfreeConfig {
                client_id: env::var("CASHFREE_CLIENT_ID").unwrap_or_default(),
                client_secret: Secret::new(
                    env::var("CASHFREE_CLIENT_SECRET").unwrap_or_default(),
                ),
                api_base_url: env::var("CASHFREE_API_BASE_URL")
                    .unwrap_or_else(|_| "https://sandbox.cashfree.com/pg".to_string()),
                api_version: env::var("CASHFREE_API_VERSION")
                    .unwrap_or_else(|_| "2023-08-01".to_string()),
                timeout_secs: env_or("CASHFREE_TIMEOUT_SECS", 30),
            },
            payments: PaymentConfig {
                currency: env::var("PAYMENT_CURRENCY").unwrap_or_else(|_| "INR".to_string()),
                return_url: env::var("PAYMENT_RETURN_URL").ok(),
                notify_url: env::var("PAYMENT_NOTIFY_URL").ok(),
            },
            reservations: ReservationConfig {
                pending_hold_minutes: env_or("BOOKING_PENDING_HOLD_MINUTES", 15),
            },
            webhook_replay: WebhookReplayConfig {
                enabled: env_or("WEBHOOK_REPLAY_ENABLED", true),
                interval_secs: env_or("WEBHOOK_REPLAY_INTERVAL_SECS", 60),
                min_age_secs: env_or("WEBHOOK_REPLAY_MIN_AGE_SECS", 30),
                batch_size: env_or("WEBHOOK_REPLAY_BATCH_SIZE", 50),
                max_attempts: env_or("WEBHOOK_MAX_ATTEMPTS", 10),
            },
        })
    }
}
