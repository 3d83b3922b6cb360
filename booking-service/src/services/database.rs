//! Database service for booking-service: pool, migrations and inventory rows.

use crate::models::{NewPod, Pod, PodStatus, UserSummary};
use crate::services::error::ServiceError;
use crate::services::metrics::DB_QUERY_DURATION;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "booking-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Pod Operations
    // =========================================================================

    /// Register a pod. New pods start `available`.
    #[instrument(skip(self, input), fields(pod_number = %input.pod_number))]
    pub async fn create_pod(&self, input: &NewPod) -> Result<Pod, ServiceError> {
        validate_new_pod(input)?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_pod"])
            .start_timer();

        let result = sqlx::query_as::<_, Pod>(
            r#"
            INSERT INTO pods (pod_id, pod_number, description, address, status, price_per_hour, max_capacity, latitude, longitude)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.pod_number)
        .bind(&input.description)
        .bind(&input.address)
        .bind(PodStatus::Available.as_str())
        .bind(input.price_per_hour)
        .bind(input.max_capacity)
        .bind(input.latitude)
        .bind(input.longitude)
        .fetch_one(&self.pool)
        .await;

        timer.observe_duration();

        match result {
            Ok(pod) => {
                info!(pod_id = %pod.pod_id, "Pod created");
                Ok(pod)
            }
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => Err(
                ServiceError::InvalidInput(format!("pod number {} already exists", input.pod_number)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    pub async fn get_pod(&self, pod_id: Uuid) -> Result<Pod, ServiceError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["get_pod"]).start_timer();

        let pod = sqlx::query_as::<_, Pod>("SELECT * FROM pods WHERE pod_id = $1")
            .bind(pod_id)
            .fetch_optional(&self.pool)
            .await?;

        timer.observe_duration();
        pod.ok_or_else(|| ServiceError::not_found("Pod", pod_id))
    }

    /// Set a pod's operational status (maintenance windows and the like).
    #[instrument(skip(self))]
    pub async fn update_pod_status(
        &self,
        pod_id: Uuid,
        status: PodStatus,
    ) -> Result<Pod, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_pod_status"])
            .start_timer();

        let pod = sqlx::query_as::<_, Pod>(
            "UPDATE pods SET status = $2, updated_utc = NOW() WHERE pod_id = $1 RETURNING *",
        )
        .bind(pod_id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;

        timer.observe_duration();
        pod.ok_or_else(|| ServiceError::not_found("Pod", pod_id))
    }

    // =========================================================================
    // User Operations
    // =========================================================================

    #[instrument(skip(self, email, phone_number))]
    pub async fn create_user(
        &self,
        name: &str,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<UserSummary, ServiceError> {
        if name.trim().is_empty() {
            return Err(ServiceError::InvalidInput("name is required".to_string()));
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_user"])
            .start_timer();

        let user = sqlx::query_as::<_, UserSummary>(
            r#"
            INSERT INTO users (user_id, name, email, phone_number)
            VALUES ($1, $2, $3, $4)
            RETURNING user_id, name, email, phone_number
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name.trim())
        .bind(email)
        .bind(phone_number)
        .fetch_one(&self.pool)
        .await?;

        timer.observe_duration();
        Ok(user)
    }

    #[instrument(skip(self))]
    pub async fn get_user(&self, user_id: Uuid) -> Result<UserSummary, ServiceError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["get_user"]).start_timer();

        let user = sqlx::query_as::<_, UserSummary>(
            "SELECT user_id, name, email, phone_number FROM users WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        timer.observe_duration();
        user.ok_or_else(|| ServiceError::not_found("User", user_id))
    }
}

fn validate_new_pod(input: &NewPod) -> Result<(), ServiceError> {
    if input.pod_number.trim().is_empty() {
        return Err(ServiceError::InvalidInput("pod_number is required".to_string()));
    }
    if input.price_per_hour.is_sign_negative() {
        return Err(ServiceError::InvalidInput(
            "price_per_hour must not be negative".to_string(),
        ));
    }
    if input.max_capacity <= 0 {
        return Err(ServiceError::InvalidInput(
            "max_capacity must be positive".to_string(),
        ));
    }
    if !(-90.0..=90.0).contains(&input.latitude) || !(-180.0..=180.0).contains(&input.longitude) {
        return Err(ServiceError::InvalidInput(
            "coordinates out of range".to_string(),
        ));
    }
    Ok(())
}
