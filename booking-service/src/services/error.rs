use crate::services::gateway::GatewayError;
use rust_decimal::Decimal;
use service_core::error::AppError;
use thiserror::Error;

/// Coarse error categories callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Conflict,
    Unauthorized,
    ExternalServiceError,
    InvalidSignature,
    InvariantViolation,
    Internal,
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Pod {0} does not exist or is not available")]
    PodUnavailable(uuid::Uuid),

    #[error("Requested slot overlaps an existing booking")]
    SlotConflict,

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Not permitted: {0}")]
    Unauthorized(String),

    #[error("No default payment provider configured")]
    NoProviderConfigured,

    #[error("Payment creation failed: {0}")]
    PaymentCreationFailed(String),

    #[error("Payment gateway error: {0}")]
    ExternalService(#[from] GatewayError),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Refund of {requested} exceeds refundable balance {eligible}")]
    RefundExceedsEligible {
        requested: Decimal,
        eligible: Decimal,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::PodUnavailable(_) | Self::SlotConflict | Self::InvalidTransition(_) => {
                ErrorKind::Conflict
            }
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::PaymentCreationFailed(_) | Self::ExternalService(_) => {
                ErrorKind::ExternalServiceError
            }
            Self::InvalidSignature => ErrorKind::InvalidSignature,
            Self::RefundExceedsEligible { .. } => ErrorKind::InvariantViolation,
            Self::NoProviderConfigured | Self::Database(_) | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound { .. } => "not_found",
            Self::PodUnavailable(_) => "pod_unavailable",
            Self::SlotConflict => "slot_conflict",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::Unauthorized(_) => "unauthorized",
            Self::NoProviderConfigured => "no_provider",
            Self::PaymentCreationFailed(_) => "payment_creation_failed",
            Self::ExternalService(_) => "gateway_error",
            Self::InvalidSignature => "invalid_signature",
            Self::RefundExceedsEligible { .. } => "refund_exceeds_eligible",
            Self::Database(_) => "db_error",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::InvalidInput(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            ServiceError::NotFound { .. } => AppError::NotFound(anyhow::anyhow!(err.to_string())),
            ServiceError::PodUnavailable(_)
            | ServiceError::SlotConflict
            | ServiceError::InvalidTransition(_) => {
                AppError::Conflict(anyhow::anyhow!(err.to_string()))
            }
            ServiceError::Unauthorized(msg) => AppError::Forbidden(anyhow::anyhow!(msg)),
            ServiceError::NoProviderConfigured => AppError::ServiceUnavailable(err.to_string()),
            // Upstream detail is logged where the call failed; callers get the operation only.
            ServiceError::PaymentCreationFailed(_) => {
                AppError::BadGateway("payment order could not be created".to_string())
            }
            ServiceError::ExternalService(e) => AppError::BadGateway(e.public_message()),
            ServiceError::InvalidSignature => {
                AppError::Unauthorized(anyhow::anyhow!("Invalid webhook signature"))
            }
            ServiceError::RefundExceedsEligible { .. } => {
                AppError::UnprocessableEntity(anyhow::anyhow!(err.to_string()))
            }
            ServiceError::Database(e) => AppError::DatabaseError(e.into()),
            ServiceError::Internal(e) => AppError::InternalError(e),
        }
    }
}
