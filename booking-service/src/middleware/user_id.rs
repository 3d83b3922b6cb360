//! Caller identity extractor.
//!
//! The gateway in front of this service authenticates the user and forwards
//! their id in `X-User-ID`. Requests without it are rejected.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "X-User-ID";

/// Authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserId(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AppError::AuthError(anyhow::anyhow!("Missing {} header", USER_ID_HEADER))
            })?;

        let user_id = Uuid::parse_str(raw.trim()).map_err(|_| {
            AppError::AuthError(anyhow::anyhow!("{} is not a valid UUID", USER_ID_HEADER))
        })?;

        tracing::Span::current().record("user_id", tracing::field::display(user_id));

        Ok(UserId(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(header: Option<&str>) -> Result<UserId, AppError> {
        let mut builder = Request::builder().uri("/bookings");
        if let Some(value) = header {
            builder = builder.header(USER_ID_HEADER, value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        UserId::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn reads_uuid_header() {
        let id = Uuid::new_v4();
        let user = extract(Some(&id.to_string())).await.unwrap();
        assert_eq!(user, UserId(id));
    }

    #[tokio::test]
    async fn rejects_missing_or_malformed_header() {
        assert!(matches!(extract(None).await, Err(AppError::AuthError(_))));
        assert!(matches!(
            extract(Some("not-a-uuid")).await,
            Err(AppError::AuthError(_))
        ));
    }
}
