//! Error types shared across the service.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors from the durable (PostgreSQL) store.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("query failed: {0}")]
    Query(#[from] tokio_postgres::Error),

    #[error("migration failed: {0}")]
    Migration(String),
}

impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        DatabaseError::Pool(e.to_string())
    }
}

/// Errors from the ephemeral coordination store.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("lease owner mismatch")]
    LeaseOwnerMismatch,
}

/// Request-level errors, mapped onto HTTP statuses.
///
/// The taxonomy: validation before any store access, authorization/ownership
/// before mutation, conflicts without partial state change, cooldown/rate
/// rejections with remaining-wait information, and transient store failures
/// surfaced as opaque internal errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{detail}")]
    Cooldown { detail: String, retry_after_secs: i64 },

    #[error("too many requests")]
    RateLimited { window_secs: u64 },

    #[error("internal error")]
    Internal(anyhow::Error),
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        ApiError::Internal(e.into())
    }
}

impl From<CacheError> for ApiError {
    fn from(e: CacheError) -> Self {
        ApiError::Internal(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            ApiError::Validation(d) => (StatusCode::BAD_REQUEST, d.clone()),
            ApiError::Unauthorized(d) => (StatusCode::UNAUTHORIZED, d.clone()),
            ApiError::Forbidden(d) => (StatusCode::FORBIDDEN, d.clone()),
            ApiError::NotFound(d) => (StatusCode::NOT_FOUND, d.clone()),
            ApiError::Conflict(d) => (StatusCode::CONFLICT, d.clone()),
            ApiError::Cooldown { detail, .. } => (StatusCode::TOO_MANY_REQUESTS, detail.clone()),
            ApiError::RateLimited { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "too many requests, slow down".to_string(),
            ),
            ApiError::Internal(source) => {
                tracing::error!("internal error: {:#}", source);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };

        let body = match &self {
            ApiError::Cooldown {
                retry_after_secs, ..
            } => serde_json::json!({
                "detail": detail,
                "cooldown_remaining_sec": retry_after_secs,
            }),
            _ => serde_json::json!({ "detail": detail }),
        };

        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited { window_secs } = self {
            if let Ok(value) = window_secs.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_statuses() {
        let cases = [
            (ApiError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (
                ApiError::Unauthorized("no token".into()),
                StatusCode::UNAUTHORIZED,
            ),
            (ApiError::Forbidden("not yours".into()), StatusCode::FORBIDDEN),
            (ApiError::NotFound("gone".into()), StatusCode::NOT_FOUND),
            (ApiError::Conflict("busy".into()), StatusCode::CONFLICT),
            (
                ApiError::Cooldown {
                    detail: "wait".into(),
                    retry_after_secs: 30,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[test]
    fn rate_limited_sets_retry_after() {
        let response = ApiError::RateLimited { window_secs: 1 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "1");
    }
}
