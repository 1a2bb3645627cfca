//! Request authentication middleware.
//!
//! User and agent tokens are opaque; validation resolves their SHA-256 hash
//! against the durable store with a short-lived cache in front, then attaches
//! the resulting identity to the request extensions.

use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;

use crate::auth::{AgentIdentity, UserIdentity, bearer_token, hash_token};
use crate::cache::CachedUserToken;
use crate::error::ApiError;
use crate::models::USER_STATUS_ACTIVE;
use crate::server::AppState;

const USER_TOKEN_CACHE_TTL: Duration = Duration::from_secs(120);
const AGENT_SESSION_TTL: Duration = Duration::from_secs(3600);

/// Only bump `last_used_at` when the previous bump is older than this.
const LAST_USED_THROTTLE: chrono::Duration = chrono::Duration::minutes(5);

fn extract_bearer(request: &Request) -> Result<String, ApiError> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string)
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))
}

/// Validate a raw user token and resolve its identity. Shared between the
/// middleware and the websocket upgrade (which carries the token in a query
/// parameter).
pub async fn resolve_user_token(state: &AppState, raw: &str) -> Result<UserIdentity, ApiError> {
    let hash = hash_token(raw);
    let now = Utc::now();

    // Hot path: the cache spares two queries on every request.
    match state.cache.cached_user_token(&hash).await {
        Ok(Some(entry)) => {
            if entry.token_expires_at <= now {
                return Err(ApiError::Unauthorized("invalid user token".to_string()));
            }
            if entry.status != USER_STATUS_ACTIVE {
                return Err(ApiError::Forbidden("user account is not active".to_string()));
            }
            if entry.user_expires_at <= now {
                return Err(ApiError::Forbidden("user account has expired".to_string()));
            }
            return Ok(UserIdentity {
                user_id: entry.user_id,
                tenant_id: entry.tenant_id,
            });
        }
        Ok(None) => {}
        Err(err) => tracing::warn!("user token cache read failed: {err}"),
    }

    let Some(lookup) = state.store.lookup_user_token(&hash, now).await? else {
        return Err(ApiError::Unauthorized("invalid user token".to_string()));
    };
    let user = &lookup.user;
    if user.status != USER_STATUS_ACTIVE {
        return Err(ApiError::Forbidden("user account is not active".to_string()));
    }
    let Some(user_expires_at) = user.expires_at.filter(|t| *t > now) else {
        return Err(ApiError::Forbidden("user account has expired".to_string()));
    };

    let entry = CachedUserToken {
        user_id: user.id,
        tenant_id: user.tenant_id,
        status: user.status.clone(),
        user_expires_at,
        token_expires_at: lookup.token_expires_at,
    };
    if let Err(err) = state
        .cache
        .cache_user_token(&hash, &entry, USER_TOKEN_CACHE_TTL)
        .await
    {
        tracing::warn!("user token cache write failed: {err}");
    }

    if lookup
        .last_used_at
        .is_none_or(|t| now - t > LAST_USED_THROTTLE)
    {
        if let Err(err) = state.store.touch_user_token(lookup.token_id, now).await {
            tracing::debug!("last_used_at bump failed: {err}");
        }
    }

    Ok(UserIdentity {
        user_id: user.id,
        tenant_id: user.tenant_id,
    })
}

/// Middleware for user-facing scan endpoints.
pub async fn require_user(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let raw = extract_bearer(&request)?;
    let identity = resolve_user_token(&state, &raw).await?;
    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

/// Middleware for agent-facing endpoints; resolves the token to its tenant.
pub async fn require_agent(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let raw = extract_bearer(&request)?;
    let hash = hash_token(&raw);
    let now = Utc::now();

    let tenant_id = match state.cache.cached_agent_tenant(&hash).await {
        Ok(Some(tenant_id)) => tenant_id,
        cache_result => {
            if let Err(err) = cache_result {
                tracing::warn!("agent session cache read failed: {err}");
            }
            let Some(tenant_id) = state.store.lookup_agent_token(&hash, now).await? else {
                return Err(ApiError::Unauthorized("invalid agent token".to_string()));
            };
            if let Err(err) = state
                .cache
                .cache_agent_tenant(&hash, tenant_id, AGENT_SESSION_TTL)
                .await
            {
                tracing::warn!("agent session cache write failed: {err}");
            }
            tenant_id
        }
    };

    request.extensions_mut().insert(AgentIdentity { tenant_id });
    Ok(next.run(request).await)
}
