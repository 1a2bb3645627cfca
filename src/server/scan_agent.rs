//! Agent-facing interactive scan endpoints.
//!
//! The claim path reuses the standard-job pattern under the scan lease
//! namespace with a longer default TTL; reconciliation here caps retries at
//! the attempts bound instead of requeueing forever.

use std::time::Duration;

use axum::Json;
use axum::extract::{Extension, Path, Query, State};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::auth::AgentIdentity;
use crate::error::ApiError;
use crate::models::scan_phase;
use crate::server::AppState;
use crate::server::ws::ScanPush;
use crate::store::ScanFailOutcome;

const MAX_SCAN_POLL_LIMIT: i64 = 5;

#[derive(Debug, Deserialize)]
pub struct ScanPollRequest {
    pub node_id: String,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub lease_seconds: i64,
}

#[derive(Debug, Deserialize)]
pub struct NodeRequest {
    pub node_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PhaseRequest {
    pub node_id: String,
    pub phase: String,
    #[serde(default)]
    pub screenshot: Option<String>,
    #[serde(default)]
    pub screenshot_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScanHeartbeatRequest {
    pub node_id: String,
    #[serde(default)]
    pub lease_seconds: i64,
}

#[derive(Debug, Deserialize)]
pub struct FinishRequest {
    pub node_id: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChoiceQuery {
    pub node_id: String,
}

fn require_node_id(node_id: &str) -> Result<(), ApiError> {
    if node_id.trim().is_empty() {
        return Err(ApiError::Validation("node_id is required".to_string()));
    }
    Ok(())
}

const KNOWN_PHASES: [&str; 6] = [
    scan_phase::WAITING,
    scan_phase::LAUNCHING,
    scan_phase::CHOOSE_SYSTEM,
    scan_phase::CHOOSE_ZONE,
    scan_phase::CHOOSE_ROLE,
    scan_phase::DONE,
];

pub async fn poll_scans(
    State(state): State<AppState>,
    Extension(agent): Extension<AgentIdentity>,
    Json(req): Json<ScanPollRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_node_id(&req.node_id)?;
    let now = Utc::now();

    let limit = if req.limit <= 0 {
        1
    } else {
        req.limit.min(MAX_SCAN_POLL_LIMIT)
    };
    let lease_seconds = if req.lease_seconds <= 0 {
        state.config.scan_lease_seconds
    } else {
        req.lease_seconds
    };
    let lease_ttl = Duration::from_secs(lease_seconds as u64);
    let lease_until = now + chrono::Duration::seconds(lease_seconds);

    // Reconcile expired leases for this tenant, capping at the attempts
    // bound.
    let repaired = state
        .store
        .reset_expired_scan_leases(Some(agent.tenant_id), now)
        .await?;
    for lease in repaired {
        if let Err(err) = state.cache.clear_scan_lease(lease.id).await {
            tracing::warn!(session_id = lease.id, "failed to clear scan lease: {err}");
        }
    }

    let candidates = state
        .store
        .claim_scan_candidates(agent.tenant_id, limit)
        .await?;

    let mut sessions = Vec::with_capacity(candidates.len());
    for session in candidates {
        let acquired = match state
            .cache
            .acquire_scan_lease(session.id, &req.node_id, lease_ttl)
            .await
        {
            Ok(acquired) => acquired,
            Err(err) => {
                tracing::warn!(session_id = session.id, "scan lease acquire failed: {err}");
                continue;
            }
        };
        if !acquired {
            continue;
        }

        match state
            .store
            .mark_scan_leased(session.id, &req.node_id, lease_until, now)
            .await
        {
            Ok(true) => sessions.push(json!({
                "scan_session_id": session.id,
                "user_id": session.user_id,
                "login_id": session.login_id,
                "lease_until": lease_until,
            })),
            Ok(false) => {
                if let Err(err) = state.cache.release_scan_lease(session.id, &req.node_id).await {
                    tracing::warn!(session_id = session.id, "scan lease rollback failed: {err}");
                }
            }
            Err(err) => {
                if let Err(release_err) =
                    state.cache.release_scan_lease(session.id, &req.node_id).await
                {
                    tracing::warn!(
                        session_id = session.id,
                        "scan lease rollback failed: {release_err}"
                    );
                }
                return Err(err.into());
            }
        }
    }

    Ok(Json(json!({"data": {
        "jobs": sessions,
        "lease_until": lease_until,
    }})))
}

pub async fn scan_start(
    State(state): State<AppState>,
    Extension(_agent): Extension<AgentIdentity>,
    Path(session_id): Path<i64>,
    Json(req): Json<NodeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_node_id(&req.node_id)?;
    require_lease_owner(&state, session_id, &req.node_id).await?;
    let now = Utc::now();

    state.store.start_scan(session_id, now).await?;

    if let Some(session) = state.store.scan_by_id(session_id).await? {
        state
            .hub
            .notify_user(session.user_id, ScanPush::phase(scan_phase::LAUNCHING));
    }

    Ok(Json(json!({"data": {"message": "ok"}})))
}

pub async fn scan_phase_report(
    State(state): State<AppState>,
    Extension(_agent): Extension<AgentIdentity>,
    Path(session_id): Path<i64>,
    Json(req): Json<PhaseRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_node_id(&req.node_id)?;
    if !KNOWN_PHASES.contains(&req.phase.as_str()) {
        return Err(ApiError::Validation(format!("unknown phase {}", req.phase)));
    }
    require_lease_owner(&state, session_id, &req.node_id).await?;
    let now = Utc::now();

    let screenshot = match (&req.screenshot_key, &req.screenshot) {
        (Some(key), Some(data)) if !key.is_empty() && !data.is_empty() => {
            Some((key.as_str(), data.as_str()))
        }
        _ => None,
    };
    state
        .store
        .set_scan_phase(session_id, &req.phase, screenshot, now)
        .await?;

    // A new phase invalidates whatever the user answered before.
    if let Err(err) = state.cache.clear_scan_user_choice(session_id).await {
        tracing::warn!(session_id, "clearing stale user choice failed: {err}");
    }

    let lease_ttl = Duration::from_secs(state.config.scan_lease_seconds as u64);
    let renewed = state
        .cache
        .renew_scan_lease(session_id, &req.node_id, lease_ttl)
        .await?;
    if !renewed {
        return Err(ApiError::Conflict("lease renewal conflict".to_string()));
    }

    if let Some(session) = state.store.scan_by_id(session_id).await? {
        let mut push = ScanPush::phase(req.phase.clone());
        if let Some(data) = req.screenshot.filter(|s| !s.is_empty()) {
            push = push.with_screenshot(data);
        }
        state.hub.notify_user(session.user_id, push);
    }

    Ok(Json(json!({"data": {"message": "ok"}})))
}

pub async fn scan_choice(
    State(state): State<AppState>,
    Extension(_agent): Extension<AgentIdentity>,
    Path(session_id): Path<i64>,
    Query(query): Query<ChoiceQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_node_id(&query.node_id)?;
    require_lease_owner(&state, session_id, &query.node_id).await?;

    let session = state
        .store
        .scan_by_id(session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("scan session not found".to_string()))?;
    let cancelled = session.status == crate::models::ScanStatus::Cancelled;

    let user_online = state.cache.is_scan_user_online(session_id).await.unwrap_or(false);

    let choices = state.cache.scan_user_choice(session_id).await?;
    let (choice_type, value) = choices
        .iter()
        .next()
        .map(|(k, v)| (k.clone(), v.clone()))
        .unwrap_or_default();

    Ok(Json(json!({"data": {
        "has_choice": !choices.is_empty(),
        "choice_type": choice_type,
        "value": value,
        "cancelled": cancelled,
        "user_online": user_online,
    }})))
}

pub async fn scan_heartbeat(
    State(state): State<AppState>,
    Extension(_agent): Extension<AgentIdentity>,
    Path(session_id): Path<i64>,
    Json(req): Json<ScanHeartbeatRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_node_id(&req.node_id)?;
    require_lease_owner(&state, session_id, &req.node_id).await?;
    let now = Utc::now();

    let lease_seconds = if req.lease_seconds <= 0 {
        state.config.scan_lease_seconds
    } else {
        req.lease_seconds
    };
    let lease_ttl = Duration::from_secs(lease_seconds as u64);
    let lease_until = now + chrono::Duration::seconds(lease_seconds);

    let renewed = state
        .cache
        .renew_scan_lease(session_id, &req.node_id, lease_ttl)
        .await?;
    if !renewed {
        return Err(ApiError::Conflict("lease renewal conflict".to_string()));
    }
    state.store.extend_scan_lease(session_id, lease_until, now).await?;

    Ok(Json(json!({"data": {"message": "ok"}})))
}

pub async fn scan_complete(
    State(state): State<AppState>,
    Extension(_agent): Extension<AgentIdentity>,
    Path(session_id): Path<i64>,
    Json(req): Json<FinishRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_node_id(&req.node_id)?;
    require_lease_owner(&state, session_id, &req.node_id).await?;
    let now = Utc::now();

    state.store.complete_scan(session_id, now).await?;

    if let Err(err) = state.cache.release_scan_lease(session_id, &req.node_id).await {
        tracing::warn!(session_id, "lease release after complete failed: {err}");
    }

    if let Some(session) = state.store.scan_by_id(session_id).await? {
        state.hub.notify_user(
            session.user_id,
            ScanPush::completed(scan_phase::DONE, req.message.unwrap_or_default()),
        );
    }

    Ok(Json(json!({"data": {"message": "ok"}})))
}

pub async fn scan_fail(
    State(state): State<AppState>,
    Extension(_agent): Extension<AgentIdentity>,
    Path(session_id): Path<i64>,
    Json(req): Json<FinishRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_node_id(&req.node_id)?;
    require_lease_owner(&state, session_id, &req.node_id).await?;
    let now = Utc::now();

    let session = state
        .store
        .scan_by_id(session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("scan session not found".to_string()))?;

    let message = req
        .message
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "scan failed".to_string());

    let outcome = state
        .store
        .fail_scan(session_id, &message, now)
        .await?
        .ok_or_else(|| ApiError::NotFound("scan session not found".to_string()))?;

    if let Err(err) = state.cache.release_scan_lease(session_id, &req.node_id).await {
        tracing::warn!(session_id, "lease release after fail failed: {err}");
    }

    match outcome {
        ScanFailOutcome::Requeued => {
            tracing::info!(session_id, "scan failed, requeued for another attempt");
        }
        ScanFailOutcome::Failed => {
            tracing::info!(session_id, "scan failed terminally");
        }
    }
    state
        .hub
        .notify_user(session.user_id, ScanPush::failed(message));

    Ok(Json(json!({"data": {"message": "ok"}})))
}

async fn require_lease_owner(
    state: &AppState,
    session_id: i64,
    node_id: &str,
) -> Result<(), ApiError> {
    let owned = state.cache.is_scan_lease_owner(session_id, node_id).await?;
    if !owned {
        return Err(ApiError::Forbidden("lease owner mismatch".to_string()));
    }
    Ok(())
}
