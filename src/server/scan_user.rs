//! User-facing interactive scan endpoints: create, status, choice, cancel,
//! heartbeat.

use axum::Json;
use axum::extract::{Extension, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::auth::UserIdentity;
use crate::cache::CooldownState;
use crate::error::ApiError;
use crate::models::{ScanSession, ScanStatus, scan_phase};
use crate::server::AppState;
use crate::server::ws::ScanPush;

/// Stepped creation cooldown in seconds, indexed by prior attempt count and
/// capped at the last entry.
pub const COOLDOWN_STEPS: [i64; 5] = [0, 180, 600, 1800, 3600];

/// Seconds the user still has to wait before the next creation attempt.
pub fn cooldown_remaining(state: Option<CooldownState>, now: DateTime<Utc>) -> i64 {
    let Some(state) = state else {
        return 0;
    };
    if state.count <= 0 {
        return 0;
    }
    let index = (state.count as usize).min(COOLDOWN_STEPS.len() - 1);
    let required = COOLDOWN_STEPS[index];
    let elapsed = (now - state.last_at).num_seconds();
    (required - elapsed).max(0)
}

#[derive(Debug, Deserialize)]
pub struct CreateScanRequest {
    #[serde(default)]
    pub login_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScanIdRequest {
    pub scan_session_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ChoiceRequest {
    pub scan_session_id: i64,
    pub choice_type: String,
    pub value: String,
}

pub async fn create_scan(
    State(state): State<AppState>,
    Extension(user): Extension<UserIdentity>,
    Json(req): Json<CreateScanRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let now = Utc::now();

    let login_id = match req.login_id.filter(|id| !id.trim().is_empty()) {
        Some(login_id) => login_id,
        None => {
            let record = state
                .store
                .user_by_id(user.user_id)
                .await?
                .ok_or_else(|| ApiError::NotFound("user not found".to_string()))?;
            if record.login_id.is_empty() {
                return Err(ApiError::Validation(
                    "login id is not set; configure it in account settings first".to_string(),
                ));
            }
            record.login_id
        }
    };

    // Stepped cooldown, keyed by prior attempt count.
    let cooldown = state.cache.scan_cooldown(user.user_id).await?;
    let remaining = cooldown_remaining(cooldown, now);
    if remaining > 0 {
        return Err(ApiError::Cooldown {
            detail: format!("cooling down, retry after {remaining} seconds"),
            retry_after_secs: remaining,
        });
    }

    // One non-terminal session per user.
    let active = state.store.count_active_scans_for_user(user.user_id).await?;
    if active > 0 {
        return Err(ApiError::Conflict(
            "a scan session is already in progress".to_string(),
        ));
    }

    let session_id = state
        .store
        .create_scan_session(user.tenant_id, user.user_id, &login_id, now)
        .await?;

    let attempts = cooldown.map(|c| c.count).unwrap_or(0);
    if let Err(err) = state
        .cache
        .set_scan_cooldown(user.user_id, attempts + 1, now)
        .await
    {
        tracing::warn!(user_id = user.user_id, "cooldown update failed: {err}");
    }

    let position = state.store.scan_queue_position(session_id).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({"data": {
            "scan_session_id": session_id,
            "position_in_queue": position,
        }})),
    ))
}

pub async fn scan_status(
    State(state): State<AppState>,
    Extension(user): Extension<UserIdentity>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let now = Utc::now();
    let Some(session) = state.store.latest_active_scan_for_user(user.user_id).await? else {
        let cooldown = state.cache.scan_cooldown(user.user_id).await.unwrap_or(None);
        return Ok(Json(json!({"data": {
            "active": false,
            "cooldown_remaining_sec": cooldown_remaining(cooldown, now),
        }})));
    };

    let position = if session.status == ScanStatus::Pending {
        state.store.scan_queue_position(session.id).await?
    } else {
        0
    };

    Ok(Json(json!({"data": {
        "active": true,
        "scan_session_id": session.id,
        "status": session.status,
        "phase": session.phase,
        "login_id": session.login_id,
        "screenshots": session.screenshots,
        "position_in_queue": position,
        "error_message": session.error_message,
        "created_at": session.created_at,
    }})))
}

/// The choice type a phase accepts; a new phase invalidates older answers.
pub fn expected_choice(phase: &str) -> Option<&'static str> {
    match phase {
        scan_phase::CHOOSE_SYSTEM => Some("system"),
        scan_phase::CHOOSE_ZONE => Some("zone"),
        scan_phase::CHOOSE_ROLE => Some("role"),
        _ => None,
    }
}

pub async fn submit_choice(
    State(state): State<AppState>,
    Extension(user): Extension<UserIdentity>,
    Json(req): Json<ChoiceRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = load_owned_session(&state, req.scan_session_id, user.user_id).await?;

    match expected_choice(&session.phase) {
        Some(expected) if expected == req.choice_type => {}
        _ => {
            return Err(ApiError::Validation(format!(
                "phase {} does not accept a {} choice",
                session.phase, req.choice_type
            )));
        }
    }

    // Written to both stores: the ephemeral copy is what the agent polls.
    state
        .cache
        .set_scan_user_choice(session.id, &req.choice_type, &req.value)
        .await?;
    state
        .store
        .merge_scan_choice(session.id, &req.choice_type, &req.value, Utc::now())
        .await?;

    Ok(Json(json!({"data": {"message": "ok"}})))
}

pub async fn cancel_scan(
    State(state): State<AppState>,
    Extension(user): Extension<UserIdentity>,
    Json(req): Json<ScanIdRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let now = Utc::now();
    let session = load_owned_session(&state, req.scan_session_id, user.user_id).await?;

    if session.status.is_terminal() {
        return Err(ApiError::Validation("scan session already finished".to_string()));
    }

    state
        .store
        .cancel_scan(session.id, "cancelled by user", now)
        .await?;

    if let Some(node) = &session.leased_by_node {
        if let Err(err) = state.cache.release_scan_lease(session.id, node).await {
            tracing::warn!(session_id = session.id, "lease release on cancel: {err}");
        }
    }

    state
        .hub
        .notify_user(session.user_id, ScanPush::cancelled("cancelled by user"));

    Ok(Json(json!({"data": {"message": "ok"}})))
}

pub async fn scan_heartbeat(
    State(state): State<AppState>,
    Extension(user): Extension<UserIdentity>,
    Json(req): Json<ScanIdRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = load_owned_session(&state, req.scan_session_id, user.user_id).await?;

    if let Err(err) = state.cache.touch_scan_user_heartbeat(session.id).await {
        tracing::warn!(session_id = session.id, "presence heartbeat failed: {err}");
    }
    state
        .store
        .set_scan_user_heartbeat(session.id, Utc::now())
        .await?;

    Ok(Json(json!({"data": {"message": "ok"}})))
}

async fn load_owned_session(
    state: &AppState,
    session_id: i64,
    user_id: i64,
) -> Result<ScanSession, ApiError> {
    state
        .store
        .scan_for_user(session_id, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("scan session not found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(count: i64, seconds_ago: i64, now: DateTime<Utc>) -> Option<CooldownState> {
        Some(CooldownState {
            count,
            last_at: now - chrono::Duration::seconds(seconds_ago),
        })
    }

    #[test]
    fn cooldown_table_by_prior_attempt_count() {
        let now = Utc::now();
        // Immediately after the prior attempt, the required waits are the
        // table entries, capped at the last one.
        for (count, want) in [(0, 0), (1, 180), (2, 600), (3, 1800), (4, 3600), (5, 3600)] {
            assert_eq!(
                cooldown_remaining(state(count, 0, now), now),
                want,
                "count {count}"
            );
        }
    }

    #[test]
    fn cooldown_counts_down_with_elapsed_time() {
        let now = Utc::now();
        assert_eq!(cooldown_remaining(state(1, 60, now), now), 120);
        assert_eq!(cooldown_remaining(state(1, 180, now), now), 0);
        assert_eq!(cooldown_remaining(state(1, 500, now), now), 0);
    }

    #[test]
    fn no_cooldown_without_prior_attempts() {
        let now = Utc::now();
        assert_eq!(cooldown_remaining(None, now), 0);
        assert_eq!(cooldown_remaining(state(0, 0, now), now), 0);
    }

    #[test]
    fn choice_type_follows_phase() {
        assert_eq!(expected_choice(scan_phase::CHOOSE_SYSTEM), Some("system"));
        assert_eq!(expected_choice(scan_phase::CHOOSE_ZONE), Some("zone"));
        assert_eq!(expected_choice(scan_phase::CHOOSE_ROLE), Some("role"));
        assert_eq!(expected_choice(scan_phase::WAITING), None);
        assert_eq!(expected_choice(scan_phase::DONE), None);
    }
}
