//! Agent-facing standard-job protocol: poll/claim plus the per-job report
//! calls.
//!
//! Claims run ephemeral-acquire-before-durable-transition and compensate by
//! releasing the ephemeral lease whenever the durable step fails or loses
//! its race, bounding the window where a lease exists in only one store to a
//! single request.

use std::time::Duration;

use axum::Json;
use axum::extract::{Extension, Path, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::AgentIdentity;
use crate::error::ApiError;
use crate::models::TaskJob;
use crate::server::AppState;
use crate::store::{JobReport, JobReportError};
use crate::taskmeta;
use crate::taskmeta::next_time::{calc_next_time, format_next_time};

const POLL_RATE_LIMIT: i64 = 2;
const POLL_RATE_WINDOW: Duration = Duration::from_secs(1);
const DEFAULT_POLL_LIMIT: i64 = 5;

#[derive(Debug, Deserialize)]
pub struct PollJobsRequest {
    pub node_id: String,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub lease_seconds: i64,
}

#[derive(Debug, Serialize)]
pub struct PollJobsResponse {
    pub jobs: Vec<TaskJob>,
    pub lease_until: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct JobReportRequest {
    pub node_id: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub lease_seconds: i64,
}

fn require_node_id(node_id: &str) -> Result<(), ApiError> {
    if node_id.trim().is_empty() {
        return Err(ApiError::Validation("node_id is required".to_string()));
    }
    Ok(())
}

pub async fn poll_jobs(
    State(state): State<AppState>,
    Extension(agent): Extension<AgentIdentity>,
    Json(req): Json<PollJobsRequest>,
) -> Result<Json<PollJobsResponse>, ApiError> {
    require_node_id(&req.node_id)?;
    let now = Utc::now();

    // Fixed-window limit per tenant; a broken limiter must not block polls.
    let window_key = format!(
        "poll:tenant:{}:{}",
        agent.tenant_id,
        now.timestamp() / POLL_RATE_WINDOW.as_secs() as i64
    );
    match state
        .cache
        .check_rate_limit(&window_key, POLL_RATE_LIMIT, POLL_RATE_WINDOW)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            return Err(ApiError::RateLimited {
                window_secs: POLL_RATE_WINDOW.as_secs(),
            });
        }
        Err(err) => tracing::warn!("rate limit check failed, allowing poll: {err}"),
    }

    let limit = if req.limit <= 0 {
        DEFAULT_POLL_LIMIT
    } else {
        req.limit.min(state.config.max_poll_limit)
    };
    let lease_seconds = if req.lease_seconds <= 0 {
        state.config.default_lease_seconds
    } else {
        req.lease_seconds
    };
    let lease_ttl = Duration::from_secs(lease_seconds as u64);
    let lease_until = now + chrono::Duration::seconds(lease_seconds);

    if let Err(err) = state
        .store
        .upsert_agent_node(agent.tenant_id, &req.node_id, now)
        .await
    {
        tracing::warn!("agent node upsert failed: {err}");
    }

    // Phase 1: reconcile expired leases before claiming.
    let expired = state
        .store
        .reset_expired_job_leases(agent.tenant_id, now)
        .await?;
    for job_id in expired {
        if let Err(err) = state.cache.clear_job_lease(agent.tenant_id, job_id).await {
            tracing::warn!(job_id, "failed to clear expired job lease: {err}");
        }
    }

    // Phase 2: candidate rows, skipping ones a concurrent poller holds.
    let candidates = state
        .store
        .claim_candidates(agent.tenant_id, now, limit)
        .await?;

    // Phase 3/4: ephemeral acquire, then the conditional durable transition.
    let mut jobs = Vec::with_capacity(candidates.len());
    for mut job in candidates {
        let acquired = match state
            .cache
            .acquire_job_lease(agent.tenant_id, job.id, &req.node_id, lease_ttl)
            .await
        {
            Ok(acquired) => acquired,
            Err(err) => {
                tracing::warn!(job_id = job.id, "job lease acquire failed: {err}");
                continue;
            }
        };
        if !acquired {
            continue;
        }

        match state
            .store
            .mark_job_leased(job.id, &req.node_id, lease_until, now)
            .await
        {
            Ok(true) => {
                job.status = crate::models::JobStatus::Leased;
                job.leased_by_node = Some(req.node_id.clone());
                job.lease_until = Some(lease_until);
                jobs.push(job);
            }
            Ok(false) => {
                // Lost the durable race; roll the ephemeral acquisition back.
                release_best_effort(&state, agent.tenant_id, job.id, &req.node_id).await;
            }
            Err(err) => {
                release_best_effort(&state, agent.tenant_id, job.id, &req.node_id).await;
                return Err(err.into());
            }
        }
    }

    Ok(Json(PollJobsResponse { jobs, lease_until }))
}

async fn release_best_effort(state: &AppState, tenant_id: i64, job_id: i64, node_id: &str) {
    if let Err(err) = state.cache.release_job_lease(tenant_id, job_id, node_id).await {
        tracing::warn!(job_id, "job lease rollback failed: {err}");
    }
}

pub async fn job_start(
    state: State<AppState>,
    agent: Extension<AgentIdentity>,
    path: Path<i64>,
    req: Json<JobReportRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    report(state, agent, path, req, JobReport::Start).await
}

pub async fn job_heartbeat(
    state: State<AppState>,
    agent: Extension<AgentIdentity>,
    path: Path<i64>,
    req: Json<JobReportRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    report(state, agent, path, req, JobReport::Heartbeat).await
}

pub async fn job_complete(
    state: State<AppState>,
    agent: Extension<AgentIdentity>,
    path: Path<i64>,
    req: Json<JobReportRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    report(state, agent, path, req, JobReport::Complete).await
}

pub async fn job_fail(
    state: State<AppState>,
    agent: Extension<AgentIdentity>,
    path: Path<i64>,
    req: Json<JobReportRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    report(state, agent, path, req, JobReport::Fail).await
}

async fn report(
    State(state): State<AppState>,
    Extension(agent): Extension<AgentIdentity>,
    Path(job_id): Path<i64>,
    Json(req): Json<JobReportRequest>,
    kind: JobReport,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_node_id(&req.node_id)?;
    let now = Utc::now();
    let lease_seconds = if req.lease_seconds <= 0 {
        state.config.default_lease_seconds
    } else {
        req.lease_seconds
    };
    let lease_ttl = Duration::from_secs(lease_seconds as u64);
    let lease_until = now + chrono::Duration::seconds(lease_seconds);

    // Ephemeral ownership gate first; the durable row check below is an
    // independent second gate.
    let owned = state
        .cache
        .is_job_lease_owner(agent.tenant_id, job_id, &req.node_id)
        .await?;
    if !owned {
        return Err(ApiError::Forbidden("lease owner mismatch".to_string()));
    }

    let message = req.message.clone().unwrap_or_default();
    let error_code = req.error_code.clone().unwrap_or_default();
    state
        .store
        .apply_job_report(
            agent.tenant_id,
            job_id,
            &req.node_id,
            kind,
            &message,
            &error_code,
            lease_until,
            now,
        )
        .await
        .map_err(|err| match err {
            JobReportError::NotFound => ApiError::NotFound("job not found".to_string()),
            JobReportError::NotOwner => {
                ApiError::Forbidden("node does not own this job".to_string())
            }
            JobReportError::Database(db) => db.into(),
        })?;

    if kind.extends_lease() {
        let renewed = state
            .cache
            .renew_job_lease(agent.tenant_id, job_id, &req.node_id, lease_ttl)
            .await?;
        if !renewed {
            return Err(ApiError::Conflict("lease renewal conflict".to_string()));
        }
    }

    if kind.is_terminal() {
        if let Err(err) = state
            .cache
            .release_job_lease(agent.tenant_id, job_id, &req.node_id)
            .await
        {
            tracing::warn!(job_id, "lease release after report failed: {err}");
        }

        // Reschedule and notify off the request path.
        let state = state.clone();
        tokio::spawn(async move {
            finish_job(state, job_id, kind, message, now).await;
        });
    }

    Ok(Json(serde_json::json!({"message": "ok"})))
}

/// After a terminal report: rewrite the task's `next_time` per its rule and
/// fire the failure notification when configured. All best-effort.
async fn finish_job(
    state: AppState,
    job_id: i64,
    kind: JobReport,
    message: String,
    now: DateTime<Utc>,
) {
    let job = match state.store.job_by_id(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return,
        Err(err) => {
            tracing::warn!(job_id, "post-report job load failed: {err}");
            return;
        }
    };

    let next_time = match kind {
        JobReport::Complete => {
            let rule = taskmeta::next_time_rule(&job.task_type);
            if rule.is_empty() || rule == "on_demand" {
                None
            } else {
                calc_next_time(rule, now)
            }
        }
        JobReport::Fail => {
            let delay = fail_delay_minutes(&state, &job).await;
            Some(now + chrono::Duration::minutes(delay))
        }
        _ => None,
    };

    if let Some(next) = next_time {
        if let Err(err) = state
            .store
            .update_task_next_time(job.user_id, &job.task_type, &format_next_time(next), now)
            .await
        {
            tracing::warn!(job_id, "next_time rewrite failed: {err}");
        }
    }

    if kind == JobReport::Fail {
        match state.store.user_by_id(job.user_id).await {
            Ok(Some(user)) => {
                state
                    .notifier
                    .notify_job_failure(&user, &job.task_type, &message)
                    .await;
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(job_id, "notification user load failed: {err}"),
        }
    }
}

async fn fail_delay_minutes(state: &AppState, job: &TaskJob) -> i64 {
    let delay = match state.store.task_config_for_user(job.user_id).await {
        Ok(Some(doc)) => doc
            .config
            .get(&job.task_type)
            .and_then(|t| t.as_object())
            .map(|t| crate::scheduler::due::to_i64(t.get("fail_delay"), 30))
            .unwrap_or(30),
        _ => 30,
    };
    if delay > 0 { delay } else { 30 }
}
