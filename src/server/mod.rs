//! HTTP surface: user scan API, agent job/scan APIs, the realtime channel,
//! and a small ops surface.

pub mod agent_jobs;
pub mod auth_layer;
pub mod scan_agent;
pub mod scan_user;
pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cache::CoordinationStore;
use crate::config::Config;
use crate::notify::Notifier;
use crate::scheduler::Generator;
use crate::server::ws::ScanHub;
use crate::store::Store;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub cache: Arc<dyn CoordinationStore>,
    pub hub: Arc<ScanHub>,
    pub generator: Arc<Generator>,
    pub notifier: Arc<Notifier>,
}

/// Build the full router.
pub fn router(state: AppState) -> Router {
    let user_scan = Router::new()
        .route("/api/user/scan", post(scan_user::create_scan))
        .route("/api/user/scan/status", get(scan_user::scan_status))
        .route("/api/user/scan/choice", post(scan_user::submit_choice))
        .route("/api/user/scan/cancel", post(scan_user::cancel_scan))
        .route("/api/user/scan/heartbeat", post(scan_user::scan_heartbeat))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_layer::require_user,
        ));

    let agent_api = Router::new()
        .route("/api/agent/jobs/poll", post(agent_jobs::poll_jobs))
        .route("/api/agent/jobs/{job_id}/start", post(agent_jobs::job_start))
        .route(
            "/api/agent/jobs/{job_id}/heartbeat",
            post(agent_jobs::job_heartbeat),
        )
        .route(
            "/api/agent/jobs/{job_id}/complete",
            post(agent_jobs::job_complete),
        )
        .route("/api/agent/jobs/{job_id}/fail", post(agent_jobs::job_fail))
        .route("/api/agent/scan/poll", post(scan_agent::poll_scans))
        .route("/api/agent/scan/{scan_id}/start", post(scan_agent::scan_start))
        .route(
            "/api/agent/scan/{scan_id}/phase",
            post(scan_agent::scan_phase_report),
        )
        .route("/api/agent/scan/{scan_id}/choice", get(scan_agent::scan_choice))
        .route(
            "/api/agent/scan/{scan_id}/heartbeat",
            post(scan_agent::scan_heartbeat),
        )
        .route(
            "/api/agent/scan/{scan_id}/complete",
            post(scan_agent::scan_complete),
        )
        .route("/api/agent/scan/{scan_id}/fail", post(scan_agent::scan_fail))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_layer::require_agent,
        ));

    Router::new()
        .merge(user_scan)
        .merge(agent_api)
        // The websocket upgrade authenticates via query token itself.
        .route("/api/user/scan/ws", get(ws::scan_ws_handler))
        .route("/healthz", get(healthz))
        .route("/api/ops/scheduler", get(scheduler_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the shutdown future resolves.
pub async fn serve(
    state: AppState,
    addr: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let db_ok = state.store.ping().await.is_ok();
    let cache_ok = state.cache.ping().await.is_ok();
    if db_ok && cache_ok {
        (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "degraded",
                "database": db_ok,
                "cache": cache_ok,
            })),
        )
    }
}

async fn scheduler_stats(State(state): State<AppState>) -> Json<crate::scheduler::GeneratorStats> {
    Json(state.generator.stats())
}
