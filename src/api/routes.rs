//! REST surface for the fleet.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::api::stream::websocket_handler;
use crate::fleet::aggregator::StateAggregator;
use crate::fleet::orchestrator::Orchestrator;
use crate::fleet::publisher::StreamPublisher;
use crate::models::{AgentStatusEntry, Opportunity, PnlRecord};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub aggregator: Arc<StateAggregator>,
    pub publisher: Arc<StreamPublisher>,
}

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/status", get(get_status))
        .route("/api/opportunities", get(get_opportunities))
        .route("/api/execute/:id", post(post_execute))
        .route("/api/kill", post(post_kill))
        .route("/api/resume", post(post_resume))
        .route("/api/accounts/:id/start", post(post_account_start))
        .route("/api/accounts/:id/stop", post(post_account_stop))
        .route("/api/accounts/:id/reset", post(post_account_reset))
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

// ===== Route Handlers =====

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Fleet status: portfolio PnL, position count and per-agent state.
async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.aggregator.capture();
    let agents = snapshot
        .accounts
        .iter()
        .map(|a| {
            (
                a.account_id.clone(),
                AgentStatusEntry {
                    status: a.status,
                    opportunity_count: a.opportunity_count,
                },
            )
        })
        .collect();

    Json(StatusResponse {
        pnl: snapshot.portfolio_pnl,
        position_count: snapshot.position_count,
        agents,
        kill_engaged: snapshot.kill_engaged,
        timestamp: snapshot.taken_at,
    })
}

/// Current open opportunity list, untruncated.
async fn get_opportunities(State(state): State<AppState>) -> Json<OpportunitiesResponse> {
    let snapshot = state.aggregator.capture();
    Json(OpportunitiesResponse {
        count: snapshot.open_opportunities.len(),
        opportunities: snapshot.open_opportunities.clone(),
    })
}

/// Route a manual execute to the owning account's agent.
async fn post_execute(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    let outcome = state.orchestrator.execute_opportunity(&id).await;
    if !outcome.success {
        if outcome.reason == "unknown opportunity" {
            return Err(ApiError::NotFound(format!("opportunity {id} not found")));
        }
        if outcome.reason == "opportunity expired" {
            return Err(ApiError::Gone(format!("opportunity {id} expired")));
        }
    }
    Ok(Json(ActionResponse {
        success: outcome.success,
        reason: outcome.reason,
    }))
}

/// Fleet-wide emergency stop. Always succeeds; idempotent.
async fn post_kill(State(state): State<AppState>) -> Json<ActionResponse> {
    let outcome = state.orchestrator.kill_switch().await;
    Json(ActionResponse {
        success: outcome.success,
        reason: outcome.reason,
    })
}

async fn post_resume(State(state): State<AppState>) -> Json<ActionResponse> {
    let outcome = state.orchestrator.resume_all().await;
    Json(ActionResponse {
        success: outcome.success,
        reason: outcome.reason,
    })
}

async fn post_account_start(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<ActionResponse> {
    let outcome = state.orchestrator.start(&id).await;
    Json(ActionResponse {
        success: outcome.success,
        reason: outcome.reason,
    })
}

async fn post_account_stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<ActionResponse> {
    let outcome = state.orchestrator.stop(&id).await;
    Json(ActionResponse {
        success: outcome.success,
        reason: outcome.reason,
    })
}

async fn post_account_reset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<ActionResponse> {
    let outcome = state.orchestrator.reset(&id).await;
    Json(ActionResponse {
        success: outcome.success,
        reason: outcome.reason,
    })
}

// ===== Request/Response Types =====

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct StatusResponse {
    pnl: PnlRecord,
    position_count: usize,
    agents: BTreeMap<String, AgentStatusEntry>,
    kill_engaged: bool,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct OpportunitiesResponse {
    count: usize,
    opportunities: Vec<Opportunity>,
}

#[derive(Serialize)]
struct ActionResponse {
    success: bool,
    reason: String,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    Gone(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Gone(msg) => (StatusCode::GONE, msg),
        };
        let body = Json(json!({ "error": message }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_status_codes() {
        let resp = ApiError::NotFound("missing".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = ApiError::Gone("expired".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::GONE);
    }
}
