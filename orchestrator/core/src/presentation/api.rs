// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP API
//!
//! Client ingress, discovery and node-to-node endpoints. Handlers translate
//! requests into application calls and errors into `{code, message}` bodies;
//! nothing here makes routing decisions.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::application::command_ingress::{
    CommandIngressGateway, DispatchReceipt, IngressError, InterAgentMessageCommand, RunLocation,
    ToolApprovalCommand, UserMessageCommand,
};
use crate::application::envelope_ingress::InboundEnvelopeHandler;
use crate::application::run_orchestrator::{OrchestratorError, RunOrchestrator};
use crate::domain::approval::ApprovalToken;
use crate::domain::dispatch::ErrorCode;
use crate::domain::envelope::{RemoteAck, SignedEnvelope};
use crate::domain::peer::{NodeId, PeerRecord};
use crate::domain::run::RunRecord;
use crate::infrastructure::discovery_registry::{AnnounceRequest, DiscoveryRegistry, RegistryError};
use crate::infrastructure::http_dispatcher::ENVELOPE_PATH;
use crate::infrastructure::peer_sync::{
    HeartbeatRequest, HeartbeatResponse, ANNOUNCE_PATH, HEARTBEAT_PATH, PEERS_PATH,
};

pub struct AppState {
    pub node_id: NodeId,
    pub ingress: Arc<CommandIngressGateway>,
    pub orchestrator: Arc<RunOrchestrator>,
    pub registry: Arc<DiscoveryRegistry>,
    pub inbound: Arc<InboundEnvelopeHandler>,
    pub started_at: Instant,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/teams/{team_id}/messages", post(user_message_handler))
        .route(
            "/api/teams/{team_id}/inter-agent-messages",
            post(inter_agent_message_handler),
        )
        .route(
            "/api/teams/{team_id}/approval-tokens",
            post(issue_approval_token_handler),
        )
        .route("/api/teams/{team_id}/approvals", post(tool_approval_handler))
        .route("/api/teams/{team_id}/stop", post(stop_team_handler))
        .route("/api/runs", get(list_runs_handler))
        .route(ANNOUNCE_PATH, post(announce_handler))
        .route(HEARTBEAT_PATH, post(heartbeat_handler))
        .route(PEERS_PATH, get(list_peers_handler))
        .route(ENVELOPE_PATH, post(envelope_handler))
        .with_state(state)
}

/// HTTP status for an error code.
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::TeamRunNotFound | ErrorCode::TeamDefinitionNotFound | ErrorCode::RunNotBound => {
            StatusCode::NOT_FOUND
        }
        ErrorCode::StaleApprovalToken
        | ErrorCode::ApprovalInvocationNotPending
        | ErrorCode::ApprovalTargetMismatch
        | ErrorCode::StaleRunVersion
        | ErrorCode::NodeIdConflict
        | ErrorCode::BaseUrlConflict
        | ErrorCode::RunAutoStopped => StatusCode::CONFLICT,
        ErrorCode::TargetMemberRequired
        | ErrorCode::InvalidRequest
        | ErrorCode::InvalidBaseUrl
        | ErrorCode::PlacementFailed => StatusCode::BAD_REQUEST,
        ErrorCode::EnvelopeRejected => StatusCode::FORBIDDEN,
        ErrorCode::DispatchFailed
        | ErrorCode::DispatchRejected
        | ErrorCode::StopDispatchFailed
        | ErrorCode::RunAutoStopFailed => StatusCode::BAD_GATEWAY,
    }
}

/// Error body returned by every endpoint.
pub struct ApiError(IngressError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (status_for(self.0.code), Json(self.0)).into_response()
    }
}

impl From<IngressError> for ApiError {
    fn from(err: IngressError) -> Self {
        Self(err)
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        Self(IngressError::new(err.code(), err.to_string()))
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(IngressError::new(err.code(), err.to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueApprovalTokenRequest {
    pub invocation_id: String,
    pub target_member_name: String,
    #[serde(default)]
    pub invocation_version: Option<u64>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "nodeId": state.node_id,
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn user_message_handler(
    State(state): State<Arc<AppState>>,
    Path(team_id): Path<String>,
    Json(command): Json<UserMessageCommand>,
) -> Result<(StatusCode, Json<DispatchReceipt>), ApiError> {
    let receipt = state.ingress.dispatch_user_message(&team_id, command).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn inter_agent_message_handler(
    State(state): State<Arc<AppState>>,
    Path(team_id): Path<String>,
    Json(command): Json<InterAgentMessageCommand>,
) -> Result<(StatusCode, Json<DispatchReceipt>), ApiError> {
    let receipt = state
        .ingress
        .dispatch_inter_agent_message(&team_id, command)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn issue_approval_token_handler(
    State(state): State<Arc<AppState>>,
    Path(team_id): Path<String>,
    Json(request): Json<IssueApprovalTokenRequest>,
) -> Result<(StatusCode, Json<ApprovalToken>), ApiError> {
    let token = state
        .ingress
        .issue_tool_approval_token(
            &team_id,
            &request.invocation_id,
            &request.target_member_name,
            request.invocation_version,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(token)))
}

async fn tool_approval_handler(
    State(state): State<Arc<AppState>>,
    Path(team_id): Path<String>,
    Json(command): Json<ToolApprovalCommand>,
) -> Result<(StatusCode, Json<DispatchReceipt>), ApiError> {
    let receipt = state.ingress.dispatch_tool_approval(&team_id, command).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn stop_team_handler(
    State(state): State<Arc<AppState>>,
    Path(team_id): Path<String>,
) -> Result<Json<RunLocation>, ApiError> {
    Ok(Json(state.ingress.stop_team(&team_id).await?))
}

async fn list_runs_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<RunRecord>>, ApiError> {
    Ok(Json(state.orchestrator.list_runs().await?))
}

async fn announce_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AnnounceRequest>,
) -> Result<Json<PeerRecord>, ApiError> {
    Ok(Json(state.registry.announce(request)?))
}

async fn heartbeat_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<HeartbeatRequest>,
) -> Json<HeartbeatResponse> {
    let known = state
        .registry
        .heartbeat(&request.node_id, request.last_seen_at);
    Json(HeartbeatResponse { known })
}

async fn list_peers_handler(State(state): State<Arc<AppState>>) -> Json<Vec<PeerRecord>> {
    Json(state.registry.peers())
}

async fn envelope_handler(
    State(state): State<Arc<AppState>>,
    Json(signed): Json<SignedEnvelope>,
) -> (StatusCode, Json<RemoteAck>) {
    let ack = state.inbound.handle(signed).await;
    let status = if ack.accepted {
        StatusCode::OK
    } else {
        status_for(ack.error_code.unwrap_or(ErrorCode::EnvelopeRejected))
    };
    (status, Json(ack))
}
