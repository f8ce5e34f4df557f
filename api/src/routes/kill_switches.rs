use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use marshal_core::dashboard::{ClientStatus, KillSwitchCheck, KillSwitchOverview, SystemHealth};
use marshal_core::kill_switch::{ActionContext, ActivateInput, DeactivateInput, KillSwitchScope, KillSwitchState, Severity};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};

use crate::auth::Operator;
use crate::error::AppError;
use crate::extract::AppJson;
use crate::state::AppState;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

pub fn read_router() -> Router<AppState> {
    Router::new()
        .route("/v1/kill-switches/overview", get(overview))
        .route("/v1/kill-switches/health", get(system_health))
        .route("/v1/kill-switches/history", get(history))
        .route("/v1/kill-switches/client/{client_id}/status", get(client_status))
}

pub fn write_router() -> Router<AppState> {
    Router::new()
        .route("/v1/kill-switches/activate", post(activate))
        .route("/v1/kill-switches/deactivate", post(deactivate))
        .route("/v1/kill-switches/emergency-halt", post(emergency_halt))
}

pub fn check_router() -> Router<AppState> {
    Router::new().route("/v1/kill-switches/check", post(check))
}

fn default_severity() -> Severity {
    Severity::High
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ActivateRequest {
    pub scope: KillSwitchScope,
    /// Client id, platform or action type. Omitted for the global switch.
    #[serde(default)]
    pub target: Option<String>,
    pub reason: String,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default)]
    pub incident_id: Option<String>,
    /// Lifted automatically by the sweeper after this instant.
    #[serde(default)]
    pub scheduled_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DeactivateRequest {
    pub scope: KillSwitchScope,
    #[serde(default)]
    pub target: Option<String>,
    pub reason: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct EmergencyHaltRequest {
    pub reason: String,
    #[serde(default)]
    pub incident_id: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct HistoryQuery {
    /// global, client, platform or action
    pub scope: String,
    pub target: Option<String>,
    /// Newest first; default 50, at most 500.
    pub limit: Option<usize>,
}

/// GET /v1/kill-switches/overview: every active switch with per-scope counts
#[utoipa::path(
    get,
    path = "/v1/kill-switches/overview",
    responses(
        (status = 200, description = "Active switches", body = KillSwitchOverview),
        (status = 401, description = "Missing or invalid operator token", body = marshal_core::error::ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "kill-switches"
)]
pub async fn overview(_operator: Operator, State(state): State<AppState>) -> Json<KillSwitchOverview> {
    Json(state.dashboard.get_overview())
}

/// GET /v1/kill-switches/health: healthy, degraded or critical
#[utoipa::path(
    get,
    path = "/v1/kill-switches/health",
    responses(
        (status = 200, description = "Kill switch posture", body = SystemHealth),
    ),
    security(("bearer_auth" = [])),
    tag = "kill-switches"
)]
pub async fn system_health(_operator: Operator, State(state): State<AppState>) -> Json<SystemHealth> {
    Json(state.dashboard.get_system_health())
}

/// POST /v1/kill-switches/activate
#[utoipa::path(
    post,
    path = "/v1/kill-switches/activate",
    request_body = ActivateRequest,
    responses(
        (status = 200, description = "Switch active", body = KillSwitchState),
        (status = 400, description = "Invalid reason, target or schedule", body = marshal_core::error::ApiError),
        (status = 403, description = "Missing x-operator-id", body = marshal_core::error::ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "kill-switches"
)]
pub async fn activate(
    operator: Operator,
    State(state): State<AppState>,
    AppJson(req): AppJson<ActivateRequest>,
) -> Result<Json<KillSwitchState>, AppError> {
    let actor = operator.require_identity("POST /v1/kill-switches/activate")?;
    let input = ActivateInput {
        reason: req.reason,
        activated_by: actor.to_string(),
        severity: req.severity,
        incident_id: req.incident_id,
        scheduled_end: req.scheduled_end,
    };
    let switch = state
        .dashboard
        .quick_activate(req.scope, req.target.as_deref(), input)?;
    Ok(Json(switch))
}

/// POST /v1/kill-switches/deactivate
#[utoipa::path(
    post,
    path = "/v1/kill-switches/deactivate",
    request_body = DeactivateRequest,
    responses(
        (status = 200, description = "Switch lifted", body = KillSwitchState),
        (status = 409, description = "No active switch for that scope and target", body = marshal_core::error::ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "kill-switches"
)]
pub async fn deactivate(
    operator: Operator,
    State(state): State<AppState>,
    AppJson(req): AppJson<DeactivateRequest>,
) -> Result<Json<KillSwitchState>, AppError> {
    let actor = operator.require_identity("POST /v1/kill-switches/deactivate")?;
    let switch = state.dashboard.quick_deactivate(
        req.scope,
        req.target.as_deref(),
        DeactivateInput::new(req.reason, actor),
    )?;
    Ok(Json(switch))
}

/// GET /v1/kill-switches/history: activations for one scope and target, newest first
#[utoipa::path(
    get,
    path = "/v1/kill-switches/history",
    params(HistoryQuery),
    responses(
        (status = 200, description = "History entries", body = Vec<KillSwitchState>),
        (status = 400, description = "Unknown scope", body = marshal_core::error::ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "kill-switches"
)]
pub async fn history(
    _operator: Operator,
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<KillSwitchState>>, AppError> {
    let scope = KillSwitchScope::parse(&query.scope).ok_or_else(|| AppError::Validation {
        message: format!("Unknown kill switch scope '{}'", query.scope),
        field: Some("scope".to_string()),
        received: Some(serde_json::Value::String(query.scope.clone())),
        docs_hint: Some("Use one of: global, client, platform, action.".to_string()),
    })?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    Ok(Json(
        state
            .dashboard
            .get_history(scope, query.target.as_deref(), limit),
    ))
}

/// POST /v1/kill-switches/emergency-halt: global switch at critical severity
#[utoipa::path(
    post,
    path = "/v1/kill-switches/emergency-halt",
    request_body = EmergencyHaltRequest,
    responses(
        (status = 200, description = "Global switch active", body = KillSwitchState),
        (status = 403, description = "Missing x-operator-id", body = marshal_core::error::ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "kill-switches"
)]
pub async fn emergency_halt(
    operator: Operator,
    State(state): State<AppState>,
    AppJson(req): AppJson<EmergencyHaltRequest>,
) -> Result<Json<KillSwitchState>, AppError> {
    let actor = operator.require_identity("POST /v1/kill-switches/emergency-halt")?;
    let switch = state
        .dashboard
        .emergency_halt(actor, &req.reason, req.incident_id)?;
    tracing::warn!(operator_id = actor, "emergency halt engaged");
    Ok(Json(switch))
}

/// GET /v1/kill-switches/client/{client_id}/status
#[utoipa::path(
    get,
    path = "/v1/kill-switches/client/{client_id}/status",
    params(("client_id" = String, Path, description = "Client to inspect")),
    responses(
        (status = 200, description = "Whether the client is blocked and by which scope", body = ClientStatus),
    ),
    security(("bearer_auth" = [])),
    tag = "kill-switches"
)]
pub async fn client_status(
    _operator: Operator,
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Json<ClientStatus> {
    Json(state.dashboard.get_client_status(&client_id))
}

/// POST /v1/kill-switches/check: would an action in this context be blocked?
#[utoipa::path(
    post,
    path = "/v1/kill-switches/check",
    request_body = ActionContext,
    responses(
        (status = 200, description = "First blocking switch in precedence order, if any", body = KillSwitchCheck),
    ),
    security(("bearer_auth" = [])),
    tag = "kill-switches"
)]
pub async fn check(
    _operator: Operator,
    State(state): State<AppState>,
    AppJson(context): AppJson<ActionContext>,
) -> Json<KillSwitchCheck> {
    Json(state.dashboard.check_all_before_action(&context))
}
