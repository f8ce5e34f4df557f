use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use marshal_core::auth::normalize_reason;
use marshal_core::budget::BudgetDimension;
use marshal_core::episode::{EpisodeCheckpoint, EpisodeSpec, FailureDetail, SuspendReason};
use marshal_core::error::reason;
use marshal_core::policy::StepUp;
use marshal_runtime::EpisodeSnapshot;
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::Operator;
use crate::error::AppError;
use crate::extract::AppJson;
use crate::state::AppState;

pub fn read_router() -> Router<AppState> {
    Router::new()
        .route("/v1/episodes", get(list_episodes))
        .route("/v1/episodes/{episode_id}", get(get_episode))
        .route("/v1/episodes/{episode_id}/checkpoints", get(list_checkpoints))
}

pub fn write_router() -> Router<AppState> {
    Router::new()
        .route("/v1/episodes", post(start_episode))
        .route("/v1/episodes/{episode_id}/children", post(spawn_child))
        .route("/v1/episodes/{episode_id}/suspend", post(suspend_episode))
        .route("/v1/episodes/{episode_id}/resume", post(resume_episode))
        .route("/v1/episodes/{episode_id}/budget", post(raise_budget))
        .route("/v1/episodes/{episode_id}/fail", post(fail_episode))
        .route("/v1/episodes/{episode_id}/cancel", post(cancel_episode))
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct SuspendRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ResumeRequest {
    /// Restore this checkpoint instead of the latest one.
    #[serde(default)]
    pub checkpoint_id: Option<Uuid>,
    /// Step-up the operator grants for a held high-risk action.
    #[serde(default)]
    pub grant_step_up: StepUp,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RaiseBudgetRequest {
    pub dimension: BudgetDimension,
    /// New limit; 0 removes the limit.
    pub limit: u64,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct FailRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

fn required(value: &str, field: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::Validation {
            message: format!("{field} must not be empty"),
            field: Some(field.to_string()),
            received: Some(serde_json::Value::String(value.to_string())),
            docs_hint: None,
        });
    }
    Ok(())
}

fn validate_spec(spec: &EpisodeSpec) -> Result<(), AppError> {
    required(&spec.agent_type, "agent_type")?;
    required(&spec.task_type, "task_type")?;
    required(&spec.client_id, "client_id")?;
    required(&spec.subject.id, "subject.id")?;
    if spec.parent_episode_id.is_some() {
        return Err(AppError::Validation {
            message: "parent_episode_id cannot be set on a root episode".to_string(),
            field: Some("parent_episode_id".to_string()),
            received: None,
            docs_hint: Some("Start sub-episodes with POST /v1/episodes/{id}/children.".to_string()),
        });
    }
    Ok(())
}

/// POST /v1/episodes: start an episode
#[utoipa::path(
    post,
    path = "/v1/episodes",
    request_body = EpisodeSpec,
    responses(
        (status = 201, description = "Episode started", body = EpisodeSnapshot),
        (status = 400, description = "Invalid spec or unknown agent type", body = marshal_core::error::ApiError),
        (status = 403, description = "Global kill switch active or missing x-operator-id", body = marshal_core::error::ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "episodes"
)]
pub async fn start_episode(
    operator: Operator,
    State(state): State<AppState>,
    AppJson(spec): AppJson<EpisodeSpec>,
) -> Result<(StatusCode, Json<EpisodeSnapshot>), AppError> {
    let operator_id = operator.require_identity("POST /v1/episodes")?;
    validate_spec(&spec)?;
    let snapshot = state.supervisor.start_episode(spec)?;
    tracing::info!(
        episode_id = %snapshot.episode_id,
        client_id = %snapshot.client_id,
        agent_type = %snapshot.agent_type,
        operator_id = operator_id,
        "episode started"
    );
    Ok((StatusCode::CREATED, Json(snapshot)))
}

/// POST /v1/episodes/{episode_id}/children: start a sub-episode charged to the parent's subcalls
#[utoipa::path(
    post,
    path = "/v1/episodes/{episode_id}/children",
    params(("episode_id" = Uuid, Path, description = "Parent episode")),
    request_body = EpisodeSpec,
    responses(
        (status = 201, description = "Child started", body = EpisodeSnapshot),
        (status = 409, description = "Parent finished or subcall budget exhausted", body = marshal_core::error::ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "episodes"
)]
pub async fn spawn_child(
    operator: Operator,
    State(state): State<AppState>,
    Path(parent_id): Path<Uuid>,
    AppJson(mut spec): AppJson<EpisodeSpec>,
) -> Result<(StatusCode, Json<EpisodeSnapshot>), AppError> {
    operator.require_identity("POST /v1/episodes/{id}/children")?;
    spec.parent_episode_id = None;
    validate_spec(&spec)?;
    let snapshot = state.supervisor.spawn_child(parent_id, spec)?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

/// GET /v1/episodes: every episode known to this process
#[utoipa::path(
    get,
    path = "/v1/episodes",
    responses((status = 200, description = "Episode snapshots", body = Vec<EpisodeSnapshot>)),
    security(("bearer_auth" = [])),
    tag = "episodes"
)]
pub async fn list_episodes(_operator: Operator, State(state): State<AppState>) -> Json<Vec<EpisodeSnapshot>> {
    Json(state.supervisor.list())
}

/// GET /v1/episodes/{episode_id}
#[utoipa::path(
    get,
    path = "/v1/episodes/{episode_id}",
    params(("episode_id" = Uuid, Path, description = "Episode")),
    responses(
        (status = 200, description = "Current snapshot", body = EpisodeSnapshot),
        (status = 404, description = "Not running in this process", body = marshal_core::error::ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "episodes"
)]
pub async fn get_episode(
    _operator: Operator,
    State(state): State<AppState>,
    Path(episode_id): Path<Uuid>,
) -> Result<Json<EpisodeSnapshot>, AppError> {
    Ok(Json(state.supervisor.snapshot(episode_id)?))
}

/// GET /v1/episodes/{episode_id}/checkpoints: durable checkpoints, oldest first
#[utoipa::path(
    get,
    path = "/v1/episodes/{episode_id}/checkpoints",
    params(("episode_id" = Uuid, Path, description = "Episode")),
    responses(
        (status = 200, description = "Checkpoints", body = Vec<EpisodeCheckpoint>),
        (status = 404, description = "Episode not in the checkpoint store", body = marshal_core::error::ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "episodes"
)]
pub async fn list_checkpoints(
    _operator: Operator,
    State(state): State<AppState>,
    Path(episode_id): Path<Uuid>,
) -> Result<Json<Vec<EpisodeCheckpoint>>, AppError> {
    let episode = state.supervisor.store().load_episode(episode_id).await?;
    Ok(Json(episode.checkpoints))
}

/// POST /v1/episodes/{episode_id}/suspend
#[utoipa::path(
    post,
    path = "/v1/episodes/{episode_id}/suspend",
    params(("episode_id" = Uuid, Path, description = "Episode")),
    request_body = SuspendRequest,
    responses(
        (status = 200, description = "Suspended with a checkpoint", body = EpisodeSnapshot),
        (status = 409, description = "Not suspendable in its current state", body = marshal_core::error::ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "episodes"
)]
pub async fn suspend_episode(
    operator: Operator,
    State(state): State<AppState>,
    Path(episode_id): Path<Uuid>,
    AppJson(req): AppJson<SuspendRequest>,
) -> Result<Json<EpisodeSnapshot>, AppError> {
    let operator_id = operator.require_identity("POST /v1/episodes/{id}/suspend")?;
    let message = normalize_reason(req.reason.as_deref(), "suspended by operator");
    let snapshot = state
        .supervisor
        .suspend(
            episode_id,
            SuspendReason::new(reason::OPERATOR_REQUESTED, format!("{message} ({operator_id})")),
        )
        .await?;
    Ok(Json(snapshot))
}

/// POST /v1/episodes/{episode_id}/resume
#[utoipa::path(
    post,
    path = "/v1/episodes/{episode_id}/resume",
    params(("episode_id" = Uuid, Path, description = "Episode")),
    request_body = ResumeRequest,
    responses(
        (status = 200, description = "Running again", body = EpisodeSnapshot),
        (status = 409, description = "Budget still exhausted or not suspended", body = marshal_core::error::ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "episodes"
)]
pub async fn resume_episode(
    operator: Operator,
    State(state): State<AppState>,
    Path(episode_id): Path<Uuid>,
    AppJson(req): AppJson<ResumeRequest>,
) -> Result<Json<EpisodeSnapshot>, AppError> {
    let operator_id = operator.require_identity("POST /v1/episodes/{id}/resume")?;
    if req.grant_step_up != StepUp::None {
        tracing::warn!(
            episode_id = %episode_id,
            operator_id = operator_id,
            step_up = req.grant_step_up.as_str(),
            "operator granted step-up"
        );
    }
    let snapshot = state
        .supervisor
        .resume(episode_id, req.checkpoint_id, req.grant_step_up)
        .await?;
    Ok(Json(snapshot))
}

/// POST /v1/episodes/{episode_id}/budget: change one limit
#[utoipa::path(
    post,
    path = "/v1/episodes/{episode_id}/budget",
    params(("episode_id" = Uuid, Path, description = "Episode")),
    request_body = RaiseBudgetRequest,
    responses(
        (status = 200, description = "Limit updated", body = EpisodeSnapshot),
        (status = 400, description = "Limit below current usage", body = marshal_core::error::ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "episodes"
)]
pub async fn raise_budget(
    operator: Operator,
    State(state): State<AppState>,
    Path(episode_id): Path<Uuid>,
    AppJson(req): AppJson<RaiseBudgetRequest>,
) -> Result<Json<EpisodeSnapshot>, AppError> {
    let operator_id = operator.require_identity("POST /v1/episodes/{id}/budget")?;
    let snapshot = state
        .supervisor
        .raise_budget(episode_id, req.dimension, req.limit)
        .await?;
    tracing::info!(
        episode_id = %episode_id,
        operator_id = operator_id,
        dimension = req.dimension.as_str(),
        limit = req.limit,
        "budget limit changed"
    );
    Ok(Json(snapshot))
}

/// POST /v1/episodes/{episode_id}/fail: terminal, never resumable
#[utoipa::path(
    post,
    path = "/v1/episodes/{episode_id}/fail",
    params(("episode_id" = Uuid, Path, description = "Episode")),
    request_body = FailRequest,
    responses(
        (status = 200, description = "Failed", body = EpisodeSnapshot),
        (status = 409, description = "Already finished", body = marshal_core::error::ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "episodes"
)]
pub async fn fail_episode(
    operator: Operator,
    State(state): State<AppState>,
    Path(episode_id): Path<Uuid>,
    AppJson(req): AppJson<FailRequest>,
) -> Result<Json<EpisodeSnapshot>, AppError> {
    let operator_id = operator.require_identity("POST /v1/episodes/{id}/fail")?;
    let message = normalize_reason(req.reason.as_deref(), "failed by operator");
    let detail = FailureDetail::new(reason::OPERATOR_REQUESTED, message)
        .with_details(serde_json::json!({ "operator_id": operator_id }));
    Ok(Json(state.supervisor.fail(episode_id, detail).await?))
}

/// POST /v1/episodes/{episode_id}/cancel: stop after any in-flight tool call returns
#[utoipa::path(
    post,
    path = "/v1/episodes/{episode_id}/cancel",
    params(("episode_id" = Uuid, Path, description = "Episode")),
    responses(
        (status = 202, description = "Cancellation requested; poll the episode for the final state", body = EpisodeSnapshot),
        (status = 404, description = "Not running in this process", body = marshal_core::error::ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "episodes"
)]
pub async fn cancel_episode(
    operator: Operator,
    State(state): State<AppState>,
    Path(episode_id): Path<Uuid>,
) -> Result<(StatusCode, Json<EpisodeSnapshot>), AppError> {
    let operator_id = operator.require_identity("POST /v1/episodes/{id}/cancel")?;
    state.supervisor.cancel(episode_id)?;
    tracing::info!(episode_id = %episode_id, operator_id = operator_id, "episode cancellation requested");
    Ok((StatusCode::ACCEPTED, Json(state.supervisor.snapshot(episode_id)?)))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use marshal_core::episode::RunnerState;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::auth::OPERATOR_ID_HEADER;
    use crate::state::test_support::{TestApp, test_app};

    fn app(test: &TestApp) -> Router {
        read_router()
            .merge(write_router())
            .with_state(test.state.clone())
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(OPERATOR_ID_HEADER, "alice");
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn spec(client_id: &str, input: Value) -> Value {
        json!({
            "agent_type": "scripted",
            "task_type": "refund",
            "client_id": client_id,
            "subject": {
                "id": "agent-billing",
                "tenant_id": client_id,
                "grants": [{"role": "operator", "permissions": ["tool:*"]}]
            },
            "input": input
        })
    }

    async fn settle(test: &TestApp, id: Uuid) -> EpisodeSnapshot {
        tokio::time::timeout(
            Duration::from_secs(5),
            test.state
                .supervisor
                .wait_until(id, |s| s.is_terminal() || s.state == RunnerState::Suspended),
        )
        .await
        .expect("episode did not settle in time")
        .unwrap()
    }

    fn episode_id(body: &Value) -> Uuid {
        body["episode_id"].as_str().and_then(|s| s.parse().ok()).unwrap()
    }

    #[tokio::test]
    async fn empty_script_runs_to_completion() {
        let test = test_app(false);
        let app = app(&test);
        let (status, body) = call(&app, "POST", "/v1/episodes", Some(spec("client_1", Value::Null))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = episode_id(&body);

        assert_eq!(settle(&test, id).await.state, RunnerState::Completed);
        let (status, body) = call(&app, "GET", &format!("/v1/episodes/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "completed");

        let (status, _) = call(&app, "POST", &format!("/v1/episodes/{id}/suspend"), Some(json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn held_refund_resumes_with_operator_approval() {
        let test = test_app(false);
        let app = app(&test);
        let input = json!({"steps": [{
            "action": {"tool_id": "payment.refund", "idempotency_key": "refund-7", "input": {"amount": 40}}
        }]});
        let (_, body) = call(&app, "POST", "/v1/episodes", Some(spec("client_1", input))).await;
        let id = episode_id(&body);

        let parked = settle(&test, id).await;
        assert_eq!(parked.state, RunnerState::Suspended);
        assert_eq!(parked.suspended_for.map(|r| r.code).as_deref(), Some("STEP_UP_REQUIRED"));
        assert_eq!(test.gateway.invocation_count(), 0);

        let (_, checkpoints) = call(&app, "GET", &format!("/v1/episodes/{id}/checkpoints"), None).await;
        assert_eq!(checkpoints.as_array().map(Vec::len), Some(1));

        let (status, _) = call(
            &app,
            "POST",
            &format!("/v1/episodes/{id}/resume"),
            Some(json!({"grant_step_up": "approval"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(settle(&test, id).await.state, RunnerState::Completed);
        assert_eq!(test.gateway.invocation_count(), 1);
    }

    #[tokio::test]
    async fn operator_fail_is_terminal() {
        let test = test_app(false);
        let app = app(&test);
        let input = json!({"steps": [{"action": {"tool_id": "payment.refund", "idempotency_key": "refund-8"}}]});
        let (_, body) = call(&app, "POST", "/v1/episodes", Some(spec("client_1", input))).await;
        let id = episode_id(&body);
        settle(&test, id).await;

        let (status, body) = call(
            &app,
            "POST",
            &format!("/v1/episodes/{id}/fail"),
            Some(json!({"reason": "customer withdrew the request"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "failed");
        assert_eq!(body["failure"]["code"], "OPERATOR_REQUESTED");

        let (status, body) = call(&app, "POST", &format!("/v1/episodes/{id}/resume"), Some(json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "illegal_transition");
    }

    #[tokio::test]
    async fn rejects_invalid_specs_at_the_boundary() {
        let test = test_app(false);
        let app = app(&test);

        let mut unknown = spec("client_1", Value::Null);
        unknown["agent_type"] = json!("poet");
        let (status, body) = call(&app, "POST", "/v1/episodes", Some(unknown)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "agent_type");

        let (status, body) = call(&app, "POST", "/v1/episodes", Some(spec("  ", Value::Null))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "client_id");

        let (status, body) = call(&app, "POST", "/v1/episodes", Some(json!({"agent_type": "scripted"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_failed");

        let (status, _) = call(&app, "GET", &format!("/v1/episodes/{}", Uuid::now_v7()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn lowering_a_limit_below_usage_is_rejected() {
        let test = test_app(false);
        let app = app(&test);
        let input = json!({"steps": [{"tokens": 50, "action": {"tool_id": "payment.refund", "idempotency_key": "refund-9"}}]});
        let (_, body) = call(&app, "POST", "/v1/episodes", Some(spec("client_1", input))).await;
        let id = episode_id(&body);
        let parked = settle(&test, id).await;
        assert_eq!(parked.budget.tokens.used, 50);

        let (status, body) = call(
            &app,
            "POST",
            &format!("/v1/episodes/{id}/budget"),
            Some(json!({"dimension": "tokens", "limit": 10})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "limit");

        let (status, body) = call(
            &app,
            "POST",
            &format!("/v1/episodes/{id}/budget"),
            Some(json!({"dimension": "tokens", "limit": 500})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["budget"]["tokens"]["limit"], 500);
    }
}
