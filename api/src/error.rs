use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use marshal_core::budget::BudgetError;
use marshal_core::checkpoint::CheckpointError;
use marshal_core::error::{self, ApiError, reason};
use marshal_core::kill_switch::{KillSwitchError, MIN_REASON_LEN};
use marshal_core::runner::RunnerError;
use marshal_runtime::RuntimeError;

/// Internal error type that converts to structured API responses
#[derive(Debug)]
pub enum AppError {
    /// Validation error (400)
    Validation {
        message: String,
        field: Option<String>,
        received: Option<serde_json::Value>,
        docs_hint: Option<String>,
    },
    /// Missing or wrong operator token (401)
    Unauthorized {
        message: String,
        docs_hint: Option<String>,
    },
    /// Authenticated but not allowed (403)
    Forbidden {
        message: String,
        docs_hint: Option<String>,
    },
    /// Unknown episode, checkpoint or switch (404)
    NotFound { resource: String },
    /// Request conflicts with the current episode or switch state (409)
    Conflict {
        error: &'static str,
        error_code: Option<String>,
        message: String,
        docs_hint: Option<String>,
    },
    /// The supervisor no longer accepts work (503)
    Unavailable { message: String },
    /// Database error (500)
    Database(sqlx::Error),
    /// Internal error (500)
    Internal(String),
}

fn body(error: &str, message: String) -> ApiError {
    ApiError {
        error: error.to_string(),
        error_code: None,
        message,
        field: None,
        received: None,
        request_id: uuid::Uuid::now_v7().to_string(),
        docs_hint: None,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, api_error) = match self {
            AppError::Validation {
                message,
                field,
                received,
                docs_hint,
            } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    field,
                    received,
                    docs_hint,
                    ..body(error::codes::VALIDATION_FAILED, message)
                },
            ),
            AppError::Unauthorized { message, docs_hint } => (
                StatusCode::UNAUTHORIZED,
                ApiError {
                    docs_hint,
                    ..body(error::codes::UNAUTHORIZED, message)
                },
            ),
            AppError::Forbidden { message, docs_hint } => (
                StatusCode::FORBIDDEN,
                ApiError {
                    docs_hint,
                    ..body(error::codes::FORBIDDEN, message)
                },
            ),
            AppError::NotFound { resource } => (
                StatusCode::NOT_FOUND,
                body(error::codes::NOT_FOUND, format!("{resource} not found")),
            ),
            AppError::Conflict {
                error,
                error_code,
                message,
                docs_hint,
            } => (
                StatusCode::CONFLICT,
                ApiError {
                    error_code,
                    docs_hint,
                    ..body(error, message)
                },
            ),
            AppError::Unavailable { message } => (
                StatusCode::SERVICE_UNAVAILABLE,
                ApiError {
                    docs_hint: Some("The server is draining; retry against the restarted instance.".to_string()),
                    ..body(error::codes::INTERNAL_ERROR, message)
                },
            ),
            AppError::Database(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    body(error::codes::INTERNAL_ERROR, "An internal error occurred".to_string()),
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    body(error::codes::INTERNAL_ERROR, "An internal error occurred".to_string()),
                )
            }
        };

        (status, Json(api_error)).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err)
    }
}

impl From<KillSwitchError> for AppError {
    fn from(err: KillSwitchError) -> Self {
        let message = err.to_string();
        let (field, docs_hint) = match &err {
            KillSwitchError::ReasonTooShort => (
                "reason",
                format!("Give a reason of at least {MIN_REASON_LEN} characters; it is shown to every operator."),
            ),
            KillSwitchError::MissingActor => (
                "x-operator-id",
                "Send the acting operator in the 'x-operator-id' header.".to_string(),
            ),
            KillSwitchError::MissingTarget { .. } | KillSwitchError::UnexpectedTarget => (
                "target",
                "Client, platform and action switches need a target; the global switch takes none.".to_string(),
            ),
            KillSwitchError::ScheduledEndInPast => (
                "scheduled_end",
                "Use a future RFC 3339 timestamp, or omit it for a manual deactivation.".to_string(),
            ),
            KillSwitchError::NotActive { .. } => {
                return AppError::Conflict {
                    error: error::codes::CONFLICT,
                    error_code: None,
                    message,
                    docs_hint: Some("GET /v1/kill-switches/overview lists the active switches.".to_string()),
                };
            }
        };
        AppError::Validation {
            message,
            field: Some(field.to_string()),
            received: None,
            docs_hint: Some(docs_hint),
        }
    }
}

impl From<BudgetError> for AppError {
    fn from(err: BudgetError) -> Self {
        match err {
            BudgetError::LimitBelowUsage { dimension, used, .. } => AppError::Validation {
                message: err.to_string(),
                field: Some("limit".to_string()),
                received: None,
                docs_hint: Some(format!(
                    "The {dimension} limit must be 0 (unlimited) or at least the current usage of {used}."
                )),
            },
            BudgetError::Exhausted { .. } => AppError::Conflict {
                error: error::codes::CONFLICT,
                error_code: Some(reason::BUDGET_EXCEEDED.to_string()),
                message: err.to_string(),
                docs_hint: Some("Raise the limit with POST /v1/episodes/{id}/budget.".to_string()),
            },
        }
    }
}

impl From<RunnerError> for AppError {
    fn from(err: RunnerError) -> Self {
        let message = err.to_string();
        match err {
            RunnerError::Budget(budget) => budget.into(),
            RunnerError::CheckpointNotFound(id) => AppError::NotFound {
                resource: format!("Checkpoint {id}"),
            },
            RunnerError::BudgetStillExceeded { dimension, .. } => AppError::Conflict {
                error: error::codes::BUDGET_STILL_EXCEEDED,
                error_code: Some(reason::BUDGET_EXCEEDED.to_string()),
                message,
                docs_hint: Some(format!(
                    "Raise the {dimension} limit with POST /v1/episodes/{{id}}/budget, then resume."
                )),
            },
            RunnerError::IllegalTransition { .. } | RunnerError::Finished(_) | RunnerError::NoCheckpoint => {
                AppError::Conflict {
                    error: error::codes::ILLEGAL_TRANSITION,
                    error_code: None,
                    message,
                    docs_hint: Some("GET /v1/episodes/{id} shows the current state.".to_string()),
                }
            }
            _ => AppError::Conflict {
                error: error::codes::CONFLICT,
                error_code: None,
                message,
                docs_hint: None,
            },
        }
    }
}

impl From<CheckpointError> for AppError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::EpisodeNotFound(id) => AppError::NotFound {
                resource: format!("Episode {id}"),
            },
            CheckpointError::CheckpointNotFound { checkpoint_id, .. } => AppError::NotFound {
                resource: format!("Checkpoint {checkpoint_id}"),
            },
            CheckpointError::NoCheckpoint(id) => AppError::NotFound {
                resource: format!("Checkpoint for episode {id}"),
            },
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<RuntimeError> for AppError {
    fn from(err: RuntimeError) -> Self {
        let message = err.to_string();
        match err {
            RuntimeError::UnknownEpisode(id) => AppError::NotFound {
                resource: format!("Episode {id}"),
            },
            RuntimeError::UnknownAgent(agent_type) => AppError::Validation {
                message,
                field: Some("agent_type".to_string()),
                received: Some(serde_json::Value::String(agent_type)),
                docs_hint: Some("GET /health lists the agent types this server runs.".to_string()),
            },
            RuntimeError::NotAllowed { .. } | RuntimeError::EpisodeGone(_) => AppError::Conflict {
                error: error::codes::ILLEGAL_TRANSITION,
                error_code: None,
                message,
                docs_hint: Some("Completed and failed episodes accept no further commands.".to_string()),
            },
            RuntimeError::ShuttingDown => AppError::Unavailable { message },
            RuntimeError::Runner(err) => err.into(),
            RuntimeError::Budget(err) => err.into(),
            RuntimeError::Checkpoint(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use marshal_core::budget::BudgetDimension;
    use marshal_core::episode::RunnerState;
    use uuid::Uuid;

    use super::*;

    async fn json_of(err: AppError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should read");
        (status, serde_json::from_slice(&bytes).expect("body should be json"))
    }

    #[tokio::test]
    async fn budget_still_exceeded_is_a_conflict_with_code() {
        let err: AppError = RuntimeError::Runner(RunnerError::BudgetStillExceeded {
            dimension: BudgetDimension::Tokens,
            used: 1_200,
            limit: 1_000,
        })
        .into();
        let (status, body) = json_of(err).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "budget_still_exceeded");
        assert_eq!(body["error_code"], "BUDGET_EXCEEDED");
        assert!(body["request_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn finished_episode_is_an_illegal_transition() {
        let err: AppError = RuntimeError::NotAllowed {
            episode_id: Uuid::now_v7(),
            state: RunnerState::Completed,
            operation: "suspend",
        }
        .into();
        let (status, body) = json_of(err).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "illegal_transition");
        assert!(body.get("error_code").is_none());
    }

    #[tokio::test]
    async fn short_reason_points_at_the_field() {
        let (status, body) = json_of(KillSwitchError::ReasonTooShort.into()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "reason");
    }

    #[tokio::test]
    async fn unknown_episode_is_not_found() {
        let (status, body) = json_of(RuntimeError::UnknownEpisode(Uuid::now_v7()).into()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn internal_errors_hide_details() {
        let (status, body) = json_of(AppError::Internal("disk on fire".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["message"], "An internal error occurred");
    }
}
