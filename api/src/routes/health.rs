use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Json, Router, routing::get};

use crate::HealthResponse;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// Health check endpoint: process, database (when configured) and kill switch posture
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Database unreachable", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let (store, db_ok) = match &state.db {
        Some(pool) => (
            "postgres",
            sqlx::query_scalar::<_, i32>("SELECT 1")
                .fetch_one(pool)
                .await
                .is_ok(),
        ),
        None => ("local", true),
    };

    let http_status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        http_status,
        Json(HealthResponse {
            status: if db_ok { "ok" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            store: store.to_string(),
            live_episodes: state
                .supervisor
                .list()
                .iter()
                .filter(|s| !s.is_terminal())
                .count(),
            kill_switches: state.dashboard.get_system_health().status,
            agent_types: state.supervisor.agents().agent_types(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use marshal_core::kill_switch::{ActivateInput, KillSwitchScope, Severity};
    use tower::ServiceExt;

    use super::*;
    use crate::state::test_support::test_app;

    #[tokio::test]
    async fn reports_agents_and_switch_posture() {
        let app = test_app(true);
        app.registry
            .activate(
                KillSwitchScope::Platform,
                Some("meta"),
                ActivateInput::new("api outage", "alice", Severity::Warning),
            )
            .unwrap();

        let response = router()
            .with_state(app.state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["store"], "local");
        assert_eq!(body["kill_switches"], "degraded");
        assert_eq!(body["agent_types"], serde_json::json!(["scripted"]));
        assert_eq!(body["live_episodes"], 0);
    }
}
