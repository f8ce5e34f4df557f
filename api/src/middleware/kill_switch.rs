//! While the global kill switch is active no new episode may start, as a root
//! episode or as a child. Running episodes are stopped by the policy gate.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::Json;
use axum::extract::Request;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use marshal_core::kill_switch::{KillSwitchRegistry, KillSwitchScope};
use serde_json::json;
use sqlx::PgPool;
use tower::{Layer, Service, ServiceExt};
use uuid::Uuid;

use crate::auth::OPERATOR_ID_HEADER;
use crate::store::{KillSwitchAuditEvent, persist_kill_switch_audit_event};

pub const KILL_SWITCH_HEADER: &str = "x-marshal-kill-switch";

#[derive(Clone)]
pub struct KillSwitchLayer {
    registry: Arc<KillSwitchRegistry>,
    pool: Option<PgPool>,
}

impl KillSwitchLayer {
    pub fn new(registry: Arc<KillSwitchRegistry>, pool: Option<PgPool>) -> Self {
        Self { registry, pool }
    }
}

impl<S> Layer<S> for KillSwitchLayer {
    type Service = KillSwitchService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        KillSwitchService {
            inner,
            registry: self.registry.clone(),
            pool: self.pool.clone(),
        }
    }
}

#[derive(Clone)]
pub struct KillSwitchService<S> {
    inner: S,
    registry: Arc<KillSwitchRegistry>,
    pool: Option<PgPool>,
}

/// `POST /v1/episodes` and `POST /v1/episodes/{id}/children`.
fn starts_episode(method: &Method, path: &str) -> bool {
    if *method != Method::POST {
        return false;
    }
    let path = path.trim_end_matches('/');
    path == "/v1/episodes" || (path.starts_with("/v1/episodes/") && path.ends_with("/children"))
}

impl<S> Service<Request> for KillSwitchService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let not_ready = self.inner.clone();
        let ready = std::mem::replace(&mut self.inner, not_ready);
        let registry = self.registry.clone();
        let pool = self.pool.clone();

        Box::pin(async move {
            let path = req.uri().path().to_string();
            if !starts_episode(req.method(), &path) {
                return Ok(ready.oneshot(req).await.into_response());
            }

            let Some(global) = registry
                .get_state(KillSwitchScope::Global, None)
                .filter(|state| state.active)
            else {
                return Ok(ready.oneshot(req).await.into_response());
            };

            let operator_id = req
                .headers()
                .get(OPERATOR_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            tracing::warn!(
                path = %path,
                operator_id = operator_id.as_deref().unwrap_or("-"),
                reason = %global.reason,
                "episode start blocked by global kill switch"
            );
            if let Some(pool) = pool {
                persist_kill_switch_audit_event(
                    pool,
                    KillSwitchAuditEvent {
                        action: "blocked_request",
                        actor: operator_id,
                        scope: Some(KillSwitchScope::Global.as_str().to_string()),
                        target: None,
                        path: Some(path.clone()),
                        method: Some(req.method().to_string()),
                        reason: Some(global.reason.clone()),
                        metadata: json!({
                            "activated_at": global.activated_at,
                            "activated_by": global.activated_by,
                            "incident_id": global.incident_id,
                        }),
                    },
                );
            }

            let body = json!({
                "error": marshal_core::error::codes::FORBIDDEN,
                "error_code": KillSwitchScope::Global.deny_reason_code(),
                "message": "New episodes are blocked by the global kill switch.",
                "field": "kill_switch.global",
                "received": {
                    "reason": global.reason,
                    "activated_at": global.activated_at,
                    "activated_by": global.activated_by
                },
                "request_id": Uuid::now_v7().to_string(),
                "docs_hint": "Wait until an operator deactivates the global switch (POST /v1/kill-switches/deactivate)."
            });

            let mut response = (StatusCode::FORBIDDEN, Json(body)).into_response();
            response
                .headers_mut()
                .insert(KILL_SWITCH_HEADER, HeaderValue::from_static("active"));
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::post;
    use marshal_core::clock::SystemClock;
    use marshal_core::kill_switch::{ActivateInput, DeactivateInput, Severity};
    use marshal_core::notify::MemoryNotifier;

    use super::*;

    async fn ok() -> StatusCode {
        StatusCode::OK
    }

    fn app(registry: Arc<KillSwitchRegistry>) -> Router {
        Router::new()
            .route("/v1/episodes", post(ok).get(ok))
            .route("/v1/episodes/{id}/children", post(ok))
            .route("/v1/episodes/{id}/suspend", post(ok))
            .layer(KillSwitchLayer::new(registry, None))
    }

    async fn status(app: &Router, method: &str, uri: &str) -> (StatusCode, bool) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");
        (response.status(), response.headers().contains_key(KILL_SWITCH_HEADER))
    }

    #[test]
    fn matches_only_episode_starts() {
        assert!(starts_episode(&Method::POST, "/v1/episodes"));
        assert!(starts_episode(&Method::POST, "/v1/episodes/"));
        assert!(starts_episode(&Method::POST, "/v1/episodes/abc/children"));
        assert!(!starts_episode(&Method::GET, "/v1/episodes"));
        assert!(!starts_episode(&Method::POST, "/v1/episodes/abc/resume"));
        assert!(!starts_episode(&Method::POST, "/v1/kill-switches/activate"));
    }

    #[tokio::test]
    async fn global_switch_blocks_new_episodes_only() {
        let registry = Arc::new(KillSwitchRegistry::new(
            Arc::new(MemoryNotifier::new()),
            Arc::new(SystemClock),
        ));
        let app = app(registry.clone());
        assert_eq!(status(&app, "POST", "/v1/episodes").await, (StatusCode::OK, false));

        registry
            .activate(
                KillSwitchScope::Global,
                None,
                ActivateInput::new("credential leak", "alice", Severity::Critical),
            )
            .unwrap();
        assert_eq!(status(&app, "POST", "/v1/episodes").await, (StatusCode::FORBIDDEN, true));
        assert_eq!(
            status(&app, "POST", "/v1/episodes/0190/children").await,
            (StatusCode::FORBIDDEN, true)
        );
        assert_eq!(status(&app, "GET", "/v1/episodes").await, (StatusCode::OK, false));
        assert_eq!(
            status(&app, "POST", "/v1/episodes/0190/suspend").await,
            (StatusCode::OK, false)
        );

        registry
            .deactivate(KillSwitchScope::Global, None, DeactivateInput::new("rotated keys", "alice"))
            .unwrap();
        assert_eq!(status(&app, "POST", "/v1/episodes").await, (StatusCode::OK, false));
    }

    #[tokio::test]
    async fn client_switch_does_not_block_episode_starts() {
        let registry = Arc::new(KillSwitchRegistry::new(
            Arc::new(MemoryNotifier::new()),
            Arc::new(SystemClock),
        ));
        registry
            .activate(
                KillSwitchScope::Client,
                Some("client_42"),
                ActivateInput::new("fraud review", "alice", Severity::High),
            )
            .unwrap();
        let app = app(registry);
        assert_eq!(status(&app, "POST", "/v1/episodes").await, (StatusCode::OK, false));
    }
}
