use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use marshal_core::audit::{AuditSink, MemoryAuditSink};
use marshal_core::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use marshal_core::clock::{Clock, SystemClock};
use marshal_core::dashboard::{HealthStatus, KillSwitchDashboard};
use marshal_core::idempotency::IdempotencyLedger;
use marshal_core::kill_switch::KillSwitchRegistry;
use marshal_core::notify::{FanoutNotifier, OperatorNotifier, TracingNotifier};
use marshal_core::policy::{PolicyGate, RiskClassifier};
use marshal_core::runner::RunnerDeps;
use marshal_core::tool::ToolGateway;
use marshal_runtime::gateway::{HttpToolGateway, RecordingGateway};
use marshal_runtime::scripted::ScriptedAgent;
use marshal_runtime::store::FileCheckpointStore;
use marshal_runtime::sweeper::spawn_sweeper;
use marshal_runtime::{AgentRegistry, RuntimeConfig, Supervisor};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod auth;
mod error;
mod extract;
mod middleware;
mod routes;
mod state;
mod store;

use state::{ApiConfig, AppState};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Marshal Operator API",
        version = "0.1.0",
        description = "Start, watch and steer agent episodes; manage kill switches. Every error is a structured ApiError."
    ),
    paths(
        routes::health::health_check,
        routes::kill_switches::overview,
        routes::kill_switches::system_health,
        routes::kill_switches::activate,
        routes::kill_switches::deactivate,
        routes::kill_switches::history,
        routes::kill_switches::emergency_halt,
        routes::kill_switches::client_status,
        routes::kill_switches::check,
        routes::episodes::start_episode,
        routes::episodes::spawn_child,
        routes::episodes::list_episodes,
        routes::episodes::get_episode,
        routes::episodes::list_checkpoints,
        routes::episodes::suspend_episode,
        routes::episodes::resume_episode,
        routes::episodes::raise_budget,
        routes::episodes::fail_episode,
        routes::episodes::cancel_episode,
    ),
    components(schemas(
        HealthResponse,
        marshal_core::error::ApiError,
        marshal_core::dashboard::KillSwitchOverview,
        marshal_core::dashboard::SystemHealth,
        marshal_core::dashboard::KillSwitchCheck,
        marshal_core::dashboard::ClientStatus,
        marshal_core::kill_switch::KillSwitchState,
        marshal_core::kill_switch::ActionContext,
        marshal_core::episode::EpisodeSpec,
        marshal_core::episode::EpisodeCheckpoint,
        marshal_runtime::EpisodeSnapshot,
        routes::kill_switches::ActivateRequest,
        routes::kill_switches::DeactivateRequest,
        routes::kill_switches::EmergencyHaltRequest,
        routes::episodes::SuspendRequest,
        routes::episodes::ResumeRequest,
        routes::episodes::RaiseBudgetRequest,
        routes::episodes::FailRequest,
    )),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            utoipa::openapi::security::SecurityScheme::Http(utoipa::openapi::security::Http::new(
                utoipa::openapi::security::HttpAuthScheme::Bearer,
            )),
        );
    }
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// `postgres` or `local` (file or in-memory checkpoints)
    pub store: String,
    pub live_episodes: usize,
    pub kill_switches: HealthStatus,
    pub agent_types: Vec<String>,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marshal_api=debug,marshal_runtime=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = ApiConfig::from_env();
    let runtime_config = RuntimeConfig::from_env();

    let pool = match config.database_url.as_deref() {
        Some(database_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(database_url)
                .await
                .expect("Failed to connect to database");
            sqlx::migrate!("../migrations")
                .run(&pool)
                .await
                .expect("Failed to run migrations");
            Some(pool)
        }
        None => None,
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let notifier: Arc<dyn OperatorNotifier> = match &pool {
        Some(pool) => {
            let sinks: Vec<Arc<dyn OperatorNotifier>> = vec![
                Arc::new(TracingNotifier),
                Arc::new(store::KillSwitchAuditNotifier::new(pool.clone())),
            ];
            Arc::new(FanoutNotifier::new(sinks))
        }
        None => Arc::new(TracingNotifier),
    };
    let audit: Arc<dyn AuditSink> = match &pool {
        Some(pool) => Arc::new(store::PgAuditSink::new(pool.clone())),
        None => Arc::new(MemoryAuditSink::new()),
    };

    let checkpoints: Arc<dyn CheckpointStore> = match (&pool, &runtime_config.checkpoint_dir) {
        (Some(pool), _) => Arc::new(store::PgCheckpointStore::new(pool.clone())),
        (None, Some(dir)) => Arc::new(
            FileCheckpointStore::open(dir.clone())
                .await
                .expect("Failed to open checkpoint directory"),
        ),
        (None, None) => {
            tracing::warn!("no DATABASE_URL or MARSHAL_CHECKPOINT_DIR; checkpoints are kept in memory only");
            Arc::new(MemoryCheckpointStore::new())
        }
    };

    let gateway: Arc<dyn ToolGateway> = match &config.tool_gateway_url {
        Some(url) => Arc::new(
            HttpToolGateway::new(url.clone(), config.tool_gateway_timeout)
                .expect("Failed to build tool gateway client"),
        ),
        None => {
            tracing::warn!("no MARSHAL_TOOL_GATEWAY_URL; running in dry-run mode, tool calls are recorded only");
            Arc::new(RecordingGateway::new())
        }
    };

    if config.operator_token_sha256.is_none() {
        tracing::warn!("MARSHAL_OPERATOR_TOKEN_SHA256 unset; operator routes accept unauthenticated requests");
    }

    let registry = Arc::new(KillSwitchRegistry::new(notifier.clone(), clock.clone()));
    let deps = RunnerDeps {
        gate: Arc::new(PolicyGate::new(registry.clone(), RiskClassifier::default())),
        ledger: Arc::new(IdempotencyLedger::new()),
        audit,
        notifier,
        clock,
        budget_policy: runtime_config.budget_policy.clone(),
    };
    let agents = AgentRegistry::new().with("scripted", Arc::new(ScriptedAgent));
    let supervisor = Supervisor::new(deps, agents, gateway, checkpoints, runtime_config.clone());

    match supervisor.recover().await {
        Ok(report) => tracing::info!(
            resumed = report.resumed.len(),
            suspended = report.suspended.len(),
            failed = report.failed.len(),
            "startup recovery complete"
        ),
        Err(err) => tracing::error!(error = %err, "startup recovery failed; continuing without recovered episodes"),
    }

    let sweeper = spawn_sweeper(
        registry.clone(),
        runtime_config.sweep_interval,
        supervisor.shutdown_token(),
    );

    let app_state = AppState {
        supervisor: supervisor.clone(),
        dashboard: Arc::new(KillSwitchDashboard::new(registry.clone())),
        operator_token_sha256: config.operator_token_sha256.as_deref().map(Arc::from),
        db: pool.clone(),
    };

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::router())
        .merge(routes::kill_switches::read_router().layer(middleware::rate_limit::operator_read_layer()))
        .merge(routes::kill_switches::write_router().layer(middleware::rate_limit::operator_write_layer()))
        .merge(routes::kill_switches::check_router().layer(middleware::rate_limit::check_layer()))
        .merge(routes::episodes::read_router().layer(middleware::rate_limit::operator_read_layer()))
        .merge(routes::episodes::write_router().layer(middleware::rate_limit::operator_write_layer()))
        .layer(middleware::kill_switch::KillSwitchLayer::new(registry, pool))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::cors::build_cors_layer()),
        )
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Marshal API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listen address");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    let parked = supervisor.shutdown().await;
    tracing::info!(episodes = parked.len(), "episodes parked for restart");
    if let Err(err) = sweeper.await {
        tracing::error!(error = %err, "kill switch sweeper task failed");
    }
}
