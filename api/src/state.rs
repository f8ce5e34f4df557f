use std::sync::Arc;
use std::time::Duration;

use marshal_core::dashboard::KillSwitchDashboard;
use marshal_runtime::Supervisor;
use sqlx::PgPool;
use url::Url;

/// Process settings for the operator API, read once at start-up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiConfig {
    pub port: u16,
    pub database_url: Option<String>,
    /// SHA-256 hex digest of the operator bearer token. Unset means open access.
    pub operator_token_sha256: Option<String>,
    /// Remote tool executor. Unset means dry-run mode with a recording gateway.
    pub tool_gateway_url: Option<Url>,
    pub tool_gateway_timeout: Duration,
    pub max_connections: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            database_url: None,
            operator_token_sha256: None,
            tool_gateway_url: None,
            tool_gateway_timeout: Duration::from_secs(30),
            max_connections: 20,
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let text = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        let tool_gateway_url = text("MARSHAL_TOOL_GATEWAY_URL").and_then(|raw| match Url::parse(&raw) {
            Ok(url) => Some(url),
            Err(err) => {
                tracing::warn!(error = %err, value = %raw, "ignoring invalid MARSHAL_TOOL_GATEWAY_URL");
                None
            }
        });

        Self {
            port: text("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            database_url: text("DATABASE_URL"),
            operator_token_sha256: text("MARSHAL_OPERATOR_TOKEN_SHA256").map(|d| d.to_ascii_lowercase()),
            tool_gateway_url,
            tool_gateway_timeout: text("MARSHAL_TOOL_GATEWAY_TIMEOUT_SECS")
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.tool_gateway_timeout),
            max_connections: text("MARSHAL_DB_MAX_CONNECTIONS")
                .and_then(|n| n.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_connections),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Supervisor,
    pub dashboard: Arc<KillSwitchDashboard>,
    pub operator_token_sha256: Option<Arc<str>>,
    pub db: Option<PgPool>,
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use marshal_core::audit::MemoryAuditSink;
    use marshal_core::checkpoint::MemoryCheckpointStore;
    use marshal_core::clock::SystemClock;
    use marshal_core::dashboard::KillSwitchDashboard;
    use marshal_core::idempotency::IdempotencyLedger;
    use marshal_core::kill_switch::KillSwitchRegistry;
    use marshal_core::notify::MemoryNotifier;
    use marshal_core::policy::{PolicyGate, RiskClassifier};
    use marshal_core::runner::RunnerDeps;
    use marshal_runtime::config::{RuntimeConfig, VerificationConfig};
    use marshal_runtime::gateway::RecordingGateway;
    use marshal_runtime::scripted::ScriptedAgent;
    use marshal_runtime::{AgentRegistry, Supervisor};

    use super::AppState;

    pub const OPERATOR_TOKEN: &str = "marshal_op_test_token";

    pub struct TestApp {
        pub state: AppState,
        pub registry: Arc<KillSwitchRegistry>,
        pub gateway: Arc<RecordingGateway>,
    }

    /// In-memory state. `secured` requires `OPERATOR_TOKEN` on every request.
    pub fn test_app(secured: bool) -> TestApp {
        let clock = Arc::new(SystemClock);
        let notifier = Arc::new(MemoryNotifier::new());
        let registry = Arc::new(KillSwitchRegistry::new(notifier.clone(), clock.clone()));
        let gateway = Arc::new(RecordingGateway::new());
        let config = RuntimeConfig {
            verification: VerificationConfig {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
            ..RuntimeConfig::default()
        };
        let deps = RunnerDeps {
            gate: Arc::new(PolicyGate::new(registry.clone(), RiskClassifier::default())),
            ledger: Arc::new(IdempotencyLedger::new()),
            audit: Arc::new(MemoryAuditSink::new()),
            notifier,
            clock,
            budget_policy: config.budget_policy.clone(),
        };
        let supervisor = Supervisor::new(
            deps,
            AgentRegistry::new().with("scripted", Arc::new(ScriptedAgent)),
            gateway.clone(),
            Arc::new(MemoryCheckpointStore::new()),
            config,
        );
        let state = AppState {
            supervisor,
            dashboard: Arc::new(KillSwitchDashboard::new(registry.clone())),
            operator_token_sha256: secured.then(|| marshal_core::auth::hash_token(OPERATOR_TOKEN).into()),
            db: None,
        };
        TestApp {
            state,
            registry,
            gateway,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> ApiConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ApiConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        assert_eq!(config(&[]), ApiConfig::default());
    }

    #[test]
    fn reads_and_normalises_settings() {
        let cfg = config(&[
            ("PORT", "8080"),
            ("DATABASE_URL", " postgres://localhost/marshal "),
            ("MARSHAL_OPERATOR_TOKEN_SHA256", "ABCDEF"),
            ("MARSHAL_TOOL_GATEWAY_URL", "http://tools.internal:9000"),
            ("MARSHAL_TOOL_GATEWAY_TIMEOUT_SECS", "5"),
        ]);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/marshal"));
        assert_eq!(cfg.operator_token_sha256.as_deref(), Some("abcdef"));
        assert_eq!(
            cfg.tool_gateway_url.as_ref().map(Url::as_str),
            Some("http://tools.internal:9000/")
        );
        assert_eq!(cfg.tool_gateway_timeout, Duration::from_secs(5));
    }

    #[test]
    fn invalid_values_fall_back() {
        let cfg = config(&[
            ("PORT", "not-a-port"),
            ("DATABASE_URL", "   "),
            ("MARSHAL_TOOL_GATEWAY_URL", "not a url"),
            ("MARSHAL_TOOL_GATEWAY_TIMEOUT_SECS", "0"),
        ]);
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.database_url, None);
        assert_eq!(cfg.tool_gateway_url, None);
        assert_eq!(cfg.tool_gateway_timeout, Duration::from_secs(30));
    }
}
