use clap::{Subcommand, ValueEnum};
use serde_json::json;

use crate::util::{Target, exit_error};

#[derive(Subcommand)]
pub enum KillSwitchCommands {
    /// Active switches across all scopes
    Overview,
    /// Aggregate posture (healthy, degraded, critical)
    Health,
    /// Activate a switch
    Activate {
        #[arg(long, value_enum)]
        scope: Scope,
        /// Client, platform or action class (omit for global)
        #[arg(long)]
        target: Option<String>,
        /// Why the switch is being thrown (at least 3 characters)
        #[arg(long)]
        reason: String,
        #[arg(long, value_enum, default_value = "high")]
        severity: Severity,
        #[arg(long)]
        incident_id: Option<String>,
        /// Auto-deactivate at this time (RFC3339)
        #[arg(long)]
        scheduled_end: Option<String>,
    },
    /// Deactivate a switch
    Deactivate {
        #[arg(long, value_enum)]
        scope: Scope,
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        reason: String,
    },
    /// Activation history for one target, newest first
    History {
        #[arg(long, value_enum)]
        scope: Scope,
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Throw the global switch at critical severity
    Halt {
        #[arg(long)]
        reason: String,
        #[arg(long)]
        incident_id: Option<String>,
    },
    /// Switches that affect one client
    ClientStatus {
        client_id: String,
    },
    /// Ask whether an action would be blocked right now
    Check {
        #[arg(long)]
        client_id: Option<String>,
        #[arg(long)]
        platform: Option<String>,
        #[arg(long)]
        action_type: Option<String>,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Scope {
    Global,
    Client,
    Platform,
    Action,
}

impl Scope {
    fn as_str(self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Client => "client",
            Scope::Platform => "platform",
            Scope::Action => "action",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Severity {
    Warning,
    High,
    Critical,
}

impl Severity {
    fn as_str(self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

pub async fn run(target: &Target, command: KillSwitchCommands) -> i32 {
    match command {
        KillSwitchCommands::Overview => target.get("/v1/kill-switches/overview", &[]).await,
        KillSwitchCommands::Health => target.get("/v1/kill-switches/health", &[]).await,
        KillSwitchCommands::Activate {
            scope,
            target: switch_target,
            reason,
            severity,
            incident_id,
            scheduled_end,
        } => {
            require_target(scope, switch_target.as_deref());
            let mut body = json!({
                "scope": scope.as_str(),
                "reason": reason,
                "severity": severity.as_str(),
            });
            if let Some(t) = switch_target {
                body["target"] = json!(t);
            }
            if let Some(id) = incident_id {
                body["incident_id"] = json!(id);
            }
            if let Some(end) = scheduled_end {
                body["scheduled_end"] = json!(end);
            }
            target.post("/v1/kill-switches/activate", body).await
        }
        KillSwitchCommands::Deactivate {
            scope,
            target: switch_target,
            reason,
        } => {
            require_target(scope, switch_target.as_deref());
            let mut body = json!({
                "scope": scope.as_str(),
                "reason": reason,
            });
            if let Some(t) = switch_target {
                body["target"] = json!(t);
            }
            target.post("/v1/kill-switches/deactivate", body).await
        }
        KillSwitchCommands::History {
            scope,
            target: switch_target,
            limit,
        } => {
            let mut query = vec![("scope".to_string(), scope.as_str().to_string())];
            if let Some(t) = switch_target {
                query.push(("target".to_string(), t));
            }
            if let Some(l) = limit {
                query.push(("limit".to_string(), l.to_string()));
            }
            target.get("/v1/kill-switches/history", &query).await
        }
        KillSwitchCommands::Halt { reason, incident_id } => {
            let mut body = json!({ "reason": reason });
            if let Some(id) = incident_id {
                body["incident_id"] = json!(id);
            }
            target.post("/v1/kill-switches/emergency-halt", body).await
        }
        KillSwitchCommands::ClientStatus { client_id } => {
            target
                .get(&format!("/v1/kill-switches/client/{client_id}/status"), &[])
                .await
        }
        KillSwitchCommands::Check {
            client_id,
            platform,
            action_type,
        } => {
            let body = json!({
                "client_id": client_id,
                "platform": platform,
                "action_type": action_type,
            });
            target.post("/v1/kill-switches/check", body).await
        }
    }
}

fn require_target(scope: Scope, switch_target: Option<&str>) {
    match (scope, switch_target) {
        (Scope::Global, Some(_)) => exit_error(
            "the global switch takes no --target",
            Some("Drop --target or pick a client, platform or action scope"),
        ),
        (Scope::Client | Scope::Platform | Scope::Action, None) => exit_error(
            &format!("--target is required for the {} scope", scope.as_str()),
            None,
        ),
        _ => {}
    }
}
