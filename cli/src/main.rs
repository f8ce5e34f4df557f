use clap::{Parser, Subcommand};

mod commands;
mod util;

use commands::episode::EpisodeCommands;
use commands::kill_switch::KillSwitchCommands;
use util::Target;

#[derive(Parser)]
#[command(name = "marshal", version, about = "Marshal operator CLI: steer agent episodes and kill switches")]
struct Cli {
    /// API base URL
    #[arg(long, env = "MARSHAL_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// Operator bearer token
    #[arg(long, env = "MARSHAL_OPERATOR_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Operator identity recorded on audit trails (required for writes)
    #[arg(long, env = "MARSHAL_OPERATOR_ID")]
    operator_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check API health
    Health,
    /// Kill switch registry and dashboard
    #[command(name = "kill-switch", alias = "ks")]
    KillSwitch {
        #[command(subcommand)]
        command: KillSwitchCommands,
    },
    /// Episode lifecycle
    Episode {
        #[command(subcommand)]
        command: EpisodeCommands,
    },
    /// Hash an operator token for MARSHAL_OPERATOR_TOKEN_SHA256
    TokenDigest,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let target = Target {
        api_url: cli.api_url.trim_end_matches('/').to_string(),
        token: cli.token,
        operator_id: cli.operator_id,
    };

    let code = match cli.command {
        Commands::Health => commands::health::run(&target).await,
        Commands::KillSwitch { command } => commands::kill_switch::run(&target, command).await,
        Commands::Episode { command } => commands::episode::run(&target, command).await,
        Commands::TokenDigest => commands::token::run(target.token.as_deref()),
    };

    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_resume_with_step_up() {
        let cli = Cli::try_parse_from([
            "marshal",
            "--operator-id",
            "alice",
            "episode",
            "resume",
            "0196b1f2-0000-7000-8000-000000000001",
            "--grant-step-up",
            "approval",
        ])
        .unwrap();
        assert_eq!(cli.operator_id.as_deref(), Some("alice"));
        match cli.command {
            Commands::Episode {
                command: EpisodeCommands::Resume { grant_step_up, checkpoint_id, .. },
            } => {
                assert_eq!(grant_step_up, commands::episode::StepUp::Approval);
                assert!(checkpoint_id.is_none());
            }
            _ => panic!("expected episode resume"),
        }
    }

    #[test]
    fn ks_alias_reaches_kill_switch_commands() {
        let cli = Cli::try_parse_from([
            "marshal", "ks", "activate", "--scope", "platform", "--target", "meta", "--reason", "api outage",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::KillSwitch {
                command: KillSwitchCommands::Activate { .. }
            }
        ));
    }

    #[test]
    fn rejects_unknown_budget_dimension() {
        let result = Cli::try_parse_from([
            "marshal",
            "episode",
            "budget",
            "0196b1f2-0000-7000-8000-000000000001",
            "--dimension",
            "gpu",
            "--limit",
            "10",
        ]);
        assert!(result.is_err());
    }
}
