//! Async side of Marshal: one driver task per episode, a supervisor that
//! routes operator commands to them, unknown-outcome verification, durable
//! checkpoint stores, crash recovery and the kill switch sweeper.

pub mod agent;
pub mod config;
pub mod driver;
pub mod error;
pub mod gateway;
pub mod recovery;
pub mod scripted;
pub mod store;
pub mod supervisor;
pub mod sweeper;
pub mod verification;

pub use agent::{AgentRegistry, AgentView, EpisodeAgent};
pub use config::RuntimeConfig;
pub use driver::EpisodeSnapshot;
pub use error::RuntimeError;
pub use recovery::RecoveryReport;
pub use supervisor::Supervisor;
