//! Episode orchestration engine.
//!
//! The synchronous core: the runner state machine, the budget tracker, the
//! multi-scope kill switch registry with its dashboard, and the policy gate.
//! Async concerns (driving episodes, verification, sweeping) live in
//! `marshal-runtime`.

pub mod audit;
pub mod auth;
pub mod budget;
pub mod checkpoint;
pub mod clock;
pub mod dashboard;
pub mod episode;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod kill_switch;
pub mod notify;
pub mod policy;
pub mod runner;
pub mod tool;
