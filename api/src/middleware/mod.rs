pub mod cors;
pub mod kill_switch;
pub mod rate_limit;
