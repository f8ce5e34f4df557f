pub mod episodes;
pub mod health;
pub mod kill_switches;
