pub mod episode;
pub mod health;
pub mod kill_switch;
pub mod token;
