//! Bounded pool of script execution units.

pub mod config;
pub mod unit_pool;

pub use config::*;
pub use unit_pool::*;
