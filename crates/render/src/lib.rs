//! Server-side rendering service: configuration, render orchestration
//! and result correlation on top of the execution pool.

pub mod config;
pub mod hub;
pub mod renderer;

pub use config::*;
pub use hub::*;
pub use renderer::*;
