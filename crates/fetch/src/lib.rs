pub mod bridge;
pub mod event;

pub use bridge::*;
pub use event::*;

use std::sync::Arc;

/// Hook invoked for alert-worthy conditions (fetch failures, pool
/// exhaustion). The embedding application attaches its own transport.
pub type AlertHook = Arc<dyn Fn(&str) + Send + Sync>;
