//! Script execution engine: V8 execution units with host ops for
//! fetches, completion callbacks and logging.

pub mod error;
pub mod ops;
pub mod unit;

pub use error::*;
pub use ops::{CompletionSink, HostState};
pub use unit::*;
