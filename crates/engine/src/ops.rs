//! Host operations exposed to scripts.
//!
//! Ops for outbound fetches, render completion callbacks and console
//! logging. The per-runtime [`HostState`] wires each op back to the
//! owning execution unit and the process-wide fetch bridge.

use std::sync::{Arc, Weak};

use deno_core::{op2, OpState};
use fetch::{EventSink, FetchBridge, FetchRequest};

/// Receives the terminal result of a render, keyed by render id.
pub trait CompletionSink: Send + Sync {
    /// `ok` distinguishes a produced result payload from a failure
    /// message. Late or repeated completions must be safe to drop.
    fn complete(&self, render_id: u64, ok: bool, payload: String);
}

/// Per-runtime state read by the host ops.
pub struct HostState {
    pub unit_id: u32,
    /// Weak so a disposed unit cannot be kept alive by its own runtime.
    pub sink: Weak<dyn EventSink>,
    pub bridge: Arc<FetchBridge>,
    pub completions: Arc<dyn CompletionSink>,
}

/// Start an outbound fetch described by a JSON request. Returns the
/// assigned request id, or 0 when the request is malformed.
#[op2]
#[number]
pub fn op_fetch_open(state: &mut OpState, #[string] request: String) -> u64 {
    let host = state.borrow::<HostState>();
    let request = match serde_json::from_str::<FetchRequest>(&request) {
        Ok(request) => request,
        Err(err) => {
            tracing::error!("unit {}: bad fetch request: {}", host.unit_id, err);
            return 0;
        }
    };
    let Some(sink) = host.sink.upgrade() else {
        return 0;
    };
    host.bridge.open(request, sink)
}

/// Cooperatively abort an in-flight fetch.
#[op2(fast)]
pub fn op_fetch_abort(state: &mut OpState, #[number] request_id: u64) {
    let host = state.borrow::<HostState>();
    host.bridge.abort(request_id);
}

/// Report a successful render. The payload is the JSON result object.
#[op2(fast)]
pub fn op_render_complete(
    state: &mut OpState,
    #[number] render_id: u64,
    #[string] payload: String,
) {
    let host = state.borrow::<HostState>();
    host.completions.complete(render_id, true, payload);
}

/// Report a failed render with the script-side error description.
#[op2(fast)]
pub fn op_render_fail(
    state: &mut OpState,
    #[number] render_id: u64,
    #[string] message: String,
) {
    let host = state.borrow::<HostState>();
    tracing::error!("unit {}: render {} failed: {}", host.unit_id, render_id, message);
    host.completions.complete(render_id, false, message);
}

/// Console output from scripts, routed into the host log.
#[op2(fast)]
pub fn op_host_log(state: &mut OpState, #[smi] level: i32, #[string] message: String) {
    let host = state.borrow::<HostState>();
    match level {
        0 => tracing::debug!("unit {}: {}", host.unit_id, message),
        2 => tracing::warn!("unit {}: {}", host.unit_id, message),
        3 => tracing::error!("unit {}: {}", host.unit_id, message),
        _ => tracing::info!("unit {}: {}", host.unit_id, message),
    }
}

deno_core::extension!(
    ssr_host,
    ops = [
        op_fetch_open,
        op_fetch_abort,
        op_render_complete,
        op_render_fail,
        op_host_log,
    ],
);

/// Register the host op extension.
pub fn register_ops() -> deno_core::Extension {
    ssr_host::init_ops()
}
