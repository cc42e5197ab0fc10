//! Render result correlation.
//!
//! Each render registers a waiter keyed by a monotonically assigned id.
//! Resolution removes the waiter first, so a result is delivered at
//! most once and anything arriving after timeout or duplicate
//! completions falls through as a logged no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crossbeam_channel::{bounded, Receiver, Sender};
use engine::CompletionSink;
use serde::Deserialize;

/// What a successful render hands back to the HTTP layer.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderResult {
    pub html: String,
    pub meta: String,
    pub state: String,
    pub modules: Vec<String>,
}

pub type RenderOutcome = Result<RenderResult, String>;

#[derive(Default)]
pub struct RenderHub {
    next_id: AtomicU64,
    waiting: Mutex<HashMap<u64, Sender<RenderOutcome>>>,
}

impl RenderHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter and hand back its id and receiving end.
    pub fn new_entry(&self) -> (u64, Receiver<RenderOutcome>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = bounded(1);
        self.waiting
            .lock()
            .expect("render hub poisoned")
            .insert(id, tx);
        (id, rx)
    }

    /// Deliver an outcome to the waiter, if it is still registered.
    /// Removing the entry before sending makes delivery at-most-once.
    pub fn resolve(&self, render_id: u64, outcome: RenderOutcome) -> bool {
        let waiter = self
            .waiting
            .lock()
            .expect("render hub poisoned")
            .remove(&render_id);
        match waiter {
            Some(tx) => {
                // The waiter may have just given up; a dead channel is
                // the same as a late completion.
                tx.try_send(outcome).is_ok()
            }
            None => {
                tracing::debug!("render {}: late completion dropped", render_id);
                false
            }
        }
    }

    /// Forget a waiter that stopped caring (timeout, dispatch failure).
    pub fn remove(&self, render_id: u64) {
        self.waiting
            .lock()
            .expect("render hub poisoned")
            .remove(&render_id);
    }

    pub fn pending(&self) -> usize {
        self.waiting.lock().expect("render hub poisoned").len()
    }
}

impl CompletionSink for RenderHub {
    fn complete(&self, render_id: u64, ok: bool, payload: String) {
        let outcome = if ok {
            match serde_json::from_str::<RenderResult>(&payload) {
                Ok(result) if result.html.is_empty() => Err("no render result".to_string()),
                Ok(result) => Ok(result),
                Err(err) => Err(format!("malformed render payload: {}", err)),
            }
        } else {
            Err(payload)
        };
        self.resolve(render_id, outcome);
    }
}
