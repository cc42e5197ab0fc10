//! Render orchestration.
//!
//! One render: register a waiter with the hub, splice the request
//! context into the entry script, run it on a pooled unit, then wait
//! for the completion callback with a deadline. The waiter is always
//! deregistered on the way out, so completions racing a timeout land in
//! the hub's late-delivery path instead of a stale channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fetch::{AlertHook, FetchBridge};
use pool::{ExecuteError, UnitPool};

use crate::config::ServerConfig;
use crate::hub::{RenderHub, RenderResult};

const RENDER_TEMPLATE: &str = include_str!("render.js");
const CONTEXT_PLACEHOLDER: &str = "$RENDER_CONTEXT";

/// Request headers forwarded into the render context for scripts to
/// replay on internal API fetches.
pub const FORWARDED_HEADERS: [&str; 3] = ["Cookie", "User-Agent", "X-Forwarded-For"];

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("fetch bridge: {0}")]
    Bridge(#[from] fetch::BridgeError),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("render template has no $RENDER_CONTEXT placeholder")]
    MissingPlaceholder,
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("render pool: {0}")]
    Pool(#[from] ExecuteError),
    #[error("render {render_id} failed: {message}")]
    Failed { render_id: u64, message: String },
    #[error("render {render_id} timed out")]
    Timeout { render_id: u64 },
}

#[derive(Clone, Debug, Default)]
pub struct RenderRequest {
    pub url: String,
    pub origin: String,
    pub headers: HashMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct RenderOutput {
    pub result: RenderResult,
    /// Which unit produced the result, for log correlation.
    pub unit_id: u32,
}

/// Entry script split at the context placeholder, done once.
struct Template {
    head: String,
    tail: String,
}

impl Template {
    fn parse(source: &str) -> Result<Self, BuildError> {
        let (head, tail) = source
            .split_once(CONTEXT_PLACEHOLDER)
            .ok_or(BuildError::MissingPlaceholder)?;
        Ok(Self {
            head: head.to_string(),
            tail: tail.to_string(),
        })
    }

    fn splice(&self, context: &str) -> String {
        let mut script =
            String::with_capacity(self.head.len() + context.len() + self.tail.len());
        script.push_str(&self.head);
        script.push_str(context);
        script.push_str(&self.tail);
        script
    }
}

pub struct Renderer {
    pool: Arc<UnitPool>,
    hub: Arc<RenderHub>,
    template: Template,
    timeout: Duration,
}

impl Renderer {
    pub fn new(
        pool: Arc<UnitPool>,
        hub: Arc<RenderHub>,
        template_source: &str,
        timeout: Duration,
    ) -> Result<Self, BuildError> {
        Ok(Self {
            pool,
            hub,
            template: Template::parse(template_source)?,
            timeout,
        })
    }

    /// Wire up the whole stack from configuration: fetch bridge, hub,
    /// pool and renderer.
    pub fn from_config(config: ServerConfig, alert: Option<AlertHook>) -> Result<Self, BuildError> {
        let bridge = Arc::new(FetchBridge::new(config.fetch, alert.clone())?);
        let hub = Arc::new(RenderHub::new());
        let bundle = read_optional(&config.render.bundle_path)?;
        let template_source = match read_optional(&config.render.script_path)? {
            Some(source) => source,
            None => RENDER_TEMPLATE.to_string(),
        };
        let completions: Arc<dyn engine::CompletionSink> = Arc::clone(&hub);
        let pool = Arc::new(UnitPool::new(config.pool, bundle, bridge, completions, alert));
        Self::new(
            pool,
            hub,
            &template_source,
            Duration::from_secs(config.render.timeout_secs.max(1)),
        )
    }

    pub fn render(&self, request: &RenderRequest) -> Result<RenderOutput, RenderError> {
        let (render_id, outcome_rx) = self.hub.new_entry();
        let context = render_context(render_id, request);
        let script = self.template.splice(&context);
        tracing::info!("render {}: {}", render_id, request.url);

        let unit_id = match self.pool.execute(script, "render.js".to_string()) {
            Ok(unit_id) => unit_id,
            Err(err) => {
                self.hub.remove(render_id);
                return Err(RenderError::Pool(err));
            }
        };

        match outcome_rx.recv_timeout(self.timeout) {
            Ok(Ok(result)) => Ok(RenderOutput { result, unit_id }),
            Ok(Err(message)) => Err(RenderError::Failed { render_id, message }),
            Err(_) => {
                self.hub.remove(render_id);
                tracing::error!(
                    "render {} timed out after {:?} on unit {}",
                    render_id,
                    self.timeout,
                    unit_id
                );
                Err(RenderError::Timeout { render_id })
            }
        }
    }

    pub fn pool(&self) -> &Arc<UnitPool> {
        &self.pool
    }
}

fn read_optional(path: &str) -> Result<Option<String>, BuildError> {
    if path.is_empty() {
        return Ok(None);
    }
    std::fs::read_to_string(path)
        .map(Some)
        .map_err(|source| BuildError::Io {
            path: path.to_string(),
            source,
        })
}

/// The JSON context object spliced into the entry script. Only the
/// allow-listed request headers travel with it.
fn render_context(render_id: u64, request: &RenderRequest) -> String {
    let mut ssr_headers = serde_json::Map::new();
    for name in FORWARDED_HEADERS {
        if let Some(value) = header_lookup(&request.headers, name) {
            ssr_headers.insert(name.to_string(), serde_json::Value::String(value.clone()));
        }
    }
    serde_json::json!({
        "renderId": render_id,
        "url": request.url,
        "origin": request.origin,
        "ssrHeaders": ssr_headers,
    })
    .to_string()
}

fn header_lookup<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a String> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}
