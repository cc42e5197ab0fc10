//! Outbound fetch bridge.
//!
//! Scripts must never block their engine thread on network I/O, so fetches
//! issued from inside a script are handed to a fixed pool of worker threads
//! over a bounded queue. A single worker drives one request end-to-end and
//! reports progress back into the owning unit as ordered [`FetchEvent`]s.
//! Abort is cooperative: a flag checked at fixed checkpoints, never a forced
//! interrupt, and the terminal `finish` event fires on every path so the
//! registry entry is always reclaimed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use reqwest::blocking::Client;
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE, HOST};
use serde::Deserialize;
use url::Url;

use crate::event::{EventSink, FetchEvent};
use crate::AlertHook;

pub const MIN_FETCH_WORKERS: u32 = 2;
pub const MAX_FETCH_WORKERS: u32 = 2000;

/// Reserved header carrying a JSON bag of upstream headers to forward.
const FORWARD_BAG_HEADER: &str = "SSR-Headers";

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("api hosts and targets count not match")]
    HostTargetMismatch,
    #[error("invalid api target url: {0}")]
    InvalidTarget(String),
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// An outbound request as issued from inside a script.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FetchRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout_ms() -> u64 {
    8000
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Number of fetch worker threads, clamped to [2, 2000].
    pub worker_threads: u32,
    /// Hosts treated as internal API endpoints, rewritten to `api_targets`.
    pub api_hosts: Vec<String>,
    /// Target base URLs paired with `api_hosts` (http/https only).
    pub api_targets: Vec<String>,
    pub skip_ssl_verify: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            worker_threads: (num_cpus::get() as u32) * 64,
            api_hosts: Vec::new(),
            api_targets: Vec::new(),
            skip_ssl_verify: false,
        }
    }
}

/// An internal API host and the base URL its requests are redirected to.
struct ApiHost {
    host: String,
    target: Url,
}

struct Job {
    id: u64,
    request: FetchRequest,
    url: Url,
    aborted: Arc<AtomicBool>,
    sink: Arc<dyn EventSink>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    in_flight: HashMap<u64, Arc<AtomicBool>>,
}

/// Worker-pool-backed bridge performing outbound fetches for scripts.
pub struct FetchBridge {
    registry: Arc<Mutex<Registry>>,
    queue_tx: Sender<Job>,
}

impl FetchBridge {
    pub fn new(config: BridgeConfig, alert: Option<AlertHook>) -> Result<Self, BridgeError> {
        if config.api_hosts.len() != config.api_targets.len() {
            return Err(BridgeError::HostTargetMismatch);
        }
        let mut api_hosts = Vec::with_capacity(config.api_hosts.len());
        for (host, target) in config.api_hosts.iter().zip(config.api_targets.iter()) {
            let target = Url::parse(target)
                .map_err(|_| BridgeError::InvalidTarget(target.clone()))?;
            if target.scheme() != "http" && target.scheme() != "https" {
                return Err(BridgeError::InvalidTarget(target.to_string()));
            }
            api_hosts.push(ApiHost {
                host: host.clone(),
                target,
            });
        }
        let api_hosts = Arc::new(api_hosts);

        let workers = config
            .worker_threads
            .clamp(MIN_FETCH_WORKERS, MAX_FETCH_WORKERS);

        let client = Client::builder()
            .timeout(Duration::from_secs(35))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(60))
            .danger_accept_invalid_certs(config.skip_ssl_verify)
            .build()?;

        let registry = Arc::new(Mutex::new(Registry::default()));
        let (queue_tx, queue_rx) = bounded::<Job>(workers as usize * 2);

        tracing::info!("fetch bridge started: {} workers", workers);

        for _ in 0..workers {
            let rx: Receiver<Job> = queue_rx.clone();
            let registry = Arc::clone(&registry);
            let client = client.clone();
            let api_hosts = Arc::clone(&api_hosts);
            let alert = alert.clone();
            std::thread::spawn(move || {
                for job in rx.iter() {
                    perform_fetch(&job, &client, &api_hosts, alert.as_ref());
                    registry
                        .lock()
                        .expect("fetch registry poisoned")
                        .in_flight
                        .remove(&job.id);
                }
            });
        }

        Ok(Self { registry, queue_tx })
    }

    /// Register a request and enqueue it for a worker. Returns the assigned
    /// request id, or 0 when the URL is invalid (nothing is enqueued).
    /// Enqueueing blocks when the bounded queue is full.
    pub fn open(&self, request: FetchRequest, sink: Arc<dyn EventSink>) -> u64 {
        let url = match Url::parse(&request.url) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => url,
            _ => {
                tracing::error!("invalid fetch url: {}", request.url);
                return 0;
            }
        };

        let aborted = Arc::new(AtomicBool::new(false));
        let id = {
            let mut registry = self.registry.lock().expect("fetch registry poisoned");
            registry.next_id += 1;
            let id = registry.next_id;
            registry.in_flight.insert(id, Arc::clone(&aborted));
            id
        };

        let job = Job {
            id,
            request,
            url,
            aborted,
            sink,
        };
        let enqueue_start = Instant::now();
        let target = job.url.to_string();
        if self.queue_tx.send(job).is_err() {
            tracing::error!("fetch queue closed, dropping request {}", id);
            self.registry
                .lock()
                .expect("fetch registry poisoned")
                .in_flight
                .remove(&id);
            return 0;
        }
        tracing::info!(
            "fetch {}: {}, queue wait: {:?}",
            id,
            target,
            enqueue_start.elapsed()
        );
        id
    }

    /// Cooperatively abort an in-flight request. Checked at the worker's
    /// checkpoints; a terminal `finish` event is still delivered.
    pub fn abort(&self, request_id: u64) {
        let registry = self.registry.lock().expect("fetch registry poisoned");
        if let Some(flag) = registry.in_flight.get(&request_id) {
            flag.store(true, Ordering::Relaxed);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.registry
            .lock()
            .expect("fetch registry poisoned")
            .in_flight
            .len()
    }
}

fn emit(sink: &Arc<dyn EventSink>, event: &FetchEvent) {
    if let Err(err) = sink.deliver(event) {
        tracing::error!(
            "fetch {} deliver {:?} failed: {}",
            event.request_id,
            event.kind,
            err
        );
    }
}

fn emit_finish(sink: &Arc<dyn EventSink>, request_id: u64) {
    emit(sink, &FetchEvent::finish(request_id));
}

fn emit_error(sink: &Arc<dyn EventSink>, request_id: u64, message: String, alert: Option<&AlertHook>) {
    tracing::error!("fetch {} failed: {}", request_id, message);
    if let Some(alert) = alert {
        alert(&message);
    }
    emit(sink, &FetchEvent::error(request_id, message));
    emit_finish(sink, request_id);
}

/// The authority the request was addressed to, as written by the script.
fn request_authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

fn perform_fetch(job: &Job, client: &Client, api_hosts: &[ApiHost], alert: Option<&AlertHook>) {
    let id = job.id;
    let sink = &job.sink;

    if job.aborted.load(Ordering::Relaxed) {
        emit_finish(sink, id);
        return;
    }

    emit(sink, &FetchEvent::start(id));

    // Redirect internal API hosts to their configured target, keeping the
    // original authority as the Host header for upstream routing.
    let authority = request_authority(&job.url);
    let api_host = api_hosts.iter().find(|h| h.host == authority);
    let request_url = match api_host {
        Some(host) => {
            let mut rewritten = host.target.clone();
            rewritten.set_path(job.url.path());
            rewritten.set_query(job.url.query());
            rewritten
        }
        None => job.url.clone(),
    };

    let method = reqwest::Method::from_bytes(job.request.method.as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let mut builder = client
        .request(method, request_url.clone())
        .timeout(Duration::from_millis(job.request.timeout.max(1)));

    if api_host.is_some() {
        if let Ok(value) = HeaderValue::from_str(&authority) {
            builder = builder.header(HOST, value);
        }
    }

    let mut has_content_type = false;
    for (name, value) in &job.request.headers {
        if name == FORWARD_BAG_HEADER {
            if value.is_empty() {
                continue;
            }
            // Expand the forwarded-header bag. Cookies are only honored for
            // rewritten internal requests, never arbitrary external fetches.
            if let Ok(bag) = serde_json::from_str::<HashMap<String, String>>(value) {
                for (key, forwarded) in bag {
                    if forwarded.is_empty() {
                        continue;
                    }
                    if key == "Cookie" && api_host.is_none() {
                        continue;
                    }
                    let key = key.replace('_', "-");
                    tracing::debug!("forwarding header {}", key);
                    builder = builder.header_sensitive(&key, forwarded, false);
                }
            }
        } else {
            if name.eq_ignore_ascii_case("content-type") {
                has_content_type = true;
            }
            builder = builder.header_sensitive(name.as_str(), value.clone(), false);
        }
    }

    if let Some(body) = &job.request.body {
        if !body.is_empty() {
            if !has_content_type {
                let inferred = match body.as_bytes()[0] {
                    b'{' | b'[' => "application/json;charset=UTF-8",
                    _ => "application/x-www-form-urlencoded",
                };
                builder = builder.header(CONTENT_TYPE, inferred);
            }
            builder = builder.body(body.clone());
        }
    }

    if job.aborted.load(Ordering::Relaxed) {
        emit_finish(sink, id);
        return;
    }

    let response = builder.send();
    if job.aborted.load(Ordering::Relaxed) {
        emit_finish(sink, id);
        return;
    }
    let response = match response {
        Ok(response) => response,
        Err(err) => {
            emit_error(sink, id, err.to_string(), alert);
            return;
        }
    };

    let status = response.status().as_u16();
    let mut headers = HashMap::new();
    for name in response.headers().keys() {
        let joined = response
            .headers()
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join("&");
        headers.insert(header_display_name(name), joined);
    }
    emit(sink, &FetchEvent::headers(id, status, headers));

    let body = response.text();
    if job.aborted.load(Ordering::Relaxed) {
        emit_finish(sink, id);
        return;
    }
    let body = match body {
        Ok(body) => body,
        Err(err) => {
            emit_error(sink, id, err.to_string(), alert);
            return;
        }
    };

    emit(sink, &FetchEvent::end(id, body));
    emit_finish(sink, id);
}

/// Canonical display form for a response header name (Title-Case segments),
/// matching what script-side consumers index the header map with.
fn header_display_name(name: &HeaderName) -> String {
    name.as_str()
        .split('-')
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

trait HeaderSensitiveExt {
    fn header_sensitive(self, name: &str, value: String, sensitive: bool) -> Self;
}

impl HeaderSensitiveExt for reqwest::blocking::RequestBuilder {
    fn header_sensitive(self, name: &str, value: String, _sensitive: bool) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => self.header(name, value),
            _ => {
                tracing::warn!("dropping malformed header: {}", name);
                self
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        events: StdMutex<Vec<FetchEvent>>,
    }

    impl RecordingSink {
        fn kinds(&self) -> Vec<crate::EventKind> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.kind)
                .collect()
        }
    }

    impl EventSink for RecordingSink {
        fn deliver(&self, event: &FetchEvent) -> Result<(), String> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn test_client() -> Client {
        Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("client")
    }

    fn make_job(id: u64, url: &str, sink: Arc<RecordingSink>) -> Job {
        Job {
            id,
            request: FetchRequest {
                url: url.to_string(),
                ..FetchRequest::default()
            },
            url: Url::parse(url).expect("url"),
            aborted: Arc::new(AtomicBool::new(false)),
            sink,
        }
    }

    /// One-shot HTTP responder; returns (base_url, handle to captured
    /// request head).
    fn spawn_responder(body: &'static str) -> (String, Arc<StdMutex<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let captured = Arc::new(StdMutex::new(String::new()));
        let captured_clone = Arc::clone(&captured);
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 4096];
                let mut head = Vec::new();
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            head.extend_from_slice(&buf[..n]);
                            if head.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                *captured_clone.lock().unwrap() = String::from_utf8_lossy(&head).to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        (format!("http://{}", addr), captured)
    }

    #[test]
    fn worker_count_is_clamped() {
        assert_eq!(0u32.clamp(MIN_FETCH_WORKERS, MAX_FETCH_WORKERS), 2);
        assert_eq!(9999u32.clamp(MIN_FETCH_WORKERS, MAX_FETCH_WORKERS), 2000);
    }

    #[test]
    fn mismatched_host_table_is_rejected() {
        let config = BridgeConfig {
            api_hosts: vec!["a.internal".to_string()],
            api_targets: Vec::new(),
            ..BridgeConfig::default()
        };
        assert!(matches!(
            FetchBridge::new(config, None),
            Err(BridgeError::HostTargetMismatch)
        ));
    }

    #[test]
    fn non_http_target_is_rejected() {
        let config = BridgeConfig {
            api_hosts: vec!["a.internal".to_string()],
            api_targets: vec!["ftp://files.example".to_string()],
            ..BridgeConfig::default()
        };
        assert!(matches!(
            FetchBridge::new(config, None),
            Err(BridgeError::InvalidTarget(_))
        ));
    }

    #[test]
    fn open_rejects_invalid_url() {
        let bridge = FetchBridge::new(BridgeConfig::default(), None).expect("bridge");
        let sink = Arc::new(RecordingSink::default());
        let id = bridge.open(
            FetchRequest {
                url: "not a url".to_string(),
                ..FetchRequest::default()
            },
            sink.clone(),
        );
        assert_eq!(id, 0);
        assert!(sink.kinds().is_empty());
    }

    #[test]
    fn abort_before_dispatch_emits_only_finish() {
        let sink = Arc::new(RecordingSink::default());
        let job = make_job(1, "http://127.0.0.1:9/never", sink.clone());
        job.aborted.store(true, Ordering::Relaxed);
        perform_fetch(&job, &test_client(), &[], None);
        assert_eq!(sink.kinds(), vec![crate::EventKind::Finish]);
    }

    #[test]
    fn failed_dispatch_emits_start_error_finish() {
        let sink = Arc::new(RecordingSink::default());
        // Port 1 is essentially guaranteed to refuse the connection.
        let job = make_job(2, "http://127.0.0.1:1/unreachable", sink.clone());
        perform_fetch(&job, &test_client(), &[], None);
        assert_eq!(
            sink.kinds(),
            vec![
                crate::EventKind::Start,
                crate::EventKind::Error,
                crate::EventKind::Finish
            ]
        );
    }

    #[test]
    fn successful_fetch_emits_ordered_events_with_body() {
        let (base, _) = spawn_responder("hello world");
        let sink = Arc::new(RecordingSink::default());
        let job = make_job(3, &format!("{}/greeting", base), sink.clone());
        perform_fetch(&job, &test_client(), &[], None);

        assert_eq!(
            sink.kinds(),
            vec![
                crate::EventKind::Start,
                crate::EventKind::Headers,
                crate::EventKind::End,
                crate::EventKind::Finish
            ]
        );
        let events = sink.events.lock().unwrap();
        assert_eq!(events[1].status, Some(200));
        assert_eq!(
            events[1].headers.as_ref().unwrap().get("Content-Type"),
            Some(&"text/plain".to_string())
        );
        assert_eq!(events[2].body.as_deref(), Some("hello world"));
    }

    #[test]
    fn api_host_rewrite_preserves_host_and_forwards_cookies() {
        let (base, captured) = spawn_responder("ok");
        let target = Url::parse(&base).expect("target");
        let api_hosts = vec![ApiHost {
            host: "app.internal".to_string(),
            target,
        }];

        let sink = Arc::new(RecordingSink::default());
        let mut job = make_job(4, "http://app.internal/api/items?q=1", sink.clone());
        job.request.headers.insert(
            FORWARD_BAG_HEADER.to_string(),
            r#"{"Cookie":"sid=abc","X_Forwarded_For":"10.0.0.1","User-Agent":""}"#.to_string(),
        );
        perform_fetch(&job, &test_client(), &api_hosts, None);

        let head = captured.lock().unwrap().clone();
        assert!(head.starts_with("GET /api/items?q=1 "), "head: {}", head);
        let lower = head.to_ascii_lowercase();
        assert!(lower.contains("host: app.internal"));
        assert!(lower.contains("cookie: sid=abc"));
        assert!(lower.contains("x-forwarded-for: 10.0.0.1"));
        // Empty bag values and the bag header itself are not forwarded.
        assert!(!lower.contains("ssr-headers"));
    }

    #[test]
    fn external_fetch_drops_bag_cookies() {
        let (base, captured) = spawn_responder("ok");
        let sink = Arc::new(RecordingSink::default());
        let mut job = make_job(5, &format!("{}/external", base), sink.clone());
        job.request.headers.insert(
            FORWARD_BAG_HEADER.to_string(),
            r#"{"Cookie":"sid=abc","User-Agent":"render-bot"}"#.to_string(),
        );
        perform_fetch(&job, &test_client(), &[], None);

        let head = captured.lock().unwrap().to_ascii_lowercase();
        assert!(!head.contains("cookie: sid=abc"));
        assert!(head.contains("user-agent: render-bot"));
    }

    #[test]
    fn bridge_runs_request_end_to_end_and_clears_registry() {
        let (base, _) = spawn_responder("payload");
        let bridge = FetchBridge::new(
            BridgeConfig {
                worker_threads: 2,
                ..BridgeConfig::default()
            },
            None,
        )
        .expect("bridge");
        let sink = Arc::new(RecordingSink::default());
        let id = bridge.open(
            FetchRequest {
                url: format!("{}/x", base),
                ..FetchRequest::default()
            },
            sink.clone(),
        );
        assert!(id > 0);

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if sink
                .kinds()
                .last()
                .is_some_and(|k| *k == crate::EventKind::Finish)
            {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            sink.kinds(),
            vec![
                crate::EventKind::Start,
                crate::EventKind::Headers,
                crate::EventKind::End,
                crate::EventKind::Finish
            ]
        );
        let deadline = Instant::now() + Duration::from_secs(2);
        while bridge.in_flight() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(bridge.in_flight(), 0);
    }
}
