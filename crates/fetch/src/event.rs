//! Lifecycle events emitted while an outbound fetch progresses.
//!
//! For a given request id the delivery order is always
//! `start → headers → (end | error) → finish`, with `finish` last on every
//! path including abort. Events are transient: built per transition,
//! serialized to JSON, and handed to the owning unit's event sink.

use std::collections::HashMap;

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Headers,
    End,
    Error,
    Finish,
}

#[derive(Clone, Debug, Serialize)]
pub struct FetchEvent {
    pub request_id: u64,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FetchEvent {
    fn bare(request_id: u64, kind: EventKind) -> Self {
        Self {
            request_id,
            kind,
            status: None,
            headers: None,
            body: None,
            message: None,
        }
    }

    pub fn start(request_id: u64) -> Self {
        Self::bare(request_id, EventKind::Start)
    }

    pub fn headers(request_id: u64, status: u16, headers: HashMap<String, String>) -> Self {
        Self {
            status: Some(status),
            headers: Some(headers),
            ..Self::bare(request_id, EventKind::Headers)
        }
    }

    pub fn end(request_id: u64, body: String) -> Self {
        Self {
            body: Some(body),
            ..Self::bare(request_id, EventKind::End)
        }
    }

    pub fn error(request_id: u64, message: String) -> Self {
        Self {
            message: Some(message),
            ..Self::bare(request_id, EventKind::Error)
        }
    }

    pub fn finish(request_id: u64) -> Self {
        Self::bare(request_id, EventKind::Finish)
    }
}

/// Receiver of fetch events, implemented by the execution unit that opened
/// the request. Delivery must preserve per-request program order; the sink
/// is responsible for queueing when its script context is busy.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &FetchEvent) -> Result<(), String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_json_omits_absent_fields() {
        let evt = FetchEvent::start(7);
        let json = serde_json::to_value(&evt).expect("serialize");
        assert_eq!(json["request_id"], 7);
        assert_eq!(json["kind"], "start");
        assert!(json.get("status").is_none());
        assert!(json.get("body").is_none());
    }

    #[test]
    fn headers_event_carries_status_and_map() {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "text/html".to_string());
        let evt = FetchEvent::headers(3, 200, headers);
        let json = serde_json::to_value(&evt).expect("serialize");
        assert_eq!(json["kind"], "headers");
        assert_eq!(json["status"], 200);
        assert_eq!(json["headers"]["Content-Type"], "text/html");
    }
}
