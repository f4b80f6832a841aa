//! Structured per-route diagnostics.
//!
//! Every stage appends trace events to the route's daily
//! `logs/trace-YYYY-MM-DD.ndjson`; normalized chat lines go to
//! `logs/chat-YYYY-MM-DD.ndjson`. Appends are best-effort: a failed write is
//! logged and never fails the caller.

use crate::errors::DropReason;
use crate::store::{append_ndjson, RouteStore};
use crate::util::truncate_with_ellipsis;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceSource {
    Chat,
    Automation,
    Inbound,
}

/// One trace line. Optional fields stay off the wire when unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub event: String,
    pub route: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<String>,
    pub source: TraceSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolve_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolve_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolve_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub materialize_error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drop_reason: Option<DropReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: String,
}

impl TraceEvent {
    pub fn new(event: &str, route: &str, source: TraceSource) -> Self {
        Self {
            event: event.to_string(),
            route: route.to_string(),
            msg_id: None,
            dispatch_id: None,
            attempt_id: None,
            source,
            resolve_stage: None,
            resolve_action: None,
            resolve_result: None,
            materialize_error_code: None,
            drop_reason: None,
            retry_count: None,
            http_status: None,
            duration_ms: None,
            error: None,
            at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn msg_id(mut self, msg_id: Option<i64>) -> Self {
        self.msg_id = msg_id;
        self
    }

    pub fn dispatch_id(mut self, id: &str) -> Self {
        self.dispatch_id = Some(id.to_string());
        self
    }

    pub fn attempt_id(mut self, id: &str) -> Self {
        self.attempt_id = Some(id.to_string());
        self
    }

    pub fn drop_reason(mut self, reason: DropReason) -> Self {
        self.drop_reason = Some(reason);
        self
    }

    pub fn resolve(mut self, stage: &str, action: Option<&str>, result: Option<&str>) -> Self {
        self.resolve_stage = Some(stage.to_string());
        self.resolve_action = action.map(str::to_string);
        self.resolve_result = result.map(str::to_string);
        self
    }

    pub fn error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatLine {
    direction: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    msg_id: Option<i64>,
    at: String,
}

/// Redact internal host markers from outbound-visible text.
pub fn redact_hosts(text: &str) -> String {
    static IPV4: OnceLock<Regex> = OnceLock::new();
    let ipv4 = IPV4.get_or_init(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap());

    let mut out = text.replace("host.docker.internal", "[internal-host]");
    out = out.replace("localhost", "[internal-host]");
    ipv4.replace_all(&out, "[internal-host]").into_owned()
}

/// Per-route ndjson appender.
#[derive(Debug, Clone)]
pub struct TraceLogger {
    store: RouteStore,
}

impl TraceLogger {
    pub fn new(store: RouteStore) -> Self {
        Self { store }
    }

    pub fn emit(&self, event: TraceEvent) {
        let route = event.route.clone();
        let result = self.store.logs_dir(&route).and_then(|dir| {
            let day = chrono::Utc::now().format("%Y-%m-%d");
            append_ndjson(&dir.join(format!("trace-{day}.ndjson")), &event)
        });
        if let Err(e) = result {
            tracing::warn!(%route, "trace append failed: {e:#}");
        }
    }

    /// Record a normalized chat line. Outbound content passes the redactor
    /// and is summarized to keep the file scannable.
    pub fn chat(&self, route: &str, direction: &str, content: &str, msg_id: Option<i64>) {
        let content = if direction == "out" {
            redact_hosts(content)
        } else {
            content.to_string()
        };
        let line = ChatLine {
            direction: direction.to_string(),
            content: truncate_with_ellipsis(&content, 500),
            msg_id,
            at: chrono::Utc::now().to_rfc3339(),
        };
        let result = self.store.logs_dir(route).and_then(|dir| {
            let day = chrono::Utc::now().format("%Y-%m-%d");
            append_ndjson(&dir.join(format!("chat-{day}.ndjson")), &line)
        });
        if let Err(e) = result {
            tracing::warn!(%route, "chat append failed: {e:#}");
        }
    }
}
