//! Inbound media source discovery.
//!
//! Each media-bearing segment (and each inline CQ code) becomes an
//! [`InboundMediaRef`]. A ref is resolved into an ordered candidate list by
//! probing protocol actions keyed by kind and by normalizing the segment's own
//! location fields. When a ref ends up with nothing usable (no candidates, or
//! only `file://` paths this process likely cannot read), the full message is
//! reloaded via `get_msg` and resolution retried with the fresh segment data.

use crate::config::{InboundMediaConfig, ResolvePrefer};
use crate::onebot::{ActionTransport, Segment};
use crate::trace::{TraceEvent, TraceLogger, TraceSource};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Image,
    Record,
    Video,
    File,
}

impl MediaKind {
    pub fn from_segment(kind: &str) -> Option<Self> {
        match kind {
            "image" => Some(Self::Image),
            "record" => Some(Self::Record),
            "video" => Some(Self::Video),
            "file" => Some(Self::File),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Record => "record",
            Self::Video => "video",
            Self::File => "file",
        }
    }

    /// Resolve actions for this kind, in probe order.
    fn actions(self) -> &'static [&'static str] {
        match self {
            Self::Image => &["get_image"],
            Self::Record => &["get_record"],
            Self::Video | Self::File => &["get_file", "download_file"],
        }
    }
}

/// One inbound media reference awaiting resolution.
#[derive(Debug, Clone)]
pub struct InboundMediaRef {
    pub kind: MediaKind,
    /// Protocol file id used as the action parameter.
    pub file_id: Option<String>,
    /// Location fields found directly on the segment, in field order.
    pub segment_sources: Vec<String>,
    pub name_hint: Option<String>,
    /// Position among same-kind refs in the message; used to re-match after
    /// a `get_msg` reload.
    pub position: usize,
}

/// Tagged source location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedCandidate {
    Http(String),
    File(String),
    Base64(String),
    Data(String),
    Stream(String),
    Unknown(String),
}

impl ResolvedCandidate {
    pub fn classify(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Self::Http(raw.to_string())
        } else if let Some(path) = raw.strip_prefix("file://") {
            Self::File(path.to_string())
        } else if raw.starts_with("base64://") {
            Self::Base64(raw.to_string())
        } else if raw.starts_with("data:") {
            Self::Data(raw.to_string())
        } else if raw.starts_with("stream://") {
            Self::Stream(raw.to_string())
        } else if raw.starts_with('/') {
            Self::File(raw.to_string())
        } else {
            Self::Unknown(raw.to_string())
        }
    }

    /// Canonical URL form fed to the materializer.
    pub fn source_url(&self) -> String {
        match self {
            Self::Http(url) | Self::Base64(url) | Self::Data(url) | Self::Stream(url)
            | Self::Unknown(url) => url.clone(),
            Self::File(path) => format!("file://{path}"),
        }
    }

    pub fn is_local_file(&self) -> bool {
        matches!(self, Self::File(_))
    }
}

const SOURCE_FIELDS: &[&str] = &[
    "url",
    "src",
    "download_url",
    "file",
    "path",
    "file_path",
    "local_path",
    "temp_file",
];

fn looks_like_location(value: &str) -> bool {
    value.contains("://") || value.starts_with('/') || value.starts_with("data:")
}

fn cq_code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[CQ:(image|video|record|file)((?:,[^\[\]]*)?)\]").unwrap())
}

fn refs_from_cq_text(text: &str, start_positions: &mut [usize; 4]) -> Vec<InboundMediaRef> {
    let mut refs = Vec::new();
    for captures in cq_code_regex().captures_iter(text) {
        let Some(kind) = MediaKind::from_segment(&captures[1]) else {
            continue;
        };
        let mut file_id = None;
        let mut sources = Vec::new();
        let mut name_hint = None;
        for pair in captures[2].split(',').filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key {
                "file" => {
                    if looks_like_location(value) {
                        sources.push(value.to_string());
                    } else {
                        file_id = Some(value.to_string());
                        name_hint.get_or_insert_with(|| value.to_string());
                    }
                }
                "url" | "src" => sources.push(value.to_string()),
                "name" => name_hint = Some(value.to_string()),
                _ => {}
            }
        }
        let slot = kind_slot(kind);
        refs.push(InboundMediaRef {
            kind,
            file_id,
            segment_sources: sources,
            name_hint,
            position: start_positions[slot],
        });
        start_positions[slot] += 1;
    }
    refs
}

fn kind_slot(kind: MediaKind) -> usize {
    match kind {
        MediaKind::Image => 0,
        MediaKind::Record => 1,
        MediaKind::Video => 2,
        MediaKind::File => 3,
    }
}

fn ref_from_segment(segment: &Segment, position: usize) -> Option<InboundMediaRef> {
    let kind = MediaKind::from_segment(&segment.kind)?;
    let mut sources = Vec::new();
    let mut file_id = None;
    for field in SOURCE_FIELDS {
        if let Some(value) = segment.str_field(field) {
            if value.is_empty() {
                continue;
            }
            if *field == "file" && !looks_like_location(value) {
                file_id = Some(value.to_string());
                continue;
            }
            if !sources.contains(&value.to_string()) {
                sources.push(value.to_string());
            }
        }
    }
    let name_hint = segment
        .str_field("name")
        .map(str::to_string)
        .or_else(|| file_id.clone());
    Some(InboundMediaRef {
        kind,
        file_id,
        segment_sources: sources,
        name_hint,
        position,
    })
}

/// Collect refs from structured segments and inline CQ codes, capped at
/// `max_per_message`.
pub fn collect_refs(segments: &[Segment], max_per_message: usize) -> Vec<InboundMediaRef> {
    let mut refs = Vec::new();
    let mut positions = [0usize; 4];
    for segment in segments {
        if let Some(kind) = MediaKind::from_segment(&segment.kind) {
            if let Some(mut media_ref) = ref_from_segment(segment, positions[kind_slot(kind)]) {
                media_ref.position = positions[kind_slot(kind)];
                positions[kind_slot(kind)] += 1;
                refs.push(media_ref);
            }
        } else if segment.kind == "text" {
            if let Some(text) = segment.str_field("text") {
                refs.extend(refs_from_cq_text(text, &mut positions));
            }
        }
        if refs.len() >= max_per_message {
            refs.truncate(max_per_message);
            break;
        }
    }
    refs
}

/// Probe an action's heterogeneous result shape for source locations.
/// `download_file_stream` results are tagged with the `stream://` scheme so
/// downstream stages can tell transport-staged payloads apart.
fn candidates_from_action_data(action: &str, data: &Value) -> Vec<ResolvedCandidate> {
    const RESULT_FIELDS: &[&str] = &["url", "file", "path", "file_path", "base64"];
    let mut candidates = Vec::new();
    for field in RESULT_FIELDS {
        let Some(value) = data.get(field).and_then(Value::as_str) else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        if *field == "base64" {
            candidates.push(ResolvedCandidate::Base64(format!("base64://{value}")));
            continue;
        }
        if action == "download_file_stream" && !value.contains("://") {
            candidates.push(ResolvedCandidate::Stream(format!("stream://{value}")));
            continue;
        }
        let candidate = ResolvedCandidate::classify(value);
        if !matches!(candidate, ResolvedCandidate::Unknown(_)) {
            candidates.push(candidate);
        }
    }
    candidates
}

pub struct MediaResolver<'a> {
    pub transport: &'a dyn ActionTransport,
    pub trace: &'a TraceLogger,
    pub config: &'a InboundMediaConfig,
}

impl<'a> MediaResolver<'a> {
    /// Resolve every ref of a message into ordered candidate lists.
    pub async fn resolve_message(
        &self,
        route: &str,
        msg_id: Option<i64>,
        segments: &[Segment],
    ) -> Vec<(InboundMediaRef, Vec<ResolvedCandidate>)> {
        let refs = collect_refs(segments, self.config.max_per_message);
        self.trace.emit(
            TraceEvent::new("qq_media_collect", route, TraceSource::Inbound)
                .msg_id(msg_id)
                .resolve("collect", None, Some(&format!("refs={}", refs.len()))),
        );
        if refs.is_empty() {
            return Vec::new();
        }

        let mut resolved = Vec::with_capacity(refs.len());
        let mut needs_reload = false;
        for media_ref in refs {
            let candidates = self.resolve_ref(route, msg_id, &media_ref).await;
            if candidates.is_empty() || candidates.iter().all(ResolvedCandidate::is_local_file) {
                needs_reload = true;
            }
            resolved.push((media_ref, candidates));
        }

        if needs_reload && self.config.fallback_get_msg {
            if let Some(msg_id) = msg_id {
                resolved = self.reload_and_retry(route, msg_id, resolved).await;
            }
        }
        resolved
    }

    async fn resolve_ref(
        &self,
        route: &str,
        msg_id: Option<i64>,
        media_ref: &InboundMediaRef,
    ) -> Vec<ResolvedCandidate> {
        let action_candidates = self.probe_actions(route, msg_id, media_ref).await;
        let segment_candidates: Vec<ResolvedCandidate> = media_ref
            .segment_sources
            .iter()
            .map(|raw| ResolvedCandidate::classify(raw))
            .collect();

        let mut ordered = match self.config.resolve_prefer {
            ResolvePrefer::NapcatFirst => [action_candidates, segment_candidates].concat(),
            ResolvePrefer::DirectFirst => [segment_candidates, action_candidates].concat(),
        };
        ordered.dedup_by_key(|c| c.source_url());
        ordered
    }

    async fn probe_actions(
        &self,
        route: &str,
        msg_id: Option<i64>,
        media_ref: &InboundMediaRef,
    ) -> Vec<ResolvedCandidate> {
        let Some(file_id) = &media_ref.file_id else {
            return Vec::new();
        };
        let mut actions: Vec<&str> = media_ref.kind.actions().to_vec();
        if self.config.use_stream {
            actions.push("download_file_stream");
        }

        let mut candidates = Vec::new();
        for action in actions {
            match self
                .transport
                .send_action(action, json!({ "file": file_id, "file_id": file_id }))
                .await
            {
                Ok(data) => {
                    let found = candidates_from_action_data(action, &data);
                    self.trace.emit(
                        TraceEvent::new("qq_media_resolve", route, TraceSource::Inbound)
                            .msg_id(msg_id)
                            .resolve(
                                "resolve",
                                Some(action),
                                Some(&format!("candidates={}", found.len())),
                            ),
                    );
                    if !found.is_empty() {
                        candidates.extend(found);
                        break;
                    }
                }
                Err(e) => {
                    self.trace.emit(
                        TraceEvent::new("qq_media_resolve", route, TraceSource::Inbound)
                            .msg_id(msg_id)
                            .resolve("resolve", Some(action), Some("resolve_action_failed"))
                            .error(&format!("{e:#}")),
                    );
                }
            }
        }
        candidates
    }

    async fn reload_and_retry(
        &self,
        route: &str,
        msg_id: i64,
        resolved: Vec<(InboundMediaRef, Vec<ResolvedCandidate>)>,
    ) -> Vec<(InboundMediaRef, Vec<ResolvedCandidate>)> {
        let reloaded = match self
            .transport
            .send_action("get_msg", json!({ "message_id": msg_id }))
            .await
        {
            Ok(data) => data,
            Err(e) => {
                self.trace.emit(
                    TraceEvent::new("qq_media_resolve", route, TraceSource::Inbound)
                        .msg_id(Some(msg_id))
                        .resolve("fallback_get_msg", Some("get_msg"), Some("resolve_action_failed"))
                        .error(&format!("{e:#}")),
                );
                return resolved;
            }
        };

        let segments: Vec<Segment> = reloaded
            .get("message")
            .and_then(Value::as_array)
            .map(|raw| {
                raw.iter()
                    .filter_map(|s| serde_json::from_value(s.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        let pool = collect_refs(&segments, self.config.max_per_message);
        self.trace.emit(
            TraceEvent::new("qq_media_resolve", route, TraceSource::Inbound)
                .msg_id(Some(msg_id))
                .resolve(
                    "fallback_get_msg",
                    Some("get_msg"),
                    Some(&format!("reloaded_refs={}", pool.len())),
                ),
        );

        let mut out = Vec::with_capacity(resolved.len());
        for (media_ref, candidates) in resolved {
            let usable =
                !candidates.is_empty() && !candidates.iter().all(ResolvedCandidate::is_local_file);
            if usable {
                out.push((media_ref, candidates));
                continue;
            }
            // Pool by kind, match by position.
            let replacement = pool
                .iter()
                .find(|p| p.kind == media_ref.kind && p.position == media_ref.position);
            match replacement {
                Some(fresh) => {
                    let retried = self.resolve_ref(route, Some(msg_id), fresh).await;
                    let merged = if retried.is_empty() { candidates } else { retried };
                    out.push((fresh.clone(), merged));
                }
                None => out.push((media_ref, candidates)),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RouteStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    struct StubTransport {
        responses: Mutex<std::collections::HashMap<String, Value>>,
        calls: Mutex<Vec<String>>,
    }

    impl StubTransport {
        fn new(responses: &[(&str, Value)]) -> Self {
            Self {
                responses: Mutex::new(
                    responses
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.clone()))
                        .collect(),
                ),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ActionTransport for StubTransport {
        async fn send_action(&self, action: &str, _params: Value) -> Result<Value> {
            self.calls.lock().push(action.to_string());
            self.responses
                .lock()
                .get(action)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("action {action} failed: unsupported"))
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn wait_until_connected(&self, _timeout: Duration) -> bool {
            true
        }
    }

    fn image_segment(file: &str) -> Segment {
        Segment {
            kind: "image".into(),
            data: json!({ "file": file }),
        }
    }

    fn trace_in(tmp: &TempDir) -> TraceLogger {
        TraceLogger::new(RouteStore::new(tmp.path()))
    }

    #[test]
    fn classify_covers_all_schemes() {
        assert_eq!(
            ResolvedCandidate::classify("https://x/y.jpg"),
            ResolvedCandidate::Http("https://x/y.jpg".into())
        );
        assert_eq!(
            ResolvedCandidate::classify("file:///tmp/a.png"),
            ResolvedCandidate::File("/tmp/a.png".into())
        );
        assert_eq!(
            ResolvedCandidate::classify("/var/media/a.png"),
            ResolvedCandidate::File("/var/media/a.png".into())
        );
        assert!(matches!(
            ResolvedCandidate::classify("base64://QUJD"),
            ResolvedCandidate::Base64(_)
        ));
        assert!(matches!(
            ResolvedCandidate::classify("data:image/png;base64,QUJD"),
            ResolvedCandidate::Data(_)
        ));
        assert!(matches!(
            ResolvedCandidate::classify("stream://chunk/1"),
            ResolvedCandidate::Stream(_)
        ));
        assert!(matches!(
            ResolvedCandidate::classify("xyz.jpg"),
            ResolvedCandidate::Unknown(_)
        ));
    }

    #[test]
    fn action_data_probing_covers_field_shapes() {
        let http = candidates_from_action_data("get_image", &json!({ "url": "https://x/a.jpg" }));
        assert_eq!(http, vec![ResolvedCandidate::Http("https://x/a.jpg".into())]);

        let local = candidates_from_action_data("get_file", &json!({ "file": "/cache/a.bin" }));
        assert_eq!(local, vec![ResolvedCandidate::File("/cache/a.bin".into())]);

        let b64 = candidates_from_action_data("get_record", &json!({ "base64": "QUJD" }));
        assert_eq!(
            b64,
            vec![ResolvedCandidate::Base64("base64://QUJD".into())]
        );

        let stream =
            candidates_from_action_data("download_file_stream", &json!({ "path": "tmp/chunk-1" }));
        assert_eq!(
            stream,
            vec![ResolvedCandidate::Stream("stream://tmp/chunk-1".into())]
        );

        // Bare file ids are not locations.
        let id_only = candidates_from_action_data("get_image", &json!({ "file": "abc.jpg" }));
        assert!(id_only.is_empty());
    }

    #[test]
    fn collect_refs_from_segments_and_cq_codes() {
        let segments = vec![
            image_segment("a.jpg"),
            Segment::text("看这个 [CQ:image,file=b.jpg,url=https://x/b.jpg] 如何"),
            Segment {
                kind: "file".into(),
                data: json!({ "file": "doc-id-1", "name": "报告.pdf" }),
            },
        ];
        let refs = collect_refs(&segments, 8);
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].kind, MediaKind::Image);
        assert_eq!(refs[0].position, 0);
        assert_eq!(refs[1].kind, MediaKind::Image);
        assert_eq!(refs[1].position, 1);
        assert_eq!(refs[1].segment_sources, vec!["https://x/b.jpg".to_string()]);
        assert_eq!(refs[2].name_hint.as_deref(), Some("报告.pdf"));
    }

    #[test]
    fn collect_refs_respects_cap() {
        let segments: Vec<Segment> = (0..12).map(|i| image_segment(&format!("{i}.jpg"))).collect();
        assert_eq!(collect_refs(&segments, 8).len(), 8);
    }

    #[tokio::test]
    async fn action_probe_result_comes_before_segment_fields() {
        let tmp = TempDir::new().unwrap();
        let stub = StubTransport::new(&[("get_image", json!({ "url": "https://cdn/x.jpg" }))]);
        let trace = trace_in(&tmp);
        let config = InboundMediaConfig::default();
        let resolver = MediaResolver {
            transport: &stub,
            trace: &trace,
            config: &config,
        };
        let segments = vec![Segment {
            kind: "image".into(),
            data: json!({ "file": "xyz.jpg", "url": "https://direct/x.jpg" }),
        }];
        let resolved = resolver.resolve_message("user:123456", Some(42), &segments).await;
        assert_eq!(resolved.len(), 1);
        let urls: Vec<String> = resolved[0].1.iter().map(|c| c.source_url()).collect();
        assert_eq!(urls[0], "https://cdn/x.jpg");
        assert!(urls.contains(&"https://direct/x.jpg".to_string()));
    }

    #[tokio::test]
    async fn get_msg_fallback_fires_when_only_local_files() {
        let tmp = TempDir::new().unwrap();
        let stub = StubTransport::new(&[(
            "get_msg",
            json!({
                "message": [
                    { "type": "image", "data": { "file": "xyz.jpg", "url": "https://cdn/fresh.jpg" } }
                ]
            }),
        )]);
        let trace = trace_in(&tmp);
        let config = InboundMediaConfig::default();
        let resolver = MediaResolver {
            transport: &stub,
            trace: &trace,
            config: &config,
        };
        let segments = vec![Segment {
            kind: "image".into(),
            data: json!({ "file": "xyz.jpg", "path": "/data/cache/xyz.jpg" }),
        }];
        let resolved = resolver.resolve_message("user:123456", Some(42), &segments).await;
        let urls: Vec<String> = resolved[0].1.iter().map(|c| c.source_url()).collect();
        assert!(
            urls.contains(&"https://cdn/fresh.jpg".to_string()),
            "fallback should surface the reloaded url, got {urls:?}"
        );
        assert!(stub.calls.lock().iter().any(|c| c == "get_msg"));
    }

    #[tokio::test]
    async fn failed_actions_fall_back_to_segment_fields() {
        let tmp = TempDir::new().unwrap();
        let stub = StubTransport::new(&[]);
        let trace = trace_in(&tmp);
        let config = InboundMediaConfig {
            fallback_get_msg: false,
            ..InboundMediaConfig::default()
        };
        let resolver = MediaResolver {
            transport: &stub,
            trace: &trace,
            config: &config,
        };
        let segments = vec![Segment {
            kind: "image".into(),
            data: json!({ "file": "xyz.jpg", "url": "https://direct/x.jpg" }),
        }];
        let resolved = resolver.resolve_message("user:123456", Some(1), &segments).await;
        assert_eq!(
            resolved[0].1,
            vec![ResolvedCandidate::Http("https://direct/x.jpg".into())]
        );
    }
}
