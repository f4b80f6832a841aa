//! Reply payload normalization.
//!
//! Agent replies arrive as free text plus optional media references. Before
//! anything reaches the wire the text is scrubbed (markdown stripping in
//! anti-risk mode, internal-host redaction, leak guards), inline `MEDIA:`
//! markers move into the media list, and the remainder is chunked to the
//! configured message length.

use crate::agent::ReplyPayload;
use crate::media::resolver::MediaKind;
use crate::trace::redact_hosts;
use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMediaItem {
    pub url: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedReply {
    pub chunks: Vec<String>,
    pub media: Vec<OutboundMediaItem>,
}

/// Classify a media source by its extension.
pub fn classify_media_kind(url: &str) -> MediaKind {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path
        .rsplit('.')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" => MediaKind::Image,
        "wav" | "amr" | "mp3" | "ogg" | "silk" | "flac" => MediaKind::Record,
        "mp4" | "avi" | "mkv" | "mov" | "webm" => MediaKind::Video,
        _ => MediaKind::File,
    }
}

fn media_marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*MEDIA:\s*(.+)$").unwrap())
}

fn link_defang_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(https?://)(\S)").unwrap())
}

/// Strip light markdown and de-fang links so risk filters on the consumer
/// network do not eat the message.
pub fn strip_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        let line = line.trim_start_matches('#').trim_start();
        out.push_str(line);
        out.push('\n');
    }
    let out = out.replace("**", "").replace('*', "").replace('`', "");
    link_defang_regex().replace_all(&out, "$1 $2").into_owned()
}

/// Split text into chunks of at most `max_chars` characters.
pub fn split_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0usize;
    for ch in text.chars() {
        if count == max_chars {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(ch);
        count += 1;
    }
    if !current.trim().is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks.retain(|c| !c.trim().is_empty());
    chunks
}

fn split_by_lines(text: &str) -> Option<Vec<String>> {
    let mut distinct: Vec<String> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !distinct.iter().any(|seen| seen == line) {
            distinct.push(line.to_string());
        }
    }
    (2..=12).contains(&distinct.len()).then_some(distinct)
}

/// Normalize one reply payload into send-ready chunks and media items.
pub fn normalize_reply(
    payload: &ReplyPayload,
    max_message_length: usize,
    anti_risk: bool,
    split_send_requested: bool,
) -> NormalizedReply {
    let mut media: Vec<String> = Vec::new();
    if let Some(url) = &payload.media_url {
        media.push(url.clone());
    }
    media.extend(payload.media_urls.iter().cloned());
    media.extend(payload.files.iter().cloned());

    let raw_text = payload.text.clone().unwrap_or_default();
    for captures in media_marker_regex().captures_iter(&raw_text) {
        media.push(captures[1].trim().to_string());
    }
    let mut text = media_marker_regex().replace_all(&raw_text, "").into_owned();

    if anti_risk {
        text = strip_markdown(&text);
    }
    text = redact_hosts(&text);
    let text = text.trim();

    let chunks = if text.is_empty() {
        Vec::new()
    } else if split_send_requested {
        match split_by_lines(text) {
            Some(lines) => lines,
            None => split_chunks(text, max_message_length),
        }
    } else {
        split_chunks(text, max_message_length)
    };

    media.dedup();
    NormalizedReply {
        chunks,
        media: media
            .into_iter()
            .filter(|url| !url.trim().is_empty())
            .map(|url| OutboundMediaItem {
                kind: classify_media_kind(&url),
                url,
            })
            .collect(),
    }
}

// ── Leak guards ───────────────────────────────────────────────────

const SKIP_TOKENS: &[&str] = &[
    "QQ_AUTO_SKIP",
    "ANNOUNCE_SKIP",
    "NO_REPLY",
    "HEARTBEAT_SKIP",
];

const META_MARKERS: &[&str] = &[
    "Subagent failed",
    "Process still running",
    "cron job",
    "scheduled task notice",
    "system notice:",
];

fn abort_leak_regex_strict() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(request|operation) was aborted$").unwrap())
}

fn abort_leak_regex_loose() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(request|operation) was aborted").unwrap())
}

/// Reject a chunk that would leak scheduler/automation control chatter.
pub fn is_meta_leak(chunk: &str) -> bool {
    let trimmed = chunk.trim();
    SKIP_TOKENS.iter().any(|token| trimmed.contains(token))
        || META_MARKERS
            .iter()
            .any(|marker| trimmed.to_lowercase().contains(&marker.to_lowercase()))
}

/// Reject a chunk that leaks an internal abort message. Strict mode matches
/// the whole chunk; loose mode matches anywhere.
pub fn is_abort_leak(chunk: &str, strict: bool) -> bool {
    let trimmed = chunk.trim();
    if strict {
        abort_leak_regex_strict().is_match(trimmed)
    } else {
        abort_leak_regex_loose().is_match(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(text: &str) -> ReplyPayload {
        ReplyPayload {
            text: Some(text.to_string()),
            ..ReplyPayload::default()
        }
    }

    #[test]
    fn media_markers_move_into_media_list() {
        let reply = normalize_reply(
            &payload("看这张图\nMEDIA: /tmp/a.png\n好看吗"),
            4000,
            false,
            false,
        );
        assert_eq!(reply.chunks, vec!["看这张图\n\n好看吗".to_string()]);
        assert_eq!(reply.media.len(), 1);
        assert_eq!(reply.media[0].url, "/tmp/a.png");
        assert_eq!(reply.media[0].kind, MediaKind::Image);
    }

    #[test]
    fn classify_by_extension() {
        assert_eq!(classify_media_kind("a.JPG"), MediaKind::Image);
        assert_eq!(classify_media_kind("https://x/y.wav?sig=1"), MediaKind::Record);
        assert_eq!(classify_media_kind("clip.mp4"), MediaKind::Video);
        assert_eq!(classify_media_kind("doc.pdf"), MediaKind::File);
        assert_eq!(classify_media_kind("no-extension"), MediaKind::File);
    }

    #[test]
    fn long_text_is_chunked_on_char_boundaries() {
        let text = "好".repeat(9_000);
        let chunks = split_chunks(&text, 4_000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chars().count(), 4_000);
        assert_eq!(chunks[2].chars().count(), 1_000);
    }

    #[test]
    fn split_send_uses_lines_when_shape_fits() {
        let reply = normalize_reply(&payload("第一行\n第二行\n第三行"), 4000, false, true);
        assert_eq!(reply.chunks.len(), 3);
        // One line (or >12) falls back to plain chunking.
        let reply = normalize_reply(&payload("只有一行"), 4000, false, true);
        assert_eq!(reply.chunks.len(), 1);
    }

    #[test]
    fn split_send_dedups_repeated_lines() {
        let reply = normalize_reply(&payload("a\na\nb"), 4000, false, true);
        assert_eq!(reply.chunks, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn anti_risk_strips_markdown_and_defangs_links() {
        let reply = normalize_reply(
            &payload("# 标题\n**加粗** 和 `代码` 以及 https://example.com/x"),
            4000,
            true,
            false,
        );
        let text = &reply.chunks[0];
        assert!(!text.contains('#'));
        assert!(!text.contains("**"));
        assert!(!text.contains('`'));
        assert!(text.contains("https:// example.com/x"));
    }

    #[test]
    fn sanitize_is_idempotent() {
        let first = normalize_reply(&payload("**粗体** https://a.b/c"), 4000, true, false);
        let second = normalize_reply(&payload(&first.chunks[0]), 4000, true, false);
        assert_eq!(first.chunks, second.chunks);
    }

    #[test]
    fn internal_hosts_are_redacted() {
        let reply = normalize_reply(
            &payload("fetch http://host.docker.internal:8080/x"),
            4000,
            false,
            false,
        );
        assert!(!reply.chunks[0].contains("host.docker.internal"));
    }

    #[test]
    fn leak_guards_catch_control_chatter() {
        assert!(is_meta_leak("QQ_AUTO_SKIP"));
        assert!(is_meta_leak("  NO_REPLY  "));
        assert!(is_meta_leak("Subagent failed with code 1"));
        assert!(!is_meta_leak("正常的回复内容"));

        assert!(is_abort_leak("Request was aborted", true));
        assert!(!is_abort_leak("the request was aborted early", true));
        assert!(is_abort_leak("the request was aborted early", false));
    }
}
