//! Extension inference from payload bytes.
//!
//! Magic-byte checks cover the media formats the protocol actually carries;
//! everything else falls through to a printable-text heuristic over the first
//! 2 KB with shape hints for common text formats.

const TEXT_HEAD_BYTES: usize = 2048;

/// Infer a file extension (without the dot) from payload bytes.
pub fn sniff_extension(buf: &[u8]) -> Option<&'static str> {
    if let Some(ext) = sniff_magic(buf) {
        return Some(ext);
    }
    sniff_text(buf)
}

fn sniff_magic(buf: &[u8]) -> Option<&'static str> {
    if buf.len() < 4 {
        return None;
    }
    if buf.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("jpg");
    }
    if buf.starts_with(&[0x89, b'P', b'N', b'G']) {
        return Some("png");
    }
    if buf.starts_with(b"GIF8") {
        return Some("gif");
    }
    if buf.starts_with(b"RIFF") && buf.len() >= 12 && &buf[8..12] == b"WAVE" {
        return Some("wav");
    }
    if buf.starts_with(b"#!AMR") {
        return Some("amr");
    }
    if buf.starts_with(b"OggS") {
        return Some("ogg");
    }
    if buf.starts_with(b"ID3") || (buf[0] == 0xFF && matches!(buf[1], 0xFB | 0xF3 | 0xF2)) {
        return Some("mp3");
    }
    if buf.len() >= 12 && &buf[4..8] == b"ftyp" {
        return Some("mp4");
    }
    None
}

fn sniff_text(buf: &[u8]) -> Option<&'static str> {
    let head = &buf[..buf.len().min(TEXT_HEAD_BYTES)];
    let text = match std::str::from_utf8(head) {
        Ok(text) => text,
        // A head cut mid-codepoint is still text; retry on the valid prefix.
        Err(e) if e.valid_up_to() > 0 => {
            std::str::from_utf8(&head[..e.valid_up_to()]).unwrap_or("")
        }
        Err(_) => return None,
    };
    if text.is_empty() {
        return None;
    }
    let printable = text
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .count();
    if (printable as f64) / (text.chars().count() as f64) < 0.9 {
        return None;
    }

    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Some("json");
    }
    if trimmed.starts_with("<?xml") || looks_like_xml(trimmed) {
        return Some("xml");
    }
    if text.starts_with("---\n") || text.starts_with("---\r\n") {
        return Some("md");
    }
    if trimmed.starts_with('#') || trimmed.contains("```") {
        return Some("md");
    }
    if let Some(ext) = sniff_columns(text) {
        return Some(ext);
    }
    Some("txt")
}

fn looks_like_xml(text: &str) -> bool {
    let mut chars = text.chars();
    if chars.next() != Some('<') {
        return false;
    }
    chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '/')
}

/// CSV/TSV detection: at least two lines sharing the same column count > 1.
fn sniff_columns(text: &str) -> Option<&'static str> {
    for (sep, ext) in [('\t', "tsv"), (',', "csv")] {
        let counts: Vec<usize> = text
            .lines()
            .take(5)
            .filter(|line| !line.is_empty())
            .map(|line| line.matches(sep).count())
            .collect();
        if counts.len() >= 2 && counts[0] >= 1 && counts.iter().all(|&c| c == counts[0]) {
            return Some(ext);
        }
    }
    None
}
