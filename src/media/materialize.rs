//! Fetch inbound media bytes and persist them with deterministic names.
//!
//! Sources arrive as an ordered candidate list per media ref. Each payload is
//! content-hashed (SHA-1) so one batch never writes the same bytes twice, the
//! extension is inferred (original name, then URL, then magic bytes, then
//! `.bin`), and the file lands as `<ts>-<index>-<sanitized-name>.<ext>`.

use crate::errors::DropReason;
use crate::media::sniff::sniff_extension;
use base64::Engine;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NameSource {
    Hint,
    Url,
    Download,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtSource {
    Original,
    Url,
    Buffer,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct MaterializeOutcome {
    pub url: String,
    pub output_path: Option<PathBuf>,
    pub materialized: bool,
    pub error_code: Option<DropReason>,
    pub http_status: Option<u16>,
    pub retry_count: Option<u32>,
    pub original_filename: Option<String>,
    pub final_filename: Option<String>,
    pub name_source: NameSource,
    pub ext_source: ExtSource,
}

impl MaterializeOutcome {
    fn failed(url: &str, code: DropReason) -> Self {
        Self {
            url: url.to_string(),
            output_path: None,
            materialized: false,
            error_code: Some(code),
            http_status: None,
            retry_count: None,
            original_filename: None,
            final_filename: None,
            name_source: NameSource::Fallback,
            ext_source: ExtSource::Fallback,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MaterializeRequest {
    pub url: String,
    pub name_hint: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct MaterializeOptions {
    pub http_timeout_ms: u64,
    pub http_retries: u32,
}

/// Strip a name down to a safe basename: NFKC-normalized, no path components,
/// control characters and `<>:"/\|?*` replaced with `_`.
pub fn sanitize_filename(raw: &str) -> String {
    let base = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(raw)
        .nfkc()
        .collect::<String>();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches(['.', ' ']).to_string();
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed
    }
}

fn split_name_ext(name: &str) -> (String, Option<String>) {
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && (1..=8).contains(&ext.len())
                && ext.bytes().all(|b| b.is_ascii_alphanumeric()) =>
        {
            (stem.to_string(), Some(ext.to_ascii_lowercase()))
        }
        _ => (name.to_string(), None),
    }
}

fn url_basename(url: &str) -> Option<String> {
    let no_query = url.split(['?', '#']).next().unwrap_or(url);
    let base = no_query.rsplit('/').next()?;
    let decoded = base.trim();
    (!decoded.is_empty() && decoded.contains('.')).then(|| decoded.to_string())
}

enum FetchOutcome {
    Bytes {
        payload: Vec<u8>,
        content_name: Option<String>,
    },
    Failed {
        code: DropReason,
        http_status: Option<u16>,
        retry_count: Option<u32>,
    },
}

async fn fetch_source(
    http: &reqwest::Client,
    url: &str,
    options: MaterializeOptions,
) -> FetchOutcome {
    if let Some(path) = url.strip_prefix("file://") {
        return fetch_local(Path::new(path)).await;
    }
    if let Some(encoded) = url.strip_prefix("base64://") {
        return decode_base64(encoded);
    }
    if url.starts_with("data:") {
        let encoded = url.split(',').nth(1).unwrap_or("");
        return decode_base64(encoded);
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return fetch_http(http, url, options).await;
    }
    FetchOutcome::Failed {
        code: DropReason::UnsupportedSource,
        http_status: None,
        retry_count: None,
    }
}

async fn fetch_local(path: &Path) -> FetchOutcome {
    match tokio::fs::read(path).await {
        Ok(payload) => FetchOutcome::Bytes {
            payload,
            content_name: None,
        },
        Err(e) => {
            let code = match e.kind() {
                std::io::ErrorKind::NotFound => DropReason::FileNotFound,
                // EACCES/EPERM/ENOTDIR on absolute paths: readable by the
                // protocol process but not by this one.
                _ => DropReason::ContainerLocalUnreadable,
            };
            FetchOutcome::Failed {
                code,
                http_status: None,
                retry_count: None,
            }
        }
    }
}

fn decode_base64(encoded: &str) -> FetchOutcome {
    match base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
        Ok(payload) if !payload.is_empty() => FetchOutcome::Bytes {
            payload,
            content_name: None,
        },
        Ok(_) => FetchOutcome::Failed {
            code: DropReason::MaterializeEmptyPayload,
            http_status: None,
            retry_count: None,
        },
        Err(_) => FetchOutcome::Failed {
            code: DropReason::UnsupportedSource,
            http_status: None,
            retry_count: None,
        },
    }
}

async fn fetch_http(
    http: &reqwest::Client,
    url: &str,
    options: MaterializeOptions,
) -> FetchOutcome {
    let timeout = Duration::from_millis(options.http_timeout_ms);
    let mut last_status = None;
    for attempt in 0..=options.http_retries {
        if attempt > 0 {
            // Linear backoff: 150ms, 300ms, ...
            tokio::time::sleep(Duration::from_millis(150 * u64::from(attempt))).await;
        }
        let response = match http.get(url).timeout(timeout).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("media fetch attempt {attempt} failed: {e}");
                continue;
            }
        };
        let status = response.status();
        last_status = Some(status.as_u16());
        if !status.is_success() {
            continue;
        }
        let content_name = response
            .headers()
            .get("content-disposition")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_disposition_filename);
        match response.bytes().await {
            Ok(body) if body.is_empty() => {
                return FetchOutcome::Failed {
                    code: DropReason::MaterializeEmptyPayload,
                    http_status: last_status,
                    retry_count: Some(attempt),
                }
            }
            Ok(body) => {
                return FetchOutcome::Bytes {
                    payload: body.to_vec(),
                    content_name,
                }
            }
            Err(e) => {
                tracing::debug!("media body read failed: {e}");
                continue;
            }
        }
    }
    FetchOutcome::Failed {
        code: DropReason::MaterializeHttpFailed,
        http_status: last_status,
        retry_count: Some(options.http_retries),
    }
}

fn parse_disposition_filename(value: &str) -> Option<String> {
    let marker = value.find("filename=")?;
    let rest = &value[marker + "filename=".len()..];
    let name = rest.split(';').next()?.trim().trim_matches('"');
    (!name.is_empty()).then(|| name.to_string())
}

/// Materialize an ordered batch of sources into `dest_dir`.
///
/// One outcome per request, in order. Payloads already seen in this batch are
/// skipped with `duplicate_payload`.
pub async fn materialize_batch(
    http: &reqwest::Client,
    requests: &[MaterializeRequest],
    dest_dir: &Path,
    options: MaterializeOptions,
) -> Vec<MaterializeOutcome> {
    let mut seen_hashes: HashSet<[u8; 20]> = HashSet::new();
    let mut outcomes = Vec::with_capacity(requests.len());
    let batch_ts = crate::util::now_ms();

    for (index, request) in requests.iter().enumerate() {
        let fetched = fetch_source(http, &request.url, options).await;
        let (payload, content_name) = match fetched {
            FetchOutcome::Bytes {
                payload,
                content_name,
            } => (payload, content_name),
            FetchOutcome::Failed {
                code,
                http_status,
                retry_count,
            } => {
                let mut outcome = MaterializeOutcome::failed(&request.url, code);
                outcome.http_status = http_status;
                outcome.retry_count = retry_count;
                outcomes.push(outcome);
                continue;
            }
        };

        let digest: [u8; 20] = Sha1::digest(&payload).into();
        if !seen_hashes.insert(digest) {
            outcomes.push(MaterializeOutcome::failed(
                &request.url,
                DropReason::DuplicatePayload,
            ));
            continue;
        }

        let (name, name_source) = if let Some(hint) = &request.name_hint {
            (hint.clone(), NameSource::Hint)
        } else if let Some(from_disposition) = content_name {
            (from_disposition, NameSource::Download)
        } else if let Some(from_url) = url_basename(&request.url) {
            (from_url, NameSource::Url)
        } else {
            ("media".to_string(), NameSource::Fallback)
        };

        let sanitized = sanitize_filename(&name);
        let (stem, original_ext) = split_name_ext(&sanitized);
        let (ext, ext_source) = if let Some(ext) = original_ext {
            (ext, ExtSource::Original)
        } else if let Some(ext) = url_basename(&request.url)
            .map(|base| split_name_ext(&sanitize_filename(&base)))
            .and_then(|(_, ext)| ext)
        {
            (ext, ExtSource::Url)
        } else if let Some(ext) = sniff_extension(&payload) {
            (ext.to_string(), ExtSource::Buffer)
        } else {
            ("bin".to_string(), ExtSource::Fallback)
        };

        let final_name = format!("{batch_ts}-{index}-{stem}.{ext}");
        let output_path = dest_dir.join(&final_name);
        if let Err(e) = tokio::fs::create_dir_all(dest_dir).await {
            tracing::warn!("materialize mkdir failed: {e}");
        }
        match tokio::fs::write(&output_path, &payload).await {
            Ok(()) => outcomes.push(MaterializeOutcome {
                url: request.url.clone(),
                output_path: Some(output_path),
                materialized: true,
                error_code: None,
                http_status: None,
                retry_count: None,
                original_filename: Some(name),
                final_filename: Some(final_name),
                name_source,
                ext_source,
            }),
            Err(e) => {
                tracing::warn!("materialize write failed: {e}");
                outcomes.push(MaterializeOutcome::failed(
                    &request.url,
                    DropReason::UnknownError,
                ));
            }
        }
    }
    outcomes
}
