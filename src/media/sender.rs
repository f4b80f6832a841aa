//! Outbound media sending.
//!
//! Every outbound media item is snapshotted into the route's `out/files`
//! directory (so the source survives the async send), gated by the path
//! allowlist, and then offered to the protocol through an ordered candidate
//! list: stream upload, relay URL, the raw source, and finally an inline
//! base64 body. The first candidate the protocol accepts wins.

use crate::config::{AccountConfig, StreamPrefer};
use crate::errors::DropReason;
use crate::media::relay::RelaySigner;
use crate::media::resolver::MediaKind;
use crate::onebot::ActionTransport;
use crate::outbound::normalize::OutboundMediaItem;
use crate::outbound::queue::{send_with_retry, MediaDedupWindow, SendError};
use crate::route::Target;
use crate::store::RouteStore;
use anyhow::{Context, Result};
use base64::Engine;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};

/// Canonical-path allowlist gate for local media sources.
#[derive(Debug, Clone)]
pub struct PathPolicy {
    allowed_roots: Vec<PathBuf>,
}

impl PathPolicy {
    pub fn for_account(workspace_dir: &Path, account: &AccountConfig) -> Self {
        let mut allowed_roots = vec![
            workspace_dir.to_path_buf(),
            workspace_dir.join("skills"),
            workspace_dir.join("qq_sessions"),
        ];
        if let Some(voice) = &account.voice_base_path {
            allowed_roots.push(voice.clone());
        }
        allowed_roots.extend(account.media_path_allowlist.iter().cloned());
        Self { allowed_roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.allowed_roots
    }

    /// The canonicalized real path must sit under one of the allowed roots.
    pub fn check(&self, path: &Path) -> Result<PathBuf, DropReason> {
        let real = path
            .canonicalize()
            .map_err(|_| DropReason::PathOutsideAllowlist)?;
        for root in &self.allowed_roots {
            if let Ok(root) = root.canonicalize() {
                if real.starts_with(&root) {
                    return Ok(real);
                }
            }
        }
        Err(DropReason::PathOutsideAllowlist)
    }
}

fn local_path_of(url: &str) -> Option<PathBuf> {
    if let Some(path) = url.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    url.starts_with('/').then(|| PathBuf::from(url))
}

fn segment_for(kind: MediaKind, file: &str) -> Value {
    json!({ "type": kind.as_str(), "data": { "file": file } })
}

fn send_action_for(target: &Target, segment: Value) -> (&'static str, Value) {
    match target {
        Target::User { id } => (
            "send_private_msg",
            json!({ "user_id": id, "message": [segment] }),
        ),
        Target::Group { id } => (
            "send_group_msg",
            json!({ "group_id": id, "message": [segment] }),
        ),
        Target::Guild {
            guild_id,
            channel_id,
        } => (
            "send_guild_channel_msg",
            json!({ "guild_id": guild_id, "channel_id": channel_id, "message": [segment] }),
        ),
    }
}

pub struct MediaSendRequest<'a> {
    pub route: &'a str,
    pub item: &'a OutboundMediaItem,
    pub dedup_window: &'a MediaDedupWindow,
    pub preflight: Option<&'a (dyn Fn() -> Result<(), DropReason> + Send + Sync)>,
}

pub struct MediaSender<'a> {
    pub transport: &'a dyn ActionTransport,
    pub store: &'a RouteStore,
    pub account: &'a AccountConfig,
    pub path_policy: &'a PathPolicy,
    pub relay: Option<&'a RelaySigner>,
}

impl<'a> MediaSender<'a> {
    /// Snapshot a locally-resolvable source into `out/files` so it survives
    /// the async send window.
    fn snapshot_local(&self, route: &str, source: &Path) -> Result<PathBuf> {
        let out_dir = self.store.out_files_dir(route)?;
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "media.bin".to_string());
        let dest = out_dir.join(format!("{}-{name}", crate::util::now_ms()));
        std::fs::copy(source, &dest)
            .with_context(|| format!("snapshot failed: {}", source.display()))?;
        Ok(dest)
    }

    fn build_candidates(&self, local: Option<&Path>, raw_url: &str) -> Vec<String> {
        let mut stream_candidate = None;
        let mut relay_candidate = None;
        let mut base64_candidate = None;

        if let Some(local) = local {
            if self.account.media_relay.stream_transport_enabled {
                stream_candidate = Some(format!("stream://{}", local.display()));
            }
            if let Some(relay) = self.relay {
                relay_candidate = Some(relay.sign(local));
            }
            if let Ok(payload) = std::fs::read(local) {
                base64_candidate = Some(format!(
                    "base64://{}",
                    base64::engine::general_purpose::STANDARD.encode(payload)
                ));
            }
        }

        let raw = local
            .map(|p| format!("file://{}", p.display()))
            .unwrap_or_else(|| raw_url.to_string());

        let mut candidates = Vec::new();
        match self.account.media_relay.stream_transport_prefer {
            StreamPrefer::StreamFirst => {
                candidates.extend(stream_candidate);
                candidates.extend(relay_candidate);
            }
            StreamPrefer::HttpFirst => {
                candidates.extend(relay_candidate);
                candidates.extend(stream_candidate);
            }
        }
        candidates.push(raw);
        candidates.extend(base64_candidate);
        candidates
    }

    /// Upload a local file through the stream transport; the returned file id
    /// replaces the `stream://` placeholder in the outgoing segment.
    async fn upload_stream(&self, local: &Path) -> Result<String> {
        let data = self
            .transport
            .send_action(
                "upload_file_stream",
                json!({ "path": local.display().to_string() }),
            )
            .await?;
        data.get("file")
            .or_else(|| data.get("file_id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("upload_file_stream returned no file id"))
    }

    /// Send one media item. Returns the candidate that succeeded.
    pub async fn send(&self, request: MediaSendRequest<'_>) -> Result<String, DropReason> {
        let target =
            crate::route::parse_target(request.route).ok_or(DropReason::UnknownError)?;

        let mut local: Option<PathBuf> = None;
        if let Some(source) = local_path_of(&request.item.url) {
            let real = self.path_policy.check(&source)?;
            local = Some(
                self.snapshot_local(request.route, &real)
                    .map_err(|e| {
                        tracing::warn!("media snapshot failed: {e:#}");
                        DropReason::UnknownError
                    })?,
            );
        }

        let item_key = {
            let mut hasher = Sha1::new();
            hasher.update(request.route.as_bytes());
            hasher.update(request.item.url.as_bytes());
            format!("{}|{:x}", request.route, hasher.finalize())
        };

        let candidates = self.build_candidates(local.as_deref(), &request.item.url);
        let mut last_drop = DropReason::UnknownError;
        for (candidate_idx, candidate) in candidates.into_iter().enumerate() {
            // Keyed per candidate so a definitively-failed transport still
            // lets the next candidate try, while a re-submitted task inside
            // the window is suppressed candidate-by-candidate.
            let dedup_key = format!("{item_key}|{candidate_idx}");
            let file_field = if let Some(path) = candidate.strip_prefix("stream://") {
                match self.upload_stream(Path::new(path)).await {
                    Ok(file_id) => file_id,
                    Err(e) => {
                        tracing::debug!("stream upload failed, next candidate: {e:#}");
                        continue;
                    }
                }
            } else {
                candidate.clone()
            };

            let segment = segment_for(request.item.kind, &file_field);
            let (action, params) = send_action_for(&target, segment);
            match send_with_retry(
                self.transport,
                &self.account.send,
                action,
                params,
                request.preflight,
                Some((request.dedup_window, &dedup_key)),
            )
            .await
            {
                Ok(_) => {
                    if let Some(local) = &local {
                        cleanup_transient_voice(local);
                    }
                    return Ok(candidate);
                }
                // Already attempted inside the dedup window: stop without
                // double-sending, and without claiming success.
                Err(SendError::Dropped(DropReason::DuplicatePayload)) => {
                    return Err(DropReason::DuplicatePayload)
                }
                Err(SendError::Dropped(reason)) => return Err(reason),
                Err(SendError::Failed(e)) => {
                    tracing::debug!("media candidate failed: {e:#}");
                    last_drop = DropReason::UnknownError;
                }
            }
        }
        Err(last_drop)
    }
}

/// Generated voice files are transient; drop them once delivered.
fn cleanup_transient_voice(path: &Path) {
    let is_voice = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("voice-") && n.ends_with(".wav"));
    if is_voice {
        let _ = std::fs::remove_file(path);
    }
}
