//! On-disk layout for per-route state.
//!
//! Everything a route owns lives under `<workspace>/qq_sessions/<route-dir>/`:
//!
//! ```text
//! agent.json                  route metadata
//! state.json                  conversation state
//! usage.json                  usage counters
//! in/files/                   materialized inbound media
//! out/files/                  outbound media snapshots
//! logs/chat-YYYY-MM-DD.ndjson
//! logs/trace-YYYY-MM-DD.ndjson
//! meta/task-state.json, task-lifecycle.ndjson, task-<key>.json
//! meta/automation-latest.json, automation-state.ndjson
//! meta/proactive-state.json
//! ```
//!
//! State files are written tmp-then-rename; lifecycle files are open-append.

use crate::route::route_dir_name;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Write a file atomically (tmp + rename) where the filesystem allows.
pub fn write_atomic(path: &Path, payload: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, payload)
        .with_context(|| format!("Failed to write temporary file: {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to rename into place: {}", path.display()))?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let rendered = serde_json::to_vec_pretty(value).context("Failed to serialize JSON")?;
    write_atomic(path, &rendered)
}

/// Read and deserialize a JSON file; `Ok(None)` when absent.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read: {}", path.display()))?;
    let value = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid JSON: {}", path.display()))?;
    Ok(Some(value))
}

/// Append one JSON line to an ndjson file.
pub fn append_ndjson<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(value).context("Failed to serialize ndjson line")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open for append: {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("Failed to append: {}", path.display()))?;
    Ok(())
}

/// Handle on the session tree for one workspace.
#[derive(Debug, Clone)]
pub struct RouteStore {
    sessions_root: PathBuf,
}

impl RouteStore {
    pub fn new(workspace_dir: &Path) -> Self {
        Self {
            sessions_root: workspace_dir.join("qq_sessions"),
        }
    }

    pub fn sessions_root(&self) -> &Path {
        &self.sessions_root
    }

    /// Directory for a route, migrating a legacy direct-form directory
    /// (route string used verbatim as the dir name) when one exists.
    pub fn route_dir(&self, route: &str) -> Result<PathBuf> {
        let dir = self.sessions_root.join(route_dir_name(route));
        if !dir.exists() {
            let legacy = self.sessions_root.join(route);
            // A verbatim route contains ':' and never equals the sanitized name.
            if legacy != dir && legacy.exists() {
                fs::rename(&legacy, &dir).map_err(|e| {
                    anyhow::anyhow!("migration_io_failed: {} -> {}: {e}", legacy.display(), dir.display())
                })?;
                tracing::info!(%route, "migrated legacy route directory");
            }
        }
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create route dir: {}", dir.display()))?;
        Ok(dir)
    }

    pub fn agent_file(&self, route: &str) -> Result<PathBuf> {
        Ok(self.route_dir(route)?.join("agent.json"))
    }

    pub fn state_file(&self, route: &str) -> Result<PathBuf> {
        Ok(self.route_dir(route)?.join("state.json"))
    }

    pub fn usage_file(&self, route: &str) -> Result<PathBuf> {
        Ok(self.route_dir(route)?.join("usage.json"))
    }

    pub fn in_files_dir(&self, route: &str) -> Result<PathBuf> {
        let dir = self.route_dir(route)?.join("in").join("files");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn out_files_dir(&self, route: &str) -> Result<PathBuf> {
        let dir = self.route_dir(route)?.join("out").join("files");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn logs_dir(&self, route: &str) -> Result<PathBuf> {
        let dir = self.route_dir(route)?.join("logs");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn meta_dir(&self, route: &str) -> Result<PathBuf> {
        let dir = self.route_dir(route)?.join("meta");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn read_activity(&self, route: &str) -> Result<ActivityRecord> {
        Ok(read_json(&self.meta_dir(route)?.join("activity.json"))?.unwrap_or_default())
    }

    pub fn note_inbound(&self, route: &str, at_ms: i64) -> Result<()> {
        let mut activity = self.read_activity(route)?;
        activity.last_inbound_at_ms = Some(at_ms);
        write_json_atomic(&self.meta_dir(route)?.join("activity.json"), &activity)
    }

    pub fn note_outbound(&self, route: &str, at_ms: i64) -> Result<()> {
        let mut activity = self.read_activity(route)?;
        activity.last_outbound_at_ms = Some(at_ms);
        write_json_atomic(&self.meta_dir(route)?.join("activity.json"), &activity)
    }
}

/// Last-seen traffic timestamps for a route; feeds the automation smart
/// throttle and the proactive nudge.
#[derive(Debug, Clone, Default, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub last_inbound_at_ms: Option<i64>,
    pub last_outbound_at_ms: Option<i64>,
}
