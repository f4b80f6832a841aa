//! Optional local HTTP relay for outbound media.
//!
//! Some protocol implementations cannot read `file://` sources from this
//! process. The relay serves whitelisted local files over loopback HTTP using
//! HMAC-SHA256-signed, time-limited URLs, so a `file://` candidate can be
//! offered as `http://<host>:<port>/relay/fetch?...` instead.

use crate::config::MediaRelayConfig;
use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::path::{Path, PathBuf};
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return None;
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).ok())
        .collect()
}

/// Signs and verifies relay URLs.
#[derive(Clone)]
pub struct RelaySigner {
    secret: String,
    host: String,
    port: u16,
    base_path: String,
    ttl_sec: u64,
}

impl RelaySigner {
    pub fn from_config(config: &MediaRelayConfig) -> Self {
        Self {
            secret: config.proxy_token.clone(),
            host: config.proxy_host.clone(),
            port: config.proxy_port,
            base_path: config.proxy_path.trim_end_matches('/').to_string(),
            ttl_sec: config.proxy_ttl_sec,
        }
    }

    fn mac_hex(&self, path_hex: &str, exp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(format!("{path_hex}|{exp}").as_bytes());
        hex_encode(&mac.finalize().into_bytes())
    }

    /// Signed URL for a local file, valid for the configured TTL.
    pub fn sign(&self, file_path: &Path) -> String {
        let path_hex = hex_encode(file_path.to_string_lossy().as_bytes());
        let exp = chrono::Utc::now().timestamp() + self.ttl_sec as i64;
        let sig = self.mac_hex(&path_hex, exp);
        format!(
            "http://{}:{}{}/fetch?p={path_hex}&exp={exp}&sig={sig}",
            self.host, self.port, self.base_path
        )
    }

    /// Verify a signed request; returns the decoded path when valid.
    pub fn verify(&self, path_hex: &str, exp: i64, sig: &str) -> Option<PathBuf> {
        if exp < chrono::Utc::now().timestamp() {
            return None;
        }
        let expected = self.mac_hex(path_hex, exp);
        // Same-length hex strings; a simple comparison suffices here because
        // the signature is already keyed.
        if expected != sig {
            return None;
        }
        let bytes = hex_decode(path_hex)?;
        Some(PathBuf::from(String::from_utf8(bytes).ok()?))
    }
}

#[derive(Clone)]
struct RelayState {
    signer: RelaySigner,
    allowed_roots: Arc<Vec<PathBuf>>,
}

#[derive(Deserialize)]
struct FetchParams {
    p: String,
    exp: i64,
    sig: String,
}

fn path_is_allowed(path: &Path, roots: &[PathBuf]) -> bool {
    let Ok(real) = path.canonicalize() else {
        return false;
    };
    roots.iter().any(|root| {
        root.canonicalize()
            .map(|root| real.starts_with(root))
            .unwrap_or(false)
    })
}

async fn fetch_handler(
    State(state): State<RelayState>,
    Query(params): Query<FetchParams>,
) -> impl IntoResponse {
    let Some(path) = state.signer.verify(&params.p, params.exp, &params.sig) else {
        return (StatusCode::FORBIDDEN, "invalid or expired signature").into_response();
    };
    if !path_is_allowed(&path, &state.allowed_roots) {
        return (StatusCode::FORBIDDEN, "path not allowed").into_response();
    }
    match tokio::fs::read(&path).await {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "file unavailable").into_response(),
    }
}

/// Run the relay server until the process exits.
pub async fn run_relay(
    config: &MediaRelayConfig,
    allowed_roots: Vec<PathBuf>,
) -> Result<()> {
    let state = RelayState {
        signer: RelaySigner::from_config(config),
        allowed_roots: Arc::new(allowed_roots),
    };
    let app = Router::new()
        .route(
            &format!("{}/fetch", config.proxy_path.trim_end_matches('/')),
            get(fetch_handler),
        )
        .with_state(state);

    let addr = format!("{}:{}", config.proxy_host, config.proxy_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("relay bind failed: {addr}"))?;
    tracing::info!("media relay listening on http://{addr}");
    axum::serve(listener, app).await.context("relay server failed")
}
