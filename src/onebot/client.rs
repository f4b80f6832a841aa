//! Persistent OneBot WebSocket client.
//!
//! One socket per account. Reconnects with exponential backoff (capped at
//! 60 s, reset after a successful connect). A watchdog probes the server with
//! `get_login_info` after 90 s of silence and forces a reconnect at 150 s.
//! Actions are echo-matched request/response pairs with a 5 s deadline.

use super::event::BotEvent;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

const ACTION_TIMEOUT: Duration = Duration::from_secs(5);
const SOFT_TIMEOUT: Duration = Duration::from_secs(90);
const HARD_TIMEOUT: Duration = Duration::from_secs(150);
const WATCHDOG_TICK: Duration = Duration::from_secs(5);
const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 60;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Request/response + liveness seam between the gateway and the wire client.
/// Stubbed in tests; implemented by [`OneBotClient`] in production.
#[async_trait]
pub trait ActionTransport: Send + Sync {
    /// Fire a protocol action and return its `data` payload.
    async fn send_action(&self, action: &str, params: Value) -> Result<Value>;

    fn is_connected(&self) -> bool;

    /// Wait for the socket to come (back) up; `true` when connected in time.
    async fn wait_until_connected(&self, timeout: Duration) -> bool;
}

struct ClientInner {
    ws_url: String,
    access_token: String,
    reconnect_grace: Duration,
    connected: AtomicBool,
    /// 0 = not yet learned.
    self_id: AtomicI64,
    pending: parking_lot::Mutex<HashMap<String, oneshot::Sender<Value>>>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    connect_notify: Notify,
    events_tx: mpsc::Sender<BotEvent>,
}

#[derive(Clone)]
pub struct OneBotClient {
    inner: Arc<ClientInner>,
}

impl OneBotClient {
    /// Create the client and the inbound event stream it feeds.
    pub fn new(
        ws_url: &str,
        access_token: &str,
        reconnect_grace_ms: u64,
    ) -> (Self, mpsc::Receiver<BotEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let client = Self {
            inner: Arc::new(ClientInner {
                ws_url: ws_url.to_string(),
                access_token: access_token.to_string(),
                reconnect_grace: Duration::from_millis(reconnect_grace_ms),
                connected: AtomicBool::new(false),
                self_id: AtomicI64::new(0),
                pending: parking_lot::Mutex::new(HashMap::new()),
                writer: tokio::sync::Mutex::new(None),
                connect_notify: Notify::new(),
                events_tx,
            }),
        };
        (client, events_rx)
    }

    pub fn self_id(&self) -> Option<i64> {
        match self.inner.self_id.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    /// Connect-and-read loop. Runs until the event receiver is dropped.
    pub async fn run(&self) -> Result<()> {
        let mut backoff = INITIAL_BACKOFF_SECS;
        loop {
            match self.run_session().await {
                Ok(()) => {
                    tracing::warn!("onebot socket closed, reconnecting in {backoff}s");
                    backoff = INITIAL_BACKOFF_SECS;
                }
                Err(e) => {
                    tracing::warn!("onebot connect failed: {e:#}, retrying in {backoff}s");
                }
            }
            self.mark_disconnected().await;
            if self.inner.events_tx.is_closed() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = backoff.saturating_mul(2).min(MAX_BACKOFF_SECS);
        }
    }

    async fn run_session(&self) -> Result<()> {
        let mut request = self
            .inner
            .ws_url
            .as_str()
            .into_client_request()
            .context("invalid ws_url")?;
        if !self.inner.access_token.is_empty() {
            let bearer = format!("Bearer {}", self.inner.access_token);
            request.headers_mut().insert(
                "Authorization",
                bearer.parse().context("invalid access token header")?,
            );
        }

        let (stream, _) = connect_async(request).await.context("connect failed")?;
        let (sink, mut read) = stream.split();
        *self.inner.writer.lock().await = Some(sink);
        self.inner.connected.store(true, Ordering::SeqCst);
        self.inner.connect_notify.notify_waiters();
        tracing::info!("onebot socket connected: {}", self.inner.ws_url);

        let mut last_frame = Instant::now();
        let mut probed = false;
        let mut tick = tokio::time::interval(WATCHDOG_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            last_frame = Instant::now();
                            probed = false;
                            self.handle_frame(&text).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {
                            // Ping/pong/binary all count as liveness.
                            last_frame = Instant::now();
                        }
                        Some(Err(e)) => {
                            tracing::warn!("onebot read error: {e}");
                            break;
                        }
                    }
                }
                _ = tick.tick() => {
                    let idle = last_frame.elapsed();
                    if idle >= HARD_TIMEOUT {
                        tracing::warn!("onebot hard heartbeat timeout, forcing reconnect");
                        break;
                    }
                    if idle >= SOFT_TIMEOUT && !probed {
                        // Any server frame — including this probe's reply —
                        // refreshes liveness. A reply racing a real event is
                        // fine; both count.
                        probed = true;
                        let probe = self.clone();
                        tokio::spawn(async move {
                            let _ = probe.send_action("get_login_info", json!({})).await;
                        });
                    }
                }
            }
        }
        Ok(())
    }

    async fn mark_disconnected(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        *self.inner.writer.lock().await = None;
        // Dropping the senders fails any in-flight action immediately.
        self.inner.pending.lock().clear();
    }

    /// Dispatch one inbound frame: echo replies resolve pending actions,
    /// events are forwarded, everything unparseable is dropped silently.
    async fn handle_frame(&self, text: &str) {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return;
        };

        if let Some(echo) = value.get("echo").and_then(Value::as_str) {
            if let Some(sender) = self.inner.pending.lock().remove(echo) {
                let _ = sender.send(value);
            }
            return;
        }

        let Ok(event) = serde_json::from_value::<BotEvent>(value) else {
            return;
        };

        if let Some(self_id) = event.self_id {
            self.inner.self_id.store(self_id, Ordering::SeqCst);
        }

        // Self-echo: our own outbound messages come back as events.
        if event.is_message() && event.user_id.is_some() && event.user_id == self.self_id() {
            return;
        }

        if self.inner.events_tx.send(event).await.is_err() {
            tracing::debug!("onebot event receiver dropped");
        }
    }
}

#[async_trait]
impl ActionTransport for OneBotClient {
    async fn send_action(&self, action: &str, params: Value) -> Result<Value> {
        if !self.is_connected() && !self.wait_until_connected(self.inner.reconnect_grace).await {
            anyhow::bail!("transport_unavailable: socket disconnected");
        }

        let echo = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(echo.clone(), tx);

        let frame = json!({ "action": action, "params": params, "echo": echo }).to_string();
        let write_result = {
            let mut writer = self.inner.writer.lock().await;
            match writer.as_mut() {
                Some(sink) => sink.send(Message::Text(frame)).await.map_err(Into::into),
                None => Err(anyhow::anyhow!("transport_unavailable: socket disconnected")),
            }
        };
        if let Err(e) = write_result {
            self.inner.pending.lock().remove(&echo);
            return Err(e);
        }

        match tokio::time::timeout(ACTION_TIMEOUT, rx).await {
            Ok(Ok(response)) => {
                let status = response.get("status").and_then(Value::as_str).unwrap_or("");
                if status == "failed" {
                    let msg = response
                        .get("msg")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown");
                    anyhow::bail!("action {action} failed: {msg}");
                }
                Ok(response.get("data").cloned().unwrap_or(Value::Null))
            }
            Ok(Err(_)) => anyhow::bail!("transport_unavailable: socket dropped mid-request"),
            Err(_) => {
                self.inner.pending.lock().remove(&echo);
                anyhow::bail!("request timeout: {action}")
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn wait_until_connected(&self, timeout: Duration) -> bool {
        if self.is_connected() {
            return true;
        }
        tokio::time::timeout(timeout, async {
            loop {
                self.inner.connect_notify.notified().await;
                if self.is_connected() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> (OneBotClient, mpsc::Receiver<BotEvent>) {
        OneBotClient::new("ws://127.0.0.1:1", "token", 0)
    }

    #[tokio::test]
    async fn send_action_while_disconnected_is_transport_unavailable() {
        let (client, _rx) = test_client();
        let err = client
            .send_action("send_private_msg", json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("transport_unavailable"));
    }

    #[tokio::test]
    async fn wait_until_connected_times_out_when_down() {
        let (client, _rx) = test_client();
        assert!(!client.wait_until_connected(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn non_json_frames_are_dropped_silently() {
        let (client, mut rx) = test_client();
        client.handle_frame("not json at all {{{").await;
        client.handle_frame("").await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn message_events_are_forwarded() {
        let (client, mut rx) = test_client();
        client
            .handle_frame(
                r#"{"post_type":"message","message_type":"private","self_id":10000,
                    "user_id":123456,"message_id":7,
                    "message":[{"type":"text","data":{"text":"hi"}}]}"#,
            )
            .await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.message_id, Some(7));
        assert_eq!(client.self_id(), Some(10000));
    }

    #[tokio::test]
    async fn self_echo_messages_are_filtered() {
        let (client, mut rx) = test_client();
        // Learn identity from a lifecycle frame first.
        client
            .handle_frame(r#"{"post_type":"meta_event","sub_type":"connect","self_id":10000}"#)
            .await;
        client
            .handle_frame(
                r#"{"post_type":"message","message_type":"private","self_id":10000,
                    "user_id":10000,"message":[{"type":"text","data":{"text":"echo"}}]}"#,
            )
            .await;
        // Only the meta_event should have been forwarded.
        let first = rx.try_recv().unwrap();
        assert_eq!(first.post_type, "meta_event");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn echo_frames_resolve_pending_actions() {
        let (client, _rx) = test_client();
        let (tx, rx_done) = oneshot::channel();
        client.inner.pending.lock().insert("e-1".into(), tx);
        client
            .handle_frame(r#"{"status":"ok","retcode":0,"data":{"url":"https://x"},"echo":"e-1"}"#)
            .await;
        let response = rx_done.await.unwrap();
        assert_eq!(response["data"]["url"], "https://x");
        assert!(client.inner.pending.lock().is_empty());
    }
}
