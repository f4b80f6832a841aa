//! Production `Deliverer`: hands sends to the rate-limited queue, runs the
//! per-attempt retry loop against the protocol, and traces every attempt
//! through `prepared → queued → sending → {sent|dropped|failed}` with one
//! attempt id.

use crate::config::AccountConfig;
use crate::dispatch::{Deliverer, RouteRuntime};
use crate::errors::DropReason;
use crate::media::relay::RelaySigner;
use crate::media::sender::{MediaSendRequest, MediaSender, PathPolicy};
use crate::onebot::ActionTransport;
use crate::outbound::normalize::OutboundMediaItem;
use crate::outbound::queue::{send_with_retry, MediaDedupWindow, SendError, SendQueue};
use crate::route::{parse_target, Target};
use crate::store::RouteStore;
use crate::trace::{TraceEvent, TraceLogger, TraceSource};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

pub struct GatewayDeliverer {
    transport: Arc<dyn ActionTransport>,
    queue: SendQueue,
    trace: Arc<TraceLogger>,
    store: RouteStore,
    account: AccountConfig,
    context: Arc<RouteRuntime>,
    dedup_window: MediaDedupWindow,
    path_policy: Arc<PathPolicy>,
    relay: Option<RelaySigner>,
}

fn text_action(target: &Target, chunk: &str) -> (&'static str, Value) {
    let segment = json!({ "type": "text", "data": { "text": chunk } });
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

/// Preflight shared by text and media sends: a send belonging to a dispatch
/// that has been preempted (a different dispatch now holds the route) or
/// aborted must not reach the wire.
fn preflight_check(
    context: &RouteRuntime,
    route: &str,
    dispatch_id: &str,
) -> Result<(), DropReason> {
    match context.current_in_flight(route) {
        Some(current) if current.dispatch_id != dispatch_id => {
            Err(DropReason::DispatchIdMismatch)
        }
        Some(current) if current.cancel.is_cancelled() => Err(DropReason::DispatchAborted),
        // No in-flight: the owning dispatch already completed and cleared
        // itself (fallback/notify path). Allowed.
        _ => Ok(()),
    }
}

impl GatewayDeliverer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn ActionTransport>,
        queue: SendQueue,
        trace: Arc<TraceLogger>,
        store: RouteStore,
        account: AccountConfig,
        context: Arc<RouteRuntime>,
        path_policy: Arc<PathPolicy>,
        relay: Option<RelaySigner>,
    ) -> Self {
        Self {
            transport,
            queue,
            trace,
            store,
            account,
            context,
            dedup_window: MediaDedupWindow::default(),
            path_policy,
            relay,
        }
    }

    fn trace_attempt(
        &self,
        route: &str,
        dispatch_id: &str,
        attempt_id: &str,
        event: &str,
        reason: Option<DropReason>,
    ) {
        let mut trace_event = TraceEvent::new(event, route, TraceSource::Chat)
            .dispatch_id(dispatch_id)
            .attempt_id(attempt_id);
        if let Some(reason) = reason {
            trace_event = trace_event.drop_reason(reason);
        }
        self.trace.emit(trace_event);
    }

    fn finish_attempt(
        &self,
        route: &str,
        dispatch_id: &str,
        attempt_id: &str,
        result: Result<(), anyhow::Error>,
        drop_slot: &Mutex<Option<DropReason>>,
    ) -> Result<(), DropReason> {
        match result {
            Ok(()) => {
                self.trace_attempt(route, dispatch_id, attempt_id, "qq_send_sent", None);
                if let Err(e) = self.store.note_outbound(route, crate::util::now_ms()) {
                    tracing::warn!(%route, "activity write failed: {e:#}");
                }
                Ok(())
            }
            Err(e) => {
                if let Some(reason) = *drop_slot.lock() {
                    self.trace_attempt(
                        route,
                        dispatch_id,
                        attempt_id,
                        "qq_send_dropped",
                        Some(reason),
                    );
                    return Err(reason);
                }
                let reason = if format!("{e:#}").contains("transport_unavailable") {
                    DropReason::TransportUnavailable
                } else {
                    DropReason::UnknownError
                };
                self.trace.emit(
                    TraceEvent::new("qq_send_failed", route, TraceSource::Chat)
                        .dispatch_id(dispatch_id)
                        .attempt_id(attempt_id)
                        .drop_reason(reason)
                        .error(&format!("{e:#}")),
                );
                Err(reason)
            }
        }
    }
}

#[async_trait]
impl Deliverer for GatewayDeliverer {
    async fn deliver_text(
        &self,
        route: &str,
        dispatch_id: &str,
        chunk: &str,
    ) -> Result<(), DropReason> {
        let attempt_id = Uuid::new_v4().to_string();
        self.trace_attempt(route, dispatch_id, &attempt_id, "qq_send_prepared", None);

        let target = parse_target(route).ok_or(DropReason::UnknownError)?;
        let (action, params) = text_action(&target, chunk);
        let drop_slot = Arc::new(Mutex::new(None::<DropReason>));

        self.trace_attempt(route, dispatch_id, &attempt_id, "qq_send_queued", None);
        let transport = self.transport.clone();
        let send_config = self.account.send.clone();
        let context = self.context.clone();
        let trace = self.trace.clone();
        let route_owned = route.to_string();
        let dispatch_owned = dispatch_id.to_string();
        let attempt_owned = attempt_id.clone();
        let drop_in_task = drop_slot.clone();

        let done = self.queue.submit(&format!("text:{route}"), move || {
            let transport = transport.clone();
            let send_config = send_config.clone();
            let context = context.clone();
            let trace = trace.clone();
            let route = route_owned.clone();
            let dispatch_id = dispatch_owned.clone();
            let attempt_id = attempt_owned.clone();
            let params = params.clone();
            let drop_slot = drop_in_task.clone();
            Box::pin(async move {
                trace.emit(
                    TraceEvent::new("qq_send_sending", &route, TraceSource::Chat)
                        .dispatch_id(&dispatch_id)
                        .attempt_id(&attempt_id),
                );
                let preflight = {
                    let context = context.clone();
                    let route = route.clone();
                    let dispatch_id = dispatch_id.clone();
                    move || preflight_check(&context, &route, &dispatch_id)
                };
                match send_with_retry(
                    transport.as_ref(),
                    &send_config,
                    action,
                    params,
                    Some(&preflight),
                    None,
                )
                .await
                {
                    Ok(_) => Ok(()),
                    Err(SendError::Dropped(reason)) => {
                        *drop_slot.lock() = Some(reason);
                        anyhow::bail!("dropped: {reason}")
                    }
                    Err(SendError::Failed(e)) => Err(e),
                }
            })
        });

        let outcome = match done.await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("send queue gone")),
        };
        let delivered = self.finish_attempt(route, dispatch_id, &attempt_id, outcome, &drop_slot);
        if delivered.is_ok() {
            self.trace.chat(route, "out", chunk, None);
        }
        delivered
    }

    async fn deliver_media(
        &self,
        route: &str,
        dispatch_id: &str,
        item: &OutboundMediaItem,
    ) -> Result<(), DropReason> {
        let attempt_id = Uuid::new_v4().to_string();
        self.trace_attempt(route, dispatch_id, &attempt_id, "qq_send_prepared", None);
        self.trace_attempt(route, dispatch_id, &attempt_id, "qq_send_queued", None);

        let drop_slot = Arc::new(Mutex::new(None::<DropReason>));
        let transport = self.transport.clone();
        let store = self.store.clone();
        let account = self.account.clone();
        let path_policy = self.path_policy.clone();
        let relay = self.relay.clone();
        let context = self.context.clone();
        let trace = self.trace.clone();
        let dedup_window = self.dedup_window.clone();
        let route_owned = route.to_string();
        let dispatch_owned = dispatch_id.to_string();
        let attempt_owned = attempt_id.clone();
        let item_owned = item.clone();
        let drop_in_task = drop_slot.clone();

        let done = self.queue.submit(&format!("media:{route}"), move || {
            let transport = transport.clone();
            let store = store.clone();
            let account = account.clone();
            let path_policy = path_policy.clone();
            let relay = relay.clone();
            let context = context.clone();
            let trace = trace.clone();
            let dedup_window = dedup_window.clone();
            let route = route_owned.clone();
            let dispatch_id = dispatch_owned.clone();
            let attempt_id = attempt_owned.clone();
            let item = item_owned.clone();
            let drop_slot = drop_in_task.clone();
            Box::pin(async move {
                trace.emit(
                    TraceEvent::new("qq_send_sending", &route, TraceSource::Chat)
                        .dispatch_id(&dispatch_id)
                        .attempt_id(&attempt_id),
                );
                let sender = MediaSender {
                    transport: transport.as_ref(),
                    store: &store,
                    account: &account,
                    path_policy: &path_policy,
                    relay: relay.as_ref(),
                };
                let preflight = {
                    let context = context.clone();
                    let route = route.clone();
                    let dispatch_id = dispatch_id.clone();
                    move || preflight_check(&context, &route, &dispatch_id)
                };
                match sender
                    .send(MediaSendRequest {
                        route: &route,
                        item: &item,
                        dedup_window: &dedup_window,
                        preflight: Some(&preflight),
                    })
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(reason) => {
                        *drop_slot.lock() = Some(reason);
                        anyhow::bail!("dropped: {reason}")
                    }
                }
            })
        });

        let outcome = match done.await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("send queue gone")),
        };
        let delivered = self.finish_attempt(route, dispatch_id, &attempt_id, outcome, &drop_slot);
        if delivered.is_ok() {
            self.trace
                .chat(route, "out", &format!("[media] {}", item.url), None);
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SendQueueConfig;
    use crate::media::resolver::MediaKind;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    struct OkTransport;

    #[async_trait]
    impl ActionTransport for OkTransport {
        async fn send_action(&self, _action: &str, _params: Value) -> Result<Value> {
            Ok(json!({ "message_id": 1 }))
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn wait_until_connected(&self, _timeout: Duration) -> bool {
            true
        }
    }

    fn fast_send_config() -> SendQueueConfig {
        SendQueueConfig {
            base_delay_ms: 1,
            jitter_ms: 0,
            max_retries: 1,
            retry_min_delay_ms: 1,
            retry_max_delay_ms: 2,
            retry_jitter_ratio: 0.0,
            wait_for_reconnect_ms: 1,
            requeue_attempts: 0,
            media_dedup_window_ms: 45_000,
        }
    }

    fn deliverer(tmp: &TempDir) -> (GatewayDeliverer, Arc<RouteRuntime>) {
        let store = RouteStore::new(tmp.path());
        let mut account = AccountConfig {
            ws_url: "ws://x".into(),
            access_token: "t".into(),
            ..AccountConfig::default()
        };
        account.send = fast_send_config();
        account.media_path_allowlist = vec![tmp.path().to_path_buf()];
        let context = Arc::new(RouteRuntime::new());
        let path_policy = Arc::new(PathPolicy::for_account(tmp.path(), &account));
        let deliverer = GatewayDeliverer::new(
            Arc::new(OkTransport),
            SendQueue::start(account.send.clone()),
            Arc::new(TraceLogger::new(store.clone())),
            store,
            account,
            context.clone(),
            path_policy,
            None,
        );
        (deliverer, context)
    }

    #[tokio::test]
    async fn text_delivery_traces_full_attempt_sequence() {
        let tmp = TempDir::new().unwrap();
        let (deliverer, context) = deliverer(&tmp);
        let (inflight, _) = context.begin_route_in_flight("user:123456", Some(1));

        deliverer
            .deliver_text("user:123456", &inflight.dispatch_id, "你好")
            .await
            .unwrap();

        let logs = tmp
            .path()
            .join("qq_sessions")
            .join("user__123456")
            .join("logs");
        let day = chrono::Utc::now().format("%Y-%m-%d");
        let trace = std::fs::read_to_string(logs.join(format!("trace-{day}.ndjson"))).unwrap();
        for phase in ["qq_send_prepared", "qq_send_queued", "qq_send_sending", "qq_send_sent"] {
            assert!(trace.contains(phase), "missing {phase}");
        }
        // All phases share one attempt id.
        let attempt_ids: std::collections::HashSet<String> = trace
            .lines()
            .filter(|line| line.contains("qq_send_"))
            .map(|line| {
                serde_json::from_str::<serde_json::Value>(line).unwrap()["attempt_id"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(attempt_ids.len(), 1);
        // Chat log carries the outbound line.
        let chat = std::fs::read_to_string(logs.join(format!("chat-{day}.ndjson"))).unwrap();
        assert!(chat.contains("你好"));
    }

    #[tokio::test]
    async fn preempted_dispatch_send_is_dropped() {
        let tmp = TempDir::new().unwrap();
        let (deliverer, context) = deliverer(&tmp);
        let (old, _) = context.begin_route_in_flight("user:123456", Some(1));
        // A newer dispatch takes the route.
        let (_new, prev) = context.begin_route_in_flight("user:123456", Some(2));
        assert!(prev.is_some());

        let err = deliverer
            .deliver_text("user:123456", &old.dispatch_id, "迟到的回复")
            .await
            .unwrap_err();
        assert_eq!(err, DropReason::DispatchIdMismatch);
    }

    #[tokio::test]
    async fn aborted_dispatch_send_is_dropped() {
        let tmp = TempDir::new().unwrap();
        let (deliverer, context) = deliverer(&tmp);
        let (inflight, _) = context.begin_route_in_flight("user:123456", Some(1));
        inflight.cancel.cancel();

        let err = deliverer
            .deliver_text("user:123456", &inflight.dispatch_id, "aborted")
            .await
            .unwrap_err();
        assert_eq!(err, DropReason::DispatchAborted);
    }

    #[tokio::test]
    async fn media_delivery_succeeds_and_snapshots() {
        let tmp = TempDir::new().unwrap();
        let (deliverer, context) = deliverer(&tmp);
        let (inflight, _) = context.begin_route_in_flight("user:123456", Some(1));
        let src = tmp.path().join("pic.png");
        std::fs::write(&src, b"png").unwrap();

        deliverer
            .deliver_media(
                "user:123456",
                &inflight.dispatch_id,
                &OutboundMediaItem {
                    url: format!("file://{}", src.display()),
                    kind: MediaKind::Image,
                },
            )
            .await
            .unwrap();

        let out = tmp
            .path()
            .join("qq_sessions")
            .join("user__123456")
            .join("out")
            .join("files");
        assert_eq!(std::fs::read_dir(out).unwrap().count(), 1);
    }
}
