//! Account gateway: wires the protocol client, media resolution, the
//! aggregator, the dispatch engine, and the delivery queue into one running
//! unit per configured account.

mod deliver;

pub use deliver::GatewayDeliverer;

use crate::agent::AgentRuntime;
use crate::config::{AccountConfig, Config};
use crate::dispatch::{DispatchEngine, InboundAggregator, ParsedInbound, RouteRuntime, TaskUnits};
use crate::media::materialize::{materialize_batch, MaterializeOptions, MaterializeRequest};
use crate::media::relay::RelaySigner;
use crate::media::resolver::MediaResolver;
use crate::media::sender::PathPolicy;
use crate::onebot::{ActionTransport, BotEvent, OneBotClient};
use crate::outbound::queue::SendQueue;
use crate::policy::PolicyEngine;
use crate::store::RouteStore;
use crate::trace::{TraceEvent, TraceLogger, TraceSource};
use anyhow::Result;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

const PROCESSED_MSG_IDS_CAP: usize = 1_000;
const MEMBER_NAME_TTL: Duration = Duration::from_secs(60 * 60);

/// Everything one account needs at runtime, grouped so construction and
/// teardown are explicit.
pub struct GatewayAccount {
    pub account: AccountConfig,
    pub store: RouteStore,
    pub trace: Arc<TraceLogger>,
    pub policy: Arc<PolicyEngine>,
    pub engine: Arc<DispatchEngine>,
    pub aggregator: Arc<InboundAggregator>,
    pub deliverer: Arc<GatewayDeliverer>,
    pub path_policy: Arc<PathPolicy>,
    transport: Arc<dyn ActionTransport>,
    http: reqwest::Client,
    processed_msg_ids: Mutex<HashSet<i64>>,
    member_names: Mutex<HashMap<String, (String, Instant)>>,
}

impl GatewayAccount {
    /// Build the full component graph for one account around an existing
    /// transport (the live socket client in production, a stub in tests).
    pub fn build(
        config: &Config,
        account: AccountConfig,
        transport: Arc<dyn ActionTransport>,
        runtime: Arc<dyn AgentRuntime>,
    ) -> Arc<Self> {
        let store = RouteStore::new(&config.workspace_dir);
        let trace = Arc::new(TraceLogger::new(store.clone()));
        let policy = Arc::new(PolicyEngine::new(
            store.clone(),
            &account.account_id,
            account.owner_user_id.clone(),
        ));
        let context = Arc::new(RouteRuntime::new());
        let aggregator = Arc::new(InboundAggregator::new());
        let tasks = Arc::new(TaskUnits::new(store.clone(), account.tasks.clone()));
        let mut send_config = account.send.clone();
        if let Some(rate_limit_ms) = account.rate_limit_ms {
            send_config.base_delay_ms = rate_limit_ms;
        }
        let queue = SendQueue::start(send_config);
        let relay = account
            .media_relay
            .proxy_enabled
            .then(|| RelaySigner::from_config(&account.media_relay));
        let path_policy_shared = Arc::new(PathPolicy::for_account(&config.workspace_dir, &account));

        let deliverer = Arc::new(GatewayDeliverer::new(
            transport.clone(),
            queue,
            trace.clone(),
            store.clone(),
            account.clone(),
            context.clone(),
            path_policy_shared.clone(),
            relay,
        ));
        let engine = Arc::new(DispatchEngine::new(
            account.clone(),
            context,
            aggregator.clone(),
            policy.clone(),
            trace.clone(),
            tasks,
            runtime,
            deliverer.clone(),
        ));

        Arc::new(Self {
            account,
            store,
            trace,
            policy,
            engine,
            aggregator,
            deliverer,
            path_policy: path_policy_shared,
            transport,
            http: reqwest::Client::new(),
            processed_msg_ids: Mutex::new(HashSet::new()),
            member_names: Mutex::new(HashMap::new()),
        })
    }

    /// Consume the inbound event stream until it ends.
    pub async fn pump(self: Arc<Self>, mut events: tokio::sync::mpsc::Receiver<BotEvent>) {
        while let Some(event) = events.recv().await {
            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_event(event).await {
                    tracing::warn!("inbound handling failed: {e:#}");
                }
            });
        }
        tracing::warn!("onebot event stream ended");
    }

    /// Gate an inbound message event. Returns its route when it should be
    /// processed.
    pub fn admit_event(&self, event: &BotEvent) -> Option<String> {
        if !event.is_message() {
            return None;
        }
        let route = event.route(self.account.enable_guilds)?;

        if let Some(user_id) = event.user_id {
            let user = user_id.to_string();
            if self.account.blocked_users.iter().any(|blocked| blocked == &user) {
                return None;
            }
        }

        if let Some(group_id) = event.group_id {
            let group = group_id.to_string();
            if !self.account.allowed_groups.is_empty()
                && !self.account.allowed_groups.iter().any(|g| g == &group)
            {
                return None;
            }
            if self.account.require_mention {
                let mentioned = event
                    .self_id
                    .is_some_and(|self_id| event.mentions(self_id));
                let text = event.plain_text();
                let keyword_hit = self
                    .account
                    .keyword_triggers
                    .iter()
                    .any(|keyword| !keyword.is_empty() && text.contains(keyword.as_str()));
                if !mentioned && !keyword_hit {
                    return None;
                }
            }
        }

        if self.account.enable_deduplication {
            if let Some(msg_id) = event.message_id {
                let mut seen = self.processed_msg_ids.lock();
                if seen.contains(&msg_id) {
                    return None;
                }
                if seen.len() >= PROCESSED_MSG_IDS_CAP {
                    seen.clear();
                }
                seen.insert(msg_id);
            }
        }
        Some(route)
    }

    /// Display name for a group member, cached for an hour.
    pub async fn member_display_name(&self, group_id: i64, user_id: i64) -> Option<String> {
        let key = format!("{group_id}:{user_id}");
        {
            let cache = self.member_names.lock();
            if let Some((name, at)) = cache.get(&key) {
                if at.elapsed() < MEMBER_NAME_TTL {
                    return Some(name.clone());
                }
            }
        }
        match self
            .transport
            .send_action(
                "get_group_member_info",
                json!({ "group_id": group_id, "user_id": user_id }),
            )
            .await
        {
            Ok(data) => {
                let name = data
                    .get("card")
                    .and_then(serde_json::Value::as_str)
                    .filter(|card| !card.is_empty())
                    .or_else(|| data.get("nickname").and_then(serde_json::Value::as_str))?
                    .to_string();
                self.member_names
                    .lock()
                    .insert(key, (name.clone(), Instant::now()));
                Some(name)
            }
            Err(e) => {
                tracing::debug!("group_member_lookup_failed: {e:#}");
                None
            }
        }
    }

    async fn handle_event(self: Arc<Self>, event: BotEvent) -> Result<()> {
        let Some(route) = self.admit_event(&event) else {
            return Ok(());
        };
        let msg_id = event.message_id;
        let text = event.plain_text();

        self.trace.emit(
            TraceEvent::new("qq_inbound_received", &route, TraceSource::Inbound).msg_id(msg_id),
        );
        let display = match (event.group_id, event.user_id) {
            (Some(group_id), Some(user_id)) => self.member_display_name(group_id, user_id).await,
            _ => event.sender.as_ref().and_then(|s| s.nickname.clone()),
        };
        let chat_line = match display {
            Some(name) => format!("{name}: {text}"),
            None => text.clone(),
        };
        self.trace.chat(&route, "in", &chat_line, msg_id);
        if let Err(e) = self.store.note_inbound(&route, crate::util::now_ms()) {
            tracing::warn!(%route, "activity write failed: {e:#}");
        }

        // Best-effort typing indicator on private chats.
        if route.starts_with("user:") {
            let transport = self.transport.clone();
            let user_id = event.user_id;
            tokio::spawn(async move {
                if let Some(user_id) = user_id {
                    let _ = transport
                        .send_action(
                            "set_input_status",
                            json!({ "user_id": user_id, "event_type": 1 }),
                        )
                        .await;
                }
            });
        }

        let (media_urls, media_total, media_unresolved) =
            self.resolve_and_materialize(&route, &event).await;

        let seq = self.aggregator.push(
            &route,
            &text,
            &media_urls,
            media_total,
            media_unresolved,
            msg_id,
        );

        // Aggregation window: the last fragment in the window carries the
        // whole batch into the engine.
        let window = self.account.aggregate.window_for(&route);
        tokio::time::sleep(Duration::from_millis(window)).await;
        let Some(aggregated) = self.aggregator.finalize_if_current(&route, seq) else {
            self.trace.emit(
                TraceEvent::new("qq_inbound_merged", &route, TraceSource::Inbound)
                    .msg_id(msg_id)
                    .drop_reason(crate::errors::DropReason::MergedIntoNewerInbound),
            );
            return Ok(());
        };

        self.engine
            .handle_inbound(ParsedInbound {
                route,
                seq: aggregated.seq,
                msg_id: aggregated.msg_id,
                text: aggregated.text,
                media_urls: aggregated.media_urls,
                media_items_total: aggregated.media_items_total,
                media_items_unresolved: aggregated.media_items_unresolved,
                source: TraceSource::Chat,
            })
            .await?;
        Ok(())
    }

    /// Resolve inbound media refs and persist the payloads under `in/files`.
    /// Returns (materialized paths, total refs, unresolved refs).
    async fn resolve_and_materialize(
        &self,
        route: &str,
        event: &BotEvent,
    ) -> (Vec<String>, u32, u32) {
        let segments = event.segments();
        let resolver = MediaResolver {
            transport: self.transport.as_ref(),
            trace: &self.trace,
            config: &self.account.inbound_media,
        };
        let resolved = resolver
            .resolve_message(route, event.message_id, &segments)
            .await;
        if resolved.is_empty() {
            return (Vec::new(), 0, 0);
        }

        let total = resolved.len() as u32;
        let Ok(dest_dir) = self.store.in_files_dir(route) else {
            return (Vec::new(), total, total);
        };

        let mut materialized = Vec::new();
        let mut unresolved = 0u32;
        let options = MaterializeOptions {
            http_timeout_ms: self.account.inbound_media.http_timeout_ms,
            http_retries: self.account.inbound_media.http_retries,
        };
        for (media_ref, candidates) in &resolved {
            let requests: Vec<MaterializeRequest> = candidates
                .iter()
                .map(|candidate| MaterializeRequest {
                    url: candidate.source_url(),
                    name_hint: media_ref.name_hint.clone(),
                })
                .collect();
            let outcomes = materialize_batch(&self.http, &requests, &dest_dir, options).await;
            let mut done = false;
            for outcome in &outcomes {
                self.trace.emit({
                    let mut trace_event =
                        TraceEvent::new("qq_media_materialize", route, TraceSource::Inbound)
                            .msg_id(event.message_id)
                            .resolve("materialize", None, None);
                    trace_event.materialize_error_code =
                        outcome.error_code.map(|code| code.as_str().to_string());
                    trace_event.retry_count = outcome.retry_count;
                    trace_event.http_status = outcome.http_status;
                    trace_event
                });
                if let Some(path) = &outcome.output_path {
                    materialized.push(path.display().to_string());
                    done = true;
                    break;
                }
            }
            if !done {
                unresolved += 1;
            }
        }
        (materialized, total, unresolved)
    }
}

/// Build one configured account against a live socket client. Returns the
/// gateway plus the socket driver future's handle.
pub fn start_account(
    config: &Config,
    account: AccountConfig,
    runtime: Arc<dyn AgentRuntime>,
) -> (Arc<GatewayAccount>, tokio::task::JoinHandle<Result<()>>, tokio::sync::mpsc::Receiver<BotEvent>) {
    let (client, events) = OneBotClient::new(
        &account.ws_url,
        &account.access_token,
        account.send.wait_for_reconnect_ms,
    );
    let gateway = GatewayAccount::build(config, account, Arc::new(client.clone()), runtime);
    let socket_task = tokio::spawn(async move { client.run().await });
    (gateway, socket_task, events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::EchoAgent;
    use anyhow::Result;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct DeadTransport;

    #[async_trait]
    impl ActionTransport for DeadTransport {
        async fn send_action(&self, action: &str, _params: serde_json::Value) -> Result<serde_json::Value> {
            anyhow::bail!("action {action} failed: unsupported")
        }

        fn is_connected(&self) -> bool {
            false
        }

        async fn wait_until_connected(&self, _timeout: Duration) -> bool {
            false
        }
    }

    fn gateway(account: AccountConfig) -> (Arc<GatewayAccount>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let config = Config {
            workspace_dir: tmp.path().to_path_buf(),
            ..Config::default()
        };
        let gateway = GatewayAccount::build(
            &config,
            account,
            Arc::new(DeadTransport),
            Arc::new(EchoAgent),
        );
        (gateway, tmp)
    }

    fn message_event(raw: &str) -> BotEvent {
        serde_json::from_str(raw).unwrap()
    }

    fn base_account() -> AccountConfig {
        AccountConfig {
            ws_url: "ws://x".into(),
            access_token: "t".into(),
            ..AccountConfig::default()
        }
    }

    #[tokio::test]
    async fn admits_plain_private_message() {
        let (gateway, _tmp) = gateway(base_account());
        let event = message_event(
            r#"{"post_type":"message","message_type":"private","user_id":123456,
                "message_id":1,"message":[{"type":"text","data":{"text":"hi"}}]}"#,
        );
        assert_eq!(gateway.admit_event(&event).as_deref(), Some("user:123456"));
    }

    #[tokio::test]
    async fn blocks_listed_users() {
        let mut account = base_account();
        account.blocked_users = vec!["123456".into()];
        let (gateway, _tmp) = gateway(account);
        let event = message_event(
            r#"{"post_type":"message","message_type":"private","user_id":123456,
                "message_id":1,"message":[]}"#,
        );
        assert!(gateway.admit_event(&event).is_none());
    }

    #[tokio::test]
    async fn group_allowlist_filters() {
        let mut account = base_account();
        account.allowed_groups = vec!["100001".into()];
        let (gateway, _tmp) = gateway(account);
        let allowed = message_event(
            r#"{"post_type":"message","message_type":"group","group_id":100001,
                "user_id":1,"message_id":1,"message":[]}"#,
        );
        assert!(gateway.admit_event(&allowed).is_some());
        let denied = message_event(
            r#"{"post_type":"message","message_type":"group","group_id":200002,
                "user_id":1,"message_id":2,"message":[]}"#,
        );
        assert!(gateway.admit_event(&denied).is_none());
    }

    #[tokio::test]
    async fn require_mention_gates_groups() {
        let mut account = base_account();
        account.require_mention = true;
        account.keyword_triggers = vec!["小助手".into()];
        let (gateway, _tmp) = gateway(account);

        let bare = message_event(
            r#"{"post_type":"message","message_type":"group","group_id":100001,
                "self_id":10000,"user_id":1,"message_id":1,
                "message":[{"type":"text","data":{"text":"随便聊聊"}}]}"#,
        );
        assert!(gateway.admit_event(&bare).is_none());

        let mentioned = message_event(
            r#"{"post_type":"message","message_type":"group","group_id":100001,
                "self_id":10000,"user_id":1,"message_id":2,
                "message":[{"type":"at","data":{"qq":"10000"}},
                           {"type":"text","data":{"text":"查一下"}}]}"#,
        );
        assert!(gateway.admit_event(&mentioned).is_some());

        let keyword = message_event(
            r#"{"post_type":"message","message_type":"group","group_id":100001,
                "self_id":10000,"user_id":1,"message_id":3,
                "message":[{"type":"text","data":{"text":"小助手 在吗"}}]}"#,
        );
        assert!(gateway.admit_event(&keyword).is_some());
    }

    #[tokio::test]
    async fn duplicate_message_ids_are_dropped() {
        let (gateway, _tmp) = gateway(base_account());
        let event = message_event(
            r#"{"post_type":"message","message_type":"private","user_id":123456,
                "message_id":42,"message":[]}"#,
        );
        assert!(gateway.admit_event(&event).is_some());
        assert!(gateway.admit_event(&event).is_none());
    }

    #[tokio::test]
    async fn processed_ids_set_is_bounded() {
        let (gateway, _tmp) = gateway(base_account());
        for i in 0..(PROCESSED_MSG_IDS_CAP as i64 + 10) {
            let event = message_event(&format!(
                r#"{{"post_type":"message","message_type":"private","user_id":123456,
                    "message_id":{i},"message":[]}}"#
            ));
            gateway.admit_event(&event);
        }
        assert!(gateway.processed_msg_ids.lock().len() <= PROCESSED_MSG_IDS_CAP);
    }

    #[tokio::test]
    async fn full_inbound_flow_reaches_engine_and_traces() {
        let mut account = base_account();
        account.aggregate.window_ms = 5;
        account.interrupt_window_ms = Some(5);
        account.send.base_delay_ms = 1;
        account.send.jitter_ms = 0;
        account.send.max_retries = 1;
        account.send.retry_min_delay_ms = 1;
        account.send.retry_max_delay_ms = 2;
        account.send.wait_for_reconnect_ms = 1;
        let (gateway, tmp) = gateway(account);
        let event = message_event(
            r#"{"post_type":"message","message_type":"private","user_id":2151539153,
                "message_id":42,"message":[{"type":"text","data":{"text":"你好"}}]}"#,
        );
        gateway.clone().handle_event(event).await.unwrap();

        let logs = tmp
            .path()
            .join("qq_sessions")
            .join("user__2151539153")
            .join("logs");
        let day = chrono::Utc::now().format("%Y-%m-%d");
        let trace = std::fs::read_to_string(logs.join(format!("trace-{day}.ndjson"))).unwrap();
        assert!(trace.contains("qq_inbound_received"));
        assert!(trace.contains("qq_dispatch_start"));
        assert!(trace.contains("qq_dispatch_done"));
    }
}
