//! Proactive "lonely chat" nudge.
//!
//! One timer per account. When the configured route has been silent long
//! enough — and the last nudge is far enough in the past — a short random
//! nudge goes out through the normal deliver path. State survives restarts
//! via `meta/proactive-state.json`.

use crate::dispatch::Deliverer;
use crate::policy::{PolicyEngine, PolicyStage, SendAction};
use crate::store::{read_json, write_json_atomic, RouteStore};
use crate::trace::{TraceEvent, TraceLogger, TraceSource};
use crate::util::now_ms;
use anyhow::Result;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const NUDGE_TEXTS: &[&str] = &[
    "在忙什么呢？好久没聊了。",
    "想起你了，最近怎么样？",
    "冒个泡，今天过得如何？",
    "好安静啊，说说近况？",
];

const TICK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProactiveState {
    pub last_inbound_at_ms: Option<i64>,
    pub last_proactive_at_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ProactiveSettings {
    pub enabled: bool,
    pub route: Option<String>,
    pub min_silence_ms: u64,
    pub min_interval_ms: u64,
    pub log_verbose: bool,
}

impl From<&crate::config::ProactiveDmConfig> for ProactiveSettings {
    fn from(config: &crate::config::ProactiveDmConfig) -> Self {
        Self {
            enabled: config.enabled,
            route: config.route.clone(),
            min_silence_ms: config.min_silence_ms,
            min_interval_ms: config.min_interval_ms,
            log_verbose: config.log_verbose,
        }
    }
}

pub struct ProactiveNudge {
    settings: ProactiveSettings,
    store: RouteStore,
    policy: Arc<PolicyEngine>,
    trace: Arc<TraceLogger>,
    deliverer: Arc<dyn Deliverer>,
}

impl ProactiveNudge {
    pub fn new(
        settings: ProactiveSettings,
        store: RouteStore,
        policy: Arc<PolicyEngine>,
        trace: Arc<TraceLogger>,
        deliverer: Arc<dyn Deliverer>,
    ) -> Self {
        Self {
            settings,
            store,
            policy,
            trace,
            deliverer,
        }
    }

    fn state_path(&self, route: &str) -> Result<std::path::PathBuf> {
        Ok(self.store.meta_dir(route)?.join("proactive-state.json"))
    }

    fn load_state(&self, route: &str) -> ProactiveState {
        self.state_path(route)
            .and_then(|path| read_json(&path))
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    /// One evaluation pass. Returns the nudge text when one was sent.
    pub async fn tick(&self) -> Result<Option<String>> {
        if !self.settings.enabled {
            return Ok(None);
        }
        let Some(route) = self.settings.route.clone() else {
            return Ok(None);
        };
        if !crate::route::is_valid_qq_route(&route) {
            tracing::warn!(%route, "proactive nudge route invalid, skipping");
            return Ok(None);
        }

        // Hydrate once per tick: the gateway keeps activity fresh; our own
        // state file carries the last nudge time.
        let mut state = self.load_state(&route);
        let activity = self.store.read_activity(&route)?;
        if activity.last_inbound_at_ms.is_some() {
            state.last_inbound_at_ms = activity.last_inbound_at_ms;
        }

        let now = now_ms();
        let Some(last_inbound) = state.last_inbound_at_ms else {
            if self.settings.log_verbose {
                tracing::debug!(%route, "proactive: no inbound yet");
            }
            return Ok(None);
        };
        if (now - last_inbound) < self.settings.min_silence_ms as i64 {
            if self.settings.log_verbose {
                tracing::debug!(%route, "proactive: silence threshold not reached");
            }
            return Ok(None);
        }
        if let Some(last_proactive) = state.last_proactive_at_ms {
            if (now - last_proactive) < self.settings.min_interval_ms as i64 {
                if self.settings.log_verbose {
                    tracing::debug!(%route, "proactive: interval not reached");
                }
                return Ok(None);
            }
        }
        if let Err(reason) =
            self.policy
                .check(PolicyStage::BeforeOutbound, &route, Some(SendAction::Text))
        {
            self.trace.emit(
                TraceEvent::new("qq_proactive_blocked", &route, TraceSource::Automation)
                    .drop_reason(reason),
            );
            return Ok(None);
        }

        let text = NUDGE_TEXTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(NUDGE_TEXTS[0]);
        let dispatch_id = format!("{route}:proactive:{now}");
        match self.deliverer.deliver_text(&route, &dispatch_id, text).await {
            Ok(()) => {
                self.policy
                    .bump_usage(&route, Some(SendAction::Text), false)?;
                state.last_proactive_at_ms = Some(now);
                write_json_atomic(&self.state_path(&route)?, &state)?;
                self.trace.emit(TraceEvent::new(
                    "qq_proactive_sent",
                    &route,
                    TraceSource::Automation,
                ));
                Ok(Some(text.to_string()))
            }
            Err(reason) => {
                self.trace.emit(
                    TraceEvent::new("qq_proactive_dropped", &route, TraceSource::Automation)
                        .drop_reason(reason),
                );
                Ok(None)
            }
        }
    }

    pub async fn run(&self) -> Result<()> {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if let Err(e) = self.tick().await {
                tracing::warn!("proactive tick failed: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DropReason;
    use crate::outbound::normalize::OutboundMediaItem;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    struct CountingDeliverer {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Deliverer for CountingDeliverer {
        async fn deliver_text(
            &self,
            _route: &str,
            _dispatch_id: &str,
            chunk: &str,
        ) -> Result<(), DropReason> {
            self.sent.lock().push(chunk.to_string());
            Ok(())
        }

        async fn deliver_media(
            &self,
            _route: &str,
            _dispatch_id: &str,
            _item: &OutboundMediaItem,
        ) -> Result<(), DropReason> {
            Ok(())
        }
    }

    fn nudge_in(tmp: &TempDir, settings: ProactiveSettings) -> (ProactiveNudge, Arc<CountingDeliverer>) {
        let store = RouteStore::new(tmp.path());
        let deliverer = Arc::new(CountingDeliverer {
            sent: Mutex::new(Vec::new()),
        });
        let nudge = ProactiveNudge::new(
            settings,
            store.clone(),
            Arc::new(PolicyEngine::new(store.clone(), "qq-main", None)),
            Arc::new(TraceLogger::new(store)),
            deliverer.clone(),
        );
        (nudge, deliverer)
    }

    fn settings(route: &str) -> ProactiveSettings {
        ProactiveSettings {
            enabled: true,
            route: Some(route.to_string()),
            min_silence_ms: 60_000,
            min_interval_ms: 120_000,
            log_verbose: false,
        }
    }

    #[tokio::test]
    async fn no_inbound_means_no_nudge() {
        let tmp = TempDir::new().unwrap();
        let (nudge, deliverer) = nudge_in(&tmp, settings("user:1001"));
        assert!(nudge.tick().await.unwrap().is_none());
        assert!(deliverer.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn silent_route_gets_a_nudge_once_per_interval() {
        let tmp = TempDir::new().unwrap();
        let (nudge, deliverer) = nudge_in(&tmp, settings("user:1001"));
        nudge
            .store
            .note_inbound("user:1001", now_ms() - 10 * 60_000)
            .unwrap();

        let first = nudge.tick().await.unwrap();
        assert!(first.is_some());
        assert_eq!(deliverer.sent.lock().len(), 1);

        // Interval guard blocks an immediate second nudge.
        let second = nudge.tick().await.unwrap();
        assert!(second.is_none());
        assert_eq!(deliverer.sent.lock().len(), 1);

        // State survived to disk.
        let state: ProactiveState = read_json(
            &tmp.path()
                .join("qq_sessions")
                .join("user__1001")
                .join("meta")
                .join("proactive-state.json"),
        )
        .unwrap()
        .unwrap();
        assert!(state.last_proactive_at_ms.is_some());
    }

    #[tokio::test]
    async fn recent_inbound_blocks_nudge() {
        let tmp = TempDir::new().unwrap();
        let (nudge, deliverer) = nudge_in(&tmp, settings("user:1001"));
        nudge.store.note_inbound("user:1001", now_ms() - 1_000).unwrap();
        assert!(nudge.tick().await.unwrap().is_none());
        assert!(deliverer.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn disabled_feature_is_inert() {
        let tmp = TempDir::new().unwrap();
        let mut inert = settings("user:1001");
        inert.enabled = false;
        let (nudge, deliverer) = nudge_in(&tmp, inert);
        nudge
            .store
            .note_inbound("user:1001", now_ms() - 10 * 60_000)
            .unwrap();
        assert!(nudge.tick().await.unwrap().is_none());
        assert!(deliverer.sent.lock().is_empty());
    }
}
