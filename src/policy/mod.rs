//! Route metadata, capability policy, and usage quotas.
//!
//! Each route carries a persisted metadata record (`agent.json`), usage
//! counters (`usage.json`), and lightweight conversation state
//! (`state.json`). Policy checks run before dispatch and before every
//! outbound unit; the configured owner's private route bypasses them.

use crate::errors::DropReason;
use crate::route;
use crate::store::{read_json, write_json_atomic, RouteStore};
use anyhow::Result;
use serde::{Deserialize, Serialize};

// ── Persisted records ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherRules {
    pub heavy_task_delegation: bool,
    pub ack_then_async_result: bool,
    pub idempotency_required: bool,
    pub strict_route_isolation: bool,
}

impl Default for DispatcherRules {
    fn default() -> Self {
        Self {
            heavy_task_delegation: true,
            ack_then_async_result: true,
            idempotency_required: true,
            strict_route_isolation: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub send_text: bool,
    pub send_media: bool,
    pub send_voice: bool,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub max_send_text: Option<u64>,
    #[serde(default)]
    pub max_send_media: Option<u64>,
    #[serde(default)]
    pub max_send_voice: Option<u64>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            send_text: true,
            send_media: true,
            send_voice: false,
            skills: Vec::new(),
            max_send_text: None,
            max_send_media: None,
            max_send_voice: None,
        }
    }
}

impl Capabilities {
    /// Full-capability set for the owner's private route.
    pub fn full() -> Self {
        Self {
            send_voice: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMetadata {
    pub agent_id: String,
    pub route: String,
    pub account_id: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_to_main: Option<bool>,
    pub orchestration_mode: String,
    #[serde(default)]
    pub dispatcher_rules: DispatcherRules,
    #[serde(default)]
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteUsage {
    pub dispatch_count: u64,
    pub send_text_count: u64,
    pub send_media_count: u64,
    pub send_voice_count: u64,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Neutral,
    Cold,
    Annoyed,
    Tired,
}

impl Default for Mood {
    fn default() -> Self {
        Self::Neutral
    }
}

/// Rolling outbound-image quota: at most 5 per 2-hour window per route.
pub const IMAGE_WINDOW_MS: i64 = 2 * 60 * 60 * 1000;
pub const IMAGE_WINDOW_MAX: u32 = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    /// -100..=100
    pub affinity: i32,
    #[serde(default)]
    pub mood: Mood,
    pub banter_count: u64,
    pub image_window_start_ms: i64,
    pub image_count_in_window: u32,
    #[serde(default)]
    pub last_updated_at: Option<String>,
}

impl ConversationState {
    /// Whether another outbound image fits the rolling window, advancing the
    /// window when it has lapsed.
    pub fn admit_image(&mut self, now_ms: i64) -> bool {
        if now_ms - self.image_window_start_ms >= IMAGE_WINDOW_MS {
            self.image_window_start_ms = now_ms;
            self.image_count_in_window = 0;
        }
        if self.image_count_in_window >= IMAGE_WINDOW_MAX {
            return false;
        }
        self.image_count_in_window += 1;
        true
    }
}

// ── Checks ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyStage {
    BeforeDispatch,
    BeforeOutbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendAction {
    Text,
    Media,
    Voice,
}

impl SendAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "send_text",
            Self::Media => "send_media",
            Self::Voice => "send_voice",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyEngine {
    store: RouteStore,
    account_id: String,
    owner_user_id: Option<String>,
}

impl PolicyEngine {
    pub fn new(store: RouteStore, account_id: &str, owner_user_id: Option<String>) -> Self {
        Self {
            store,
            account_id: account_id.to_string(),
            owner_user_id,
        }
    }

    pub fn is_owner_route(&self, route: &str) -> bool {
        match (&self.owner_user_id, route.strip_prefix("user:")) {
            (Some(owner), Some(id)) => owner == id,
            _ => false,
        }
    }

    /// Load route metadata, creating the record on first inbound.
    pub fn ensure_metadata(&self, route: &str) -> Result<RouteMetadata> {
        let path = self.store.agent_file(route)?;
        if let Some(existing) = read_json::<RouteMetadata>(&path)? {
            return Ok(existing);
        }
        let now = chrono::Utc::now().to_rfc3339();
        let owner = self.is_owner_route(route);
        let agent_id = route::resident_agent_id(route, self.owner_user_id.as_deref())
            .ok_or_else(|| anyhow::anyhow!("invalid route: {route}"))?;
        let metadata = RouteMetadata {
            agent_id,
            route: route.to_string(),
            account_id: self.account_id.clone(),
            created_at: now.clone(),
            updated_at: now,
            bound_to_main: owner.then_some(true),
            orchestration_mode: "direct".to_string(),
            dispatcher_rules: DispatcherRules::default(),
            capabilities: if owner {
                Capabilities::full()
            } else {
                Capabilities::default()
            },
        };
        write_json_atomic(&path, &metadata)?;
        Ok(metadata)
    }

    pub fn save_metadata(&self, metadata: &mut RouteMetadata) -> Result<()> {
        metadata.updated_at = chrono::Utc::now().to_rfc3339();
        write_json_atomic(&self.store.agent_file(&metadata.route)?, metadata)
    }

    pub fn load_usage(&self, route: &str) -> Result<RouteUsage> {
        Ok(read_json(&self.store.usage_file(route)?)?.unwrap_or_default())
    }

    pub fn load_state(&self, route: &str) -> Result<ConversationState> {
        Ok(read_json(&self.store.state_file(route)?)?.unwrap_or_default())
    }

    pub fn save_state(&self, route: &str, state: &mut ConversationState) -> Result<()> {
        state.last_updated_at = Some(chrono::Utc::now().to_rfc3339());
        write_json_atomic(&self.store.state_file(route)?, state)
    }

    /// Capability gate. `beforeDispatch` requires `sendText`; `beforeOutbound`
    /// checks the flag matching the action. Owner's private route bypasses.
    pub fn check(
        &self,
        stage: PolicyStage,
        route: &str,
        action: Option<SendAction>,
    ) -> Result<(), DropReason> {
        if self.is_owner_route(route) {
            return Ok(());
        }
        let metadata = self
            .ensure_metadata(route)
            .map_err(|_| DropReason::PolicyBlocked)?;
        let caps = &metadata.capabilities;
        let allowed = match (stage, action) {
            (PolicyStage::BeforeDispatch, _) => caps.send_text,
            (PolicyStage::BeforeOutbound, Some(SendAction::Text)) => caps.send_text,
            (PolicyStage::BeforeOutbound, Some(SendAction::Media)) => caps.send_media,
            (PolicyStage::BeforeOutbound, Some(SendAction::Voice)) => caps.send_voice,
            (PolicyStage::BeforeOutbound, None) => true,
        };
        if !allowed {
            return Err(DropReason::PolicyBlocked);
        }

        if let Some(action) = action {
            let usage = self.load_usage(route).map_err(|_| DropReason::PolicyBlocked)?;
            let (used, limit) = match action {
                SendAction::Text => (usage.send_text_count, caps.max_send_text),
                SendAction::Media => (usage.send_media_count, caps.max_send_media),
                SendAction::Voice => (usage.send_voice_count, caps.max_send_voice),
            };
            if let Some(limit) = limit {
                if used >= limit {
                    return Err(DropReason::QuotaExceeded);
                }
            }
        }
        Ok(())
    }

    /// Bump a counter after a successful operation. Counters only increase.
    pub fn bump_usage(&self, route: &str, action: Option<SendAction>, dispatch: bool) -> Result<()> {
        let path = self.store.usage_file(route)?;
        let mut usage: RouteUsage = read_json(&path)?.unwrap_or_default();
        if dispatch {
            usage.dispatch_count += 1;
        }
        match action {
            Some(SendAction::Text) => usage.send_text_count += 1,
            Some(SendAction::Media) => usage.send_media_count += 1,
            Some(SendAction::Voice) => usage.send_voice_count += 1,
            None => {}
        }
        usage.updated_at = Some(chrono::Utc::now().to_rfc3339());
        write_json_atomic(&path, &usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine(tmp: &TempDir, owner: Option<&str>) -> PolicyEngine {
        PolicyEngine::new(
            RouteStore::new(tmp.path()),
            "qq-main",
            owner.map(str::to_string),
        )
    }

    #[test]
    fn first_inbound_creates_metadata() {
        let tmp = TempDir::new().unwrap();
        let policy = engine(&tmp, None);
        let meta = policy.ensure_metadata("group:100001").unwrap();
        assert_eq!(meta.agent_id, "qq-group-100001");
        assert_eq!(meta.route, "group:100001");
        assert!(meta.capabilities.send_text);
        assert!(meta.bound_to_main.is_none());

        // A second load returns the persisted record, not a fresh one.
        let again = policy.ensure_metadata("group:100001").unwrap();
        assert_eq!(again.created_at, meta.created_at);
    }

    #[test]
    fn owner_route_is_full_capability_and_bound_to_main() {
        let tmp = TempDir::new().unwrap();
        let policy = engine(&tmp, Some("2151539153"));
        let meta = policy.ensure_metadata("user:2151539153").unwrap();
        assert_eq!(meta.agent_id, "main");
        assert_eq!(meta.bound_to_main, Some(true));
        assert!(meta.capabilities.send_voice);
    }

    #[test]
    fn media_capability_off_blocks_outbound_media_only() {
        let tmp = TempDir::new().unwrap();
        let policy = engine(&tmp, None);
        let mut meta = policy.ensure_metadata("group:100002").unwrap();
        meta.capabilities.send_media = false;
        policy.save_metadata(&mut meta).unwrap();

        assert!(policy
            .check(PolicyStage::BeforeOutbound, "group:100002", Some(SendAction::Text))
            .is_ok());
        assert_eq!(
            policy.check(
                PolicyStage::BeforeOutbound,
                "group:100002",
                Some(SendAction::Media)
            ),
            Err(DropReason::PolicyBlocked)
        );
    }

    #[test]
    fn owner_bypasses_policy() {
        let tmp = TempDir::new().unwrap();
        let policy = engine(&tmp, Some("11111"));
        assert!(policy
            .check(PolicyStage::BeforeOutbound, "user:11111", Some(SendAction::Voice))
            .is_ok());
    }

    #[test]
    fn quota_limit_triggers_quota_exceeded() {
        let tmp = TempDir::new().unwrap();
        let policy = engine(&tmp, None);
        let mut meta = policy.ensure_metadata("user:300001").unwrap();
        meta.capabilities.max_send_text = Some(2);
        policy.save_metadata(&mut meta).unwrap();

        policy.bump_usage("user:300001", Some(SendAction::Text), false).unwrap();
        assert!(policy
            .check(PolicyStage::BeforeOutbound, "user:300001", Some(SendAction::Text))
            .is_ok());
        policy.bump_usage("user:300001", Some(SendAction::Text), false).unwrap();
        assert_eq!(
            policy.check(
                PolicyStage::BeforeOutbound,
                "user:300001",
                Some(SendAction::Text)
            ),
            Err(DropReason::QuotaExceeded)
        );
    }

    #[test]
    fn usage_counters_only_increase() {
        let tmp = TempDir::new().unwrap();
        let policy = engine(&tmp, None);
        policy.bump_usage("user:300002", Some(SendAction::Media), true).unwrap();
        policy.bump_usage("user:300002", None, true).unwrap();
        let usage = policy.load_usage("user:300002").unwrap();
        assert_eq!(usage.send_media_count, 1);
        assert_eq!(usage.dispatch_count, 2);
    }

    #[test]
    fn image_window_admits_five_then_blocks() {
        let mut state = ConversationState::default();
        let t0 = 1_000_000;
        for _ in 0..IMAGE_WINDOW_MAX {
            assert!(state.admit_image(t0));
        }
        assert!(!state.admit_image(t0 + 1));
        // Window lapse resets the counter.
        assert!(state.admit_image(t0 + IMAGE_WINDOW_MS));
    }
}
