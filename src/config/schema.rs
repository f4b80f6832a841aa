use crate::automation::AutomationTarget;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the loaded config file - computed, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Root under which `qq_sessions/` and outbound work dirs live.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,

    #[serde(default)]
    pub reliability: ReliabilityConfig,

    #[serde(default)]
    pub automation: AutomationConfig,

    /// One entry per bot-protocol account.
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            workspace_dir: default_workspace_dir(),
            reliability: ReliabilityConfig::default(),
            automation: AutomationConfig::default(),
            accounts: Vec::new(),
        }
    }
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("workspace")
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Config = toml::from_str(&raw)
            .with_context(|| format!("Invalid config TOML: {}", path.display()))?;
        config.config_path = path.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (idx, account) in self.accounts.iter().enumerate() {
            if account.ws_url.trim().is_empty() {
                anyhow::bail!("accounts[{idx}]: ws_url is required");
            }
            if account.access_token.trim().is_empty() {
                anyhow::bail!("accounts[{idx}]: access_token is required");
            }
        }
        for target in &self.automation.targets {
            if !crate::route::is_valid_qq_route(&target.route) {
                anyhow::bail!("automation target '{}': invalid route", target.id);
            }
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let rendered = toml::to_string_pretty(self).context("Failed to serialize config")?;
        crate::store::write_atomic(&self.config_path, rendered.as_bytes())
    }

    pub fn sessions_root(&self) -> PathBuf {
        self.workspace_dir.join("qq_sessions")
    }
}

// ── Daemon supervision ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// First restart delay after a supervised component fails.
    #[serde(default = "default_initial_backoff_secs")]
    pub component_initial_backoff_secs: u64,
    /// Restart delay ceiling.
    #[serde(default = "default_max_backoff_secs")]
    pub component_max_backoff_secs: u64,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            component_initial_backoff_secs: default_initial_backoff_secs(),
            component_max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

fn default_initial_backoff_secs() -> u64 {
    2
}
fn default_max_backoff_secs() -> u64 {
    60
}

// ── Automation ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Reconcile cadence; clamped to >= 15s at use sites.
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
    /// Reject targets whose execution mode is not agent-only.
    #[serde(default = "default_true")]
    pub strict_agent_only: bool,
    #[serde(default)]
    pub targets: Vec<AutomationTarget>,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            reconcile_interval_ms: default_reconcile_interval_ms(),
            strict_agent_only: true,
            targets: Vec::new(),
        }
    }
}

fn default_reconcile_interval_ms() -> u64 {
    120_000
}

// ── Per-account options ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InterruptPolicy {
    Preempt,
    QueueLatest,
    #[default]
    Adaptive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ResolvePrefer {
    #[default]
    NapcatFirst,
    DirectFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StreamPrefer {
    #[default]
    StreamFirst,
    HttpFirst,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Stable identifier for this account in logs and route metadata.
    #[serde(default = "default_account_id")]
    pub account_id: String,
    pub ws_url: String,
    pub access_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_user_id: Option<String>,
    #[serde(default)]
    pub admins: Vec<String>,
    #[serde(default)]
    pub blocked_users: Vec<String>,
    /// Empty list means every group is allowed.
    #[serde(default)]
    pub allowed_groups: Vec<String>,
    #[serde(default)]
    pub enable_guilds: bool,
    #[serde(default = "default_true")]
    pub enable_deduplication: bool,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default)]
    pub require_mention: bool,
    #[serde(default)]
    pub keyword_triggers: Vec<String>,

    #[serde(default = "default_reply_run_timeout_ms")]
    pub reply_run_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub reply_abort_on_timeout: bool,
    #[serde(default = "default_true")]
    pub route_preempt_old_run: bool,
    #[serde(default)]
    pub interrupt_policy: InterruptPolicy,
    /// Coalescing sleep after preempt/first inbound; falls back to the
    /// aggregate window when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt_window_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub interrupt_coalesce_enabled: bool,
    #[serde(default = "default_degrade_window_ms")]
    pub adaptive_timeout_degrade_window_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_interrupt_policy: Option<InterruptPolicy>,
    #[serde(default = "default_file_task_lock_ms")]
    pub file_task_lock_ms: u64,

    #[serde(default = "default_outbound_text_dedup_ms")]
    pub outbound_text_dedup_window_ms: u64,
    #[serde(default = "default_outbound_repeat_guard_ms")]
    pub outbound_repeat_guard_window_ms: u64,
    #[serde(default = "default_true")]
    pub outbound_abort_pattern_strict: bool,
    #[serde(default = "default_true")]
    pub outbound_fallback_on_drop: bool,
    #[serde(default = "default_fallback_cooldown_ms")]
    pub outbound_fallback_cooldown_ms: u64,
    #[serde(default)]
    pub enable_error_notify: bool,
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    /// Overrides the send queue's base pacing delay when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_ms: Option<u64>,
    /// Strip markdown and de-fang links before sending.
    #[serde(default)]
    pub anti_risk_mode: bool,

    #[serde(default)]
    pub media_path_allowlist: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_base_path: Option<PathBuf>,

    // Nested option groups last: TOML tables follow plain values.
    #[serde(default)]
    pub aggregate: AggregateConfig,
    #[serde(default)]
    pub send: SendQueueConfig,
    #[serde(default)]
    pub inbound_media: InboundMediaConfig,
    #[serde(default)]
    pub media_relay: MediaRelayConfig,
    #[serde(default)]
    pub tasks: TaskGuardrails,
    #[serde(default)]
    pub proactive_dm: ProactiveDmConfig,
}

impl Default for AccountConfig {
    fn default() -> Self {
        // serde round-trips Default for tests; a usable account still needs
        // ws_url/access_token filled in.
        Self {
            account_id: default_account_id(),
            ws_url: String::new(),
            access_token: String::new(),
            owner_user_id: None,
            admins: Vec::new(),
            blocked_users: Vec::new(),
            allowed_groups: Vec::new(),
            enable_guilds: false,
            enable_deduplication: true,
            history_limit: default_history_limit(),
            require_mention: false,
            keyword_triggers: Vec::new(),
            aggregate: AggregateConfig::default(),
            reply_run_timeout_ms: default_reply_run_timeout_ms(),
            reply_abort_on_timeout: true,
            route_preempt_old_run: true,
            interrupt_policy: InterruptPolicy::Adaptive,
            interrupt_window_ms: None,
            interrupt_coalesce_enabled: true,
            adaptive_timeout_degrade_window_ms: default_degrade_window_ms(),
            media_interrupt_policy: None,
            file_task_lock_ms: default_file_task_lock_ms(),
            send: SendQueueConfig::default(),
            outbound_text_dedup_window_ms: default_outbound_text_dedup_ms(),
            outbound_repeat_guard_window_ms: default_outbound_repeat_guard_ms(),
            outbound_abort_pattern_strict: true,
            outbound_fallback_on_drop: true,
            outbound_fallback_cooldown_ms: default_fallback_cooldown_ms(),
            enable_error_notify: false,
            max_message_length: default_max_message_length(),
            rate_limit_ms: None,
            anti_risk_mode: false,
            inbound_media: InboundMediaConfig::default(),
            media_relay: MediaRelayConfig::default(),
            media_path_allowlist: Vec::new(),
            voice_base_path: None,
            tasks: TaskGuardrails::default(),
            proactive_dm: ProactiveDmConfig::default(),
        }
    }
}

impl AccountConfig {
    /// Coalescing window for the dispatch engine: the explicit interrupt
    /// window when set, else the aggregate window for the route kind.
    pub fn interrupt_window_for(&self, route: &str) -> u64 {
        self.interrupt_window_ms
            .unwrap_or_else(|| self.aggregate.window_for(route))
    }
}

fn default_account_id() -> String {
    "qq-main".to_string()
}
fn default_history_limit() -> usize {
    20
}
fn default_reply_run_timeout_ms() -> u64 {
    600_000
}
fn default_degrade_window_ms() -> u64 {
    120_000
}
fn default_file_task_lock_ms() -> u64 {
    60_000
}
fn default_outbound_text_dedup_ms() -> u64 {
    12_000
}
fn default_outbound_repeat_guard_ms() -> u64 {
    12_000
}
fn default_fallback_cooldown_ms() -> u64 {
    30_000
}
fn default_max_message_length() -> usize {
    4_000
}

// ── Aggregation windows ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateConfig {
    #[serde(default = "default_aggregate_window_ms")]
    pub window_ms: u64,
    /// Private-chat override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dm_window_ms: Option<u64>,
    /// Group-chat override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_window_ms: Option<u64>,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            window_ms: default_aggregate_window_ms(),
            dm_window_ms: None,
            group_window_ms: None,
        }
    }
}

impl AggregateConfig {
    pub fn window_for(&self, route: &str) -> u64 {
        if route.starts_with("user:") {
            self.dm_window_ms.unwrap_or(self.window_ms)
        } else if route.starts_with("group:") {
            self.group_window_ms.unwrap_or(self.window_ms)
        } else {
            self.window_ms
        }
    }
}

fn default_aggregate_window_ms() -> u64 {
    900
}

// ── Send queue ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendQueueConfig {
    #[serde(default = "default_send_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_send_jitter_ms")]
    pub jitter_ms: u64,
    #[serde(default = "default_send_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_min_delay_ms")]
    pub retry_min_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_retry_jitter_ratio")]
    pub retry_jitter_ratio: f64,
    #[serde(default = "default_wait_for_reconnect_ms")]
    pub wait_for_reconnect_ms: u64,
    /// Requeue attempts left for a task hit by a retriable transport error.
    #[serde(default = "default_requeue_attempts")]
    pub requeue_attempts: u32,
    #[serde(default = "default_media_dedup_window_ms")]
    pub media_dedup_window_ms: u64,
}

impl Default for SendQueueConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_send_base_delay_ms(),
            jitter_ms: default_send_jitter_ms(),
            max_retries: default_send_max_retries(),
            retry_min_delay_ms: default_retry_min_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_jitter_ratio: default_retry_jitter_ratio(),
            wait_for_reconnect_ms: default_wait_for_reconnect_ms(),
            requeue_attempts: default_requeue_attempts(),
            media_dedup_window_ms: default_media_dedup_window_ms(),
        }
    }
}

fn default_send_base_delay_ms() -> u64 {
    1_000
}
fn default_send_jitter_ms() -> u64 {
    400
}
fn default_send_max_retries() -> u32 {
    3
}
fn default_retry_min_delay_ms() -> u64 {
    500
}
fn default_retry_max_delay_ms() -> u64 {
    8_000
}
fn default_retry_jitter_ratio() -> f64 {
    0.15
}
fn default_wait_for_reconnect_ms() -> u64 {
    5_000
}
fn default_requeue_attempts() -> u32 {
    1
}
fn default_media_dedup_window_ms() -> u64 {
    45_000
}

// ── Inbound media ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMediaConfig {
    #[serde(default)]
    pub resolve_prefer: ResolvePrefer,
    #[serde(default = "default_media_http_timeout_ms")]
    pub http_timeout_ms: u64,
    #[serde(default = "default_media_http_retries")]
    pub http_retries: u32,
    #[serde(default)]
    pub use_stream: bool,
    #[serde(default = "default_true")]
    pub fallback_get_msg: bool,
    #[serde(default = "default_media_max_per_message")]
    pub max_per_message: usize,
}

impl Default for InboundMediaConfig {
    fn default() -> Self {
        Self {
            resolve_prefer: ResolvePrefer::NapcatFirst,
            http_timeout_ms: default_media_http_timeout_ms(),
            http_retries: default_media_http_retries(),
            use_stream: false,
            fallback_get_msg: true,
            max_per_message: default_media_max_per_message(),
        }
    }
}

fn default_media_http_timeout_ms() -> u64 {
    8_000
}
fn default_media_http_retries() -> u32 {
    2
}
fn default_media_max_per_message() -> usize {
    8
}

// ── Outbound media transport ──────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRelayConfig {
    /// Stream upload actions (`upload_file_stream`) are attempted at all.
    #[serde(default)]
    pub stream_transport_enabled: bool,
    #[serde(default)]
    pub stream_transport_prefer: StreamPrefer,
    /// Local HTTP relay serving whitelisted files via signed URLs.
    #[serde(default)]
    pub proxy_enabled: bool,
    #[serde(default = "default_relay_host")]
    pub proxy_host: String,
    #[serde(default = "default_relay_port")]
    pub proxy_port: u16,
    #[serde(default = "default_relay_path")]
    pub proxy_path: String,
    #[serde(default)]
    pub proxy_token: String,
    #[serde(default = "default_relay_ttl_sec")]
    pub proxy_ttl_sec: u64,
}

impl Default for MediaRelayConfig {
    fn default() -> Self {
        Self {
            stream_transport_enabled: false,
            stream_transport_prefer: StreamPrefer::StreamFirst,
            proxy_enabled: false,
            proxy_host: default_relay_host(),
            proxy_port: default_relay_port(),
            proxy_path: default_relay_path(),
            proxy_token: String::new(),
            proxy_ttl_sec: default_relay_ttl_sec(),
        }
    }
}

fn default_relay_host() -> String {
    "127.0.0.1".to_string()
}
fn default_relay_port() -> u16 {
    38_080
}
fn default_relay_path() -> String {
    "/relay".to_string()
}
fn default_relay_ttl_sec() -> u64 {
    300
}

// ── Heavy-task guardrails ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGuardrails {
    /// Clamped to [5s, 10min] at use sites.
    #[serde(default = "default_task_max_runtime_ms")]
    pub max_runtime_ms: u64,
    /// Clamped to [0, 5].
    #[serde(default = "default_task_max_retries")]
    pub max_retries: u32,
    /// Clamped to [1, 8].
    #[serde(default = "default_task_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_true")]
    pub idempotency_enabled: bool,
}

impl Default for TaskGuardrails {
    fn default() -> Self {
        Self {
            max_runtime_ms: default_task_max_runtime_ms(),
            max_retries: default_task_max_retries(),
            max_concurrency: default_task_max_concurrency(),
            idempotency_enabled: true,
        }
    }
}

impl TaskGuardrails {
    pub fn runtime_ms(&self) -> u64 {
        self.max_runtime_ms.clamp(5_000, 600_000)
    }
    pub fn retries(&self) -> u32 {
        self.max_retries.min(5)
    }
    pub fn concurrency(&self) -> usize {
        self.max_concurrency.clamp(1, 8)
    }
}

fn default_task_max_runtime_ms() -> u64 {
    120_000
}
fn default_task_max_retries() -> u32 {
    1
}
fn default_task_max_concurrency() -> usize {
    1
}

// ── Proactive nudge ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProactiveDmConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Target route, e.g. the owner's private chat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default = "default_proactive_min_silence_ms")]
    pub min_silence_ms: u64,
    #[serde(default = "default_proactive_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default)]
    pub log_verbose: bool,
}

impl Default for ProactiveDmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            route: None,
            min_silence_ms: default_proactive_min_silence_ms(),
            min_interval_ms: default_proactive_min_interval_ms(),
            log_verbose: false,
        }
    }
}

fn default_proactive_min_silence_ms() -> u64 {
    4 * 60 * 60 * 1000
}
fn default_proactive_min_interval_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_true() -> bool {
    true
}
