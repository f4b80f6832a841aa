//! Timer-driven agent turns.
//!
//! Targets come from configuration; a periodic reconcile pass evaluates each
//! target's schedule (`cron` / `every` / `at`), applies the smart-silence
//! throttle, and fires due turns through the same dispatch engine as chat.

pub mod admin;
pub mod schedule;
pub mod scheduler;

use serde::{Deserialize, Serialize};

pub use schedule::{is_due, normalize_cron_expr, DueCheck};
pub use scheduler::AutomationScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    #[default]
    AgentOnly,
    LegacyDeliver,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Schedule {
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
    Every {
        /// Floor 60 000 ms; validated by `audit`.
        #[serde(rename = "everyMs")]
        every_ms: u64,
    },
    At {
        /// RFC 3339 instant.
        at: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_silence_minutes")]
    pub min_silence_minutes: u64,
    #[serde(default = "default_active_conversation_minutes")]
    pub active_conversation_minutes: u64,
    #[serde(default = "default_random_interval_min")]
    pub random_interval_min_minutes: u64,
    #[serde(default = "default_random_interval_max")]
    pub random_interval_max_minutes: u64,
    /// 8..=200 when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_chars: Option<u32>,
}

impl Default for SmartConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_silence_minutes: default_min_silence_minutes(),
            active_conversation_minutes: default_active_conversation_minutes(),
            random_interval_min_minutes: default_random_interval_min(),
            random_interval_max_minutes: default_random_interval_max(),
            max_chars: None,
        }
    }
}

fn default_min_silence_minutes() -> u64 {
    30
}
fn default_active_conversation_minutes() -> u64 {
    25
}
fn default_random_interval_min() -> u64 {
    90
}
fn default_random_interval_max() -> u64 {
    240
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationJob {
    #[serde(rename = "type", default = "default_job_type")]
    pub job_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    pub schedule: Schedule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smart: Option<SmartConfig>,
}

fn default_job_type() -> String {
    "cron-agent-turn".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationTarget {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub route: String,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    pub job: AutomationJob,
}

impl AutomationTarget {
    /// Default target id derived from the route: `user:1001` → `user-1001`.
    pub fn default_id_for_route(route: &str) -> String {
        route.replace(':', "-")
    }
}

/// Persisted per-target runtime state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetState {
    pub last_triggered_at_ms: Option<i64>,
    pub last_sent_at_ms: Option<i64>,
    pub next_eligible_at_ms: Option<i64>,
    pub last_run_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_skip_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// `YYYYMMDDHHMM` of the last cron fire; one fire per matching minute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cron_bucket: Option<String>,
}

/// Smart-throttle verdict: why an otherwise-due target is skipped.
pub fn smart_skip_reason(
    smart: &SmartConfig,
    now_ms: i64,
    last_inbound_at_ms: Option<i64>,
    last_outbound_at_ms: Option<i64>,
    last_sent_at_ms: Option<i64>,
    random_interval_ms: i64,
) -> Option<&'static str> {
    if !smart.enabled {
        return None;
    }
    let Some(last_inbound) = last_inbound_at_ms else {
        return Some("no_inbound_yet");
    };

    let active_window_ms = smart.active_conversation_minutes as i64 * 60_000;
    let last_traffic = last_inbound.max(last_outbound_at_ms.unwrap_or(i64::MIN));
    if now_ms - last_traffic < active_window_ms {
        return Some("active_conversation");
    }

    let min_silence_ms = smart.min_silence_minutes as i64 * 60_000;
    if now_ms - last_inbound < min_silence_ms {
        return Some("silence_not_reached");
    }

    if let Some(last_sent) = last_sent_at_ms {
        if now_ms - last_sent < random_interval_ms {
            return Some("interval_not_reached");
        }
    }
    None
}
