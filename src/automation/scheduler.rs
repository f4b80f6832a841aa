//! Periodic reconcile of automation targets.
//!
//! Each pass walks the configured targets, evaluates due-ness, applies the
//! smart throttle, and fires due turns through the dispatch engine. Every
//! evaluation that triggers (fired or skipped) persists the target state to
//! `meta/automation-latest.json` and appends a line to
//! `meta/automation-state.ndjson` under the route's meta dir.

use super::{is_due, smart_skip_reason, AutomationTarget, ExecutionMode, TargetState};
use crate::config::AutomationConfig;
use crate::dispatch::{DispatchEngine, ParsedInbound};
use crate::policy::PolicyEngine;
use crate::store::{append_ndjson, read_json, write_json_atomic, RouteStore};
use crate::trace::TraceSource;
use crate::util::now_ms;
use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MIN_RECONCILE_INTERVAL_MS: u64 = 15_000;
const ENSURE_AGENT_COOLDOWN: Duration = Duration::from_secs(60);

pub struct AutomationScheduler {
    config: AutomationConfig,
    engine: Arc<DispatchEngine>,
    policy: Arc<PolicyEngine>,
    store: RouteStore,
    ensure_attempts: Mutex<HashMap<String, Instant>>,
}

impl AutomationScheduler {
    pub fn new(
        config: AutomationConfig,
        engine: Arc<DispatchEngine>,
        policy: Arc<PolicyEngine>,
        store: RouteStore,
    ) -> Self {
        Self {
            config,
            engine,
            policy,
            store,
            ensure_attempts: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(&self) -> Result<()> {
        let interval_ms = self
            .config
            .reconcile_interval_ms
            .max(MIN_RECONCILE_INTERVAL_MS);
        let mut tick = tokio::time::interval(Duration::from_millis(interval_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if let Err(e) = self.reconcile_once(Utc::now()).await {
                tracing::warn!("automation reconcile failed: {e:#}");
            }
        }
    }

    pub async fn reconcile_once(&self, now: DateTime<Utc>) -> Result<()> {
        for target in &self.config.targets {
            if !target.enabled {
                continue;
            }
            if let Err(e) = self.reconcile_target(target, now).await {
                tracing::warn!(target = %target.id, "automation target failed: {e:#}");
            }
        }
        Ok(())
    }

    fn load_state(&self, target: &AutomationTarget) -> TargetState {
        self.store
            .meta_dir(&target.route)
            .ok()
            .and_then(|meta| {
                read_json::<HashMap<String, TargetState>>(&meta.join("automation-latest.json"))
                    .ok()
                    .flatten()
            })
            .and_then(|mut states| states.remove(&target.id))
            .unwrap_or_default()
    }

    fn persist_state(&self, target: &AutomationTarget, state: &TargetState, line: serde_json::Value) {
        let result = self.store.meta_dir(&target.route).and_then(|meta| {
            let latest_path = meta.join("automation-latest.json");
            let mut states: HashMap<String, TargetState> =
                read_json(&latest_path)?.unwrap_or_default();
            states.insert(target.id.clone(), state.clone());
            write_json_atomic(&latest_path, &states)?;
            append_ndjson(&meta.join("automation-state.ndjson"), &line)
        });
        if let Err(e) = result {
            tracing::warn!(target = %target.id, "automation state persist failed: {e:#}");
        }
    }

    /// Rate-limited (once per minute per agent) route-metadata registration.
    /// A failure short-circuits the target for this pass; the persisted error
    /// keeps the failure observable and later passes retry naturally.
    fn ensure_agent(&self, target: &AutomationTarget) -> Result<()> {
        let metadata = {
            let mut attempts = self.ensure_attempts.lock();
            let recently_tried = attempts
                .get(&target.route)
                .is_some_and(|at| at.elapsed() < ENSURE_AGENT_COOLDOWN);
            if recently_tried {
                return Ok(());
            }
            attempts.insert(target.route.clone(), Instant::now());
            self.policy.ensure_metadata(&target.route)
        }?;
        tracing::debug!(
            target = %target.id,
            agent = %metadata.agent_id,
            "automation target agent ensured"
        );
        Ok(())
    }

    async fn reconcile_target(&self, target: &AutomationTarget, now: DateTime<Utc>) -> Result<()> {
        if !crate::route::is_valid_qq_route(&target.route) {
            anyhow::bail!("invalid route: {}", target.route);
        }
        if self.config.strict_agent_only && target.execution_mode != ExecutionMode::AgentOnly {
            let mut state = self.load_state(target);
            state.last_run_result = Some("rejected".to_string());
            state.last_error = Some("executionMode_not_agent_only".to_string());
            self.persist_state(
                target,
                &state,
                json!({
                    "at": now.to_rfc3339(),
                    "targetId": target.id,
                    "triggered": false,
                    "produced": false,
                    "skipped": true,
                    "note": "rejected:executionMode_not_agent_only",
                }),
            );
            return Ok(());
        }

        if let Err(e) = self.ensure_agent(target) {
            let mut state = self.load_state(target);
            state.last_run_result = Some("error".to_string());
            state.last_error = Some(format!("ensure_agent: {e:#}"));
            self.persist_state(
                target,
                &state,
                json!({
                    "at": now.to_rfc3339(),
                    "targetId": target.id,
                    "triggered": false,
                    "produced": false,
                    "skipped": true,
                    "note": "error:ensure_agent",
                }),
            );
            return Ok(());
        }

        let mut state = self.load_state(target);
        let check = is_due(&target.job.schedule, now, &state)?;
        if !check.due {
            return Ok(());
        }

        // The schedule matched. Record the trigger regardless of throttle.
        state.last_triggered_at_ms = Some(now.timestamp_millis());
        if let Some(bucket) = &check.bucket {
            state.last_cron_bucket = Some(bucket.clone());
        }

        if let Some(smart) = &target.job.smart {
            let activity = self.store.read_activity(&target.route)?;
            let random_interval_ms = {
                let min = smart.random_interval_min_minutes.min(smart.random_interval_max_minutes);
                let max = smart.random_interval_max_minutes.max(min);
                rand::thread_rng().gen_range(min..=max) as i64 * 60_000
            };
            if let Some(reason) = smart_skip_reason(
                smart,
                now.timestamp_millis(),
                activity.last_inbound_at_ms,
                activity.last_outbound_at_ms,
                state.last_sent_at_ms,
                random_interval_ms,
            ) {
                state.last_run_result = Some("skipped".to_string());
                state.last_skip_reason = Some(reason.to_string());
                self.persist_state(
                    target,
                    &state,
                    json!({
                        "at": now.to_rfc3339(),
                        "targetId": target.id,
                        "triggered": true,
                        "produced": false,
                        "skipped": true,
                        "note": format!("skip:{reason}"),
                    }),
                );
                return Ok(());
            }
        }

        let message = compose_message(target);
        let seq = self.engine.aggregator().current_seq(&target.route);
        let outcome = self
            .engine
            .handle_inbound(ParsedInbound {
                route: target.route.clone(),
                seq,
                msg_id: None,
                text: message,
                media_urls: Vec::new(),
                media_items_total: 0,
                media_items_unresolved: 0,
                source: TraceSource::Automation,
            })
            .await;

        match outcome {
            Ok(outcome) => {
                let produced = outcome.delivered > 0;
                if produced {
                    state.last_sent_at_ms = Some(now_ms());
                }
                if let super::Schedule::Every { every_ms } = &target.job.schedule {
                    state.next_eligible_at_ms =
                        Some(now.timestamp_millis() + (*every_ms).max(60_000) as i64);
                }
                state.last_run_result = Some(if produced { "ok" } else { "no_output" }.to_string());
                state.last_skip_reason = None;
                state.last_error = None;
                self.persist_state(
                    target,
                    &state,
                    json!({
                        "at": now.to_rfc3339(),
                        "targetId": target.id,
                        "triggered": true,
                        "produced": produced,
                        "skipped": false,
                        "note": "fired",
                    }),
                );
            }
            Err(e) => {
                state.last_run_result = Some("error".to_string());
                state.last_error = Some(format!("{e:#}"));
                self.persist_state(
                    target,
                    &state,
                    json!({
                        "at": now.to_rfc3339(),
                        "targetId": target.id,
                        "triggered": true,
                        "produced": false,
                        "skipped": false,
                        "note": "error:dispatch",
                    }),
                );
            }
        }
        Ok(())
    }
}

/// Prompt for the agent turn, with length guidance when the target caps it.
fn compose_message(target: &AutomationTarget) -> String {
    let mut message = target.job.message.clone();
    if let Some(smart) = &target.job.smart {
        if let Some(max_chars) = smart.max_chars {
            let max_chars = max_chars.clamp(8, 200);
            message.push_str(&format!("\n（回复请控制在{max_chars}字以内。）"));
        }
    }
    message
}
