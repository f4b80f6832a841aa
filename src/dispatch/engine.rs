//! The dispatch engine.
//!
//! One logical inbound enters; exactly one of three things leaves: delivered
//! agent replies, a bounded fallback text, or a clean supersede carrying a
//! drop reason. The engine owns the interrupt policy
//! (preempt / queue-latest / adaptive), the post-preempt coalescing window,
//! the dispatch-id lifecycle, heavy-task offload, and the fallback policy.
//!
//! State machine per route:
//! `idle → coalescing → running → delivering → superseded | done`.

use crate::agent::{AgentRuntime, AgentTurnContext, AgentTurnOptions, DeliverFn, ReplyPayload};
use crate::config::{AccountConfig, InterruptPolicy};
use crate::dispatch::aggregator::InboundAggregator;
use crate::dispatch::context::{InFlight, PendingLatest, RouteRuntime};
use crate::dispatch::tasks::{TaskRequest, TaskStatus, TaskUnits};
use crate::errors::DropReason;
use crate::media::resolver::MediaKind;
use crate::outbound::normalize::{is_abort_leak, is_meta_leak, normalize_reply, OutboundMediaItem};
use crate::policy::{PolicyEngine, PolicyStage, SendAction};
use crate::trace::{TraceEvent, TraceLogger, TraceSource};
use crate::util::{now_ms, truncate_with_ellipsis, with_timeout};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const HEAVY_TEXT_CHARS: usize = 800;
const FAST_ACK_TEXT: &str = "收到，正在处理，请稍等。";
const FALLBACK_TEXT: &str = "处理中断，请再发一次。";
const TIMEOUT_NOTIFY_TEXT: &str = "处理中超时，请稍后重试。";
const ERROR_NOTIFY_TEXT: &str = "⚠️ 服务调用失败，请稍后重试。";

/// One logical inbound, post-aggregation.
#[derive(Debug, Clone)]
pub struct ParsedInbound {
    pub route: String,
    pub seq: u64,
    pub msg_id: Option<i64>,
    pub text: String,
    /// Materialized inbound media (local paths), for the agent manifest.
    pub media_urls: Vec<String>,
    pub media_items_total: u32,
    pub media_items_unresolved: u32,
    pub source: TraceSource,
}

/// What one dispatch did.
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    pub dispatch_id: String,
    pub delivered: u32,
    pub drops: Vec<DropReason>,
    pub timed_out: bool,
    pub deduped_task: bool,
}

/// Downstream delivery seam (send queue + protocol), stubbed in tests.
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver_text(
        &self,
        route: &str,
        dispatch_id: &str,
        chunk: &str,
    ) -> Result<(), DropReason>;

    async fn deliver_media(
        &self,
        route: &str,
        dispatch_id: &str,
        item: &OutboundMediaItem,
    ) -> Result<(), DropReason>;
}

enum Step {
    Done(DispatchOutcome),
    /// Queued as pending-latest; nothing ran.
    Queued,
    /// Superseded before or after the run; nothing to drain.
    Superseded(DropReason),
    /// Dropped before the run started (policy).
    Dropped(DropReason),
}

pub struct DispatchEngine {
    account: AccountConfig,
    context: Arc<RouteRuntime>,
    aggregator: Arc<InboundAggregator>,
    policy: Arc<PolicyEngine>,
    trace: Arc<TraceLogger>,
    tasks: Arc<TaskUnits>,
    runtime: Arc<dyn AgentRuntime>,
    deliverer: Arc<dyn Deliverer>,
    recent_outbound: Arc<Mutex<HashMap<String, Instant>>>,
    last_fallback_at: Mutex<HashMap<String, Instant>>,
}

impl DispatchEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account: AccountConfig,
        context: Arc<RouteRuntime>,
        aggregator: Arc<InboundAggregator>,
        policy: Arc<PolicyEngine>,
        trace: Arc<TraceLogger>,
        tasks: Arc<TaskUnits>,
        runtime: Arc<dyn AgentRuntime>,
        deliverer: Arc<dyn Deliverer>,
    ) -> Self {
        Self {
            account,
            context,
            aggregator,
            policy,
            trace,
            tasks,
            runtime,
            deliverer,
            recent_outbound: Arc::new(Mutex::new(HashMap::new())),
            last_fallback_at: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<RouteRuntime> {
        &self.context
    }

    pub fn aggregator(&self) -> &Arc<InboundAggregator> {
        &self.aggregator
    }

    /// Process one logical inbound, then drain any newer pending-latest the
    /// run left behind.
    pub async fn handle_inbound(&self, parsed: ParsedInbound) -> Result<DispatchOutcome> {
        let mut current = parsed;
        loop {
            let step = self.dispatch_once(&current).await?;
            let outcome = match step {
                Step::Done(outcome) => outcome,
                Step::Queued => {
                    return Ok(DispatchOutcome {
                        drops: vec![],
                        ..DispatchOutcome::default()
                    })
                }
                Step::Superseded(reason) | Step::Dropped(reason) => {
                    return Ok(DispatchOutcome {
                        drops: vec![reason],
                        ..DispatchOutcome::default()
                    })
                }
            };

            match self.context.take_pending(&current.route) {
                Some(pending) if pending.inbound_seq > current.seq => {
                    current = ParsedInbound {
                        route: pending.route,
                        seq: pending.inbound_seq,
                        msg_id: pending.msg_id,
                        text: pending.text,
                        media_urls: pending.media_urls,
                        media_items_total: pending.media_items_total,
                        media_items_unresolved: pending.media_items_unresolved,
                        source: TraceSource::Chat,
                    };
                }
                Some(stale) => {
                    // Already covered by the run that just finished.
                    self.trace.emit(
                        TraceEvent::new("qq_pending_dropped", &stale.route, TraceSource::Chat)
                            .msg_id(stale.msg_id)
                            .drop_reason(DropReason::MergedIntoNewerInbound),
                    );
                    return Ok(outcome);
                }
                None => return Ok(outcome),
            }
        }
    }

    fn effective_policy(&self, parsed: &ParsedInbound) -> InterruptPolicy {
        let has_media = parsed.media_items_total > 0;
        let configured = if has_media {
            self.account
                .media_interrupt_policy
                .unwrap_or(self.account.interrupt_policy)
        } else {
            self.account.interrupt_policy
        };
        match configured {
            InterruptPolicy::Adaptive => {
                let degraded = self.context.had_recent_timeout(
                    &parsed.route,
                    Duration::from_millis(self.account.adaptive_timeout_degrade_window_ms),
                ) || self.context.is_file_task_locked(&parsed.route);
                if degraded {
                    InterruptPolicy::QueueLatest
                } else {
                    InterruptPolicy::Preempt
                }
            }
            fixed => fixed,
        }
    }

    async fn dispatch_once(&self, parsed: &ParsedInbound) -> Result<Step> {
        let route = parsed.route.clone();

        if let Err(reason) = self.policy.check(PolicyStage::BeforeDispatch, &route, None) {
            self.trace.emit(
                TraceEvent::new("qq_dispatch_blocked", &route, parsed.source)
                    .msg_id(parsed.msg_id)
                    .drop_reason(reason),
            );
            return Ok(Step::Dropped(reason));
        }

        let mut preempting = false;
        if self.context.current_in_flight(&route).is_some() {
            let effective = self.effective_policy(parsed);
            let queue_latest = effective == InterruptPolicy::QueueLatest
                || !self.account.route_preempt_old_run;
            if queue_latest {
                let entry = PendingLatest {
                    route: route.clone(),
                    msg_id: parsed.msg_id,
                    inbound_seq: parsed.seq,
                    has_inbound_media_like: parsed.media_items_total > 0,
                    updated_at_ms: now_ms(),
                    text: parsed.text.clone(),
                    media_urls: parsed.media_urls.clone(),
                    media_items_total: parsed.media_items_total,
                    media_items_unresolved: parsed.media_items_unresolved,
                };
                if let Some(old) = self.context.set_pending(entry) {
                    self.trace.emit(
                        TraceEvent::new("qq_pending_superseded", &route, parsed.source)
                            .msg_id(old.msg_id)
                            .drop_reason(DropReason::QueuedSupersededByNewerInbound),
                    );
                }
                return Ok(Step::Queued);
            }
            preempting = true;
        }

        // Coalescing window: give an even-newer inbound the chance to win
        // before we commit a dispatch.
        if self.account.interrupt_coalesce_enabled {
            let window = self.account.interrupt_window_for(&route);
            if window > 0 {
                tokio::time::sleep(Duration::from_millis(window)).await;
                if self.aggregator.current_seq(&route) > parsed.seq {
                    let reason = if preempting {
                        DropReason::CoalesceSupersededAfterPreempt
                    } else {
                        DropReason::MergedIntoNewerInbound
                    };
                    self.trace.emit(
                        TraceEvent::new("qq_dispatch_coalesced", &route, parsed.source)
                            .msg_id(parsed.msg_id)
                            .drop_reason(reason),
                    );
                    return Ok(Step::Superseded(reason));
                }
            }
        }

        let (inflight, previous) = self.context.begin_route_in_flight(&route, parsed.msg_id);
        if let Some(previous) = previous {
            previous.cancel.cancel();
            self.trace.emit(
                TraceEvent::new("qq_dispatch_preempted", &route, parsed.source)
                    .msg_id(previous.msg_id)
                    .dispatch_id(&previous.dispatch_id)
                    .drop_reason(DropReason::DispatchAborted),
            );
        }
        self.trace.emit(
            TraceEvent::new("qq_dispatch_start", &route, parsed.source)
                .msg_id(parsed.msg_id)
                .dispatch_id(&inflight.dispatch_id),
        );

        let has_media = parsed.media_items_total > 0;
        if has_media {
            self.context.lock_file_task(
                &route,
                Duration::from_millis(self.account.file_task_lock_ms),
            );
            // Fast-ack so long media runs feel responsive. Not counted as an
            // agent delivery: a dead run after the ack still earns a fallback.
            let _ = self
                .deliverer
                .deliver_text(&route, &inflight.dispatch_id, FAST_ACK_TEXT)
                .await;
        }

        let outcome_acc = Arc::new(Mutex::new(DispatchOutcome {
            dispatch_id: inflight.dispatch_id.clone(),
            ..DispatchOutcome::default()
        }));
        let turn_ctx = self.build_turn_context(parsed, &inflight, outcome_acc.clone());

        let heavy = has_media || parsed.text.chars().count() >= HEAVY_TEXT_CHARS;
        let run_failed = if heavy {
            self.run_heavy(parsed, &inflight, turn_ctx, outcome_acc.clone())
                .await
        } else {
            self.run_direct(&inflight, turn_ctx, outcome_acc.clone()).await
        };

        // A preempted run must not touch the successor's state from here on.
        let current = self.context.current_dispatch_id(&route);
        if current.as_deref() != Some(inflight.dispatch_id.as_str()) {
            self.trace.emit(
                TraceEvent::new("qq_dispatch_superseded", &route, parsed.source)
                    .msg_id(parsed.msg_id)
                    .dispatch_id(&inflight.dispatch_id)
                    .drop_reason(DropReason::DispatchIdMismatch),
            );
            return Ok(Step::Superseded(DropReason::DispatchIdMismatch));
        }
        self.context
            .clear_route_in_flight(&route, &inflight.dispatch_id);

        let mut outcome = outcome_acc.lock().clone();
        if !run_failed {
            if let Err(e) = self.policy.bump_usage(&route, None, true) {
                tracing::warn!(%route, "dispatch usage bump failed: {e:#}");
            }
        }

        self.maybe_notify_error(&route, &inflight, &outcome, run_failed).await;
        self.maybe_send_fallback(&route, &inflight, &mut outcome).await;

        self.trace.emit(
            TraceEvent::new("qq_dispatch_done", &route, parsed.source)
                .msg_id(parsed.msg_id)
                .dispatch_id(&inflight.dispatch_id),
        );
        Ok(Step::Done(outcome))
    }

    fn build_turn_context(
        &self,
        parsed: &ParsedInbound,
        inflight: &InFlight,
        outcome: Arc<Mutex<DispatchOutcome>>,
    ) -> AgentTurnContext {
        let manifest = if parsed.media_items_total > 0 {
            Some(format!(
                "<inbound_media_manifest> items={} unresolved={} materialized={} files={}</inbound_media_manifest>",
                parsed.media_items_total,
                parsed.media_items_unresolved,
                parsed.media_urls.len(),
                parsed.media_urls.join(",")
            ))
        } else {
            None
        };
        let session_key = crate::route::session_key(&parsed.route, self.policy_owner())
            .unwrap_or_else(|| format!("agent:unknown:{}", parsed.route));
        AgentTurnContext {
            route: parsed.route.clone(),
            session_key,
            text: parsed.text.clone(),
            media_manifest: manifest,
            deliver: self.make_deliver_fn(parsed.route.clone(), inflight, outcome),
            cancel: inflight.cancel.clone(),
        }
    }

    fn policy_owner(&self) -> Option<&str> {
        self.account.owner_user_id.as_deref()
    }

    /// Direct agent invocation bounded by the reply-run timeout. Returns
    /// `true` when the run failed (timeout included).
    async fn run_direct(
        &self,
        inflight: &InFlight,
        ctx: AgentTurnContext,
        outcome: Arc<Mutex<DispatchOutcome>>,
    ) -> bool {
        let cancel = inflight.cancel.clone();
        let abort_on_timeout = self.account.reply_abort_on_timeout;
        let result = with_timeout(
            self.runtime.dispatch_reply(ctx, AgentTurnOptions::default()),
            self.account.reply_run_timeout_ms,
            "agent_reply_run",
            Some(move || {
                if abort_on_timeout {
                    cancel.cancel();
                }
            }),
        )
        .await;

        match result {
            Ok(()) => false,
            Err(e) => {
                let timed_out = e.to_string().contains("timeout after");
                let mut acc = outcome.lock();
                if timed_out {
                    acc.timed_out = true;
                    acc.drops.push(DropReason::DispatchTimeout);
                    drop(acc);
                    self.context.note_timeout(&inflight.route);
                    self.trace.emit(
                        TraceEvent::new("qq_dispatch_timeout", &inflight.route, TraceSource::Chat)
                            .dispatch_id(&inflight.dispatch_id)
                            .drop_reason(DropReason::DispatchTimeout),
                    );
                } else {
                    acc.drops.push(DropReason::UnknownError);
                    drop(acc);
                    self.trace.emit(
                        TraceEvent::new("qq_dispatch_error", &inflight.route, TraceSource::Chat)
                            .dispatch_id(&inflight.dispatch_id)
                            .error(&format!("{e:#}")),
                    );
                }
                true
            }
        }
    }

    /// Heavy dispatch: the agent call runs inside a task unit with its own
    /// guardrails and idempotency.
    async fn run_heavy(
        &self,
        parsed: &ParsedInbound,
        inflight: &InFlight,
        ctx: AgentTurnContext,
        outcome: Arc<Mutex<DispatchOutcome>>,
    ) -> bool {
        let payload_summary = format!(
            "{}|media={}",
            truncate_with_ellipsis(&parsed.text, 120),
            parsed.media_items_total
        );
        let request = TaskRequest {
            route: parsed.route.clone(),
            msg_id: parsed.msg_id,
            dispatch_id: inflight.dispatch_id.clone(),
            task_kind: "agent_turn".to_string(),
            payload_summary,
        };
        let runtime = self.runtime.clone();
        let task_result = self
            .tasks
            .run(request, move || {
                let runtime = runtime.clone();
                let ctx = ctx.clone();
                Box::pin(async move {
                    runtime
                        .dispatch_reply(ctx, AgentTurnOptions::default())
                        .await?;
                    Ok("agent_turn_done".to_string())
                })
            })
            .await;

        match task_result {
            Ok(task) => {
                if task.deduped {
                    outcome.lock().deduped_task = true;
                    return false;
                }
                match task.status {
                    TaskStatus::Succeeded => false,
                    TaskStatus::Timeout => {
                        let mut acc = outcome.lock();
                        acc.timed_out = true;
                        acc.drops.push(DropReason::DispatchTimeout);
                        drop(acc);
                        self.context.note_timeout(&parsed.route);
                        true
                    }
                    _ => {
                        outcome.lock().drops.push(DropReason::UnknownError);
                        true
                    }
                }
            }
            Err(e) => {
                tracing::warn!(route = %parsed.route, "task scheduling failed: {e:#}");
                outcome.lock().drops.push(DropReason::UnknownError);
                true
            }
        }
    }

    /// The deliver callback handed to the agent runtime. Every reply payload
    /// passes normalization, leak guards, the outbound-text dedup window,
    /// supersession/cancel checks, and policy before anything is sent.
    fn make_deliver_fn(
        &self,
        route: String,
        inflight: &InFlight,
        outcome: Arc<Mutex<DispatchOutcome>>,
    ) -> DeliverFn {
        let dispatch_id = inflight.dispatch_id.clone();
        let cancel = inflight.cancel.clone();
        let context = self.context.clone();
        let policy = self.policy.clone();
        let trace = self.trace.clone();
        let deliverer = self.deliverer.clone();
        let recent_outbound = self.recent_outbound.clone();
        let max_len = self.account.max_message_length;
        let anti_risk = self.account.anti_risk_mode;
        let strict_abort = self.account.outbound_abort_pattern_strict;
        // Suppression holds for the longer of the dedup and repeat-guard
        // windows.
        let dedup_window = Duration::from_millis(
            self.account
                .outbound_text_dedup_window_ms
                .max(self.account.outbound_repeat_guard_window_ms),
        );

        Arc::new(move |payload: ReplyPayload| {
            let route = route.clone();
            let dispatch_id = dispatch_id.clone();
            let cancel = cancel.clone();
            let context = context.clone();
            let policy = policy.clone();
            let trace = trace.clone();
            let deliverer = deliverer.clone();
            let recent_outbound = recent_outbound.clone();
            let outcome = outcome.clone();

            Box::pin(async move {
                let normalized =
                    normalize_reply(&payload, max_len, anti_risk, payload.split_send);

                let record_drop = |reason: DropReason| {
                    outcome.lock().drops.push(reason);
                    trace.emit(
                        TraceEvent::new("qq_send_dropped", &route, TraceSource::Chat)
                            .dispatch_id(&dispatch_id)
                            .drop_reason(reason),
                    );
                };

                for chunk in &normalized.chunks {
                    if cancel.is_cancelled() {
                        record_drop(DropReason::DispatchAborted);
                        continue;
                    }
                    if context.current_dispatch_id(&route).as_deref() != Some(dispatch_id.as_str())
                    {
                        record_drop(DropReason::DispatchIdMismatch);
                        continue;
                    }
                    if is_meta_leak(chunk) {
                        record_drop(DropReason::AutomationMetaLeakGuard);
                        continue;
                    }
                    if is_abort_leak(chunk, strict_abort) {
                        record_drop(DropReason::AbortTextSuppressed);
                        continue;
                    }
                    {
                        let key = format!("{route}|{chunk}");
                        let mut recent = recent_outbound.lock();
                        recent.retain(|_, at| at.elapsed() < dedup_window);
                        if recent.contains_key(&key) {
                            record_drop(DropReason::DuplicateTextSuppressed);
                            continue;
                        }
                        recent.insert(key, Instant::now());
                    }
                    if let Err(reason) =
                        policy.check(PolicyStage::BeforeOutbound, &route, Some(SendAction::Text))
                    {
                        record_drop(reason);
                        continue;
                    }
                    match deliverer.deliver_text(&route, &dispatch_id, chunk).await {
                        Ok(()) => {
                            outcome.lock().delivered += 1;
                            if let Err(e) = policy.bump_usage(&route, Some(SendAction::Text), false)
                            {
                                tracing::warn!(%route, "usage bump failed: {e:#}");
                            }
                        }
                        Err(reason) => record_drop(reason),
                    }
                }

                for item in &normalized.media {
                    if cancel.is_cancelled() {
                        record_drop(DropReason::DispatchAborted);
                        continue;
                    }
                    if context.current_dispatch_id(&route).as_deref() != Some(dispatch_id.as_str())
                    {
                        record_drop(DropReason::DispatchIdMismatch);
                        continue;
                    }
                    let action = if item.kind == MediaKind::Record {
                        SendAction::Voice
                    } else {
                        SendAction::Media
                    };
                    if let Err(reason) =
                        policy.check(PolicyStage::BeforeOutbound, &route, Some(action))
                    {
                        record_drop(reason);
                        continue;
                    }
                    if item.kind == MediaKind::Image && !admit_image(&policy, &route) {
                        record_drop(DropReason::QuotaExceeded);
                        continue;
                    }
                    match deliverer.deliver_media(&route, &dispatch_id, item).await {
                        Ok(()) => {
                            outcome.lock().delivered += 1;
                            if let Err(e) = policy.bump_usage(&route, Some(action), false) {
                                tracing::warn!(%route, "usage bump failed: {e:#}");
                            }
                        }
                        Err(reason) => record_drop(reason),
                    }
                }
                Ok(())
            })
        })
    }

    async fn maybe_notify_error(
        &self,
        route: &str,
        inflight: &InFlight,
        outcome: &DispatchOutcome,
        run_failed: bool,
    ) {
        if !run_failed || !self.account.enable_error_notify {
            return;
        }
        let text = if outcome.timed_out {
            TIMEOUT_NOTIFY_TEXT
        } else {
            ERROR_NOTIFY_TEXT
        };
        let _ = self
            .deliverer
            .deliver_text(route, &inflight.dispatch_id, text)
            .await;
    }

    /// Consolidated fallback policy: send iff this dispatch delivered nothing
    /// AND at least one drop was fallback-eligible AND the cooldown elapsed.
    async fn maybe_send_fallback(
        &self,
        route: &str,
        inflight: &InFlight,
        outcome: &mut DispatchOutcome,
    ) {
        if !self.account.outbound_fallback_on_drop
            || outcome.delivered > 0
            || !outcome.drops.iter().any(|d| d.is_fallback_eligible())
        {
            return;
        }
        let cooldown = Duration::from_millis(self.account.outbound_fallback_cooldown_ms);
        {
            let mut last = self.last_fallback_at.lock();
            if last
                .get(route)
                .is_some_and(|at| at.elapsed() < cooldown)
            {
                return;
            }
            last.insert(route.to_string(), Instant::now());
        }
        if self
            .deliverer
            .deliver_text(route, &inflight.dispatch_id, FALLBACK_TEXT)
            .await
            .is_ok()
        {
            outcome.delivered += 1;
        }
    }
}

fn admit_image(policy: &PolicyEngine, route: &str) -> bool {
    let Ok(mut state) = policy.load_state(route) else {
        return true;
    };
    let admitted = state.admit_image(now_ms());
    if let Err(e) = policy.save_state(route, &mut state) {
        tracing::warn!(%route, "conversation state save failed: {e:#}");
    }
    admitted
}
