//! Process-wide delivery queue.
//!
//! Two retry layers, deliberately kept separate:
//!
//! * the queue re-pushes a task once per remaining requeue budget when it
//!   fails with a retriable transport error (socket-level backpressure — wait
//!   for the reconnect, then try the whole task again);
//! * [`send_with_retry`] retries individual protocol attempts inside a task
//!   with exponential backoff and jitter.
//!
//! Between tasks the worker sleeps `base_delay ± jitter` for rate pacing.

use crate::config::SendQueueConfig;
use crate::errors::{is_retriable_transport_error, DropReason};
use crate::onebot::ActionTransport;
use anyhow::Result;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

type SendTaskFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct QueueItem {
    label: String,
    fresh: bool,
    requeue_left: u32,
    task: SendTaskFn,
    done: Option<oneshot::Sender<Result<()>>>,
}

/// FIFO send queue with rate pacing and requeue-on-retriable.
#[derive(Clone)]
pub struct SendQueue {
    tx: mpsc::UnboundedSender<QueueItem>,
}

impl SendQueue {
    /// Create the queue and start its worker.
    pub fn start(config: SendQueueConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self { tx: tx.clone() };
        tokio::spawn(worker(config, tx, rx));
        queue
    }

    /// Enqueue a task; the returned receiver resolves with the terminal
    /// outcome (after any requeues).
    pub fn submit<F>(&self, label: &str, task: F) -> oneshot::Receiver<Result<()>>
    where
        F: Fn() -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let item = QueueItem {
            label: label.to_string(),
            fresh: true,
            requeue_left: 0, // set by the worker from config on first sight
            task: Arc::new(task),
            done: Some(done_tx),
        };
        if self.tx.send(item).is_err() {
            tracing::warn!("send queue is gone; dropping task");
        }
        done_rx
    }
}

async fn worker(
    config: SendQueueConfig,
    tx: mpsc::UnboundedSender<QueueItem>,
    mut rx: mpsc::UnboundedReceiver<QueueItem>,
) {
    while let Some(mut item) = rx.recv().await {
        if item.fresh {
            item.fresh = false;
            item.requeue_left = config.requeue_attempts;
        }

        match (item.task)().await {
            Ok(()) => {
                if let Some(done) = item.done.take() {
                    let _ = done.send(Ok(()));
                }
            }
            Err(e) => {
                if is_retriable_transport_error(&e) && item.requeue_left > 0 {
                    tracing::debug!(
                        "send task '{}' hit retriable error, requeueing: {e:#}",
                        item.label
                    );
                    tokio::time::sleep(Duration::from_millis(config.wait_for_reconnect_ms)).await;
                    item.requeue_left -= 1;
                    let _ = tx.send(item);
                } else {
                    tracing::warn!("send task '{}' dropped: {e:#}", item.label);
                    if let Some(done) = item.done.take() {
                        let _ = done.send(Err(e));
                    }
                }
            }
        }

        // Rate pacing between tasks.
        let jitter = if config.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=config.jitter_ms)
        };
        let delay = if rand::random() {
            config.base_delay_ms.saturating_add(jitter)
        } else {
            config.base_delay_ms.saturating_sub(jitter)
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}

/// Outcome of [`send_with_retry`].
#[derive(Debug)]
pub enum SendError {
    /// Dropped by preflight or dedup; never counted as a retry.
    Dropped(DropReason),
    /// All attempts failed.
    Failed(anyhow::Error),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dropped(reason) => write!(f, "dropped: {reason}"),
            Self::Failed(e) => write!(f, "failed: {e:#}"),
        }
    }
}

impl std::error::Error for SendError {}

/// 45 s sliding window of already-attempted media dedup keys.
#[derive(Clone, Default)]
pub struct MediaDedupWindow {
    entries: Arc<Mutex<HashMap<String, Instant>>>,
}

impl MediaDedupWindow {
    /// `true` when the key was already attempted inside the window; seeds the
    /// key otherwise.
    pub fn seen_or_seed(&self, key: &str, window: Duration) -> bool {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        entries.retain(|_, at| now.duration_since(*at) < window);
        if entries.contains_key(key) {
            return true;
        }
        entries.insert(key.to_string(), now);
        false
    }
}

/// Per-call retry loop: up to `max_retries` attempts against the transport.
///
/// Each attempt runs the optional preflight first (a dispatch-id recheck);
/// a preflight drop ends the call without consuming an attempt. For
/// `send_media`-style calls a `media_dedup` key suppresses re-attempts of a
/// key already tried in the window.
pub async fn send_with_retry(
    transport: &dyn ActionTransport,
    config: &SendQueueConfig,
    action: &str,
    params: Value,
    preflight: Option<&(dyn Fn() -> Result<(), DropReason> + Send + Sync)>,
    media_dedup: Option<(&MediaDedupWindow, &str)>,
) -> Result<Value, SendError> {
    let attempts = config.max_retries.max(1);
    let mut last_error = None;

    // Cross-call media dedup: the first attempt of this call seeds the key;
    // a key already attempted by an earlier call inside the window suppresses
    // this whole re-send.
    if let Some((window, key)) = media_dedup {
        if window.seen_or_seed(key, Duration::from_millis(config.media_dedup_window_ms)) {
            return Err(SendError::Dropped(DropReason::DuplicatePayload));
        }
    }

    for attempt in 1..=attempts {
        if let Some(preflight) = preflight {
            if let Err(reason) = preflight() {
                return Err(SendError::Dropped(reason));
            }
        }

        if !transport.is_connected()
            && !transport
                .wait_until_connected(Duration::from_millis(config.wait_for_reconnect_ms))
                .await
        {
            last_error = Some(anyhow::anyhow!("transport_unavailable: socket disconnected"));
        } else {
            match transport.send_action(action, params.clone()).await {
                Ok(data) => return Ok(data),
                Err(e) => last_error = Some(e),
            }
        }

        if attempt < attempts {
            let delay = crate::util::calc_retry_delay_ms(
                attempt,
                config.retry_min_delay_ms,
                config.retry_max_delay_ms,
                config.retry_jitter_ratio,
            );
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    Err(SendError::Failed(
        last_error.unwrap_or_else(|| anyhow::anyhow!("unknown_error")),
    ))
}
