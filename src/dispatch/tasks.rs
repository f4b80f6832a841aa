//! Heavy-task units.
//!
//! Dispatches carrying media or very long text run as tasks instead of direct
//! agent calls: per-route concurrency cap, bounded runtime, bounded retries,
//! and 24-hour idempotency on the task key. Every state transition is
//! persisted three ways — the latest snapshot (`meta/task-state.json`), the
//! append-only lifecycle (`meta/task-lifecycle.ndjson`), and the per-key
//! record (`meta/task-<key>.json`).

use crate::config::TaskGuardrails;
use crate::store::{append_ndjson, write_json_atomic, RouteStore};
use crate::util::with_timeout;
use anyhow::Result;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_key: String,
    pub route: String,
    pub msg_id: Option<i64>,
    pub dispatch_id: String,
    pub task_kind: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    pub payload_summary: String,
    pub at: String,
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_key: String,
    pub deduped: bool,
    pub status: TaskStatus,
    pub error_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub route: String,
    pub msg_id: Option<i64>,
    pub dispatch_id: String,
    pub task_kind: String,
    pub payload_summary: String,
}

/// Stable key over the fields that define "the same work".
pub fn task_key(route: &str, msg_id: Option<i64>, task_kind: &str, payload_summary: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(route.as_bytes());
    hasher.update(b"|");
    hasher.update(msg_id.unwrap_or_default().to_le_bytes());
    hasher.update(b"|");
    hasher.update(task_kind.as_bytes());
    hasher.update(b"|");
    hasher.update(payload_summary.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct TaskUnits {
    store: RouteStore,
    guardrails: TaskGuardrails,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    completed: Mutex<HashMap<String, Instant>>,
}

impl TaskUnits {
    pub fn new(store: RouteStore, guardrails: TaskGuardrails) -> Self {
        Self {
            store,
            guardrails,
            semaphores: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashMap::new()),
        }
    }

    fn route_semaphore(&self, route: &str) -> Arc<Semaphore> {
        self.semaphores
            .lock()
            .entry(route.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.guardrails.concurrency())))
            .clone()
    }

    fn persist(&self, record: &TaskRecord) {
        let result = self.store.meta_dir(&record.route).and_then(|meta| {
            write_json_atomic(&meta.join("task-state.json"), record)?;
            append_ndjson(&meta.join("task-lifecycle.ndjson"), record)?;
            write_json_atomic(&meta.join(format!("task-{}.json", record.task_key)), record)
        });
        if let Err(e) = result {
            tracing::warn!(route = %record.route, "task persistence failed: {e:#}");
        }
    }

    fn record(&self, request: &TaskRequest, key: &str, status: TaskStatus) -> TaskRecord {
        TaskRecord {
            task_key: key.to_string(),
            route: request.route.clone(),
            msg_id: request.msg_id,
            dispatch_id: request.dispatch_id.clone(),
            task_kind: request.task_kind.clone(),
            status,
            retry_count: 0,
            error_reason: None,
            result_summary: None,
            payload_summary: request.payload_summary.clone(),
            at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Whether the key completed inside the idempotency TTL; prunes expired
    /// entries as a side effect.
    fn recently_completed(&self, key: &str) -> bool {
        let mut completed = self.completed.lock();
        completed.retain(|_, at| at.elapsed() < IDEMPOTENCY_TTL);
        completed.contains_key(key)
    }

    /// Schedule and run one task body. `body` is re-invoked on retry and
    /// returns a short result summary.
    pub async fn run<F>(&self, request: TaskRequest, body: F) -> Result<TaskOutcome>
    where
        F: Fn() -> BoxFuture<'static, Result<String>> + Send + Sync,
    {
        let key = task_key(
            &request.route,
            request.msg_id,
            &request.task_kind,
            &request.payload_summary,
        );

        if self.guardrails.idempotency_enabled && self.recently_completed(&key) {
            let mut record = self.record(&request, &key, TaskStatus::Succeeded);
            record.error_reason = Some("idempotent_replay_skipped".to_string());
            self.persist(&record);
            return Ok(TaskOutcome {
                task_key: key,
                deduped: true,
                status: TaskStatus::Succeeded,
                error_reason: Some("idempotent_replay_skipped".to_string()),
            });
        }

        self.persist(&self.record(&request, &key, TaskStatus::Queued));

        let semaphore = self.route_semaphore(&request.route);
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|_| anyhow::anyhow!("task semaphore closed"))?;

        let mut running = self.record(&request, &key, TaskStatus::Running);
        self.persist(&running);

        let runtime_ms = self.guardrails.runtime_ms();
        let max_retries = self.guardrails.retries();
        let mut last_error: Option<String> = None;
        let mut timed_out = false;

        for attempt in 0..=max_retries {
            running.retry_count = attempt;
            match with_timeout(body(), runtime_ms, &request.task_kind, None::<fn()>).await {
                Ok(summary) => {
                    let mut done = self.record(&request, &key, TaskStatus::Succeeded);
                    done.retry_count = attempt;
                    done.result_summary = Some(summary);
                    self.persist(&done);
                    self.completed.lock().insert(key.clone(), Instant::now());
                    return Ok(TaskOutcome {
                        task_key: key,
                        deduped: false,
                        status: TaskStatus::Succeeded,
                        error_reason: None,
                    });
                }
                Err(e) => {
                    let text = format!("{e:#}");
                    timed_out = text.contains("timeout after");
                    tracing::warn!(
                        route = request.route,
                        "task attempt {attempt} failed: {text}"
                    );
                    last_error = Some(text);
                }
            }
        }

        let status = if timed_out {
            TaskStatus::Timeout
        } else {
            TaskStatus::Failed
        };
        let mut failed = self.record(&request, &key, status);
        failed.retry_count = max_retries;
        failed.error_reason = last_error.clone();
        self.persist(&failed);
        Ok(TaskOutcome {
            task_key: key,
            deduped: false,
            status,
            error_reason: last_error,
        })
    }
}
