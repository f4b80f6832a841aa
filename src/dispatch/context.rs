//! Per-route runtime state: the in-flight dispatch slot, the pending-latest
//! slot, timeout tracking for the adaptive interrupt policy, and the
//! heavy-file task lock.

use crate::util::now_ms;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// The single dispatch currently running for a route.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub route: String,
    pub dispatch_id: String,
    pub msg_id: Option<i64>,
    pub started_at_ms: i64,
    pub cancel: CancellationToken,
}

/// The newest inbound that arrived while a dispatch was running. At most one
/// per route; a newer insert supersedes the previous entry.
#[derive(Debug, Clone)]
pub struct PendingLatest {
    pub route: String,
    pub msg_id: Option<i64>,
    pub inbound_seq: u64,
    pub has_inbound_media_like: bool,
    pub updated_at_ms: i64,
    /// Aggregated payload carried so the drain can re-dispatch without
    /// another history read.
    pub text: String,
    pub media_urls: Vec<String>,
    pub media_items_total: u32,
    pub media_items_unresolved: u32,
}

#[derive(Default)]
pub struct RouteRuntime {
    inflight: Mutex<HashMap<String, InFlight>>,
    pending: Mutex<HashMap<String, PendingLatest>>,
    last_timeout_at: Mutex<HashMap<String, Instant>>,
    file_task_lock_until: Mutex<HashMap<String, Instant>>,
    dispatch_counter: Mutex<HashMap<String, u64>>,
}

impl RouteRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new in-flight dispatch and return it together with the one
    /// it displaced (if any) so the caller can abort the predecessor.
    pub fn begin_route_in_flight(
        &self,
        route: &str,
        msg_id: Option<i64>,
    ) -> (InFlight, Option<InFlight>) {
        let n = {
            let mut counters = self.dispatch_counter.lock();
            let counter = counters.entry(route.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        let ts = now_ms();
        let inflight = InFlight {
            route: route.to_string(),
            dispatch_id: format!("{route}:{n}:{ts}"),
            msg_id,
            started_at_ms: ts,
            cancel: CancellationToken::new(),
        };
        let previous = self
            .inflight
            .lock()
            .insert(route.to_string(), inflight.clone());
        (inflight, previous)
    }

    /// Clear the in-flight slot, but only when the caller still owns it.
    /// A preempted flow calling in late must not clear its successor's state.
    pub fn clear_route_in_flight(&self, route: &str, dispatch_id: &str) -> bool {
        let mut inflight = self.inflight.lock();
        match inflight.get(route) {
            Some(current) if current.dispatch_id == dispatch_id => {
                inflight.remove(route);
                true
            }
            _ => false,
        }
    }

    pub fn current_in_flight(&self, route: &str) -> Option<InFlight> {
        self.inflight.lock().get(route).cloned()
    }

    pub fn current_dispatch_id(&self, route: &str) -> Option<String> {
        self.inflight
            .lock()
            .get(route)
            .map(|f| f.dispatch_id.clone())
    }

    /// Queue a pending-latest entry, returning the superseded one (if any).
    pub fn set_pending(&self, entry: PendingLatest) -> Option<PendingLatest> {
        self.pending.lock().insert(entry.route.clone(), entry)
    }

    pub fn take_pending(&self, route: &str) -> Option<PendingLatest> {
        self.pending.lock().remove(route)
    }

    pub fn pending_len(&self, route: &str) -> usize {
        usize::from(self.pending.lock().contains_key(route))
    }

    pub fn note_timeout(&self, route: &str) {
        self.last_timeout_at
            .lock()
            .insert(route.to_string(), Instant::now());
    }

    /// Within the degrade window after a timeout, preempt degrades to
    /// queue-latest to avoid thrashing a struggling route.
    pub fn had_recent_timeout(&self, route: &str, window: Duration) -> bool {
        self.last_timeout_at
            .lock()
            .get(route)
            .is_some_and(|at| at.elapsed() < window)
    }

    pub fn lock_file_task(&self, route: &str, duration: Duration) {
        self.file_task_lock_until
            .lock()
            .insert(route.to_string(), Instant::now() + duration);
    }

    pub fn is_file_task_locked(&self, route: &str) -> bool {
        self.file_task_lock_until
            .lock()
            .get(route)
            .is_some_and(|until| Instant::now() < *until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(route: &str, seq: u64) -> PendingLatest {
        PendingLatest {
            route: route.to_string(),
            msg_id: Some(seq as i64),
            inbound_seq: seq,
            has_inbound_media_like: false,
            updated_at_ms: now_ms(),
            text: format!("m{seq}"),
            media_urls: Vec::new(),
            media_items_total: 0,
            media_items_unresolved: 0,
        }
    }

    #[test]
    fn dispatch_ids_are_monotonic_per_route() {
        let runtime = RouteRuntime::new();
        let (first, prev) = runtime.begin_route_in_flight("user:123456", Some(1));
        assert!(prev.is_none());
        let (second, prev) = runtime.begin_route_in_flight("user:123456", Some(2));
        assert_eq!(prev.unwrap().dispatch_id, first.dispatch_id);

        let n_of = |id: &str| -> u64 {
            id.rsplitn(3, ':').nth(1).unwrap().parse().unwrap()
        };
        assert!(n_of(&second.dispatch_id) > n_of(&first.dispatch_id));
        assert!(second.dispatch_id.starts_with("user:123456:"));
    }

    #[test]
    fn clear_requires_exact_owner() {
        let runtime = RouteRuntime::new();
        let (first, _) = runtime.begin_route_in_flight("user:123456", None);
        let (second, _) = runtime.begin_route_in_flight("user:123456", None);

        // The preempted flow cannot clear the new flow's state.
        assert!(!runtime.clear_route_in_flight("user:123456", &first.dispatch_id));
        assert_eq!(
            runtime.current_dispatch_id("user:123456").unwrap(),
            second.dispatch_id
        );
        assert!(runtime.clear_route_in_flight("user:123456", &second.dispatch_id));
        assert!(runtime.current_in_flight("user:123456").is_none());
        // Second clear is a no-op.
        assert!(!runtime.clear_route_in_flight("user:123456", &second.dispatch_id));
    }

    #[test]
    fn at_most_one_pending_newer_supersedes() {
        let runtime = RouteRuntime::new();
        assert!(runtime.set_pending(pending("user:123456", 1)).is_none());
        let superseded = runtime.set_pending(pending("user:123456", 2)).unwrap();
        assert_eq!(superseded.inbound_seq, 1);
        assert_eq!(runtime.pending_len("user:123456"), 1);
        assert_eq!(runtime.take_pending("user:123456").unwrap().inbound_seq, 2);
        assert_eq!(runtime.pending_len("user:123456"), 0);
    }

    #[test]
    fn timeout_window_expires() {
        let runtime = RouteRuntime::new();
        assert!(!runtime.had_recent_timeout("user:123456", Duration::from_secs(60)));
        runtime.note_timeout("user:123456");
        assert!(runtime.had_recent_timeout("user:123456", Duration::from_secs(60)));
        assert!(!runtime.had_recent_timeout("user:123456", Duration::ZERO));
    }

    #[test]
    fn file_task_lock_expires() {
        let runtime = RouteRuntime::new();
        runtime.lock_file_task("user:123456", Duration::from_secs(60));
        assert!(runtime.is_file_task_locked("user:123456"));
        runtime.lock_file_task("user:123456", Duration::ZERO);
        assert!(!runtime.is_file_task_locked("user:123456"));
    }
}
