//! Short-window coalescing of inbound fragments.
//!
//! Rapid consecutive messages on one route collapse into a single logical
//! inbound. Each push bumps the route's sequence; the pusher sleeps the
//! window and finalizes only when its sequence is still current, so every
//! window is finalized exactly once, by the last pusher.

use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
struct AggState {
    seq: u64,
    texts: Vec<String>,
    media_urls: Vec<String>,
    media_items_total: u32,
    media_items_unresolved: u32,
    last_msg_id: Option<i64>,
}

/// One finalized logical inbound.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedInbound {
    pub seq: u64,
    pub text: String,
    pub media_urls: Vec<String>,
    pub media_items_total: u32,
    pub media_items_unresolved: u32,
    pub msg_id: Option<i64>,
}

#[derive(Default)]
pub struct InboundAggregator {
    routes: Mutex<HashMap<String, AggState>>,
}

impl InboundAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one inbound fragment and return its sequence token.
    pub fn push(
        &self,
        route: &str,
        text: &str,
        media_urls: &[String],
        media_items_total: u32,
        media_items_unresolved: u32,
        msg_id: Option<i64>,
    ) -> u64 {
        let mut routes = self.routes.lock();
        let state = routes.entry(route.to_string()).or_default();
        state.seq += 1;
        if !text.trim().is_empty() {
            state.texts.push(text.trim().to_string());
        }
        for url in media_urls {
            if !state.media_urls.contains(url) {
                state.media_urls.push(url.clone());
            }
        }
        state.media_items_total += media_items_total;
        state.media_items_unresolved += media_items_unresolved;
        if msg_id.is_some() {
            state.last_msg_id = msg_id;
        }
        state.seq
    }

    /// Sequence a route is currently at (0 when untouched).
    pub fn current_seq(&self, route: &str) -> u64 {
        self.routes.lock().get(route).map_or(0, |state| state.seq)
    }

    /// Finalize the window iff `seq` is still the route's newest push.
    /// Returns `None` for superseded (older-generation) callers.
    pub fn finalize_if_current(&self, route: &str, seq: u64) -> Option<AggregatedInbound> {
        let mut routes = self.routes.lock();
        let state = routes.get_mut(route)?;
        if state.seq != seq {
            return None;
        }
        let taken = std::mem::take(state);
        // Keep the sequence monotonic across windows.
        state.seq = taken.seq;
        let empty = taken.texts.is_empty()
            && taken.media_urls.is_empty()
            && taken.media_items_total == 0
            && taken.last_msg_id.is_none();
        if empty {
            return None;
        }
        Some(AggregatedInbound {
            seq: taken.seq,
            text: taken.texts.join("\n").trim().to_string(),
            media_urls: taken.media_urls,
            media_items_total: taken.media_items_total,
            media_items_unresolved: taken.media_items_unresolved,
            msg_id: taken.last_msg_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_push_finalizes() {
        let aggregator = InboundAggregator::new();
        let seq = aggregator.push("user:123456", "你好", &[], 0, 0, Some(1));
        let out = aggregator.finalize_if_current("user:123456", seq).unwrap();
        assert_eq!(out.text, "你好");
        assert_eq!(out.msg_id, Some(1));
    }

    #[test]
    fn older_pusher_is_superseded() {
        let aggregator = InboundAggregator::new();
        let seq_a = aggregator.push("group:100001", "A", &[], 0, 0, Some(1));
        let seq_b = aggregator.push("group:100001", "B", &[], 0, 0, Some(2));

        assert!(aggregator.finalize_if_current("group:100001", seq_a).is_none());
        let out = aggregator.finalize_if_current("group:100001", seq_b).unwrap();
        assert_eq!(out.text, "A\nB");
        assert_eq!(out.msg_id, Some(2));
    }

    #[test]
    fn media_urls_are_deduplicated_and_stats_summed() {
        let aggregator = InboundAggregator::new();
        aggregator.push(
            "user:123456",
            "",
            &["file:///a.png".into(), "file:///b.png".into()],
            2,
            1,
            Some(1),
        );
        let seq = aggregator.push("user:123456", "看图", &["file:///a.png".into()], 1, 0, Some(2));
        let out = aggregator.finalize_if_current("user:123456", seq).unwrap();
        assert_eq!(out.media_urls.len(), 2);
        assert_eq!(out.media_items_total, 3);
        assert_eq!(out.media_items_unresolved, 1);
    }

    #[test]
    fn sequence_is_monotonic_across_windows() {
        let aggregator = InboundAggregator::new();
        let first = aggregator.push("user:123456", "a", &[], 0, 0, None);
        aggregator.finalize_if_current("user:123456", first).unwrap();
        let second = aggregator.push("user:123456", "b", &[], 0, 0, None);
        assert!(second > first);
    }

    #[test]
    fn finalize_twice_returns_once() {
        let aggregator = InboundAggregator::new();
        let seq = aggregator.push("user:123456", "a", &[], 0, 0, None);
        assert!(aggregator.finalize_if_current("user:123456", seq).is_some());
        assert!(aggregator.finalize_if_current("user:123456", seq).is_none());
    }

    #[test]
    fn routes_are_independent() {
        let aggregator = InboundAggregator::new();
        let seq_a = aggregator.push("user:111111", "a", &[], 0, 0, None);
        let seq_b = aggregator.push("user:222222", "b", &[], 0, 0, None);
        assert!(aggregator.finalize_if_current("user:111111", seq_a).is_some());
        assert!(aggregator.finalize_if_current("user:222222", seq_b).is_some());
    }
}
