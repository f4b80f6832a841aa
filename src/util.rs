//! Small helpers shared across the gateway.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Uses character boundaries, so multi-byte UTF-8 (emoji, CJK) never splits.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", s[..idx].trim_end()),
        None => s.to_string(),
    }
}

/// Run `fut` with a deadline. On timeout, `on_timeout` fires once (used to
/// propagate an abort to the underlying work) and the call fails with
/// `<label> timeout after <ms>ms`.
pub async fn with_timeout<T, F, C>(fut: F, ms: u64, label: &str, on_timeout: Option<C>) -> Result<T>
where
    F: Future<Output = Result<T>>,
    C: FnOnce(),
{
    match tokio::time::timeout(Duration::from_millis(ms), fut).await {
        Ok(result) => result,
        Err(_) => {
            if let Some(cb) = on_timeout {
                cb();
            }
            anyhow::bail!("{label} timeout after {ms}ms")
        }
    }
}

/// Clamp an exponential retry delay and apply a symmetric jitter ratio.
///
/// `attempt` is 1-based; delay = `min * 2^(attempt-1)` clamped to `[min, max]`,
/// then scaled by a random factor in `[1 - jitter_ratio, 1 + jitter_ratio]`.
pub fn calc_retry_delay_ms(attempt: u32, min_ms: u64, max_ms: u64, jitter_ratio: f64) -> u64 {
    let exp = min_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(20));
    let base = exp.clamp(min_ms, max_ms.max(min_ms));
    if jitter_ratio <= 0.0 {
        return base;
    }
    let spread = jitter_ratio.min(1.0);
    let factor = 1.0 + (rand::random::<f64>() * 2.0 - 1.0) * spread;
    let jittered = (base as f64 * factor).round();
    jittered.max(0.0) as u64
}
