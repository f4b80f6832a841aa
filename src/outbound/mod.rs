//! Outbound delivery: reply normalization, the rate-limited send queue, and
//! the per-attempt retry loop.

pub mod normalize;
pub mod queue;

pub use normalize::{classify_media_kind, normalize_reply, NormalizedReply, OutboundMediaItem};
pub use queue::{send_with_retry, MediaDedupWindow, SendError, SendQueue};
