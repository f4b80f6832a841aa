//! Drop and failure codes shared by every stage of the gateway.
//!
//! Every dropped send, skipped dispatch, or failed materialization carries one
//! of these codes so traces stay greppable across subsystems.

use serde::{Deserialize, Serialize};

/// Closed set of drop/failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    DispatchAborted,
    DispatchIdMismatch,
    AbortTextSuppressed,
    DuplicateTextSuppressed,
    PolicyBlocked,
    QuotaExceeded,
    AutomationMetaLeakGuard,
    DispatchTimeout,
    TransportUnavailable,
    ResolveActionFailed,
    MaterializeHttpFailed,
    MaterializeEmptyPayload,
    FileNotFound,
    ContainerLocalUnreadable,
    DuplicatePayload,
    UnsupportedSource,
    PathOutsideAllowlist,
    MigrationIoFailed,
    GroupMemberLookupFailed,
    QueuedSupersededByNewerInbound,
    MergedIntoNewerInbound,
    CoalesceSupersededAfterPreempt,
    RouteGenerationStale,
    UnknownError,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DispatchAborted => "dispatch_aborted",
            Self::DispatchIdMismatch => "dispatch_id_mismatch",
            Self::AbortTextSuppressed => "abort_text_suppressed",
            Self::DuplicateTextSuppressed => "duplicate_text_suppressed",
            Self::PolicyBlocked => "policy_blocked",
            Self::QuotaExceeded => "quota_exceeded",
            Self::AutomationMetaLeakGuard => "automation_meta_leak_guard",
            Self::DispatchTimeout => "dispatch_timeout",
            Self::TransportUnavailable => "transport_unavailable",
            Self::ResolveActionFailed => "resolve_action_failed",
            Self::MaterializeHttpFailed => "materialize_http_failed",
            Self::MaterializeEmptyPayload => "materialize_empty_payload",
            Self::FileNotFound => "file_not_found",
            Self::ContainerLocalUnreadable => "container_local_unreadable",
            Self::DuplicatePayload => "duplicate_payload",
            Self::UnsupportedSource => "unsupported_source",
            Self::PathOutsideAllowlist => "path_outside_allowlist",
            Self::MigrationIoFailed => "migration_io_failed",
            Self::GroupMemberLookupFailed => "group_member_lookup_failed",
            Self::QueuedSupersededByNewerInbound => "queued_superseded_by_newer_inbound",
            Self::MergedIntoNewerInbound => "merged_into_newer_inbound",
            Self::CoalesceSupersededAfterPreempt => "coalesce_superseded_after_preempt",
            Self::RouteGenerationStale => "route_generation_stale",
            Self::UnknownError => "unknown_error",
        }
    }

    /// Whether a dispatch that ended with this drop may emit the bounded
    /// fallback message. Reasons that represent deliberate suppression or
    /// supersession never do.
    pub fn is_fallback_eligible(self) -> bool {
        !matches!(
            self,
            Self::DuplicateTextSuppressed
                | Self::AbortTextSuppressed
                | Self::AutomationMetaLeakGuard
                | Self::DispatchAborted
                | Self::DispatchIdMismatch
                | Self::PolicyBlocked
                | Self::QuotaExceeded
                | Self::QueuedSupersededByNewerInbound
                | Self::MergedIntoNewerInbound
                | Self::CoalesceSupersededAfterPreempt
                | Self::RouteGenerationStale
        )
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient transport errors that warrant re-queuing a send task.
///
/// Matched against error strings because they surface from several layers
/// (tungstenite, reqwest, OS sockets) with no shared type.
pub fn is_retriable_transport_error(err: &anyhow::Error) -> bool {
    let text = format!("{err:#}").to_ascii_lowercase();
    const RETRIABLE: &[&str] = &[
        "websocket is not open",
        "websocket not open",
        "request timeout",
        "econnreset",
        "connection reset",
        "socket hang up",
        "broken pipe",
        "temporarily unavailable",
        "timed out",
    ];
    RETRIABLE.iter().any(|needle| text.contains(needle))
}
