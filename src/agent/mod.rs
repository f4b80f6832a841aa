//! Seam to the conversational-agent runtime.
//!
//! The runtime itself is a collaborator, not part of this crate: it exposes
//! one opaque turn operation that streams reply payloads back through a
//! callback and honors cooperative cancellation.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One reply emitted by the agent during a turn.
#[derive(Debug, Clone, Default)]
pub struct ReplyPayload {
    pub text: Option<String>,
    pub media_url: Option<String>,
    pub media_urls: Vec<String>,
    pub files: Vec<String>,
    /// Ask the normalizer to send one message per line when the text has a
    /// small number of distinct lines.
    pub split_send: bool,
}

impl ReplyPayload {
    pub fn text(content: &str) -> Self {
        Self {
            text: Some(content.to_string()),
            ..Self::default()
        }
    }
}

/// Callback the runtime uses to hand replies back for delivery.
pub type DeliverFn = Arc<dyn Fn(ReplyPayload) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Context for one agent turn.
#[derive(Clone)]
pub struct AgentTurnContext {
    pub route: String,
    pub session_key: String,
    pub text: String,
    /// System tag describing inbound media, e.g. the materialized manifest.
    pub media_manifest: Option<String>,
    pub deliver: DeliverFn,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default)]
pub struct AgentTurnOptions {
    /// Prompt-side guidance, e.g. a length cap for automation turns.
    pub length_hint: Option<usize>,
    pub thinking: Option<String>,
    pub model: Option<String>,
}

/// The opaque agent runtime.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Run one turn. Replies go through `ctx.deliver`; the implementation
    /// must stop promptly when `ctx.cancel` fires.
    async fn dispatch_reply(&self, ctx: AgentTurnContext, opts: AgentTurnOptions) -> Result<()>;
}

/// Minimal runtime that mirrors the inbound text. Used by tests and the
/// `check-config` dry-run path.
pub struct EchoAgent;

#[async_trait]
impl AgentRuntime for EchoAgent {
    async fn dispatch_reply(&self, ctx: AgentTurnContext, _opts: AgentTurnOptions) -> Result<()> {
        if ctx.cancel.is_cancelled() {
            anyhow::bail!("operation was aborted");
        }
        (ctx.deliver)(ReplyPayload::text(&ctx.text)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn echo_agent_delivers_inbound_text() {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let deliver: DeliverFn = Arc::new(move |payload| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().push(payload.text.unwrap_or_default());
                Ok(())
            })
        });
        let ctx = AgentTurnContext {
            route: "user:123456".into(),
            session_key: "agent:qq-user-123456:main".into(),
            text: "你好".into(),
            media_manifest: None,
            deliver,
            cancel: CancellationToken::new(),
        };
        EchoAgent
            .dispatch_reply(ctx, AgentTurnOptions::default())
            .await
            .unwrap();
        assert_eq!(*delivered.lock(), vec!["你好".to_string()]);
    }

    #[tokio::test]
    async fn echo_agent_honors_cancellation() {
        let deliver: DeliverFn = Arc::new(|_| Box::pin(async { Ok(()) }));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = AgentTurnContext {
            route: "user:123456".into(),
            session_key: "agent:qq-user-123456:main".into(),
            text: "hi".into(),
            media_manifest: None,
            deliver,
            cancel,
        };
        assert!(EchoAgent
            .dispatch_reply(ctx, AgentTurnOptions::default())
            .await
            .is_err());
    }
}
