//! OneBot v11 protocol surface: typed events, the action transport seam, and
//! the persistent WebSocket client.

pub mod client;
pub mod event;

pub use client::{ActionTransport, OneBotClient};
pub use event::{BotEvent, MessageBody, Segment, Sender};
