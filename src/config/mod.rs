pub mod schema;

pub use schema::{
    AccountConfig, AggregateConfig, AutomationConfig, Config, InboundMediaConfig, InterruptPolicy,
    MediaRelayConfig, ProactiveDmConfig, ReliabilityConfig, ResolvePrefer, SendQueueConfig,
    StreamPrefer, TaskGuardrails,
};
