//! Inbound media resolution, materialization, and outbound media sending.

pub mod materialize;
pub mod relay;
pub mod resolver;
pub mod sender;
pub mod sniff;

pub use materialize::{materialize_batch, MaterializeOutcome};
pub use resolver::{InboundMediaRef, MediaKind, ResolvedCandidate};
