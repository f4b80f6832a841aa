#![warn(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use,
    dead_code
)]

pub mod agent;
pub mod automation;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod errors;
pub mod gateway;
pub mod media;
pub mod onebot;
pub mod outbound;
pub mod policy;
pub mod proactive;
pub mod route;
pub mod store;
pub mod trace;
pub mod util;
