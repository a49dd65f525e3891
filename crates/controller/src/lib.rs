//! Relay controller: the level-triggered engine tying index, resolver,
//! materializer, sharder and status reducer together.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod config;
pub mod engine;
pub mod queue;

pub use backoff::Backoff;
pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, Sinks, WorkKey};
pub use relay_status::{READY_CONDITION, WRAPPED_CONDITION};
pub use queue::WorkQueue;
