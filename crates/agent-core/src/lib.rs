//! Shared foundation for the `bk-agent` transcoding worker: typed runtime
//! configuration and host telemetry sampling.

pub mod config;
pub mod telemetry;

pub use config::AgentConfig;
pub use telemetry::{SystemHealth, Telemetry};
