//! Smart City device agent
//!
//! Simulates one device of any kind against the Gateway:
//! - Finds the Gateway through its multicast announcements
//! - Registers over TCP and obeys toggle / configuration commands
//! - Sensors push periodic readings to the status port over UDP

pub mod agent;
pub mod device;
pub mod metrics;

pub use agent::{AgentConfig, AgentError, DeviceAgent, GatewayTarget};
pub use device::{CommandEffect, DeviceState};
