//! Smart City Gateway
//!
//! A broker that:
//! - Accepts device registrations and keeps each device's connection as a
//!   command sink
//! - Records status datagrams from registered devices
//! - Serves device listings to control clients and routes their commands
//! - Multicasts its address so nobody needs static configuration

pub mod config;
pub mod connection;
pub mod discovery;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod sink;
pub mod status;

pub use config::{ConfigError, GatewayConfig};
pub use registry::DeviceRegistry;
pub use server::{Gateway, GatewayHandle};
