//! Gateway configuration
//!
//! Values come from three layers, later ones winning:
//! 1. compiled-in defaults
//! 2. an optional JSON file (`--config gateway.json`, missing fields default)
//! 3. command line flags
//!
//! ```text
//! --config <path>             JSON configuration file
//! --bind <ip>                 Address all listeners bind to
//! --advertise <ip>            Address announced to devices/clients
//! --device-port <port>        Device registration port (TCP)
//! --client-port <port>        Control client port (TCP)
//! --status-port <port>        Status datagram port (UDP)
//! --multicast-group <ip>      Discovery group
//! --multicast-port <port>     Discovery port
//! --announce-interval <secs>  Seconds between announcements
//! --metrics-port <port>       Serve Prometheus metrics on this port
//! --no-discovery              Do not announce
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use city_protocol::{
    ANNOUNCE_INTERVAL, DEFAULT_CLIENT_PORT, DEFAULT_DEVICE_PORT, DEFAULT_MULTICAST_GROUP,
    DEFAULT_MULTICAST_PORT, DEFAULT_STATUS_PORT,
};

/// Multicast TTL for announcements (stay within the local site)
pub const DEFAULT_MULTICAST_TTL: u32 = 2;

// ============================================================================
// Errors
// ============================================================================

/// Errors while loading or validating configuration
#[derive(Debug)]
pub enum ConfigError {
    /// Configuration file could not be read
    Io(std::io::Error),
    /// Configuration file is not valid JSON for [`GatewayConfig`]
    Parse(String),
    /// A flag or field has an unusable value
    InvalidArgument(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read config file: {}", e),
            ConfigError::Parse(msg) => write!(f, "invalid config file: {}", msg),
            ConfigError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            _ => None,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Runtime configuration of the Gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address every listener binds to
    pub bind_address: IpAddr,
    /// Address put in announcements; resolved from the routing table if unset
    pub advertise_address: Option<IpAddr>,
    /// Device registration port (TCP), 0 for ephemeral
    pub device_port: u16,
    /// Control client port (TCP), 0 for ephemeral
    pub client_port: u16,
    /// Status datagram port (UDP), 0 for ephemeral
    pub status_port: u16,
    /// Announcement destination group
    pub multicast_group: Ipv4Addr,
    /// Announcement destination port
    pub multicast_port: u16,
    /// Milliseconds between announcements
    pub announce_interval_ms: u64,
    /// IP TTL of announcement datagrams
    pub multicast_ttl: u32,
    /// Whether the announcer runs at all
    pub discovery_enabled: bool,
    /// Optional Prometheus metrics port (TCP)
    pub metrics_port: Option<u16>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertise_address: None,
            device_port: DEFAULT_DEVICE_PORT,
            client_port: DEFAULT_CLIENT_PORT,
            status_port: DEFAULT_STATUS_PORT,
            multicast_group: DEFAULT_MULTICAST_GROUP,
            multicast_port: DEFAULT_MULTICAST_PORT,
            announce_interval_ms: ANNOUNCE_INTERVAL.as_millis() as u64,
            multicast_ttl: DEFAULT_MULTICAST_TTL,
            discovery_enabled: true,
            metrics_port: None,
        }
    }
}

impl GatewayConfig {
    /// Load a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_json(&text)
    }

    /// Parse a JSON document; absent fields keep their defaults
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from command line arguments (`args[0]` is ignored)
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut config = match parse_arg(args, "--config") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(v) = parse_arg(args, "--bind") {
            config.bind_address = parse_value(&v, "--bind")?;
        }
        if let Some(v) = parse_arg(args, "--advertise") {
            config.advertise_address = Some(parse_value(&v, "--advertise")?);
        }
        if let Some(v) = parse_arg(args, "--device-port") {
            config.device_port = parse_value(&v, "--device-port")?;
        }
        if let Some(v) = parse_arg(args, "--client-port") {
            config.client_port = parse_value(&v, "--client-port")?;
        }
        if let Some(v) = parse_arg(args, "--status-port") {
            config.status_port = parse_value(&v, "--status-port")?;
        }
        if let Some(v) = parse_arg(args, "--multicast-group") {
            config.multicast_group = parse_value(&v, "--multicast-group")?;
        }
        if let Some(v) = parse_arg(args, "--multicast-port") {
            config.multicast_port = parse_value(&v, "--multicast-port")?;
        }
        if let Some(v) = parse_arg(args, "--announce-interval") {
            let secs: u64 = parse_value(&v, "--announce-interval")?;
            config.announce_interval_ms = secs.saturating_mul(1000);
        }
        if let Some(v) = parse_arg(args, "--metrics-port") {
            config.metrics_port = Some(parse_value(&v, "--metrics-port")?);
        }
        if args.iter().any(|a| a == "--no-discovery") {
            config.discovery_enabled = false;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the Gateway cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.announce_interval_ms == 0 {
            return Err(ConfigError::InvalidArgument(
                "announce interval must be positive".to_string(),
            ));
        }

        if self.device_port != 0 && self.device_port == self.client_port {
            return Err(ConfigError::InvalidArgument(format!(
                "device and client ports must differ (both {})",
                self.device_port
            )));
        }

        // Loopback is accepted so announcements can be observed locally
        if self.discovery_enabled
            && !self.multicast_group.is_multicast()
            && !self.multicast_group.is_loopback()
        {
            return Err(ConfigError::InvalidArgument(format!(
                "{} is not a multicast group",
                self.multicast_group
            )));
        }

        Ok(())
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }
}

// ============================================================================
// Argument Helpers
// ============================================================================

/// Value following `flag` in `args`, if present
pub fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn parse_value<T: FromStr>(value: &str, flag: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidArgument(format!("{} {}", flag, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("city-gateway")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.device_port, 10000);
        assert_eq!(config.client_port, 10003);
        assert_eq!(config.status_port, 10001);
        assert_eq!(config.multicast_group, Ipv4Addr::new(224, 1, 1, 1));
        assert_eq!(config.multicast_port, 5007);
        assert_eq!(config.announce_interval(), Duration::from_secs(10));
        assert!(config.discovery_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_args_overrides() {
        let config = GatewayConfig::from_args(&args(&[
            "--bind",
            "127.0.0.1",
            "--device-port",
            "20000",
            "--client-port",
            "20003",
            "--announce-interval",
            "2",
            "--advertise",
            "10.0.0.5",
            "--no-discovery",
        ]))
        .unwrap();

        assert_eq!(config.bind_address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.device_port, 20000);
        assert_eq!(config.client_port, 20003);
        assert_eq!(config.status_port, 10001);
        assert_eq!(config.announce_interval_ms, 2000);
        assert_eq!(config.advertise_address, Some("10.0.0.5".parse().unwrap()));
        assert!(!config.discovery_enabled);
    }

    #[test]
    fn test_from_args_rejects_bad_port() {
        let err = GatewayConfig::from_args(&args(&["--device-port", "99999"])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidArgument(_)));
    }

    #[test]
    fn test_rejects_same_device_and_client_port() {
        let err = GatewayConfig::from_args(&args(&["--client-port", "10000"])).unwrap_err();
        assert!(err.to_string().contains("must differ"));
    }

    #[test]
    fn test_ephemeral_ports_may_coincide() {
        let config =
            GatewayConfig::from_args(&args(&["--device-port", "0", "--client-port", "0"]))
                .unwrap();
        assert_eq!(config.device_port, 0);
    }

    #[test]
    fn test_rejects_unicast_group() {
        let err =
            GatewayConfig::from_args(&args(&["--multicast-group", "192.168.1.1"])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidArgument(_)));
    }

    #[test]
    fn test_from_json_partial() {
        let config = GatewayConfig::from_json(r#"{ "status_port": 12001, "metrics_port": 9100 }"#)
            .unwrap();
        assert_eq!(config.status_port, 12001);
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.device_port, 10000);
    }

    #[test]
    fn test_from_json_invalid() {
        let err = GatewayConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file_missing() {
        let err = GatewayConfig::from_file("/nonexistent/gateway.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_from_file_then_flags() {
        let path = std::env::temp_dir().join(format!("city-gateway-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "device_port": 11000, "client_port": 11003 }"#).unwrap();

        let config = GatewayConfig::from_args(&args(&[
            "--config",
            path.to_str().unwrap(),
            "--client-port",
            "12003",
        ]))
        .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.device_port, 11000);
        assert_eq!(config.client_port, 12003);
    }

    #[test]
    fn test_parse_arg() {
        let a = args(&["--bind", "0.0.0.0", "--no-discovery"]);
        assert_eq!(parse_arg(&a, "--bind"), Some("0.0.0.0".to_string()));
        assert_eq!(parse_arg(&a, "--no-discovery"), None);
        assert_eq!(parse_arg(&a, "--missing"), None);
    }
}
