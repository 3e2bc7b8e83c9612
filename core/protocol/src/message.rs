//! Envelope message types
//!
//! Every byte exchanged between the Gateway, devices and control clients is
//! one [`Envelope`]. The envelope is a closed enum: a decoded value always
//! carries exactly one payload, so "no payload" cannot be represented and
//! surfaces as a decode failure instead.
//!
//! ```text
//! Device ──DeviceRegistration──► Gateway (device port, TCP)
//! Device ──Status──────────────► Gateway (status port, UDP)
//! Client ──ListRequest─────────► Gateway ──ListResponse──► Client
//! Client ──Command─────────────► Gateway ──Command───────► Device
//! Gateway ─GatewayAnnouncement─► multicast group
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Device Kind
// ============================================================================

/// Kind of device attached to the Gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Camera,
    LampPost,
    TempSensor,
    AirSensor,
    TrafficLight,
}

impl DeviceKind {
    /// All kinds, in declaration order
    pub const ALL: [DeviceKind; 5] = [
        DeviceKind::Camera,
        DeviceKind::LampPost,
        DeviceKind::TempSensor,
        DeviceKind::AirSensor,
        DeviceKind::TrafficLight,
    ];

    /// Canonical upper-case name (`LAMP_POST`, ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Camera => "CAMERA",
            DeviceKind::LampPost => "LAMP_POST",
            DeviceKind::TempSensor => "TEMP_SENSOR",
            DeviceKind::AirSensor => "AIR_SENSOR",
            DeviceKind::TrafficLight => "TRAFFIC_LIGHT",
        }
    }

    /// Parse a kind name, case-insensitive, accepting `-` for `_`
    pub fn parse(name: &str) -> Option<DeviceKind> {
        let normalized = name.trim().to_ascii_uppercase().replace('-', "_");
        DeviceKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
    }

    /// Prefix used for generated device ids (`lamp_ab12cd`)
    pub fn id_prefix(&self) -> &'static str {
        match self {
            DeviceKind::Camera => "cam",
            DeviceKind::LampPost => "lamp",
            DeviceKind::TempSensor => "temp",
            DeviceKind::AirSensor => "airq",
            DeviceKind::TrafficLight => "sema",
        }
    }

    /// Whether devices of this kind push periodic status datagrams
    pub fn reports_status(&self) -> bool {
        matches!(self, DeviceKind::TempSensor | DeviceKind::AirSensor)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Status
// ============================================================================

/// Last-known state reported by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StatusPayload {
    /// Temperature reading in degrees Celsius
    Temperature(f64),
    /// Free-form state description (`"PPM: 42.5"`)
    FreeText(String),
}

impl fmt::Display for StatusPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusPayload::Temperature(celsius) => write!(f, "{:.2}°C", celsius),
            StatusPayload::FreeText(text) => f.write_str(text),
        }
    }
}

/// A status report keyed to the device that sent it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub device_id: String,
    pub payload: StatusPayload,
}

// ============================================================================
// Commands
// ============================================================================

/// Typed configuration change, closed per device kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigChange {
    /// Camera capture resolution (`"HD"`, `"4K"`, ...)
    CameraResolution(String),
    /// Traffic light red phase duration in seconds
    RedLightDuration(u32),
}

impl ConfigChange {
    /// Device kind this change is meaningful for
    pub fn target_kind(&self) -> DeviceKind {
        match self {
            ConfigChange::CameraResolution(_) => DeviceKind::Camera,
            ConfigChange::RedLightDuration(_) => DeviceKind::TrafficLight,
        }
    }

    /// Parse the textual `key:value` form typed by operators.
    ///
    /// Keys are case-insensitive: `resolution:<text>` or `duration:<secs>`.
    pub fn parse(text: &str) -> Result<ConfigChange, String> {
        let (key, value) = text
            .split_once(':')
            .ok_or_else(|| format!("expected key:value, got '{}'", text))?;
        let value = value.trim();

        match key.trim().to_ascii_lowercase().as_str() {
            "resolution" if !value.is_empty() => {
                Ok(ConfigChange::CameraResolution(value.to_string()))
            }
            "resolution" => Err("resolution must not be empty".to_string()),
            "duration" => value
                .parse::<u32>()
                .map(ConfigChange::RedLightDuration)
                .map_err(|_| format!("invalid duration '{}'", value)),
            other => Err(format!("unknown configuration key '{}'", other)),
        }
    }
}

impl fmt::Display for ConfigChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigChange::CameraResolution(res) => write!(f, "resolution:{}", res),
            ConfigChange::RedLightDuration(secs) => write!(f, "duration:{}", secs),
        }
    }
}

/// What a command asks the target device to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandAction {
    /// Invert the current on/off state. `Toggle(false)` is still a toggle.
    Toggle(bool),
    /// Apply a configuration change
    SetConfig(ConfigChange),
}

/// A control command addressed to one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub device_id: String,
    pub action: CommandAction,
}

impl Command {
    pub fn toggle(device_id: impl Into<String>) -> Self {
        Command {
            device_id: device_id.into(),
            action: CommandAction::Toggle(true),
        }
    }

    pub fn set_config(device_id: impl Into<String>, change: ConfigChange) -> Self {
        Command {
            device_id: device_id.into(),
            action: CommandAction::SetConfig(change),
        }
    }
}

// ============================================================================
// Registry Views and Discovery
// ============================================================================

/// One entry of a device listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub id: String,
    pub kind: DeviceKind,
}

/// Reachability information broadcast by the Gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayAnnouncement {
    pub address: String,
    pub device_port: u16,
    pub client_port: u16,
}

// ============================================================================
// Envelope
// ============================================================================

/// The single wire message; exactly one payload per envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    /// First (and only) message a device sends on the device port
    DeviceRegistration { id: String, kind: DeviceKind },
    /// Unsolicited status report (status port, datagram)
    Status(StatusUpdate),
    /// Control command, client → Gateway → device
    Command(Command),
    /// Ask for the current device set
    ListRequest,
    /// Device set computed from the registry
    ListResponse { devices: Vec<DeviceSummary> },
    /// Periodic discovery broadcast
    GatewayAnnouncement(GatewayAnnouncement),
}

impl Envelope {
    /// Short variant name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Envelope::DeviceRegistration { .. } => "DeviceRegistration",
            Envelope::Status(_) => "Status",
            Envelope::Command(_) => "Command",
            Envelope::ListRequest => "ListRequest",
            Envelope::ListResponse { .. } => "ListResponse",
            Envelope::GatewayAnnouncement(_) => "GatewayAnnouncement",
        }
    }
}
