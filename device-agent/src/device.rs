//! Simulated device state
//!
//! Every kind carries an on/off switch. Cameras add a resolution and traffic
//! lights a red-light duration; sensors produce a fresh reading each time
//! they report.

use std::fmt;

use city_protocol::{Command, CommandAction, ConfigChange, DeviceKind, StatusPayload};
use ring::error::Unspecified;
use ring::rand::SecureRandom;

/// Resolution a camera starts with
pub const DEFAULT_RESOLUTION: &str = "HD";

/// Red light duration a traffic light starts with
pub const DEFAULT_RED_LIGHT_SECS: u32 = 15;

/// Number of random bytes in a generated id (two hex digits each)
const ID_RANDOM_BYTES: usize = 3;

const TEMPERATURE_RANGE: (f64, f64) = (15.0, 35.0);
const AIR_QUALITY_PPM_RANGE: (f64, f64) = (30.0, 150.0);

// ============================================================================
// Identity
// ============================================================================

/// Random id of the form `<prefix>_<6 hex digits>`, e.g. `lamp_3f09a1`
pub fn generate_id(kind: DeviceKind, rng: &dyn SecureRandom) -> Result<String, Unspecified> {
    let mut bytes = [0u8; ID_RANDOM_BYTES];
    rng.fill(&mut bytes)?;
    let suffix: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    Ok(format!("{}_{}", kind.id_prefix(), suffix))
}

// ============================================================================
// Device State
// ============================================================================

/// What applying a command did
#[derive(Debug, Clone, PartialEq)]
pub enum CommandEffect {
    /// Power state flipped; carries the new state
    Switched(bool),
    /// Configuration accepted
    Configured(ConfigChange),
    /// Addressed to another device id
    NotAddressed,
    /// Configuration this kind does not have
    Unsupported(ConfigChange),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub id: String,
    pub kind: DeviceKind,
    pub is_on: bool,
    /// Only meaningful for cameras
    pub resolution: String,
    /// Only meaningful for traffic lights
    pub red_light_secs: u32,
}

impl DeviceState {
    pub fn new(id: impl Into<String>, kind: DeviceKind) -> Self {
        DeviceState {
            id: id.into(),
            kind,
            is_on: false,
            resolution: DEFAULT_RESOLUTION.to_string(),
            red_light_secs: DEFAULT_RED_LIGHT_SECS,
        }
    }

    /// Apply a command received from the Gateway
    ///
    /// A toggle always inverts the power state; the flag it carries is not
    /// a target state.
    pub fn apply(&mut self, cmd: &Command) -> CommandEffect {
        if cmd.device_id != self.id {
            return CommandEffect::NotAddressed;
        }

        match &cmd.action {
            CommandAction::Toggle(_) => {
                self.is_on = !self.is_on;
                CommandEffect::Switched(self.is_on)
            }
            CommandAction::SetConfig(change) => {
                if change.target_kind() != self.kind {
                    return CommandEffect::Unsupported(change.clone());
                }
                match change {
                    ConfigChange::CameraResolution(resolution) => {
                        self.resolution = resolution.clone();
                    }
                    ConfigChange::RedLightDuration(secs) => {
                        self.red_light_secs = *secs;
                    }
                }
                CommandEffect::Configured(change.clone())
            }
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) {}",
            self.id,
            self.kind,
            if self.is_on { "ON" } else { "OFF" }
        )?;
        match self.kind {
            DeviceKind::Camera => write!(f, ", resolution {}", self.resolution),
            DeviceKind::TrafficLight => write!(f, ", red light {}s", self.red_light_secs),
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Sensor Readings
// ============================================================================

/// Uniform sample in `[low, high]`, rounded to two decimals
fn sample(rng: &dyn SecureRandom, (low, high): (f64, f64)) -> Result<f64, Unspecified> {
    let mut bytes = [0u8; 4];
    rng.fill(&mut bytes)?;
    let unit = u32::from_be_bytes(bytes) as f64 / u32::MAX as f64;
    Ok(((low + unit * (high - low)) * 100.0).round() / 100.0)
}

/// Fresh reading for a status-reporting kind, `None` for the others
pub fn read_sensor(
    kind: DeviceKind,
    rng: &dyn SecureRandom,
) -> Result<Option<StatusPayload>, Unspecified> {
    let payload = match kind {
        DeviceKind::TempSensor => StatusPayload::Temperature(sample(rng, TEMPERATURE_RANGE)?),
        DeviceKind::AirSensor => {
            StatusPayload::FreeText(format!("PPM: {}", sample(rng, AIR_QUALITY_PPM_RANGE)?))
        }
        _ => return Ok(None),
    };
    Ok(Some(payload))
}
