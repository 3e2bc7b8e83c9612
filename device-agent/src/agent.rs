//! Device agent runtime
//!
//! ```text
//! discovery (or --gateway) ─► register over TCP ─┬─► command loop   (actuators)
//!                                                └─► status loop    (sensors)
//! ```
//! Actuators keep the registration connection open and obey every command
//! the Gateway writes to it. Sensors close it right after registering and
//! push readings to the status port over UDP instead.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use city_protocol::{
    decode_message, encode_message, join_discovery_group, read_frame, wait_for_announcement,
    write_message, DeviceKind, Envelope, GatewayAnnouncement, StatusPayload, StatusUpdate,
    DEFAULT_MULTICAST_GROUP, DEFAULT_MULTICAST_PORT, DEFAULT_STATUS_PORT,
};
use ring::rand::SystemRandom;

use crate::device::{read_sensor, CommandEffect, DeviceState};
use crate::metrics::Metrics;

/// Seconds between two status reports of a sensor
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(15);

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum AgentError {
    /// Missing or unusable command line value
    InvalidArgument(String),
    /// The system random source failed
    Random,
    Io(io::Error),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            AgentError::Random => write!(f, "random source failed"),
            AgentError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for AgentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AgentError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for AgentError {
    fn from(e: io::Error) -> Self {
        AgentError::Io(e)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Command line configuration
///
/// ```text
/// --kind <kind>                camera | lamp_post | temp_sensor | air_sensor | traffic_light
/// --id <id>                    Device id (default: generated)
/// --gateway <ip:port>          Device endpoint, skips discovery
/// --status-port <port>         Gateway status port (UDP)
/// --status-interval <secs>     Seconds between sensor reports
/// --multicast-group <ip>       Discovery group
/// --multicast-port <port>      Discovery port
/// --discovery-timeout <secs>   Give up waiting for an announcement
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub kind: DeviceKind,
    pub id: Option<String>,
    pub gateway: Option<SocketAddr>,
    pub status_port: u16,
    pub status_interval: Duration,
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    pub discovery_timeout: Option<Duration>,
}

impl AgentConfig {
    pub fn new(kind: DeviceKind) -> Self {
        AgentConfig {
            kind,
            id: None,
            gateway: None,
            status_port: DEFAULT_STATUS_PORT,
            status_interval: DEFAULT_STATUS_INTERVAL,
            multicast_group: DEFAULT_MULTICAST_GROUP,
            multicast_port: DEFAULT_MULTICAST_PORT,
            discovery_timeout: None,
        }
    }

    /// Build configuration from command line arguments (`args[0]` is ignored)
    pub fn from_args(args: &[String]) -> Result<Self, AgentError> {
        let kind_name = parse_arg(args, "--kind")
            .ok_or_else(|| AgentError::InvalidArgument("--kind is required".to_string()))?;
        let kind = DeviceKind::parse(&kind_name).ok_or_else(|| {
            AgentError::InvalidArgument(format!("unknown device kind '{}'", kind_name))
        })?;

        let mut config = AgentConfig::new(kind);
        config.id = parse_arg(args, "--id");

        if let Some(v) = parse_arg(args, "--gateway") {
            config.gateway = Some(parse_value(&v, "--gateway")?);
        }
        if let Some(v) = parse_arg(args, "--status-port") {
            config.status_port = parse_value(&v, "--status-port")?;
        }
        if let Some(v) = parse_arg(args, "--status-interval") {
            let secs: u64 = parse_value(&v, "--status-interval")?;
            if secs == 0 {
                return Err(AgentError::InvalidArgument(
                    "--status-interval must be positive".to_string(),
                ));
            }
            config.status_interval = Duration::from_secs(secs);
        }
        if let Some(v) = parse_arg(args, "--multicast-group") {
            config.multicast_group = parse_value(&v, "--multicast-group")?;
        }
        if let Some(v) = parse_arg(args, "--multicast-port") {
            config.multicast_port = parse_value(&v, "--multicast-port")?;
        }
        if let Some(v) = parse_arg(args, "--discovery-timeout") {
            config.discovery_timeout = Some(Duration::from_secs(parse_value(
                &v,
                "--discovery-timeout",
            )?));
        }

        Ok(config)
    }
}

/// Value following `flag` in `args`, if present
pub fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn parse_value<T: FromStr>(value: &str, flag: &str) -> Result<T, AgentError> {
    value
        .parse()
        .map_err(|_| AgentError::InvalidArgument(format!("{} {}", flag, value)))
}

// ============================================================================
// Locating the Gateway
// ============================================================================

/// Where to register and where to send status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayTarget {
    pub device_addr: SocketAddr,
    pub status_addr: SocketAddr,
}

impl GatewayTarget {
    /// Status goes to the same host as registration
    pub fn direct(device_addr: SocketAddr, status_port: u16) -> Self {
        GatewayTarget {
            device_addr,
            status_addr: SocketAddr::new(device_addr.ip(), status_port),
        }
    }

    pub fn from_announcement(
        announcement: &GatewayAnnouncement,
        status_port: u16,
    ) -> io::Result<Self> {
        Ok(Self::direct(announcement.device_endpoint()?, status_port))
    }
}

/// Use `--gateway` if given, otherwise wait for an announcement
pub fn locate_gateway(config: &AgentConfig) -> io::Result<GatewayTarget> {
    if let Some(addr) = config.gateway {
        log::info!("Using configured gateway {}", addr);
        return Ok(GatewayTarget::direct(addr, config.status_port));
    }

    let socket = join_discovery_group(config.multicast_group, config.multicast_port)?;
    log::info!(
        "Waiting for gateway announcement on {}:{}",
        config.multicast_group,
        config.multicast_port
    );
    discover_gateway(&socket, config.status_port, config.discovery_timeout)
}

/// Wait for the first announcement on an already bound socket
pub fn discover_gateway(
    socket: &UdpSocket,
    status_port: u16,
    timeout: Option<Duration>,
) -> io::Result<GatewayTarget> {
    let (announcement, from) = wait_for_announcement(socket, timeout)?;
    log::info!(
        "Discovered gateway at {} (devices :{}) from {}",
        announcement.address,
        announcement.device_port,
        from
    );
    GatewayTarget::from_announcement(&announcement, status_port)
}

/// Connect to the device endpoint and send the one registration frame
pub fn register(device_addr: SocketAddr, state: &DeviceState) -> io::Result<TcpStream> {
    let mut stream = TcpStream::connect(device_addr)?;
    stream.set_nodelay(true)?;
    write_message(
        &mut stream,
        &Envelope::DeviceRegistration {
            id: state.id.clone(),
            kind: state.kind,
        },
    )?;
    log::info!("Registered {} as {} with {}", state.id, state.kind, device_addr);
    Ok(stream)
}

// ============================================================================
// Agent
// ============================================================================

/// One simulated device
pub struct DeviceAgent {
    state: Mutex<DeviceState>,
    metrics: Arc<Metrics>,
    rng: SystemRandom,
}

impl DeviceAgent {
    pub fn new(state: DeviceState, metrics: Arc<Metrics>) -> Self {
        DeviceAgent {
            state: Mutex::new(state),
            metrics,
            rng: SystemRandom::new(),
        }
    }

    /// Snapshot of the current device state
    pub fn state(&self) -> DeviceState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Obey commands until the Gateway closes the connection
    pub fn run_commands(&self, mut stream: TcpStream) -> io::Result<()> {
        while let Some(frame) = read_frame(&mut stream)? {
            self.handle_frame(&frame);
        }
        log::info!("Gateway closed the command connection");
        Ok(())
    }

    /// Apply one frame received on the command connection
    ///
    /// Returns `None` when the frame is not a command.
    pub fn handle_frame(&self, frame: &[u8]) -> Option<CommandEffect> {
        Metrics::incr(&self.metrics.commands_received_total);

        let cmd = match decode_message(frame) {
            Ok((Envelope::Command(cmd), _)) => cmd,
            Ok((other, _)) => {
                Metrics::incr(&self.metrics.commands_ignored_total);
                log::warn!("Ignoring {} from gateway", other.name());
                return None;
            }
            Err(e) => {
                Metrics::incr(&self.metrics.commands_ignored_total);
                log::warn!("Ignoring malformed frame from gateway: {}", e);
                return None;
            }
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let effect = state.apply(&cmd);

        match &effect {
            CommandEffect::Switched(_) | CommandEffect::Configured(_) => {
                Metrics::incr(&self.metrics.commands_applied_total);
                log::info!("Command applied, now {}", state);
            }
            CommandEffect::NotAddressed => {
                Metrics::incr(&self.metrics.commands_ignored_total);
                log::debug!("Ignoring command for {}", cmd.device_id);
            }
            CommandEffect::Unsupported(change) => {
                Metrics::incr(&self.metrics.commands_ignored_total);
                log::warn!("{} does not support config {}", state.kind, change);
            }
        }

        Some(effect)
    }

    /// Send one fresh reading; `None` if this kind has nothing to report
    pub fn report_status(
        &self,
        socket: &UdpSocket,
        status_addr: SocketAddr,
    ) -> io::Result<Option<StatusPayload>> {
        let (id, kind) = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            (state.id.clone(), state.kind)
        };

        let payload = match read_sensor(kind, &self.rng)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, AgentError::Random.to_string()))?
        {
            Some(payload) => payload,
            None => return Ok(None),
        };

        let frame = encode_message(&Envelope::Status(StatusUpdate {
            device_id: id,
            payload: payload.clone(),
        }))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        socket.send_to(&frame, status_addr)?;

        Metrics::incr(&self.metrics.status_sent_total);
        log::info!("Sent status {} to {}", payload, status_addr);
        Ok(Some(payload))
    }

    /// Report forever, one reading per interval
    pub fn run_status(&self, socket: &UdpSocket, status_addr: SocketAddr, interval: Duration) {
        loop {
            if let Err(e) = self.report_status(socket, status_addr) {
                Metrics::incr(&self.metrics.status_send_failures_total);
                log::warn!("Status report to {} failed: {}", status_addr, e);
            }
            thread::sleep(interval);
        }
    }
}

/// Unbound-port socket for status datagrams
pub fn status_socket() -> io::Result<UdpSocket> {
    UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
}
