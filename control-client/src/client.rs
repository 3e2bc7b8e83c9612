//! Control session with the Gateway
//!
//! One TCP connection carries every request. Lists get a reply; commands
//! are fire-and-forget, the Gateway never acknowledges them.

use std::fmt::Write as _;
use std::io;
use std::net::{SocketAddr, TcpStream};

use city_protocol::{
    read_message, write_message, Command, ConfigChange, DeviceSummary, Envelope,
};

// ============================================================================
// Requests
// ============================================================================

/// One user request, from flags or an interactive line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    List,
    Toggle(String),
    Configure(String, ConfigChange),
    Help,
    Quit,
}

impl Request {
    /// Parse an interactive line
    ///
    /// ```text
    /// list
    /// toggle <device-id>
    /// config <device-id> <key:value>
    /// help | quit | exit
    /// ```
    pub fn parse(line: &str) -> Result<Request, String> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or_else(|| "empty request".to_string())?;

        let request = match verb.to_ascii_lowercase().as_str() {
            "list" | "ls" => Request::List,
            "toggle" => {
                let id = words.next().ok_or("usage: toggle <device-id>")?;
                Request::Toggle(id.to_string())
            }
            "config" => {
                let (id, setting) = match (words.next(), words.next()) {
                    (Some(id), Some(setting)) => (id, setting),
                    _ => return Err("usage: config <device-id> <key:value>".to_string()),
                };
                Request::Configure(id.to_string(), ConfigChange::parse(setting)?)
            }
            "help" | "?" => Request::Help,
            "quit" | "exit" => Request::Quit,
            other => return Err(format!("unknown request '{}'", other)),
        };

        if words.next().is_some() {
            return Err(format!("too many arguments for '{}'", verb));
        }
        Ok(request)
    }
}

pub const HELP: &str = "\
Requests:
  list                            Show registered devices
  toggle <device-id>              Switch a device on/off
  config <device-id> <key:value>  resolution:<name> (camera), duration:<secs> (traffic light)
  quit                            Leave";

// ============================================================================
// Session
// ============================================================================

pub struct ControlClient {
    stream: TcpStream,
    peer: SocketAddr,
}

impl ControlClient {
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        log::info!("Connected to gateway at {}", addr);
        Ok(ControlClient { stream, peer: addr })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Current device list, ordered by id
    pub fn list(&mut self) -> io::Result<Vec<DeviceSummary>> {
        write_message(&mut self.stream, &Envelope::ListRequest)?;
        match read_message(&mut self.stream)? {
            Envelope::ListResponse { devices } => Ok(devices),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected ListResponse, got {}", other.name()),
            )),
        }
    }

    pub fn send_command(&mut self, cmd: Command) -> io::Result<()> {
        log::debug!("Sending {:?} to {}", cmd.action, cmd.device_id);
        write_message(&mut self.stream, &Envelope::Command(cmd))
    }

    /// Carry out `request`, returning the text to show the user
    pub fn execute(&mut self, request: &Request) -> io::Result<String> {
        match request {
            Request::List => Ok(format_devices(&self.list()?)),
            Request::Toggle(id) => {
                self.send_command(Command::toggle(id.as_str()))?;
                Ok(format!("Toggle sent to {}", id))
            }
            Request::Configure(id, change) => {
                self.send_command(Command::set_config(id.as_str(), change.clone()))?;
                Ok(format!("Config {} sent to {}", change, id))
            }
            Request::Help => Ok(HELP.to_string()),
            Request::Quit => Ok(String::new()),
        }
    }
}

/// Human-readable device table
pub fn format_devices(devices: &[DeviceSummary]) -> String {
    if devices.is_empty() {
        return "No devices registered".to_string();
    }

    let mut out = format!("{} device(s):", devices.len());
    for device in devices {
        let _ = write!(out, "\n  {:<16} {}", device.id, device.kind);
    }
    out
}
