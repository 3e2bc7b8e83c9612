//! Connection manager and command router
//!
//! Two TCP listeners, one worker thread per accepted connection.
//!
//! # Device connections
//!
//! ```text
//! AwaitingFirstMessage ──DeviceRegistration──► Registered (stream kept as sink)
//!          │
//!          └──anything else / EOF / garbage──► Rejected (stream closed)
//! ```
//! Exactly one frame is read. After registration the stream is only ever
//! written to, by whichever client worker routes a command to the device.
//!
//! # Client connections
//!
//! ```text
//! Open ──► [ListRequest → ListResponse | Command → forwarded]* ──► Closed
//! ```
//! A decode failure ends the session like a disconnect. Commands are never
//! acknowledged; unknown targets are logged and dropped.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use city_protocol::{
    decode_message, read_frame, write_message, Command, CommandAction, DecodeError, DeviceKind,
    Envelope,
};

use crate::metrics::Metrics;
use crate::registry::DeviceRegistry;
use crate::sink::TcpSink;

// ============================================================================
// Outcomes
// ============================================================================

/// Result of the single read on a device connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// Device stored in the registry; `replaced` if the id already existed
    Registered { id: String, replaced: bool },
    /// Connection closed without registering
    Rejected(String),
}

/// What the router did with one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    UnknownDevice,
    SendFailed,
}

/// What a client worker does after processing one frame
#[derive(Debug, Clone, PartialEq)]
pub enum ClientAction {
    /// Write this envelope back to the client
    Reply(Envelope),
    /// Command handed to the router, nothing to send back
    Routed(RouteOutcome),
    /// Envelope not valid on the client port, ignored
    Ignored,
}

// ============================================================================
// Connection Manager
// ============================================================================

/// Shared state handed to every connection worker
#[derive(Clone)]
pub struct ConnectionManager {
    registry: Arc<DeviceRegistry>,
    metrics: Arc<Metrics>,
}

impl ConnectionManager {
    pub fn new(registry: Arc<DeviceRegistry>, metrics: Arc<Metrics>) -> Self {
        ConnectionManager { registry, metrics }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    // ------------------------------------------------------------------------
    // Accept loops
    // ------------------------------------------------------------------------

    /// Accept device connections forever, one worker per connection
    pub fn serve_devices(&self, listener: TcpListener) {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    log::error!("Device accept failed: {}", e);
                    continue;
                }
            };

            let manager = self.clone();
            let spawned = thread::Builder::new()
                .name("device-conn".to_string())
                .spawn(move || {
                    manager.handle_device_connection(stream);
                });
            if let Err(e) = spawned {
                log::error!("Failed to spawn device worker: {}", e);
            }
        }
    }

    /// Accept client connections forever, one worker per connection
    pub fn serve_clients(&self, listener: TcpListener) {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    log::error!("Client accept failed: {}", e);
                    continue;
                }
            };

            let manager = self.clone();
            let spawned = thread::Builder::new()
                .name("client-conn".to_string())
                .spawn(move || manager.handle_client_connection(stream));
            if let Err(e) = spawned {
                log::error!("Failed to spawn client worker: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Device worker
    // ------------------------------------------------------------------------

    /// Read the registration frame and hand the stream to the registry
    pub fn handle_device_connection(&self, mut stream: TcpStream) -> RegistrationOutcome {
        let peer = describe_peer(&stream);

        let outcome = match read_frame(&mut stream) {
            Ok(Some(frame)) => match decode_message(&frame) {
                Ok((Envelope::DeviceRegistration { id, kind }, _)) => {
                    self.register_device(stream, id, kind, &peer)
                }
                Ok((other, _)) => {
                    RegistrationOutcome::Rejected(format!("first message was {}", other.name()))
                }
                Err(e) => {
                    Metrics::incr(&self.metrics.malformed_messages_total);
                    RegistrationOutcome::Rejected(e.to_string())
                }
            },
            Ok(None) => RegistrationOutcome::Rejected("closed before registering".to_string()),
            Err(e) => RegistrationOutcome::Rejected(e.to_string()),
        };

        if let RegistrationOutcome::Rejected(reason) = &outcome {
            Metrics::incr(&self.metrics.registration_rejections_total);
            log::warn!("Rejected device connection from {}: {}", peer, reason);
        }

        outcome
    }

    fn register_device(
        &self,
        stream: TcpStream,
        id: String,
        kind: DeviceKind,
        peer: &str,
    ) -> RegistrationOutcome {
        let sink = match TcpSink::new(stream) {
            Ok(sink) => Arc::new(sink),
            Err(e) => return RegistrationOutcome::Rejected(e.to_string()),
        };

        let replaced = self.registry.insert(id.clone(), kind, sink);
        Metrics::incr(&self.metrics.registrations_total);
        self.metrics
            .registered_devices
            .store(self.registry.len() as u64, Ordering::Relaxed);

        // Close the superseded connection only after the registry lock is released
        if let Some(old) = &replaced {
            log::info!(
                "Device {} re-registered from {}, closing previous connection {}",
                id,
                peer,
                old.sink.peer()
            );
            old.sink.close();
        } else {
            log::info!("Device {} ({}) registered from {}", id, kind, peer);
        }

        RegistrationOutcome::Registered {
            id,
            replaced: replaced.is_some(),
        }
    }

    // ------------------------------------------------------------------------
    // Client worker
    // ------------------------------------------------------------------------

    /// Serve one control client until it disconnects
    pub fn handle_client_connection(&self, mut stream: TcpStream) {
        let peer = describe_peer(&stream);
        log::info!("Client connected from {}", peer);
        Metrics::incr(&self.metrics.client_connections_total);
        self.metrics
            .active_client_connections
            .fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.client_session(&mut stream, &peer) {
            log::debug!("Client {} session ended with error: {}", peer, e);
        }

        self.metrics
            .active_client_connections
            .fetch_sub(1, Ordering::Relaxed);
        log::info!("Client {} disconnected", peer);
    }

    fn client_session(&self, stream: &mut TcpStream, peer: &str) -> io::Result<()> {
        while let Some(frame) = read_frame(stream)? {
            match self.process_client_frame(&frame) {
                Ok(ClientAction::Reply(reply)) => write_message(stream, &reply)?,
                Ok(ClientAction::Routed(_)) => {}
                Ok(ClientAction::Ignored) => {}
                Err(e) => {
                    Metrics::incr(&self.metrics.malformed_messages_total);
                    log::warn!("Malformed message from client {}: {}", peer, e);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Decode one client frame and act on it
    ///
    /// `frame` must be the complete frame as received; commands are
    /// forwarded as these exact bytes.
    pub fn process_client_frame(&self, frame: &[u8]) -> Result<ClientAction, DecodeError> {
        let (msg, _) = decode_message(frame)?;

        match msg {
            Envelope::ListRequest => {
                Metrics::incr(&self.metrics.list_requests_total);
                let devices = self.registry.snapshot();
                log::debug!("Serving device list ({} devices)", devices.len());
                Ok(ClientAction::Reply(Envelope::ListResponse { devices }))
            }
            Envelope::Command(cmd) => Ok(ClientAction::Routed(self.route_command(&cmd, frame))),
            other => {
                log::warn!("Ignoring {} on client connection", other.name());
                Ok(ClientAction::Ignored)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Router
    // ------------------------------------------------------------------------

    /// Forward `frame` (the encoded `cmd`) to the target device
    pub fn route_command(&self, cmd: &Command, frame: &[u8]) -> RouteOutcome {
        let route = match self.registry.lookup_route(&cmd.device_id) {
            Some(route) => route,
            None => {
                Metrics::incr(&self.metrics.commands_unroutable_total);
                log::warn!("Dropping command for unknown device {}", cmd.device_id);
                return RouteOutcome::UnknownDevice;
            }
        };

        if let CommandAction::SetConfig(change) = &cmd.action {
            if change.target_kind() != route.kind {
                // Forwarded anyway; the device decides what it accepts
                log::warn!(
                    "Config {} targets {} but device {} is {}",
                    change,
                    change.target_kind(),
                    cmd.device_id,
                    route.kind
                );
            }
        }

        match route.sink.send_frame(frame) {
            Ok(()) => {
                Metrics::incr(&self.metrics.commands_routed_total);
                log::info!("Forwarded {:?} to {}", cmd.action, cmd.device_id);
                RouteOutcome::Delivered
            }
            Err(e) => {
                Metrics::incr(&self.metrics.command_send_failures_total);
                log::warn!(
                    "Failed to forward command to {} ({}): {}",
                    cmd.device_id,
                    route.sink.peer(),
                    e
                );
                RouteOutcome::SendFailed
            }
        }
    }
}

fn describe_peer(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown peer".to_string())
}
