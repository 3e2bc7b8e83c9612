//! Gateway assembly
//!
//! Binds every socket up front so startup failures surface before any
//! worker runs, then spawns the long-lived threads:
//!
//! ```text
//! device-accept   ─► device-conn (one per device)
//! client-accept   ─► client-conn (one per client)
//! status-listener
//! announcer       (unless discovery is disabled)
//! metrics         (only with a metrics port)
//! ```
//! No thread is ever asked to stop; the process exits on signal.

use std::io;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use city_protocol::GatewayAnnouncement;
use tiny_http::Server;

use crate::config::GatewayConfig;
use crate::connection::ConnectionManager;
use crate::discovery::{advertise_address, Announcer};
use crate::metrics::{serve_metrics, Metrics};
use crate::registry::DeviceRegistry;
use crate::status::StatusListener;

// ============================================================================
// Bound Gateway
// ============================================================================

/// A Gateway whose sockets are bound but whose workers are not yet running
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<DeviceRegistry>,
    metrics: Arc<Metrics>,
    device_listener: TcpListener,
    client_listener: TcpListener,
    status_socket: UdpSocket,
    metrics_server: Option<(Server, SocketAddr)>,
}

impl Gateway {
    /// Bind all listeners described by `config`
    pub fn bind(config: GatewayConfig) -> io::Result<Self> {
        let ip = config.bind_address;

        let device_listener = TcpListener::bind(SocketAddr::new(ip, config.device_port))?;
        let client_listener = TcpListener::bind(SocketAddr::new(ip, config.client_port))?;
        let status_socket = UdpSocket::bind(SocketAddr::new(ip, config.status_port))?;
        let metrics_server = match config.metrics_port {
            Some(port) => Some(bind_metrics(SocketAddr::new(ip, port))?),
            None => None,
        };

        Ok(Gateway {
            config,
            registry: Arc::new(DeviceRegistry::new()),
            metrics: Arc::new(Metrics::new()),
            device_listener,
            client_listener,
            status_socket,
            metrics_server,
        })
    }

    pub fn device_addr(&self) -> io::Result<SocketAddr> {
        self.device_listener.local_addr()
    }

    pub fn client_addr(&self) -> io::Result<SocketAddr> {
        self.client_listener.local_addr()
    }

    pub fn status_addr(&self) -> io::Result<SocketAddr> {
        self.status_socket.local_addr()
    }

    /// Announcement describing the bound ports
    pub fn announcement(&self) -> io::Result<GatewayAnnouncement> {
        Ok(GatewayAnnouncement {
            address: advertise_address(self.config.advertise_address).to_string(),
            device_port: self.device_addr()?.port(),
            client_port: self.client_addr()?.port(),
        })
    }

    /// Start every worker thread
    pub fn spawn(self) -> io::Result<GatewayHandle> {
        let device_addr = self.device_addr()?;
        let client_addr = self.client_addr()?;
        let status_addr = self.status_addr()?;
        let metrics_addr = self.metrics_server.as_ref().map(|(_, addr)| *addr);

        let mut threads = Vec::new();

        if self.config.discovery_enabled {
            let announcement = self.announcement()?;
            log::info!(
                "Advertising {} (devices :{}, clients :{})",
                announcement.address,
                announcement.device_port,
                announcement.client_port
            );
            let announcer = Announcer::new(&self.config, announcement, Arc::clone(&self.metrics))?;
            threads.push(spawn_named("announcer", move || announcer.run())?);
        } else {
            log::info!("Discovery disabled");
        }

        let status = StatusListener::new(
            self.status_socket,
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
        );
        threads.push(spawn_named("status-listener", move || status.run())?);

        let manager = ConnectionManager::new(Arc::clone(&self.registry), Arc::clone(&self.metrics));

        let devices = manager.clone();
        let device_listener = self.device_listener;
        threads.push(spawn_named("device-accept", move || {
            devices.serve_devices(device_listener)
        })?);

        let client_listener = self.client_listener;
        threads.push(spawn_named("client-accept", move || {
            manager.serve_clients(client_listener)
        })?);

        if let Some((server, _)) = self.metrics_server {
            let metrics = Arc::clone(&self.metrics);
            threads.push(spawn_named("metrics", move || serve_metrics(server, metrics))?);
        }

        log::info!("Listening for devices on {} (TCP)", device_addr);
        log::info!("Listening for clients on {} (TCP)", client_addr);
        log::info!("Listening for status on {} (UDP)", status_addr);
        if let Some(addr) = metrics_addr {
            log::info!("Serving metrics on {}", addr);
        }

        Ok(GatewayHandle {
            device_addr,
            client_addr,
            status_addr,
            metrics_addr,
            registry: self.registry,
            metrics: self.metrics,
            threads,
        })
    }
}

/// HTTP server for the metrics endpoint, with the address it is bound to
fn bind_metrics(addr: SocketAddr) -> io::Result<(Server, SocketAddr)> {
    let listener = TcpListener::bind(addr)?;
    let local = listener.local_addr()?;
    let server = Server::from_listener(listener, None)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    Ok((server, local))
}

fn spawn_named<F>(name: &str, f: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(f)
}

// ============================================================================
// Running Gateway
// ============================================================================

/// Addresses and shared state of a running Gateway
pub struct GatewayHandle {
    pub device_addr: SocketAddr,
    pub client_addr: SocketAddr,
    pub status_addr: SocketAddr,
    pub metrics_addr: Option<SocketAddr>,
    registry: Arc<DeviceRegistry>,
    metrics: Arc<Metrics>,
    threads: Vec<JoinHandle<()>>,
}

impl GatewayHandle {
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Number of long-lived worker threads started
    pub fn worker_count(&self) -> usize {
        self.threads.len()
    }
}
