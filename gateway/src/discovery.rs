//! Discovery announcer
//!
//! Multicasts a `GatewayAnnouncement` on a fixed interval so devices and
//! clients can find the Gateway without static configuration. Delivery is
//! fire-and-forget: send errors are logged and the next tick tries again.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use city_protocol::{encode_message, Envelope, GatewayAnnouncement};

use crate::config::GatewayConfig;
use crate::metrics::Metrics;

/// External address used only to let the OS pick the outbound interface.
/// Nothing is ever sent to it.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

// ============================================================================
// Address Resolution
// ============================================================================

/// Local address the OS would use to reach the outside world
pub fn outbound_address() -> io::Result<IpAddr> {
    let probe = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
    // connect() on UDP only selects a route, no packet leaves the host
    probe.connect(ROUTE_PROBE_ADDR)?;
    let local = probe.local_addr()?.ip();
    if local.is_unspecified() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no outbound interface selected",
        ));
    }
    Ok(local)
}

/// Address to advertise: the configured one, else the outbound interface,
/// else loopback
pub fn advertise_address(configured: Option<IpAddr>) -> IpAddr {
    if let Some(addr) = configured {
        return addr;
    }

    match outbound_address() {
        Ok(addr) => addr,
        Err(e) => {
            log::warn!("Cannot resolve outbound address ({}), advertising loopback", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

// ============================================================================
// Announcer
// ============================================================================

/// Periodic multicast sender
pub struct Announcer {
    socket: UdpSocket,
    destination: SocketAddrV4,
    frame: Vec<u8>,
    interval: Duration,
    metrics: Arc<Metrics>,
}

impl Announcer {
    /// Build the announcer for the given bound listener ports
    pub fn new(
        config: &GatewayConfig,
        announcement: GatewayAnnouncement,
        metrics: Arc<Metrics>,
    ) -> io::Result<Self> {
        // Binding to a specific IPv4 address makes it the multicast interface
        let local = match config.bind_address {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        let socket = UdpSocket::bind(SocketAddrV4::new(local, 0))?;
        socket.set_multicast_ttl_v4(config.multicast_ttl)?;

        let frame = encode_message(&Envelope::GatewayAnnouncement(announcement))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        Ok(Announcer {
            socket,
            destination: SocketAddrV4::new(config.multicast_group, config.multicast_port),
            frame,
            interval: config.announce_interval(),
            metrics,
        })
    }

    /// Send a single announcement
    pub fn announce_once(&self) -> io::Result<()> {
        self.socket.send_to(&self.frame, self.destination)?;
        Metrics::incr(&self.metrics.announcements_sent_total);
        log::debug!("Sent announcement to {}", self.destination);
        Ok(())
    }

    /// Announce forever, one datagram per interval
    pub fn run(&self) {
        log::info!(
            "Announcing on {} every {:?}",
            self.destination,
            self.interval
        );
        loop {
            if let Err(e) = self.announce_once() {
                log::warn!("Announcement to {} failed: {}", self.destination, e);
            }
            thread::sleep(self.interval);
        }
    }
}
