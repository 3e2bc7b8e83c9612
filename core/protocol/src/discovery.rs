//! Gateway discovery over UDP multicast
//!
//! The Gateway multicasts a [`GatewayAnnouncement`] every
//! [`ANNOUNCE_INTERVAL`]. Devices and control clients join the group and use
//! the first valid announcement to locate the device and client ports.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use crate::codec::{decode_datagram, HEADER_LEN, MAX_MESSAGE_SIZE};
use crate::message::{Envelope, GatewayAnnouncement};

// ============================================================================
// Constants
// ============================================================================

/// Multicast group the Gateway announces on
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 1, 1, 1);

/// Multicast port the Gateway announces on
pub const DEFAULT_MULTICAST_PORT: u16 = 5007;

/// Period between announcements
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(10);

// ============================================================================
// Announcement Endpoints
// ============================================================================

impl GatewayAnnouncement {
    fn ip(&self) -> io::Result<IpAddr> {
        self.address.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid gateway address '{}'", self.address),
            )
        })
    }

    /// Address devices connect to for registration
    pub fn device_endpoint(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::new(self.ip()?, self.device_port))
    }

    /// Address control clients connect to
    pub fn client_endpoint(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::new(self.ip()?, self.client_port))
    }
}

// ============================================================================
// Listening
// ============================================================================

/// Bind the discovery port on all interfaces and join the multicast group
///
/// The port is bound with address reuse so several devices and clients on
/// one host can listen at the same time.
pub fn join_discovery_group(group: Ipv4Addr, port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    log::debug!("Joined discovery group {}:{}", group, port);
    Ok(socket.into())
}

/// Block until a valid announcement arrives on `socket`
///
/// Datagrams that are not announcements are skipped. With a `timeout`, the
/// wait fails with `TimedOut` once the deadline passes.
pub fn wait_for_announcement(
    socket: &UdpSocket,
    timeout: Option<Duration>,
) -> io::Result<(GatewayAnnouncement, SocketAddr)> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut buf = vec![0u8; HEADER_LEN + MAX_MESSAGE_SIZE as usize];

    loop {
        let remaining = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "no gateway announcement received",
                    ));
                }
                Some(deadline - now)
            }
            None => None,
        };
        socket.set_read_timeout(remaining)?;

        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => return Err(e),
        };

        match decode_datagram(&buf[..len]) {
            Ok(Envelope::GatewayAnnouncement(announcement)) => return Ok((announcement, from)),
            Ok(other) => log::debug!("Ignoring {} on discovery channel from {}", other.name(), from),
            Err(e) => log::debug!("Ignoring undecodable discovery datagram from {}: {}", from, e),
        }
    }
}
