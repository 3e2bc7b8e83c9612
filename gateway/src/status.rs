//! Status ingestion over UDP
//!
//! Devices push `Status` envelopes as datagrams. Only devices that already
//! registered on the device port get their status recorded; anything else is
//! logged and dropped. A bad datagram never stops the listener.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use city_protocol::{decode_datagram, Envelope, HEADER_LEN, MAX_MESSAGE_SIZE};

use crate::metrics::Metrics;
use crate::registry::DeviceRegistry;

/// Pause after a failed receive so a persistent socket error does not spin
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// What happened to one status datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    Applied,
    UnknownDevice,
    Malformed,
    /// Valid envelope, but not a status report
    Unexpected,
}

/// Datagram listener feeding the registry
pub struct StatusListener {
    socket: UdpSocket,
    registry: Arc<DeviceRegistry>,
    metrics: Arc<Metrics>,
}

impl StatusListener {
    pub fn new(socket: UdpSocket, registry: Arc<DeviceRegistry>, metrics: Arc<Metrics>) -> Self {
        StatusListener {
            socket,
            registry,
            metrics,
        }
    }

    /// Receive datagrams forever
    pub fn run(&self) {
        let mut buf = vec![0u8; HEADER_LEN + MAX_MESSAGE_SIZE as usize];

        loop {
            self.receive(&mut buf);
        }
    }

    /// Wait for one datagram and apply it; `None` when the receive failed
    fn receive(&self, buf: &mut [u8]) -> Option<StatusOutcome> {
        match self.socket.recv_from(buf) {
            Ok((len, from)) => Some(self.handle_datagram(&buf[..len], from)),
            Err(e) => {
                // e.g. ICMP port unreachable surfacing on some platforms
                log::error!("Status socket receive failed: {}", e);
                thread::sleep(RECV_ERROR_BACKOFF);
                None
            }
        }
    }

    /// Apply one datagram to the registry
    pub fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) -> StatusOutcome {
        let update = match decode_datagram(datagram) {
            Ok(Envelope::Status(update)) => update,
            Ok(other) => {
                Metrics::incr(&self.metrics.status_dropped_total);
                log::warn!("Ignoring {} datagram from {}", other.name(), from);
                return StatusOutcome::Unexpected;
            }
            Err(e) => {
                Metrics::incr(&self.metrics.malformed_messages_total);
                log::warn!("Dropping malformed status datagram from {}: {}", from, e);
                return StatusOutcome::Malformed;
            }
        };

        let description = update.payload.to_string();
        if self.registry.update_status(&update.device_id, update.payload) {
            Metrics::incr(&self.metrics.status_updates_total);
            log::info!("Status from {}: {}", update.device_id, description);
            StatusOutcome::Applied
        } else {
            Metrics::incr(&self.metrics.status_dropped_total);
            log::warn!(
                "Dropping status for unregistered device {} from {}",
                update.device_id,
                from
            );
            StatusOutcome::UnknownDevice
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::RecordingSink;
    use city_protocol::{encode_message, DeviceKind, StatusPayload, StatusUpdate};

    fn listener() -> StatusListener {
        StatusListener::new(
            UdpSocket::bind("127.0.0.1:0").unwrap(),
            Arc::new(DeviceRegistry::new()),
            Arc::new(Metrics::new()),
        )
    }

    fn status(id: &str, payload: StatusPayload) -> Vec<u8> {
        encode_message(&Envelope::Status(StatusUpdate {
            device_id: id.to_string(),
            payload,
        }))
        .unwrap()
    }

    fn from() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_status_for_registered_device() {
        let l = listener();
        l.registry
            .insert("temp_1", DeviceKind::TempSensor, Arc::new(RecordingSink::default()));

        let outcome = l.handle_datagram(&status("temp_1", StatusPayload::Temperature(21.5)), from());

        assert_eq!(outcome, StatusOutcome::Applied);
        assert_eq!(
            l.registry.status_of("temp_1").unwrap().0,
            StatusPayload::Temperature(21.5)
        );
    }

    #[test]
    fn test_status_for_unknown_device_leaves_registry_unchanged() {
        let l = listener();
        l.registry
            .insert("temp_1", DeviceKind::TempSensor, Arc::new(RecordingSink::default()));

        let outcome = l.handle_datagram(
            &status("ghost", StatusPayload::FreeText("PPM: 40".into())),
            from(),
        );

        assert_eq!(outcome, StatusOutcome::UnknownDevice);
        assert_eq!(l.registry.len(), 1);
        assert!(l.registry.status_of("temp_1").is_none());
        assert!(!l.registry.contains("ghost"));
        assert_eq!(l.metrics.status_dropped_total.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn test_malformed_datagram_dropped() {
        let l = listener();
        assert_eq!(l.handle_datagram(b"GATEWAY_DISCOVERY", from()), StatusOutcome::Malformed);
        assert_eq!(l.handle_datagram(&[], from()), StatusOutcome::Malformed);
    }

    #[test]
    fn test_non_status_envelope_dropped() {
        let l = listener();
        let frame = encode_message(&Envelope::ListRequest).unwrap();
        assert_eq!(l.handle_datagram(&frame, from()), StatusOutcome::Unexpected);
    }

    #[test]
    fn test_latest_status_wins() {
        let l = listener();
        l.registry
            .insert("airq_1", DeviceKind::AirSensor, Arc::new(RecordingSink::default()));

        l.handle_datagram(&status("airq_1", StatusPayload::FreeText("PPM: 30".into())), from());
        l.handle_datagram(&status("airq_1", StatusPayload::FreeText("PPM: 99".into())), from());

        assert_eq!(
            l.registry.status_of("airq_1").unwrap().0,
            StatusPayload::FreeText("PPM: 99".into())
        );
    }

    #[test]
    fn test_receive_applies_datagram() {
        let l = listener();
        l.registry
            .insert("temp_1", DeviceKind::TempSensor, Arc::new(RecordingSink::default()));
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(
                &status("temp_1", StatusPayload::Temperature(18.0)),
                l.socket.local_addr().unwrap(),
            )
            .unwrap();

        let mut buf = vec![0u8; HEADER_LEN + MAX_MESSAGE_SIZE as usize];
        assert_eq!(l.receive(&mut buf), Some(StatusOutcome::Applied));
    }

    #[test]
    fn test_failed_receive_backs_off() {
        let l = listener();
        // Nothing is sent, so every receive fails with a timeout
        l.socket
            .set_read_timeout(Some(Duration::from_millis(1)))
            .unwrap();
        let mut buf = vec![0u8; HEADER_LEN + MAX_MESSAGE_SIZE as usize];

        let started = std::time::Instant::now();
        assert_eq!(l.receive(&mut buf), None);
        assert!(started.elapsed() >= RECV_ERROR_BACKOFF);
    }
}
