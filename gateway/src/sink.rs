//! Outbound command sinks
//!
//! A sink is the only capability the Gateway keeps for a registered device:
//! something framed commands can be written to. The registry owns each sink;
//! routing borrows it through an `Arc` for the duration of one write.

use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Mutex, PoisonError};

// ============================================================================
// Sink Capability
// ============================================================================

/// Write side of a device connection
pub trait CommandSink: Send + Sync {
    /// Write one complete frame; concurrent callers never interleave
    fn send_frame(&self, frame: &[u8]) -> io::Result<()>;

    /// Close the underlying connection. Later sends fail.
    fn close(&self);

    /// Human-readable peer description for logs
    fn peer(&self) -> String;
}

// ============================================================================
// TCP Sink
// ============================================================================

/// Sink over the device's registration connection
pub struct TcpSink {
    stream: Mutex<TcpStream>,
    /// Second handle to the same socket; shutting it down never waits for
    /// the write lock and wakes a writer stuck on a peer that stopped reading
    control: TcpStream,
    peer: SocketAddr,
}

impl TcpSink {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        // Commands are small and latency matters more than batching
        stream.set_nodelay(true)?;
        let control = stream.try_clone()?;
        Ok(TcpSink {
            stream: Mutex::new(stream),
            control,
            peer,
        })
    }
}

impl CommandSink for TcpSink {
    fn send_frame(&self, frame: &[u8]) -> io::Result<()> {
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        stream.write_all(frame)?;
        stream.flush()
    }

    fn close(&self) {
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            log::debug!("Shutdown of {} failed: {}", self.peer, e);
        }
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}

// ============================================================================
// Test Support
// ============================================================================
