//! Smart City wire protocol
//!
//! Shared by the Gateway, the device agents and the control client:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     Protocol Crate Structure                  │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  message.rs   - Envelope and payload types                    │
//! │  codec.rs     - Length-prefixed bincode framing               │
//! │  discovery.rs - Multicast announcement constants and listener │
//! │                                                               │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! There is no version field: all participants must agree on this crate.

pub mod codec;
pub mod discovery;
pub mod message;

pub use codec::{
    decode_datagram,
    decode_message,
    encode_message,
    read_frame,
    read_message,
    write_message,
    DecodeError,
    EncodeError,
    HEADER_LEN,
    MAX_MESSAGE_SIZE,
};

pub use discovery::{
    join_discovery_group,
    wait_for_announcement,
    ANNOUNCE_INTERVAL,
    DEFAULT_MULTICAST_GROUP,
    DEFAULT_MULTICAST_PORT,
};

pub use message::{
    Command,
    CommandAction,
    ConfigChange,
    DeviceKind,
    DeviceSummary,
    Envelope,
    GatewayAnnouncement,
    StatusPayload,
    StatusUpdate,
};

/// Default TCP port devices register on
pub const DEFAULT_DEVICE_PORT: u16 = 10000;

/// Default UDP port devices send status datagrams to
pub const DEFAULT_STATUS_PORT: u16 = 10001;

/// Default TCP port control clients connect to
pub const DEFAULT_CLIENT_PORT: u16 = 10003;
