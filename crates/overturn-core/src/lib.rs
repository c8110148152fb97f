//! # Overturn Core
//!
//! Core protocol implementation for Overturn, an overlay network that
//! carries IP traffic inside ICMP echo packets.
//!
//! This crate provides:
//! - Packet framing (zero-copy parsing of the magic-tagged tunnel frame)
//! - Control messages (heartbeat, join request, node activation)
//! - Cluster membership state and the term/index ordering rules
//! - Error types and handling
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       NetworkCluster                             │
//! │   (members, index-by-IP, index-by-ID, master, term, index)       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                       ControlMessage                             │
//! │   (heartbeat / join / activate payloads)                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                           Packet                                 │
//! │   (magic, version, type, length, payload)                        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cluster;
pub mod config;
pub mod error;
pub mod message;
pub mod packet;

pub use cluster::{
    ActivateOutcome, HeartbeatOutcome, JoinOutcome, NetworkCluster, NetworkNode, NodeKey,
};
pub use config::{NetworkConfig, NodeConfig};
pub use error::{ClusterError, MessageError, PacketError};
pub use message::{
    ControlMessage, Heartbeat, HeartbeatKind, JoinRequest, Message, NetName, NodeActivate,
};
pub use packet::{Packet, PacketMut, PayloadType};

/// Magic tag identifying tunnel traffic
pub const MAGIC: [u8; 4] = [b'O', b'V', b'T', 0xAA];

/// Protocol version, major
pub const VERSION_MAJOR: u8 = 1;

/// Protocol version, minor
pub const VERSION_MINOR: u8 = 0;

/// Fixed packet header size in bytes
pub const HEADER_SIZE: usize = 12;

/// Default upper bound for an accepted packet
pub const DEFAULT_SIZE_LIMIT: usize = 65536;
