//! Control messages carried as packet payloads.
//!
//! Every message has a fixed size; the flavour of a message is given by the
//! enclosing packet's type code, never by the payload itself. Messages are
//! pure codecs: comparing a heartbeat against cluster state is the job of
//! [`crate::cluster::NetworkCluster`].
//!
//! ```text
//! Heartbeat     net-name(16) | master-id(16) | term(8, BE) | index(8, BE)
//! JoinRequest   name(16)     | token(16)
//! NodeActivate  id(16)
//! ```

use std::fmt;

use uuid::Uuid;

use crate::error::{MessageError, PacketError};
use crate::packet::{Packet, PayloadType};

/// Width of fixed-size names on the wire
pub const NAME_SIZE: usize = 16;

/// Width of a UUID on the wire
pub const ID_SIZE: usize = 16;

/// Fixed-width, NUL-padded name
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NetName([u8; NAME_SIZE]);

impl NetName {
    /// Create a name, truncating at the last character boundary that fits
    pub fn new(name: &str) -> Self {
        let mut end = name.len().min(NAME_SIZE);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let mut bytes = [0u8; NAME_SIZE];
        bytes[..end].copy_from_slice(&name.as_bytes()[..end]);
        Self(bytes)
    }

    /// Wrap raw wire bytes
    pub fn from_bytes(bytes: [u8; NAME_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw wire bytes
    pub fn as_bytes(&self) -> &[u8; NAME_SIZE] {
        &self.0
    }

    /// The name without trailing NUL padding
    pub fn to_string_lossy(&self) -> String {
        let end = self
            .0
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |position| position + 1);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

impl fmt::Debug for NetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NetName").field(&self.to_string_lossy()).finish()
    }
}

impl fmt::Display for NetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl From<&str> for NetName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Fixed-size control message codec
pub trait Message: Sized {
    /// Exact payload size in bytes
    const SIZE: usize;

    /// Packet type code carrying this message
    fn type_code(&self) -> PayloadType;

    /// Serialize to exactly [`Message::SIZE`] bytes
    fn marshal(&self) -> Vec<u8>;

    /// Parse the payload of a packet of type `payload_type`
    ///
    /// # Errors
    ///
    /// Returns `MessageError::UnexpectedType` if `payload_type` does not
    /// carry this message, or the message's format error if `buf` is not
    /// exactly [`Message::SIZE`] bytes.
    fn unmarshal(payload_type: PayloadType, buf: &[u8]) -> Result<Self, MessageError>;

    /// Payload size in bytes
    fn size(&self) -> usize {
        Self::SIZE
    }

    /// Wrap the message into a complete packet
    fn to_packet(&self) -> Result<Vec<u8>, PacketError> {
        Packet::encode(self.type_code(), &self.marshal())
    }
}

fn id_at(buf: &[u8], offset: usize) -> Uuid {
    let mut bytes = [0u8; ID_SIZE];
    bytes.copy_from_slice(&buf[offset..offset + ID_SIZE]);
    Uuid::from_bytes(bytes)
}

fn name_at(buf: &[u8], offset: usize) -> NetName {
    let mut bytes = [0u8; NAME_SIZE];
    bytes.copy_from_slice(&buf[offset..offset + NAME_SIZE]);
    NetName::from_bytes(bytes)
}

fn u64_at(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

/// Heartbeat flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeartbeatKind {
    /// Emitted by the master
    Master,
    /// Emitted by a follower
    Node,
}

impl HeartbeatKind {
    /// Packet type code of this flavour
    pub fn payload_type(self) -> PayloadType {
        match self {
            Self::Master => PayloadType::HeartbeatMaster,
            Self::Node => PayloadType::HeartbeatNode,
        }
    }

    /// Flavour carried by a packet type code
    pub fn from_payload_type(payload_type: PayloadType) -> Option<Self> {
        match payload_type {
            PayloadType::HeartbeatMaster => Some(Self::Master),
            PayloadType::HeartbeatNode => Some(Self::Node),
            _ => None,
        }
    }
}

fn expect_type(actual: PayloadType, expected: PayloadType) -> Result<(), MessageError> {
    if actual == expected {
        Ok(())
    } else {
        Err(MessageError::UnexpectedType(actual.code()))
    }
}

/// Liveness pulse carrying the sender's view of the cluster clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// Master or follower heartbeat
    pub kind: HeartbeatKind,
    /// Network the sender belongs to
    pub net_name: NetName,
    /// Master the sender follows (itself for a master heartbeat)
    pub master: Uuid,
    /// Logical epoch
    pub term: u64,
    /// Sequence within the term
    pub index: u64,
}

impl Heartbeat {
    /// Create a heartbeat
    pub fn new(kind: HeartbeatKind, net_name: NetName, master: Uuid, term: u64, index: u64) -> Self {
        Self {
            kind,
            net_name,
            master,
            term,
            index,
        }
    }
}

impl Message for Heartbeat {
    const SIZE: usize = NAME_SIZE + ID_SIZE + 8 + 8;

    fn type_code(&self) -> PayloadType {
        self.kind.payload_type()
    }

    fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(self.net_name.as_bytes());
        buf.extend_from_slice(self.master.as_bytes());
        buf.extend_from_slice(&self.term.to_be_bytes());
        buf.extend_from_slice(&self.index.to_be_bytes());
        buf
    }

    fn unmarshal(payload_type: PayloadType, buf: &[u8]) -> Result<Self, MessageError> {
        let kind = HeartbeatKind::from_payload_type(payload_type)
            .ok_or(MessageError::UnexpectedType(payload_type.code()))?;
        if buf.len() != Self::SIZE {
            return Err(MessageError::InvalidHeartbeat {
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }
        Ok(Self {
            kind,
            net_name: name_at(buf, 0),
            master: id_at(buf, NAME_SIZE),
            term: u64_at(buf, NAME_SIZE + ID_SIZE),
            index: u64_at(buf, NAME_SIZE + ID_SIZE + 8),
        })
    }
}

/// Request to join a network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinRequest {
    /// Requested network
    pub name: NetName,
    /// Membership token
    pub token: Uuid,
}

impl JoinRequest {
    /// Create a join request
    pub fn new(name: NetName, token: Uuid) -> Self {
        Self { name, token }
    }
}

impl Message for JoinRequest {
    const SIZE: usize = NAME_SIZE + ID_SIZE;

    fn type_code(&self) -> PayloadType {
        PayloadType::JoinRequest
    }

    fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(self.name.as_bytes());
        buf.extend_from_slice(self.token.as_bytes());
        buf
    }

    fn unmarshal(payload_type: PayloadType, buf: &[u8]) -> Result<Self, MessageError> {
        expect_type(payload_type, PayloadType::JoinRequest)?;
        if buf.len() != Self::SIZE {
            return Err(MessageError::InvalidJoinRequest {
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }
        Ok(Self {
            name: name_at(buf, 0),
            token: id_at(buf, NAME_SIZE),
        })
    }
}

/// An existing node is up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeActivate {
    /// Node identifier
    pub id: Uuid,
}

impl NodeActivate {
    /// Create an activation message
    pub fn new(id: Uuid) -> Self {
        Self { id }
    }
}

impl Message for NodeActivate {
    const SIZE: usize = ID_SIZE;

    fn type_code(&self) -> PayloadType {
        PayloadType::NodeActivate
    }

    fn marshal(&self) -> Vec<u8> {
        self.id.as_bytes().to_vec()
    }

    fn unmarshal(payload_type: PayloadType, buf: &[u8]) -> Result<Self, MessageError> {
        expect_type(payload_type, PayloadType::NodeActivate)?;
        if buf.len() != Self::SIZE {
            return Err(MessageError::InvalidNodeActivate {
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }
        Ok(Self { id: id_at(buf, 0) })
    }
}

/// Any control message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Master or follower heartbeat
    Heartbeat(Heartbeat),
    /// Join request
    JoinRequest(JoinRequest),
    /// Node activation
    NodeActivate(NodeActivate),
}

impl ControlMessage {
    /// Decode the payload of a control packet
    pub fn decode(payload_type: PayloadType, payload: &[u8]) -> Result<Self, MessageError> {
        match payload_type {
            PayloadType::Raw => Err(MessageError::NotControl(payload_type.code())),
            PayloadType::NodeActivate => {
                NodeActivate::unmarshal(payload_type, payload).map(Self::NodeActivate)
            }
            PayloadType::HeartbeatMaster | PayloadType::HeartbeatNode => {
                Heartbeat::unmarshal(payload_type, payload).map(Self::Heartbeat)
            }
            PayloadType::JoinRequest => {
                JoinRequest::unmarshal(payload_type, payload).map(Self::JoinRequest)
            }
        }
    }

    /// Decode the payload of a parsed packet
    pub fn from_packet(packet: &Packet<'_>) -> Result<Self, MessageError> {
        Self::decode(packet.payload_type(), packet.payload())
    }

    /// Packet type code of the message
    pub fn type_code(&self) -> PayloadType {
        match self {
            Self::Heartbeat(message) => message.type_code(),
            Self::JoinRequest(message) => message.type_code(),
            Self::NodeActivate(message) => message.type_code(),
        }
    }

    /// Wrap the message into a complete packet
    pub fn to_packet(&self) -> Result<Vec<u8>, PacketError> {
        match self {
            Self::Heartbeat(message) => message.to_packet(),
            Self::JoinRequest(message) => message.to_packet(),
            Self::NodeActivate(message) => message.to_packet(),
        }
    }
}
