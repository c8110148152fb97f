//! Packet encoding and decoding for the Overturn wire protocol.
//!
//! A packet is a fixed 12-byte header followed by the payload. All
//! multi-byte fields are big-endian (network byte order).
//!
//! ```text
//!  0       4       6       8               12
//! ┌───────┬───────┬───────┬───────────────┬──────────────────┐
//! │ magic │ major │ type  │ total length  │ payload ...      │
//! │ 4     │ minor │ 2     │ 4             │                  │
//! └───────┴───────┴───────┴───────────────┴──────────────────┘
//! ```

use crate::error::PacketError;
use crate::{HEADER_SIZE, MAGIC, VERSION_MAJOR, VERSION_MINOR};

const OFFSET_VERSION: usize = 4;
const OFFSET_TYPE: usize = 6;
const OFFSET_LENGTH: usize = 8;

/// Payload type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PayloadType {
    /// Encapsulated IP frame for local delivery
    Raw = 0,
    /// An existing node is up
    NodeActivate = 1,
    /// Heartbeat emitted by the master
    HeartbeatMaster = 2,
    /// Heartbeat emitted by a follower
    HeartbeatNode = 3,
    /// Request to join a network
    JoinRequest = 4,
}

impl PayloadType {
    /// Wire code of this type
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Whether the payload is a control message rather than raw traffic
    pub fn is_control(self) -> bool {
        !matches!(self, Self::Raw)
    }
}

impl TryFrom<u16> for PayloadType {
    type Error = PacketError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Raw),
            1 => Ok(Self::NodeActivate),
            2 => Ok(Self::HeartbeatMaster),
            3 => Ok(Self::HeartbeatNode),
            4 => Ok(Self::JoinRequest),
            _ => Err(PacketError::UnknownType(value)),
        }
    }
}

/// Zero-copy read-only packet view
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    raw: &'a [u8],
    payload_type: PayloadType,
}

impl<'a> Packet<'a> {
    /// Place a new packet at the start of `buffer`.
    ///
    /// Writes magic, version and type; the length field is finalized by
    /// [`PacketMut::pack`].
    pub fn place(
        buffer: &'a mut [u8],
        payload_size: usize,
        payload_type: PayloadType,
    ) -> Result<PacketMut<'a>, PacketError> {
        let total = HEADER_SIZE + payload_size;
        if buffer.len() < total {
            return Err(PacketError::BufferTooSmall {
                required: total,
                available: buffer.len(),
            });
        }
        if u32::try_from(total).is_err() {
            return Err(PacketError::OversizeLimit {
                encoded: total,
                limit: u32::MAX as usize,
            });
        }

        let raw = &mut buffer[..total];
        raw[..OFFSET_VERSION].copy_from_slice(&MAGIC);
        raw[OFFSET_VERSION] = VERSION_MAJOR;
        raw[OFFSET_VERSION + 1] = VERSION_MINOR;
        raw[OFFSET_TYPE..OFFSET_LENGTH].copy_from_slice(&payload_type.code().to_be_bytes());
        raw[OFFSET_LENGTH..HEADER_SIZE].fill(0);

        Ok(PacketMut { raw, payload_type })
    }

    /// Build a complete packet into a fresh buffer
    pub fn encode(payload_type: PayloadType, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
        let mut buf = vec![0u8; HEADER_SIZE + payload.len()];
        let mut packet = Packet::place(&mut buf, payload.len(), payload_type)?;
        packet.payload_mut().copy_from_slice(payload);
        packet.pack();
        Ok(buf)
    }

    /// Parse a packet from raw bytes (zero-copy).
    ///
    /// `buf` must hold exactly one packet. Packets whose encoded length
    /// exceeds `size_limit` are rejected.
    pub fn unpack(buf: &'a [u8], size_limit: usize) -> Result<Self, PacketError> {
        if buf.len() < HEADER_SIZE {
            return Err(PacketError::TooShort {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }
        if buf[..OFFSET_VERSION] != MAGIC {
            return Err(PacketError::InvalidMagic);
        }

        let encoded = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        if encoded != buf.len() {
            return Err(PacketError::SizeMismatch {
                encoded,
                actual: buf.len(),
            });
        }
        if encoded > size_limit {
            return Err(PacketError::OversizeLimit {
                encoded,
                limit: size_limit,
            });
        }

        let payload_type =
            PayloadType::try_from(u16::from_be_bytes([buf[OFFSET_TYPE], buf[OFFSET_TYPE + 1]]))?;

        Ok(Self {
            raw: buf,
            payload_type,
        })
    }

    /// Get the payload type
    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    /// Get the (major, minor) version
    pub fn version(&self) -> (u8, u8) {
        (self.raw[OFFSET_VERSION], self.raw[OFFSET_VERSION + 1])
    }

    /// Get the payload slice (zero-copy)
    pub fn payload(&self) -> &'a [u8] {
        &self.raw[HEADER_SIZE..]
    }

    /// Total packet length, header included
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Always false: a parsed packet holds at least its header
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The whole packet as transmitted
    pub fn as_bytes(&self) -> &'a [u8] {
        self.raw
    }
}

/// Packet under construction
#[derive(Debug)]
pub struct PacketMut<'a> {
    raw: &'a mut [u8],
    payload_type: PayloadType,
}

impl<'a> PacketMut<'a> {
    /// Payload area to fill before packing
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.raw[HEADER_SIZE..]
    }

    /// Get the payload type
    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    /// Total packet length, header included
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Always false: a placed packet holds at least its header
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Finalize the length field and return the transmittable bytes
    pub fn pack(self) -> &'a [u8] {
        let total = self.raw.len() as u32;
        self.raw[OFFSET_LENGTH..HEADER_SIZE].copy_from_slice(&total.to_be_bytes());
        self.raw
    }
}
