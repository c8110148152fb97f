//! ICMP echo framing.
//!
//! ```text
//!  0      1      2          4            6            8
//! ┌──────┬──────┬──────────┬────────────┬────────────┬───────────────┐
//! │ type │ code │ checksum │ identifier │ sequence   │ tunnel packet │
//! └──────┴──────┴──────────┴────────────┴────────────┴───────────────┘
//! ```
//!
//! Datagrams read from a raw IPv4 socket still carry the IP header, which
//! [`strip_ipv4_header`] removes.

use std::net::Ipv4Addr;

/// ICMP header size in bytes
pub const ICMP_HEADER_SIZE: usize = 8;

/// Minimum IPv4 header size in bytes
pub const IPV4_MIN_HEADER_SIZE: usize = 20;

/// Echo message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IcmpType {
    /// Echo reply (type 0)
    #[default]
    EchoReply,
    /// Echo request (type 8)
    Echo,
}

impl IcmpType {
    /// Wire value
    pub fn code(self) -> u8 {
        match self {
            Self::EchoReply => 0,
            Self::Echo => 8,
        }
    }

    /// Parse a wire value; only echo and echo reply are accepted
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::EchoReply),
            8 => Some(Self::Echo),
            _ => None,
        }
    }
}

impl std::str::FromStr for IcmpType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "echo-reply" => Ok(Self::EchoReply),
            "echo" => Ok(Self::Echo),
            other => Err(format!("unknown ICMP type: {other}")),
        }
    }
}

/// Internet checksum (RFC 1071) over `data`
pub fn checksum(data: &[u8]) -> u16 {
    let mut chunks = data.chunks_exact(2);
    let mut sum: u32 = chunks
        .by_ref()
        .map(|pair| u32::from(u16::from_be_bytes([pair[0], pair[1]])))
        .sum();
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Whether an ICMP message carries a correct checksum
pub fn verify_checksum(message: &[u8]) -> bool {
    checksum(message) == 0
}

/// Build an echo message around `payload` with a correct checksum
pub fn encapsulate(icmp_type: IcmpType, identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(ICMP_HEADER_SIZE + payload.len());
    message.push(icmp_type.code());
    message.push(0);
    message.extend_from_slice(&[0, 0]);
    message.extend_from_slice(&identifier.to_be_bytes());
    message.extend_from_slice(&sequence.to_be_bytes());
    message.extend_from_slice(payload);

    let sum = checksum(&message);
    message[2..4].copy_from_slice(&sum.to_be_bytes());
    message
}

/// Parsed echo header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoHeader {
    /// Echo or echo reply
    pub icmp_type: IcmpType,
    /// Identifier
    pub identifier: u16,
    /// Sequence number
    pub sequence: u16,
}

/// Split an ICMP message into its echo header and data.
///
/// Returns `None` for truncated messages, types other than echo and echo
/// reply, and non-zero codes.
pub fn parse_echo(message: &[u8]) -> Option<(EchoHeader, &[u8])> {
    if message.len() < ICMP_HEADER_SIZE {
        return None;
    }
    let icmp_type = IcmpType::from_code(message[0])?;
    if message[1] != 0 {
        return None;
    }
    let header = EchoHeader {
        icmp_type,
        identifier: u16::from_be_bytes([message[4], message[5]]),
        sequence: u16::from_be_bytes([message[6], message[7]]),
    };
    Some((header, &message[ICMP_HEADER_SIZE..]))
}

/// Strip the IPv4 header of a raw-socket datagram.
///
/// Returns the source address and the ICMP message.
pub fn strip_ipv4_header(datagram: &[u8]) -> Option<(Ipv4Addr, &[u8])> {
    let first = *datagram.first()?;
    if first >> 4 != 4 {
        return None;
    }
    let header_len = usize::from(first & 0x0f) * 4;
    if header_len < IPV4_MIN_HEADER_SIZE || datagram.len() < header_len {
        return None;
    }
    let source = Ipv4Addr::new(datagram[12], datagram[13], datagram[14], datagram[15]);
    Some((source, &datagram[header_len..]))
}
