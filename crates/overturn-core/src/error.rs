//! Error types for the Overturn core protocol.

use thiserror::Error;

/// Packet-level errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Buffer too short to hold a packet header
    #[error("packet too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Magic tag does not match
    #[error("not an overturn packet: invalid magic")]
    InvalidMagic,

    /// Encoded length disagrees with the buffer length
    #[error("payload size unmatched (buffered: {actual}, encoded: {encoded})")]
    SizeMismatch {
        /// Length field value
        encoded: usize,
        /// Actual buffer length
        actual: usize,
    },

    /// Encoded length exceeds the caller's limit
    #[error("packet size {encoded} exceeds limit {limit}")]
    OversizeLimit {
        /// Length field value
        encoded: usize,
        /// Configured limit
        limit: usize,
    },

    /// Payload type code is not defined
    #[error("unknown payload type: {0}")]
    UnknownType(u16),

    /// Destination buffer cannot hold header plus payload
    #[error("buffer too small: required {required}, available {available}")]
    BufferTooSmall {
        /// Bytes required
        required: usize,
        /// Bytes available
        available: usize,
    },
}

/// Control message format errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    /// Heartbeat payload has the wrong size
    #[error("not a valid heartbeat message: expected {expected} bytes, got {actual}")]
    InvalidHeartbeat {
        /// Fixed message size
        expected: usize,
        /// Payload size
        actual: usize,
    },

    /// Join request payload has the wrong size
    #[error("not a valid join request message: expected {expected} bytes, got {actual}")]
    InvalidJoinRequest {
        /// Fixed message size
        expected: usize,
        /// Payload size
        actual: usize,
    },

    /// Node activate payload has the wrong size
    #[error("not a valid node activate message: expected {expected} bytes, got {actual}")]
    InvalidNodeActivate {
        /// Fixed message size
        expected: usize,
        /// Payload size
        actual: usize,
    },

    /// Packet type carries no control message
    #[error("payload type {0} is not a control message")]
    NotControl(u16),

    /// Packet type carries a different message
    #[error("payload type {0} does not carry this message")]
    UnexpectedType(u16),
}

/// Cluster configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    /// Node identifier cannot be parsed as a UUID
    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    /// Machine identifier cannot be parsed as a UUID
    #[error("invalid machine id: {0}")]
    InvalidMachineId(String),

    /// No network selected or the selected network is missing
    #[error("no active network: {0}")]
    NoActiveNetwork(String),
}
