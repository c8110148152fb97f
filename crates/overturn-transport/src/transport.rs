//! Carrier abstractions shared by the ICMP and link transports.
//!
//! The data plane talks to both transports through [`PacketCarrier`] and
//! [`LinkSink`], so routing and dispatch can be exercised without raw
//! sockets or a TUN device.

use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Stop requested while not running
    #[error("Not running")]
    NotRunning,

    /// Start requested while already running
    #[error("Already running")]
    AlreadyRunning,

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Socket creation or binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Virtual interface creation failed
    #[error("Cannot create link {name}: {source}")]
    LinkCreate {
        /// Requested interface name
        name: String,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Sends tunnel packets to a remote node.
pub trait PacketCarrier: Send + Sync {
    /// Send one complete tunnel packet to `destination`.
    ///
    /// # Returns
    /// The number of bytes written on the wire
    ///
    /// # Errors
    /// Returns `TransportError` if the carrier is closed or the send fails
    fn send_packet(&self, packet: &[u8], destination: Ipv4Addr) -> TransportResult<usize>;
}

/// Delivers IP frames to the local kernel.
pub trait LinkSink: Send + Sync {
    /// Write one frame to queue `queue mod queue_count()`.
    ///
    /// # Errors
    /// Returns `TransportError` if the link is closed or the write fails
    fn write_frame(&self, frame: &[u8], queue: usize) -> TransportResult<usize>;

    /// Number of parallel queues
    fn queue_count(&self) -> usize;
}

/// Accumulate-only traffic counters
#[derive(Debug, Default)]
pub struct TrafficCounters {
    rx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    wx_bytes: AtomicU64,
    wx_packets: AtomicU64,
}

impl TrafficCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a received frame
    pub fn record_rx(&self, bytes: usize) {
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a written frame
    pub fn record_wx(&self, bytes: usize) {
        self.wx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.wx_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Total bytes received
    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    /// Total bytes written
    pub fn wx_bytes(&self) -> u64 {
        self.wx_bytes.load(Ordering::Relaxed)
    }

    /// Reset the receive counters, returning the previous byte count
    pub fn rx_clear(&self) -> u64 {
        self.rx_packets.swap(0, Ordering::Relaxed);
        self.rx_bytes.swap(0, Ordering::Relaxed)
    }

    /// Reset the write counters, returning the previous byte count
    pub fn wx_clear(&self) -> u64 {
        self.wx_packets.swap(0, Ordering::Relaxed);
        self.wx_bytes.swap(0, Ordering::Relaxed)
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.wx_bytes(),
            bytes_received: self.rx_bytes(),
            packets_sent: self.wx_packets.load(Ordering::Relaxed),
            packets_received: self.rx_packets.load(Ordering::Relaxed),
        }
    }
}

/// Transport statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
}
