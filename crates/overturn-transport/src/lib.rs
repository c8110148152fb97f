//! # Overturn Transport
//!
//! Transport layer for the Overturn overlay network.
//!
//! This crate provides:
//! - A raw ICMP carrier that moves tunnel packets between nodes
//! - A multi-queue TUN link that exchanges IP frames with the kernel
//! - A worker lifecycle shared by both (start, stop, drain)
//! - Atomic traffic counters
//!
//! Both carriers run one OS thread per registered handler. Reads are bounded
//! by a one second timeout so that `stop()` is observed within one poll
//! interval.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod icmp;
pub mod icmp_transport;
#[cfg(target_os = "linux")]
pub mod link;
pub mod transport;
pub mod worker;

pub use icmp::IcmpType;
pub use icmp_transport::IcmpTransport;
#[cfg(target_os = "linux")]
pub use link::LinkTransport;
pub use transport::{
    LinkSink, PacketCarrier, TrafficCounters, TransportError, TransportResult, TransportStats,
};
pub use worker::{ErrorBackoff, WorkerContext, WorkerGroup, WorkerState};

use std::time::Duration;

/// Read timeout of every worker loop
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
