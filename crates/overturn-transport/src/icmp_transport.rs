//! Raw ICMP carrier.
//!
//! Tunnel packets travel as the data of ICMP echo (or echo reply) messages
//! over one raw IPv4 socket. Every registered handler gets its own receive
//! worker reading from that socket.

use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, PoisonError, RwLock};

use overturn_core::{DEFAULT_SIZE_LIMIT, MAGIC, Packet};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info, trace, warn};

use crate::POLL_INTERVAL;
use crate::icmp::{self, IcmpType};
use crate::transport::{PacketCarrier, TrafficCounters, TransportError, TransportResult};
use crate::worker::{ErrorBackoff, WorkerContext, WorkerGroup};

/// Tunnel MTU: 1500 minus IP (20), ICMP (8) and tunnel header slack (8)
pub const DEFAULT_MTU: usize = 1464;

/// Size of the per-worker receive buffer
pub const RECV_BUFFER_SIZE: usize = 65536;

type SocketSlot = Arc<RwLock<Option<Arc<Socket>>>>;

/// Raw ICMP transport
pub struct IcmpTransport {
    socket: SocketSlot,
    bind_address: Ipv4Addr,
    icmp_type: IcmpType,
    size_limit: usize,
    mtu: usize,
    counters: Arc<TrafficCounters>,
    workers: WorkerGroup,
}

impl IcmpTransport {
    /// Open a raw ICMP socket bound to `bind_address`.
    ///
    /// Requires `CAP_NET_RAW`.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the socket cannot be created
    /// or bound
    pub fn open(bind_address: Ipv4Addr, icmp_type: IcmpType) -> TransportResult<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
            .map_err(|e| TransportError::BindFailed(format!("raw ICMP socket: {e}")))?;
        socket
            .set_read_timeout(Some(POLL_INTERVAL))
            .map_err(|e| TransportError::BindFailed(format!("read timeout: {e}")))?;
        socket
            .bind(&SocketAddrV4::new(bind_address, 0).into())
            .map_err(|e| TransportError::BindFailed(format!("{bind_address}: {e}")))?;

        info!(address = %bind_address, icmp_type = ?icmp_type, "ICMP transport opened");

        Ok(Self {
            socket: Arc::new(RwLock::new(Some(Arc::new(socket)))),
            bind_address,
            icmp_type,
            size_limit: DEFAULT_SIZE_LIMIT,
            mtu: DEFAULT_MTU,
            counters: Arc::new(TrafficCounters::new()),
            workers: WorkerGroup::new("icmp"),
        })
    }

    /// Limit the encoded size of accepted packets
    pub fn with_size_limit(mut self, size_limit: usize) -> Self {
        self.size_limit = size_limit;
        self
    }

    /// Local address the socket is bound to
    pub fn bind_address(&self) -> Ipv4Addr {
        self.bind_address
    }

    /// Largest frame the carrier is expected to move
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Register a receive handler.
    ///
    /// The handler receives every decoded tunnel packet together with the
    /// IPv4 source of the datagram. Undecodable frames are logged and
    /// dropped.
    ///
    /// # Errors
    /// Returns `TransportError::Io` if the worker thread cannot be spawned
    pub fn register_handler<F>(&self, handler: F) -> TransportResult<()>
    where
        F: Fn(Packet<'_>, Ipv4Addr) + Send + Sync + 'static,
    {
        let slot = Arc::clone(&self.socket);
        let counters = Arc::clone(&self.counters);
        let size_limit = self.size_limit;

        self.workers.register(Arc::new(move |ctx: &WorkerContext| {
            let socket = slot
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let Some(socket) = socket else {
                return;
            };
            receive_loop(ctx, &socket, &counters, size_limit, &handler);
        }))
    }

    /// Send `packet` to `destination` inside an ICMP echo message
    ///
    /// # Errors
    /// Returns `TransportError::Closed` after destroy, or
    /// `TransportError::Io` if the send fails
    pub fn write(&self, packet: &[u8], destination: Ipv4Addr) -> TransportResult<usize> {
        let guard = self.socket.read().unwrap_or_else(PoisonError::into_inner);
        let socket = guard.as_ref().ok_or(TransportError::Closed)?;

        let message = icmp::encapsulate(self.icmp_type, rand::random(), rand::random(), packet);
        let written = socket.send_to(&message, &SockAddr::from(SocketAddrV4::new(destination, 0)))?;
        self.counters.record_wx(written);
        trace!(destination = %destination, bytes = written, "ICMP frame sent");
        Ok(written)
    }

    /// Start every registered receive worker
    ///
    /// # Errors
    /// Returns `TransportError::AlreadyRunning` if running, or
    /// `TransportError::Closed` after destroy
    pub fn start(&self) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.workers.start()
    }

    /// Stop and wait for every receive worker
    ///
    /// # Errors
    /// Returns `TransportError::NotRunning` if not running
    pub fn stop(&self) -> TransportResult<()> {
        self.workers.stop()
    }

    /// Stop if running, drop handlers, then close the socket.
    pub fn destroy(&self) {
        if self.workers.is_running() {
            let _ = self.workers.stop();
        }
        self.workers.clear();
        let socket = self
            .socket
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if socket.is_some() {
            info!(address = %self.bind_address, "ICMP transport closed");
        }
    }

    /// Whether destroy has been called
    pub fn is_closed(&self) -> bool {
        self.socket
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Whether receive workers are running
    pub fn is_running(&self) -> bool {
        self.workers.is_running()
    }

    /// Live receive workers
    pub fn worker_count(&self) -> usize {
        self.workers.worker_count()
    }

    /// Traffic counters
    pub fn counters(&self) -> &TrafficCounters {
        &self.counters
    }

    /// Total bytes received
    pub fn rx_bytes(&self) -> u64 {
        self.counters.rx_bytes()
    }

    /// Total bytes written
    pub fn wx_bytes(&self) -> u64 {
        self.counters.wx_bytes()
    }

    /// Reset the receive counter
    pub fn rx_clear(&self) -> u64 {
        self.counters.rx_clear()
    }

    /// Reset the write counter
    pub fn wx_clear(&self) -> u64 {
        self.counters.wx_clear()
    }
}

impl PacketCarrier for IcmpTransport {
    fn send_packet(&self, packet: &[u8], destination: Ipv4Addr) -> TransportResult<usize> {
        self.write(packet, destination)
    }
}

impl Drop for IcmpTransport {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn receive_loop<F>(
    ctx: &WorkerContext,
    socket: &Socket,
    counters: &TrafficCounters,
    size_limit: usize,
    handler: &F,
) where
    F: Fn(Packet<'_>, Ipv4Addr),
{
    let mut buf = vec![MaybeUninit::<u8>::uninit(); RECV_BUFFER_SIZE];
    let mut backoff = ErrorBackoff::new();

    while ctx.is_running() {
        let size = match socket.recv(&mut buf) {
            Ok(size) => size,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let (delay, log) = backoff.failure();
                if log {
                    warn!(worker = ctx.id(), failures = backoff.failures(), error = %e, "ICMP receive failed");
                }
                std::thread::sleep(delay);
                continue;
            }
        };
        let failures = backoff.reset();
        if failures > 0 {
            debug!(worker = ctx.id(), failures, "ICMP receive recovered");
        }

        // SAFETY: recv initialised the first `size` bytes of `buf`.
        let datagram = unsafe { std::slice::from_raw_parts(buf.as_ptr().cast::<u8>(), size) };

        let Some((source, message)) = icmp::strip_ipv4_header(datagram) else {
            continue;
        };
        let Some((_, data)) = icmp::parse_echo(message) else {
            continue;
        };
        if !icmp::verify_checksum(message) {
            trace!(source = %source, "Bad ICMP checksum");
            continue;
        }
        counters.record_rx(size);

        match Packet::unpack(data, size_limit) {
            Ok(packet) => handler(packet, source),
            Err(e) if data.starts_with(&MAGIC) => {
                debug!(source = %source, error = %e, "Dropped malformed tunnel frame");
            }
            // Ordinary ping traffic
            Err(_) => {}
        }
    }
}
