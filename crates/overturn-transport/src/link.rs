//! Multi-queue TUN link.
//!
//! The interface is created through `/dev/net/tun` with one file descriptor
//! per queue. It is not persistent: the kernel removes it once the last
//! queue descriptor is closed.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use socket2::{Domain, Socket, Type};
use tracing::{debug, info, trace, warn};

use crate::POLL_INTERVAL;
use crate::transport::{LinkSink, TrafficCounters, TransportError, TransportResult};
use crate::worker::{ErrorBackoff, WorkerContext, WorkerGroup};

const TUN_DEVICE: &str = "/dev/net/tun";

const TUNSETIFF: u64 = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFF_MULTI_QUEUE: libc::c_short = 0x0100;

/// Longest interface name the kernel accepts
pub const LINK_NAME_MAX: usize = libc::IFNAMSIZ - 1;

/// Fallback MTU when the interface cannot be queried
pub const DEFAULT_LINK_MTU: usize = 1500;

#[repr(C)]
#[derive(Clone, Copy)]
union IfReqData {
    flags: libc::c_short,
    mtu: libc::c_int,
    _pad: [u8; 24],
}

#[repr(C)]
struct IfReq {
    name: [u8; libc::IFNAMSIZ],
    data: IfReqData,
}

impl IfReq {
    fn new(name: &str) -> Self {
        let mut req = Self {
            name: [0; libc::IFNAMSIZ],
            data: IfReqData { _pad: [0; 24] },
        };
        let len = name.len().min(LINK_NAME_MAX);
        req.name[..len].copy_from_slice(&name.as_bytes()[..len]);
        req
    }
}

fn ioctl(fd: RawFd, request: u64, req: &mut IfReq) -> io::Result<()> {
    // SAFETY: `req` is a valid, exclusively borrowed ifreq for the whole call.
    let rc = unsafe { libc::ioctl(fd, request as _, req as *mut IfReq) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn control_socket() -> io::Result<Socket> {
    Socket::new(Domain::IPV4, Type::DGRAM, None)
}

fn query_mtu(control: &Socket, name: &str) -> io::Result<usize> {
    let mut req = IfReq::new(name);
    ioctl(control.as_raw_fd(), libc::SIOCGIFMTU as u64, &mut req)?;
    // SAFETY: SIOCGIFMTU fills the `mtu` member.
    let mtu = unsafe { req.data.mtu };
    Ok(usize::try_from(mtu).unwrap_or(DEFAULT_LINK_MTU))
}

fn wait_readable(fd: RawFd) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout = POLL_INTERVAL.as_millis() as libc::c_int;
    // SAFETY: `pollfd` is a single valid element for the duration of the call.
    let rc = unsafe { libc::poll(&mut pollfd, 1, timeout) };
    match rc {
        0 => Ok(false),
        rc if rc < 0 => Err(io::Error::last_os_error()),
        _ if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 => Err(
            io::Error::new(io::ErrorKind::BrokenPipe, "queue descriptor closed"),
        ),
        _ => Ok(true),
    }
}

/// Whether a network interface named `name` exists
pub fn link_exists(name: &str) -> bool {
    let Ok(name) = CString::new(name) else {
        return false;
    };
    // SAFETY: `name` is a valid NUL-terminated string.
    unsafe { libc::if_nametoindex(name.as_ptr()) != 0 }
}

/// First name `prefix0`, `prefix1`, ... below `limit` for which `exists` is false
pub fn first_free_name(prefix: &str, limit: usize, exists: impl Fn(&str) -> bool) -> Option<String> {
    (0..limit)
        .map(|n| format!("{prefix}{n}"))
        .find(|name| !exists(name))
}

type QueueSlot = Arc<RwLock<Vec<Arc<File>>>>;

/// TUN interface with parallel queues
pub struct LinkTransport {
    name: String,
    queues: QueueSlot,
    queue_count: usize,
    next_queue: AtomicUsize,
    counters: Arc<TrafficCounters>,
    workers: WorkerGroup,
}

impl LinkTransport {
    /// Queue count used when none is configured
    pub fn default_queue_count() -> usize {
        num_cpus::get()
    }

    /// Create interface `name` with `queue_count` queues.
    ///
    /// Requires `CAP_NET_ADMIN`.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidConfig` for an empty or overlong name
    /// or zero queues, and `TransportError::LinkCreate` if the name is taken
    /// or the device cannot be created
    pub fn create(name: &str, queue_count: usize) -> TransportResult<Self> {
        if name.is_empty() || name.len() > LINK_NAME_MAX {
            return Err(TransportError::InvalidConfig(format!(
                "link name must be 1 to {LINK_NAME_MAX} bytes: {name:?}"
            )));
        }
        if queue_count == 0 {
            return Err(TransportError::InvalidConfig(
                "link needs at least one queue".to_string(),
            ));
        }
        let link_error = |source: io::Error| TransportError::LinkCreate {
            name: name.to_string(),
            source,
        };
        if link_exists(name) {
            return Err(link_error(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "interface name already in use",
            )));
        }

        let mut flags = IFF_TUN | IFF_NO_PI;
        if queue_count > 1 {
            flags |= IFF_MULTI_QUEUE;
        }

        let mut queues = Vec::with_capacity(queue_count);
        for _ in 0..queue_count {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(TUN_DEVICE)
                .map_err(link_error)?;
            let mut req = IfReq::new(name);
            req.data.flags = flags;
            ioctl(file.as_raw_fd(), TUNSETIFF, &mut req).map_err(link_error)?;
            queues.push(Arc::new(file));
        }

        info!(link = name, queues = queue_count, "Link created");

        Ok(Self {
            name: name.to_string(),
            queues: Arc::new(RwLock::new(queues)),
            queue_count,
            next_queue: AtomicUsize::new(0),
            counters: Arc::new(TrafficCounters::new()),
            workers: WorkerGroup::new(name),
        })
    }

    /// Interface name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of queues
    pub fn queue_count(&self) -> usize {
        self.queue_count
    }

    /// Register one receive worker on the next queue in round-robin order.
    ///
    /// # Errors
    /// Returns `TransportError::Io` if the worker thread cannot be spawned
    pub fn register_handler<F>(&self, handler: F) -> TransportResult<()>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.register_shared(Arc::new(handler))
    }

    /// Register one receive worker on every queue, sharing `handler`.
    ///
    /// # Errors
    /// Returns `TransportError::Io` if a worker thread cannot be spawned
    pub fn register_per_queue<F>(&self, handler: F) -> TransportResult<()>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let handler: Arc<dyn Fn(&[u8]) + Send + Sync> = Arc::new(handler);
        for _ in 0..self.queue_count {
            self.register_shared(Arc::clone(&handler))?;
        }
        Ok(())
    }

    fn register_shared(&self, handler: Arc<dyn Fn(&[u8]) + Send + Sync>) -> TransportResult<()> {
        let queue = self.next_queue.fetch_add(1, Ordering::Relaxed) % self.queue_count;
        let slot = Arc::clone(&self.queues);
        let counters = Arc::clone(&self.counters);
        let name = self.name.clone();

        self.workers.register(Arc::new(move |ctx: &WorkerContext| {
            let file = slot
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(queue)
                .cloned();
            let Some(file) = file else {
                return;
            };
            let control = match control_socket() {
                Ok(control) => control,
                Err(e) => {
                    warn!(link = %name, queue, error = %e, "Cannot open control socket");
                    return;
                }
            };
            receive_loop(ctx, &name, queue, &file, &control, &counters, handler.as_ref());
        }))
    }

    /// Write one frame to queue `queue mod queue_count`
    ///
    /// # Errors
    /// Returns `TransportError::Closed` after close, or `TransportError::Io`
    /// if the write fails
    pub fn write(&self, frame: &[u8], queue: usize) -> TransportResult<usize> {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        if queues.is_empty() {
            return Err(TransportError::Closed);
        }
        let mut file: &File = &queues[queue % queues.len()];
        let written = file.write(frame)?;
        self.counters.record_wx(written);
        trace!(link = %self.name, queue, bytes = written, "Frame delivered");
        Ok(written)
    }

    /// Current interface MTU
    ///
    /// # Errors
    /// Returns `TransportError::Io` if the interface cannot be queried
    pub fn mtu(&self) -> TransportResult<usize> {
        let control = control_socket()?;
        Ok(query_mtu(&control, &self.name)?)
    }

    /// Change the interface MTU
    ///
    /// # Errors
    /// Returns `TransportError::InvalidConfig` for an out-of-range value, or
    /// `TransportError::Io` if the change is refused
    pub fn set_mtu(&self, mtu: usize) -> TransportResult<()> {
        let value = libc::c_int::try_from(mtu)
            .map_err(|_| TransportError::InvalidConfig(format!("MTU out of range: {mtu}")))?;
        let control = control_socket()?;
        let mut req = IfReq::new(&self.name);
        req.data.mtu = value;
        ioctl(control.as_raw_fd(), libc::SIOCSIFMTU as u64, &mut req)?;
        info!(link = %self.name, mtu, "Link MTU changed");
        Ok(())
    }

    /// Bring the interface up
    ///
    /// # Errors
    /// Returns `TransportError::Io` if the flags cannot be changed
    pub fn up(&self) -> TransportResult<()> {
        self.update_flags(|flags| flags | libc::IFF_UP as libc::c_short)
    }

    /// Bring the interface down
    ///
    /// # Errors
    /// Returns `TransportError::Io` if the flags cannot be changed
    pub fn down(&self) -> TransportResult<()> {
        self.update_flags(|flags| flags & !(libc::IFF_UP as libc::c_short))
    }

    fn update_flags(&self, update: impl Fn(libc::c_short) -> libc::c_short) -> TransportResult<()> {
        let control = control_socket()?;
        let mut req = IfReq::new(&self.name);
        ioctl(control.as_raw_fd(), libc::SIOCGIFFLAGS as u64, &mut req)?;
        // SAFETY: SIOCGIFFLAGS fills the `flags` member.
        let flags = unsafe { req.data.flags };
        req.data.flags = update(flags);
        ioctl(control.as_raw_fd(), libc::SIOCSIFFLAGS as u64, &mut req)?;
        Ok(())
    }

    /// Bring the interface up and start every registered worker
    ///
    /// # Errors
    /// Returns `TransportError::AlreadyRunning` if running,
    /// `TransportError::Closed` after close, or the error of bringing the
    /// interface up
    pub fn start(&self) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.workers.is_running() {
            return Err(TransportError::AlreadyRunning);
        }
        self.up()?;
        self.workers.start()
    }

    /// Stop every worker, then bring the interface down
    ///
    /// # Errors
    /// Returns `TransportError::NotRunning` if not running
    pub fn stop(&self) -> TransportResult<()> {
        self.workers.stop()?;
        if let Err(e) = self.down() {
            debug!(link = %self.name, error = %e, "Cannot bring link down");
        }
        Ok(())
    }

    /// Stop if running, drop handlers and close every queue, removing the
    /// interface.
    pub fn close(&self) {
        if self.workers.is_running() {
            let _ = self.stop();
        }
        self.workers.clear();
        let closed: Vec<_> = self
            .queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if !closed.is_empty() {
            info!(link = %self.name, "Link removed");
        }
    }

    /// Whether close has been called
    pub fn is_closed(&self) -> bool {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Whether workers are running
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

impl LinkSink for LinkTransport {
    fn write_frame(&self, frame: &[u8], queue: usize) -> TransportResult<usize> {
        self.write(frame, queue)
    }

    fn queue_count(&self) -> usize {
        self.queue_count
    }
}

impl Drop for LinkTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn receive_loop(
    ctx: &WorkerContext,
    name: &str,
    queue: usize,
    file: &File,
    control: &Socket,
    counters: &TrafficCounters,
    handler: &(dyn Fn(&[u8]) + Send + Sync),
) {
    let fd = file.as_raw_fd();
    let mut mtu = query_mtu(control, name).unwrap_or(DEFAULT_LINK_MTU);
    let mut buf = vec![0u8; mtu + 4];
    let mut reader = file;
    let mut backoff = ErrorBackoff::new();

    while ctx.is_running() {
        if let Ok(current) = query_mtu(control, name) {
            if current != mtu {
                debug!(link = name, queue, old = mtu, new = current, "MTU changed");
                mtu = current;
                buf = vec![0u8; mtu + 4];
            }
        }

        match wait_readable(fd) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(link = name, queue, error = %e, "Queue poll failed");
                break;
            }
        }

        match reader.read(&mut buf) {
            Ok(0) => continue,
            Ok(size) => {
                let failures = backoff.reset();
                if failures > 0 {
                    debug!(link = name, queue, failures, "Link read recovered");
                }
                counters.record_rx(size);
                handler(&buf[..size]);
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
            Err(e) => {
                let (delay, log) = backoff.failure();
                if log {
                    warn!(link = name, queue, failures = backoff.failures(), error = %e, "Error reading from link");
                }
                std::thread::sleep(delay);
            }
        }
    }
}
