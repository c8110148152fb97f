//! Routing and dispatch between the link and the ICMP carrier.
//!
//! Outbound: frames read from the link are routed by their IPv4
//! destination to the owning member. Inbound: raw packets go back out
//! through the link, control packets are applied to the cluster.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use overturn_core::{
    ActivateOutcome, ControlMessage, HeartbeatOutcome, JoinOutcome, JoinRequest, Message,
    NetworkCluster, NodeActivate, Packet, PayloadType,
};
use overturn_transport::{LinkSink, PacketCarrier};
use tracing::{debug, trace, warn};

/// IPv4 header length without options
const IPV4_HEADER_SIZE: usize = 20;

/// What happened to an outbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Encapsulated and sent to the owning member
    Sent {
        /// Member address the packet went to
        destination: Ipv4Addr,
        /// Bytes written by the carrier
        bytes: usize,
    },
    /// Not an IPv4 frame
    NotIpv4,
    /// Truncated IPv4 header
    Malformed,
    /// No member owns the destination
    NoRoute,
    /// The carrier rejected the packet
    SendFailed,
}

/// State changes caused by a control message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlEffect {
    /// Committed mutation that must be persisted
    pub persist: bool,
    /// Membership activity changed; the capture set may differ
    pub resync: bool,
}

impl ControlEffect {
    /// Nothing changed
    pub const NONE: Self = Self {
        persist: false,
        resync: false,
    };

    /// Combine two effects
    pub fn merge(self, other: Self) -> Self {
        Self {
            persist: self.persist || other.persist,
            resync: self.resync || other.resync,
        }
    }
}

/// What happened to an inbound packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Raw payload written to the link
    Delivered {
        /// Bytes written to the link
        bytes: usize,
    },
    /// Control message applied
    Control(ControlEffect),
    /// Undecodable or undeliverable
    Dropped,
}

/// Routing and dispatch over one cluster
pub struct Dataplane<C, L> {
    cluster: Arc<RwLock<NetworkCluster>>,
    carrier: Arc<C>,
    link: Arc<L>,
    next_queue: AtomicUsize,
}

impl<C: PacketCarrier, L: LinkSink> Dataplane<C, L> {
    /// Create a data plane over `cluster`
    pub fn new(cluster: Arc<RwLock<NetworkCluster>>, carrier: Arc<C>, link: Arc<L>) -> Self {
        Self {
            cluster,
            carrier,
            link,
            next_queue: AtomicUsize::new(0),
        }
    }

    /// Shared cluster state
    pub fn cluster(&self) -> &Arc<RwLock<NetworkCluster>> {
        &self.cluster
    }

    /// ICMP side carrier
    pub fn carrier(&self) -> &Arc<C> {
        &self.carrier
    }

    /// Link side sink
    pub fn link(&self) -> &Arc<L> {
        &self.link
    }

    /// Read access to the cluster
    pub fn read_cluster(&self) -> RwLockReadGuard<'_, NetworkCluster> {
        self.cluster.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_cluster(&self) -> RwLockWriteGuard<'_, NetworkCluster> {
        self.cluster.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route one frame read from the link
    pub fn route(&self, frame: &[u8]) -> RouteOutcome {
        let destination = match ipv4_destination(frame) {
            Ok(destination) => destination,
            Err(outcome) => {
                debug!(len = frame.len(), outcome = ?outcome, "Dropped non-routable frame");
                return outcome;
            }
        };

        if !self.read_cluster().routes_to(destination) {
            trace!(destination = %destination, "No route");
            return RouteOutcome::NoRoute;
        }

        let packet = match Packet::encode(PayloadType::Raw, frame) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(destination = %destination, error = %e, "Cannot encapsulate frame");
                return RouteOutcome::SendFailed;
            }
        };
        match self.carrier.send_packet(&packet, destination) {
            Ok(bytes) => RouteOutcome::Sent { destination, bytes },
            Err(e) => {
                debug!(destination = %destination, error = %e, "Send failed");
                RouteOutcome::SendFailed
            }
        }
    }

    /// Dispatch one packet received from `source`
    pub fn dispatch(&self, packet: Packet<'_>, source: Ipv4Addr) -> DispatchOutcome {
        self.dispatch_at(packet, source, Instant::now(), unix_now())
    }

    /// [`Dataplane::dispatch`] with explicit clocks
    pub fn dispatch_at(
        &self,
        packet: Packet<'_>,
        source: Ipv4Addr,
        now: Instant,
        now_unix: u64,
    ) -> DispatchOutcome {
        if packet.payload_type() == PayloadType::Raw {
            let queue = self.next_queue.fetch_add(1, Ordering::Relaxed);
            return match self.link.write_frame(packet.payload(), queue) {
                Ok(bytes) => DispatchOutcome::Delivered { bytes },
                Err(e) => {
                    debug!(source = %source, error = %e, "Link write failed");
                    DispatchOutcome::Dropped
                }
            };
        }

        match ControlMessage::from_packet(&packet) {
            Ok(message) => {
                DispatchOutcome::Control(self.apply_control(&message, source, now, now_unix))
            }
            Err(e) => {
                debug!(source = %source, error = %e, "Dropped malformed control message");
                DispatchOutcome::Dropped
            }
        }
    }

    /// Apply a decoded control message
    pub fn apply_control(
        &self,
        message: &ControlMessage,
        source: Ipv4Addr,
        now: Instant,
        now_unix: u64,
    ) -> ControlEffect {
        let mut cluster = self.write_cluster();
        match message {
            ControlMessage::Heartbeat(heartbeat) => {
                match cluster.apply_heartbeat(heartbeat, source, now) {
                    HeartbeatOutcome::Committed { .. } => ControlEffect {
                        persist: true,
                        resync: true,
                    },
                    HeartbeatOutcome::Refreshed { activated } => ControlEffect {
                        persist: false,
                        resync: activated,
                    },
                    _ => ControlEffect::NONE,
                }
            }
            ControlMessage::JoinRequest(request) => {
                match cluster.apply_join_request(request, source, now_unix, now) {
                    JoinOutcome::Authorized => {}
                    outcome => debug!(source = %source, outcome = ?outcome, "Join not granted"),
                }
                ControlEffect::NONE
            }
            ControlMessage::NodeActivate(activate) => {
                match cluster.apply_node_activate(activate, source, now) {
                    ActivateOutcome::Added { .. } => ControlEffect {
                        persist: true,
                        resync: true,
                    },
                    ActivateOutcome::Activated { changed, .. } => ControlEffect {
                        persist: false,
                        resync: changed,
                    },
                    ActivateOutcome::Unauthorized => ControlEffect::NONE,
                }
            }
        }
    }

    /// One heartbeat period: master timeout check, heartbeat emission, and
    /// announcement while no live master is known.
    pub fn heartbeat_tick(&self, now: Instant) -> ControlEffect {
        let timed_out = self.write_cluster().check_master_timeout(now);

        let (heartbeat, targets, announce) = {
            let cluster = self.read_cluster();
            let announce = !cluster.is_master() && !cluster.master().is_some_and(|m| m.is_active());
            (cluster.local_heartbeat(), cluster.heartbeat_targets(), announce)
        };

        match heartbeat.to_packet() {
            Ok(packet) => self.send_all(&packet, &targets),
            Err(e) => warn!(error = %e, "Cannot encode heartbeat"),
        }
        if announce {
            self.announce_to(&targets);
        }

        ControlEffect {
            persist: false,
            resync: timed_out,
        }
    }

    /// Ask the other members to admit and activate this node
    pub fn announce(&self) {
        let targets = self.read_cluster().heartbeat_targets();
        self.announce_to(&targets);
    }

    fn announce_to(&self, targets: &[Ipv4Addr]) {
        let (join, activate) = {
            let cluster = self.read_cluster();
            let join = cluster
                .token()
                .map(|token| JoinRequest::new(cluster.net_name(), token));
            (join, NodeActivate::new(cluster.self_node().id()))
        };

        if let Some(join) = join {
            match join.to_packet() {
                Ok(packet) => self.send_all(&packet, targets),
                Err(e) => warn!(error = %e, "Cannot encode join request"),
            }
        }
        match activate.to_packet() {
            Ok(packet) => self.send_all(&packet, targets),
            Err(e) => warn!(error = %e, "Cannot encode node activation"),
        }
    }

    fn send_all(&self, packet: &[u8], targets: &[Ipv4Addr]) {
        for &target in targets {
            if let Err(e) = self.carrier.send_packet(packet, target) {
                debug!(target = %target, error = %e, "Control send failed");
            }
        }
    }
}

/// Destination of an IPv4 frame
fn ipv4_destination(frame: &[u8]) -> Result<Ipv4Addr, RouteOutcome> {
    let first = *frame.first().ok_or(RouteOutcome::NotIpv4)?;
    if first >> 4 != 4 {
        return Err(RouteOutcome::NotIpv4);
    }
    if frame.len() < IPV4_HEADER_SIZE || usize::from(first & 0x0f) * 4 < IPV4_HEADER_SIZE {
        return Err(RouteOutcome::Malformed);
    }
    Ok(Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]))
}

/// Current UNIX time in seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
