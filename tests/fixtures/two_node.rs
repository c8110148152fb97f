//! Two-node test fixture for integration testing
//!
//! Two data planes joined by an in-memory wire: packets a node sends to the
//! other node's address are queued until [`TwoNodeFixture::pump`] delivers
//! them, with the sender's address as the datagram source.
//!
//! # Example
//!
//! ```no_run
//! use overturn_integration_tests::fixtures::two_node::{TwoNodeFixture, ipv4_frame};
//!
//! let fixture = TwoNodeFixture::new();
//! fixture.a.dataplane.route(&ipv4_frame(fixture.a.ip, fixture.b.ip, 100));
//! fixture.pump();
//! assert_eq!(fixture.b.link.delivered().len(), 1);
//! ```

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, RwLock};

use overturn_core::{DEFAULT_SIZE_LIMIT, NetworkCluster, NetworkConfig, NodeConfig, Packet};
use overturn_daemon::dataplane::{Dataplane, DispatchOutcome};
use overturn_transport::{LinkSink, PacketCarrier, TrafficCounters, TransportResult};
use uuid::Uuid;

/// Node A identifier
pub const NODE_A: &str = "6f1c2d2e-2b8a-4c51-9a43-0a1d3c6c0001";
/// Node B identifier
pub const NODE_B: &str = "6f1c2d2e-2b8a-4c51-9a43-0a1d3c6c0002";
/// Membership token shared by both nodes
pub const TOKEN: &str = "a3b4c5d6-0000-4000-8000-000000000042";
/// Node A address
pub const IP_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
/// Node B address
pub const IP_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 3);

/// Carrier that queues outbound packets
#[derive(Default)]
pub struct MemoryCarrier {
    outbox: Mutex<Vec<(Vec<u8>, Ipv4Addr)>>,
    counters: TrafficCounters,
}

impl MemoryCarrier {
    /// Take every queued packet
    pub fn take(&self) -> Vec<(Vec<u8>, Ipv4Addr)> {
        std::mem::take(&mut *self.outbox.lock().unwrap())
    }

    /// Packets queued and not yet delivered
    pub fn pending(&self) -> Vec<(Vec<u8>, Ipv4Addr)> {
        self.outbox.lock().unwrap().clone()
    }

    /// Traffic counters
    pub fn counters(&self) -> &TrafficCounters {
        &self.counters
    }
}

impl PacketCarrier for MemoryCarrier {
    fn send_packet(&self, packet: &[u8], destination: Ipv4Addr) -> TransportResult<usize> {
        self.outbox.lock().unwrap().push((packet.to_vec(), destination));
        self.counters.record_wx(packet.len());
        Ok(packet.len())
    }
}

/// Link that records delivered frames
pub struct MemoryLink {
    queues: usize,
    delivered: Mutex<Vec<(Vec<u8>, usize)>>,
}

impl MemoryLink {
    /// Link with `queues` queues
    pub fn new(queues: usize) -> Self {
        Self {
            queues,
            delivered: Mutex::new(Vec::new()),
        }
    }

    /// Frames written so far with their queue
    pub fn delivered(&self) -> Vec<(Vec<u8>, usize)> {
        self.delivered.lock().unwrap().clone()
    }
}

impl LinkSink for MemoryLink {
    fn write_frame(&self, frame: &[u8], queue: usize) -> TransportResult<usize> {
        self.delivered
            .lock()
            .unwrap()
            .push((frame.to_vec(), queue % self.queues));
        Ok(frame.len())
    }

    fn queue_count(&self) -> usize {
        self.queues
    }
}

/// One node of the fixture
pub struct TestNode {
    /// Address on the in-memory wire
    pub ip: Ipv4Addr,
    /// Outbound carrier
    pub carrier: Arc<MemoryCarrier>,
    /// Local link
    pub link: Arc<MemoryLink>,
    /// Data plane under test
    pub dataplane: Dataplane<MemoryCarrier, MemoryLink>,
}

impl TestNode {
    /// Node `machine_id` at `ip` running `network`
    pub fn new(ip: Ipv4Addr, machine_id: &str, network: &NetworkConfig) -> Self {
        let cluster =
            NetworkCluster::from_config("net1", network, Uuid::parse_str(machine_id).unwrap())
                .unwrap();
        let carrier = Arc::new(MemoryCarrier::default());
        let link = Arc::new(MemoryLink::new(2));
        let dataplane = Dataplane::new(
            Arc::new(RwLock::new(cluster)),
            Arc::clone(&carrier),
            Arc::clone(&link),
        );
        Self {
            ip,
            carrier,
            link,
            dataplane,
        }
    }

    /// Read the cluster state
    pub fn with_cluster<T>(&self, f: impl FnOnce(&NetworkCluster) -> T) -> T {
        f(&*self.dataplane.read_cluster())
    }
}

/// Two-node fixture
pub struct TwoNodeFixture {
    /// Node A at 10.0.0.2
    pub a: TestNode,
    /// Node B at 10.0.0.3
    pub b: TestNode,
}

impl TwoNodeFixture {
    /// Both nodes know each other; neither is master
    pub fn new() -> Self {
        let network = network(&[(NODE_A, "alpha", IP_A), (NODE_B, "beta", IP_B)]);
        Self::from_networks(&network, &network)
    }

    /// Nodes with their own view of the network
    pub fn from_networks(a: &NetworkConfig, b: &NetworkConfig) -> Self {
        Self {
            a: TestNode::new(IP_A, NODE_A, a),
            b: TestNode::new(IP_B, NODE_B, b),
        }
    }

    /// Deliver every queued packet. Returns the dispatch outcomes in
    /// delivery order.
    pub fn pump(&self) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::new();
        for (from, to) in [(&self.a, &self.b), (&self.b, &self.a)] {
            for (packet, destination) in from.carrier.take() {
                if destination != to.ip {
                    continue;
                }
                match Packet::unpack(&packet, DEFAULT_SIZE_LIMIT) {
                    Ok(packet) => outcomes.push(to.dataplane.dispatch(packet, from.ip)),
                    Err(_) => outcomes.push(DispatchOutcome::Dropped),
                }
            }
        }
        outcomes
    }
}

impl Default for TwoNodeFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Network listing `nodes` as active members
pub fn network(nodes: &[(&str, &str, Ipv4Addr)]) -> NetworkConfig {
    let mut config = NetworkConfig {
        token: TOKEN.to_string(),
        term: 1,
        heartbeat_period_ms: 200,
        heartbeat_timeout_ms: 1000,
        ..Default::default()
    };
    for (id, name, ip) in nodes {
        config.nodes.insert(
            (*id).to_string(),
            NodeConfig::new(*name, true, vec![ip.to_string()]),
        );
    }
    config
}

/// Minimal IPv4 frame of `len` bytes from `source` to `destination`
pub fn ipv4_frame(source: Ipv4Addr, destination: Ipv4Addr, len: usize) -> Vec<u8> {
    assert!(len >= 20);
    let mut frame = vec![0u8; len];
    frame[0] = 0x45;
    frame[2..4].copy_from_slice(&(len as u16).to_be_bytes());
    frame[8] = 64;
    frame[9] = 17;
    frame[12..16].copy_from_slice(&source.octets());
    frame[16..20].copy_from_slice(&destination.octets());
    for (i, byte) in frame[20..].iter_mut().enumerate() {
        *byte = (i & 0xff) as u8;
    }
    frame
}
