//! Integration tests for the data plane.
//!
//! Two nodes exchange packets over an in-memory wire: routing on the
//! sender, dispatch on the receiver, and the control plane converging
//! through heartbeats and joins.

use std::net::Ipv4Addr;
use std::time::Instant;

use overturn_core::{DEFAULT_SIZE_LIMIT, HEADER_SIZE, NodeConfig, Packet, PayloadType};
use overturn_daemon::dataplane::{ControlEffect, DispatchOutcome, RouteOutcome};
use overturn_integration_tests::fixtures::two_node::{
    IP_A, IP_B, NODE_A, NODE_B, TwoNodeFixture, ipv4_frame, network,
};

// ============================================================================
// Raw Traffic
// ============================================================================

/// A 100-byte frame from A arrives unmodified on B's link.
#[test]
fn test_end_to_end_raw_frame() {
    let fixture = TwoNodeFixture::new();
    let frame = ipv4_frame(IP_A, IP_B, 100);

    let outcome = fixture.a.dataplane.route(&frame);
    assert_eq!(
        outcome,
        RouteOutcome::Sent {
            destination: IP_B,
            bytes: HEADER_SIZE + 100
        }
    );

    // Encoded length field covers header and frame
    let pending = fixture.a.carrier.pending();
    assert_eq!(pending.len(), 1);
    let (packet, destination) = &pending[0];
    assert_eq!(*destination, IP_B);
    assert_eq!(&packet[8..12], &112u32.to_be_bytes());
    let parsed = Packet::unpack(packet, DEFAULT_SIZE_LIMIT).unwrap();
    assert_eq!(parsed.payload_type(), PayloadType::Raw);

    let outcomes = fixture.pump();
    assert_eq!(outcomes, vec![DispatchOutcome::Delivered { bytes: 100 }]);

    let delivered = fixture.b.link.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, frame);
}

/// Deliveries rotate over the link queues.
#[test]
fn test_raw_delivery_round_robin() {
    let fixture = TwoNodeFixture::new();
    for len in [40, 41, 42, 43] {
        fixture.a.dataplane.route(&ipv4_frame(IP_A, IP_B, len));
    }
    fixture.pump();

    let queues: Vec<usize> = fixture.b.link.delivered().iter().map(|(_, q)| *q).collect();
    assert_eq!(queues, vec![0, 1, 0, 1]);
}

/// Frames with no owning member never reach the wire.
#[test]
fn test_unrouted_frames_dropped() {
    let fixture = TwoNodeFixture::new();
    assert_eq!(
        fixture
            .a
            .dataplane
            .route(&ipv4_frame(IP_A, Ipv4Addr::new(192, 168, 1, 1), 60)),
        RouteOutcome::NoRoute
    );
    assert_eq!(
        fixture.a.dataplane.route(&ipv4_frame(IP_B, IP_A, 60)),
        RouteOutcome::NoRoute
    );
    assert!(fixture.a.carrier.pending().is_empty());
}

/// After K sends of S bytes the carrier counted K * (S + header).
#[test]
fn test_sent_counter_accuracy() {
    let fixture = TwoNodeFixture::new();
    for _ in 0..25 {
        fixture.a.dataplane.route(&ipv4_frame(IP_A, IP_B, 200));
    }
    let counters = fixture.a.carrier.counters();
    assert_eq!(counters.wx_bytes(), 25 * (200 + HEADER_SIZE) as u64);
    assert_eq!(counters.wx_clear(), 25 * (200 + HEADER_SIZE) as u64);
    assert_eq!(counters.wx_bytes(), 0);
}

/// An address claimed by both nodes routes nowhere.
#[test]
fn test_conflicting_ip_not_routed() {
    let shared = Ipv4Addr::new(10, 0, 0, 5);
    let mut config = network(&[(NODE_A, "alpha", IP_A), (NODE_B, "beta", IP_B)]);
    for id in [NODE_A, NODE_B] {
        let node = config.nodes.get_mut(id).unwrap();
        node.publish.push(shared.to_string());
    }
    let fixture = TwoNodeFixture::from_networks(&config, &config);

    fixture.a.with_cluster(|cluster| {
        assert!(cluster.key_by_ip(shared).is_none());
        assert_eq!(cluster.node_count(), 2);
        assert_eq!(cluster.conflicts(), &[shared]);
    });
    assert_eq!(
        fixture.a.dataplane.route(&ipv4_frame(IP_A, shared, 60)),
        RouteOutcome::NoRoute
    );
    assert!(matches!(
        fixture.a.dataplane.route(&ipv4_frame(IP_A, IP_B, 60)),
        RouteOutcome::Sent { .. }
    ));
}

// ============================================================================
// Control Plane
// ============================================================================

/// B follows A after one master heartbeat.
#[test]
fn test_master_heartbeat_converges() {
    let fixture = TwoNodeFixture::new();
    fixture
        .a
        .dataplane
        .cluster()
        .write()
        .unwrap()
        .promote_self(Instant::now());

    fixture.a.dataplane.heartbeat_tick(Instant::now());
    let outcomes = fixture.pump();
    assert_eq!(
        outcomes,
        vec![DispatchOutcome::Control(ControlEffect {
            persist: true,
            resync: true
        })]
    );

    fixture.b.with_cluster(|cluster| {
        assert_eq!(cluster.term(), 2);
        assert_eq!(cluster.index(), 0);
        assert_eq!(cluster.master().unwrap().name(), "alpha");
        assert!(!cluster.is_master());
    });
}

/// A heartbeat from an older term leaves the follower unchanged.
#[test]
fn test_stale_master_heartbeat_ignored() {
    let members = [(NODE_A, "alpha", IP_A), (NODE_B, "beta", IP_B)];
    let a_view = network(&members);
    let mut b_view = network(&members);
    b_view.term = 5;
    b_view.index = 3;
    let fixture = TwoNodeFixture::from_networks(&a_view, &b_view);

    // A moves to term 2, still behind B
    fixture
        .a
        .dataplane
        .cluster()
        .write()
        .unwrap()
        .promote_self(Instant::now());
    fixture.a.dataplane.heartbeat_tick(Instant::now());

    let outcomes = fixture.pump();
    assert_eq!(outcomes, vec![DispatchOutcome::Control(ControlEffect::NONE)]);
    fixture.b.with_cluster(|cluster| {
        assert_eq!((cluster.term(), cluster.index()), (5, 3));
        assert!(cluster.master().is_none());
    });
}

/// Node heartbeats bring an inactive member into the capture set.
#[test]
fn test_node_heartbeat_activates_member() {
    let mut config = network(&[(NODE_A, "alpha", IP_A), (NODE_B, "beta", IP_B)]);
    config.nodes.insert(
        NODE_B.to_string(),
        NodeConfig::new("beta", false, vec![IP_B.to_string()]),
    );
    let fixture = TwoNodeFixture::from_networks(&config, &config);
    fixture
        .a
        .with_cluster(|cluster| assert!(cluster.member_ips().is_empty()));

    fixture.b.dataplane.heartbeat_tick(Instant::now());
    let outcomes = fixture.pump();
    assert_eq!(
        outcomes[0],
        DispatchOutcome::Control(ControlEffect {
            persist: false,
            resync: true
        })
    );

    fixture
        .a
        .with_cluster(|cluster| assert_eq!(cluster.member_ips(), vec![IP_B]));
}

/// A node unknown to the master joins with the token, then follows it.
#[test]
fn test_join_admits_new_member() {
    let master_view = network(&[(NODE_A, "alpha", IP_A)]);
    let joiner_view = network(&[(NODE_A, "alpha", IP_A), (NODE_B, "beta", IP_B)]);
    let fixture = TwoNodeFixture::from_networks(&master_view, &joiner_view);
    fixture
        .a
        .dataplane
        .cluster()
        .write()
        .unwrap()
        .promote_self(Instant::now());

    // Heartbeat, join request, activation
    fixture.b.dataplane.heartbeat_tick(Instant::now());
    let outcomes = fixture.pump();
    assert_eq!(outcomes.len(), 3);
    assert_eq!(
        outcomes[2],
        DispatchOutcome::Control(ControlEffect {
            persist: true,
            resync: true
        })
    );

    fixture.a.with_cluster(|cluster| {
        assert_eq!(cluster.node_count(), 2);
        assert_eq!(cluster.index(), 1);
        assert!(cluster.routes_to(IP_B));
        assert_eq!(cluster.heartbeat_targets(), vec![IP_B]);
    });

    fixture.a.dataplane.heartbeat_tick(Instant::now());
    fixture.pump();
    fixture.b.with_cluster(|cluster| {
        assert_eq!((cluster.term(), cluster.index()), (2, 1));
        assert_eq!(cluster.master().unwrap().name(), "alpha");
    });
}

/// A join carrying the wrong token is not admitted.
#[test]
fn test_join_with_wrong_token_rejected() {
    let master_view = network(&[(NODE_A, "alpha", IP_A)]);
    let mut joiner_view = network(&[(NODE_A, "alpha", IP_A), (NODE_B, "beta", IP_B)]);
    joiner_view.token = "a3b4c5d6-0000-4000-8000-0000000000ff".to_string();
    let fixture = TwoNodeFixture::from_networks(&master_view, &joiner_view);
    fixture
        .a
        .dataplane
        .cluster()
        .write()
        .unwrap()
        .promote_self(Instant::now());

    fixture.b.dataplane.heartbeat_tick(Instant::now());
    let outcomes = fixture.pump();
    assert!(
        outcomes
            .iter()
            .all(|outcome| *outcome == DispatchOutcome::Control(ControlEffect::NONE))
    );
    fixture.a.with_cluster(|cluster| {
        assert_eq!(cluster.node_count(), 1);
        assert!(!cluster.routes_to(IP_B));
    });
}
