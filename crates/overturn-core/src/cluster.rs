//! Cluster membership state.
//!
//! Nodes live in a single arena; the IP and ID indexes hold [`NodeKey`]s into
//! it. An IP published by more than one node is removed from the IP index
//! for every claimant.
//!
//! The cluster clock is the `(term, index)` pair. A heartbeat from an older
//! term never changes state. A newer term, or the same term with a newer
//! index, replaces the master.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{NetworkConfig, NodeConfig};
use crate::error::ClusterError;
use crate::message::{Heartbeat, HeartbeatKind, JoinRequest, NetName, NodeActivate};

/// Handle of a node inside the cluster arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(usize);

/// A cluster member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkNode {
    id: Uuid,
    name: String,
    active: bool,
    publish: Vec<Ipv4Addr>,
    last_seen: Option<Instant>,
}

impl NetworkNode {
    fn new(id: Uuid, name: String, active: bool) -> Self {
        Self {
            id,
            name,
            active,
            publish: Vec::new(),
            last_seen: None,
        }
    }

    /// Node identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the node is considered up
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Published IPv4 addresses, conflicting ones included
    pub fn publish(&self) -> &[Ipv4Addr] {
        &self.publish
    }

    /// When a control message from this node was last applied
    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    fn touch(&mut self, now: Instant) -> bool {
        self.last_seen = Some(now);
        let activated = !self.active;
        self.active = true;
        activated
    }
}

/// Result of applying a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Master, term or index changed
    Committed {
        /// The master reference now points at a different node
        master_changed: bool,
    },
    /// Sender liveness refreshed without a clock change
    Refreshed {
        /// The sender was inactive before
        activated: bool,
    },
    /// Older than the current clock
    Stale,
    /// Belongs to another network
    ForeignNetwork,
    /// Names a master id that is not a member
    UnknownMaster,
    /// Source address does not belong to a member
    UnknownSource,
}

impl HeartbeatOutcome {
    /// Whether the cluster clock changed and must be persisted
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

/// Result of applying a join request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Source may activate within the heartbeat timeout
    Authorized,
    /// Only the master admits nodes
    NotMaster,
    /// Request names another network
    ForeignNetwork,
    /// No token configured or the token does not match
    InvalidToken,
    /// Token outside its validity window
    Expired,
}

/// Result of applying a node activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivateOutcome {
    /// Existing member marked active
    Activated {
        /// Member key
        key: NodeKey,
        /// The member was inactive before
        changed: bool,
    },
    /// New member admitted; index advanced
    Added {
        /// Key of the new member
        key: NodeKey,
    },
    /// Neither a member source nor a pending authorization
    Unauthorized,
}

/// State of one overlay network
#[derive(Debug)]
pub struct NetworkCluster {
    name: String,
    net_name: NetName,
    token_raw: String,
    token: Option<Uuid>,
    token_expire_before: u64,
    token_expire_after: u64,
    term: u64,
    index: u64,
    heartbeat_period: Duration,
    heartbeat_timeout: Duration,
    nodes: Vec<NetworkNode>,
    by_ip: HashMap<Ipv4Addr, NodeKey>,
    by_id: HashMap<Uuid, NodeKey>,
    conflicts: Vec<Ipv4Addr>,
    master: Option<NodeKey>,
    self_key: NodeKey,
    pending_joins: HashMap<Ipv4Addr, Instant>,
}

impl NetworkCluster {
    /// Build the cluster from its persisted description.
    ///
    /// `machine_id` identifies the local node; it is created inactive when
    /// the configuration does not list it.
    pub fn from_config(
        name: &str,
        config: &NetworkConfig,
        machine_id: Uuid,
    ) -> Result<Self, ClusterError> {
        let token = if config.token.is_empty() {
            None
        } else {
            match Uuid::parse_str(&config.token) {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!(network = name, error = %e, "Invalid join token, joins disabled");
                    None
                }
            }
        };

        let mut nodes = Vec::with_capacity(config.nodes.len() + 1);
        let mut by_id = HashMap::with_capacity(config.nodes.len() + 1);
        let mut claims: HashMap<Ipv4Addr, Vec<NodeKey>> = HashMap::new();

        for (raw_id, node_config) in &config.nodes {
            let id = Uuid::parse_str(raw_id)
                .map_err(|_| ClusterError::InvalidNodeId(raw_id.clone()))?;
            if by_id.contains_key(&id) {
                return Err(ClusterError::InvalidNodeId(raw_id.clone()));
            }

            let key = NodeKey(nodes.len());
            let mut node = NetworkNode::new(id, node_config.name.clone(), node_config.active);
            for raw_ip in &node_config.publish {
                match raw_ip.parse::<Ipv4Addr>() {
                    Ok(ip) if !node.publish.contains(&ip) => {
                        node.publish.push(ip);
                        claims.entry(ip).or_default().push(key);
                    }
                    Ok(_) => {}
                    Err(_) => {
                        warn!(node = %id, ip = %raw_ip, "Not a valid IPv4 address, ignored");
                    }
                }
            }

            nodes.push(node);
            by_id.insert(id, key);
        }

        let mut by_ip = HashMap::with_capacity(claims.len());
        let mut conflicts = Vec::new();
        for (ip, owners) in claims {
            if let [owner] = owners.as_slice() {
                by_ip.insert(ip, *owner);
            } else {
                for owner in &owners {
                    warn!(
                        ip = %ip,
                        node = %nodes[owner.0].id,
                        name = %nodes[owner.0].name,
                        "IP removed from node due to conflict"
                    );
                }
                conflicts.push(ip);
            }
        }
        conflicts.sort_unstable();

        let self_key = match by_id.get(&machine_id) {
            Some(&key) => key,
            None => {
                let key = NodeKey(nodes.len());
                nodes.push(NetworkNode::new(machine_id, default_node_name(machine_id), false));
                by_id.insert(machine_id, key);
                key
            }
        };

        Ok(Self {
            name: name.to_string(),
            net_name: NetName::new(name),
            token_raw: config.token.clone(),
            token,
            token_expire_before: config.token_expire_before,
            token_expire_after: config.token_expire_after,
            term: config.term,
            index: config.index,
            heartbeat_period: Duration::from_millis(u64::from(config.heartbeat_period_ms)),
            heartbeat_timeout: Duration::from_millis(u64::from(config.heartbeat_timeout_ms)),
            nodes,
            by_ip,
            by_id,
            conflicts,
            master: None,
            self_key,
            pending_joins: HashMap::new(),
        })
    }

    /// Export the state for persistence
    pub fn to_config(&self) -> NetworkConfig {
        let nodes = self
            .nodes
            .iter()
            .map(|node| {
                let publish = node.publish.iter().map(ToString::to_string).collect();
                (
                    node.id.to_string(),
                    NodeConfig::new(node.name.clone(), node.active, publish),
                )
            })
            .collect();

        NetworkConfig {
            token: self.token_raw.clone(),
            token_expire_before: self.token_expire_before,
            token_expire_after: self.token_expire_after,
            term: self.term,
            index: self.index,
            heartbeat_period_ms: duration_ms(self.heartbeat_period),
            heartbeat_timeout_ms: duration_ms(self.heartbeat_timeout),
            nodes,
        }
    }

    /// Network name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current term
    pub fn term(&self) -> u64 {
        self.term
    }

    /// Current index
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Heartbeat emission period
    pub fn heartbeat_period(&self) -> Duration {
        self.heartbeat_period
    }

    /// Master silence tolerated before it is marked inactive
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Node by key
    pub fn node(&self, key: NodeKey) -> Option<&NetworkNode> {
        self.nodes.get(key.0)
    }

    /// Iterate all members
    pub fn nodes(&self) -> impl Iterator<Item = (NodeKey, &NetworkNode)> {
        self.nodes.iter().enumerate().map(|(i, node)| (NodeKey(i), node))
    }

    /// Number of members, Self included
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Key of the node with the given id
    pub fn key_by_id(&self, id: &Uuid) -> Option<NodeKey> {
        self.by_id.get(id).copied()
    }

    /// Key of the node owning `ip`
    pub fn key_by_ip(&self, ip: Ipv4Addr) -> Option<NodeKey> {
        self.by_ip.get(&ip).copied()
    }

    /// Node owning `ip`
    pub fn lookup_ip(&self, ip: Ipv4Addr) -> Option<&NetworkNode> {
        self.key_by_ip(ip).and_then(|key| self.node(key))
    }

    /// Whether outbound traffic to `ip` is carried by the overlay
    pub fn routes_to(&self, ip: Ipv4Addr) -> bool {
        self.key_by_ip(ip).is_some_and(|key| key != self.self_key)
    }

    /// Addresses removed from the IP index because several nodes claim them
    pub fn conflicts(&self) -> &[Ipv4Addr] {
        &self.conflicts
    }

    /// The local node
    pub fn self_node(&self) -> &NetworkNode {
        &self.nodes[self.self_key.0]
    }

    /// Key of the local node
    pub fn self_key(&self) -> NodeKey {
        self.self_key
    }

    /// The node currently followed as master
    pub fn master(&self) -> Option<&NetworkNode> {
        self.master.and_then(|key| self.node(key))
    }

    /// Whether the local node is the master
    pub fn is_master(&self) -> bool {
        self.master == Some(self.self_key)
    }

    /// Capture set: addresses owned by active members other than Self
    pub fn member_ips(&self) -> Vec<Ipv4Addr> {
        let mut ips: Vec<Ipv4Addr> = self
            .by_ip
            .iter()
            .filter(|&(_, &key)| key != self.self_key && self.nodes[key.0].active)
            .map(|(&ip, _)| ip)
            .collect();
        ips.sort_unstable();
        ips
    }

    /// One owned address of every other member
    pub fn heartbeat_targets(&self) -> Vec<Ipv4Addr> {
        self.nodes()
            .filter(|&(key, _)| key != self.self_key)
            .filter_map(|(key, node)| {
                node.publish
                    .iter()
                    .copied()
                    .find(|ip| self.key_by_ip(*ip) == Some(key))
            })
            .collect()
    }

    /// Heartbeat the local node emits this period
    pub fn local_heartbeat(&self) -> Heartbeat {
        let kind = if self.is_master() {
            HeartbeatKind::Master
        } else {
            HeartbeatKind::Node
        };
        let master = self.master().map_or(Uuid::nil(), NetworkNode::id);
        Heartbeat::new(kind, self.net_name, master, self.term, self.index)
    }

    /// Membership token, if one is configured
    pub fn token(&self) -> Option<Uuid> {
        self.token
    }

    /// Local network name as carried on the wire
    pub fn net_name(&self) -> NetName {
        self.net_name
    }

    /// Whether the configured token is valid at UNIX time `now_unix`
    pub fn token_valid_at(&self, now_unix: u64) -> bool {
        self.token.is_some()
            && (self.token_expire_before == 0 || now_unix >= self.token_expire_before)
            && (self.token_expire_after == 0 || now_unix <= self.token_expire_after)
    }

    /// Apply a heartbeat received from `source`
    pub fn apply_heartbeat(
        &mut self,
        heartbeat: &Heartbeat,
        source: Ipv4Addr,
        now: Instant,
    ) -> HeartbeatOutcome {
        if heartbeat.net_name != self.net_name {
            debug!(
                network = %self.name,
                remote = %heartbeat.net_name,
                source = %source,
                "Heartbeat for another network, discarded"
            );
            return HeartbeatOutcome::ForeignNetwork;
        }
        if heartbeat.term < self.term {
            debug!(
                term = heartbeat.term,
                current = self.term,
                source = %source,
                "Stale heartbeat, discarded"
            );
            return HeartbeatOutcome::Stale;
        }

        match heartbeat.kind {
            HeartbeatKind::Master => self.apply_master_heartbeat(heartbeat, source, now),
            HeartbeatKind::Node => self.apply_node_heartbeat(heartbeat, source, now),
        }
    }

    fn apply_master_heartbeat(
        &mut self,
        heartbeat: &Heartbeat,
        source: Ipv4Addr,
        now: Instant,
    ) -> HeartbeatOutcome {
        let Some(key) = self.key_by_id(&heartbeat.master) else {
            warn!(master = %heartbeat.master, source = %source, "Heartbeat from unknown master");
            return HeartbeatOutcome::UnknownMaster;
        };

        let newer = heartbeat.term > self.term
            || (heartbeat.term == self.term && heartbeat.index > self.index);
        if newer {
            let master_changed = self.master != Some(key);
            self.term = heartbeat.term;
            self.index = heartbeat.index;
            self.master = Some(key);
            self.nodes[key.0].touch(now);
            if master_changed {
                info!(
                    master = %heartbeat.master,
                    name = %self.nodes[key.0].name,
                    term = self.term,
                    index = self.index,
                    "Following new master"
                );
            }
            return HeartbeatOutcome::Committed { master_changed };
        }

        if heartbeat.index == self.index && self.master == Some(key) {
            let activated = self.nodes[key.0].touch(now);
            return HeartbeatOutcome::Refreshed { activated };
        }

        debug!(
            term = heartbeat.term,
            index = heartbeat.index,
            current_index = self.index,
            "Outdated master heartbeat, discarded"
        );
        HeartbeatOutcome::Stale
    }

    fn apply_node_heartbeat(
        &mut self,
        heartbeat: &Heartbeat,
        source: Ipv4Addr,
        now: Instant,
    ) -> HeartbeatOutcome {
        let Some(key) = self.key_by_ip(source) else {
            debug!(source = %source, "Node heartbeat from non-member source");
            return HeartbeatOutcome::UnknownSource;
        };
        if heartbeat.term > self.term
            || (heartbeat.term == self.term && heartbeat.index > self.index)
        {
            debug!(
                source = %source,
                term = heartbeat.term,
                index = heartbeat.index,
                "Member reports a newer cluster clock"
            );
        }
        let activated = self.nodes[key.0].touch(now);
        if activated {
            info!(node = %self.nodes[key.0].id, ip = %source, "Member is up");
        }
        HeartbeatOutcome::Refreshed { activated }
    }

    /// Apply a join request from `source`
    pub fn apply_join_request(
        &mut self,
        request: &JoinRequest,
        source: Ipv4Addr,
        now_unix: u64,
        now: Instant,
    ) -> JoinOutcome {
        if !self.is_master() {
            return JoinOutcome::NotMaster;
        }
        if request.name != self.net_name {
            return JoinOutcome::ForeignNetwork;
        }
        if self.token != Some(request.token) {
            warn!(source = %source, "Join request with invalid token");
            return JoinOutcome::InvalidToken;
        }
        if !self.token_valid_at(now_unix) {
            warn!(source = %source, "Join request with expired token");
            return JoinOutcome::Expired;
        }

        let timeout = self.heartbeat_timeout;
        self.pending_joins
            .retain(|_, at| now.saturating_duration_since(*at) <= timeout);
        self.pending_joins.insert(source, now);
        info!(source = %source, "Join authorized");
        JoinOutcome::Authorized
    }

    /// Apply a node activation from `source`
    pub fn apply_node_activate(
        &mut self,
        activate: &NodeActivate,
        source: Ipv4Addr,
        now: Instant,
    ) -> ActivateOutcome {
        let authorized = self
            .pending_joins
            .get(&source)
            .is_some_and(|at| now.saturating_duration_since(*at) <= self.heartbeat_timeout);

        if let Some(key) = self.key_by_id(&activate.id) {
            if !authorized && self.key_by_ip(source).is_none() {
                return ActivateOutcome::Unauthorized;
            }
            self.pending_joins.remove(&source);
            let changed = self.nodes[key.0].touch(now);
            return ActivateOutcome::Activated { key, changed };
        }

        if !authorized || !self.is_master() {
            debug!(id = %activate.id, source = %source, "Unauthorized activation");
            return ActivateOutcome::Unauthorized;
        }
        self.pending_joins.remove(&source);

        let key = NodeKey(self.nodes.len());
        let mut node = NetworkNode::new(activate.id, default_node_name(activate.id), true);
        node.last_seen = Some(now);
        if !self.by_ip.contains_key(&source) && !self.conflicts.contains(&source) {
            node.publish.push(source);
            self.by_ip.insert(source, key);
        }
        self.nodes.push(node);
        self.by_id.insert(activate.id, key);
        self.index += 1;

        info!(
            node = %activate.id,
            ip = %source,
            index = self.index,
            "New member admitted"
        );
        ActivateOutcome::Added { key }
    }

    /// Mark the master inactive once it has been silent past the timeout.
    ///
    /// Returns true when the master was marked inactive by this call.
    pub fn check_master_timeout(&mut self, now: Instant) -> bool {
        let Some(key) = self.master else {
            return false;
        };
        if key == self.self_key {
            return false;
        }

        let timeout = self.heartbeat_timeout;
        let node = &mut self.nodes[key.0];
        let expired = node
            .last_seen
            .is_some_and(|seen| now.saturating_duration_since(seen) > timeout);
        if node.active && expired {
            node.active = false;
            warn!(master = %node.id, name = %node.name, "Master heartbeat timed out");
            return true;
        }
        false
    }

    /// Take over as master: next term, index reset
    pub fn promote_self(&mut self, now: Instant) {
        self.term += 1;
        self.index = 0;
        self.master = Some(self.self_key);
        self.nodes[self.self_key.0].touch(now);
        info!(
            network = %self.name,
            node = %self.nodes[self.self_key.0].id,
            term = self.term,
            "Promoted to master"
        );
    }
}

fn default_node_name(id: Uuid) -> String {
    let simple = id.simple().to_string();
    format!("node_{}", &simple[..8])
}

fn duration_ms(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}
