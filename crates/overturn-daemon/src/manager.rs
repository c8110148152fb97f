//! Cluster manager.
//!
//! Owns both transports, the capture rules and the heartbeat ticker of the
//! active network.
//!
//! Acquisition order is ICMP socket, link name, link, capture programmer,
//! capture install. A failure releases what was already acquired in
//! reverse order: the locals of [`ClusterManager::new`] drop last to
//! first, and closing a [`LinkTransport`] removes its interface.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, bounded, select, tick};
use overturn_core::{ClusterError, NetworkCluster, NetworkConfig};
use overturn_transport::link::{first_free_name, link_exists};
use overturn_transport::{
    IcmpTransport, IcmpType, LinkTransport, TransportError, TransportStats,
};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::capture::{CaptureError, CaptureRules};
use crate::config::Config;
use crate::dataplane::{ControlEffect, Dataplane, DispatchOutcome, RouteOutcome};

/// Link names are `ovt0` to `ovt9`
pub const LINK_PREFIX: &str = "ovt";

/// Candidate link names probed before giving up
pub const LINK_LIMIT: usize = 10;

/// Shortest heartbeat period the ticker accepts
const MIN_HEARTBEAT_PERIOD: Duration = Duration::from_millis(10);

/// Cluster manager errors
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration error
    #[error("Cluster configuration error: {0}")]
    Cluster(#[from] ClusterError),

    /// Every candidate link name is taken
    #[error("Too many links: {prefix}0 to {prefix}{} are all in use", .limit.saturating_sub(1))]
    TooManyLinks {
        /// Name prefix
        prefix: String,
        /// Number of candidates
        limit: usize,
    },

    /// Capture rules could not be programmed
    #[error("Capture rule error: {0}")]
    Capture(#[from] CaptureError),

    /// Machine identity unavailable
    #[error("Cannot read machine identity: {0}")]
    Identity(String),

    /// Cluster state could not be saved
    #[error("Cannot persist cluster state: {0}")]
    Persist(String),
}

/// Receives committed cluster state
pub trait ClusterStore: Send + Sync {
    /// Save the state of network `network`
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Persist` if the state cannot be written.
    fn persist(&self, network: &str, config: &NetworkConfig) -> Result<(), ManagerError>;
}

/// Writes committed state back into the daemon configuration file
pub struct FileStore {
    path: PathBuf,
    config: Mutex<Config>,
}

impl FileStore {
    /// Store backed by `config`, saved to `path`
    pub fn new(path: impl Into<PathBuf>, config: Config) -> Self {
        Self {
            path: path.into(),
            config: Mutex::new(config),
        }
    }

    /// Configuration file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ClusterStore for FileStore {
    fn persist(&self, network: &str, state: &NetworkConfig) -> Result<(), ManagerError> {
        let mut config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
        config.network.insert(network.to_string(), state.clone());
        config
            .save(&self.path)
            .map_err(|e| ManagerError::Persist(format!("{}: {e}", self.path.display())))?;
        debug!(path = %self.path.display(), term = state.term, index = state.index, "Cluster state saved");
        Ok(())
    }
}

/// Transport settings of the manager
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Local address of the ICMP socket
    pub bind_address: Ipv4Addr,
    /// Outbound ICMP type
    pub icmp_type: IcmpType,
    /// Largest accepted tunnel packet
    pub size_limit: usize,
    /// Link queues (0 = CPU count)
    pub queue_count: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            bind_address: Ipv4Addr::UNSPECIFIED,
            icmp_type: IcmpType::EchoReply,
            size_limit: overturn_core::DEFAULT_SIZE_LIMIT,
            queue_count: 0,
        }
    }
}

/// Traffic counters of both transports
#[derive(Debug, Clone, Copy, Default)]
pub struct ManagerStats {
    /// ICMP carrier traffic
    pub icmp: TransportStats,
    /// Link traffic
    pub link: TransportStats,
}

/// Capture rules and the member set they were last installed for
struct CaptureSet {
    rules: Box<dyn CaptureRules>,
    installed: Mutex<Option<Vec<Ipv4Addr>>>,
}

impl CaptureSet {
    fn new(rules: Box<dyn CaptureRules>, installed: Option<Vec<Ipv4Addr>>) -> Self {
        Self {
            rules,
            installed: Mutex::new(installed),
        }
    }

    /// Install the member set of `cluster` if it differs from the installed
    /// one. Returns whether the rules were reinstalled.
    fn sync(&self, cluster: &RwLock<NetworkCluster>) -> Result<bool, CaptureError> {
        // Members are read while `installed` is held: installs happen in the
        // order the cluster was observed.
        let mut installed = self.installed.lock().unwrap_or_else(PoisonError::into_inner);
        let members = cluster
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .member_ips();
        if installed.as_ref() == Some(&members) {
            return Ok(false);
        }
        // A failed install has already cleared the rules
        *installed = None;
        self.rules.install(&members)?;
        info!(members = ?members, "Capture set updated");
        *installed = Some(members);
        Ok(true)
    }

    fn clear(&self) -> Result<(), CaptureError> {
        let mut installed = self.installed.lock().unwrap_or_else(PoisonError::into_inner);
        installed.take();
        self.rules.clear()
    }

    fn is_installed(&self) -> bool {
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

struct Shared {
    dataplane: Dataplane<IcmpTransport, LinkTransport>,
    store: Box<dyn ClusterStore>,
    capture: CaptureSet,
}

impl Shared {
    fn apply_effect(&self, effect: ControlEffect) {
        if effect.persist {
            if let Err(e) = self.persist() {
                error!(error = %e, "Cannot persist committed state");
            }
        }
        if effect.persist || effect.resync {
            if let Err(e) = self.sync_capture() {
                error!(error = %e, "Cannot refresh capture rules");
            }
        }
    }

    fn persist(&self) -> Result<(), ManagerError> {
        let (name, state) = {
            let cluster = self.dataplane.read_cluster();
            (cluster.name().to_string(), cluster.to_config())
        };
        self.store.persist(&name, &state)
    }

    fn sync_capture(&self) -> Result<(), ManagerError> {
        self.capture.sync(self.dataplane.cluster())?;
        Ok(())
    }

    fn clear_capture(&self) -> Result<(), CaptureError> {
        self.capture.clear()
    }
}

struct Ticker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Owns the transports and control loop of one network
pub struct ClusterManager {
    shared: Arc<Shared>,
    ticker: Mutex<Option<Ticker>>,
}

impl ClusterManager {
    /// Acquire every resource of the daemon.
    ///
    /// `capture_factory` is called with the allocated link name.
    ///
    /// # Errors
    ///
    /// Returns the first failing step; resources acquired before it are
    /// released.
    pub fn new<F>(
        cluster: NetworkCluster,
        options: &ManagerOptions,
        store: Box<dyn ClusterStore>,
        capture_factory: F,
    ) -> Result<Self, ManagerError>
    where
        F: FnOnce(&str) -> Result<Box<dyn CaptureRules>, ManagerError>,
    {
        let icmp = IcmpTransport::open(options.bind_address, options.icmp_type)?
            .with_size_limit(options.size_limit);

        let name = first_free_name(LINK_PREFIX, LINK_LIMIT, link_exists).ok_or_else(|| {
            ManagerError::TooManyLinks {
                prefix: LINK_PREFIX.to_string(),
                limit: LINK_LIMIT,
            }
        })?;

        let queue_count = match options.queue_count {
            0 => LinkTransport::default_queue_count(),
            n => n,
        };
        let link = LinkTransport::create(&name, queue_count)?;

        let capture = capture_factory(&name)?;

        let members = cluster.member_ips();
        capture.install(&members)?;

        let cluster = Arc::new(RwLock::new(cluster));
        let shared = Arc::new(Shared {
            dataplane: Dataplane::new(cluster, Arc::new(icmp), Arc::new(link)),
            store,
            capture: CaptureSet::new(capture, Some(members)),
        });

        if let Err(e) = register_handlers(&shared) {
            if let Err(cleanup) = shared.clear_capture() {
                error!(error = %cleanup, "Capture rule cleanup failed");
            }
            return Err(e);
        }

        info!(link = %name, queues = queue_count, "Cluster manager ready");
        Ok(Self {
            shared,
            ticker: Mutex::new(None),
        })
    }

    /// Bring up the link, then the ICMP carrier, then the heartbeat ticker.
    ///
    /// # Errors
    ///
    /// Returns the first failing step; what was already started is stopped.
    pub fn start(&self) -> Result<(), ManagerError> {
        let dataplane = &self.shared.dataplane;
        dataplane.link().start()?;

        if let Err(e) = dataplane.carrier().start() {
            self.stop_link();
            return Err(e.into());
        }

        if let Err(e) = self.start_ticker() {
            self.stop_carrier();
            self.stop_link();
            return Err(e);
        }

        if let Err(e) = self.shared.sync_capture() {
            self.stop_ticker();
            self.stop_carrier();
            self.stop_link();
            return Err(e);
        }

        dataplane.announce();
        info!(
            network = %dataplane.read_cluster().name(),
            link = %dataplane.link().name(),
            "Cluster manager started"
        );
        Ok(())
    }

    /// Tear down: capture rules, link, ICMP carrier.
    ///
    /// Every step runs; the first error is returned.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::NotRunning` if nothing was running.
    pub fn stop(&self) -> Result<(), ManagerError> {
        if !self.is_running() {
            return Err(TransportError::NotRunning.into());
        }
        self.stop_ticker();

        let mut first: Option<ManagerError> = None;
        if let Err(e) = self.shared.clear_capture() {
            error!(error = %e, "Cannot remove capture rules");
            first.get_or_insert(e.into());
        }

        let dataplane = &self.shared.dataplane;
        if dataplane.link().is_running() {
            if let Err(e) = dataplane.link().stop() {
                error!(error = %e, "Cannot stop link");
                first.get_or_insert(e.into());
            }
        }
        if dataplane.carrier().is_running() {
            if let Err(e) = dataplane.carrier().stop() {
                error!(error = %e, "Cannot stop ICMP carrier");
                first.get_or_insert(e.into());
            }
        }

        info!("Cluster manager stopped");
        first.map_or(Ok(()), Err)
    }

    /// Whether either transport is running
    pub fn is_running(&self) -> bool {
        let dataplane = &self.shared.dataplane;
        dataplane.link().is_running() || dataplane.carrier().is_running()
    }

    /// Take over as master of the network and persist the new term
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Persist` or `ManagerError::Capture`.
    pub fn promote_self(&self) -> Result<(), ManagerError> {
        self.shared
            .dataplane
            .cluster()
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .promote_self(Instant::now());
        self.shared.persist()?;
        self.shared.sync_capture()
    }

    /// Persist the current cluster state
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Persist` if the store fails.
    pub fn persist(&self) -> Result<(), ManagerError> {
        self.shared.persist()
    }

    /// Reinstall capture rules if the member set changed
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Capture` if the rules cannot be installed.
    pub fn sync_capture(&self) -> Result<(), ManagerError> {
        self.shared.sync_capture()
    }

    /// Shared cluster state
    pub fn cluster(&self) -> &Arc<RwLock<NetworkCluster>> {
        self.shared.dataplane.cluster()
    }

    /// Name of the tunnel link
    pub fn link_name(&self) -> &str {
        self.shared.dataplane.link().name()
    }

    /// Traffic counters of both transports
    pub fn stats(&self) -> ManagerStats {
        let dataplane = &self.shared.dataplane;
        ManagerStats {
            icmp: dataplane.carrier().counters().snapshot(),
            link: dataplane.link().counters().snapshot(),
        }
    }

    fn start_ticker(&self) -> Result<(), ManagerError> {
        let period = self
            .shared
            .dataplane
            .read_cluster()
            .heartbeat_period()
            .max(MIN_HEARTBEAT_PERIOD);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let shared = Arc::clone(&self.shared);

        let handle = thread::Builder::new()
            .name("ovt-heartbeat".to_string())
            .spawn(move || {
                let ticks = tick(period);
                loop {
                    select! {
                        recv(ticks) -> _ => {
                            let effect = shared.dataplane.heartbeat_tick(Instant::now());
                            shared.apply_effect(effect);
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
                debug!("Heartbeat ticker exiting");
            })
            .map_err(TransportError::from)?;

        *self.ticker.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Ticker { stop_tx, handle });
        debug!(period_ms = period.as_millis() as u64, "Heartbeat ticker started");
        Ok(())
    }

    fn stop_ticker(&self) {
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(ticker) = ticker {
            let _ = ticker.stop_tx.send(());
            if ticker.handle.join().is_err() {
                error!("Heartbeat ticker panicked");
            }
        }
    }

    fn stop_link(&self) {
        if let Err(e) = self.shared.dataplane.link().stop() {
            warn!(error = %e, "Cannot stop link");
        }
    }

    fn stop_carrier(&self) {
        if let Err(e) = self.shared.dataplane.carrier().stop() {
            warn!(error = %e, "Cannot stop ICMP carrier");
        }
    }
}

impl Drop for ClusterManager {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
        if self.shared.capture.is_installed() {
            if let Err(e) = self.shared.clear_capture() {
                error!(error = %e, "Cannot remove capture rules");
            }
        }
        // Workers hold only weak references; release the transports here
        self.shared.dataplane.carrier().destroy();
        self.shared.dataplane.link().close();
    }
}

fn register_handlers(shared: &Arc<Shared>) -> Result<(), ManagerError> {
    let dataplane = &shared.dataplane;

    let weak: Weak<Shared> = Arc::downgrade(shared);
    dataplane.link().register_per_queue(move |frame| {
        if let Some(shared) = weak.upgrade() {
            if let RouteOutcome::Sent { destination, bytes } = shared.dataplane.route(frame) {
                trace!(destination = %destination, bytes, "Frame routed");
            }
        }
    })?;

    // One ICMP reader per link queue
    for _ in 0..dataplane.link().queue_count() {
        let weak: Weak<Shared> = Arc::downgrade(shared);
        dataplane.carrier().register_handler(move |packet, source| {
            if let Some(shared) = weak.upgrade() {
                if let DispatchOutcome::Control(effect) = shared.dataplane.dispatch(packet, source) {
                    shared.apply_effect(effect);
                }
            }
        })?;
    }
    Ok(())
}
