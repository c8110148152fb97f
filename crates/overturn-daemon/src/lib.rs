//! # Overturn Daemon
//!
//! Runs one overlay network on this host.
//!
//! - [`config`]: the self-maintained configuration file
//! - [`manager`]: resource acquisition, lifecycle and persistence
//! - [`dataplane`]: routing and dispatch between the link and the ICMP carrier
//! - [`capture`]: firewall rules steering member traffic into the link
//! - [`identity`]: stable identifier of the local machine

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod capture;
pub mod config;
pub mod dataplane;
pub mod identity;
pub mod manager;

pub use capture::{CaptureError, CaptureRules, IptablesCapture, NoCapture};
pub use config::Config;
pub use dataplane::{ControlEffect, Dataplane, DispatchOutcome, RouteOutcome};
pub use identity::{FixedIdentity, MachineIdentity, SystemIdentity};
pub use manager::{ClusterManager, ClusterStore, FileStore, ManagerError, ManagerOptions};
