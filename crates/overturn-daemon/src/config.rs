//! Daemon configuration file.
//!
//! The file is maintained by the daemon itself: committed cluster changes
//! are written back into the active network section.

use overturn_core::{ClusterError, HEADER_SIZE, NetworkConfig};
use overturn_transport::IcmpType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Overturn daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Active network name
    #[serde(default)]
    pub active: String,
    /// Machine identity override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,
    /// Capture-rule configuration
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Known networks by name
    #[serde(default)]
    pub network: BTreeMap<String, NetworkConfig>,
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Local address of the raw ICMP socket
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Link queue count (0 = CPU count)
    #[serde(default)]
    pub queues: usize,
    /// Outbound ICMP type: "echo-reply" or "echo"
    #[serde(default = "default_icmp_type")]
    pub icmp_type: String,
    /// Largest accepted tunnel packet
    #[serde(default = "default_size_limit")]
    pub size_limit: usize,
}

/// Capture-rule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Program firewall rules
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Firewall mark set on captured traffic
    #[serde(default = "default_mark")]
    pub mark: u32,
    /// Mangle chain name
    #[serde(default = "default_chain")]
    pub chain: String,
    /// ipset holding the member addresses
    #[serde(default = "default_ipset")]
    pub ipset: String,
    /// Policy routing table for marked traffic
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_table: Option<u32>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_icmp_type() -> String {
    "echo-reply".to_string()
}

fn default_size_limit() -> usize {
    overturn_core::DEFAULT_SIZE_LIMIT
}

fn default_true() -> bool {
    true
}

fn default_mark() -> u32 {
    0x66
}

fn default_chain() -> String {
    "OVERTURN_CAPTURE".to_string()
}

fn default_ipset() -> String {
    "overturned".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            queues: 0,
            icmp_type: default_icmp_type(),
            size_limit: default_size_limit(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mark: default_mark(),
            chain: default_chain(),
            ipset: default_ipset(),
            route_table: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Maximum link queue count
pub const MAX_QUEUES: usize = 256;

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file.
    ///
    /// The file is written next to its destination and renamed over it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)?;

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp = temp_path(path);
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathBuf::from("/etc/ovt_net.toml")
    }

    /// The active network and its name
    ///
    /// # Errors
    ///
    /// Returns `ClusterError::NoActiveNetwork` if no network is selected or
    /// the selected one is missing.
    pub fn active_network(&self) -> Result<(&str, &NetworkConfig), ClusterError> {
        if self.active.is_empty() {
            return Err(ClusterError::NoActiveNetwork(
                "no network selected".to_string(),
            ));
        }
        self.network
            .get_key_value(&self.active)
            .map(|(name, network)| (name.as_str(), network))
            .ok_or_else(|| ClusterError::NoActiveNetwork(self.active.clone()))
    }

    /// Parse the ICMP bind address
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not an IPv4 address.
    pub fn bind_address(&self) -> anyhow::Result<Ipv4Addr> {
        self.transport.bind_address.parse().map_err(|_| {
            anyhow::anyhow!(
                "Invalid bind address: {} (expected an IPv4 address)",
                self.transport.bind_address
            )
        })
    }

    /// Parse the outbound ICMP type
    ///
    /// # Errors
    ///
    /// Returns an error for anything but "echo-reply" or "echo".
    pub fn icmp_type(&self) -> anyhow::Result<IcmpType> {
        self.transport
            .icmp_type
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
    }

    /// Parse the machine identity override
    ///
    /// # Errors
    ///
    /// Returns `ClusterError::InvalidMachineId` if the override is not a UUID.
    pub fn machine_id(&self) -> Result<Option<Uuid>, ClusterError> {
        self.machine_id
            .as_deref()
            .map(|raw| {
                Uuid::parse_str(raw.trim())
                    .map_err(|_| ClusterError::InvalidMachineId(raw.to_string()))
            })
            .transpose()
    }

    /// Validate configuration
    ///
    /// `default_period_ms` and `default_timeout_ms` stand in for heartbeat
    /// values the active network leaves at 0.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self, default_period_ms: u32, default_timeout_ms: u32) -> anyhow::Result<()> {
        let (_, network) = self.active_network()?;
        let network = network
            .clone()
            .with_heartbeat_defaults(default_period_ms, default_timeout_ms);

        if network.heartbeat_period_ms == 0 {
            anyhow::bail!("Heartbeat period must be positive");
        }
        if network.heartbeat_timeout_ms <= network.heartbeat_period_ms {
            anyhow::bail!(
                "Heartbeat timeout ({} ms) must exceed the heartbeat period ({} ms)",
                network.heartbeat_timeout_ms,
                network.heartbeat_period_ms
            );
        }

        self.bind_address()?;
        self.icmp_type()?;
        self.machine_id()?;

        if self.transport.queues > MAX_QUEUES {
            anyhow::bail!("Queue count must be between 0 and {}", MAX_QUEUES);
        }
        if self.transport.size_limit <= HEADER_SIZE {
            anyhow::bail!("Size limit must exceed the {} byte header", HEADER_SIZE);
        }

        if self.capture.enabled {
            // iptables and ipset name limits
            if self.capture.chain.is_empty() || self.capture.chain.len() > 28 {
                anyhow::bail!("Capture chain name must be 1 to 28 characters");
            }
            if self.capture.ipset.is_empty() || self.capture.ipset.len() > 31 {
                anyhow::bail!("Capture ipset name must be 1 to 31 characters");
            }
            if self.capture.mark == 0 {
                anyhow::bail!("Capture mark must be non-zero");
            }
        }

        // Validate log level
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
