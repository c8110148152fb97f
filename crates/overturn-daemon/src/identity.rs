//! Stable identity of the local machine.

use std::fs;
use std::path::{Path, PathBuf};

use overturn_core::ClusterError;
use uuid::Uuid;

use crate::manager::ManagerError;

/// Source of the local node identifier
pub trait MachineIdentity {
    /// Identifier of this machine, stable across restarts
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Identity` if no identity source is readable or
    /// `ClusterError::InvalidMachineId` if its content is not a UUID.
    fn machine_id(&self) -> Result<Uuid, ManagerError>;
}

/// Reads the systemd/D-Bus machine id
#[derive(Debug, Clone)]
pub struct SystemIdentity {
    paths: Vec<PathBuf>,
}

impl SystemIdentity {
    /// Identity read from `/etc/machine-id`, else `/var/lib/dbus/machine-id`
    pub fn new() -> Self {
        Self::with_paths(["/etc/machine-id", "/var/lib/dbus/machine-id"])
    }

    /// Identity read from the first readable of `paths`
    pub fn with_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self {
            paths: paths.into_iter().map(|p| p.as_ref().to_path_buf()).collect(),
        }
    }
}

impl Default for SystemIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl MachineIdentity for SystemIdentity {
    fn machine_id(&self) -> Result<Uuid, ManagerError> {
        let mut last_error = None;
        for path in &self.paths {
            match fs::read_to_string(path) {
                Ok(contents) => return Ok(parse_machine_id(&contents)?),
                Err(e) => last_error = Some(format!("{}: {e}", path.display())),
            }
        }
        Err(ManagerError::Identity(
            last_error.unwrap_or_else(|| "no machine id source".to_string()),
        ))
    }
}

/// Fixed identity from configuration
#[derive(Debug, Clone, Copy)]
pub struct FixedIdentity(pub Uuid);

impl MachineIdentity for FixedIdentity {
    fn machine_id(&self) -> Result<Uuid, ManagerError> {
        Ok(self.0)
    }
}

/// Parse machine-id file content (32 hex digits, optional newline)
pub fn parse_machine_id(contents: &str) -> Result<Uuid, ClusterError> {
    let trimmed = contents.trim();
    Uuid::parse_str(trimmed).map_err(|_| ClusterError::InvalidMachineId(trimmed.to_string()))
}
