//! Domain configuration

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    config::{DEFAULT_CREATION_TIMEOUT, DEFAULT_MONITOR_INTERVAL},
    error::{Result, SeuratError},
    memory::default_root,
    topic::validate_name,
};

/// Configuration of a domain handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Domain name; a directory below `root_dir`
    pub name: String,
    /// Directory holding every domain
    pub root_dir: PathBuf,
    /// How long to wait for a concurrent segment creator
    pub creation_timeout: Duration,
    /// Endpoints whose heartbeat is older than this count as dead even if
    /// their process exists. `None` relies on the process check alone.
    pub heartbeat_timeout: Option<Duration>,
    /// Interval of the background liveness monitor
    pub monitor_interval: Duration,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            root_dir: default_root(),
            creation_timeout: DEFAULT_CREATION_TIMEOUT,
            heartbeat_timeout: None,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
        }
    }
}

impl DomainConfig {
    /// Configuration for `name` below the default root (`SEURAT_ROOT` or
    /// the platform shared memory directory)
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the root directory
    pub fn with_root_dir(mut self, root: impl Into<PathBuf>) -> Self {
        self.root_dir = root.into();
        self
    }

    /// Set the creation timeout
    pub fn with_creation_timeout(mut self, timeout: Duration) -> Self {
        self.creation_timeout = timeout;
        self
    }

    /// Set the heartbeat staleness threshold
    pub fn with_heartbeat_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Set the liveness monitor interval
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_name("domain", &self.name)?;

        if self.root_dir.as_os_str().is_empty() {
            return Err(SeuratError::invalid_parameter(
                "root_dir",
                "Root directory cannot be empty",
            ));
        }

        if self.creation_timeout.is_zero() {
            return Err(SeuratError::invalid_parameter(
                "creation_timeout",
                "Creation timeout must be greater than 0",
            ));
        }

        if self.monitor_interval.is_zero() {
            return Err(SeuratError::invalid_parameter(
                "monitor_interval",
                "Monitor interval must be greater than 0",
            ));
        }

        if let Some(timeout) = self.heartbeat_timeout {
            if timeout <= self.monitor_interval {
                return Err(SeuratError::invalid_parameter(
                    "heartbeat_timeout",
                    "Heartbeat timeout must exceed the monitor interval",
                ));
            }
        }

        Ok(())
    }
}
