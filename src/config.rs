//! Link and search configuration.
//!
//! The link configuration lives in a small YAML file:
//!
//! ```yaml
//! interface: eth1
//! host: 00:1b:21:3a:4f:10     # optional, read from the interface when absent
//! device: 00:0a:35:02:2a:42
//! overflow_settle_ms: 100
//! iteration_pause_ms: 500
//! ```
//!
//! Every key is optional; missing keys take the defaults above.

use crate::transport::MacAddress;
use crate::{LinkError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Factory address of the accelerator board.
pub const DEFAULT_DEVICE_MAC: MacAddress = MacAddress::new([0x00, 0x0a, 0x35, 0x02, 0x2a, 0x42]);

/// Where the accelerator is and how to pace it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkConfig {
    /// Interface the accelerator is cabled to.
    pub interface: String,
    /// Host address; the interface's own address when `None`.
    pub host: Option<MacAddress>,
    /// Accelerator address.
    pub device: MacAddress,
    /// Pause after an overflow drain before streaming resumes.
    pub overflow_settle_ms: u64,
    /// Pause after every finished iteration.
    pub iteration_pause_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            interface: "eth1".to_string(),
            host: None,
            device: DEFAULT_DEVICE_MAC,
            overflow_settle_ms: 100,
            iteration_pause_ms: 500,
        }
    }
}

impl LinkConfig {
    /// Load a YAML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| LinkError::file_error(path, e))?;
        let config = Self::from_yaml(&text)?;
        debug!(path = %path.display(), ?config, "Loaded link configuration");
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(text).map_err(|e| LinkError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.interface.trim().is_empty() {
            return Err(LinkError::config("interface must not be empty"));
        }
        if self.device.octets()[0] & 0x01 != 0 {
            return Err(LinkError::config(format!("device address {} is a group address", self.device)));
        }
        Ok(())
    }

    pub fn overflow_settle(&self) -> Duration {
        Duration::from_millis(self.overflow_settle_ms)
    }

    pub fn iteration_pause(&self) -> Duration {
        Duration::from_millis(self.iteration_pause_ms)
    }
}

/// How to search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOptions {
    /// Mismatches allowed for reads without their own limit.
    pub mismatches: u8,
    /// Ask the device for individual match positions.
    pub report_positions: bool,
    /// Write SAM instead of the plain position list.
    pub sam: bool,
    /// Write `.map` and `.unmap` summaries.
    pub map_files: bool,
    /// Log progress for every streamed sequence.
    pub status: bool,
    /// Pause after every finished iteration.
    pub iteration_pause: Duration,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            mismatches: 0,
            report_positions: true,
            sam: false,
            map_files: false,
            status: false,
            iteration_pause: Duration::from_millis(500),
        }
    }
}
