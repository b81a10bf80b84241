//! Configuration options for the OMAPI transport

use serde::{Deserialize, Serialize};

use crate::service::ServiceVersion;

/// Default name under which the plugin registers
pub const DEFAULT_PLUGIN_NAME: &str = "AndroidOmapiPlugin";

/// First SIMalliance OMAPI version accepting a non-zero P2 on a logical channel
pub const CONTROL_MASK_MIN_VERSION: ServiceVersion = ServiceVersion::new(3, 0);

/// Configuration options for the OMAPI plugin and its readers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OmapiConfig {
    /// Name reported by the plugin
    pub plugin_name: String,

    /// Minimum SIMalliance service version for a non-zero ISO control mask
    pub control_mask_min_version: ServiceVersion,

    /// Log APDU traffic at trace level
    pub trace_apdus: bool,
}

impl Default for OmapiConfig {
    fn default() -> Self {
        Self {
            plugin_name: DEFAULT_PLUGIN_NAME.to_string(),
            control_mask_min_version: CONTROL_MASK_MIN_VERSION,
            trace_apdus: true,
        }
    }
}

impl OmapiConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the plugin name
    pub fn with_plugin_name<S: Into<String>>(mut self, name: S) -> Self {
        self.plugin_name = name.into();
        self
    }

    /// Set the minimum service version for a non-zero control mask
    pub const fn with_control_mask_min_version(mut self, version: ServiceVersion) -> Self {
        self.control_mask_min_version = version;
        self
    }

    /// Set whether APDU traffic is logged
    pub const fn with_trace_apdus(mut self, trace_apdus: bool) -> Self {
        self.trace_apdus = trace_apdus;
        self
    }
}
