//! BLE adapter configuration.

use serde::Deserialize;

/// Which host radio to use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Index into the host's adapter list; the first adapter by default.
    pub adapter_index: usize,
}
