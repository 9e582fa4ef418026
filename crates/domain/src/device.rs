//! Device: a physical tracker, as seen during discovery and once connected.

use serde::{Deserialize, Serialize};

use crate::address::DeviceAddress;
use crate::key::AuthKey;
use crate::time::Timestamp;

/// A tracker seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub address: DeviceAddress,
    /// Advertised local name.
    pub name: String,
    /// Signal strength, for caller-side ranking only.
    pub rssi: Option<i16>,
}

impl DiscoveredDevice {
    /// Turn the discovery result into a handle without a key.
    #[must_use]
    pub fn into_handle(self) -> DeviceHandle {
        DeviceHandle::new(self.address)
    }
}

/// Identifies one physical tracker and carries its authentication material.
///
/// The key lives here, on the handle, and nowhere else in the process.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    address: DeviceAddress,
    key: Option<AuthKey>,
}

impl DeviceHandle {
    /// Handle for a device that has never been paired.
    #[must_use]
    pub fn new(address: DeviceAddress) -> Self {
        Self { address, key: None }
    }

    /// Handle for a previously paired device.
    #[must_use]
    pub fn with_key(address: DeviceAddress, key: AuthKey) -> Self {
        Self {
            address,
            key: Some(key),
        }
    }

    #[must_use]
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    #[must_use]
    pub fn key(&self) -> Option<&AuthKey> {
        self.key.as_ref()
    }

    /// Replace the key (first pairing or re-pairing).
    pub fn set_key(&mut self, key: AuthKey) {
        self.key = Some(key);
    }
}

/// Battery state reported by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryStatus {
    /// Charge level, 0–100 %.
    pub level: u8,
    pub charging: bool,
}

/// Static and slow-changing information about a connected tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub address: DeviceAddress,
    pub battery: BatteryStatus,
    pub hardware_revision: String,
    pub firmware_revision: String,
    /// The tracker's own clock, converted to UTC.
    pub clock: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_create_handle_without_key_from_discovery() {
        let discovered = DiscoveredDevice {
            address: DeviceAddress::new([1, 2, 3, 4, 5, 6]),
            name: "Mi Band 3".to_owned(),
            rssi: Some(-60),
        };
        let handle = discovered.into_handle();
        assert_eq!(handle.address(), DeviceAddress::new([1, 2, 3, 4, 5, 6]));
        assert!(handle.key().is_none());
    }

    #[test]
    fn should_replace_key_on_handle() {
        let mut handle = DeviceHandle::with_key(DeviceAddress::default(), AuthKey::new([1; 16]));
        handle.set_key(AuthKey::new([2; 16]));
        assert_eq!(handle.key(), Some(&AuthKey::new([2; 16])));
    }
}
