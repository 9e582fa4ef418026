//! What the simulated tracker holds and how it misbehaves.

use std::time::Duration;

use chrono::{Duration as Minutes, TimeZone, Utc};
use uuid::Uuid;

use bandlink_app::protocol::codec::RawActivitySample;
use bandlink_domain::address::DeviceAddress;
use bandlink_domain::device::BatteryStatus;
use bandlink_domain::key::AuthKey;
use bandlink_domain::time::{self, Timestamp};

/// Recorded minutes, the first one at `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct History {
    pub start: Timestamp,
    pub minutes: Vec<RawActivitySample>,
}

impl History {
    /// Timestamp of minute `index`.
    #[must_use]
    pub fn minute(&self, index: usize) -> Timestamp {
        let offset = i64::try_from(index).unwrap_or(i64::MAX);
        self.start + Minutes::minutes(offset)
    }
}

impl Default for History {
    /// One demo hour on 2024-03-01 from 08:00 UTC, with a few
    /// not-worn minutes.
    fn default() -> Self {
        let start = Utc
            .with_ymd_and_hms(2024, 3, 1, 8, 0, 0)
            .single()
            .unwrap_or_default();
        let minutes = (0u8..60)
            .map(|i| RawActivitySample {
                kind: if i % 15 == 14 { 0x70 } else { 0x01 },
                intensity: 20 + i,
                steps: i % 7 * 10,
                heart_rate: if i % 15 == 14 { 0xff } else { 60 + i / 2 },
            })
            .collect();
        Self { start, minutes }
    }
}

/// The simulated tracker.
#[derive(Debug, Clone)]
pub struct VirtualBand {
    pub address: DeviceAddress,
    pub name: String,
    pub battery: BatteryStatus,
    pub hardware_revision: String,
    pub firmware_revision: String,
    /// Key the band was paired with, if any.
    pub key: Option<AuthKey>,
    pub clock: Timestamp,
    pub history: History,
    /// Raw values cycled through while live measurement runs.
    pub heart_rates: Vec<u8>,
    pub heart_rate_period: Duration,
}

impl Default for VirtualBand {
    fn default() -> Self {
        Self {
            address: DeviceAddress::new([0xc8, 0x0f, 0x10, 0x3b, 0x4a, 0x21]),
            name: "Mi Band 3".to_owned(),
            battery: BatteryStatus {
                level: 87,
                charging: false,
            },
            hardware_revision: "V0.1.3.3".to_owned(),
            firmware_revision: "V2.4.0.20".to_owned(),
            key: None,
            clock: time::now(),
            history: History::default(),
            heart_rates: vec![72, 74, 0, 77, 255, 75],
            heart_rate_period: Duration::from_secs(1),
        }
    }
}

/// Failures the simulated tracker can be told to produce.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Faults {
    /// Answer the key exchange with a failure status.
    pub reject_pairing: bool,
    /// Fail every write whose bytes start with this prefix.
    pub fail_prefix: Option<Vec<u8>>,
    /// Announce history but never send it.
    pub stall_history: bool,
}

/// Everything the host did to the tracker, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Journal {
    pub writes: Vec<(Uuid, Vec<u8>)>,
    pub unsubscribes: Vec<Uuid>,
    pub stop_scans: usize,
}

impl Journal {
    /// Written bytes, regardless of characteristic.
    #[must_use]
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.writes.iter().map(|(_, bytes)| bytes.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_timestamp_history_minutes() {
        let history = History::default();
        assert_eq!(history.minutes.len(), 60);
        assert_eq!(history.minute(0), history.start);
        assert_eq!(
            history.minute(90),
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap()
        );
    }

    #[test]
    fn should_include_not_worn_minutes() {
        let history = History::default();
        assert_eq!(history.minutes[14].heart_rate, 0xff);
        assert_eq!(history.minutes[0].heart_rate, 60);
    }
}
