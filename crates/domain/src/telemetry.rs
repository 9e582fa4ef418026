//! Telemetry samples handed to callers.

use serde::{Deserialize, Serialize};

use crate::device::{BatteryStatus, DeviceInfo};
use crate::time::Timestamp;

/// Raw heart-rate values the tracker uses to mean "no reading".
const NO_READING: [u16; 2] = [0, 255];

/// Map a raw heart-rate value to beats per minute, `None` when absent.
///
/// Values the tracker cannot produce (above `u8::MAX`) are also dropped.
#[must_use]
pub fn heart_rate_from_raw(raw: u16) -> Option<u8> {
    if NO_READING.contains(&raw) {
        return None;
    }
    u8::try_from(raw).ok()
}

/// Activity classification byte as recorded by the tracker.
///
/// The firmware does not document the values, so they are kept verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityKind(pub u8);

/// One minute of recorded activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub kind: ActivityKind,
    pub intensity: u8,
    pub steps: u8,
    pub timestamp: Timestamp,
}

/// A single observation delivered by a telemetry operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetrySample {
    HeartRate {
        bpm: Option<u8>,
        timestamp: Timestamp,
    },
    Activity(ActivityRecord),
    Battery(BatteryStatus),
    DeviceInfo(DeviceInfo),
}

impl TelemetrySample {
    /// Heart-rate sample from a raw value, applying the no-reading rule.
    #[must_use]
    pub fn heart_rate(raw: u16, timestamp: Timestamp) -> Self {
        Self::HeartRate {
            bpm: heart_rate_from_raw(raw),
            timestamp,
        }
    }

    /// When the sample was observed, for the kinds that carry a time.
    #[must_use]
    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            Self::HeartRate { timestamp, .. } => Some(*timestamp),
            Self::Activity(record) => Some(record.timestamp),
            Self::DeviceInfo(info) => Some(info.clock),
            Self::Battery(_) => None,
        }
    }
}
