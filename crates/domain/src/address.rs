//! Radio address of a tracker.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// 6-byte BLE device address, most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    /// Wrap raw address bytes.
    #[must_use]
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Access the raw address bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> [u8; 6] {
        self.0
    }

    /// Lowercase form without separators (e.g. `"a4c1385b0edf"`).
    #[must_use]
    pub fn slug(&self) -> String {
        let [a, b, c, d, e, f] = self.0;
        format!("{a:02x}{b:02x}{c:02x}{d:02x}{e:02x}{f:02x}")
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for DeviceAddress {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidAddress(s.to_owned());
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in &mut bytes {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(bytes))
    }
}

impl Serialize for DeviceAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_format_address_with_colons() {
        let addr = DeviceAddress::new([0xA4, 0xC1, 0x38, 0x5B, 0x0E, 0xDF]);
        assert_eq!(addr.to_string(), "A4:C1:38:5B:0E:DF");
    }

    #[test]
    fn should_format_slug_with_leading_zeros() {
        let addr = DeviceAddress::new([0x00, 0x01, 0x02, 0x0A, 0x0B, 0x0C]);
        assert_eq!(addr.to_string(), "00:01:02:0A:0B:0C");
        assert_eq!(addr.slug(), "0001020a0b0c");
    }

    #[test]
    fn should_parse_address_case_insensitively() {
        let addr: DeviceAddress = "e7:2a:10:0f:3c:9b".parse().unwrap();
        assert_eq!(addr.as_bytes(), [0xE7, 0x2A, 0x10, 0x0F, 0x3C, 0x9B]);
    }

    #[test]
    fn should_reject_malformed_addresses() {
        for input in ["", "E7:2A:10:0F:3C", "E7:2A:10:0F:3C:9B:00", "E7-2A-10-0F-3C-9B", "G7:2A:10:0F:3C:9B"] {
            assert!(
                matches!(
                    input.parse::<DeviceAddress>(),
                    Err(ValidationError::InvalidAddress(_))
                ),
                "{input}"
            );
        }
    }

    #[test]
    fn should_roundtrip_through_serde_json() {
        let addr = DeviceAddress::new([1, 2, 3, 4, 5, 6]);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"01:02:03:04:05:06\"");
        let parsed: DeviceAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, addr);
    }
}
