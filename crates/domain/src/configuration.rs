//! Configuration steps, in the order the tracker must receive them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One write of the ordered configuration sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigStep {
    Language,
    DateFormat,
    DistanceUnit,
    TimeFormat,
    CurrentTime,
    QuietHours,
    SleepHeartRate,
    Screens,
    HeartRateInterval,
    UserInfo,
}

impl ConfigStep {
    /// Every step, in issue order.
    pub const SEQUENCE: [Self; 10] = [
        Self::Language,
        Self::DateFormat,
        Self::DistanceUnit,
        Self::TimeFormat,
        Self::CurrentTime,
        Self::QuietHours,
        Self::SleepHeartRate,
        Self::Screens,
        Self::HeartRateInterval,
        Self::UserInfo,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Language => "language",
            Self::DateFormat => "date_format",
            Self::DistanceUnit => "distance_unit",
            Self::TimeFormat => "time_format",
            Self::CurrentTime => "current_time",
            Self::QuietHours => "quiet_hours",
            Self::SleepHeartRate => "sleep_heart_rate",
            Self::Screens => "screens",
            Self::HeartRateInterval => "heart_rate_interval",
            Self::UserInfo => "user_info",
        }
    }
}

impl fmt::Display for ConfigStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_end_sequence_with_user_info() {
        assert_eq!(ConfigStep::SEQUENCE.len(), 10);
        assert_eq!(ConfigStep::SEQUENCE[0], ConfigStep::Language);
        assert_eq!(ConfigStep::SEQUENCE[9], ConfigStep::UserInfo);
    }

    #[test]
    fn should_serialize_as_snake_case() {
        let json = serde_json::to_string(&ConfigStep::HeartRateInterval).unwrap();
        assert_eq!(json, "\"heart_rate_interval\"");
    }
}
