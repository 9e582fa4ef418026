//! Display and monitoring preferences pushed during configuration.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Nightly window during which the tracker keeps its display quiet.
///
/// Wraps past midnight when `end < start` (e.g. 22:00–08:00).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawQuietHours")]
pub struct QuietHoursWindow {
    start: NaiveTime,
    end: NaiveTime,
}

#[derive(Deserialize)]
struct RawQuietHours {
    start: NaiveTime,
    end: NaiveTime,
}

impl TryFrom<RawQuietHours> for QuietHoursWindow {
    type Error = ValidationError;

    fn try_from(raw: RawQuietHours) -> Result<Self, Self::Error> {
        Self::new(raw.start, raw.end)
    }
}

impl QuietHoursWindow {
    /// # Errors
    ///
    /// Returns [`ValidationError::DegenerateQuietHours`] when `start == end`.
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, ValidationError> {
        if start == end {
            return Err(ValidationError::DegenerateQuietHours);
        }
        Ok(Self { start, end })
    }

    #[must_use]
    pub fn start(&self) -> NaiveTime {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> NaiveTime {
        self.end
    }

    /// Whether `time` falls inside the window (start inclusive, end exclusive).
    #[must_use]
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start < self.end {
            self.start <= time && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

impl Default for QuietHoursWindow {
    fn default() -> Self {
        Self {
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap_or_default(),
            end: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or_default(),
        }
    }
}

/// A page of the tracker's carousel (the clock face is always first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Screen {
    Notifications,
    Weather,
    Activity,
    More,
    Status,
    HeartRate,
    Timer,
}

impl Screen {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Notifications => "notifications",
            Self::Weather => "weather",
            Self::Activity => "activity",
            Self::More => "more",
            Self::Status => "status",
            Self::HeartRate => "heart_rate",
            Self::Timer => "timer",
        }
    }
}

impl fmt::Display for Screen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Screen {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "notifications" => Ok(Self::Notifications),
            "weather" => Ok(Self::Weather),
            "activity" => Ok(Self::Activity),
            "more" => Ok(Self::More),
            "status" => Ok(Self::Status),
            "heart_rate" | "heartrate" => Ok(Self::HeartRate),
            "timer" => Ok(Self::Timer),
            _ => Err(ValidationError::UnknownValue {
                field: "screen",
                value: s.to_owned(),
            }),
        }
    }
}

/// Ordered, duplicate-free list of screens in on-device display order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Screen>", into = "Vec<Screen>")]
pub struct ScreenLayout(Vec<Screen>);

impl ScreenLayout {
    /// # Errors
    ///
    /// Returns [`ValidationError::DuplicateScreen`] if a screen repeats.
    pub fn new(screens: Vec<Screen>) -> Result<Self, ValidationError> {
        for (index, screen) in screens.iter().enumerate() {
            if screens[..index].contains(screen) {
                return Err(ValidationError::DuplicateScreen(screen.as_str()));
            }
        }
        Ok(Self(screens))
    }

    #[must_use]
    pub fn screens(&self) -> &[Screen] {
        &self.0
    }

    /// 1-based display position of `screen`, if present.
    #[must_use]
    pub fn position(&self, screen: Screen) -> Option<usize> {
        self.0.iter().position(|s| *s == screen).map(|p| p + 1)
    }
}

impl Default for ScreenLayout {
    fn default() -> Self {
        Self(vec![Screen::Activity, Screen::HeartRate, Screen::Status])
    }
}

impl TryFrom<Vec<Screen>> for ScreenLayout {
    type Error = ValidationError;

    fn try_from(screens: Vec<Screen>) -> Result<Self, Self::Error> {
        Self::new(screens)
    }
}

impl From<ScreenLayout> for Vec<Screen> {
    fn from(layout: ScreenLayout) -> Self {
        layout.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateFormat {
    #[default]
    DayMonthYear,
    MonthDayYear,
    YearMonthDay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceUnit {
    #[default]
    Metric,
    Imperial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeFormat {
    #[default]
    #[serde(rename = "24h")]
    TwentyFourHour,
    #[serde(rename = "12h")]
    TwelveHour,
}

/// Everything configured on the tracker besides the user profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub date_format: DateFormat,
    pub distance_unit: DistanceUnit,
    pub time_format: TimeFormat,
    pub quiet_hours: QuietHoursWindow,
    /// Let the tracker raise its heart-rate sampling while the wearer sleeps.
    pub sleep_heart_rate: bool,
    pub screens: ScreenLayout,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            date_format: DateFormat::default(),
            distance_unit: DistanceUnit::default(),
            time_format: TimeFormat::default(),
            quiet_hours: QuietHoursWindow::default(),
            sleep_heart_rate: true,
            screens: ScreenLayout::default(),
        }
    }
}
