//! Configuration loading: TOML file with environment variable overrides.
//!
//! Looks for `bandlink.toml` in the working directory unless `--config`
//! names another file. Every field has a default so the file is optional.
//! Environment variables take precedence over file values.

use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Deserialize;

use bandlink_app::services::session::Timeouts;
use bandlink_domain::address::DeviceAddress;
use bandlink_domain::error::ValidationError;
use bandlink_domain::key::AuthKey;
use bandlink_domain::preferences::Preferences;
use bandlink_domain::profile::{Language, Sex, UserProfile};

const DEFAULT_PATH: &str = "bandlink.toml";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub scan: ScanConfig,
    pub timeouts: TimeoutsConfig,
    pub user: UserConfig,
    /// Band settings pushed by `configure`.
    pub preferences: Preferences,
    pub logging: LoggingConfig,
}

/// Which band to talk to.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// `AA:BB:CC:DD:EE:FF`; when unset, the first band found by a scan is used.
    pub address: Option<String>,
    /// 32 hex characters; when unset, the band is paired from scratch.
    pub key: Option<String>,
    /// Advertised name to match while scanning.
    pub name: String,
    /// Index of the host BLE adapter.
    pub adapter_index: usize,
    /// Minutes between automatic heart-rate measurements, `0` for off.
    pub heart_rate_interval: u8,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub timeout_ms: u64,
}

/// Operation limits, in milliseconds.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub connect_ms: u64,
    pub command_ms: u64,
    pub pairing_ms: u64,
    pub fetch_stall_ms: u64,
    pub heart_rate_ping_ms: u64,
}

/// The wearer.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub height_cm: u16,
    pub weight_kg: f32,
    pub date_of_birth: NaiveDate,
    pub sex: Sex,
    pub language: Language,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`RUST_LOG` syntax).
    pub filter: String,
}

impl Config {
    /// Load `path` (or `bandlink.toml`), then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is malformed, if an explicitly named file
    /// is missing, or if validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path, false)?,
            None => Self::from_file(Path::new(DEFAULT_PATH), true)?,
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path, optional: bool) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(err) if optional && err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("BANDLINK_ADDRESS") {
            self.device.address = Some(val);
        }
        if let Some(val) = lookup("BANDLINK_KEY") {
            self.device.key = Some(val);
        }
        if let Some(val) = lookup("BANDLINK_SCAN_TIMEOUT_MS") {
            if let Ok(timeout_ms) = val.parse() {
                self.scan.timeout_ms = timeout_ms;
            }
        }
        if let Some(val) = lookup("BANDLINK_LOG") {
            self.logging.filter = val;
        }
        if let Some(val) = lookup("RUST_LOG") {
            self.logging.filter = val;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.address()?;
        self.key()?;
        if self.scan.timeout_ms == 0 {
            return Err(ConfigError::Validation("scan.timeout_ms must be non-zero".to_owned()));
        }
        let timeouts = &self.timeouts;
        for (name, value) in [
            ("connect_ms", timeouts.connect_ms),
            ("command_ms", timeouts.command_ms),
            ("pairing_ms", timeouts.pairing_ms),
            ("fetch_stall_ms", timeouts.fetch_stall_ms),
            ("heart_rate_ping_ms", timeouts.heart_rate_ping_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!("timeouts.{name} must be non-zero")));
            }
        }
        self.user.profile()?;
        Ok(())
    }

    /// The configured address, if any.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed address.
    pub fn address(&self) -> Result<Option<DeviceAddress>, ConfigError> {
        Ok(self.device.address.as_deref().map(str::parse).transpose()?)
    }

    /// The configured key, if any.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed key.
    pub fn key(&self) -> Result<Option<AuthKey>, ConfigError> {
        Ok(self.device.key.as_deref().map(str::parse).transpose()?)
    }

    #[must_use]
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan.timeout_ms)
    }
}

impl TimeoutsConfig {
    #[must_use]
    pub fn to_timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(self.connect_ms),
            command: Duration::from_millis(self.command_ms),
            pairing: Duration::from_millis(self.pairing_ms),
            fetch_stall: Duration::from_millis(self.fetch_stall_ms),
            heart_rate_ping: Duration::from_millis(self.heart_rate_ping_ms),
        }
    }
}

impl UserConfig {
    /// # Errors
    ///
    /// Returns the first field that is out of range.
    pub fn profile(&self) -> Result<UserProfile, ValidationError> {
        UserProfile::builder()
            .height_cm(self.height_cm)
            .weight_kg(self.weight_kg)
            .date_of_birth(self.date_of_birth)
            .sex(self.sex)
            .language(self.language)
            .build()
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: None,
            key: None,
            name: "Mi Band 3".to_owned(),
            adapter_index: 0,
            heart_rate_interval: 10,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        let defaults = Timeouts::default();
        #[allow(clippy::cast_possible_truncation)]
        let ms = |limit: Duration| limit.as_millis() as u64;
        Self {
            connect_ms: ms(defaults.connect),
            command_ms: ms(defaults.command),
            pairing_ms: ms(defaults.pairing),
            fetch_stall_ms: ms(defaults.fetch_stall),
            heart_rate_ping_ms: ms(defaults.heart_rate_ping),
        }
    }
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            height_cm: 170,
            weight_kg: 70.0,
            date_of_birth: NaiveDate::from_ymd_opt(1990, 1, 1).unwrap_or_default(),
            sex: Sex::Male,
            language: Language::English,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "bandlink=info,bandlink_app=info,bandlink_adapter_ble=info".to_owned(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parse failure.
    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
    /// File I/O failure.
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    /// A value the domain rejects.
    #[error("invalid configuration")]
    Invalid(#[from] ValidationError),
    /// Semantic validation failure.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bandlink_domain::preferences::{DateFormat, Screen};

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn should_produce_sensible_defaults() {
        let config = Config::default();
        assert_eq!(config.device.name, "Mi Band 3");
        assert_eq!(config.scan.timeout_ms, 10_000);
        assert_eq!(config.timeouts.command_ms, 5_000);
        assert_eq!(config.timeouts.to_timeouts(), Timeouts::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn should_parse_minimal_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.device.heart_rate_interval, 10);
        assert!(config.address().unwrap().is_none());
    }

    #[test]
    fn should_parse_full_toml() {
        let toml = "
            [device]
            address = 'C8:0F:10:3B:4A:21'
            key = '000102030405060708090a0b0c0d0e0f'
            heart_rate_interval = 0

            [scan]
            timeout_ms = 3000

            [timeouts]
            pairing_ms = 60000

            [user]
            height_cm = 182
            weight_kg = 81.5
            date_of_birth = '1984-11-02'
            sex = 'female'
            language = 'de'

            [preferences]
            date_format = 'year_month_day'
            time_format = '12h'
            screens = ['activity', 'heart_rate']

            [logging]
            filter = 'debug'
        ";
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(
            config.address().unwrap(),
            Some(DeviceAddress::new([0xc8, 0x0f, 0x10, 0x3b, 0x4a, 0x21]))
        );
        assert_eq!(config.key().unwrap().unwrap().as_bytes()[15], 0x0f);
        assert_eq!(config.device.heart_rate_interval, 0);
        assert_eq!(config.scan_timeout(), Duration::from_secs(3));
        assert_eq!(config.timeouts.to_timeouts().pairing, Duration::from_secs(60));
        assert_eq!(config.timeouts.command_ms, 5_000);
        let profile = config.user.profile().unwrap();
        assert_eq!(profile.language, Language::German);
        assert_eq!(profile.sex, Sex::Female);
        assert_eq!(config.preferences.date_format, DateFormat::YearMonthDay);
        assert_eq!(
            config.preferences.screens.screens(),
            &[Screen::Activity, Screen::HeartRate]
        );
        assert_eq!(config.logging.filter, "debug");
    }

    #[test]
    fn should_return_default_when_default_file_missing() {
        let config = Config::from_file(Path::new("nonexistent.toml"), true).unwrap();
        assert_eq!(config.scan.timeout_ms, 10_000);
    }

    #[test]
    fn should_fail_when_named_file_missing() {
        let err = Config::from_file(Path::new("nonexistent.toml"), false).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn should_apply_env_overrides() {
        let mut config = Config::default();
        config.apply_env_overrides(env(&[
            ("BANDLINK_ADDRESS", "01:02:03:04:05:06"),
            ("BANDLINK_KEY", "ffffffffffffffffffffffffffffffff"),
            ("BANDLINK_SCAN_TIMEOUT_MS", "2500"),
            ("BANDLINK_LOG", "bandlink=debug"),
        ]));
        assert_eq!(
            config.address().unwrap(),
            Some(DeviceAddress::new([1, 2, 3, 4, 5, 6]))
        );
        assert_eq!(config.key().unwrap(), Some(AuthKey::new([0xff; 16])));
        assert_eq!(config.scan.timeout_ms, 2500);
        assert_eq!(config.logging.filter, "bandlink=debug");
    }

    #[test]
    fn should_prefer_rust_log_over_bandlink_log() {
        let mut config = Config::default();
        config.apply_env_overrides(env(&[("BANDLINK_LOG", "warn"), ("RUST_LOG", "trace")]));
        assert_eq!(config.logging.filter, "trace");
    }

    #[test]
    fn should_ignore_unparsable_scan_timeout() {
        let mut config = Config::default();
        config.apply_env_overrides(env(&[("BANDLINK_SCAN_TIMEOUT_MS", "soon")]));
        assert_eq!(config.scan.timeout_ms, 10_000);
    }

    #[test]
    fn should_reject_malformed_key() {
        let mut config = Config::default();
        config.device.key = Some("abc".to_owned());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(ValidationError::InvalidKey))
        ));
    }

    #[test]
    fn should_reject_zero_timeout() {
        let mut config = Config::default();
        config.timeouts.fetch_stall_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn should_reject_out_of_range_user() {
        let mut config = Config::default();
        config.user.height_cm = 20;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(ValidationError::OutOfRange { field: "height_cm", .. }))
        ));
    }
}
