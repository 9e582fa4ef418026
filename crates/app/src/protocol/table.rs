//! Declarative protocol table: every UUID, opcode and status byte lives here.
//!
//! Services look commands up by [`CommandId`] and channels by [`Channel`];
//! nothing outside this module spells out raw protocol bytes.

use std::fmt;

use bandlink_domain::error::ProtocolError;
use bandlink_domain::preferences::Screen;
use bandlink_domain::profile::Language;
use uuid::Uuid;

/// Vendor base UUID `0000xxxx-0000-3512-2118-0009af100700`.
const fn vendor(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_3512_2118_0009_af10_0700)
}

/// Bluetooth SIG base UUID `0000xxxx-0000-1000-8000-00805f9b34fb`.
const fn sig(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_1000_8000_0080_5f9b_34fb)
}

/// A characteristic the protocol talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Auth,
    Configuration,
    FetchControl,
    ActivityData,
    Battery,
    UserSettings,
    CurrentTime,
    HeartRateMeasurement,
    HeartRateControl,
    HardwareRevision,
    FirmwareRevision,
}

impl Channel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Configuration => "configuration",
            Self::FetchControl => "fetch_control",
            Self::ActivityData => "activity_data",
            Self::Battery => "battery",
            Self::UserSettings => "user_settings",
            Self::CurrentTime => "current_time",
            Self::HeartRateMeasurement => "heart_rate_measurement",
            Self::HeartRateControl => "heart_rate_control",
            Self::HardwareRevision => "hardware_revision",
            Self::FirmwareRevision => "firmware_revision",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every command the services can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandId {
    AuthSendKey,
    AuthRequestChallenge,
    AuthSendResponse,
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
    HeartRateManual,
    HeartRateContinuous,
    HeartRatePing,
    FetchStart,
    FetchTransfer,
}

impl CommandId {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthSendKey => "auth_send_key",
            Self::AuthRequestChallenge => "auth_request_challenge",
            Self::AuthSendResponse => "auth_send_response",
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
            Self::HeartRateManual => "heart_rate_manual",
            Self::HeartRateContinuous => "heart_rate_continuous",
            Self::HeartRatePing => "heart_rate_ping",
            Self::FetchStart => "fetch_start",
            Self::FetchTransfer => "fetch_transfer",
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How many payload bytes follow a command prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadLen {
    Fixed(usize),
    Variable,
}

/// One row of the command table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub id: CommandId,
    pub channel: Channel,
    pub prefix: &'static [u8],
    pub payload_len: PayloadLen,
}

/// Status bytes found in `[response, command, status, ..]` notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCodes {
    /// First byte of every response notification.
    pub response: u8,
    pub success: u8,
    /// Reported on challenge-response when the device holds another key.
    pub mismatched_key: u8,
}

/// Display carousel encoding: bit in the enable mask and slot byte index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenSlot {
    pub screen: Screen,
    pub bit: u8,
    pub slot: usize,
}

/// A written command, ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: Channel,
    pub bytes: Vec<u8>,
}

/// Complete description of one tracker protocol generation.
#[derive(Debug)]
pub struct ProtocolTable {
    pub name: &'static str,
    /// Local name the tracker advertises.
    pub advertised_name: &'static str,
    channels: &'static [(Channel, Uuid)],
    commands: &'static [CommandSpec],
    locales: &'static [(Language, &'static str)],
    screens: &'static [ScreenSlot],
    pub status: StatusCodes,
    /// Screen payload header: mask of always-on pages, then two constant bytes.
    pub screen_header: [u8; 3],
    /// Bytes per sample in an activity data packet.
    pub activity_sample_len: usize,
    /// Weight is sent in units of 1/`weight_scale` kg.
    pub weight_scale: f32,
    /// Date format string pushed for each preference.
    pub date_formats: DateFormats,
}

/// Date pattern strings, one per `DateFormat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateFormats {
    pub day_month_year: &'static str,
    pub month_day_year: &'static str,
    pub year_month_day: &'static str,
}

impl ProtocolTable {
    /// UUID of a channel.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownChannel`] when the table has no mapping.
    pub fn uuid(&self, channel: Channel) -> Result<Uuid, ProtocolError> {
        self.channels
            .iter()
            .find(|(c, _)| *c == channel)
            .map(|(_, uuid)| *uuid)
            .ok_or(ProtocolError::UnknownChannel(channel.as_str()))
    }

    /// Row of the command table.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnsupportedCommand`] when the command is absent.
    pub fn command(&self, id: CommandId) -> Result<&CommandSpec, ProtocolError> {
        self.commands
            .iter()
            .find(|spec| spec.id == id)
            .ok_or(ProtocolError::UnsupportedCommand(id.as_str()))
    }

    /// Prefix plus payload, checked against the table's payload length.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnsupportedCommand`] for unknown commands, or
    /// [`ProtocolError::WrongLength`] when `payload` has the wrong size.
    pub fn frame(&self, id: CommandId, payload: &[u8]) -> Result<Frame, ProtocolError> {
        let spec = self.command(id)?;
        if let PayloadLen::Fixed(expected) = spec.payload_len {
            if payload.len() != expected {
                return Err(ProtocolError::WrongLength {
                    format: id.as_str(),
                    expected,
                    actual: payload.len(),
                });
            }
        }
        let mut bytes = Vec::with_capacity(spec.prefix.len() + payload.len());
        bytes.extend_from_slice(spec.prefix);
        bytes.extend_from_slice(payload);
        Ok(Frame {
            channel: spec.channel,
            bytes,
        })
    }

    /// The opcode devices echo back in responses to `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnsupportedCommand`] when the command is absent.
    pub fn opcode(&self, id: CommandId) -> Result<u8, ProtocolError> {
        self.command(id)?
            .prefix
            .first()
            .copied()
            .ok_or(ProtocolError::UnsupportedCommand(id.as_str()))
    }

    /// Firmware locale string for a language.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidField`] when the language has no locale.
    pub fn locale(&self, language: Language) -> Result<&'static str, ProtocolError> {
        self.locales
            .iter()
            .find(|(l, _)| *l == language)
            .map(|(_, locale)| *locale)
            .ok_or(ProtocolError::InvalidField {
                field: "language",
                value: 0,
            })
    }

    /// Screen carousel encoding, in slot order.
    #[must_use]
    pub fn screen_slots(&self) -> &'static [ScreenSlot] {
        self.screens
    }
}

/// Mi Band 3 (firmware 2.x).
pub static MI_BAND_3: ProtocolTable = ProtocolTable {
    name: "Mi Band 3",
    advertised_name: "Mi Band 3",
    channels: &[
        (Channel::Configuration, vendor(0x0003)),
        (Channel::FetchControl, vendor(0x0004)),
        (Channel::ActivityData, vendor(0x0005)),
        (Channel::Battery, vendor(0x0006)),
        (Channel::UserSettings, vendor(0x0008)),
        (Channel::Auth, vendor(0x0009)),
        (Channel::CurrentTime, sig(0x2a2b)),
        (Channel::HeartRateMeasurement, sig(0x2a37)),
        (Channel::HeartRateControl, sig(0x2a39)),
        (Channel::HardwareRevision, sig(0x2a27)),
        (Channel::FirmwareRevision, sig(0x2a28)),
    ],
    commands: &[
        CommandSpec {
            id: CommandId::AuthSendKey,
            channel: Channel::Auth,
            prefix: &[0x01, 0x00],
            payload_len: PayloadLen::Fixed(16),
        },
        CommandSpec {
            id: CommandId::AuthRequestChallenge,
            channel: Channel::Auth,
            prefix: &[0x02, 0x00],
            payload_len: PayloadLen::Fixed(0),
        },
        CommandSpec {
            id: CommandId::AuthSendResponse,
            channel: Channel::Auth,
            prefix: &[0x03, 0x00],
            payload_len: PayloadLen::Fixed(16),
        },
        CommandSpec {
            id: CommandId::Language,
            channel: Channel::Configuration,
            prefix: &[0x06, 0x17, 0x00],
            payload_len: PayloadLen::Variable,
        },
        CommandSpec {
            id: CommandId::DateFormat,
            channel: Channel::Configuration,
            prefix: &[0x06, 0x1e, 0x00],
            payload_len: PayloadLen::Variable,
        },
        CommandSpec {
            id: CommandId::DistanceUnit,
            channel: Channel::Configuration,
            prefix: &[0x06, 0x03, 0x00],
            payload_len: PayloadLen::Fixed(1),
        },
        CommandSpec {
            id: CommandId::TimeFormat,
            channel: Channel::Configuration,
            prefix: &[0x06, 0x02, 0x00],
            payload_len: PayloadLen::Fixed(1),
        },
        CommandSpec {
            id: CommandId::CurrentTime,
            channel: Channel::CurrentTime,
            prefix: &[],
            payload_len: PayloadLen::Fixed(11),
        },
        CommandSpec {
            id: CommandId::QuietHours,
            channel: Channel::Configuration,
            prefix: &[0x1a, 0x01],
            payload_len: PayloadLen::Fixed(4),
        },
        CommandSpec {
            id: CommandId::SleepHeartRate,
            channel: Channel::HeartRateControl,
            prefix: &[0x15, 0x00],
            payload_len: PayloadLen::Fixed(1),
        },
        CommandSpec {
            id: CommandId::Screens,
            channel: Channel::Configuration,
            prefix: &[0x0a],
            payload_len: PayloadLen::Fixed(11),
        },
        CommandSpec {
            id: CommandId::HeartRateInterval,
            channel: Channel::HeartRateControl,
            prefix: &[0x14],
            payload_len: PayloadLen::Fixed(1),
        },
        CommandSpec {
            id: CommandId::UserInfo,
            channel: Channel::UserSettings,
            prefix: &[0x4f, 0x00, 0x00],
            payload_len: PayloadLen::Fixed(9),
        },
        CommandSpec {
            id: CommandId::HeartRateManual,
            channel: Channel::HeartRateControl,
            prefix: &[0x15, 0x02],
            payload_len: PayloadLen::Fixed(1),
        },
        CommandSpec {
            id: CommandId::HeartRateContinuous,
            channel: Channel::HeartRateControl,
            prefix: &[0x15, 0x01],
            payload_len: PayloadLen::Fixed(1),
        },
        CommandSpec {
            id: CommandId::HeartRatePing,
            channel: Channel::HeartRateControl,
            prefix: &[0x16],
            payload_len: PayloadLen::Fixed(0),
        },
        CommandSpec {
            id: CommandId::FetchStart,
            channel: Channel::FetchControl,
            prefix: &[0x01, 0x01],
            payload_len: PayloadLen::Fixed(7),
        },
        CommandSpec {
            id: CommandId::FetchTransfer,
            channel: Channel::FetchControl,
            prefix: &[0x02],
            payload_len: PayloadLen::Fixed(0),
        },
    ],
    locales: &[
        (Language::English, "en_US"),
        (Language::Spanish, "es_ES"),
        (Language::German, "de_DE"),
        (Language::French, "fr_FR"),
        (Language::Italian, "it_IT"),
        (Language::Russian, "ru_RU"),
        (Language::Chinese, "zh_CN"),
        (Language::Japanese, "ja_JP"),
    ],
    screens: &[
        ScreenSlot {
            screen: Screen::Notifications,
            bit: 0x02,
            slot: 4,
        },
        ScreenSlot {
            screen: Screen::Weather,
            bit: 0x04,
            slot: 5,
        },
        ScreenSlot {
            screen: Screen::Activity,
            bit: 0x08,
            slot: 6,
        },
        ScreenSlot {
            screen: Screen::More,
            bit: 0x10,
            slot: 7,
        },
        ScreenSlot {
            screen: Screen::Status,
            bit: 0x20,
            slot: 8,
        },
        ScreenSlot {
            screen: Screen::HeartRate,
            bit: 0x40,
            slot: 9,
        },
        ScreenSlot {
            screen: Screen::Timer,
            bit: 0x80,
            slot: 10,
        },
    ],
    status: StatusCodes {
        response: 0x10,
        success: 0x01,
        mismatched_key: 0x04,
    },
    screen_header: [0x01, 0x30, 0x00],
    activity_sample_len: 4,
    weight_scale: 200.0,
    date_formats: DateFormats {
        day_month_year: "dd/MM/yyyy",
        month_day_year: "MM/dd/yyyy",
        year_month_day: "yyyy-MM-dd",
    },
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_map_auth_channel_to_vendor_uuid() {
        let uuid = MI_BAND_3.uuid(Channel::Auth).unwrap();
        assert_eq!(uuid.to_string(), "00000009-0000-3512-2118-0009af100700");
    }

    #[test]
    fn should_map_heart_rate_channel_to_sig_uuid() {
        let uuid = MI_BAND_3.uuid(Channel::HeartRateMeasurement).unwrap();
        assert_eq!(uuid.to_string(), "00002a37-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn should_map_every_channel() {
        for channel in [
            Channel::Auth,
            Channel::Configuration,
            Channel::FetchControl,
            Channel::ActivityData,
            Channel::Battery,
            Channel::UserSettings,
            Channel::CurrentTime,
            Channel::HeartRateMeasurement,
            Channel::HeartRateControl,
            Channel::HardwareRevision,
            Channel::FirmwareRevision,
        ] {
            assert!(MI_BAND_3.uuid(channel).is_ok(), "{channel} unmapped");
        }
    }

    #[test]
    fn should_frame_command_with_prefix() {
        let frame = MI_BAND_3.frame(CommandId::DistanceUnit, &[0x01]).unwrap();
        assert_eq!(frame.channel, Channel::Configuration);
        assert_eq!(frame.bytes, vec![0x06, 0x03, 0x00, 0x01]);
    }

    #[test]
    fn should_reject_wrong_payload_length() {
        let err = MI_BAND_3.frame(CommandId::AuthSendKey, &[0; 4]).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::WrongLength {
                format: "auth_send_key",
                expected: 16,
                actual: 4
            }
        );
    }

    #[test]
    fn should_accept_variable_payloads() {
        let frame = MI_BAND_3.frame(CommandId::Language, b"en_US").unwrap();
        assert_eq!(&frame.bytes[..3], &[0x06, 0x17, 0x00]);
        assert_eq!(&frame.bytes[3..], b"en_US");
    }

    #[test]
    fn should_expose_opcodes_for_responses() {
        assert_eq!(MI_BAND_3.opcode(CommandId::AuthSendResponse).unwrap(), 0x03);
        assert_eq!(MI_BAND_3.opcode(CommandId::FetchTransfer).unwrap(), 0x02);
        assert!(MI_BAND_3.opcode(CommandId::CurrentTime).is_err());
    }

    #[test]
    fn should_resolve_locales() {
        assert_eq!(MI_BAND_3.locale(Language::English).unwrap(), "en_US");
        assert_eq!(MI_BAND_3.locale(Language::Japanese).unwrap(), "ja_JP");
    }

    #[test]
    fn should_assign_distinct_screen_bits() {
        let slots = MI_BAND_3.screen_slots();
        assert_eq!(slots.len(), 7);
        let mask = slots.iter().fold(0u8, |acc, s| {
            assert_eq!(acc & s.bit, 0);
            acc | s.bit
        });
        assert_eq!(mask | MI_BAND_3.screen_header[0], 0xff);
    }
}
