//! Byte layouts exchanged with the tracker. Everything is little-endian.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Offset, TimeZone, Timelike, Utc};

use bandlink_domain::device::BatteryStatus;
use bandlink_domain::error::ProtocolError;
use bandlink_domain::preferences::{QuietHoursWindow, Screen, ScreenLayout};
use bandlink_domain::profile::UserProfile;
use bandlink_domain::time::Timestamp;

use super::table::ProtocolTable;

/// Device clocks express their UTC offset in 15-minute units.
const QUARTER_HOUR_SECS: i32 = 15 * 60;

pub const DEVICE_TIME_LEN: usize = 11;
pub const RANGE_START_LEN: usize = 7;
pub const HISTORY_METADATA_LEN: usize = 15;
pub const CHALLENGE_LEN: usize = 16;

fn too_short(format: &'static str, minimum: usize, bytes: &[u8]) -> Result<(), ProtocolError> {
    if bytes.len() < minimum {
        return Err(ProtocolError::TooShort {
            format,
            minimum,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn year_bytes(year: i32) -> Result<[u8; 2], ProtocolError> {
    u16::try_from(year)
        .map(u16::to_le_bytes)
        .map_err(|_| ProtocolError::InvalidField {
            field: "year",
            value: i64::from(year),
        })
}

#[allow(clippy::cast_possible_truncation)]
fn quarter_hours(offset: &FixedOffset) -> u8 {
    // two's complement on the wire, so west-of-UTC offsets become 0x80..=0xff
    (offset.local_minus_utc() / QUARTER_HOUR_SECS) as i8 as u8
}

#[allow(clippy::cast_possible_wrap)]
fn offset_from_quarter_hours(raw: u8) -> Result<FixedOffset, ProtocolError> {
    let quarters = i32::from(raw as i8);
    FixedOffset::east_opt(quarters * QUARTER_HOUR_SECS).ok_or(ProtocolError::InvalidField {
        field: "timezone",
        value: i64::from(quarters),
    })
}

#[allow(clippy::too_many_arguments)]
fn local_to_utc(
    offset: FixedOffset,
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
) -> Result<Timestamp, ProtocolError> {
    let invalid = |field: &'static str, value: u8| ProtocolError::InvalidField {
        field,
        value: i64::from(value),
    };
    let date = NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))
        .ok_or_else(|| invalid("date", day))?;
    let naive = date
        .and_hms_opt(u32::from(hour), u32::from(minute), u32::from(second))
        .ok_or_else(|| invalid("time", hour))?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| invalid("time", hour))
}

/// Current-time characteristic payload.
///
/// `[year u16, month, day, hour, minute, second, weekday (1 = Monday),
/// fractions256, adjust reason, tz quarter hours]`
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidField`] for years outside `u16`.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_device_time(time: &DateTime<FixedOffset>) -> Result<[u8; DEVICE_TIME_LEN], ProtocolError> {
    let [year_lo, year_hi] = year_bytes(time.year())?;
    Ok([
        year_lo,
        year_hi,
        time.month() as u8,
        time.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
        time.weekday().number_from_monday() as u8,
        0,
        0,
        quarter_hours(time.offset()),
    ])
}

/// Decode a current-time read into UTC.
///
/// Firmware that omits the trailing timezone byte is read as UTC.
///
/// # Errors
///
/// Returns [`ProtocolError::TooShort`] or [`ProtocolError::InvalidField`].
pub fn decode_device_time(bytes: &[u8]) -> Result<Timestamp, ProtocolError> {
    too_short("device time", 7, bytes)?;
    let offset = match bytes.get(DEVICE_TIME_LEN - 1) {
        Some(raw) => offset_from_quarter_hours(*raw)?,
        None => Utc.fix(),
    };
    local_to_utc(
        offset,
        u16::from_le_bytes([bytes[0], bytes[1]]),
        bytes[2],
        bytes[3],
        bytes[4],
        bytes[5],
        bytes[6],
    )
}

/// History range start: `[year u16, month, day, hour, minute, tz quarter hours]`.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidField`] for years outside `u16`.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_range_start(since: &DateTime<FixedOffset>) -> Result<[u8; RANGE_START_LEN], ProtocolError> {
    let [year_lo, year_hi] = year_bytes(since.year())?;
    Ok([
        year_lo,
        year_hi,
        since.month() as u8,
        since.day() as u8,
        since.hour() as u8,
        since.minute() as u8,
        quarter_hours(since.offset()),
    ])
}

/// Read a range start back into UTC, the way the device interprets it.
///
/// # Errors
///
/// Returns [`ProtocolError::WrongLength`] unless exactly 7 bytes arrive, or
/// [`ProtocolError::InvalidField`] for an impossible time.
pub fn decode_range_start(bytes: &[u8]) -> Result<Timestamp, ProtocolError> {
    if bytes.len() != RANGE_START_LEN {
        return Err(ProtocolError::WrongLength {
            format: "range start",
            expected: RANGE_START_LEN,
            actual: bytes.len(),
        });
    }
    local_to_utc(
        offset_from_quarter_hours(bytes[6])?,
        u16::from_le_bytes([bytes[0], bytes[1]]),
        bytes[2],
        bytes[3],
        bytes[4],
        bytes[5],
        0,
    )
}

/// Response to a history range query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryMetadata {
    /// Bytes the device is about to send; zero means nothing recorded.
    pub expected_bytes: u32,
    /// Time of the first recorded minute.
    pub start: Timestamp,
}

/// Decode `[response, command, status, count u32, year u16, month, day,
/// hour, minute, second, tz]`.
///
/// # Errors
///
/// Returns [`ProtocolError::WrongLength`] unless exactly 15 bytes arrive, or
/// [`ProtocolError::InvalidField`] for an impossible start time.
pub fn decode_history_metadata(bytes: &[u8]) -> Result<HistoryMetadata, ProtocolError> {
    if bytes.len() != HISTORY_METADATA_LEN {
        return Err(ProtocolError::WrongLength {
            format: "history metadata",
            expected: HISTORY_METADATA_LEN,
            actual: bytes.len(),
        });
    }
    let expected_bytes = u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
    let offset = offset_from_quarter_hours(bytes[14])?;
    let start = local_to_utc(
        offset,
        u16::from_le_bytes([bytes[7], bytes[8]]),
        bytes[9],
        bytes[10],
        bytes[11],
        bytes[12],
        bytes[13],
    )?;
    Ok(HistoryMetadata {
        expected_bytes,
        start,
    })
}

/// One minute of history as recorded on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawActivitySample {
    pub kind: u8,
    pub intensity: u8,
    pub steps: u8,
    pub heart_rate: u8,
}

/// Decode `[counter, (kind, intensity, steps, heart rate)*]`.
///
/// # Errors
///
/// Returns [`ProtocolError::TooShort`] for an empty packet and
/// [`ProtocolError::InvalidField`] when trailing bytes do not form a sample.
pub fn decode_activity_packet(
    table: &ProtocolTable,
    bytes: &[u8],
) -> Result<(u8, Vec<RawActivitySample>), ProtocolError> {
    too_short("activity packet", 1, bytes)?;
    let (counter, body) = (bytes[0], &bytes[1..]);
    let width = table.activity_sample_len;
    if body.len() % width != 0 {
        return Err(ProtocolError::InvalidField {
            field: "activity packet length",
            value: i64::try_from(bytes.len()).unwrap_or(i64::MAX),
        });
    }
    let samples = body
        .chunks_exact(width)
        .map(|chunk| RawActivitySample {
            kind: chunk[0],
            intensity: chunk[1],
            steps: chunk[2],
            heart_rate: chunk[3],
        })
        .collect();
    Ok((counter, samples))
}

/// Decode a battery read: level at byte 1, charging flag at byte 2.
///
/// # Errors
///
/// Returns [`ProtocolError::TooShort`] or [`ProtocolError::InvalidField`]
/// for a level above 100.
pub fn decode_battery(bytes: &[u8]) -> Result<BatteryStatus, ProtocolError> {
    too_short("battery", 3, bytes)?;
    let level = bytes[1];
    if level > 100 {
        return Err(ProtocolError::InvalidField {
            field: "battery level",
            value: i64::from(level),
        });
    }
    Ok(BatteryStatus {
        level,
        charging: bytes[2] == 1,
    })
}

/// Revision strings are NUL-padded ASCII.
#[must_use]
pub fn decode_revision(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .trim()
        .to_owned()
}

/// Decode a heart-rate measurement into its raw value.
///
/// Bit 0 of the flags byte selects a 16-bit value.
///
/// # Errors
///
/// Returns [`ProtocolError::TooShort`] when the value is truncated.
pub fn decode_heart_rate(bytes: &[u8]) -> Result<u16, ProtocolError> {
    too_short("heart rate measurement", 2, bytes)?;
    if bytes[0] & 0x01 == 0 {
        return Ok(u16::from(bytes[1]));
    }
    too_short("heart rate measurement", 3, bytes)?;
    Ok(u16::from_le_bytes([bytes[1], bytes[2]]))
}

/// A `[response, command, status, payload..]` notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response<'a> {
    pub command: u8,
    pub status: u8,
    pub payload: &'a [u8],
}

/// Split a response notification.
///
/// # Errors
///
/// Returns [`ProtocolError::UnexpectedResponse`] when the first byte is not
/// the response marker, or [`ProtocolError::TooShort`].
pub fn decode_response<'a>(
    table: &ProtocolTable,
    format: &'static str,
    bytes: &'a [u8],
) -> Result<Response<'a>, ProtocolError> {
    too_short(format, 3, bytes)?;
    if bytes[0] != table.status.response {
        return Err(ProtocolError::UnexpectedResponse {
            format,
            bytes: bytes.iter().take(4).copied().collect(),
        });
    }
    Ok(Response {
        command: bytes[1],
        status: bytes[2],
        payload: &bytes[3..],
    })
}

/// Quiet hours payload: `[start hour, start minute, end hour, end minute]`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode_quiet_hours(window: &QuietHoursWindow) -> [u8; 4] {
    [
        window.start().hour() as u8,
        window.start().minute() as u8,
        window.end().hour() as u8,
        window.end().minute() as u8,
    ]
}

/// Screens payload: `[mask, 0x30, 0x00, clock slot, one slot per screen]`.
///
/// Enabled screens take positions `1..` in layout order, disabled screens
/// are parked after them in table order.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode_screens(table: &ProtocolTable, layout: &ScreenLayout) -> Vec<u8> {
    let slots = table.screen_slots();
    let width = slots.iter().map(|s| s.slot + 1).max().unwrap_or(0);
    let mut payload = vec![0u8; width];
    payload[..table.screen_header.len()].copy_from_slice(&table.screen_header);

    let mut next = layout.screens().len() + 1;
    for slot in slots {
        let position = if let Some(position) = layout.position(slot.screen) {
            payload[0] |= slot.bit;
            position
        } else {
            next += 1;
            next - 1
        };
        payload[slot.slot] = position as u8;
    }
    payload
}

/// Recover the layout from a screens payload.
///
/// # Errors
///
/// Returns [`ProtocolError::TooShort`] for a truncated payload.
pub fn decode_screens(table: &ProtocolTable, payload: &[u8]) -> Result<Vec<Screen>, ProtocolError> {
    let slots = table.screen_slots();
    let width = slots.iter().map(|s| s.slot + 1).max().unwrap_or(0);
    too_short("screens", width, payload)?;
    let mut enabled: Vec<(u8, Screen)> = slots
        .iter()
        .filter(|slot| payload[0] & slot.bit != 0)
        .map(|slot| (payload[slot.slot], slot.screen))
        .collect();
    enabled.sort_by_key(|(position, _)| *position);
    Ok(enabled.into_iter().map(|(_, screen)| screen).collect())
}

/// User info payload: `[year u16, month, day, sex, height u16, weight u16]`.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidField`] for values that do not fit.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn encode_user_info(table: &ProtocolTable, profile: &UserProfile) -> Result<Vec<u8>, ProtocolError> {
    let dob = profile.date_of_birth;
    let [year_lo, year_hi] = year_bytes(dob.year())?;
    let scaled = (profile.weight_kg * table.weight_scale).round();
    if !(0.0..=f32::from(u16::MAX)).contains(&scaled) {
        return Err(ProtocolError::InvalidField {
            field: "weight",
            value: scaled as i64,
        });
    }
    let [weight_lo, weight_hi] = (scaled as u16).to_le_bytes();
    let [height_lo, height_hi] = profile.height_cm.to_le_bytes();
    Ok(vec![
        year_lo,
        year_hi,
        dob.month() as u8,
        dob.day() as u8,
        u8::from(profile.sex.flag()),
        height_lo,
        height_hi,
        weight_lo,
        weight_hi,
    ])
}
