//! Time and timestamp helpers.

use chrono::{DateTime, FixedOffset, Local, Utc};

/// UTC timestamp used for samples, device clocks and range queries.
pub type Timestamp = DateTime<Utc>;

/// Return the current UTC time.
#[must_use]
pub fn now() -> Timestamp {
    Utc::now()
}

/// Return the current wall-clock time with the host's UTC offset.
///
/// Trackers keep local time plus an offset, so anything written to the
/// device clock starts from here.
#[must_use]
pub fn local_now() -> DateTime<FixedOffset> {
    Local::now().fixed_offset()
}

/// Express a UTC timestamp in the host's local offset.
#[must_use]
pub fn to_local(timestamp: Timestamp) -> DateTime<FixedOffset> {
    timestamp.with_timezone(&Local).fixed_offset()
}
