//! Clock access and the time formats used in record headers and INFO XML.
//!
//! - record start time: miniSEED `NanoTime` (year, day-of-year, 0.1 ms in v2)
//! - server start time: `"YYYY-MM-DD HH:MM:SSZ"`

use std::time::{SystemTime, UNIX_EPOCH};

use miniseed_rs::NanoTime;
use seedlink_hub_protocol::CivilTime;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Format epoch milliseconds as `"YYYY-MM-DD HH:MM:SSZ"` (UTC).
pub(crate) fn format_started(ms: i64) -> String {
    let t = CivilTime::from_epoch_millis(ms);
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}Z",
        t.year, t.month, t.day, t.hour, t.minute, t.second
    )
}

/// Epoch milliseconds as a miniSEED record start time.
///
/// `None` outside the years a record header can hold.
pub(crate) fn nano_time(ms: i64) -> Option<NanoTime> {
    let t = CivilTime::from_epoch_millis(ms);
    Some(NanoTime {
        year: u16::try_from(t.year).ok()?,
        day: t.day_of_year as u16,
        hour: t.hour as u8,
        minute: t.minute as u8,
        second: t.second as u8,
        nanosecond: t.millisecond * 1_000_000,
    })
}
