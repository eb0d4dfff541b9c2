//! UTC civil time for SeedLink `TIME`/`DATA` arguments and record headers.
//!
//! Timestamps are carried as milliseconds since the Unix epoch. The
//! command format is `"YYYY,MM,DD,HH,MM,SS"` with 1-based month and day.

use crate::error::{Result, SeedlinkError};

const MS_PER_DAY: i64 = 86_400_000;

/// Years accepted in a `TIME`/`DATA` argument.
pub const TIME_ARG_YEARS: std::ops::RangeInclusive<i32> = 1900..=9999;

/// Broken-down UTC time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CivilTime {
    pub year: i32,
    /// 1-12
    pub month: u32,
    /// 1-31
    pub day: u32,
    /// 1-366
    pub day_of_year: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    pub millisecond: u32,
}

impl CivilTime {
    /// Split epoch milliseconds into calendar fields.
    pub fn from_epoch_millis(ms: i64) -> Self {
        let days = ms.div_euclid(MS_PER_DAY);
        let ms_of_day = ms.rem_euclid(MS_PER_DAY);

        // Days-to-civil over 400-year eras, with years starting in March.
        let z = days + 719_468;
        let era = z.div_euclid(146_097);
        let doe = z - era * 146_097;
        let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
        let doy_from_march = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy_from_march + 2) / 153;
        let day = (doy_from_march - (153 * mp + 2) / 5 + 1) as u32;
        let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
        let year = (yoe + era * 400 + i64::from(month <= 2)) as i32;

        let day_of_year =
            day + month_lengths(year).iter().take((month - 1) as usize).sum::<u32>();

        Self {
            year,
            month,
            day,
            day_of_year,
            hour: (ms_of_day / 3_600_000) as u32,
            minute: (ms_of_day % 3_600_000 / 60_000) as u32,
            second: (ms_of_day % 60_000 / 1000) as u32,
            millisecond: (ms_of_day % 1000) as u32,
        }
    }

    /// Milliseconds since the Unix epoch.
    ///
    /// Uses `year` and `day_of_year`; `month` and `day` are ignored.
    pub fn to_epoch_millis(&self) -> i64 {
        let days = days_before_year(self.year) + i64::from(self.day_of_year) - 1;

        days * MS_PER_DAY
            + i64::from(self.hour) * 3_600_000
            + i64::from(self.minute) * 60_000
            + i64::from(self.second) * 1000
            + i64::from(self.millisecond)
    }
}

/// Parse a `TIME`/`DATA` time argument into epoch milliseconds (UTC).
pub fn parse_time_arg(s: &str) -> Result<i64> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 6 {
        return Err(SeedlinkError::InvalidTime(format!(
            "expected 6 comma-separated fields, got {} ({s:?})",
            parts.len()
        )));
    }
    let field = |i: usize| -> Result<u32> {
        parts[i]
            .trim()
            .parse()
            .map_err(|_| SeedlinkError::InvalidTime(format!("bad field {:?} in {s:?}", parts[i])))
    };
    let year = i32::try_from(field(0)?)
        .ok()
        .filter(|y| TIME_ARG_YEARS.contains(y))
        .ok_or_else(|| SeedlinkError::InvalidTime(format!("year out of range in {s:?}")))?;
    let month = field(1)?;
    let day = field(2)?;
    let hour = field(3)?;
    let minute = field(4)?;
    let second = field(5)?;

    if hour > 23 || minute > 59 || second > 59 {
        return Err(SeedlinkError::InvalidTime(format!(
            "time of day out of range in {s:?}"
        )));
    }
    let day_of_year = month_day_to_doy(year, month, day)
        .ok_or_else(|| SeedlinkError::InvalidTime(format!("date out of range in {s:?}")))?;

    Ok(CivilTime {
        year,
        month,
        day,
        day_of_year,
        hour,
        minute,
        second,
        millisecond: 0,
    }
    .to_epoch_millis())
}

fn is_leap(y: i32) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}

/// Days from 1970-01-01 to January 1st of `year`.
fn days_before_year(year: i32) -> i64 {
    let leaps_before = |y: i64| {
        let y = y - 1;
        y.div_euclid(4) - y.div_euclid(100) + y.div_euclid(400)
    };
    let y = i64::from(year);
    365 * (y - 1970) + leaps_before(y) - leaps_before(1970)
}

fn month_lengths(year: i32) -> [u32; 12] {
    let feb = if is_leap(year) { 29 } else { 28 };
    [31, feb, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
}

/// Convert month (1-12) and day (1-31) to day-of-year (1-366).
fn month_day_to_doy(year: i32, month: u32, day: u32) -> Option<u32> {
    if !(1..=12).contains(&month) {
        return None;
    }
    let lengths = month_lengths(year);
    let max_day = lengths[(month - 1) as usize];
    if day < 1 || day > max_day {
        return None;
    }
    Some(day + lengths.iter().take((month - 1) as usize).sum::<u32>())
}
