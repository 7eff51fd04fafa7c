//! Local wall-clock ↔ absolute instant conversion.
//!
//! Only input parsing and presentation ever see a timezone; everything the
//! engine stores or compares is a UTC [`Ms`].

use chrono::{DateTime, NaiveDateTime, Offset, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

use crate::model::{DAY_MS, Ms};

use super::EngineError;

/// Wall-clock format accepted on input and produced on output.
pub const LOCAL_FORMAT: &str = "%Y-%m-%d %H:%M";

pub fn parse_tz(name: &str) -> Result<Tz, EngineError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| EngineError::InvalidTimezone(name.to_string()))
}

/// Parse `YYYY-MM-DD HH:MM`. A `T` date/time separator is tolerated.
pub fn parse_local(local: &str) -> Result<NaiveDateTime, EngineError> {
    let trimmed = local.trim();
    if !is_local_shape(trimmed.as_bytes()) {
        return Err(EngineError::InvalidTimestamp(local.to_string()));
    }
    let normalized = trimmed.replacen('T', " ", 1);
    NaiveDateTime::parse_from_str(&normalized, LOCAL_FORMAT)
        .map_err(|_| EngineError::InvalidTimestamp(local.to_string()))
}

/// Zero-padded `YYYY-MM-DD HH:MM` or `YYYY-MM-DDTHH:MM`; chrono alone also
/// takes single-digit fields.
fn is_local_shape(b: &[u8]) -> bool {
    b.len() == 16
        && b.iter().enumerate().all(|(i, &c)| match i {
            4 | 7 => c == b'-',
            10 => c == b' ' || c == b'T',
            13 => c == b':',
            _ => c.is_ascii_digit(),
        })
}

/// Interpret a naive local timestamp in `tz_name` and return the instant.
///
/// Ambiguous wall times (DST fall-back) resolve to the earlier instant.
/// Wall times inside a spring-forward gap are read with the offset in force
/// before the gap, so they land that far past the transition.
pub fn to_absolute(local: &str, tz_name: &str) -> Result<Ms, EngineError> {
    let tz = parse_tz(tz_name)?;
    let naive = parse_local(local)?;
    Ok(resolve_local(&tz, naive).timestamp_millis())
}

/// Format an instant as wall-clock time in `tz_name`.
pub fn from_absolute(instant: Ms, tz_name: &str) -> Result<String, EngineError> {
    let tz = parse_tz(tz_name)?;
    format_local(instant, &tz)
}

pub fn format_local(instant: Ms, tz: &Tz) -> Result<String, EngineError> {
    let utc = DateTime::from_timestamp_millis(instant)
        .ok_or_else(|| EngineError::InvalidTimestamp(instant.to_string()))?;
    Ok(utc.with_timezone(tz).format(LOCAL_FORMAT).to_string())
}

/// Move an instant by whole calendar days in `tz`, keeping its wall-clock
/// time. Across a DST change the UTC distance is a day plus or minus the
/// offset difference.
pub fn shift_local_days(instant: Ms, days: i64, tz: &Tz) -> Ms {
    let Some(utc) = DateTime::from_timestamp_millis(instant) else {
        return instant + days * DAY_MS;
    };
    let shifted = utc.with_timezone(tz).naive_local() + TimeDelta::days(days);
    resolve_local(tz, shifted).timestamp_millis()
}

fn resolve_local(tz: &Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
        return dt.with_timezone(&Utc);
    }
    // Gap: transitions are months apart, so a day earlier has the old offset.
    let offset_secs = tz
        .offset_from_local_datetime(&(naive - TimeDelta::days(1)))
        .earliest()
        .map(|o| o.fix().local_minus_utc())
        .unwrap_or(0);
    naive.and_utc() - TimeDelta::seconds(i64::from(offset_secs))
}
