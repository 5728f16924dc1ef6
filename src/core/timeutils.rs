//! Timestamp normalization for campaign granules.
//!
//! Field-campaign files encode time inconsistently: absolute unix seconds,
//! CF-style `<unit> since <base>` columns, or bare hours/seconds since
//! midnight whose date lives only in the file name. Everything here
//! normalizes to UTC unix seconds, correcting midnight wraparound in
//! relative arrays that roll over at 24 hours.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use regex::Regex;
use thiserror::Error;

/// Errors raised while normalizing a time column.
#[derive(Debug, Error)]
pub enum TimeError {
    #[error("unparseable base time in units string '{units}'")]
    BadBaseTime { units: String },

    #[error("unsupported unit in units string '{units}' (expected seconds or hours)")]
    BadUnit { units: String },

    #[error("cannot normalize time column: {reason}")]
    Unrecognized { reason: String },
}

/// How a raw numeric time column is interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeEncoding {
    /// Absolute UTC unix seconds.
    UnixSeconds,
    /// Hours since midnight on the hinted date, wraparound-corrected.
    HoursSinceMidnight { date: NaiveDate },
    /// Seconds since midnight on the hinted date, wraparound-corrected.
    SecondsSinceMidnight { date: NaiveDate },
    /// CF-style offsets from an explicit base instant.
    UnitsSince { base: DateTime<Utc>, unit_secs: f64 },
}

/// True if a relative time array drops backward, i.e. rolled over midnight.
pub fn has_wraparound(values: &[f64]) -> bool {
    values.windows(2).any(|w| w[1] < w[0])
}

/// Extract a date hint from an attribute value or a file name.
///
/// Tries the explicit attribute first (digits-only `YYYYMMDD` after
/// stripping separators), then falls back to `YYYYMMDD` or `YYYY-MM-DD`
/// embedded in the file name.
pub fn date_hint(attr_date: Option<&str>, filename: &str) -> Option<NaiveDate> {
    if let Some(raw) = attr_date {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() == 8 {
            if let Some(date) = parse_yyyymmdd(&digits) {
                return Some(date);
            }
        }
    }

    let compact = Regex::new(r"((?:19|20)\d{6})").unwrap();
    if let Some(m) = compact.captures(filename) {
        if let Some(date) = parse_yyyymmdd(&m[1]) {
            return Some(date);
        }
    }

    let dashed = Regex::new(r"((?:19|20)\d{2})-(\d{2})-(\d{2})").unwrap();
    if let Some(m) = dashed.captures(filename) {
        let joined = format!("{}{}{}", &m[1], &m[2], &m[3]);
        if let Some(date) = parse_yyyymmdd(&joined) {
            return Some(date);
        }
    }

    None
}

fn parse_yyyymmdd(digits: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(digits, "%Y%m%d").ok()
}

/// Infer the encoding of a numeric time column.
///
/// Priority: an explicit `<unit> since <base>` units string wins; otherwise
/// small values are taken as time-of-day relative to the hinted date
/// (max < 25 means hours, max < 86400 means seconds); without a date hint
/// the column is treated as absolute unix seconds.
pub fn detect_encoding(
    values: &[f64],
    units: Option<&str>,
    date: Option<NaiveDate>,
) -> Result<TimeEncoding, TimeError> {
    if let Some(units) = units {
        if units.to_lowercase().contains("since") {
            return parse_units_since(units);
        }
    }

    if values.is_empty() {
        return Err(TimeError::Unrecognized {
            reason: "empty time column".to_string(),
        });
    }

    let max = values.iter().cloned().fold(f64::MIN, f64::max);
    if let Some(date) = date {
        if max < 25.0 {
            return Ok(TimeEncoding::HoursSinceMidnight { date });
        }
        if max < 86_400.0 {
            return Ok(TimeEncoding::SecondsSinceMidnight { date });
        }
    }

    if values.iter().all(|v| v.is_finite()) {
        return Ok(TimeEncoding::UnixSeconds);
    }

    Err(TimeError::Unrecognized {
        reason: "non-finite values in time column".to_string(),
    })
}

fn parse_units_since(units: &str) -> Result<TimeEncoding, TimeError> {
    let pattern = Regex::new(r"(?i)(seconds|hours)\s+since\s+([0-9T:\- ]+)").unwrap();
    let caps = pattern.captures(units).ok_or_else(|| TimeError::BadUnit {
        units: units.to_string(),
    })?;

    let unit_secs = match caps[1].to_lowercase().as_str() {
        "seconds" => 1.0,
        "hours" => 3600.0,
        _ => {
            return Err(TimeError::BadUnit {
                units: units.to_string(),
            })
        }
    };

    let base_str = caps[2].trim();
    let base = parse_base_instant(base_str).ok_or_else(|| TimeError::BadBaseTime {
        units: units.to_string(),
    })?;

    Ok(TimeEncoding::UnitsSince { base, unit_secs })
}

fn parse_base_instant(s: &str) -> Option<DateTime<Utc>> {
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}

/// Normalize a numeric time column to UTC unix seconds.
///
/// Relative encodings are wraparound-corrected: each backward jump in the
/// raw values shifts everything after it forward by one day.
pub fn normalize_timestamps(
    values: &[f64],
    units: Option<&str>,
    date: Option<NaiveDate>,
) -> Result<Vec<i64>, TimeError> {
    let encoding = detect_encoding(values, units, date)?;
    let normalized = match encoding {
        TimeEncoding::UnixSeconds => values.iter().map(|&v| v as i64).collect(),
        TimeEncoding::HoursSinceMidnight { date } => {
            resolve_relative(values, midnight_utc(date), 3600.0, 24.0)
        }
        TimeEncoding::SecondsSinceMidnight { date } => {
            resolve_relative(values, midnight_utc(date), 1.0, 86_400.0)
        }
        TimeEncoding::UnitsSince { base, unit_secs } => values
            .iter()
            .map(|&v| base.timestamp() + (v * unit_secs) as i64)
            .collect(),
    };
    Ok(normalized)
}

fn midnight_utc(date: NaiveDate) -> i64 {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight is valid"))
        .timestamp()
}

/// Resolve relative time-of-day values against a base instant, shifting by
/// whole days wherever the raw array wraps backward.
fn resolve_relative(values: &[f64], base_secs: i64, unit_secs: f64, period: f64) -> Vec<i64> {
    let mut day_shift = 0.0;
    let mut prev = f64::MIN;
    let mut out = Vec::with_capacity(values.len());
    for &v in values {
        if prev != f64::MIN && v < prev {
            day_shift += period;
        }
        prev = v;
        out.push(base_secs + ((v + day_shift) * unit_secs) as i64);
    }
    out
}

/// RFC 3339 UTC rendering of a unix-seconds timestamp.
pub fn iso8601(secs: i64) -> String {
    match DateTime::<Utc>::from_timestamp(secs, 0) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Secs, true),
        // Out-of-range timestamps only occur for corrupt input; render the
        // raw value so logs stay attributable.
        None => format!("@{}", secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_wraparound() {
        assert!(!has_wraparound(&[0.0, 1.0, 2.0]));
        assert!(has_wraparound(&[22.0, 23.0, 0.5, 1.0]));
    }

    #[test]
    fn test_date_hint_from_attr_and_filename() {
        assert_eq!(
            date_hint(Some("2017-05-17"), "whatever.nc"),
            NaiveDate::from_ymd_opt(2017, 5, 17)
        );
        assert_eq!(
            date_hint(None, "crs_20170517_sweep.csv"),
            NaiveDate::from_ymd_opt(2017, 5, 17)
        );
        assert_eq!(
            date_hint(None, "granule_2017-05-17.csv"),
            NaiveDate::from_ymd_opt(2017, 5, 17)
        );
        assert_eq!(date_hint(None, "points.csv"), None);
    }

    #[test]
    fn test_hours_since_midnight_with_wraparound() {
        let date = NaiveDate::from_ymd_opt(2017, 5, 17).unwrap();
        let base = midnight_utc(date);
        let out = normalize_timestamps(&[23.0, 23.5, 0.25], None, Some(date)).unwrap();
        assert_eq!(out[0], base + 23 * 3600);
        assert_eq!(out[1], base + 23 * 3600 + 1800);
        // Wrapped value lands on the next day.
        assert_eq!(out[2], base + 24 * 3600 + 900);
    }

    #[test]
    fn test_seconds_since_midnight() {
        let date = NaiveDate::from_ymd_opt(2020, 1, 2).unwrap();
        let base = midnight_utc(date);
        let out = normalize_timestamps(&[30.0, 60.0, 7200.0], None, Some(date)).unwrap();
        assert_eq!(out, vec![base + 30, base + 60, base + 7200]);
    }

    #[test]
    fn test_units_since_base() {
        let out =
            normalize_timestamps(&[0.0, 2.0], Some("hours since 2017-05-17 00:00:00"), None)
                .unwrap();
        assert_eq!(out[1] - out[0], 7200);

        let out = normalize_timestamps(&[10.0], Some("seconds since 1970-01-01"), None).unwrap();
        assert_eq!(out, vec![10]);
    }

    #[test]
    fn test_unix_seconds_without_hint() {
        // Small values with no date hint are absolute, not time-of-day.
        let out = normalize_timestamps(&[0.0, 1.0, 2.0], None, None).unwrap();
        assert_eq!(out, vec![0, 1, 2]);

        let out = normalize_timestamps(&[1_494_979_200.0], None, None).unwrap();
        assert_eq!(out, vec![1_494_979_200]);
    }

    #[test]
    fn test_bad_units_string() {
        let err = normalize_timestamps(&[1.0], Some("fortnights since 2017-05-17"), None);
        assert!(matches!(err, Err(TimeError::BadUnit { .. })));
    }

    #[test]
    fn test_iso8601() {
        assert_eq!(iso8601(0), "1970-01-01T00:00:00Z");
        assert_eq!(iso8601(1_494_979_200), "2017-05-17T00:00:00Z");
    }
}
