//! Log timestamp parsing (`YYYY-MM-DD HH:MM:SS,F`) and storage formatting.

use chrono::{NaiveDateTime, Timelike};

/// Storage format: millisecond precision, sorts lexicographically.
pub const STORAGE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

const SECONDS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a log timestamp. The digits after the comma are a decimal fraction
/// of a second (`,5` is 500 ms, `,123456` is 123 ms); anything beyond
/// milliseconds is truncated.
pub fn parse(s: &str) -> Option<NaiveDateTime> {
  let (seconds, fraction) = s.trim().split_once(',')?;
  if fraction.is_empty() || fraction.len() > 9 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
    return None;
  }
  let base = NaiveDateTime::parse_from_str(seconds, SECONDS_FORMAT).ok()?;

  let millis = fraction
    .bytes()
    .chain(std::iter::repeat(b'0'))
    .take(3)
    .fold(0u32, |acc, b| acc * 10 + u32::from(b - b'0'));
  base.with_nanosecond(millis * 1_000_000)
}

/// Render a timestamp in the storage format.
pub fn format(ts: &NaiveDateTime) -> String {
  ts.format(STORAGE_FORMAT).to_string()
}

/// Inverse of [`format`].
pub fn parse_storage(s: &str) -> Option<NaiveDateTime> {
  NaiveDateTime::parse_from_str(s, STORAGE_FORMAT)
    .or_else(|_| NaiveDateTime::parse_from_str(s, SECONDS_FORMAT))
    .ok()
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::NaiveDate;

  fn at(h: u32, m: u32, s: u32, ms: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 10, 5)
      .unwrap()
      .and_hms_milli_opt(h, m, s, ms)
      .unwrap()
  }

  #[test]
  fn single_digit_fraction_is_tenths() {
    assert_eq!(parse("2025-10-05 08:17:22,8"), Some(at(8, 17, 22, 800)));
    assert_eq!(parse("2025-10-05 08:22:15,6"), Some(at(8, 22, 15, 600)));
  }

  #[test]
  fn long_fraction_truncates_to_millis() {
    assert_eq!(parse("2025-10-05 08:15:30,123456"), Some(at(8, 15, 30, 123)));
    assert_eq!(parse("2025-10-05 08:15:30,050"), Some(at(8, 15, 30, 50)));
  }

  #[test]
  fn malformed_timestamps_rejected() {
    assert_eq!(parse("2025-10-05 08:15:30"), None);
    assert_eq!(parse("2025-10-05 08:15:30,"), None);
    assert_eq!(parse("2025-10-05 08:15:30,5a"), None);
    assert_eq!(parse("2025-13-05 08:15:30,5"), None);
    assert_eq!(parse("2025-10-05T08:15:30,5"), None);
    assert_eq!(parse("yesterday,5"), None);
  }

  #[test]
  fn storage_format_round_trips() {
    let ts = at(23, 59, 59, 7);
    assert_eq!(format(&ts), "2025-10-05 23:59:59.007");
    assert_eq!(parse_storage(&format(&ts)), Some(ts));
  }
}
