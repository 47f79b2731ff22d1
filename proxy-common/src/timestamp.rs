//! Archive timestamps (`YYYYMMDDhhmmss`, possibly truncated).

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Full-precision timestamp width.
pub const TIMESTAMP_DIGITS: usize = 14;

/// Filler used to widen truncated timestamps to full precision.
const PAD_TEMPLATE: &str = "19700101000000";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimestampError {
    #[error("timestamp must be 1 to 14 digits, got {0:?}")]
    Malformed(String),
}

/// A capture timestamp as it appears in archive URLs.
///
/// Truncated forms (`2014`, `201401`) are accepted and compared as the earliest instant they
/// cover.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp(String);

impl Timestamp {
    pub fn parse(raw: &str) -> Result<Self, TimestampError> {
        if Self::is_timestamp(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(TimestampError::Malformed(raw.to_string()))
        }
    }

    /// True when `raw` has the shape of a timestamp path segment.
    pub fn is_timestamp(raw: &str) -> bool {
        !raw.is_empty() && raw.len() <= TIMESTAMP_DIGITS && raw.bytes().all(|b| b.is_ascii_digit())
    }

    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.format("%Y%m%d%H%M%S").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Widened to 14 digits.
    pub fn padded(&self) -> String {
        let mut full = self.0.clone();
        full.push_str(&PAD_TEMPLATE[self.0.len()..]);
        full
    }

    /// `None` when the digits do not name a real calendar instant (e.g. month 13).
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(&self.padded(), "%Y%m%d%H%M%S")
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    }

    /// Absolute distance in seconds, or `None` if either side is not a real instant.
    pub fn distance_secs(&self, other: &Timestamp) -> Option<i64> {
        let a = self.to_datetime()?;
        let b = other.to_datetime()?;
        Some((a - b).num_seconds().abs())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Timestamp {
    type Error = TimestampError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Timestamp> for String {
    fn from(value: Timestamp) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_truncated_digits() {
        assert!(Timestamp::parse("2014").is_ok());
        assert!(Timestamp::parse("20140126200624").is_ok());
        assert!(Timestamp::parse("").is_err());
        assert!(Timestamp::parse("201401262006241").is_err());
        assert!(Timestamp::parse("2014-01").is_err());
    }

    #[test]
    fn test_padding_and_distance() {
        let day = Timestamp::parse("20140126").unwrap();
        assert_eq!(day.padded(), "20140126000000");

        let a = Timestamp::parse("20140126200624").unwrap();
        let b = Timestamp::parse("20140127171238").unwrap();
        assert_eq!(a.distance_secs(&b), Some(75974));
        assert_eq!(b.distance_secs(&a), Some(75974));
    }

    #[test]
    fn test_invalid_calendar_instant() {
        let bogus = Timestamp::parse("20141345").unwrap();
        assert!(bogus.to_datetime().is_none());
    }

    #[test]
    fn test_now_is_full_precision() {
        assert_eq!(Timestamp::now().as_str().len(), TIMESTAMP_DIGITS);
    }

    #[test]
    fn test_serde_rejects_malformed() {
        let ok: Timestamp = serde_json::from_str("\"20140127171238\"").unwrap();
        assert_eq!(ok.as_str(), "20140127171238");
        assert!(serde_json::from_str::<Timestamp>("\"latest\"").is_err());
    }
}
