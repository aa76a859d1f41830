//! Input validation performed before any distributed work starts.
//!
//! Acquisition dates are proleptic Gregorian ordinals where 0001-01-01 is day 1.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use std::fmt;
use thiserror::Error;

/// Invalid job input. Raised before any catalog or store access.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid acquired param: {0}")]
    Acquired(String),

    #[error("Bounding coords appear invalid: ({ulx}, {uly}, {lrx}, {lry})")]
    Bounds { ulx: i64, uly: i64, lrx: i64, lry: i64 },

    #[error("Invalid product date value: {0}")]
    ProductDate(String),

    #[error("Training window start {start} is after end {end}")]
    TrainingWindow { start: i64, end: i64 },
}

/// Convert a calendar date to its ordinal day.
pub fn to_ordinal(date: NaiveDate) -> i64 {
    date.num_days_from_ce() as i64
}

/// Convert an ordinal day back to a calendar date.
pub fn from_ordinal(ordinal: i64) -> Option<NaiveDate> {
    i32::try_from(ordinal).ok().and_then(NaiveDate::from_num_days_from_ce_opt)
}

/// Parse an ISO-8601 date or datetime, keeping only the calendar date.
pub fn parse_iso_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.date());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.date_naive());
    }
    None
}

/// A validated `start/end` acquisition range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredRange {
    raw: String,
    start: NaiveDate,
    end: NaiveDate,
}

impl AcquiredRange {
    /// Parse and validate an ISO-8601 `start/end` range.
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let err = || ValidationError::Acquired(value.to_string());
        let (start, end) = value.split_once('/').ok_or_else(err)?;
        let start = parse_iso_date(start).ok_or_else(err)?;
        let end = parse_iso_date(end).ok_or_else(err)?;
        if start > end {
            return Err(err());
        }
        Ok(Self {
            raw: value.to_string(),
            start,
            end,
        })
    }

    /// Default range: from the first representable day until now.
    pub fn until_now() -> Self {
        let now = chrono::Utc::now().naive_utc();
        let raw = format!("0001-01-01/{}", now.format("%Y-%m-%dT%H:%M:%S%.6f"));
        Self {
            raw,
            start: NaiveDate::from_ymd_opt(1, 1, 1).unwrap_or(NaiveDate::MIN),
            end: now.date(),
        }
    }

    /// Range exactly as supplied; this is what the catalog receives.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn start_ordinal(&self) -> i64 {
        to_ordinal(self.start)
    }

    pub fn end_ordinal(&self) -> i64 {
        to_ordinal(self.end)
    }

    /// Path-safe key identifying this range in stored rows.
    pub fn key(&self) -> String {
        format!("{}_{}", self.start.format("%Y%m%d"), self.end.format("%Y%m%d"))
    }
}

impl fmt::Display for AcquiredRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Validate a bounding box given as upper-left and lower-right corners.
pub fn bounds(ulx: i64, uly: i64, lrx: i64, lry: i64) -> Result<(), ValidationError> {
    if ulx < lrx && uly > lry {
        Ok(())
    } else {
        Err(ValidationError::Bounds { ulx, uly, lrx, lry })
    }
}

/// Parse a product or training date given either as an ordinal day or an ISO date.
pub fn product_date(value: &str) -> Result<i64, ValidationError> {
    let trimmed = value.trim();
    if let Ok(ordinal) = trimmed.parse::<i64>() {
        if from_ordinal(ordinal).is_some() && ordinal > 0 {
            return Ok(ordinal);
        }
        return Err(ValidationError::ProductDate(value.to_string()));
    }
    parse_iso_date(trimmed)
        .map(to_ordinal)
        .ok_or_else(|| ValidationError::ProductDate(value.to_string()))
}

/// Validate a training window `[msday, meday]`.
pub fn training_window(msday: i64, meday: i64) -> Result<(), ValidationError> {
    if msday > meday {
        return Err(ValidationError::TrainingWindow { start: msday, end: meday });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordinal_matches_gregorian_ordinal() {
        let first = NaiveDate::from_ymd_opt(1, 1, 1).unwrap();
        assert_eq!(to_ordinal(first), 1);

        let d = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap();
        assert_eq!(to_ordinal(d), 730_120);
        assert_eq!(from_ordinal(730_120), Some(d));
    }

    #[test]
    fn test_acquired_range_parse() {
        let range = AcquiredRange::parse("1982-01-01/2017-12-31").unwrap();
        assert_eq!(range.start(), NaiveDate::from_ymd_opt(1982, 1, 1).unwrap());
        assert_eq!(range.key(), "19820101_20171231");
        assert_eq!(range.as_str(), "1982-01-01/2017-12-31");

        let range = AcquiredRange::parse("0001-01-01/2018-05-04T10:11:12.123456").unwrap();
        assert_eq!(range.end(), NaiveDate::from_ymd_opt(2018, 5, 4).unwrap());
    }

    #[test]
    fn test_acquired_range_invalid() {
        assert!(AcquiredRange::parse("1982-01-01").is_err());
        assert!(AcquiredRange::parse("2017-01-01/1982-01-01").is_err());
        assert!(AcquiredRange::parse("yesterday/today").is_err());
        assert_eq!(
            AcquiredRange::parse("x/y"),
            Err(ValidationError::Acquired("x/y".to_string()))
        );
    }

    #[test]
    fn test_until_now_is_valid() {
        let range = AcquiredRange::until_now();
        assert!(range.as_str().starts_with("0001-01-01/"));
        assert_eq!(AcquiredRange::parse(range.as_str()).unwrap().start_ordinal(), 1);
    }

    #[test]
    fn test_bounds() {
        assert!(bounds(0, 100, 100, 0).is_ok());
        assert!(bounds(100, 100, 0, 0).is_err());
        assert!(bounds(0, 0, 100, 100).is_err());
    }

    #[test]
    fn test_product_date() {
        assert_eq!(product_date("736330").unwrap(), 736_330);
        assert_eq!(product_date("2000-01-01").unwrap(), 730_120);
        assert!(product_date("0").is_err());
        assert!(product_date("not-a-date").is_err());
    }

    #[test]
    fn test_training_window() {
        assert!(training_window(1, 2).is_ok());
        assert!(training_window(3, 2).is_err());
    }
}
