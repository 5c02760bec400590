//! Wall-clock utilities on a continuous day-numbered time scale.
//!
//! Absolute scan start times are exchanged as a DMJD (decimal Modified Julian
//! Date): whole days since 1858-11-17 plus the fraction of the current day.
//! Comparison is a plain numeric comparison. No timezone handling is done; all
//! inputs are treated as UTC.
//!
//! # Precision
//!
//! Conversions keep only whole seconds of the underlying calendar clock, so a
//! scan commanded to start at a sub-second instant starts on the following
//! whole-second boundary at the earliest. This coarseness is intentional.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// MJD of the Unix epoch (1970-01-01T00:00:00Z).
pub const MJD_UNIX_EPOCH: i64 = 40_587;

/// Seconds per day.
pub const SECONDS_PER_DAY: i64 = 86_400;

/// Calendar format accepted for start times: `yy:mm:dd:HH:MM:SS`.
pub const CALENDAR_FORMAT: &str = "%y:%m:%d:%H:%M:%S";

/// An absolute time as a decimal MJD.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dmjd(pub f64);

impl Dmjd {
    /// Convert whole seconds since the Unix epoch.
    pub fn from_unix_secs(secs: i64) -> Self {
        let days = secs.div_euclid(SECONDS_PER_DAY);
        let rem = secs.rem_euclid(SECONDS_PER_DAY);
        Dmjd((days + MJD_UNIX_EPOCH) as f64 + rem as f64 / SECONDS_PER_DAY as f64)
    }

    /// Convert back to seconds since the Unix epoch, rounded to the nearest second.
    pub fn to_unix_secs(self) -> i64 {
        let mjd = self.0.floor();
        let frac = self.0 - mjd;
        let secs = (mjd - MJD_UNIX_EPOCH as f64) * SECONDS_PER_DAY as f64
            + frac * SECONDS_PER_DAY as f64;
        secs.round() as i64
    }

    /// Convert a UTC timestamp, discarding sub-second precision.
    pub fn from_datetime(time: DateTime<Utc>) -> Self {
        Self::from_unix_secs(time.timestamp())
    }

    /// Back to a UTC timestamp (whole seconds).
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.to_unix_secs(), 0).single()
    }

    /// Parse a `yy:mm:dd:HH:MM:SS` calendar string as UTC.
    pub fn from_calendar(text: &str) -> Result<Self, chrono::ParseError> {
        let naive = NaiveDateTime::parse_from_str(text.trim(), CALENDAR_FORMAT)?;
        Ok(Self::from_datetime(naive.and_utc()))
    }

    /// The DMJD `secs` seconds after `self`.
    pub fn offset_secs(self, secs: i64) -> Self {
        Self::from_unix_secs(self.to_unix_secs() + secs)
    }

    /// Raw day count.
    pub fn value(self) -> f64 {
        self.0
    }
}

impl fmt::Display for Dmjd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.0)
    }
}

/// The current time as a DMJD.
pub fn now() -> Dmjd {
    Dmjd::from_datetime(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_epoch_is_mjd_40587() {
        assert_eq!(Dmjd::from_unix_secs(0), Dmjd(40_587.0));
        assert_eq!(Dmjd(40_587.0).to_unix_secs(), 0);
    }

    #[test]
    fn half_day_is_half_fraction() {
        let dmjd = Dmjd::from_unix_secs(SECONDS_PER_DAY / 2);
        assert!((dmjd.0 - 40_587.5).abs() < 1e-9);
    }

    #[test]
    fn calendar_round_trip_keeps_whole_seconds() {
        let dmjd = Dmjd::from_calendar("15:05:12:15:07:00").unwrap();
        let back = dmjd.to_datetime().unwrap();
        assert_eq!(back.to_rfc3339(), "2015-05-12T15:07:00+00:00");
        assert!((dmjd.0 - 57_154.629_861).abs() < 1e-6);
    }

    #[test]
    fn sub_second_precision_is_dropped() {
        let time = Utc.timestamp_opt(1_431_443_220, 900_000_000).unwrap();
        assert_eq!(
            Dmjd::from_datetime(time),
            Dmjd::from_unix_secs(1_431_443_220)
        );
    }

    #[test]
    fn pre_epoch_times_stay_ordered() {
        assert!(Dmjd::from_unix_secs(-1) < Dmjd::from_unix_secs(0));
        assert_eq!(Dmjd::from_unix_secs(-1).to_unix_secs(), -1);
    }

    #[test]
    fn offset_moves_forward() {
        let start = Dmjd::from_unix_secs(1_000);
        assert!(start.offset_secs(5) > start);
        assert_eq!(start.offset_secs(5).to_unix_secs(), 1_005);
    }

    #[test]
    fn bad_calendar_text_is_an_error() {
        assert!(Dmjd::from_calendar("yesterday").is_err());
    }
}
