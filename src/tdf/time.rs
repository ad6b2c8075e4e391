//! Device epoch timestamps.
//!
//! Devices stamp telemetry in ticks of 1/65536 s counted from the GPS epoch
//! (1980-01-06T00:00:00 UTC). Conversions to Unix time account for the fixed
//! epoch offset and the leap seconds GPS time has accumulated over UTC.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Seconds between the Unix epoch and the GPS epoch.
pub const GPS_UNIX_OFFSET: u64 = 315_964_800;

/// Leap seconds accumulated between GPS time and UTC.
pub const LEAP_SECONDS: u64 = 18;

/// Device clock resolution: ticks per second.
pub const TICKS_PER_SECOND: u32 = 65_536;

/// An instant on the device clock.
///
/// Stored as whole ticks since the GPS epoch, which is exactly what the
/// telemetry wire format carries. Ordering and equality compare tick counts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct DeviceTime(u64);

impl DeviceTime {
    pub const fn from_ticks(ticks: u64) -> Self {
        Self(ticks)
    }

    /// Builds a time from the wire encoding of an absolute timestamp.
    pub const fn from_parts(seconds: u32, subseconds: u16) -> Self {
        Self((seconds as u64) * TICKS_PER_SECOND as u64 + subseconds as u64)
    }

    pub const fn ticks(self) -> u64 {
        self.0
    }

    /// Whole GPS seconds.
    pub const fn seconds(self) -> u64 {
        self.0 / TICKS_PER_SECOND as u64
    }

    /// Sub-second remainder in ticks.
    pub const fn subseconds(self) -> u16 {
        (self.0 % TICKS_PER_SECOND as u64) as u16
    }

    /// Unix timestamp, seconds with fractional ticks.
    pub fn unix_time(self) -> f64 {
        let seconds = self.seconds() + GPS_UNIX_OFFSET - LEAP_SECONDS;
        seconds as f64 + self.subseconds() as f64 / TICKS_PER_SECOND as f64
    }

    /// Nearest device time to a Unix timestamp. Times before the GPS epoch
    /// clamp to zero.
    pub fn from_unix(unix: f64) -> Self {
        let gps = unix - GPS_UNIX_OFFSET as f64 + LEAP_SECONDS as f64;
        if gps <= 0.0 {
            return Self(0);
        }
        Self((gps * TICKS_PER_SECOND as f64).round() as u64)
    }

    /// Applies a signed tick offset, as relative timestamps on the wire do.
    pub const fn offset_ticks(self, delta: i64) -> Self {
        Self(self.0.wrapping_add_signed(delta))
    }

    /// UTC calendar rendering with millisecond precision.
    pub fn utc_string(self) -> String {
        let seconds = (self.seconds() + GPS_UNIX_OFFSET - LEAP_SECONDS) as i64;
        let nanos = (self.subseconds() as u64 * 1_000_000_000 / TICKS_PER_SECOND as u64) as u32;
        match DateTime::from_timestamp(seconds, nanos) {
            Some(utc) => utc.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            None => format!("unix {seconds}s (outside the calendar range)"),
        }
    }
}

impl fmt::Display for DeviceTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.utc_string())
    }
}
