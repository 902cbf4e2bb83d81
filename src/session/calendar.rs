//! Server Calendar
//!
//! Daily and weekly reset boundaries are calendar dates and ISO weeks in the
//! server's local timezone, not 24h/168h windows since the last login.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, Utc};
use serde::{Deserialize, Serialize};

/// Default server offset (UTC+9).
pub const DEFAULT_UTC_OFFSET_SECS: i32 = 9 * 3600;

/// Which resets a login triggers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetBoundary {
    /// A new server day started since the last login.
    pub daily: bool,
    /// A new ISO week started since the last login. Implies `daily`.
    pub weekly: bool,
}

impl ResetBoundary {
    /// Both boundaries crossed (first login ever).
    pub const BOTH: Self = Self { daily: true, weekly: true };
    /// No boundary crossed.
    pub const NONE: Self = Self { daily: false, weekly: false };
}

/// Server-local clock used for boundary math.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServerClock {
    offset: FixedOffset,
}

impl Default for ServerClock {
    fn default() -> Self {
        Self::from_offset_secs(DEFAULT_UTC_OFFSET_SECS).unwrap_or_else(Self::utc)
    }
}

impl ServerClock {
    /// Clock with a fixed UTC offset.
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// UTC clock.
    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    /// Clock from an offset in seconds east of UTC. `None` if out of range.
    pub fn from_offset_secs(secs: i32) -> Option<Self> {
        FixedOffset::east_opt(secs).map(Self::new)
    }

    /// Configured offset.
    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Server calendar date of an instant.
    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.offset).date_naive()
    }

    /// First instant of the server day after the one containing `instant`.
    pub fn next_day_start(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let tomorrow = self.local_date(instant) + Duration::days(1);
        let midnight = tomorrow.and_time(NaiveTime::MIN);
        // Fixed offsets have no gaps, so local midnight always maps to one instant
        (midnight - Duration::seconds(i64::from(self.offset.local_minus_utc()))).and_utc()
    }

    /// Boundaries crossed between the last login and `now`.
    ///
    /// Weekly is only checked once daily fired. A clock that moved backwards
    /// crosses nothing.
    pub fn detect(&self, last_login: Option<DateTime<Utc>>, now: DateTime<Utc>) -> ResetBoundary {
        let Some(last) = last_login else {
            return ResetBoundary::BOTH;
        };

        let last_date = self.local_date(last);
        let now_date = self.local_date(now);

        if now_date <= last_date {
            return ResetBoundary::NONE;
        }

        let last_week = last_date.iso_week();
        let now_week = now_date.iso_week();
        let weekly = (last_week.year(), last_week.week()) != (now_week.year(), now_week.week());

        ResetBoundary { daily: true, weekly }
    }
}
