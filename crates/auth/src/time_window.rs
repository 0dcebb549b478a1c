//! Time-of-day validity windows for user credentials.

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use keyward_core::{TrustError, TrustResult};

/// Wall-clock window, `HH:MM:SS` on both ends.
///
/// `end < start` wraps past midnight; `end == start` covers the whole day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

impl TimeRange {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    start: NaiveTime,
    end: NaiveTime,
}

/// Parsed set of windows. Valid when `now` falls in any of them.
#[derive(Debug, Clone)]
pub struct TimeWindows {
    tz: Tz,
    windows: Vec<Window>,
}

fn parse_time(s: &str) -> TrustResult<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| TrustError::malformed(format!("invalid time of day {s:?}")))
}

impl TimeWindows {
    pub fn parse(ranges: &[TimeRange], locale: Option<&str>) -> TrustResult<Self> {
        let tz = match locale.filter(|l| !l.is_empty()) {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| TrustError::malformed(format!("unknown locale {name:?}")))?,
            None => Tz::UTC,
        };
        let windows = ranges
            .iter()
            .map(|r| {
                Ok(Window {
                    start: parse_time(&r.start)?,
                    end: parse_time(&r.end)?,
                })
            })
            .collect::<TrustResult<Vec<_>>>()?;
        Ok(Self { tz, windows })
    }

    /// No windows configured: always valid.
    pub fn is_unrestricted(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.is_unrestricted() || self.windows.iter().any(|w| self.window_end(w, now).is_some())
    }

    /// Earliest end among the windows containing `now`.
    ///
    /// `None` when unrestricted, outside every window, or inside a whole-day
    /// window. When the returned instant passes, [`Self::contains`] decides
    /// whether another window carries the session on.
    pub fn current_window_end(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut ends = Vec::new();
        for w in &self.windows {
            match self.window_end(w, now) {
                Some(Some(end)) => ends.push(end),
                Some(None) => return None,
                None => {}
            }
        }
        ends.into_iter().min()
    }

    /// `None` if `w` doesn't contain `now`; `Some(None)` if it never ends.
    fn window_end(&self, w: &Window, now: DateTime<Utc>) -> Option<Option<DateTime<Utc>>> {
        let local = now.with_timezone(&self.tz).naive_local();
        let today = local.date();
        let t = local.time();

        if w.start == w.end {
            return Some(None);
        }
        let end_day = if w.start < w.end {
            if t < w.start || t >= w.end {
                return None;
            }
            today
        } else if t >= w.start {
            today.checked_add_days(Days::new(1))?
        } else if t < w.end {
            today
        } else {
            return None;
        };
        Some(Some(self.to_utc(end_day, w.end)))
    }

    fn to_utc(&self, day: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let naive = NaiveDateTime::new(day, time);
        match self.tz.from_local_datetime(&naive).earliest() {
            Some(dt) => dt.with_timezone(&Utc),
            // Skipped by a DST jump: treat the wall clock as UTC.
            None => Utc.from_utc_datetime(&naive),
        }
    }
}
