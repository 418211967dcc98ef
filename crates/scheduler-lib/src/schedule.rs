//! Off-schedule windows
//!
//! Parses the `scheduler.off-schedule` annotation into a [`TimeRange`] and
//! decides whether a wall-clock time falls inside it. Only the hour and
//! minute components of a time are ever compared.

use crate::workload::SCHEDULE_ANNOTATION;
use chrono::{Local, NaiveTime, Timelike, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;

/// Schedule annotation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("could not find scheduler.off-schedule annotation")]
    MissingAnnotation,

    #[error("invalid schedule '{text}': {reason}")]
    InvalidFormat { text: String, reason: String },
}

impl ScheduleError {
    fn invalid(text: &str, reason: impl Into<String>) -> Self {
        ScheduleError::InvalidFormat {
            text: text.to_string(),
            reason: reason.into(),
        }
    }
}

/// A daily window between two wall-clock times
///
/// When `end` is before `start` the window wraps past midnight, so
/// `22:00-06:00` covers the night. Both bounds are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            start: truncate_to_minute(start),
            end: truncate_to_minute(end),
        }
    }

    /// Build a range from hour/minute pairs, `None` if any component is out of range
    pub fn from_hm(start: (u32, u32), end: (u32, u32)) -> Option<Self> {
        Some(Self::new(
            NaiveTime::from_hms_opt(start.0, start.1, 0)?,
            NaiveTime::from_hms_opt(end.0, end.1, 0)?,
        ))
    }

    pub fn wraps_midnight(&self) -> bool {
        self.end < self.start
    }

    /// Check whether `now` lies strictly inside the window
    pub fn contains(&self, now: NaiveTime) -> bool {
        let now = truncate_to_minute(now);
        if self.wraps_midnight() {
            now > self.start || now < self.end
        } else {
            now > self.start && now < self.end
        }
    }

    /// Check the window against the current time of `clock`
    pub fn in_range_now(&self, clock: &dyn Clock) -> bool {
        self.contains(clock.now())
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}-{:02}:{:02}",
            self.start.hour(),
            self.start.minute(),
            self.end.hour(),
            self.end.minute()
        )
    }
}

impl FromStr for TimeRange {
    type Err = ScheduleError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = text.split('-').collect();
        if tokens.len() != 2 {
            return Err(ScheduleError::invalid(
                text,
                format!("expected HH:MM-HH:MM, found {} part(s)", tokens.len()),
            ));
        }

        let start = parse_clock(tokens[0].trim()).map_err(|r| ScheduleError::invalid(text, r))?;
        let end = parse_clock(tokens[1].trim()).map_err(|r| ScheduleError::invalid(text, r))?;
        Ok(Self { start, end })
    }
}

/// Parse the off-schedule window out of a workload's annotations
pub fn parse_schedule(annotations: &BTreeMap<String, String>) -> Result<TimeRange, ScheduleError> {
    let text = annotations
        .get(SCHEDULE_ANNOTATION)
        .ok_or(ScheduleError::MissingAnnotation)?;
    text.parse()
}

/// Parse `H:MM` or `HH:MM` in 24-hour notation
fn parse_clock(token: &str) -> Result<NaiveTime, String> {
    let (hour, minute) = token
        .split_once(':')
        .ok_or_else(|| format!("'{}' is not HH:MM", token))?;

    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(hour) || hour.len() > 2 || !all_digits(minute) || minute.len() != 2 {
        return Err(format!("'{}' is not HH:MM", token));
    }

    let hour: u32 = hour.parse().map_err(|_| format!("bad hour in '{}'", token))?;
    let minute: u32 = minute
        .parse()
        .map_err(|_| format!("bad minute in '{}'", token))?;
    if hour > 23 {
        return Err(format!("hour out of range in '{}'", token));
    }
    if minute > 59 {
        return Err(format!("minute out of range in '{}'", token));
    }

    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| format!("'{}' is not a time", token))
}

fn truncate_to_minute(t: NaiveTime) -> NaiveTime {
    NaiveTime::from_hms_opt(t.hour(), t.minute(), 0).unwrap_or(t)
}

/// Source of the current wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveTime;
}

/// Process wall clock, local time unless configured for UTC
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock {
    pub utc: bool,
}

impl SystemClock {
    pub fn local() -> Self {
        Self { utc: false }
    }

    pub fn utc() -> Self {
        Self { utc: true }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> NaiveTime {
        if self.utc {
            Utc::now().time()
        } else {
            Local::now().time()
        }
    }
}

/// Clock pinned to a settable time
#[derive(Debug)]
pub struct FixedClock {
    time: Mutex<NaiveTime>,
}

impl FixedClock {
    pub fn new(time: NaiveTime) -> Self {
        Self {
            time: Mutex::new(time),
        }
    }

    /// Clock at `hour:minute`; out-of-range values fall back to midnight
    pub fn at(hour: u32, minute: u32) -> Self {
        Self::new(NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN))
    }

    pub fn set(&self, time: NaiveTime) {
        *self.time.lock().unwrap_or_else(|e| e.into_inner()) = time;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveTime {
        *self.time.lock().unwrap_or_else(|e| e.into_inner())
    }
}
