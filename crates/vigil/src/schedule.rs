//! Minute-granularity schedule descriptors.
//!
//! A descriptor has the familiar five cron fields (minute, hour, day, month,
//! weekday) but only the minute field is evaluated. Supported minute forms:
//!
//! - `*`: every minute
//! - `*/N`: every N minutes, N > 0
//! - `M`: once an hour, at minute M (0-59)
//!
//! The remaining four fields are kept verbatim so descriptors written for a
//! full cron daemon round-trip unchanged, but they never restrict matching.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, DurationRound, Timelike, Utc};
use thiserror::Error;

const FIELD_COUNT: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("schedule must have exactly {FIELD_COUNT} fields, got {0}")]
    FieldCount(usize),
    #[error("invalid minute field: {0:?}")]
    InvalidMinute(String),
    #[error("minute interval must be greater than zero")]
    ZeroInterval,
}

/// Interpreted form of the minute field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinuteField {
    Every,
    Interval(u32),
    At(u32),
}

impl MinuteField {
    fn parse(raw: &str) -> Result<Self, ScheduleError> {
        if raw == "*" {
            return Ok(MinuteField::Every);
        }

        if let Some(step) = raw.strip_prefix("*/") {
            let step: u32 =
                step.parse().map_err(|_| ScheduleError::InvalidMinute(raw.to_string()))?;
            if step == 0 {
                return Err(ScheduleError::ZeroInterval);
            }
            return Ok(MinuteField::Interval(step));
        }

        match raw.parse::<u32>() {
            Ok(minute) if minute < 60 => Ok(MinuteField::At(minute)),
            _ => Err(ScheduleError::InvalidMinute(raw.to_string())),
        }
    }
}

impl fmt::Display for MinuteField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MinuteField::Every => write!(f, "*"),
            MinuteField::Interval(step) => write!(f, "*/{step}"),
            MinuteField::At(minute) => write!(f, "{minute}"),
        }
    }
}

/// A parsed schedule descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    minute: MinuteField,
    /// hour, day, month and weekday, stored but not evaluated
    rest: [String; FIELD_COUNT - 1],
}

impl Schedule {
    pub fn parse(descriptor: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = descriptor.split_whitespace().collect();
        let [minute, hour, day, month, weekday] = fields.as_slice() else {
            return Err(ScheduleError::FieldCount(fields.len()));
        };

        Ok(Self {
            minute: MinuteField::parse(minute)?,
            rest: [hour, day, month, weekday].map(|field| field.to_string()),
        })
    }

    pub fn minute(&self) -> MinuteField {
        self.minute
    }

    /// Whether `now` falls on a matching minute
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let minute = now.minute();
        match self.minute {
            MinuteField::Every => true,
            MinuteField::Interval(step) => minute % step == 0,
            MinuteField::At(at) => minute == at,
        }
    }

    /// First matching whole minute strictly after `from`
    pub fn next_due_after(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        let current = truncate_to_minute(from);
        let minute = current.minute();
        let hour_start = current - Duration::minutes(i64::from(minute));

        match self.minute {
            MinuteField::Every => current + Duration::minutes(1),
            MinuteField::Interval(step) => {
                let next = (minute / step + 1) * step;
                if next >= 60 {
                    hour_start + Duration::hours(1)
                } else {
                    hour_start + Duration::minutes(i64::from(next))
                }
            }
            MinuteField::At(at) if minute >= at => {
                hour_start + Duration::hours(1) + Duration::minutes(i64::from(at))
            }
            MinuteField::At(at) => hour_start + Duration::minutes(i64::from(at)),
        }
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.minute)?;
        for field in &self.rest {
            write!(f, " {field}")?;
        }
        Ok(())
    }
}

fn truncate_to_minute(time: DateTime<Utc>) -> DateTime<Utc> {
    time.duration_trunc(Duration::minutes(1)).unwrap_or(time)
}
