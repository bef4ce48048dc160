//! Recurring schedules for system jobs.

use core::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest accepted fixed interval (ten years).
pub const MAX_INTERVAL_SECS: u64 = 10 * 365 * 86_400;

/// Schedule as written in configuration.
///
/// ```toml
/// schedule = { cron = "0 */5 * * * *" }
/// schedule = { every_secs = 300 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleSpec {
    Cron(String),
    EverySecs(u64),
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleSpec::Cron(expr) => write!(f, "cron:{expr}"),
            ScheduleSpec::EverySecs(secs) => write!(f, "every:{secs}s"),
        }
    }
}

/// A parsed, evaluable schedule.
#[derive(Debug, Clone)]
pub enum Schedule {
    Cron {
        expr: String,
        schedule: Box<cron::Schedule>,
    },
    /// Fixed interval aligned to the Unix epoch.
    Every(Duration),
}

impl Schedule {
    pub fn parse(spec: &ScheduleSpec) -> Result<Self, String> {
        match spec {
            ScheduleSpec::Cron(expr) => {
                let schedule = cron::Schedule::from_str(expr).map_err(|e| e.to_string())?;
                Ok(Schedule::Cron {
                    expr: expr.clone(),
                    schedule: Box::new(schedule),
                })
            }
            ScheduleSpec::EverySecs(0) => Err("interval must be at least one second".into()),
            ScheduleSpec::EverySecs(secs) if *secs > MAX_INTERVAL_SECS => Err(format!(
                "interval of {secs}s exceeds the maximum of {MAX_INTERVAL_SECS}s"
            )),
            ScheduleSpec::EverySecs(secs) => Ok(Schedule::Every(Duration::from_secs(*secs))),
        }
    }

    pub fn spec(&self) -> ScheduleSpec {
        match self {
            Schedule::Cron { expr, .. } => ScheduleSpec::Cron(expr.clone()),
            Schedule::Every(interval) => ScheduleSpec::EverySecs(interval.as_secs()),
        }
    }

    /// First boundary strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron { schedule, .. } => schedule.after(&after).next(),
            Schedule::Every(interval) => {
                let step = step_millis(*interval);
                let next = after
                    .timestamp_millis()
                    .div_euclid(step)
                    .checked_add(1)?
                    .checked_mul(step)?;
                DateTime::from_timestamp_millis(next)
            }
        }
    }

    /// Latest boundary in `(after, now]`, if any.
    ///
    /// Several missed boundaries collapse into the most recent one.
    pub fn latest_due(&self, after: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if now <= after {
            return None;
        }
        match self {
            // Walking back from just past `now` keeps a boundary equal to `now`.
            Schedule::Cron { schedule, .. } => schedule
                .after(&(now + chrono::Duration::nanoseconds(1)))
                .next_back()
                .filter(|boundary| *boundary > after),
            Schedule::Every(interval) => {
                let step = step_millis(*interval);
                let latest = now.timestamp_millis().div_euclid(step) * step;
                if latest > after.timestamp_millis() {
                    DateTime::from_timestamp_millis(latest)
                } else {
                    None
                }
            }
        }
    }
}

/// Interval in milliseconds; `parse` bounds it well inside `i64`.
fn step_millis(interval: Duration) -> i64 {
    i64::try_from(interval.as_millis()).unwrap_or(i64::MAX).max(1)
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.spec().fmt(f)
    }
}
