//! Cron expressions evaluated in an IANA timezone.
//!
//! Automations use standard 5-field expressions (`min hour dom month dow`,
//! Sunday = 0 or 7). The `cron` crate wants 7 fields with seconds and year
//! and numbers weekdays from 1 = Sunday, so expressions are normalised
//! before parsing. Shortcuts such as `@daily` pass through unchanged.

use std::str::FromStr;

use chrono::{DateTime, Duration, Timelike, Utc};
use chrono_tz::Tz;
use ::cron::Schedule;

/// A parsed schedule bound to its timezone.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
    timezone: Tz,
}

impl CronSchedule {
    pub fn parse(expression: &str, timezone: &str) -> Result<Self, String> {
        let timezone: Tz = timezone
            .parse()
            .map_err(|_| format!("unknown timezone '{timezone}'"))?;
        let normalized = normalize_cron_expression(expression)?;
        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| format!("invalid cron expression '{expression}': {e}"))?;

        Ok(Self {
            expression: expression.to_string(),
            schedule,
            timezone,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Whether the schedule fires in the minute containing `at`.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        let minute = truncate_to_minute(at).with_timezone(&self.timezone);
        self.schedule
            .after(&(minute - Duration::seconds(1)))
            .next()
            .is_some_and(|next| next == minute)
    }

    /// The next `count` fire times strictly after `after`, in UTC.
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .take(count)
            .map(|at| at.with_timezone(&Utc))
            .collect()
    }
}

pub fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_second(0)
        .and_then(|at| at.with_nanosecond(0))
        .unwrap_or(at)
}

/// Convert a 5-field expression to the 7-field form the `cron` crate expects.
fn normalize_cron_expression(expression: &str) -> Result<String, String> {
    let trimmed = expression.trim();
    if trimmed.starts_with('@') {
        return Ok(trimmed.to_string());
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    match fields.as_slice() {
        [minute, hour, dom, month, dow] => Ok(format!(
            "0 {minute} {hour} {dom} {month} {} *",
            weekday_names(dow)?
        )),
        _ => Err(format!(
            "expected 5 fields (min hour day month weekday), got {} in '{expression}'",
            fields.len()
        )),
    }
}

const WEEKDAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

/// Rewrite numeric weekdays to names; step values after `/` stay numeric.
fn weekday_names(field: &str) -> Result<String, String> {
    let name = |value: &str| -> Result<String, String> {
        match value.parse::<usize>() {
            Ok(n) => WEEKDAYS
                .get(n)
                .map(|s| s.to_string())
                .ok_or_else(|| format!("weekday {n} out of range")),
            Err(_) => Ok(value.to_string()),
        }
    };

    let items = field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (item, None),
            };
            let range = match range.split_once('-') {
                // `5-7` would wrap to Sunday at the front of the week.
                Some((start, "7")) => format!("{}-SAT,SUN", name(start)?),
                Some((start, end)) => format!("{}-{}", name(start)?, name(end)?),
                None => name(range)?,
            };
            Ok(match step {
                Some(step) => format!("{range}/{step}"),
                None => range,
            })
        })
        .collect::<Result<Vec<_>, String>>()?;

    Ok(items.join(","))
}
