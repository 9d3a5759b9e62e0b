//! Cron expressions for recurring triggers.
//!
//! Accepts standard 5-field cron, 6-field cron with seconds, the `@hourly`
//! family of shortcuts and `@every <interval>` expressions. Recurring triggers
//! only ever ask one question of a schedule: when is the next fire time after
//! a given instant.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when parsing or evaluating a schedule.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// Invalid cron expression.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    /// Invalid `@every` interval.
    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    /// Invalid timezone name.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// The expression never fires again.
    #[error("no more occurrences")]
    NoMoreOccurrences,
}

#[derive(Clone)]
enum Kind {
    Cron(Box<CronSchedule>),
    Every(Duration),
}

/// A parsed schedule bound to a timezone.
#[derive(Clone)]
pub struct Schedule {
    expression: String,
    timezone: Tz,
    kind: Kind,
}

impl Schedule {
    /// Parse an expression evaluated in UTC.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        Self::parse_in(expression, Tz::UTC)
    }

    /// Parse an expression evaluated in the named timezone.
    pub fn parse_with_timezone(expression: &str, timezone: &str) -> Result<Self, ScheduleError> {
        let tz = timezone
            .parse::<Tz>()
            .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))?;
        Self::parse_in(expression, tz)
    }

    /// Parse an expression evaluated in `timezone`.
    pub fn parse_in(expression: &str, timezone: Tz) -> Result<Self, ScheduleError> {
        let trimmed = expression.trim();
        let kind = match trimmed.to_lowercase().as_str() {
            "@yearly" | "@annually" => cron_kind(trimmed, "0 0 0 1 1 *")?,
            "@monthly" => cron_kind(trimmed, "0 0 0 1 * *")?,
            "@weekly" => cron_kind(trimmed, "0 0 0 * * SUN")?,
            "@daily" | "@midnight" => cron_kind(trimmed, "0 0 0 * * *")?,
            "@hourly" => cron_kind(trimmed, "0 0 * * * *")?,
            lower if lower.starts_with("@every ") => Kind::Every(parse_interval(&lower[7..])?),
            _ if trimmed.starts_with('@') => {
                return Err(ScheduleError::InvalidCron {
                    expression: trimmed.to_string(),
                    reason: "unknown shortcut".into(),
                });
            }
            _ => {
                let fields = trimmed.split_whitespace().count();
                match fields {
                    5 => cron_kind(trimmed, &format!("0 {}", trimmed))?,
                    6 => cron_kind(trimmed, trimmed)?,
                    n => {
                        return Err(ScheduleError::InvalidCron {
                            expression: trimmed.to_string(),
                            reason: format!("expected 5 or 6 fields, got {}", n),
                        });
                    }
                }
            }
        };

        Ok(Self {
            expression: trimmed.to_string(),
            timezone,
            kind,
        })
    }

    /// Next fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        match &self.kind {
            Kind::Cron(cron) => cron
                .after(&after.with_timezone(&self.timezone))
                .next()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or(ScheduleError::NoMoreOccurrences),
            Kind::Every(every) => {
                let step = chrono::Duration::from_std(*every)
                    .map_err(|e| ScheduleError::InvalidInterval(e.to_string()))?;
                after
                    .checked_add_signed(step)
                    .ok_or(ScheduleError::NoMoreOccurrences)
            }
        }
    }

    /// The expression as written (trimmed).
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Timezone the expression is evaluated in.
    pub fn timezone(&self) -> Tz {
        self.timezone
    }
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule")
            .field("expression", &self.expression)
            .field("timezone", &self.timezone.name())
            .finish()
    }
}

impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression && self.timezone == other.timezone
    }
}

fn cron_kind(original: &str, six_field: &str) -> Result<Kind, ScheduleError> {
    CronSchedule::from_str(six_field)
        .map(|s| Kind::Cron(Box::new(s)))
        .map_err(|e| ScheduleError::InvalidCron {
            expression: original.to_string(),
            reason: e.to_string(),
        })
}

/// Parse an interval such as `"30s"`, `"5m"` or `"1h30m"`.
pub fn parse_interval(text: &str) -> Result<Duration, ScheduleError> {
    let text = text.trim();
    let mut total: u64 = 0;
    let mut digits = String::new();

    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: u64 = digits
            .parse()
            .map_err(|_| ScheduleError::InvalidInterval(text.to_string()))?;
        digits.clear();
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86_400,
            _ => return Err(ScheduleError::InvalidInterval(text.to_string())),
        };
        total = n
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(|| ScheduleError::InvalidInterval(text.to_string()))?;
    }

    if !digits.is_empty() || total == 0 {
        return Err(ScheduleError::InvalidInterval(text.to_string()));
    }
    Ok(Duration::from_secs(total))
}
