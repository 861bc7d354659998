//! Five-field cron expressions evaluated in UTC.
//!
//! Supports `*`, lists, ranges and steps on every field, month and weekday
//! names, `7` as Sunday, and the `@hourly`, `@daily`, `@midnight`, `@weekly`,
//! `@monthly`, `@yearly` and `@annually` shorthands.
//!
//! When both day-of-month and day-of-week are restricted, a day matches if
//! either field matches (classic cron behaviour).

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Long enough to cover the gap between two February 29ths.
const SEARCH_HORIZON_DAYS: i64 = 9 * 366;

const MONTH_NAMES: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronParseError {
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),

    #[error("unknown shorthand {0:?}")]
    UnknownShorthand(String),

    #[error("invalid {field} field {value:?}: {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: MONTH_NAMES,
};
// 7 is accepted and folded onto 0.
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: WEEKDAY_NAMES,
};

impl FieldSpec {
    fn error(&self, value: &str, reason: impl Into<String>) -> CronParseError {
        CronParseError::InvalidField {
            field: self.name,
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    fn parse_value(&self, raw: &str, whole: &str) -> Result<u32, CronParseError> {
        let lower = raw.to_ascii_lowercase();
        if let Some(index) = self.names.iter().position(|n| *n == lower) {
            // Month names start at 1, weekday names at 0.
            return Ok(index as u32 + self.min);
        }
        let value: u32 = raw
            .parse()
            .map_err(|_| self.error(whole, format!("{:?} is not a number", raw)))?;
        if value < self.min || value > self.max {
            return Err(self.error(
                whole,
                format!("{} is outside {}-{}", value, self.min, self.max),
            ));
        }
        Ok(value)
    }

    /// Parse one comma-separated field into a bitmask. The flag reports
    /// whether the field was written starting with `*`.
    fn parse(&self, field: &str) -> Result<(u64, bool), CronParseError> {
        let mut mask = 0u64;
        for item in field.split(',') {
            if item.is_empty() {
                return Err(self.error(field, "empty list item"));
            }
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| self.error(field, format!("bad step {:?}", step)))?;
                    if step == 0 {
                        return Err(self.error(field, "step must be positive"));
                    }
                    if step > self.max {
                        return Err(self.error(field, format!("step {} exceeds {}", step, self.max)));
                    }
                    (range, step)
                }
                None => (item, 1),
            };

            let (start, end) = if range == "*" {
                (self.min, self.max)
            } else if let Some((a, b)) = range.split_once('-') {
                let (a, b) = (self.parse_value(a, field)?, self.parse_value(b, field)?);
                if a > b {
                    return Err(self.error(field, format!("range {}-{} is reversed", a, b)));
                }
                (a, b)
            } else {
                let start = self.parse_value(range, field)?;
                // `5/15` means "from 5 to the end, every 15".
                let end = if step > 1 { self.max } else { start };
                (start, end)
            };

            let mut value = Some(start);
            while let Some(v) = value.filter(|v| *v <= end) {
                mask |= 1 << v;
                value = v.checked_add(step);
            }
        }
        Ok((mask, field.starts_with('*')))
    }
}

/// A parsed cron expression.
#[derive(Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    day_of_month_any: bool,
    day_of_week_any: bool,
}

impl fmt::Debug for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronExpression").field(&self.source).finish()
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronExpression {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn expand_shorthand(expression: &str) -> Result<&str, CronParseError> {
    Ok(match expression {
        "@yearly" | "@annually" => "0 0 1 1 *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * 0",
        "@daily" | "@midnight" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        other if other.starts_with('@') => {
            return Err(CronParseError::UnknownShorthand(other.to_string()))
        }
        other => other,
    })
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self, CronParseError> {
        let source = expression.trim();
        let expanded = expand_shorthand(source)?;
        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronParseError::FieldCount(fields.len()));
        }

        let (minutes, _) = MINUTE.parse(fields[0])?;
        let (hours, _) = HOUR.parse(fields[1])?;
        let (days_of_month, day_of_month_any) = DAY_OF_MONTH.parse(fields[2])?;
        let (months, _) = MONTH.parse(fields[3])?;
        let (mut days_of_week, day_of_week_any) = DAY_OF_WEEK.parse(fields[4])?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week | 1) & !(1 << 7);
        }

        Ok(Self {
            source: source.to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            day_of_month_any,
            day_of_week_any,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month & (1 << date.day()) != 0;
        let dow = self.days_of_week & (1 << date.weekday().num_days_from_sunday()) != 0;
        match (self.day_of_month_any, self.day_of_week_any) {
            (false, false) => dom || dow,
            _ => dom && dow,
        }
    }

    /// First matching minute strictly after `after`, or `None` if the
    /// expression never fires (e.g. `0 0 31 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start =
            after.naive_utc().with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let horizon = start + Duration::days(SEARCH_HORIZON_DAYS);
        let mut t: NaiveDateTime = start;

        while t <= horizon {
            let date = t.date();
            if self.months & (1 << date.month()) == 0 {
                let (year, month) = if date.month() == 12 {
                    (date.year() + 1, 1)
                } else {
                    (date.year(), date.month() + 1)
                };
                t = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(date) {
                t = date.succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if self.hours & (1 << t.hour()) == 0 {
                t = date.and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if self.minutes & (1 << t.minute()) == 0 {
                t += Duration::minutes(1);
                continue;
            }
            return Some(Utc.from_utc_datetime(&t));
        }
        None
    }
}

/// Parse `expression` and compute its next firing strictly after `after`.
pub fn next_run(
    expression: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, CronParseError> {
    Ok(CronExpression::parse(expression)?.next_after(after))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_next_after_fixtures() {
        let fixtures = [
            ("* * * * *", "2024-05-10T10:15:30Z", "2024-05-10T10:16:00Z"),
            ("0 * * * *", "2024-05-10T10:15:00Z", "2024-05-10T11:00:00Z"),
            ("0 * * * *", "2024-05-10T10:00:00Z", "2024-05-10T11:00:00Z"),
            ("30 3 * * *", "2024-05-10T10:15:00Z", "2024-05-11T03:30:00Z"),
            ("30 3 * * *", "2024-05-10T02:00:00Z", "2024-05-10T03:30:00Z"),
            ("*/15 * * * *", "2024-05-10T10:16:00Z", "2024-05-10T10:30:00Z"),
            ("5/20 * * * *", "2024-05-10T10:46:00Z", "2024-05-10T11:05:00Z"),
            ("0 22 * * *", "2024-12-31T23:00:00Z", "2025-01-01T22:00:00Z"),
            ("0 9 * * 1-5", "2024-03-08T18:00:00Z", "2024-03-11T09:00:00Z"),
            ("0 0 1 * *", "2024-01-31T12:00:00Z", "2024-02-01T00:00:00Z"),
            ("0 0 29 2 *", "2024-03-01T00:00:00Z", "2028-02-29T00:00:00Z"),
            ("0 12 1 * 1", "2024-04-02T00:00:00Z", "2024-04-08T12:00:00Z"),
            ("0 0 * JAN,jul SUN", "2024-06-01T00:00:00Z", "2024-07-07T00:00:00Z"),
            ("15 14 * * 7", "2024-05-10T00:00:00Z", "2024-05-12T14:15:00Z"),
            ("0,30 8-9 * * *", "2024-05-10T08:31:00Z", "2024-05-10T09:00:00Z"),
            ("@hourly", "2024-05-10T10:15:00Z", "2024-05-10T11:00:00Z"),
            ("@daily", "2024-05-10T10:15:00Z", "2024-05-11T00:00:00Z"),
            ("@weekly", "2024-05-10T10:15:00Z", "2024-05-12T00:00:00Z"),
            ("@yearly", "2024-05-10T10:15:00Z", "2025-01-01T00:00:00Z"),
        ];

        for (expression, after, expected) in fixtures {
            let cron = CronExpression::parse(expression).unwrap();
            assert_eq!(
                cron.next_after(at(after)),
                Some(at(expected)),
                "{} after {}",
                expression,
                after
            );
        }
    }

    #[test]
    fn test_next_is_strictly_in_future() {
        let now = at("2024-05-10T10:15:00.250Z");
        let next = next_run("* * * * *", now).unwrap().unwrap();
        assert!(next > now);
        assert_eq!(next, at("2024-05-10T10:16:00Z"));
    }

    #[test]
    fn test_impossible_date_never_fires() {
        let cron = CronExpression::parse("0 0 31 4 *").unwrap();
        assert_eq!(cron.next_after(at("2024-01-01T00:00:00Z")), None);
    }

    #[test]
    fn test_invalid_expressions() {
        for expression in [
            "",
            "* * * *",
            "* * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "* * * * 8",
            "*/0 * * * *",
            "5-1 * * * *",
            "abc * * * *",
            "1,,2 * * * *",
            "1/4294967295 * * * *",
            "*/4294967296 * * * *",
            "0 */25 * * *",
            "@reboot",
        ] {
            assert!(
                CronExpression::parse(expression).is_err(),
                "{:?} should be rejected",
                expression
            );
        }
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            CronExpression::parse("* * *").unwrap_err(),
            CronParseError::FieldCount(3)
        );
        let err = CronExpression::parse("61 * * * *").unwrap_err().to_string();
        assert!(err.contains("minute"), "{}", err);
    }

    #[test]
    fn test_display_keeps_source() {
        let cron: CronExpression = " 0 * * * * ".parse().unwrap();
        assert_eq!(cron.to_string(), "0 * * * *");
        assert_eq!(cron.as_str(), "0 * * * *");
    }
}
