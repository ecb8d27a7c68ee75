//! Five-field cron schedules
//!
//! `minute hour day-of-month month day-of-week`, evaluated in UTC. Each
//! field accepts `*`, numbers, ranges `a-b`, lists `a,b` and steps `*/n`
//! or `a-b/n`. Day-of-week runs 0-7 with both 0 and 7 meaning Sunday.
//! When both day fields are restricted a day matches if either does.
//!
//! ```ignore
//! let every_five = CronSchedule::parse("*/5 * * * *")?;
//! let next = every_five.next_after(Utc::now());
//! ```

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),

    #[error("invalid {field} field `{value}`")]
    InvalidField { field: &'static str, value: String },
}

/// Set of allowed values of one field as a bit mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FieldSet {
    bits: u64,
    restricted: bool,
}

impl FieldSet {
    fn contains(&self, v: u32) -> bool {
        self.bits & (1u64 << v) != 0
    }

    fn parse(expr: &str, field: &'static str, min: u32, max: u32) -> Result<Self, CronError> {
        let invalid = || CronError::InvalidField {
            field,
            value: expr.to_string(),
        };
        let mut bits = 0u64;
        for part in expr.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((r, s)) => (r, s.parse::<u32>().map_err(|_| invalid())?),
                None => (part, 1),
            };
            if step == 0 {
                return Err(invalid());
            }
            let (lo, hi) = if range == "*" {
                (min, max)
            } else if let Some((a, b)) = range.split_once('-') {
                (
                    a.parse::<u32>().map_err(|_| invalid())?,
                    b.parse::<u32>().map_err(|_| invalid())?,
                )
            } else {
                let v = range.parse::<u32>().map_err(|_| invalid())?;
                // `5/15` runs from 5 to the end of the field
                (v, if part.contains('/') { max } else { v })
            };
            if lo < min || hi > max || lo > hi {
                return Err(invalid());
            }
            let mut v = lo;
            while v <= hi {
                bits |= 1u64 << v;
                v += step;
            }
        }
        Ok(Self {
            bits,
            restricted: !expr.starts_with('*'),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CronSchedule {
    expression: String,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
}

/// Searching further ahead than this gives up (e.g. `0 0 31 2 *`).
const MAX_SEARCH_DAYS: i64 = 366 * 5;

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }
        let mut days_of_week = FieldSet::parse(fields[4], "day-of-week", 0, 7)?;
        if days_of_week.contains(7) {
            days_of_week.bits |= 1;
        }
        Ok(Self {
            expression: fields.join(" "),
            minutes: FieldSet::parse(fields[0], "minute", 0, 59)?,
            hours: FieldSet::parse(fields[1], "hour", 0, 23)?,
            days_of_month: FieldSet::parse(fields[2], "day-of-month", 1, 31)?,
            months: FieldSet::parse(fields[3], "month", 1, 12)?,
            days_of_week,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn day_matches(&self, t: &DateTime<Utc>) -> bool {
        let dom = self.days_of_month.contains(t.day());
        let dow = self.days_of_week.contains(t.weekday().num_days_from_sunday());
        match (self.days_of_month.restricted, self.days_of_week.restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First firing time strictly after `after`, at minute resolution.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit = start + Duration::days(MAX_SEARCH_DAYS);
        let mut t = start;

        while t < limit {
            if !self.months.contains(t.month()) {
                let (y, m) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.day_matches(&t) {
                t = start_of_day(t)? + Duration::days(1);
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

fn start_of_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
        .single()
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_every_five_minutes() {
        let s = CronSchedule::parse("*/5 * * * *").unwrap();
        assert_eq!(s.next_after(at(2024, 1, 1, 10, 2)), Some(at(2024, 1, 1, 10, 5)));
        assert_eq!(s.next_after(at(2024, 1, 1, 10, 5)), Some(at(2024, 1, 1, 10, 10)));
        assert_eq!(s.next_after(at(2024, 1, 1, 23, 58)), Some(at(2024, 1, 2, 0, 0)));
    }

    #[test]
    fn test_daily_and_monthly() {
        let daily = CronSchedule::parse("30 2 * * *").unwrap();
        assert_eq!(daily.next_after(at(2024, 3, 10, 3, 0)), Some(at(2024, 3, 11, 2, 30)));

        let monthly = CronSchedule::parse("0 0 1 * *").unwrap();
        assert_eq!(monthly.next_after(at(2024, 12, 15, 0, 0)), Some(at(2025, 1, 1, 0, 0)));
    }

    #[test]
    fn test_day_of_week() {
        // 2024-01-01 is a Monday
        let sundays = CronSchedule::parse("0 12 * * 7").unwrap();
        assert_eq!(sundays.next_after(at(2024, 1, 1, 0, 0)), Some(at(2024, 1, 7, 12, 0)));
        let weekdays = CronSchedule::parse("0 9 * * 1-5").unwrap();
        assert_eq!(weekdays.next_after(at(2024, 1, 5, 10, 0)), Some(at(2024, 1, 8, 9, 0)));
    }

    #[test]
    fn test_lists_and_ranges() {
        let s = CronSchedule::parse("0,30 8-9 * * *").unwrap();
        assert_eq!(s.next_after(at(2024, 1, 1, 8, 0)), Some(at(2024, 1, 1, 8, 30)));
        assert_eq!(s.next_after(at(2024, 1, 1, 9, 30)), Some(at(2024, 1, 2, 8, 0)));
    }

    #[test]
    fn test_impossible_date() {
        let s = CronSchedule::parse("0 0 31 2 *").unwrap();
        assert_eq!(s.next_after(at(2024, 1, 1, 0, 0)), None);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(CronSchedule::parse("* * *"), Err(CronError::FieldCount(3)));
        assert!(matches!(
            CronSchedule::parse("60 * * * *"),
            Err(CronError::InvalidField { field: "minute", .. })
        ));
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
        assert!(CronSchedule::parse("a * * * *").is_err());
        assert_eq!("0 * * * *".parse::<CronSchedule>().unwrap().to_string(), "0 * * * *");
    }
}
