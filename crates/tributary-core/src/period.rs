//! Time periods used by windows, TTLs and schedules

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeriodError {
    #[error("invalid period: {0}")]
    Invalid(String),
    #[error("unknown time unit: {0}")]
    UnknownUnit(String),
}

/// A whole number of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period {
    secs: u32,
}

impl Period {
    pub const fn from_secs(secs: u32) -> Self {
        Self { secs }
    }

    pub const fn from_mins(mins: u32) -> Self {
        Self { secs: mins * 60 }
    }

    pub const fn from_hours(hours: u32) -> Self {
        Self { secs: hours * 3600 }
    }

    pub const fn secs(&self) -> u32 {
        self.secs
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.secs as u64)
    }
}

impl FromStr for Period {
    type Err = PeriodError;

    /// Parses `"<n><unit>"` or `"<n> <unit>"` where unit is one of
    /// `sec`, `min`, `hour`, `day` (plurals and `s`/`m`/`h`/`d` accepted).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| PeriodError::Invalid(s.to_string()))?;
        let (num, unit) = s.split_at(split);
        let n: u32 = num
            .parse()
            .map_err(|_| PeriodError::Invalid(s.to_string()))?;
        let mult = match unit.trim().to_ascii_lowercase().as_str() {
            "s" | "sec" | "secs" | "second" | "seconds" => 1,
            "m" | "min" | "mins" | "minute" | "minutes" => 60,
            "h" | "hour" | "hours" => 3600,
            "d" | "day" | "days" => 86_400,
            other => return Err(PeriodError::UnknownUnit(other.to_string())),
        };
        n.checked_mul(mult)
            .map(Period::from_secs)
            .ok_or_else(|| PeriodError::Invalid(s.to_string()))
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.secs != 0 && self.secs % 86_400 == 0 {
            write!(f, "{}day", self.secs / 86_400)
        } else if self.secs != 0 && self.secs % 3600 == 0 {
            write!(f, "{}hour", self.secs / 3600)
        } else if self.secs != 0 && self.secs % 60 == 0 {
            write!(f, "{}min", self.secs / 60)
        } else {
            write!(f, "{}sec", self.secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!("10sec".parse::<Period>().unwrap().secs(), 10);
        assert_eq!("5min".parse::<Period>().unwrap().secs(), 300);
        assert_eq!("2 hours".parse::<Period>().unwrap().secs(), 7200);
        assert_eq!("1day".parse::<Period>().unwrap().secs(), 86_400);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!("sec".parse::<Period>(), Err(PeriodError::Invalid(_))));
        assert!(matches!("10".parse::<Period>(), Err(PeriodError::Invalid(_))));
        assert!(matches!(
            "3weeks".parse::<Period>(),
            Err(PeriodError::UnknownUnit(_))
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(Period::from_secs(90).to_string(), "90sec");
        assert_eq!(Period::from_mins(2).to_string(), "2min");
        assert_eq!(Period::from_hours(48).to_string(), "2day");
    }
}
