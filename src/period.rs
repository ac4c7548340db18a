//! Calendar partitioning of download ranges.

use chrono::{Datelike, Days, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use std::fmt;

use crate::error::{Error, Result};

/// How a range is split into download units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Monthly,
    Daily,
    /// One file per day, restricted to a set of hours.
    Hourly,
}

/// A calendar month, held as its first day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth(NaiveDate);

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(Error::InvalidMonth(month));
        }
        NaiveDate::from_ymd_opt(year, month, 1)
            .map(Self)
            .ok_or_else(|| Error::InvalidDate {
                input: format!("{}-{:02}", year, month),
                expected: "YYYY-MM",
            })
    }

    /// Parses `YYYY-MM`.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidDate {
            input: s.to_string(),
            expected: "YYYY-MM",
        };
        if s.len() != 7 {
            return Err(invalid());
        }
        NaiveDate::parse_from_str(&format!("{}-01", s), "%Y-%m-%d")
            .map(Self)
            .map_err(|_| invalid())
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    pub fn month(&self) -> u32 {
        self.0.month()
    }

    pub fn first_day(&self) -> NaiveDate {
        self.0
    }

    pub fn next(&self) -> Option<Self> {
        self.0.checked_add_months(Months::new(1)).map(Self)
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year(), self.month())
    }
}

/// One download unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Period {
    Month(YearMonth),
    Day(NaiveDate),
}

impl Period {
    /// Result-map key: `2020-03` or `2020-03-15`.
    pub fn label(&self) -> String {
        match self {
            Period::Month(m) => m.to_string(),
            Period::Day(d) => d.format("%Y-%m-%d").to_string(),
        }
    }

    pub fn year(&self) -> i32 {
        match self {
            Period::Month(m) => m.year(),
            Period::Day(d) => d.year(),
        }
    }

    pub fn month(&self) -> u32 {
        match self {
            Period::Month(m) => m.month(),
            Period::Day(d) => d.month(),
        }
    }

    pub fn day(&self) -> Option<u32> {
        match self {
            Period::Month(_) => None,
            Period::Day(d) => Some(d.day()),
        }
    }
}

/// Parses `YYYY-MM-DD`.
pub fn parse_day(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| Error::InvalidDate {
        input: s.to_string(),
        expected: "YYYY-MM-DD",
    })
}

/// Every month from `start` to `end`, both inclusive.
pub fn month_range(start: YearMonth, end: YearMonth) -> Result<Vec<Period>> {
    if end < start {
        return Err(Error::InvalidRange {
            start: start.to_string(),
            end: end.to_string(),
        });
    }

    let mut periods = Vec::new();
    let mut current = Some(start);
    while let Some(month) = current.filter(|m| *m <= end) {
        periods.push(Period::Month(month));
        current = month.next();
    }
    Ok(periods)
}

/// Month bounds for a year-based range. A missing start month means January
/// of `start_year`, a missing end month December of `end_year`.
pub fn year_bounds(
    start_year: i32,
    end_year: i32,
    start_month: Option<u32>,
    end_month: Option<u32>,
) -> Result<(YearMonth, YearMonth)> {
    Ok((
        YearMonth::new(start_year, start_month.unwrap_or(1))?,
        YearMonth::new(end_year, end_month.unwrap_or(12))?,
    ))
}

/// Every day from `start` to `end`, both inclusive.
pub fn day_range(start: NaiveDate, end: NaiveDate) -> Result<Vec<Period>> {
    if end < start {
        return Err(Error::InvalidRange {
            start: start.to_string(),
            end: end.to_string(),
        });
    }
    Ok(start
        .iter_days()
        .take_while(|d| *d <= end)
        .map(Period::Day)
        .collect())
}

/// Parses `HH:MM` hours of day.
pub fn parse_hours(hours: &[String]) -> Result<Vec<NaiveTime>> {
    hours
        .iter()
        .map(|h| NaiveTime::parse_from_str(h.trim(), "%H:%M").map_err(|_| Error::InvalidHour(h.clone())))
        .collect()
}

/// Parses `hours` and renders them back as canonical `HH:MM`.
pub fn normalize_hours(hours: &[String]) -> Result<Vec<String>> {
    Ok(parse_hours(hours)?
        .iter()
        .map(|t| t.format("%H:%M").to_string())
        .collect())
}

/// Half-open `[start, end)` time span covered by one download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeWindow {
    pub fn month(month: YearMonth) -> Result<Self> {
        let next = month.next().ok_or_else(|| out_of_calendar(month.first_day()))?;
        Ok(Self {
            start: month.first_day().and_time(NaiveTime::MIN),
            end: next.first_day().and_time(NaiveTime::MIN),
        })
    }

    pub fn day(date: NaiveDate) -> Result<Self> {
        let next = date
            .checked_add_days(Days::new(1))
            .ok_or_else(|| out_of_calendar(date))?;
        Ok(Self {
            start: date.and_time(NaiveTime::MIN),
            end: next.and_time(NaiveTime::MIN),
        })
    }

    /// From the earliest listed hour to one hour past the latest; the whole
    /// day when `hours` is empty.
    pub fn hours(date: NaiveDate, hours: &[NaiveTime]) -> Result<Self> {
        let (Some(first), Some(last)) = (hours.iter().min(), hours.iter().max()) else {
            return Self::day(date);
        };
        let end = date
            .and_time(*last)
            .checked_add_signed(TimeDelta::hours(1))
            .ok_or_else(|| out_of_calendar(date))?;
        Ok(Self {
            start: date.and_time(*first),
            end,
        })
    }
}

fn out_of_calendar(date: NaiveDate) -> Error {
    Error::InvalidDate {
        input: date.to_string(),
        expected: "a date inside the supported calendar",
    }
}
