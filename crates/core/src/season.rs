//! League seasons ("2024-25") and the date range each one covers.
//!
//! A league year runs from October 1 through September 30 of the next
//! calendar year, so off-season dates still belong to exactly one season.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::ReboundError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Season {
    start_year: i32,
}

impl Season {
    pub fn from_start_year(start_year: i32) -> Self {
        Self { start_year }
    }

    /// Accepts `YYYY-YY` or `YYYY-YYYY`; the end year must follow the start year.
    pub fn parse(s: &str) -> Result<Self, ReboundError> {
        let invalid = || ReboundError::InvalidSeason(s.to_string());
        let (start, end) = s.trim().split_once('-').ok_or_else(invalid)?;
        if start.len() != 4 || !start.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        if !end.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let start_year: i32 = start.parse().map_err(|_| invalid())?;
        let end_year: i32 = match end.len() {
            2 => {
                let yy: i32 = end.parse().map_err(|_| invalid())?;
                // Century rolls over for 1999-00.
                let century = (start_year + 1) / 100 * 100;
                century + yy
            }
            4 => end.parse().map_err(|_| invalid())?,
            _ => return Err(invalid()),
        };
        if end_year != start_year + 1 {
            return Err(invalid());
        }
        Ok(Self { start_year })
    }

    /// Season a calendar date falls into.
    pub fn containing(date: NaiveDate) -> Self {
        let start_year = if date.month() >= 10 { date.year() } else { date.year() - 1 };
        Self { start_year }
    }

    pub fn start_year(&self) -> i32 {
        self.start_year
    }

    /// Inclusive `[Oct 1, Sep 30]` bounds.
    pub fn bounds(&self) -> (NaiveDate, NaiveDate) {
        let start = NaiveDate::from_ymd_opt(self.start_year, 10, 1);
        let end = NaiveDate::from_ymd_opt(self.start_year + 1, 9, 30);
        match (start, end) {
            (Some(s), Some(e)) => (s, e),
            // Only reachable for years outside chrono's range.
            _ => (NaiveDate::MIN, NaiveDate::MAX),
        }
    }

    /// Canonical `YYYY-YY` label.
    pub fn label(&self) -> String {
        format!("{}-{:02}", self.start_year, (self.start_year + 1).rem_euclid(100))
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl FromStr for Season {
    type Err = ReboundError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn parses_short_and_long_forms() {
        assert_eq!(Season::parse("2024-25").unwrap().start_year(), 2024);
        assert_eq!(Season::parse("2024-2025").unwrap().start_year(), 2024);
        assert_eq!(Season::parse("1999-00").unwrap().start_year(), 1999);
    }

    #[test]
    fn rejects_malformed_seasons() {
        for bad in ["2024", "2024-26", "24-25", "2024-2026", "abcd-ef", "2024-5"] {
            assert!(Season::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn bounds_span_october_to_september() {
        let (start, end) = Season::parse("2024-25").unwrap().bounds();
        assert_eq!(start, d(2024, 10, 1));
        assert_eq!(end, d(2025, 9, 30));
    }

    #[test]
    fn containing_and_label() {
        assert_eq!(Season::containing(d(2025, 1, 15)).label(), "2024-25");
        assert_eq!(Season::containing(d(2024, 10, 1)).label(), "2024-25");
        assert_eq!(Season::containing(d(2024, 9, 30)).label(), "2023-24");
        assert_eq!(Season::from_start_year(1999).to_string(), "1999-00");
    }
}
