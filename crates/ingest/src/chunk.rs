//! Splitting an inclusive date range into fixed-size windows.

use std::fmt;
use std::num::NonZeroU32;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

/// Inclusive date window processed as one backfill step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chunk {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Chunk {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// One-day chunk.
    pub fn day(date: NaiveDate) -> Self {
        Self::new(date, date)
    }

    pub fn days(&self) -> u64 {
        (self.end - self.start).num_days().max(0) as u64 + 1
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}..{}", self.start, self.end)
        }
    }
}

/// Split `[start, end]` into ordered, contiguous, non-overlapping chunks of
/// at most `chunk_days` days. The last chunk may be shorter. `end < start`
/// yields no chunks.
pub fn plan(start: NaiveDate, end: NaiveDate, chunk_days: NonZeroU32) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let step = Days::new(u64::from(chunk_days.get()) - 1);
    let mut cursor = start;
    while cursor <= end {
        let stop = cursor.checked_add_days(step).map_or(end, |d| d.min(end));
        chunks.push(Chunk::new(cursor, stop));
        match stop.succ_opt() {
            Some(next) => cursor = next,
            None => break,
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn days(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    #[test]
    fn splits_three_weeks_into_weekly_chunks() {
        let chunks = plan(d("2024-01-01"), d("2024-01-21"), days(7));
        assert_eq!(
            chunks,
            vec![
                Chunk::new(d("2024-01-01"), d("2024-01-07")),
                Chunk::new(d("2024-01-08"), d("2024-01-14")),
                Chunk::new(d("2024-01-15"), d("2024-01-21")),
            ]
        );
    }

    #[test]
    fn last_chunk_is_truncated() {
        let chunks = plan(d("2024-02-25"), d("2024-03-02"), days(4));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1], Chunk::new(d("2024-02-29"), d("2024-03-02")));
        assert_eq!(chunks[1].days(), 3);
    }

    #[test]
    fn single_day_range() {
        assert_eq!(
            plan(d("2024-05-05"), d("2024-05-05"), days(7)),
            vec![Chunk::day(d("2024-05-05"))]
        );
    }

    #[test]
    fn reversed_range_is_empty() {
        assert!(plan(d("2024-01-10"), d("2024-01-09"), days(1)).is_empty());
    }

    #[test]
    fn huge_chunk_size_covers_range_once() {
        let chunks = plan(d("2024-01-01"), d("2024-12-31"), days(u32::MAX));
        assert_eq!(chunks, vec![Chunk::new(d("2024-01-01"), d("2024-12-31"))]);
    }

    #[test]
    fn chunks_tile_the_range_exactly() {
        let start = d("2023-10-01");
        for len in [0u64, 1, 6, 7, 8, 29, 30, 364] {
            let end = start + Days::new(len);
            for size in [1, 2, 3, 7, 10, 31] {
                let chunks = plan(start, end, days(size));
                assert_eq!(chunks.first().map(|c| c.start), Some(start));
                assert_eq!(chunks.last().map(|c| c.end), Some(end));
                for pair in chunks.windows(2) {
                    assert_eq!(pair[0].end.succ_opt(), Some(pair[1].start));
                }
                assert!(chunks.iter().all(|c| c.days() <= u64::from(size)));
                let covered: u64 = chunks.iter().map(Chunk::days).sum();
                assert_eq!(covered, len + 1);
            }
        }
    }

    #[test]
    fn display_uses_range_notation() {
        assert_eq!(Chunk::new(d("2024-01-01"), d("2024-01-07")).to_string(), "2024-01-01..2024-01-07");
        assert_eq!(Chunk::day(d("2024-01-01")).to_string(), "2024-01-01");
    }
}
