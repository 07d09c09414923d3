use std::collections::HashMap;

use chrono::{Datelike, Duration, Local, NaiveDate};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::Rng;

const MEMO_LIMIT: usize = 4096;

static PARSED: Lazy<Mutex<HashMap<String, Option<NaiveDate>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Parses `YYYY-MM-DD`, `YYYY/MM/DD`, `MM-DD-YYYY` or `MM/DD/YYYY`.
///
/// A four digit first segment selects the year-first reading. Anything that
/// is not exactly three numeric segments, or names a day the calendar does not
/// have, yields `None`.
pub fn parse(text: &str) -> Option<NaiveDate> {
    let key = text.trim();
    if key.is_empty() {
        return None;
    }
    if let Some(hit) = PARSED.lock().get(key) {
        return *hit;
    }

    let parsed = parse_uncached(key);
    let mut memo = PARSED.lock();
    if memo.len() >= MEMO_LIMIT {
        memo.clear();
    }
    memo.insert(key.to_string(), parsed);
    parsed
}

fn parse_uncached(text: &str) -> Option<NaiveDate> {
    let separator = if text.contains('-') { '-' } else { '/' };
    let parts: Vec<&str> = text.split(separator).map(str::trim).collect();
    if parts.len() != 3 {
        return None;
    }

    let (year, month, day) = if parts[0].len() == 4 {
        (parts[0], parts[1], parts[2])
    } else {
        (parts[2], parts[0], parts[1])
    };

    let year: i32 = numeric(year)?.try_into().ok()?;
    let month = numeric(month)?;
    let day = numeric(day)?;
    NaiveDate::from_ymd_opt(year, month, day)
}

fn numeric(segment: &str) -> Option<u32> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

/// `YYYY/MM/DD`, the form the upstream site and the image cache use.
pub fn format_lookup(date: NaiveDate) -> String {
    format!("{:04}/{:02}/{:02}", date.year(), date.month(), date.day())
}

/// `YYYY-MM-DD`, the form every backend path uses.
pub fn format_storage(date: NaiveDate) -> String {
    format!("{:04}-{:02}-{:02}", date.year(), date.month(), date.day())
}

pub fn storage_key(text: &str) -> Option<String> {
    parse(text).map(format_storage)
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Inclusive window of dates that have a published strip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub first: NaiveDate,
    pub last: NaiveDate,
}

impl DateRange {
    pub fn new(first: NaiveDate, last: NaiveDate) -> Self {
        if last < first {
            return Self { first, last: first };
        }
        Self { first, last }
    }

    pub fn until_today(first: NaiveDate) -> Self {
        Self::new(first, today())
    }

    pub fn clamp(&self, date: NaiveDate) -> NaiveDate {
        date.clamp(self.first, self.last)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.first && date <= self.last
    }

    pub fn previous(&self, date: NaiveDate) -> NaiveDate {
        self.clamp(date - Duration::days(1))
    }

    pub fn next(&self, date: NaiveDate) -> NaiveDate {
        self.clamp(date + Duration::days(1))
    }

    pub fn random<R: Rng>(&self, rng: &mut R) -> NaiveDate {
        let span = (self.last - self.first).num_days();
        self.first + Duration::days(rng.gen_range(0..=span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn parses_all_four_layouts() {
        let expected = ymd(2023, 1, 15);
        for text in ["2023-01-15", "2023/01/15", "01-15-2023", "01/15/2023", "1/15/2023"] {
            assert_eq!(parse(text), Some(expected), "input {text}");
        }
    }

    #[test]
    fn formatting_round_trips_through_parse() {
        for text in ["1978-06-19", "2000/02/29", "12-31-1999", "07/04/2021"] {
            let date = parse(text).unwrap();
            assert_eq!(parse(&format_lookup(date)), Some(date));
            assert_eq!(parse(&format_storage(date)), Some(date));
        }
    }

    #[test]
    fn malformed_input_is_none() {
        for text in [
            "",
            "   ",
            "2023-01",
            "2023-01-15-01",
            "2023-01/15",
            "abcd-ef-gh",
            "2023-13-01",
            "2023-02-30",
            "2023--15",
            "+2023-01-15",
        ] {
            assert_eq!(parse(text), None, "input {text:?}");
        }
    }

    #[test]
    fn keys_use_expected_separators() {
        assert_eq!(format_lookup(ymd(2023, 1, 15)), "2023/01/15");
        assert_eq!(storage_key("01/15/2023").as_deref(), Some("2023-01-15"));
        assert_eq!(storage_key("not a date"), None);
    }

    #[test]
    fn range_clamps_and_steps() {
        let range = DateRange::new(ymd(1978, 6, 19), ymd(2024, 3, 1));
        assert_eq!(range.clamp(ymd(1970, 1, 1)), ymd(1978, 6, 19));
        assert_eq!(range.clamp(ymd(2030, 1, 1)), ymd(2024, 3, 1));
        assert_eq!(range.previous(ymd(1978, 6, 19)), ymd(1978, 6, 19));
        assert_eq!(range.next(ymd(2024, 2, 29)), ymd(2024, 3, 1));
        assert_eq!(range.next(ymd(2024, 3, 1)), ymd(2024, 3, 1));
    }

    #[test]
    fn random_stays_in_range() {
        let range = DateRange::new(ymd(2020, 1, 1), ymd(2020, 1, 10));
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            assert!(range.contains(range.random(&mut rng)));
        }
    }
}
