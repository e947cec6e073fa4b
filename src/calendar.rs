//! Trading calendar implementation
//!
//! Calendars are bounded: sessions are materialized once between a first
//! and last session so that window arithmetic (`sessions_window`,
//! `sessions_distance`) is an index lookup instead of a day-by-day scan.

use crate::error::{PipelineError, Result};
use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Trading session times
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionTimes {
    pub market_open: NaiveTime,
    pub market_close: NaiveTime,
}

/// Trading calendar trait
pub trait TradingCalendar: Send + Sync {
    /// Canonical calendar name, persisted in the bar store
    fn name(&self) -> &str;

    /// Get the timezone for this calendar
    fn timezone(&self) -> Tz;

    /// All sessions of the calendar in ascending order
    fn all_sessions(&self) -> &[NaiveDate];

    /// Get session times for a date
    fn session_times(&self, date: NaiveDate) -> Option<SessionTimes> {
        if self.is_session(date) {
            Some(SessionTimes {
                market_open: NaiveTime::from_hms_opt(9, 30, 0)?,
                market_close: NaiveTime::from_hms_opt(16, 0, 0)?,
            })
        } else {
            None
        }
    }

    fn first_session(&self) -> Option<NaiveDate> {
        self.all_sessions().first().copied()
    }

    fn last_session(&self) -> Option<NaiveDate> {
        self.all_sessions().last().copied()
    }

    /// Check if a date is a trading session
    fn is_session(&self, date: NaiveDate) -> bool {
        self.all_sessions().binary_search(&date).is_ok()
    }

    /// Position of a session in `all_sessions`
    fn session_index(&self, date: NaiveDate) -> Option<usize> {
        self.all_sessions().binary_search(&date).ok()
    }

    /// All sessions between two dates (inclusive)
    fn sessions_in_range(&self, start: NaiveDate, end: NaiveDate) -> &[NaiveDate] {
        let sessions = self.all_sessions();
        let lo = sessions.partition_point(|d| *d < start);
        let hi = sessions.partition_point(|d| *d <= end);
        if lo >= hi {
            &[]
        } else {
            &sessions[lo..hi]
        }
    }

    /// Number of sessions between two dates (inclusive)
    fn sessions_distance(&self, start: NaiveDate, end: NaiveDate) -> usize {
        self.sessions_in_range(start, end).len()
    }

    /// First session opening on or after midnight of `date`
    fn next_open(&self, date: NaiveDate) -> Result<NaiveDate> {
        let sessions = self.all_sessions();
        let idx = sessions.partition_point(|d| *d < date);
        sessions.get(idx).copied().ok_or_else(|| {
            PipelineError::CalendarError(format!(
                "No session on or after {} in calendar {}",
                date,
                self.name()
            ))
        })
    }

    /// First session strictly after `date`
    fn next_session(&self, date: NaiveDate) -> Result<NaiveDate> {
        self.next_open(date + Duration::days(1))
    }

    /// Last session strictly before `date`
    fn previous_session(&self, date: NaiveDate) -> Result<NaiveDate> {
        let sessions = self.all_sessions();
        let idx = sessions.partition_point(|d| *d < date);
        if idx == 0 {
            return Err(PipelineError::CalendarError(format!(
                "No session before {} in calendar {}",
                date,
                self.name()
            )));
        }
        Ok(sessions[idx - 1])
    }

    /// The `count` sessions ending at `end` (inclusive). `end` need not be a
    /// session: the window ends at the last session on or before it.
    fn sessions_window(&self, end: NaiveDate, count: usize) -> Result<&[NaiveDate]> {
        let sessions = self.all_sessions();
        let hi = sessions.partition_point(|d| *d <= end);
        if count > hi {
            return Err(PipelineError::CalendarError(format!(
                "Requested {} sessions ending {} but calendar {} only has {}",
                count,
                end,
                self.name(),
                hi
            )));
        }
        Ok(&sessions[hi - count..hi])
    }
}

/// Default lower bound for materialized calendars
pub fn default_calendar_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(1990, 1, 1).unwrap_or_default()
}

/// Default upper bound for materialized calendars
pub fn default_calendar_end() -> NaiveDate {
    NaiveDate::from_ymd_opt(2035, 12, 31).unwrap_or_default()
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

fn materialize(start: NaiveDate, end: NaiveDate, is_holiday: impl Fn(NaiveDate) -> bool) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut current = start;
    while current <= end {
        if !is_weekend(current) && !is_holiday(current) {
            days.push(current);
        }
        current += Duration::days(1);
    }
    days
}

/// NYSE trading calendar
#[derive(Debug, Clone)]
pub struct NYSECalendar {
    /// Holidays in the materialized range, sorted
    holidays: Vec<NaiveDate>,
    sessions: Vec<NaiveDate>,
}

impl NYSECalendar {
    /// Create a new NYSE calendar over the default range
    pub fn new() -> Self {
        Self::with_bounds(default_calendar_start(), default_calendar_end())
    }

    /// Create a calendar whose sessions lie within `[start, end]`
    pub fn with_bounds(start: NaiveDate, end: NaiveDate) -> Self {
        let mut holidays = Vec::new();
        for year in start.year()..=end.year() {
            holidays.extend(nyse_holidays(year));
        }
        holidays.extend(special_closures());
        holidays.retain(|d| *d >= start && *d <= end);
        holidays.sort();
        holidays.dedup();

        let sessions = materialize(start, end, |d| holidays.binary_search(&d).is_ok());
        Self { holidays, sessions }
    }

    /// Add a custom holiday
    pub fn add_holiday(&mut self, date: NaiveDate) {
        if let Err(pos) = self.holidays.binary_search(&date) {
            self.holidays.insert(pos, date);
            self.sessions.retain(|d| *d != date);
        }
    }

    pub fn holidays(&self) -> &[NaiveDate] {
        &self.holidays
    }
}

impl Default for NYSECalendar {
    fn default() -> Self {
        Self::new()
    }
}

impl TradingCalendar for NYSECalendar {
    fn name(&self) -> &str {
        "NYSE"
    }

    fn timezone(&self) -> Tz {
        chrono_tz::America::New_York
    }

    fn all_sessions(&self) -> &[NaiveDate] {
        &self.sessions
    }
}

/// Monday-to-Friday calendar without holidays
#[derive(Debug, Clone)]
pub struct WeekdayCalendar {
    sessions: Vec<NaiveDate>,
}

impl WeekdayCalendar {
    pub fn new() -> Self {
        Self::with_bounds(default_calendar_start(), default_calendar_end())
    }

    pub fn with_bounds(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            sessions: materialize(start, end, |_| false),
        }
    }
}

impl Default for WeekdayCalendar {
    fn default() -> Self {
        Self::new()
    }
}

impl TradingCalendar for WeekdayCalendar {
    fn name(&self) -> &str {
        "WEEKDAYS"
    }

    fn timezone(&self) -> Tz {
        chrono_tz::UTC
    }

    fn all_sessions(&self) -> &[NaiveDate] {
        &self.sessions
    }
}

/// Resolve a calendar by its persisted name
pub fn get_calendar(name: &str) -> Result<Arc<dyn TradingCalendar>> {
    match name.to_ascii_uppercase().as_str() {
        "NYSE" | "XNYS" | "NASDAQ" | "XNAS" => Ok(Arc::new(NYSECalendar::new())),
        "WEEKDAYS" | "24/5" => Ok(Arc::new(WeekdayCalendar::new())),
        other => Err(PipelineError::CalendarError(format!(
            "Unknown calendar: {}",
            other
        ))),
    }
}

/// Western Easter Sunday (anonymous Gregorian algorithm)
fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}

/// The `n`-th (1-based) `weekday` of a month
fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u8) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n)
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    nth_weekday(year, month, weekday, 5).or_else(|| nth_weekday(year, month, weekday, 4))
}

/// Saturday holidays move to Friday, Sunday holidays to Monday
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

fn nyse_holidays(year: i32) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(10);

    // New Year's Day falling on a Saturday is not observed on the prior Friday
    if let Some(new_year) = NaiveDate::from_ymd_opt(year, 1, 1) {
        match new_year.weekday() {
            Weekday::Sat => {}
            _ => days.push(observed(new_year)),
        }
    }
    if year >= 1998 {
        days.extend(nth_weekday(year, 1, Weekday::Mon, 3));
    }
    days.extend(nth_weekday(year, 2, Weekday::Mon, 3));
    days.extend(easter_sunday(year).map(|d| d - Duration::days(2)));
    days.extend(last_weekday(year, 5, Weekday::Mon));
    if year >= 2022 {
        days.extend(NaiveDate::from_ymd_opt(year, 6, 19).map(observed));
    }
    days.extend(NaiveDate::from_ymd_opt(year, 7, 4).map(observed));
    days.extend(nth_weekday(year, 9, Weekday::Mon, 1));
    days.extend(nth_weekday(year, 11, Weekday::Thu, 4));
    days.extend(NaiveDate::from_ymd_opt(year, 12, 25).map(observed));
    days
}

/// Unscheduled full-day closures
fn special_closures() -> Vec<NaiveDate> {
    [
        (1994, 4, 27),
        (2001, 9, 11),
        (2001, 9, 12),
        (2001, 9, 13),
        (2001, 9, 14),
        (2004, 6, 11),
        (2007, 1, 2),
        (2012, 10, 29),
        (2012, 10, 30),
        (2018, 12, 5),
        (2025, 1, 9),
    ]
    .iter()
    .filter_map(|&(y, m, d)| NaiveDate::from_ymd_opt(y, m, d))
    .collect()
}
