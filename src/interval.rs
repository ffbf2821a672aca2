//! Weekly embargo windows.
//!
//! An embargo is a recurring calendar window, expressed in human form on the
//! command line (`"Friday 1pm - Monday 9am"`), during which the job must not
//! ask the forge to merge. Windows may wrap around the end of the week.

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use std::fmt;
use std::str::FromStr;

/// One recurring window, closed on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklyInterval {
    from_day: Weekday,
    from_time: NaiveTime,
    to_day: Weekday,
    to_time: NaiveTime,
}

/// Minute-of-week, Monday 00:00 = 0.
fn week_minute(day: Weekday, time: NaiveTime) -> u32 {
    day.num_days_from_monday() * 24 * 60 + time.hour() * 60 + time.minute()
}

impl WeeklyInterval {
    pub fn new(from_day: Weekday, from_time: NaiveTime, to_day: Weekday, to_time: NaiveTime) -> Self {
        Self {
            from_day,
            from_time,
            to_day,
            to_time,
        }
    }

    /// Whether `instant` falls inside the window.
    pub fn covers(&self, instant: DateTime<Utc>) -> bool {
        let now = week_minute(instant.weekday(), instant.time());
        let from = week_minute(self.from_day, self.from_time);
        let to = week_minute(self.to_day, self.to_time);

        if from <= to {
            from <= now && now <= to
        } else {
            // Wraps past Sunday midnight
            now >= from || now <= to
        }
    }
}

fn parse_time(text: &str) -> Result<NaiveTime, String> {
    let normalized = text.trim().to_uppercase();
    for format in ["%I:%M%p", "%I%p", "%H:%M"] {
        if let Ok(time) = NaiveTime::parse_from_str(&normalized, format) {
            return Ok(time);
        }
    }
    Err(format!("unrecognized time of day: {:?}", text))
}

fn parse_endpoint(text: &str) -> Result<(Weekday, NaiveTime), String> {
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let day_text = parts.next().unwrap_or_default();
    let time_text = parts
        .next()
        .ok_or_else(|| format!("expected \"<weekday> <time>\", got {:?}", text))?;
    let day = Weekday::from_str(day_text).map_err(|_| format!("unrecognized weekday: {:?}", day_text))?;
    Ok((day, parse_time(time_text)?))
}

impl FromStr for WeeklyInterval {
    type Err = String;

    /// Parses the human form, e.g. `"Friday 1pm - Monday 9am"` or
    /// `"Sat 22:00 - Sun 06:00"`.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let (from_text, to_text) = text
            .split_once('-')
            .ok_or_else(|| format!("expected \"<start> - <end>\", got {:?}", text))?;
        let (from_day, from_time) = parse_endpoint(from_text)?;
        let (to_day, to_time) = parse_endpoint(to_text)?;
        Ok(WeeklyInterval::new(from_day, from_time, to_day, to_time))
    }
}

impl fmt::Display for WeeklyInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} - {} {}",
            self.from_day,
            self.from_time.format("%H:%M"),
            self.to_day,
            self.to_time.format("%H:%M")
        )
    }
}

/// A set of embargo windows; covered when any member covers.
#[derive(Debug, Clone, Default)]
pub struct IntervalUnion(Vec<WeeklyInterval>);

impl IntervalUnion {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(intervals: Vec<WeeklyInterval>) -> Self {
        Self(intervals)
    }

    pub fn covers(&self, instant: DateTime<Utc>) -> bool {
        self.0.iter().any(|interval| interval.covers(instant))
    }
}
