//! Rotation calendar and shift time arithmetic.
//!
//! Weeks start on Friday. Week 1 begins on the anchor date; week parity picks
//! which half of an employee's two-week rotation applies.

use crate::model::ShiftType;
use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Timelike};

/// Friday of week 1.
pub const ANCHOR_DATE: NaiveDate = match NaiveDate::from_ymd_opt(2026, 1, 9) {
    Some(date) => date,
    None => panic!("invalid anchor date"),
};

/// Regular shift length in minutes (10.5 hours).
const SHIFT_MINUTES: i64 = 630;
/// Time taken off the end of a shift for drive-time days.
const DRIVE_TIME_MINUTES: i64 = 60;
const MINUTES_PER_DAY: i64 = 24 * 60;

/// Short day labels in rotation order.
pub const DAYS_OF_WEEK: [&str; 7] = ["Fri", "Sat", "Sun", "Mon", "Tue", "Wed", "Thu"];

/// Default `(start, end)` times per shift.
pub fn shift_defaults(shift: ShiftType) -> (&'static str, &'static str) {
    match shift {
        ShiftType::First => ("06:00", "16:30"),
        ShiftType::Second => ("14:00", "00:30"),
        ShiftType::Third => ("20:30", "07:00"),
    }
}

/// Which half of the two-week rotation a week uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeekParity {
    Week1,
    Week2,
}

/// Index of `date` within its Friday-based week (Friday = 0, Thursday = 6).
pub fn day_index(date: NaiveDate) -> u8 {
    // Monday = 0 .. Friday = 4
    ((date.weekday().num_days_from_monday() + 3) % 7) as u8
}

fn start_of_week(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(day_index(date)))
}

/// Week number relative to the anchor; the anchor week is 1, earlier weeks go to 0 and below.
pub fn week_number(date: NaiveDate) -> i64 {
    let diff = (start_of_week(date) - start_of_week(ANCHOR_DATE)).num_days();
    diff.div_euclid(7) + 1
}

pub fn week_parity(week: i64) -> WeekParity {
    if week.rem_euclid(2) == 0 {
        WeekParity::Week2
    } else {
        WeekParity::Week1
    }
}

/// The seven dates of `week`, Friday first.
pub fn week_range(week: i64) -> [NaiveDate; 7] {
    let start = ANCHOR_DATE + Duration::days((week - 1) * 7);
    std::array::from_fn(|i| start + Duration::days(i as i64))
}

/// `yyyy-MM-dd`, the date part of schedule keys.
pub fn date_id(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Key of a schedule override for one employee on one day.
pub fn schedule_key(employee_id: &str, date: NaiveDate) -> String {
    format!("{}_{}", employee_id, date_id(date))
}

fn parse_time(time: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(time, "%H:%M").ok()
}

fn shift_minutes(time: &str, delta: i64) -> Option<String> {
    let t = parse_time(time)?;
    let minutes = i64::from(t.hour() * 60 + t.minute()) + delta;
    let wrapped = minutes.rem_euclid(MINUTES_PER_DAY);
    Some(format!("{:02}:{:02}", wrapped / 60, wrapped % 60))
}

/// End of a regular shift starting at `start` (`HH:MM`). Empty or unparseable input yields "".
pub fn calculate_end_time(start: &str) -> String {
    shift_minutes(start, SHIFT_MINUTES).unwrap_or_default()
}

/// Shift end pulled forward for a drive-time day.
pub fn apply_drive_time(end: &str) -> String {
    shift_minutes(end, -DRIVE_TIME_MINUTES).unwrap_or_default()
}

/// `14:05` -> `2:05 PM`. Unparseable input is returned unchanged.
pub fn format_12h(time: &str) -> String {
    match parse_time(time) {
        Some(t) => t.format("%-I:%M %p").to_string(),
        None => time.to_string(),
    }
}
