//! Per-date working windows and the slot grid derived from them.
//!
//! All timestamps are wall-clock values anchored at UTC: a date and an
//! `HH:MM` are combined without any host-timezone arithmetic, so the grid is
//! identical on every machine.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Distance between two candidate start times.
pub const SLOT_STEP_MINUTES: i64 = 15;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("invalid time '{0}', expected HH:MM")]
    InvalidTime(String),
    #[error("working window {start}-{end} must start before it ends")]
    EmptyWindow { start: TimeOfDay, end: TimeOfDay },
}

/// Parse a strict `YYYY-MM-DD` calendar date.
pub fn parse_date(raw: &str) -> Result<NaiveDate, ScheduleError> {
    if raw.len() != 10 {
        return Err(ScheduleError::InvalidDate(raw.to_string()));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| ScheduleError::InvalidDate(raw.to_string()))
}

/// Combine a calendar date and a time of day into an absolute timestamp.
pub fn anchor(date: NaiveDate, time: TimeOfDay) -> DateTime<Utc> {
    date.and_time(time.0).and_utc()
}

// ── Time of day ──

/// A minute-precision time of day, written as `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(NaiveTime);

impl TimeOfDay {
    pub fn parse(raw: &str) -> Result<Self, ScheduleError> {
        let bytes = raw.as_bytes();
        if bytes.len() != 5 || bytes[2] != b':' {
            return Err(ScheduleError::InvalidTime(raw.to_string()));
        }
        NaiveTime::parse_from_str(raw, "%H:%M")
            .map(TimeOfDay)
            .map_err(|_| ScheduleError::InvalidTime(raw.to_string()))
    }

    /// Truncates seconds.
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        let time = at.time();
        TimeOfDay(NaiveTime::from_hms_opt(time.hour(), time.minute(), 0).unwrap_or(time))
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M"))
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        TimeOfDay::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// ── Working windows ──

/// A half-open working window `[start, end)` within one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawWindow")]
pub struct WorkWindow {
    start: TimeOfDay,
    end: TimeOfDay,
}

#[derive(Deserialize)]
struct RawWindow {
    start: TimeOfDay,
    end: TimeOfDay,
}

impl TryFrom<RawWindow> for WorkWindow {
    type Error = ScheduleError;

    fn try_from(raw: RawWindow) -> Result<Self, Self::Error> {
        WorkWindow::new(raw.start, raw.end)
    }
}

impl WorkWindow {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Result<Self, ScheduleError> {
        if start >= end {
            return Err(ScheduleError::EmptyWindow { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> TimeOfDay {
        self.start
    }

    pub fn end(&self) -> TimeOfDay {
        self.end
    }

    /// The window as absolute timestamps on `date`.
    pub fn on(&self, date: NaiveDate) -> Interval {
        Interval::new(anchor(date, self.start), anchor(date, self.end))
    }
}

/// Explicit per-date working hours. A date missing from the map is not
/// offered at all, whatever weekday it falls on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkingDates(BTreeMap<NaiveDate, WorkWindow>);

impl WorkingDates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, date: NaiveDate, window: WorkWindow) {
        self.0.insert(date, window);
    }

    pub fn window_for(&self, date: NaiveDate) -> Option<&WorkWindow> {
        self.0.get(&date)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Dates on or after `from`, in calendar order.
    pub fn dates_from(&self, from: NaiveDate) -> impl Iterator<Item = NaiveDate> + '_ {
        self.0.range(from..).map(|(date, _)| *date)
    }
}

// ── Intervals ──

/// A half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Interval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn starting_at(start: DateTime<Utc>, minutes: i64) -> Self {
        Self::new(start, start + Duration::minutes(minutes))
    }

    /// `[s1, e1)` and `[s2, e2)` overlap iff `s1 < e2 && e1 > s2`.
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && self.end > other.start
    }

    pub fn contains(&self, other: &Interval) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Slot grid ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub time: TimeOfDay,
    pub available: bool,
}

/// Every start time at which a service of `duration_minutes` fits inside
/// `window` on `date`, stepped by [`SLOT_STEP_MINUTES`]. A slot is
/// unavailable when its `[start, start + duration)` overlaps any of `busy`.
pub fn compute_slots(
    date: NaiveDate,
    window: &WorkWindow,
    duration_minutes: i64,
    busy: &[Interval],
) -> Vec<Slot> {
    if duration_minutes <= 0 {
        return Vec::new();
    }

    let bounds = window.on(date);
    let step = Duration::minutes(SLOT_STEP_MINUTES);
    let mut slots = Vec::new();
    let mut cursor = bounds.start;

    loop {
        let candidate = Interval::starting_at(cursor, duration_minutes);
        if candidate.end > bounds.end {
            break;
        }
        let available = !busy.iter().any(|b| b.overlaps(&candidate));
        slots.push(Slot {
            time: TimeOfDay::from_datetime(cursor),
            available,
        });
        cursor += step;
    }

    slots
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn t(raw: &str) -> TimeOfDay {
        TimeOfDay::parse(raw).unwrap()
    }

    fn date(raw: &str) -> NaiveDate {
        parse_date(raw).unwrap()
    }

    fn window(start: &str, end: &str) -> WorkWindow {
        WorkWindow::new(t(start), t(end)).unwrap()
    }

    fn at(d: &str, time: &str) -> DateTime<Utc> {
        anchor(date(d), t(time))
    }

    fn times(slots: &[Slot]) -> Vec<String> {
        slots.iter().map(|s| s.time.to_string()).collect()
    }

    // ── parsing ──

    #[test]
    fn test_time_of_day_roundtrips_display() {
        assert_eq!(t("09:05").to_string(), "09:05");
    }

    #[test]
    fn test_time_of_day_rejects_loose_formats() {
        assert!(TimeOfDay::parse("9:00").is_err());
        assert!(TimeOfDay::parse("24:00").is_err());
        assert!(TimeOfDay::parse("12:60").is_err());
        assert!(TimeOfDay::parse("12-30").is_err());
        assert!(TimeOfDay::parse("").is_err());
    }

    #[test]
    fn test_parse_date_strict() {
        assert!(parse_date("2025-06-10").is_ok());
        assert!(parse_date("2025-6-10").is_err());
        assert!(parse_date("2025-02-30").is_err());
        assert!(parse_date("garbage").is_err());
    }

    #[test]
    fn test_window_requires_start_before_end() {
        assert!(WorkWindow::new(t("12:00"), t("12:00")).is_err());
        assert!(WorkWindow::new(t("18:00"), t("09:00")).is_err());
    }

    #[test]
    fn test_working_dates_deserialize_validates_windows() {
        let ok: WorkingDates =
            serde_json::from_str(r#"{"2025-06-10": {"start": "09:00", "end": "12:00"}}"#).unwrap();
        assert_eq!(ok.window_for(date("2025-06-10")), Some(&window("09:00", "12:00")));

        let inverted =
            serde_json::from_str::<WorkingDates>(r#"{"2025-06-10": {"start": "12:00", "end": "09:00"}}"#);
        assert!(inverted.is_err());

        let bad_key =
            serde_json::from_str::<WorkingDates>(r#"{"10.06.2025": {"start": "09:00", "end": "12:00"}}"#);
        assert!(bad_key.is_err());
    }

    #[test]
    fn test_working_dates_serialize_as_plain_map() {
        let mut dates = WorkingDates::new();
        dates.insert(date("2025-06-10"), window("09:00", "12:00"));
        let json = serde_json::to_value(&dates).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"2025-06-10": {"start": "09:00", "end": "12:00"}})
        );
    }

    // ── overlap predicate ──

    #[test]
    fn test_overlap_is_half_open() {
        let a = Interval::new(at("2025-06-10", "09:00"), at("2025-06-10", "10:00"));
        let touching = Interval::new(at("2025-06-10", "10:00"), at("2025-06-10", "11:00"));
        let inside = Interval::new(at("2025-06-10", "09:30"), at("2025-06-10", "09:45"));
        assert!(!a.overlaps(&touching));
        assert!(!touching.overlaps(&a));
        assert!(a.overlaps(&inside));
        assert!(inside.overlaps(&a));
    }

    // ── compute_slots ──

    #[test]
    fn test_slots_fill_window_in_quarter_hours() {
        let slots = compute_slots(date("2025-06-10"), &window("09:00", "12:00"), 60, &[]);
        assert_eq!(
            times(&slots),
            vec!["09:00", "09:15", "09:30", "09:45", "10:00", "10:15", "10:30", "10:45", "11:00"]
        );
        assert!(slots.iter().all(|s| s.available));
    }

    #[test]
    fn test_slots_stay_inside_window() {
        let d = date("2025-06-10");
        let w = window("10:00", "13:20");
        for duration in [15, 45, 50, 90, 200] {
            let bounds = w.on(d);
            for slot in compute_slots(d, &w, duration, &[]) {
                let start = anchor(d, slot.time);
                assert!(start >= bounds.start);
                assert!(start + Duration::minutes(duration) <= bounds.end);
            }
        }
    }

    #[test]
    fn test_service_longer_than_window_has_no_slots() {
        let slots = compute_slots(date("2025-06-10"), &window("09:00", "10:00"), 90, &[]);
        assert!(slots.is_empty());
    }

    #[test]
    fn test_non_positive_duration_has_no_slots() {
        assert!(compute_slots(date("2025-06-10"), &window("09:00", "10:00"), 0, &[]).is_empty());
    }

    #[test]
    fn test_booking_with_gap_blocks_overlapping_slots() {
        // 60 min service + 15 min gap booked at 09:00 occupies 09:00-10:15.
        let busy = [Interval::new(at("2025-06-10", "09:00"), at("2025-06-10", "10:15"))];
        let slots = compute_slots(date("2025-06-10"), &window("09:00", "12:00"), 60, &busy);

        let taken: Vec<String> = slots.iter().filter(|s| !s.available).map(|s| s.time.to_string()).collect();
        let open: Vec<String> = slots.iter().filter(|s| s.available).map(|s| s.time.to_string()).collect();
        assert_eq!(taken, vec!["09:00", "09:15", "09:30", "09:45", "10:00"]);
        assert_eq!(open, vec!["10:15", "10:30", "10:45", "11:00"]);
    }

    #[test]
    fn test_booking_in_middle_blocks_slots_reaching_into_it() {
        let busy = [Interval::new(at("2025-06-10", "11:00"), at("2025-06-10", "11:30"))];
        let slots = compute_slots(date("2025-06-10"), &window("10:00", "13:00"), 30, &busy);
        let taken: Vec<String> = slots.iter().filter(|s| !s.available).map(|s| s.time.to_string()).collect();
        assert_eq!(taken, vec!["10:45", "11:00", "11:15"]);
    }
}
