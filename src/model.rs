use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{NaiveDate, NaiveTime, TimeDelta, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Only used for creation timestamps; schedule times are
/// calendar dates plus times of day in the salon's single local zone.
pub type Ms = i64;

/// Half-open time-of-day interval `[start, end)` with `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeInterval {
    start: NaiveTime,
    end: NaiveTime,
}

impl TimeInterval {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, InvalidInterval> {
        if start < end {
            Ok(Self { start, end })
        } else {
            Err(InvalidInterval { start, end })
        }
    }

    /// `[start, start + minutes)`, or `None` if it would run past midnight.
    pub fn starting_at(start: NaiveTime, minutes: u32) -> Option<Self> {
        let (end, wrapped) = start.overflowing_add_signed(TimeDelta::minutes(i64::from(minutes)));
        if wrapped != 0 {
            return None;
        }
        Self::new(start, end).ok()
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    /// Back-to-back intervals (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &TimeInterval) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: NaiveTime) -> bool {
        self.start <= t && t < self.end
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", format_time(self.start), format_time(self.end))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidInterval {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl fmt::Display for InvalidInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "start {} must be before end {}",
            format_time(self.start),
            format_time(self.end)
        )
    }
}

impl std::error::Error for InvalidInterval {}

/// `HH:mm`, the wire format for times of day.
pub fn format_time(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

/// `yyyy-MM-dd`, the wire format for calendar dates.
pub fn format_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

/// Accepts `HH:mm` and `HH:mm:ss`.
pub fn parse_time(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// Weekday from its 0 = Sunday … 6 = Saturday number.
pub fn weekday_from_number(n: u32) -> Option<Weekday> {
    match n {
        0 => Some(Weekday::Sun),
        1..=6 => Weekday::try_from((n - 1) as u8).ok(),
        _ => None,
    }
}

pub fn weekday_number(day: Weekday) -> u32 {
    day.num_days_from_sunday()
}

/// A whole date on which the specialist takes no bookings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffDay {
    pub id: Ulid,
    pub specialist_id: Ulid,
    pub date: NaiveDate,
    pub reason: Option<String>,
}

/// When a break rule is in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakSchedule {
    /// Every week on `day`, or every day when `day` is `None`.
    Weekly { day: Option<Weekday> },
    /// Exactly one calendar date.
    OnDate(NaiveDate),
}

impl BreakSchedule {
    /// Build from the flat `(is_recurring, day_of_week, specific_date)` form.
    /// A one-off break ignores `day_of_week`.
    pub fn from_parts(
        is_recurring: bool,
        day_of_week: Option<Weekday>,
        specific_date: Option<NaiveDate>,
    ) -> Result<Self, &'static str> {
        match (is_recurring, specific_date) {
            (true, None) => Ok(BreakSchedule::Weekly { day: day_of_week }),
            (true, Some(_)) => Err("recurring break must not have a specific date"),
            (false, Some(date)) => Ok(BreakSchedule::OnDate(date)),
            (false, None) => Err("one-off break requires a specific date"),
        }
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self, BreakSchedule::Weekly { .. })
    }

    pub fn day_of_week(&self) -> Option<Weekday> {
        match self {
            BreakSchedule::Weekly { day } => *day,
            BreakSchedule::OnDate(_) => None,
        }
    }

    pub fn specific_date(&self) -> Option<NaiveDate> {
        match self {
            BreakSchedule::OnDate(date) => Some(*date),
            BreakSchedule::Weekly { .. } => None,
        }
    }
}

/// A sub-daily unavailable interval, recurring or date-specific.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakRule {
    pub id: Ulid,
    pub specialist_id: Ulid,
    pub schedule: BreakSchedule,
    pub interval: TimeInterval,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "Confirmed",
            BookingStatus::Cancelled => "Cancelled",
            BookingStatus::Completed => "Completed",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub client_id: Ulid,
    pub specialist_id: Ulid,
    pub date: NaiveDate,
    pub interval: TimeInterval,
    pub service_name: String,
    pub notes: Option<String>,
    pub status: BookingStatus,
    pub created_at: Ms,
}

impl Booking {
    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }
}

/// Payload for a reservation request. The caller generates the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub id: Ulid,
    pub specialist_id: Ulid,
    pub client_id: Ulid,
    pub date: NaiveDate,
    pub interval: TimeInterval,
    pub service_name: String,
    pub notes: Option<String>,
}

/// Everything the engine knows about one specialist's calendar.
#[derive(Debug, Clone)]
pub struct SpecialistState {
    pub id: Ulid,
    /// At most one off-day per date.
    pub off_days: BTreeMap<NaiveDate, OffDay>,
    pub breaks: Vec<BreakRule>,
    /// Bookings of every status, grouped by date and sorted by start time.
    pub bookings: BTreeMap<NaiveDate, Vec<Booking>>,
    booking_dates: HashMap<Ulid, NaiveDate>,
}

impl SpecialistState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            off_days: BTreeMap::new(),
            breaks: Vec::new(),
            bookings: BTreeMap::new(),
            booking_dates: HashMap::new(),
        }
    }

    /// No off-days, breaks or bookings.
    pub fn is_empty(&self) -> bool {
        self.off_days.is_empty() && self.breaks.is_empty() && self.bookings.is_empty()
    }

    // ── Off-days ─────────────────────────────────────────────

    pub fn off_day_on(&self, date: NaiveDate) -> Option<&OffDay> {
        self.off_days.get(&date)
    }

    pub fn find_off_day(&self, id: Ulid) -> Option<&OffDay> {
        self.off_days.values().find(|o| o.id == id)
    }

    pub fn insert_off_day(&mut self, off_day: OffDay) {
        self.off_days.insert(off_day.date, off_day);
    }

    pub fn remove_off_day(&mut self, id: Ulid) -> Option<OffDay> {
        let date = self.find_off_day(id)?.date;
        self.off_days.remove(&date)
    }

    // ── Breaks ───────────────────────────────────────────────

    pub fn find_break(&self, id: Ulid) -> Option<&BreakRule> {
        self.breaks.iter().find(|b| b.id == id)
    }

    pub fn insert_break(&mut self, rule: BreakRule) {
        self.breaks.push(rule);
    }

    pub fn remove_break(&mut self, id: Ulid) -> Option<BreakRule> {
        let pos = self.breaks.iter().position(|b| b.id == id)?;
        Some(self.breaks.remove(pos))
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Insert keeping the day's list sorted by start time.
    pub fn insert_booking(&mut self, booking: Booking) {
        self.booking_dates.insert(booking.id, booking.date);
        let day = self.bookings.entry(booking.date).or_default();
        let pos = day
            .binary_search_by_key(&booking.interval.start(), |b| b.interval.start())
            .unwrap_or_else(|e| e);
        day.insert(pos, booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        let date = self.booking_dates.get(&id)?;
        self.bookings.get(date)?.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        let date = self.booking_dates.get(&id)?;
        self.bookings.get_mut(date)?.iter_mut().find(|b| b.id == id)
    }

    pub fn bookings_on(&self, date: NaiveDate) -> &[Booking] {
        self.bookings.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn confirmed_on(&self, date: NaiveDate) -> impl Iterator<Item = &Booking> {
        self.bookings_on(date).iter().filter(|b| b.is_confirmed())
    }

    /// Confirmed bookings on `date` whose interval overlaps `query`.
    /// Bookings starting at or after `query.end` are skipped by binary search.
    pub fn overlapping_confirmed(
        &self,
        date: NaiveDate,
        query: &TimeInterval,
    ) -> impl Iterator<Item = &Booking> {
        let day = self.bookings_on(date);
        let right_bound = day.partition_point(|b| b.interval.start() < query.end());
        let query = *query;
        day[..right_bound]
            .iter()
            .filter(move |b| b.is_confirmed() && b.interval.overlaps(&query))
    }

    pub fn all_bookings(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.values().flatten()
    }
}

/// WAL record. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    OffDayAdded {
        id: Ulid,
        specialist_id: Ulid,
        date: NaiveDate,
        reason: Option<String>,
    },
    OffDaysRemoved {
        ids: Vec<Ulid>,
        specialist_id: Ulid,
    },
    BreakAdded {
        id: Ulid,
        specialist_id: Ulid,
        schedule: BreakSchedule,
        interval: TimeInterval,
        description: Option<String>,
    },
    BreakRemoved {
        id: Ulid,
        specialist_id: Ulid,
    },
    BookingConfirmed {
        id: Ulid,
        specialist_id: Ulid,
        client_id: Ulid,
        date: NaiveDate,
        interval: TimeInterval,
        service_name: String,
        notes: Option<String>,
        created_at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        specialist_id: Ulid,
    },
    BookingCompleted {
        id: Ulid,
        specialist_id: Ulid,
    },
}

impl Event {
    pub fn specialist_id(&self) -> Ulid {
        match self {
            Event::OffDayAdded { specialist_id, .. }
            | Event::OffDaysRemoved { specialist_id, .. }
            | Event::BreakAdded { specialist_id, .. }
            | Event::BreakRemoved { specialist_id, .. }
            | Event::BookingConfirmed { specialist_id, .. }
            | Event::BookingCancelled { specialist_id, .. }
            | Event::BookingCompleted { specialist_id, .. } => *specialist_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::OffDayAdded { .. } => "off_day_added",
            Event::OffDaysRemoved { .. } => "off_days_removed",
            Event::BreakAdded { .. } => "break_added",
            Event::BreakRemoved { .. } => "break_removed",
            Event::BookingConfirmed { .. } => "booking_confirmed",
            Event::BookingCancelled { .. } => "booking_cancelled",
            Event::BookingCompleted { .. } => "booking_completed",
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Raw off-days and breaks of one specialist, for calendar rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailabilitySnapshot {
    pub off_days: Vec<OffDay>,
    pub breaks: Vec<BreakRule>,
}
