use chrono::{NaiveTime, TimeDelta};

use crate::model::*;

use super::availability::DayExclusions;

// ── Slot Generation ──────────────────────────────────────────────

/// Business hours and slot granularity used to enumerate candidate starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPolicy {
    pub opens_at: NaiveTime,
    pub closes_at: NaiveTime,
    pub granularity_minutes: u32,
}

impl Default for SlotPolicy {
    /// `[09:00, 18:00)` in 15-minute steps.
    fn default() -> Self {
        Self {
            opens_at: NaiveTime::from_hms_opt(9, 0, 0).expect("valid constant"),
            closes_at: NaiveTime::from_hms_opt(18, 0, 0).expect("valid constant"),
            granularity_minutes: 15,
        }
    }
}

impl SlotPolicy {
    pub fn new(
        opens_at: NaiveTime,
        closes_at: NaiveTime,
        granularity_minutes: u32,
    ) -> Result<Self, &'static str> {
        if opens_at >= closes_at {
            return Err("business hours must open before they close");
        }
        if granularity_minutes == 0 {
            return Err("slot granularity must be positive");
        }
        Ok(Self {
            opens_at,
            closes_at,
            granularity_minutes,
        })
    }

    /// `[t, t + duration)` for every granularity boundary `t` from opening
    /// time on, as long as the interval still ends by closing time.
    pub fn candidates(&self, duration_minutes: u32) -> impl Iterator<Item = TimeInterval> {
        let step = TimeDelta::minutes(i64::from(self.granularity_minutes.max(1)));
        let closes_at = self.closes_at;
        let first = (self.opens_at < closes_at).then_some(self.opens_at);
        std::iter::successors(first, move |t| {
            let (next, wrapped) = t.overflowing_add_signed(step);
            (wrapped == 0 && next < closes_at).then_some(next)
        })
        // candidate ends only grow, so the first one that does not fit ends the walk
        .map_while(move |t| {
            TimeInterval::starting_at(t, duration_minutes).filter(|c| c.end() <= closes_at)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Available,
    DayOff,
    OnBreak,
    Booked,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotState::Available => "available",
            SlotState::DayOff => "day_off",
            SlotState::OnBreak => "on_break",
            SlotState::Booked => "booked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub state: SlotState,
}

/// Off-day beats break beats booking.
pub fn classify(day: &DayExclusions, booked: &[TimeInterval], candidate: &TimeInterval) -> SlotState {
    if day.day_off {
        SlotState::DayOff
    } else if day.break_overlapping(candidate).is_some() {
        SlotState::OnBreak
    } else if booked.iter().any(|b| b.overlaps(candidate)) {
        SlotState::Booked
    } else {
        SlotState::Available
    }
}

/// Bookable start times for a service of `duration_minutes`, ascending.
/// `booked` holds the intervals of the date's confirmed bookings.
pub fn available_starts<'a>(
    policy: &'a SlotPolicy,
    day: &'a DayExclusions,
    booked: &'a [TimeInterval],
    duration_minutes: u32,
) -> impl Iterator<Item = NaiveTime> + 'a {
    let candidates = (!day.day_off).then(|| policy.candidates(duration_minutes));
    candidates
        .into_iter()
        .flatten()
        .filter(move |c| classify(day, booked, c) == SlotState::Available)
        .map(|c| c.start())
}

/// Every candidate with the reason it is or is not bookable.
pub fn slot_board<'a>(
    policy: &'a SlotPolicy,
    day: &'a DayExclusions,
    booked: &'a [TimeInterval],
    duration_minutes: u32,
) -> impl Iterator<Item = Slot> + 'a {
    policy.candidates(duration_minutes).map(move |c| Slot {
        start: c.start(),
        end: c.end(),
        state: classify(day, booked, &c),
    })
}
