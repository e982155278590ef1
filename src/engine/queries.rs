use std::cmp::Reverse;

use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::*;

use super::availability::{day_exclusions, DayExclusions};
use super::conflict::validate_duration;
use super::slots::{self, Slot};
use super::{Engine, EngineError};

impl Engine {
    /// Exclusions plus confirmed booking intervals for one date, read under a
    /// single lock acquisition. Unknown specialists have an empty calendar.
    async fn day_view(
        &self,
        specialist_id: Ulid,
        date: NaiveDate,
    ) -> (DayExclusions, Vec<TimeInterval>) {
        let Some(rs) = self.get_specialist(&specialist_id) else {
            return (DayExclusions::default(), Vec::new());
        };
        let guard = rs.read().await;
        let booked = guard.confirmed_on(date).map(|b| b.interval).collect();
        (day_exclusions(&guard, date), booked)
    }

    pub async fn day_exclusions(&self, specialist_id: Ulid, date: NaiveDate) -> DayExclusions {
        match self.get_specialist(&specialist_id) {
            Some(rs) => day_exclusions(&*rs.read().await, date),
            None => DayExclusions::default(),
        }
    }

    pub async fn is_day_off(&self, specialist_id: Ulid, date: NaiveDate) -> bool {
        match self.get_specialist(&specialist_id) {
            Some(rs) => rs.read().await.off_day_on(date).is_some(),
            None => false,
        }
    }

    /// Bookable start times for a service of `duration_minutes` on `date`.
    /// Advisory only: `create_booking` re-checks everything.
    pub async fn available_slots(
        &self,
        specialist_id: Ulid,
        date: NaiveDate,
        duration_minutes: u32,
    ) -> Result<Vec<NaiveTime>, EngineError> {
        validate_duration(duration_minutes)?;
        let (day, booked) = self.day_view(specialist_id, date).await;
        Ok(slots::available_starts(&self.policy, &day, &booked, duration_minutes).collect())
    }

    /// Every candidate slot of the day with its state.
    pub async fn slot_board(
        &self,
        specialist_id: Ulid,
        date: NaiveDate,
        duration_minutes: u32,
    ) -> Result<Vec<Slot>, EngineError> {
        validate_duration(duration_minutes)?;
        let (day, booked) = self.day_view(specialist_id, date).await;
        Ok(slots::slot_board(&self.policy, &day, &booked, duration_minutes).collect())
    }

    /// Off-days by date; breaks by weekday (every-day and one-off rules
    /// first, then Sunday through Saturday) and start time.
    pub async fn availability_snapshot(&self, specialist_id: Ulid) -> AvailabilitySnapshot {
        let Some(rs) = self.get_specialist(&specialist_id) else {
            return AvailabilitySnapshot::default();
        };
        let guard = rs.read().await;
        let off_days = guard.off_days.values().cloned().collect();
        let mut breaks = guard.breaks.clone();
        breaks.sort_by_key(|r| {
            let weekday = r
                .schedule
                .day_of_week()
                .map(|d| d.num_days_from_sunday() + 1)
                .unwrap_or(0);
            (weekday, r.interval.start())
        });
        AvailabilitySnapshot { off_days, breaks }
    }

    pub async fn off_days(&self, specialist_id: Ulid) -> Vec<OffDay> {
        self.availability_snapshot(specialist_id).await.off_days
    }

    pub async fn breaks(&self, specialist_id: Ulid) -> Vec<BreakRule> {
        self.availability_snapshot(specialist_id).await.breaks
    }

    /// Confirmed bookings on `date`, by start time.
    pub async fn confirmed_bookings(&self, specialist_id: Ulid, date: NaiveDate) -> Vec<Booking> {
        match self.get_specialist(&specialist_id) {
            Some(rs) => rs.read().await.confirmed_on(date).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// All of a specialist's bookings: newest date first, earliest start first
    /// within a date.
    pub async fn specialist_bookings(&self, specialist_id: Ulid) -> Vec<Booking> {
        let Some(rs) = self.get_specialist(&specialist_id) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        let mut out: Vec<Booking> = guard.all_bookings().cloned().collect();
        out.sort_by_key(|b| (Reverse(b.date), b.interval.start()));
        out
    }

    /// A client's bookings across every specialist, most recent first.
    pub async fn client_bookings(&self, client_id: Ulid) -> Vec<Booking> {
        let specialists: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in specialists {
            let guard = rs.read().await;
            out.extend(guard.all_bookings().filter(|b| b.client_id == client_id).cloned());
        }
        out.sort_by_key(|b| Reverse((b.date, b.interval.start())));
        out
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let specialist_id = self.get_specialist_for_entity(&id)?;
        let rs = self.get_specialist(&specialist_id)?;
        let guard = rs.read().await;
        guard.booking(id).cloned()
    }
}
