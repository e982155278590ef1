use chrono::NaiveDate;
use tokio::sync::oneshot;
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{
    BOOKINGS_CANCELLED_TOTAL, BOOKINGS_COMPLETED_TOTAL, BOOKINGS_CREATED_TOTAL,
    BOOKING_REJECTIONS_TOTAL,
};

use super::conflict::{
    check_no_conflict, check_schedule_open, now_ms, validate_new_booking, validate_text,
};
use super::{Engine, EngineError, WalCommand};

fn rejection_reason(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict(_) => "conflict",
        EngineError::SpecialistUnavailable(_) => "day_off",
        EngineError::OnBreak(_) => "on_break",
        EngineError::AlreadyExists(_) => "duplicate",
        EngineError::LimitExceeded(_) => "limit",
        _ => "other",
    }
}

impl Engine {
    // ── Off-days ─────────────────────────────────────────────

    pub async fn add_off_day(
        &self,
        id: Ulid,
        specialist_id: Ulid,
        date: NaiveDate,
        reason: Option<String>,
    ) -> Result<OffDay, EngineError> {
        validate_text(reason.as_deref(), "off-day reason too long")?;
        let mut guard = self.write_specialist(specialist_id).await?;
        if self.entity_to_specialist.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if guard.off_days.len() >= MAX_OFF_DAYS_PER_SPECIALIST {
            return Err(EngineError::LimitExceeded("too many off-days"));
        }
        if guard.off_day_on(date).is_some() {
            return Err(EngineError::OffDayExists(date));
        }

        let event = Event::OffDayAdded {
            id,
            specialist_id,
            date,
            reason: reason.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!(%specialist_id, %date, "off-day added");
        Ok(OffDay {
            id,
            specialist_id,
            date,
            reason,
        })
    }

    /// Removes one off-day. An id the specialist does not own is `NotFound`.
    pub async fn remove_off_day(&self, specialist_id: Ulid, id: Ulid) -> Result<(), EngineError> {
        let mut guard = self.write_existing_specialist(specialist_id, id).await?;
        if guard.find_off_day(id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::OffDaysRemoved {
            ids: vec![id],
            specialist_id,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Removes every listed off-day the specialist owns, in one WAL record.
    /// Ids that are unknown or belong to someone else are skipped. Returns
    /// how many were removed.
    pub async fn remove_off_days(
        &self,
        specialist_id: Ulid,
        ids: &[Ulid],
    ) -> Result<usize, EngineError> {
        if ids.len() > MAX_BULK_IDS {
            return Err(EngineError::LimitExceeded("too many ids in one delete"));
        }
        if ids.is_empty() {
            return Ok(0);
        }

        let mut guard = match self.write_existing_specialist(specialist_id, specialist_id).await {
            Ok(guard) => guard,
            Err(EngineError::NotFound(_)) => return Ok(0),
            Err(e) => return Err(e),
        };
        let mut owned: Vec<Ulid> = ids
            .iter()
            .copied()
            .filter(|id| guard.find_off_day(*id).is_some())
            .collect();
        owned.sort_unstable();
        owned.dedup();
        if owned.is_empty() {
            return Ok(0);
        }

        let removed = owned.len();
        let event = Event::OffDaysRemoved {
            ids: owned,
            specialist_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!(%specialist_id, removed, "off-days removed");
        Ok(removed)
    }

    // ── Breaks ───────────────────────────────────────────────

    pub async fn add_break(
        &self,
        id: Ulid,
        specialist_id: Ulid,
        schedule: BreakSchedule,
        interval: TimeInterval,
        description: Option<String>,
    ) -> Result<BreakRule, EngineError> {
        validate_text(description.as_deref(), "break description too long")?;
        let mut guard = self.write_specialist(specialist_id).await?;
        if self.entity_to_specialist.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if guard.breaks.len() >= MAX_BREAKS_PER_SPECIALIST {
            return Err(EngineError::LimitExceeded("too many breaks"));
        }

        let event = Event::BreakAdded {
            id,
            specialist_id,
            schedule,
            interval,
            description: description.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!(%specialist_id, %interval, "break added");
        Ok(BreakRule {
            id,
            specialist_id,
            schedule,
            interval,
            description,
        })
    }

    pub async fn remove_break(&self, specialist_id: Ulid, id: Ulid) -> Result<(), EngineError> {
        let mut guard = self.write_existing_specialist(specialist_id, id).await?;
        if guard.find_break(id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::BreakRemoved { id, specialist_id };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Reserve `req.interval` on `req.date`. Off-days, breaks and existing
    /// confirmed bookings are all checked under the specialist's write lock,
    /// right before the WAL append.
    pub async fn create_booking(&self, req: NewBooking) -> Result<Booking, EngineError> {
        let result = self.try_create_booking(req).await;
        match &result {
            Ok(_) => metrics::counter!(BOOKINGS_CREATED_TOTAL).increment(1),
            Err(e) => {
                metrics::counter!(BOOKING_REJECTIONS_TOTAL, "reason" => rejection_reason(e))
                    .increment(1);
            }
        }
        result
    }

    async fn try_create_booking(&self, req: NewBooking) -> Result<Booking, EngineError> {
        validate_new_booking(&req)?;
        let mut guard = self.write_specialist(req.specialist_id).await?;
        if self.entity_to_specialist.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        if guard.bookings_on(req.date).len() >= MAX_BOOKINGS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many bookings on one date"));
        }
        check_schedule_open(&guard, req.date, &req.interval)?;
        if let Err(e) = check_no_conflict(&guard, req.date, &req.interval) {
            debug!(specialist_id = %req.specialist_id, date = %req.date, interval = %req.interval, "booking conflict");
            return Err(e);
        }

        let booking = Booking {
            id: req.id,
            client_id: req.client_id,
            specialist_id: req.specialist_id,
            date: req.date,
            interval: req.interval,
            service_name: req.service_name,
            notes: req.notes,
            status: BookingStatus::Confirmed,
            created_at: now_ms(),
        };
        let event = Event::BookingConfirmed {
            id: booking.id,
            specialist_id: booking.specialist_id,
            client_id: booking.client_id,
            date: booking.date,
            interval: booking.interval,
            service_name: booking.service_name.clone(),
            notes: booking.notes.clone(),
            created_at: booking.created_at,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!(id = %booking.id, specialist_id = %booking.specialist_id, "booking confirmed");
        Ok(booking)
    }

    /// Cancel on behalf of the booking's client. Cancelling twice is a no-op
    /// returning the cancelled booking; a completed booking can't be cancelled.
    /// A booking owned by another client is reported as `NotFound`.
    pub async fn cancel_booking(&self, id: Ulid, client_id: Ulid) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let status = guard
            .booking(id)
            .filter(|b| b.client_id == client_id)
            .map(|b| b.status)
            .ok_or(EngineError::NotFound(id))?;

        match status {
            BookingStatus::Cancelled => {}
            BookingStatus::Completed => return Err(EngineError::BookingClosed(id)),
            BookingStatus::Confirmed => {
                let event = Event::BookingCancelled {
                    id,
                    specialist_id: guard.id,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                metrics::counter!(BOOKINGS_CANCELLED_TOTAL).increment(1);
                debug!(%id, "booking cancelled");
            }
        }
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Mark a confirmed booking as served. Completing twice is a no-op.
    pub async fn complete_booking(
        &self,
        specialist_id: Ulid,
        id: Ulid,
    ) -> Result<Booking, EngineError> {
        let mut guard = self.write_existing_specialist(specialist_id, id).await?;
        let status = guard
            .booking(id)
            .map(|b| b.status)
            .ok_or(EngineError::NotFound(id))?;

        match status {
            BookingStatus::Completed => {}
            BookingStatus::Cancelled => return Err(EngineError::BookingClosed(id)),
            BookingStatus::Confirmed => {
                let event = Event::BookingCompleted { id, specialist_id };
                self.persist_and_apply(&mut guard, &event).await?;
                metrics::counter!(BOOKINGS_COMPLETED_TOTAL).increment(1);
            }
        }
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event sequence that rebuilds the
    /// current state. Writers are held off until the new file is in place.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;

        let specialists: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for rs in specialists {
            let guard = rs.read().await;
            let specialist_id = guard.id;

            for off_day in guard.off_days.values() {
                events.push(Event::OffDayAdded {
                    id: off_day.id,
                    specialist_id,
                    date: off_day.date,
                    reason: off_day.reason.clone(),
                });
            }
            for rule in &guard.breaks {
                events.push(Event::BreakAdded {
                    id: rule.id,
                    specialist_id,
                    schedule: rule.schedule,
                    interval: rule.interval,
                    description: rule.description.clone(),
                });
            }
            for b in guard.all_bookings() {
                events.push(Event::BookingConfirmed {
                    id: b.id,
                    specialist_id,
                    client_id: b.client_id,
                    date: b.date,
                    interval: b.interval,
                    service_name: b.service_name.clone(),
                    notes: b.notes.clone(),
                    created_at: b.created_at,
                });
                match b.status {
                    BookingStatus::Confirmed => {}
                    BookingStatus::Cancelled => events.push(Event::BookingCancelled {
                        id: b.id,
                        specialist_id,
                    }),
                    BookingStatus::Completed => events.push(Event::BookingCompleted {
                        id: b.id,
                        specialist_id,
                    }),
                }
            }
        }

        let event_count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StorageFailure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageFailure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageFailure(e.to_string()))?;
        debug!(event_count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
