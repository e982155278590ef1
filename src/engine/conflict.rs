use chrono::NaiveDate;

use crate::limits::*;
use crate::model::*;

use super::availability::applicable_breaks;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_duration(minutes: u32) -> Result<(), EngineError> {
    if minutes == 0 {
        return Err(EngineError::InvalidInterval(
            "service duration must be positive".into(),
        ));
    }
    if minutes > MAX_SERVICE_MINUTES {
        return Err(EngineError::LimitExceeded("service duration too long"));
    }
    Ok(())
}

pub(crate) fn validate_text(text: Option<&str>, what: &'static str) -> Result<(), EngineError> {
    match text {
        Some(t) if t.len() > MAX_TEXT_LEN => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

pub(crate) fn validate_new_booking(req: &NewBooking) -> Result<(), EngineError> {
    if req.service_name.len() > MAX_SERVICE_NAME_LEN {
        return Err(EngineError::LimitExceeded("service name too long"));
    }
    validate_text(req.notes.as_deref(), "notes too long")
}

/// Off-days and breaks, re-checked under the specialist's write lock so a
/// break added after slot listing still blocks the reservation.
pub(crate) fn check_schedule_open(
    ss: &SpecialistState,
    date: NaiveDate,
    interval: &TimeInterval,
) -> Result<(), EngineError> {
    if ss.off_day_on(date).is_some() {
        return Err(EngineError::SpecialistUnavailable(date));
    }
    if let Some(rule) = applicable_breaks(ss, date).find(|r| r.interval.overlaps(interval)) {
        return Err(EngineError::OnBreak(rule.id));
    }
    Ok(())
}

pub(crate) fn check_no_conflict(
    ss: &SpecialistState,
    date: NaiveDate,
    interval: &TimeInterval,
) -> Result<(), EngineError> {
    match ss.overlapping_confirmed(date, interval).next() {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveTime, Weekday};
    use ulid::Ulid;

    use super::*;

    fn iv(h1: u32, m1: u32, h2: u32, m2: u32) -> TimeInterval {
        TimeInterval::new(
            NaiveTime::from_hms_opt(h1, m1, 0).unwrap(),
            NaiveTime::from_hms_opt(h2, m2, 0).unwrap(),
        )
        .unwrap()
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 10).unwrap()
    }

    fn state_with_lunch() -> (SpecialistState, Ulid) {
        let sid = Ulid::new();
        let mut ss = SpecialistState::new(sid);
        let break_id = Ulid::new();
        ss.insert_break(BreakRule {
            id: break_id,
            specialist_id: sid,
            schedule: BreakSchedule::Weekly { day: Some(Weekday::Mon) },
            interval: iv(12, 0, 13, 0),
            description: None,
        });
        (ss, break_id)
    }

    #[test]
    fn duration_bounds() {
        assert!(matches!(validate_duration(0), Err(EngineError::InvalidInterval(_))));
        assert!(validate_duration(1).is_ok());
        assert!(validate_duration(MAX_SERVICE_MINUTES).is_ok());
        assert!(matches!(
            validate_duration(MAX_SERVICE_MINUTES + 1),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn text_limits() {
        assert!(validate_text(None, "x").is_ok());
        assert!(validate_text(Some(&"a".repeat(MAX_TEXT_LEN)), "x").is_ok());
        assert!(validate_text(Some(&"a".repeat(MAX_TEXT_LEN + 1)), "x").is_err());
    }

    #[test]
    fn break_blocks_touching_interval_only_when_overlapping() {
        let (ss, break_id) = state_with_lunch();
        assert!(matches!(
            check_schedule_open(&ss, monday(), &iv(11, 30, 12, 30)),
            Err(EngineError::OnBreak(id)) if id == break_id
        ));
        assert!(check_schedule_open(&ss, monday(), &iv(11, 0, 12, 0)).is_ok());
        assert!(check_schedule_open(&ss, monday(), &iv(13, 0, 14, 0)).is_ok());
        // Tuesday has no break.
        let tuesday = monday().succ_opt().unwrap();
        assert!(check_schedule_open(&ss, tuesday, &iv(12, 0, 13, 0)).is_ok());
    }

    #[test]
    fn off_day_wins_over_break() {
        let (mut ss, _) = state_with_lunch();
        ss.insert_off_day(OffDay {
            id: Ulid::new(),
            specialist_id: ss.id,
            date: monday(),
            reason: None,
        });
        assert!(matches!(
            check_schedule_open(&ss, monday(), &iv(12, 0, 13, 0)),
            Err(EngineError::SpecialistUnavailable(_))
        ));
    }

    #[test]
    fn conflict_names_the_existing_booking() {
        let (mut ss, _) = state_with_lunch();
        let existing = Booking {
            id: Ulid::new(),
            client_id: Ulid::new(),
            specialist_id: ss.id,
            date: monday(),
            interval: iv(9, 0, 10, 0),
            service_name: "Manicure".into(),
            notes: None,
            status: BookingStatus::Confirmed,
            created_at: 0,
        };
        let existing_id = existing.id;
        ss.insert_booking(existing);

        assert!(matches!(
            check_no_conflict(&ss, monday(), &iv(9, 45, 10, 15)),
            Err(EngineError::Conflict(id)) if id == existing_id
        ));
        assert!(check_no_conflict(&ss, monday(), &iv(10, 0, 11, 0)).is_ok());
    }
}
