use chrono::{Datelike, NaiveDate};

use crate::model::*;

// ── Availability Aggregation ─────────────────────────────────────

/// What a specialist's calendar takes away from one date.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DayExclusions {
    /// The whole date is blocked by an off-day.
    pub day_off: bool,
    /// Intervals of every applicable break rule, sorted by start.
    /// Not merged: each rule rejects a slot on its own.
    pub breaks: Vec<TimeInterval>,
}

impl DayExclusions {
    /// First break interval that `interval` collides with, if any.
    pub fn break_overlapping(&self, interval: &TimeInterval) -> Option<&TimeInterval> {
        self.breaks.iter().find(|b| b.overlaps(interval))
    }
}

/// Recurring rules apply on every matching weekday (or every day when no
/// weekday is set); one-off rules apply on their exact date. There is no
/// precedence between the two: a one-off rule never suppresses a recurring one.
pub fn schedule_applies(schedule: &BreakSchedule, date: NaiveDate) -> bool {
    match schedule {
        BreakSchedule::Weekly { day: None } => true,
        BreakSchedule::Weekly { day: Some(day) } => date.weekday() == *day,
        BreakSchedule::OnDate(on) => *on == date,
    }
}

pub fn applicable_breaks(
    ss: &SpecialistState,
    date: NaiveDate,
) -> impl Iterator<Item = &BreakRule> {
    ss.breaks
        .iter()
        .filter(move |rule| schedule_applies(&rule.schedule, date))
}

pub fn day_exclusions(ss: &SpecialistState, date: NaiveDate) -> DayExclusions {
    let day_off = ss.off_day_on(date).is_some();
    let mut breaks: Vec<TimeInterval> = applicable_breaks(ss, date).map(|r| r.interval).collect();
    breaks.sort_by_key(|i| i.start());
    DayExclusions { day_off, breaks }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveTime, Weekday};
    use ulid::Ulid;

    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn iv(h1: u32, m1: u32, h2: u32, m2: u32) -> TimeInterval {
        TimeInterval::new(t(h1, m1), t(h2, m2)).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn with_breaks(rules: Vec<(BreakSchedule, TimeInterval)>) -> SpecialistState {
        let mut ss = SpecialistState::new(Ulid::new());
        for (schedule, interval) in rules {
            ss.insert_break(BreakRule {
                id: Ulid::new(),
                specialist_id: ss.id,
                schedule,
                interval,
                description: None,
            });
        }
        ss
    }

    // 2024-06-10 is a Monday.
    const MONDAY: (i32, u32, u32) = (2024, 6, 10);

    #[test]
    fn weekly_rule_applies_only_on_its_weekday() {
        let monday = BreakSchedule::Weekly { day: Some(Weekday::Mon) };
        let start = d(MONDAY.0, MONDAY.1, MONDAY.2);
        for offset in 0..14 {
            let date = start + chrono::Days::new(offset);
            assert_eq!(
                schedule_applies(&monday, date),
                date.weekday() == Weekday::Mon,
                "{date}"
            );
        }
    }

    #[test]
    fn every_day_rule_applies_everywhere() {
        let every_day = BreakSchedule::Weekly { day: None };
        let start = d(2024, 1, 1);
        for offset in 0..7 {
            assert!(schedule_applies(&every_day, start + chrono::Days::new(offset)));
        }
    }

    #[test]
    fn one_off_rule_applies_only_on_its_date() {
        // a Wednesday, unrelated to any weekday filter
        let on = BreakSchedule::OnDate(d(2024, 6, 12));
        assert!(schedule_applies(&on, d(2024, 6, 12)));
        assert!(!schedule_applies(&on, d(2024, 6, 19)));
        assert!(!schedule_applies(&on, d(2024, 6, 11)));
    }

    #[test]
    fn exclusions_collect_every_applicable_rule() {
        let ss = with_breaks(vec![
            (BreakSchedule::Weekly { day: Some(Weekday::Mon) }, iv(12, 0, 13, 0)),
            (BreakSchedule::Weekly { day: None }, iv(12, 0, 13, 0)),
            (BreakSchedule::OnDate(d(2024, 6, 10)), iv(15, 0, 15, 30)),
            (BreakSchedule::Weekly { day: Some(Weekday::Tue) }, iv(10, 0, 11, 0)),
            (BreakSchedule::OnDate(d(2024, 6, 11)), iv(16, 0, 17, 0)),
        ]);
        let ex = day_exclusions(&ss, d(2024, 6, 10));
        assert!(!ex.day_off);
        // duplicates are kept
        assert_eq!(
            ex.breaks,
            vec![iv(12, 0, 13, 0), iv(12, 0, 13, 0), iv(15, 0, 15, 30)]
        );

        let tuesday = day_exclusions(&ss, d(2024, 6, 11));
        assert_eq!(
            tuesday.breaks,
            vec![iv(10, 0, 11, 0), iv(12, 0, 13, 0), iv(16, 0, 17, 0)]
        );
    }

    #[test]
    fn off_day_marks_whole_date() {
        let mut ss = with_breaks(vec![]);
        ss.insert_off_day(OffDay {
            id: Ulid::new(),
            specialist_id: ss.id,
            date: d(2024, 6, 15),
            reason: None,
        });
        assert!(day_exclusions(&ss, d(2024, 6, 15)).day_off);
        assert!(!day_exclusions(&ss, d(2024, 6, 16)).day_off);
    }

    #[test]
    fn one_off_rule_does_not_suppress_recurring() {
        let ss = with_breaks(vec![
            (BreakSchedule::Weekly { day: Some(Weekday::Mon) }, iv(12, 0, 13, 0)),
            (BreakSchedule::OnDate(d(2024, 6, 10)), iv(14, 0, 15, 0)),
        ]);
        let ex = day_exclusions(&ss, d(2024, 6, 10));
        assert_eq!(ex.breaks.len(), 2);
        assert!(ex.break_overlapping(&iv(12, 30, 12, 45)).is_some());
        assert!(ex.break_overlapping(&iv(13, 0, 14, 0)).is_none());
    }

    #[test]
    fn empty_calendar_excludes_nothing() {
        let ss = SpecialistState::new(Ulid::new());
        assert_eq!(day_exclusions(&ss, d(2024, 6, 10)), DayExclusions::default());
    }
}
