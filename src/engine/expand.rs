use std::str::FromStr;

use chrono::{DateTime, Datelike, Weekday};
use chrono_tz::Tz;

use crate::limits::*;
use crate::model::*;

use super::EngineError;
use super::timeconv::shift_local_days;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Frequency {
    #[default]
    None,
    Daily,
    Weekly,
    /// Daily, but repeats landing on Saturday/Sunday (UTC) are dropped.
    Weekdays,
}

impl FromStr for Frequency {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Ok(Frequency::None),
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "weekdays" => Ok(Frequency::Weekdays),
            _ => Err(EngineError::InvalidRecurrence("unknown frequency")),
        }
    }
}

/// How a base range repeats. `occurrence_count` counts repeats beyond the base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    pub occurrence_count: u32,
}

impl RecurrenceRule {
    pub const NONE: RecurrenceRule = RecurrenceRule {
        frequency: Frequency::None,
        occurrence_count: 0,
    };

    pub fn new(frequency: Frequency, occurrence_count: i64) -> Result<Self, EngineError> {
        if occurrence_count < 0 {
            return Err(EngineError::InvalidRecurrence("occurrence count must be non-negative"));
        }
        if occurrence_count > MAX_OCCURRENCES {
            return Err(EngineError::InvalidRecurrence("too many occurrences"));
        }
        Ok(Self {
            frequency,
            occurrence_count: occurrence_count as u32,
        })
    }

    fn step_days(&self) -> Option<i64> {
        match self.frequency {
            Frequency::None => None,
            Frequency::Daily | Frequency::Weekdays => Some(1),
            Frequency::Weekly => Some(7),
        }
    }
}

/// [`expand_in`] with repeats laid out on the UTC calendar.
pub fn expand(
    base_start: Ms,
    base_end: Option<Ms>,
    rule: &RecurrenceRule,
) -> Result<Vec<Span>, EngineError> {
    expand_in(base_start, base_end, rule, &Tz::UTC)
}

/// Expand a base range plus recurrence into candidate 30-minute slots.
///
/// Repeats keep each base slot's wall-clock time in `tz`, so a 09:00 slot
/// stays at 09:00 local after a DST change. Output is base slots first, then
/// repeat 1 for every base slot, repeat 2, and so on. It is not sorted by
/// time. The weekday filter only ever drops repeats; a base slot on a
/// weekend is kept.
pub fn expand_in(
    base_start: Ms,
    base_end: Option<Ms>,
    rule: &RecurrenceRule,
    tz: &Tz,
) -> Result<Vec<Span>, EngineError> {
    let base = base_tiling(base_start, base_end)?;
    let Some(step) = rule.step_days() else {
        return Ok(base);
    };

    let total = base.len().saturating_mul(rule.occurrence_count as usize + 1);
    if total > MAX_GENERATED_SLOTS {
        return Err(EngineError::LimitExceeded("too many slots in one request"));
    }

    let weekdays_only = rule.frequency == Frequency::Weekdays;
    let repeats = (1..=Ms::from(rule.occurrence_count))
        .flat_map(|i| {
            base.iter()
                .map(move |s| Span::slot_at(shift_local_days(s.start, i * step, tz)))
        })
        .filter(|s| !(weekdays_only && is_weekend_utc(s.start)));

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&base);
    out.extend(repeats);
    Ok(out)
}

/// Tile `[start, end)` with whole slots; a trailing partial slot is dropped.
fn base_tiling(start: Ms, end: Option<Ms>) -> Result<Vec<Span>, EngineError> {
    let Some(end) = end else {
        return Ok(vec![Span::slot_at(start)]);
    };
    if end <= start {
        return Err(EngineError::InvalidRange("end must be after start"));
    }
    if end - start > MAX_BASE_RANGE_MS {
        return Err(EngineError::InvalidRange("base range too wide"));
    }
    Ok((0..)
        .map(|k| Span::slot_at(start + k * SLOT_MS))
        .take_while(|s| s.end <= end)
        .collect())
}

fn is_weekend_utc(t: Ms) -> bool {
    DateTime::from_timestamp_millis(t)
        .is_some_and(|d| matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const M: Ms = MINUTE_MS;

    fn utc_ms(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Ms {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0)
            .single()
            .unwrap()
            .timestamp_millis()
    }

    fn rule(frequency: Frequency, n: i64) -> RecurrenceRule {
        RecurrenceRule::new(frequency, n).unwrap()
    }

    #[test]
    fn single_slot_without_end() {
        let start = utc_ms(2026, 3, 2, 9, 0);
        let slots = expand(start, None, &RecurrenceRule::NONE).unwrap();
        assert_eq!(slots, vec![Span::new(start, start + 30 * M)]);
    }

    #[test]
    fn ninety_minutes_is_three_contiguous_slots() {
        let start = utc_ms(2026, 3, 2, 9, 0);
        let slots = expand(start, Some(start + 90 * M), &RecurrenceRule::NONE).unwrap();
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].start, start);
        for pair in slots.windows(2) {
            assert_eq!(pair[0].end, pair[1].start, "gap or overlap");
        }
        assert_eq!(slots[2].end, start + 90 * M);
    }

    #[test]
    fn partial_remainder_discarded() {
        let start = utc_ms(2026, 3, 2, 9, 0);
        let slots = expand(start, Some(start + 100 * M), &RecurrenceRule::NONE).unwrap();
        assert_eq!(slots.len(), 3);
        assert_eq!(slots.last().unwrap().end, start + 90 * M);

        let short = expand(start, Some(start + 20 * M), &RecurrenceRule::NONE).unwrap();
        assert!(short.is_empty());
    }

    #[test]
    fn end_not_after_start_is_invalid_range() {
        let start = utc_ms(2026, 3, 2, 9, 0);
        for end in [start, start - M] {
            let err = expand(start, Some(end), &RecurrenceRule::NONE).unwrap_err();
            assert!(matches!(err, EngineError::InvalidRange(_)));
        }
    }

    #[test]
    fn base_range_too_wide() {
        let err = expand(0, Some(MAX_BASE_RANGE_MS + SLOT_MS), &RecurrenceRule::NONE).unwrap_err();
        assert!(matches!(err, EngineError::InvalidRange(_)));
    }

    #[test]
    fn negative_occurrences_rejected() {
        let err = RecurrenceRule::new(Frequency::Daily, -1).unwrap_err();
        assert!(matches!(err, EngineError::InvalidRecurrence(_)));
        let err = RecurrenceRule::new(Frequency::Daily, MAX_OCCURRENCES + 1).unwrap_err();
        assert!(matches!(err, EngineError::InvalidRecurrence(_)));
    }

    #[test]
    fn frequency_parsing() {
        assert_eq!("WEEKLY".parse::<Frequency>().unwrap(), Frequency::Weekly);
        assert_eq!("".parse::<Frequency>().unwrap(), Frequency::None);
        assert!(matches!(
            "fortnightly".parse::<Frequency>().unwrap_err(),
            EngineError::InvalidRecurrence(_)
        ));
    }

    #[test]
    fn weekly_repeats_in_generation_order() {
        let start = utc_ms(2026, 3, 2, 9, 0);
        let slots = expand(start, Some(start + 60 * M), &rule(Frequency::Weekly, 2)).unwrap();
        let starts: Vec<Ms> = slots.iter().map(|s| s.start).collect();
        assert_eq!(
            starts,
            vec![
                start,
                start + 30 * M,
                start + WEEK_MS,
                start + WEEK_MS + 30 * M,
                start + 2 * WEEK_MS,
                start + 2 * WEEK_MS + 30 * M,
            ]
        );
    }

    #[test]
    fn daily_repeats_include_weekends() {
        // Friday 2026-03-06
        let start = utc_ms(2026, 3, 6, 9, 0);
        let slots = expand(start, None, &rule(Frequency::Daily, 3)).unwrap();
        assert_eq!(slots.len(), 4);
        assert_eq!(slots[3].start, start + 3 * DAY_MS);
    }

    #[test]
    fn weekdays_never_emit_weekend_repeats() {
        // Every starting weekday, seven repeats each.
        for day in 2..=8 {
            let start = utc_ms(2026, 3, day, 10, 0);
            let slots = expand(start, Some(start + 60 * M), &rule(Frequency::Weekdays, 7)).unwrap();
            for s in &slots[2..] {
                assert!(!is_weekend_utc(s.start), "weekend repeat at {}", s.start);
            }
            // 7 repeated days always contain exactly 5 weekdays.
            assert_eq!(slots.len(), 2 + 5 * 2);
        }
    }

    #[test]
    fn weekdays_keeps_weekend_base() {
        // Saturday 2026-03-07: base kept, Sunday repeat dropped, Monday kept.
        let start = utc_ms(2026, 3, 7, 9, 0);
        let slots = expand(start, None, &rule(Frequency::Weekdays, 2)).unwrap();
        assert_eq!(slots, vec![Span::slot_at(start), Span::slot_at(start + 2 * DAY_MS)]);
    }

    #[test]
    fn weekday_filter_uses_utc_calendar() {
        // Friday 23:30 UTC: the Saturday and Sunday repeats go, even though in
        // Los Angeles they fall on Friday and Saturday afternoon.
        let start = utc_ms(2026, 3, 6, 23, 30);
        let slots = expand(start, None, &rule(Frequency::Weekdays, 3)).unwrap();
        assert_eq!(slots, vec![Span::slot_at(start), Span::slot_at(start + 3 * DAY_MS)]);
    }

    #[test]
    fn weekly_repeat_keeps_local_time_across_dst() {
        // New York springs forward on 2026-03-08: 09:00 EST is 14:00 UTC,
        // 09:00 EDT a week later is 13:00 UTC.
        let ny: Tz = "America/New_York".parse().unwrap();
        let start = utc_ms(2026, 3, 2, 14, 0);
        let slots = expand_in(start, None, &rule(Frequency::Weekly, 2), &ny).unwrap();
        assert_eq!(
            slots,
            vec![
                Span::slot_at(start),
                Span::slot_at(utc_ms(2026, 3, 9, 13, 0)),
                Span::slot_at(utc_ms(2026, 3, 16, 13, 0)),
            ]
        );
    }

    #[test]
    fn daily_repeat_keeps_local_time_across_fall_back() {
        // Berlin falls back on 2026-10-25: 10:00 CEST is 08:00 UTC, 10:00 CET is 09:00 UTC.
        let berlin: Tz = "Europe/Berlin".parse().unwrap();
        let start = utc_ms(2026, 10, 24, 8, 0);
        let slots = expand_in(start, Some(start + 60 * M), &rule(Frequency::Daily, 1), &berlin)
            .unwrap();
        let starts: Vec<Ms> = slots.iter().map(|s| s.start).collect();
        assert_eq!(
            starts,
            vec![
                start,
                start + 30 * M,
                utc_ms(2026, 10, 25, 9, 0),
                utc_ms(2026, 10, 25, 9, 30),
            ]
        );
    }

    #[test]
    fn oversized_request_rejected() {
        let start = utc_ms(2026, 3, 2, 0, 0);
        let err = expand(start, Some(start + 7 * DAY_MS), &rule(Frequency::Daily, 400)).unwrap_err();
        assert!(matches!(err, EngineError::LimitExceeded(_)));
    }
}
