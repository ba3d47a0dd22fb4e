//! Weekly template + repetition rule → concrete slot candidates. Pure.

use std::collections::HashSet;

use chrono::{Datelike, Duration, NaiveDate};
use tracing::warn;

use crate::limits::MAX_GENERATION_DAYS;
use crate::model::{RepetitionConfig, RepetitionKind, SlotCandidate, TimeRange, WeeklySchedule};

/// Expand `schedule` over the repetition window.
///
/// Candidates come out in chronological order. A schedule with no active day,
/// a zero slot length or an inverted date window yields nothing.
pub fn generate_slots(
    schedule: &WeeklySchedule,
    repetition: &RepetitionConfig,
    slot_minutes: u32,
) -> Vec<SlotCandidate> {
    if slot_minutes == 0 || !schedule.has_active_day() {
        return Vec::new();
    }
    let days = matched_days(schedule, repetition);
    filter_repetition(days, repetition.kind)
        .into_iter()
        .flat_map(|(date, window)| expand_day(date, window, slot_minutes))
        .collect()
}

/// Every day in the window whose weekday has an active entry, in order.
fn matched_days(
    schedule: &WeeklySchedule,
    repetition: &RepetitionConfig,
) -> Vec<(NaiveDate, TimeRange)> {
    let start = repetition.start_date;
    if repetition.end_date < start {
        return Vec::new();
    }
    let mut end = repetition.end_date;
    let limit = start + Duration::days(MAX_GENERATION_DAYS - 1);
    if end > limit {
        warn!(%start, requested_end = %end, %limit, "generation window clamped");
        end = limit;
    }

    start
        .iter_days()
        .take_while(|d| *d <= end)
        .filter_map(|d| schedule.active_on(d.weekday()).map(|s| (d, s.window())))
        .collect()
}

/// Positions are taken over the whole matched list, not per weekday.
fn filter_repetition(
    days: Vec<(NaiveDate, TimeRange)>,
    kind: RepetitionKind,
) -> Vec<(NaiveDate, TimeRange)> {
    match kind {
        RepetitionKind::Weekly => days,
        RepetitionKind::Biweekly => days
            .into_iter()
            .enumerate()
            .filter(|(i, _)| i % 2 == 0)
            .map(|(_, d)| d)
            .collect(),
        RepetitionKind::Monthly => {
            let mut seen = HashSet::new();
            days.into_iter()
                .filter(|(d, _)| seen.insert((d.year(), d.month())))
                .collect()
        }
    }
}

/// Step through `[start, end)`; an empty window yields nothing.
fn expand_day(date: NaiveDate, window: TimeRange, slot_minutes: u32) -> Vec<SlotCandidate> {
    let mut out = Vec::new();
    let mut cur = Some(window.start);
    while let Some(time) = cur {
        if time >= window.end {
            break;
        }
        out.push(SlotCandidate {
            date,
            time,
            duration_minutes: slot_minutes,
        });
        cur = time.add_minutes(slot_minutes);
    }
    out
}
