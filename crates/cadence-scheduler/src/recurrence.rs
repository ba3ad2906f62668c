use chrono::{DateTime, Duration, Months, Utc};

use crate::{
    db::is_storable,
    types::{Recurrence, RecurrencePattern},
};

/// Compute the occurrence that follows `anchor` under `rec`.
///
/// Returns `None` when the rule is exhausted: a `Once` rule, a result past
/// `rec.end_at` or past year 9999, or a result that would not move strictly
/// forward.
pub fn next_occurrence(rec: &Recurrence, anchor: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = step(rec, anchor)?;
    if next <= anchor {
        return None;
    }
    within_window(rec, next)
}

/// Like [`next_occurrence`], but skips any occurrences that are already at or
/// before `now`.
///
/// The series stays aligned to `anchor` (the last *scheduled* time), so a late
/// run never shifts later occurrences. Missed occurrences collapse: the caller
/// has published once for the backlog and gets the first future slot back.
pub fn next_after(
    rec: &Recurrence,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let mut next = next_occurrence(rec, anchor)?;
    if next > now {
        return Some(next);
    }

    match fixed_step(rec) {
        Some(stride) => {
            let stride_ms = stride.num_milliseconds();
            if stride_ms <= 0 {
                return None;
            }
            let behind_ms = (now - next).num_milliseconds();
            let skips = behind_ms / stride_ms + 1;
            next = next.checked_add_signed(Duration::milliseconds(stride_ms.checked_mul(skips)?))?;
        }
        None => {
            // Calendar months have no fixed length; walk forward one step at a time.
            while next <= now {
                next = step(rec, next)?;
            }
        }
    }

    within_window(rec, next)
}

/// One raw step of the rule, without the end-of-window check.
fn step(rec: &Recurrence, anchor: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match rec.pattern {
        RecurrencePattern::Once => None,
        RecurrencePattern::Monthly => anchor.checked_add_months(Months::new(rec.interval)),
        _ => anchor.checked_add_signed(fixed_step(rec)?),
    }
}

/// Duration of one step for patterns with a fixed length.
fn fixed_step(rec: &Recurrence) -> Option<Duration> {
    let n = i64::from(rec.interval);
    match rec.pattern {
        RecurrencePattern::Daily => Duration::try_days(n),
        RecurrencePattern::Weekly => Duration::try_weeks(n),
        RecurrencePattern::Custom => {
            let secs = rec.unit().num_seconds().checked_mul(n)?;
            Duration::try_seconds(secs)
        }
        RecurrencePattern::Once | RecurrencePattern::Monthly => None,
    }
}

fn within_window(rec: &Recurrence, next: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if !is_storable(next) {
        return None;
    }
    match rec.end_at {
        Some(end) if next > end => None,
        _ => Some(next),
    }
}
