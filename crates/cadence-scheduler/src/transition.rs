//! Result application: what a finished publish attempt does to an item.
//!
//! Kept free of I/O so every edge of the state machine can be tested
//! without a database.

use chrono::{DateTime, Utc};

use crate::{
    recurrence::next_after,
    retry::RetryPolicy,
    types::{ItemKind, ItemStatus, ScheduleItem},
};

/// Aggregate outcome of one occurrence across all target platforms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    /// Every platform accepted the post.
    Published,
    /// At least one platform failed; carries the combined error detail.
    Failed(String),
}

/// The field values an item takes after a worker reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub status: ItemStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    pub occurrence_at: Option<DateTime<Utc>>,
    pub occurrence_count: u32,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Decide the next state for a claimed `item`.
///
/// `pre_claim` is the status the item held before it was claimed; a retried
/// attempt returns there.
pub fn plan(
    item: &ScheduleItem,
    pre_claim: ItemStatus,
    result: &RunResult,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Transition {
    match result {
        RunResult::Published => plan_success(item, now),
        RunResult::Failed(error) => plan_failure(item, pre_claim, error, policy, now),
    }
}

fn plan_success(item: &ScheduleItem, now: DateTime<Utc>) -> Transition {
    let occurrence_count = item.occurrence_count.saturating_add(1);

    let next = match (item.kind, &item.recurrence) {
        (ItemKind::Recurring, Some(rec)) => {
            let anchor = item.occurrence_at.or(item.next_run_at).unwrap_or(now);
            next_after(rec, anchor, now)
        }
        _ => None,
    };

    match next {
        Some(next) => Transition {
            status: ItemStatus::Active,
            next_run_at: Some(next),
            occurrence_at: Some(next),
            occurrence_count,
            attempt_count: 0,
            last_error: item.last_error.clone(),
            completed_at: None,
        },
        None => Transition {
            status: ItemStatus::Completed,
            next_run_at: None,
            occurrence_at: item.occurrence_at,
            occurrence_count,
            attempt_count: 0,
            last_error: item.last_error.clone(),
            completed_at: Some(now),
        },
    }
}

fn plan_failure(
    item: &ScheduleItem,
    pre_claim: ItemStatus,
    error: &str,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Transition {
    let attempt_count = item.attempt_count.saturating_add(1);
    let last_error = Some(error.to_string());

    if RetryPolicy::should_retry(attempt_count, item.max_attempts) {
        let retry_at = now
            .checked_add_signed(policy.delay_for(attempt_count))
            .unwrap_or(now);
        let status = if pre_claim.is_claimable() {
            pre_claim
        } else {
            ItemStatus::Pending
        };
        Transition {
            status,
            next_run_at: Some(retry_at),
            occurrence_at: item.occurrence_at,
            occurrence_count: item.occurrence_count,
            attempt_count,
            last_error,
            completed_at: None,
        }
    } else {
        Transition {
            status: ItemStatus::Failed,
            next_run_at: item.next_run_at,
            occurrence_at: item.occurrence_at,
            occurrence_count: item.occurrence_count,
            attempt_count,
            last_error,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Recurrence, RecurrencePattern};
    use cadence_core::types::{ItemId, OwnerId, Platform};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
    }

    fn item(kind: ItemKind, recurrence: Option<Recurrence>) -> ScheduleItem {
        ScheduleItem {
            id: ItemId::new(),
            owner_id: OwnerId::from("owner"),
            content: "hello".into(),
            media_refs: Vec::new(),
            platforms: vec![Platform::new("a")],
            kind,
            status: ItemStatus::InFlight,
            next_run_at: Some(t0()),
            occurrence_at: Some(t0()),
            recurrence,
            occurrence_count: 0,
            attempt_count: 0,
            max_attempts: 3,
            last_error: None,
            claimed_at: Some(t0()),
            created_at: t0(),
            updated_at: t0(),
            completed_at: None,
        }
    }

    #[test]
    fn one_shot_success_completes() {
        let it = item(ItemKind::OneShot, None);
        let tr = plan(&it, ItemStatus::Pending, &RunResult::Published, &RetryPolicy::default(), t0());
        assert_eq!(tr.status, ItemStatus::Completed);
        assert_eq!(tr.next_run_at, None);
        assert_eq!(tr.completed_at, Some(t0()));
        assert_eq!(tr.occurrence_count, 1);
    }

    #[test]
    fn recurring_success_rearms_from_anchor() {
        let it = item(
            ItemKind::Recurring,
            Some(Recurrence::new(RecurrencePattern::Daily, 1)),
        );
        // worker finished ten minutes late; the series stays on the hour
        let now = t0() + Duration::minutes(10);
        let tr = plan(&it, ItemStatus::Pending, &RunResult::Published, &RetryPolicy::default(), now);
        assert_eq!(tr.status, ItemStatus::Active);
        assert_eq!(tr.next_run_at, Some(t0() + Duration::days(1)));
        assert_eq!(tr.occurrence_count, 1);
        assert_eq!(tr.attempt_count, 0);
    }

    #[test]
    fn recurring_success_past_window_completes() {
        let rec = Recurrence::new(RecurrencePattern::Weekly, 1).until(t0() + Duration::days(3));
        let it = item(ItemKind::Recurring, Some(rec));
        let tr = plan(&it, ItemStatus::Active, &RunResult::Published, &RetryPolicy::default(), t0());
        assert_eq!(tr.status, ItemStatus::Completed);
        assert_eq!(tr.next_run_at, None);
    }

    #[test]
    fn failure_with_budget_left_backs_off_to_pre_claim_status() {
        let it = item(
            ItemKind::Recurring,
            Some(Recurrence::new(RecurrencePattern::Daily, 1)),
        );
        let tr = plan(
            &it,
            ItemStatus::Active,
            &RunResult::Failed("a: boom".into()),
            &RetryPolicy::fixed(3, 30),
            t0(),
        );
        assert_eq!(tr.status, ItemStatus::Active);
        assert_eq!(tr.attempt_count, 1);
        assert_eq!(tr.next_run_at, Some(t0() + Duration::seconds(30)));
        // anchor untouched so the next success re-arms on schedule
        assert_eq!(tr.occurrence_at, Some(t0()));
        assert_eq!(tr.last_error.as_deref(), Some("a: boom"));
    }

    #[test]
    fn failure_exhausting_budget_fails() {
        let mut it = item(ItemKind::OneShot, None);
        it.attempt_count = 2;
        let tr = plan(
            &it,
            ItemStatus::Pending,
            &RunResult::Failed("x".into()),
            &RetryPolicy::default(),
            t0(),
        );
        assert_eq!(tr.status, ItemStatus::Failed);
        assert_eq!(tr.attempt_count, 3);
        assert!(tr.next_run_at.is_some());
    }

    #[test]
    fn single_attempt_budget_fails_on_first_error() {
        let mut it = item(ItemKind::OneShot, None);
        it.max_attempts = 1;
        let tr = plan(
            &it,
            ItemStatus::Pending,
            &RunResult::Failed("x".into()),
            &RetryPolicy::default(),
            t0(),
        );
        assert_eq!(tr.status, ItemStatus::Failed);
        assert_eq!(tr.attempt_count, 1);
    }
}
