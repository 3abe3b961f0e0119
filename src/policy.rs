//! Retry, postponement and expiration policy.
//!
//! Every outcome a processor (or the dispatcher) can produce is applied to a
//! [`WorkItem`] here, as a pure function of the item, the type's settings and
//! the current time. Stores only persist the result.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::model::{FailureType, Status, WorkItem};

/// Per-work-type scheduling settings. Every field has a default so a TOML
/// table may name only what it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeSettings {
    /// Failed attempts allowed before the item goes terminal.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further failure.
    pub failure_delay_secs: u64,
    /// Upper bound for the retry delay.
    pub max_failure_delay_secs: u64,
    /// Delay applied by a plain `postpone()`.
    pub postpone_delay_secs: u64,
}

impl Default for TypeSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            failure_delay_secs: 10,
            max_failure_delay_secs: 600,
            postpone_delay_secs: 60,
        }
    }
}

impl TypeSettings {
    pub fn postpone_delay(&self) -> Duration {
        Duration::from_secs(self.postpone_delay_secs)
    }

    /// Retry budget for `item`, honoring its per-item override. Never zero.
    pub fn retry_budget(&self, item: &WorkItem) -> u32 {
        item.max_retries.unwrap_or(self.max_retries).max(1)
    }

    /// Delay before retry number `attempt` (1-based): exponential, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = Duration::from_secs(self.failure_delay_secs);
        let cap = Duration::from_secs(self.max_failure_delay_secs);
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        base.saturating_mul(factor).min(cap)
    }
}

/// What a failure did to an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to pending; next attempt at the given time.
    Retry { next_attempt_at: DateTime<Utc> },
    /// Terminal `Failed`.
    Failed,
}

/// Apply a failed attempt: bump the retry count, then either reschedule
/// with backoff or fail terminally.
pub fn apply_failure(
    item: &mut WorkItem,
    settings: &TypeSettings,
    reason: &str,
    failure_type: FailureType,
    now: DateTime<Utc>,
) -> FailureOutcome {
    item.retry_count = item.retry_count.saturating_add(1);
    item.failure_description = Some(reason.to_string());
    item.progress.status_details = reason.to_string();
    // A failed attempt leaves nothing half-done that would forbid a cancel.
    item.progress.is_cancelable = true;
    item.claimed_by = None;
    item.updated_at = now;

    if failure_type == FailureType::Fatal || item.retry_count >= settings.retry_budget(item) {
        item.status = Status::Failed;
        item.completed_at = Some(now);
        return FailureOutcome::Failed;
    }

    reschedule(item, to_delta(settings.backoff(item.retry_count)), now);
    item.status = Status::Pending;
    FailureOutcome::Retry {
        next_attempt_at: item.scheduled_time,
    }
}

/// Return an in-progress item to pending, `delay` after the later of its
/// current schedule and `now`. Not a failure: the retry count is untouched.
pub fn apply_postpone(item: &mut WorkItem, delay: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    reschedule(item, to_delta(delay), now);
    item.status = Status::Pending;
    item.claimed_by = None;
    item.updated_at = now;
    item.scheduled_time
}

pub fn apply_complete(item: &mut WorkItem, now: DateTime<Utc>) {
    item.status = Status::Complete;
    item.progress.status_details.clear();
    item.claimed_by = None;
    item.completed_at = Some(now);
    item.updated_at = now;
}

pub fn apply_cancel(item: &mut WorkItem, now: DateTime<Utc>) {
    item.status = Status::Canceled;
    item.claimed_by = None;
    item.completed_at = Some(now);
    item.updated_at = now;
}

/// Move `scheduled_time` forward by `delay`. Never moves it backwards. An
/// expiration that would fall at or before the new schedule is pushed past
/// it so the rescheduled item remains claimable.
fn reschedule(item: &mut WorkItem, delay: TimeDelta, now: DateTime<Utc>) {
    let base = item.scheduled_time.max(now);
    item.scheduled_time = saturating_add(base, delay);
    if let Some(exp) = item.expiration_time {
        if exp <= item.scheduled_time {
            item.expiration_time = Some(saturating_add(
                item.scheduled_time,
                delay.max(TimeDelta::seconds(1)),
            ));
        }
    }
}

fn saturating_add(at: DateTime<Utc>, delta: TimeDelta) -> DateTime<Utc> {
    at.checked_add_signed(delta)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewWorkItem;

    fn in_progress(now: DateTime<Utc>) -> WorkItem {
        let mut item = NewWorkItem::new("DeleteStudy").into_item(now);
        item.status = Status::InProgress;
        item.claimed_by = Some("w1".into());
        item
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let s = TypeSettings {
            failure_delay_secs: 10,
            max_failure_delay_secs: 35,
            ..TypeSettings::default()
        };
        assert_eq!(s.backoff(1), Duration::from_secs(10));
        assert_eq!(s.backoff(2), Duration::from_secs(20));
        assert_eq!(s.backoff(3), Duration::from_secs(35));
        assert_eq!(s.backoff(200), Duration::from_secs(35));
    }

    #[test]
    fn failure_retries_until_budget_then_fails() {
        let now = Utc::now();
        let settings = TypeSettings::default();
        let mut item = in_progress(now);

        for attempt in 1..3 {
            let outcome = apply_failure(&mut item, &settings, "boom", FailureType::NonFatal, now);
            assert!(matches!(outcome, FailureOutcome::Retry { .. }));
            assert_eq!(item.status, Status::Pending);
            assert_eq!(item.retry_count, attempt);
            assert!(item.claimed_by.is_none());
            item.status = Status::InProgress;
        }

        let outcome = apply_failure(&mut item, &settings, "boom", FailureType::NonFatal, now);
        assert_eq!(outcome, FailureOutcome::Failed);
        assert_eq!(item.status, Status::Failed);
        assert_eq!(item.retry_count, 3);
        assert_eq!(item.failure_description.as_deref(), Some("boom"));
    }

    #[test]
    fn fatal_failure_skips_retries() {
        let now = Utc::now();
        let mut item = in_progress(now);
        let outcome = apply_failure(
            &mut item,
            &TypeSettings::default(),
            "disk full",
            FailureType::Fatal,
            now,
        );
        assert_eq!(outcome, FailureOutcome::Failed);
        assert_eq!(item.retry_count, 1);
    }

    #[test]
    fn failure_resets_cancelable_flag() {
        let now = Utc::now();
        let mut item = in_progress(now);
        item.progress.is_cancelable = false;
        apply_failure(&mut item, &TypeSettings::default(), "x", FailureType::NonFatal, now);
        assert!(item.progress.is_cancelable);
    }

    #[test]
    fn postpone_advances_schedule_and_keeps_retry_count() {
        let now = Utc::now();
        let mut item = in_progress(now);
        item.retry_count = 1;
        let until = apply_postpone(&mut item, Duration::from_secs(60), now);
        assert_eq!(until, now + TimeDelta::seconds(60));
        assert_eq!(item.status, Status::Pending);
        assert_eq!(item.retry_count, 1);
    }

    #[test]
    fn reschedule_never_moves_schedule_backwards() {
        let now = Utc::now();
        let mut item = in_progress(now);
        item.scheduled_time = now + TimeDelta::hours(1);
        apply_postpone(&mut item, Duration::from_secs(5), now);
        assert_eq!(item.scheduled_time, now + TimeDelta::hours(1) + TimeDelta::seconds(5));
    }

    #[test]
    fn reschedule_extends_expiration_past_new_schedule() {
        let now = Utc::now();
        let mut item = in_progress(now);
        item.expiration_time = Some(now + TimeDelta::seconds(30));
        apply_postpone(&mut item, Duration::from_secs(60), now);
        let exp = item.expiration_time.unwrap();
        assert!(exp > item.scheduled_time);
        assert!(item.is_claimable_at(item.scheduled_time));
    }

    #[test]
    fn zero_budget_still_allows_one_attempt() {
        let now = Utc::now();
        let mut item = in_progress(now);
        item.max_retries = Some(0);
        let outcome = apply_failure(&mut item, &TypeSettings::default(), "x", FailureType::NonFatal, now);
        assert_eq!(outcome, FailureOutcome::Failed);
        assert_eq!(item.retry_count, 1);
    }
}
