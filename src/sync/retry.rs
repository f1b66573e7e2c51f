use std::{collections::HashMap, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use super::envelope::SyncEnvelope;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
    /// Adds up to 10% random spread on top of each delay.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(30),
            max_attempts: 5,
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (1-based): base doubling, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    fn next_delay(&self, retry: u32) -> Duration {
        let delay = self.delay_for(retry);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_millis() as u64 / 10;
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

/// A write whose immediate delivery has not been acknowledged yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingRecord {
    pub operation_id: Uuid,
    /// Entity the write is about; a newer write for the same item replaces it.
    pub item_key: String,
    pub envelope: SyncEnvelope,
    /// Retries already made after the first failed attempt.
    pub attempts: u32,
    /// Out of retries. Delivery now rests on the queued transfer.
    pub exhausted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled(Duration),
    Exhausted,
}

#[derive(Debug)]
struct Entry {
    record: PendingRecord,
    next_attempt: Instant,
}

/// Pending immediate sends keyed by item. Driven by the coordinator's single
/// scheduler loop, so there is never more than one timer per item.
#[derive(Debug)]
pub struct RetryQueue {
    policy: BackoffPolicy,
    entries: HashMap<String, Entry>,
}

impl RetryQueue {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Starts tracking a write whose first attempt failed.
    pub fn track(&mut self, item_key: &str, envelope: SyncEnvelope, now: Instant) -> PendingRecord {
        let record = PendingRecord {
            operation_id: envelope.operation_id,
            item_key: item_key.to_string(),
            envelope,
            attempts: 0,
            exhausted: self.policy.max_attempts == 0,
        };
        let next_attempt = now + self.policy.next_delay(1);
        self.entries.insert(
            item_key.to_string(),
            Entry {
                record: record.clone(),
                next_attempt,
            },
        );
        record
    }

    /// Reloads a persisted record with a fresh attempt budget, due now.
    pub fn restore(&mut self, mut record: PendingRecord, now: Instant) {
        record.attempts = 0;
        record.exhausted = false;
        self.entries.insert(
            record.item_key.clone(),
            Entry {
                record,
                next_attempt: now,
            },
        );
    }

    pub fn due(&self, now: Instant) -> Vec<PendingRecord> {
        let mut due: Vec<_> = self
            .entries
            .values()
            .filter(|entry| !entry.record.exhausted && entry.next_attempt <= now)
            .map(|entry| entry.record.clone())
            .collect();
        due.sort_by(|a, b| a.envelope.timestamp.total_cmp(&b.envelope.timestamp));
        due
    }

    /// Books a failed retry. Returns `None` when the operation was replaced
    /// or completed in the meantime.
    pub fn record_failure(
        &mut self,
        item_key: &str,
        operation_id: Uuid,
        now: Instant,
    ) -> Option<(RetryDecision, PendingRecord)> {
        let entry = self
            .entries
            .get_mut(item_key)
            .filter(|entry| entry.record.operation_id == operation_id)?;

        entry.record.attempts += 1;
        let decision = if entry.record.attempts >= self.policy.max_attempts {
            entry.record.exhausted = true;
            RetryDecision::Exhausted
        } else {
            let delay = self.policy.next_delay(entry.record.attempts + 1);
            entry.next_attempt = now + delay;
            RetryDecision::Scheduled(delay)
        };
        Some((decision, entry.record.clone()))
    }

    /// Drops the entry if it still belongs to `operation_id`.
    pub fn complete(&mut self, item_key: &str, operation_id: Uuid) -> Option<PendingRecord> {
        let matches = self
            .entries
            .get(item_key)
            .is_some_and(|entry| entry.record.operation_id == operation_id);
        if matches {
            self.entries.remove(item_key).map(|entry| entry.record)
        } else {
            None
        }
    }

    pub fn clear_item(&mut self, item_key: &str) -> Option<PendingRecord> {
        self.entries.remove(item_key).map(|entry| entry.record)
    }

    /// Makes everything eligible again with a fresh attempt budget.
    pub fn rearm_all(&mut self, now: Instant) -> Vec<PendingRecord> {
        self.entries
            .values_mut()
            .map(|entry| {
                entry.record.attempts = 0;
                entry.record.exhausted = false;
                entry.next_attempt = now;
                entry.record.clone()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn exhausted_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.record.exhausted)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::envelope::SyncAction;

    fn envelope() -> SyncEnvelope {
        SyncEnvelope::new(SyncAction::WorkoutResults, b"{}".to_vec())
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (1..=6).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30]);
        assert_eq!(policy.delay_for(200), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy = BackoffPolicy {
            jitter: true,
            ..BackoffPolicy::default()
        };
        for _ in 0..50 {
            let delay = policy.next_delay(3);
            assert!(delay >= Duration::from_secs(8));
            assert!(delay <= Duration::from_millis(8_800));
        }
    }

    #[test]
    fn retries_run_out_after_max_attempts() {
        let mut queue = RetryQueue::new(BackoffPolicy::default());
        let now = Instant::now();
        let record = queue.track("result:1", envelope(), now);

        assert!(queue.due(now).is_empty());
        assert_eq!(queue.due(now + Duration::from_secs(2)).len(), 1);

        let mut decisions = Vec::new();
        for _ in 0..5 {
            let (decision, _) = queue
                .record_failure("result:1", record.operation_id, now)
                .unwrap();
            decisions.push(decision);
        }
        assert_eq!(
            decisions,
            vec![
                RetryDecision::Scheduled(Duration::from_secs(4)),
                RetryDecision::Scheduled(Duration::from_secs(8)),
                RetryDecision::Scheduled(Duration::from_secs(16)),
                RetryDecision::Scheduled(Duration::from_secs(30)),
                RetryDecision::Exhausted,
            ]
        );
        // Still pending, not lost.
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.exhausted_count(), 1);
        assert!(queue.due(now + Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn newer_write_replaces_pending_one() {
        let mut queue = RetryQueue::new(BackoffPolicy::default());
        let now = Instant::now();
        let old = queue.track("program:a", envelope(), now);
        let new = queue.track("program:a", envelope(), now);

        assert_eq!(queue.len(), 1);
        assert!(queue.record_failure("program:a", old.operation_id, now).is_none());
        assert!(queue.complete("program:a", old.operation_id).is_none());
        assert!(queue.complete("program:a", new.operation_id).is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn rearm_and_restore_make_items_due_now() {
        let mut queue = RetryQueue::new(BackoffPolicy {
            max_attempts: 1,
            ..BackoffPolicy::default()
        });
        let now = Instant::now();
        let record = queue.track("result:1", envelope(), now);
        queue.record_failure("result:1", record.operation_id, now);
        assert_eq!(queue.exhausted_count(), 1);

        let rearmed = queue.rearm_all(now);
        assert_eq!(rearmed.len(), 1);
        assert_eq!(rearmed[0].attempts, 0);
        assert_eq!(queue.due(now).len(), 1);

        let mut exhausted = rearmed[0].clone();
        exhausted.attempts = 1;
        exhausted.exhausted = true;
        let mut restored = RetryQueue::new(BackoffPolicy::default());
        restored.restore(exhausted, now);
        let due = restored.due(now);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempts, 0);
    }
}
