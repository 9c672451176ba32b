//! Bounded ring of rule-execution records.
//!
//! Sixteen entries by default; the oldest record is overwritten once the
//! ring is full. Read-out is newest-first. Mutation happens under the
//! engine mutex, so the ring itself carries no lock.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default ring capacity.
pub const DEFAULT_HISTORY_SIZE: usize = 16;

/// Aggregate outcome of one rule execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Every action succeeded.
    Success,
    /// Some actions failed, some succeeded.
    Partial,
    /// Every action failed.
    Failed,
    /// Nothing ran (all actions condition-skipped).
    Skipped,
}

/// What initiated the execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Condition,
    Manual,
    Scheduled,
}

/// One execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionRecord {
    pub rule_id: String,
    pub ts_ms: u64,
    pub status: ExecutionStatus,
    pub trigger: TriggerSource,
    pub message: String,
    pub action_count: u32,
    pub failed_count: u32,
}

/// Fixed-capacity execution history.
///
/// `push` hands back a token so a record can later be amended in place
/// when a queued action finishes after the trigger returned. A token
/// whose record was already overwritten by ring wraparound is simply
/// stale; `update` reports that instead of touching anything.
pub struct HistoryRing {
    entries: Vec<(u64, ExecutionRecord)>,
    /// Next write position once the ring is full.
    head: usize,
    capacity: usize,
    next_token: u64,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity.max(1)),
            head: 0,
            capacity: capacity.max(1),
            next_token: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends a record, overwriting the oldest once full. Returns a
    /// token for [`HistoryRing::update`].
    pub fn push(&mut self, record: ExecutionRecord) -> u64 {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        if self.entries.len() < self.capacity {
            self.entries.push((token, record));
        } else {
            self.entries[self.head] = (token, record);
        }
        self.head = (self.head + 1) % self.capacity;
        token
    }

    /// Amends the record behind `token` in place. Returns false when the
    /// record has already been overwritten.
    pub fn update(&mut self, token: u64, amend: impl FnOnce(&mut ExecutionRecord)) -> bool {
        for (t, record) in &mut self.entries {
            if *t == token {
                amend(record);
                return true;
            }
        }
        false
    }

    /// All records, newest first.
    pub fn newest_first(&self) -> Vec<ExecutionRecord> {
        let len = self.entries.len();
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            // head is the next write slot, so head-1 is the newest.
            let idx = (self.head + len - 1 - i) % len;
            out.push(self.entries[idx].1.clone());
        }
        out
    }

    /// Filtered scan by rule id, newest first, bounded by `max`.
    pub fn by_rule(&self, rule_id: &str, max: usize) -> Vec<ExecutionRecord> {
        self.newest_first()
            .into_iter()
            .filter(|r| r.rule_id == rule_id)
            .take(max)
            .collect()
    }
}

impl Default for HistoryRing {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(rule_id: &str, ts_ms: u64) -> ExecutionRecord {
        ExecutionRecord {
            rule_id: rule_id.to_string(),
            ts_ms,
            status: ExecutionStatus::Success,
            trigger: TriggerSource::Condition,
            message: String::new(),
            action_count: 1,
            failed_count: 0,
        }
    }

    #[test]
    fn ring_caps_at_sixteen_and_keeps_newest() {
        let mut ring = HistoryRing::default();
        for i in 0..40u64 {
            ring.push(record("r", i));
        }
        assert_eq!(ring.len(), 16);
        let records = ring.newest_first();
        let stamps: Vec<u64> = records.iter().map(|r| r.ts_ms).collect();
        let expected: Vec<u64> = (24..40).rev().collect();
        assert_eq!(stamps, expected);
    }

    #[test]
    fn newest_first_before_wraparound() {
        let mut ring = HistoryRing::default();
        for i in 0..3u64 {
            ring.push(record("r", i));
        }
        let stamps: Vec<u64> = ring.newest_first().iter().map(|r| r.ts_ms).collect();
        assert_eq!(stamps, vec![2, 1, 0]);
    }

    #[test]
    fn by_rule_filters_and_bounds() {
        let mut ring = HistoryRing::default();
        for i in 0..6u64 {
            ring.push(record(if i % 2 == 0 { "even" } else { "odd" }, i));
        }
        let evens = ring.by_rule("even", 2);
        assert_eq!(evens.len(), 2);
        assert_eq!(evens[0].ts_ms, 4);
        assert_eq!(evens[1].ts_ms, 2);
    }

    #[test]
    fn zero_capacity_clamps_to_one() {
        let mut ring = HistoryRing::new(0);
        ring.push(record("r", 1));
        ring.push(record("r", 2));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.newest_first()[0].ts_ms, 2);
    }

    #[test]
    fn update_amends_live_records_only() {
        let mut ring = HistoryRing::default();
        let token = ring.push(record("r", 1));
        assert!(ring.update(token, |r| {
            r.status = ExecutionStatus::Failed;
            r.failed_count = 1;
        }));
        let latest = &ring.newest_first()[0];
        assert_eq!(latest.status, ExecutionStatus::Failed);
        assert_eq!(latest.failed_count, 1);

        // Push past capacity so the tokened record is overwritten.
        for i in 0..16u64 {
            ring.push(record("filler", i));
        }
        assert!(!ring.update(token, |r| r.failed_count = 99));
    }
}
