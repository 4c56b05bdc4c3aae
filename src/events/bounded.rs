//! Bounded per-source containers: dedup-key sets and the flexible model's
//! attributed-trigger list.

use serde::{Deserialize, Serialize};

use super::traits::Timestamp;

/// Append-only set of dedup keys with a hard capacity. Keys are only removed
/// when the report that introduced them is evicted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundedDedupKeys {
    keys: Vec<u64>,
    capacity: usize,
}

impl BoundedDedupKeys {
    pub fn new(capacity: usize) -> Self {
        Self {
            keys: Vec::new(),
            capacity,
        }
    }

    pub fn contains(&self, key: u64) -> bool {
        self.keys.contains(&key)
    }

    /// Returns false if the key is already present or the set is full.
    pub fn insert(&mut self, key: u64) -> bool {
        if self.contains(key) || self.keys.len() >= self.capacity {
            return false;
        }
        self.keys.push(key);
        true
    }

    pub fn remove(&mut self, key: u64) -> bool {
        let before = self.keys.len();
        self.keys.retain(|k| *k != key);
        before != self.keys.len()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &u64> {
        self.keys.iter()
    }
}

/// A trigger that currently counts towards a flexible source's reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributedTrigger {
    pub trigger_id: String,
    pub trigger_data: u64,
    pub value: u64,
    pub priority: i64,
    pub trigger_time: Timestamp,
    pub dedup_key: Option<u64>,
    pub window_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The new trigger took the place of a lower-priority one.
    Replaced(AttributedTrigger),
    /// The list is full and no evictable entry has strictly lower priority.
    Rejected,
}

/// Ordered (by trigger time) list of attributed triggers, capped at the
/// source's max event-level reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributedTriggers {
    entries: Vec<AttributedTrigger>,
    capacity: usize,
}

impl AttributedTriggers {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    pub fn entries(&self) -> &[AttributedTrigger] {
        &self.entries
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

    /// Inserts `trigger`. When full, only entries in window `min_window` or
    /// later can be evicted: the lowest priority one, and among equal
    /// priorities the most recent, so the earlier trigger is retained.
    pub fn insert(&mut self, trigger: AttributedTrigger, min_window: usize) -> InsertOutcome {
        if self.entries.len() < self.capacity {
            self.push_ordered(trigger);
            return InsertOutcome::Inserted;
        }

        let victim = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, t)| t.window_index >= min_window)
            .min_by(|(_, a), (_, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.trigger_time.cmp(&a.trigger_time))
            })
            .map(|(i, t)| (i, t.priority));

        match victim {
            Some((index, priority)) if trigger.priority > priority => {
                let evicted = self.entries.remove(index);
                self.push_ordered(trigger);
                InsertOutcome::Replaced(evicted)
            }
            _ => InsertOutcome::Rejected,
        }
    }

    fn push_ordered(&mut self, trigger: AttributedTrigger) {
        let pos = self
            .entries
            .partition_point(|t| t.trigger_time <= trigger.trigger_time);
        self.entries.insert(pos, trigger);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attributed(id: &str, priority: i64, time: Timestamp, window: usize) -> AttributedTrigger {
        AttributedTrigger {
            trigger_id: id.to_string(),
            trigger_data: 1,
            value: 1,
            priority,
            trigger_time: time,
            dedup_key: None,
            window_index: window,
        }
    }

    #[test]
    fn test_dedup_keys_are_bounded() {
        let mut keys = BoundedDedupKeys::new(2);
        assert!(keys.insert(10));
        assert!(!keys.insert(10));
        assert!(keys.insert(11));
        assert!(!keys.insert(12));
        assert_eq!(keys.len(), 2);
        assert!(keys.remove(10));
        assert!(keys.insert(12));
    }

    #[test]
    fn test_eviction_prefers_lowest_priority() {
        let mut list = AttributedTriggers::new(2);
        assert_eq!(list.insert(attributed("a", 5, 10, 0), 0), InsertOutcome::Inserted);
        assert_eq!(list.insert(attributed("b", 1, 20, 0), 0), InsertOutcome::Inserted);

        // Equal priority never replaces.
        assert_eq!(list.insert(attributed("c", 1, 30, 0), 0), InsertOutcome::Rejected);

        match list.insert(attributed("d", 2, 40, 0), 0) {
            InsertOutcome::Replaced(evicted) => assert_eq!(evicted.trigger_id, "b"),
            other => panic!("unexpected outcome {other:?}"),
        }
        let ids: Vec<_> = list.entries().iter().map(|t| t.trigger_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "d"]);
    }

    #[test]
    fn test_tie_keeps_earlier_trigger() {
        let mut list = AttributedTriggers::new(2);
        list.insert(attributed("early", 1, 10, 0), 0);
        list.insert(attributed("late", 1, 20, 0), 0);
        match list.insert(attributed("new", 3, 30, 0), 0) {
            InsertOutcome::Replaced(evicted) => assert_eq!(evicted.trigger_id, "late"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_past_windows_are_not_evicted() {
        let mut list = AttributedTriggers::new(1);
        list.insert(attributed("past", 0, 10, 0), 0);
        assert_eq!(list.insert(attributed("now", 9, 20, 1), 1), InsertOutcome::Rejected);
    }
}
