//! Aggregation of feature-request events into per-flush counters, plus the
//! bounded user-key set used to decide when a user needs an index event.

use std::collections::{BTreeMap, HashMap};

use crate::str::ArcStr;
use crate::Value;

use super::FeatureRequestEvent;

/// Counter identity: one counter per flag/variation/version combination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CounterKey {
    pub key: ArcStr,
    pub variation: Option<usize>,
    pub version: Option<u64>,
}

/// Counter state: how often the combination was served, with which value and
/// against which default.
#[derive(Debug, Clone)]
pub(crate) struct CounterValue {
    pub count: u64,
    pub value: Value,
    pub default: Value,
}

/// One flush window's worth of aggregated feature requests.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSummary {
    pub start_date: u64,
    pub end_date: u64,
    pub counters: HashMap<CounterKey, CounterValue>,
}

impl EventSummary {
    pub(crate) fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

/// Owned by the processor loop; single-threaded by construction.
#[derive(Debug, Default)]
pub(crate) struct EventSummarizer {
    summary: EventSummary,
}

impl EventSummarizer {
    pub(crate) fn new() -> Self {
        EventSummarizer::default()
    }

    /// Folds one feature-request event into the summary.
    pub(crate) fn summarize(&mut self, event: &FeatureRequestEvent) {
        let key = CounterKey {
            key: event.key.clone(),
            variation: event.variation,
            version: event.version,
        };
        self.summary
            .counters
            .entry(key)
            .and_modify(|counter| counter.count += 1)
            .or_insert_with(|| CounterValue {
                count: 1,
                value: event.value.clone(),
                default: event.default.clone(),
            });

        let timestamp = event.base.creation_date;
        if self.summary.start_date == 0 || timestamp < self.summary.start_date {
            self.summary.start_date = timestamp;
        }
        if timestamp > self.summary.end_date {
            self.summary.end_date = timestamp;
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.summary.is_empty()
    }

    /// Takes the accumulated summary, leaving an empty one for the next
    /// flush window.
    pub(crate) fn take(&mut self) -> EventSummary {
        std::mem::take(&mut self.summary)
    }
}

/// A capacity-bounded, insertion-ordered set of user keys with move-to-back
/// on re-access. The oldest key is evicted when the capacity is exceeded;
/// the whole set is purged on the configured interval.
#[derive(Debug)]
pub(crate) struct UserKeys {
    capacity: usize,
    next_seq: u64,
    by_key: HashMap<String, u64>,
    by_seq: BTreeMap<u64, String>,
}

impl UserKeys {
    pub(crate) fn new(capacity: usize) -> Self {
        UserKeys {
            capacity,
            next_seq: 0,
            by_key: HashMap::new(),
            by_seq: BTreeMap::new(),
        }
    }

    /// Records the user key. Returns whether it was already present; either
    /// way the key becomes the most recently seen.
    pub(crate) fn notice(&mut self, key: &str) -> bool {
        if self.capacity == 0 {
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let seen = match self.by_key.insert(key.to_owned(), seq) {
            Some(old_seq) => {
                self.by_seq.remove(&old_seq);
                true
            }
            None => false,
        };
        self.by_seq.insert(seq, key.to_owned());

        if self.by_key.len() > self.capacity {
            if let Some((_, oldest)) = self.by_seq.pop_first() {
                self.by_key.remove(&oldest);
            }
        }

        seen
    }

    /// Forgets every key.
    pub(crate) fn clear(&mut self) {
        self.by_key.clear();
        self.by_seq.clear();
    }
}
