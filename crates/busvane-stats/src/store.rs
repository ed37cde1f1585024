use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::debug;

/// Counters for one tracked topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TopicStats {
    /// Messages seen since the topic was first tracked; never reset.
    pub total_messages: u64,
    /// Messages seen since the last rate tick.
    pub window_messages: u64,
    /// Payload bytes seen since the last rate tick.
    pub window_bytes: u64,
}

impl TopicStats {
    fn record(&mut self, byte_size: u64) {
        self.total_messages = self.total_messages.saturating_add(1);
        self.window_messages = self.window_messages.saturating_add(1);
        self.window_bytes = self.window_bytes.saturating_add(byte_size);
    }

    fn reset_window(&mut self) {
        self.window_messages = 0;
        self.window_bytes = 0;
    }
}

/// Copied-out view of the store for presenters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreSnapshot {
    pub topics: BTreeMap<String, TopicStats>,
    /// Messages dropped because their topic was no longer tracked.
    pub orphan_messages: u64,
}

#[derive(Default)]
struct StoreInner {
    topics: HashMap<String, TopicStats>,
    orphan_messages: u64,
}

/// Per-topic counters behind a single short-lived mutex. Message handlers
/// call [`record`](Self::record) concurrently from delivery tasks; the
/// reconcile path owns membership. The lock is never held across a bus
/// call and a poisoned lock degrades to dropped updates.
#[derive(Default)]
pub struct StatsStore {
    inner: Mutex<StoreInner>,
}

impl StatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `topic` with zeroed counters. No-op when already
    /// tracked.
    pub fn create(&self, topic: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.topics.entry(topic.to_string()).or_default();
        }
    }

    /// Stop tracking `topic`. No-op when absent.
    pub fn remove(&self, topic: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.topics.remove(topic);
        }
    }

    /// Account one delivered message. Deliveries race with unsubscribe, so
    /// a record for an untracked topic is dropped and counted rather than
    /// treated as an error.
    pub fn record(&self, topic: &str, byte_size: u64) {
        let mut orphaned = false;
        if let Ok(mut inner) = self.inner.lock() {
            match inner.topics.get_mut(topic) {
                Some(stats) => stats.record(byte_size),
                None => {
                    inner.orphan_messages = inner.orphan_messages.saturating_add(1);
                    orphaned = true;
                }
            }
        }
        if orphaned {
            debug!(topic = %topic, byte_size, "dropped message for untracked topic");
        }
    }

    /// Zero every topic's window counters; totals are untouched. Called
    /// once per rate tick after the windows have been read.
    pub fn reset_windows(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            for stats in inner.topics.values_mut() {
                stats.reset_window();
            }
        }
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.inner
            .lock()
            .map(|inner| StoreSnapshot {
                topics: inner
                    .topics
                    .iter()
                    .map(|(name, stats)| (name.clone(), *stats))
                    .collect(),
                orphan_messages: inner.orphan_messages,
            })
            .unwrap_or_default()
    }

    /// Currently tracked topic names, sorted.
    pub fn topics(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|inner| {
                let mut names: Vec<String> = inner.topics.keys().cloned().collect();
                names.sort();
                names
            })
            .unwrap_or_default()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.topics.contains_key(topic))
            .unwrap_or(false)
    }

    pub fn get(&self, topic: &str) -> Option<TopicStats> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.topics.get(topic).copied())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.topics.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry (shutdown path).
    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.topics.clear();
        }
    }

    pub fn orphan_messages(&self) -> u64 {
        self.inner
            .lock()
            .map(|inner| inner.orphan_messages)
            .unwrap_or(0)
    }
}
