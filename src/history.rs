//! Per-process history — bounded FIFO of resource samples
//!
//! Each tracked PID keeps at most `max_entries` samples; at most
//! `max_tracked` PIDs are tracked at once, and new PIDs are ignored while
//! the table is full. Entries are wall-clock stamped and returned
//! oldest-first.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub const DEFAULT_MAX_ENTRIES: usize = 60;
pub const DEFAULT_MAX_TRACKED: usize = 100;

/// One resource sample, as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistoryEntry {
    #[serde(rename = "cpu_usage")]
    pub cpu_percent: f64,
    #[serde(rename = "memory_usage")]
    pub memory_bytes: u64,
    pub timestamp_ms: i64,
}

pub struct HistoryRing {
    max_entries: usize,
    max_tracked: usize,
    inner: Mutex<HashMap<i32, VecDeque<HistoryEntry>>>,
}

impl HistoryRing {
    pub fn new(max_entries: usize, max_tracked: usize) -> Self {
        Self {
            max_entries,
            max_tracked,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Append a sample for `pid`, stamped with the current wall clock.
    /// A no-op if the PID is new and the tracked-process table is full.
    pub fn push(&self, pid: i32, cpu_percent: f64, memory_bytes: u64) {
        self.push_at(
            pid,
            cpu_percent,
            memory_bytes,
            chrono::Utc::now().timestamp_millis(),
        );
    }

    fn push_at(&self, pid: i32, cpu_percent: f64, memory_bytes: u64, timestamp_ms: i64) {
        let mut inner = self.inner.lock().expect("history lock poisoned");
        if !inner.contains_key(&pid) && inner.len() >= self.max_tracked {
            return;
        }
        let ring = inner.entry(pid).or_default();
        ring.push_back(HistoryEntry {
            cpu_percent,
            memory_bytes,
            timestamp_ms,
        });
        if ring.len() > self.max_entries {
            ring.pop_front();
        }
    }

    /// Samples for one PID, oldest first. Empty if the PID is untracked.
    pub fn get(&self, pid: i32) -> Vec<HistoryEntry> {
        let inner = self.inner.lock().expect("history lock poisoned");
        inner
            .get(&pid)
            .map(|ring| ring.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn get_all(&self) -> HashMap<i32, Vec<HistoryEntry>> {
        let inner = self.inner.lock().expect("history lock poisoned");
        inner
            .iter()
            .map(|(pid, ring)| (*pid, ring.iter().copied().collect()))
            .collect()
    }

    pub fn clear(&self, pid: i32) {
        self.inner
            .lock()
            .expect("history lock poisoned")
            .remove(&pid);
    }

    pub fn clear_all(&self) {
        self.inner.lock().expect("history lock poisoned").clear();
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.lock().expect("history lock poisoned").len()
    }
}

impl Default for HistoryRing {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_MAX_TRACKED)
    }
}
