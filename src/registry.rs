//! Process registry — authoritative table of the latest scan
//!
//! A rescan enumerates the process filesystem, derives CPU percent from
//! the change in cumulative CPU time since the previous scan, and swaps
//! the table wholesale. Readers always see a complete scan, never a
//! partially built one.

use crate::groups::GroupIndex;
use crate::probe::{ProbeError, ProcessProbe, ProcessSnapshot};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::debug;

/// A snapshot enriched with derived fields.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessRecord {
    #[serde(flatten)]
    pub snapshot: ProcessSnapshot,
    /// Short-window CPU utilization, normalized so that saturating every
    /// core reports 100.
    pub cpu_percent: f64,
    pub group_id: i32,
}

struct Inner {
    processes: HashMap<i32, ProcessRecord>,
    last_cpu_ns: HashMap<i32, u64>,
    last_scan: Option<Instant>,
}

pub struct Registry {
    probe: Arc<dyn ProcessProbe>,
    ncpu: u32,
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new(probe: Arc<dyn ProcessProbe>, ncpu: u32) -> Self {
        Self {
            probe,
            ncpu: ncpu.max(1),
            inner: RwLock::new(Inner {
                processes: HashMap::new(),
                last_cpu_ns: HashMap::new(),
                last_scan: None,
            }),
        }
    }

    pub fn detect_ncpu() -> u32 {
        std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1)
    }

    pub fn ncpu(&self) -> u32 {
        self.ncpu
    }

    /// Scan the process filesystem and replace the table.
    ///
    /// Individual processes that vanish or refuse access mid-scan are
    /// skipped; only a failure to enumerate PIDs at all is an error, and
    /// in that case the previous table is left untouched.
    pub async fn rescan(&self, groups: &GroupIndex) -> Result<usize> {
        let now = Instant::now();
        let (prev_cpu, last_scan) = {
            let inner = self.inner.read().await;
            (inner.last_cpu_ns.clone(), inner.last_scan)
        };
        // Floor of 1 ms keeps the division sane if two scans land
        // back to back.
        let delta_ns = last_scan
            .map(|t| now.duration_since(t).as_nanos() as u64)
            .unwrap_or(0)
            .max(1_000_000);

        let pids = self
            .probe
            .list_pids()
            .context("failed to enumerate process filesystem")?;
        let membership = groups.membership_snapshot().await;

        let mut processes = HashMap::with_capacity(pids.len());
        let mut next_cpu = HashMap::with_capacity(pids.len());
        for pid in pids {
            let snapshot = match self.probe.read_snapshot(pid) {
                Ok(s) => s,
                Err(ProbeError::NotFound) => continue,
                Err(e) => {
                    debug!("skipping pid {pid}: {e}");
                    continue;
                }
            };

            let cur = snapshot.cumulative_cpu_ns;
            // First sample of a PID reports zero; a counter running
            // backwards is treated as a reset.
            let cpu_percent = match prev_cpu.get(&pid) {
                Some(&prev) => {
                    let delta_cpu = cur.saturating_sub(prev);
                    delta_cpu as f64 / delta_ns as f64 * 100.0 / f64::from(self.ncpu)
                }
                None => 0.0,
            };
            next_cpu.insert(pid, cur);

            let group_id = membership.get(&pid).copied().unwrap_or(0);
            processes.insert(
                pid,
                ProcessRecord {
                    snapshot,
                    cpu_percent,
                    group_id,
                },
            );
        }

        let count = processes.len();
        let mut inner = self.inner.write().await;
        inner.processes = processes;
        // Replacing wholesale also prunes delta state for vanished PIDs.
        inner.last_cpu_ns = next_cpu;
        inner.last_scan = Some(now);
        Ok(count)
    }

    /// Self-contained copy of every record in the latest scan.
    pub async fn snapshot_all(&self) -> Vec<ProcessRecord> {
        self.inner.read().await.processes.values().cloned().collect()
    }

    pub async fn get(&self, pid: i32) -> Option<ProcessRecord> {
        self.inner.read().await.processes.get(&pid).cloned()
    }

    /// Delegate a scheduling change to the OS. Takes effect immediately;
    /// the table reflects it on the next scan.
    pub fn adjust_priority(&self, pid: i32, priority: i32, policy: i32) -> Result<(), ProbeError> {
        self.probe.adjust_priority(pid, priority, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;
    use std::sync::Mutex;

    /// Probe returning scripted snapshots, mutated between scans.
    struct FakeProbe {
        snapshots: Mutex<HashMap<i32, ProcessSnapshot>>,
    }

    impl FakeProbe {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                snapshots: Mutex::new(HashMap::new()),
            })
        }

        fn set(&self, pid: i32, cumulative_cpu_ns: u64) {
            self.snapshots.lock().unwrap().insert(
                pid,
                ProcessSnapshot {
                    pid,
                    parent_pid: 1,
                    name: format!("proc-{pid}"),
                    memory_bytes: 4096,
                    thread_count: 1,
                    priority: 0,
                    policy: 0,
                    state_code: 0,
                    cumulative_cpu_ns,
                    start_time_ms: 0,
                },
            );
        }

        fn kill(&self, pid: i32) {
            self.snapshots.lock().unwrap().remove(&pid);
        }
    }

    impl ProcessProbe for FakeProbe {
        fn list_pids(&self) -> Result<Vec<i32>, ProbeError> {
            Ok(self.snapshots.lock().unwrap().keys().copied().collect())
        }

        fn read_snapshot(&self, pid: i32) -> Result<ProcessSnapshot, ProbeError> {
            self.snapshots
                .lock()
                .unwrap()
                .get(&pid)
                .cloned()
                .ok_or(ProbeError::NotFound)
        }

        fn send_signal(&self, pid: i32, _signal: Option<Signal>) -> Result<(), ProbeError> {
            if self.snapshots.lock().unwrap().contains_key(&pid) {
                Ok(())
            } else {
                Err(ProbeError::NotFound)
            }
        }

        fn adjust_priority(&self, _: i32, _: i32, _: i32) -> Result<(), ProbeError> {
            Ok(())
        }
    }

    fn registry_with(probe: Arc<FakeProbe>, ncpu: u32) -> (Registry, GroupIndex) {
        let groups = GroupIndex::new(probe.clone());
        (Registry::new(probe, ncpu), groups)
    }

    #[tokio::test]
    async fn first_sample_reports_zero_cpu() {
        let probe = FakeProbe::new();
        probe.set(10, 5_000_000_000);
        let (registry, groups) = registry_with(probe, 4);

        assert_eq!(registry.rescan(&groups).await.unwrap(), 1);
        let record = registry.get(10).await.unwrap();
        assert_eq!(record.cpu_percent, 0.0);
        assert_eq!(record.snapshot.name, "proc-10");
    }

    #[tokio::test]
    async fn cpu_percent_from_consecutive_scans() {
        let probe = FakeProbe::new();
        probe.set(10, 0);
        let (registry, groups) = registry_with(probe.clone(), 4);

        registry.rescan(&groups).await.unwrap();
        // Burn 40 ms of CPU over a 10 ms wall interval on 4 CPUs: the
        // full-machine load reports 100 per-core-normalized.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        probe.set(10, 40_000_000);
        registry.rescan(&groups).await.unwrap();

        let record = registry.get(10).await.unwrap();
        assert!(record.cpu_percent > 0.0);
        // Allow jitter: wall delta can only be >= 10 ms.
        assert!(record.cpu_percent <= 100.0 + 1e-9);
    }

    #[tokio::test]
    async fn cpu_percent_bounded_by_core_count() {
        let probe = FakeProbe::new();
        probe.set(10, 0);
        let (registry, groups) = registry_with(probe.clone(), 2);

        registry.rescan(&groups).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        // An absurd delta cannot push the figure past 100 * ncpu by much:
        // 40 ms of CPU in >= 20 ms wall on 2 cores is at most 100.
        probe.set(10, 40_000_000);
        registry.rescan(&groups).await.unwrap();

        let record = registry.get(10).await.unwrap();
        assert!(record.cpu_percent >= 0.0);
        assert!(record.cpu_percent <= 100.0 * 2.0);
    }

    #[tokio::test]
    async fn counter_reset_clamps_to_zero() {
        let probe = FakeProbe::new();
        probe.set(10, 9_000_000_000);
        let (registry, groups) = registry_with(probe.clone(), 1);

        registry.rescan(&groups).await.unwrap();
        probe.set(10, 1_000_000);
        registry.rescan(&groups).await.unwrap();

        assert_eq!(registry.get(10).await.unwrap().cpu_percent, 0.0);
    }

    #[tokio::test]
    async fn vanished_pid_is_pruned_and_forgotten() {
        let probe = FakeProbe::new();
        probe.set(10, 1_000_000);
        probe.set(11, 1_000_000);
        let (registry, groups) = registry_with(probe.clone(), 1);

        assert_eq!(registry.rescan(&groups).await.unwrap(), 2);
        probe.kill(10);
        assert_eq!(registry.rescan(&groups).await.unwrap(), 1);
        assert!(registry.get(10).await.is_none());
        assert!(registry.get(11).await.is_some());

        // If the PID returns, its delta state is gone: first sample again.
        probe.set(10, 500_000_000);
        registry.rescan(&groups).await.unwrap();
        assert_eq!(registry.get(10).await.unwrap().cpu_percent, 0.0);
    }

    #[tokio::test]
    async fn scan_picks_up_group_membership() {
        let probe = FakeProbe::new();
        probe.set(10, 0);
        let (registry, groups) = registry_with(probe.clone(), 1);

        let g = groups.create_group("workers", 0, "").await;
        assert!(groups.add(10, g).await);

        registry.rescan(&groups).await.unwrap();
        assert_eq!(registry.get(10).await.unwrap().group_id, g);

        groups.delete_group(g).await;
        registry.rescan(&groups).await.unwrap();
        assert_eq!(registry.get(10).await.unwrap().group_id, 0);
    }

    #[tokio::test]
    async fn snapshot_all_is_detached() {
        let probe = FakeProbe::new();
        probe.set(10, 0);
        probe.set(11, 0);
        let (registry, groups) = registry_with(probe.clone(), 1);
        registry.rescan(&groups).await.unwrap();

        let records = registry.snapshot_all().await;
        assert_eq!(records.len(), 2);

        probe.kill(10);
        probe.kill(11);
        registry.rescan(&groups).await.unwrap();
        // The copy is unaffected by later scans.
        assert_eq!(records.len(), 2);
        assert!(registry.snapshot_all().await.is_empty());
    }
}
