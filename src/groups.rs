//! Process groups — named sets of PIDs with aggregated statistics
//!
//! Group IDs are assigned from 1; 0 is reserved for "unassigned". A PID
//! belongs to at most one group, and adding it elsewhere moves it.

use crate::probe::ProcessProbe;
use crate::registry::ProcessRecord;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// The ID meaning "not in any group".
pub const UNASSIGNED: i32 = 0;

#[derive(Debug, Clone)]
pub struct Group {
    pub id: i32,
    pub name: String,
    pub priority: i32,
    pub description: String,
    pub members: BTreeSet<i32>,
    pub total_cpu: f64,
    pub total_memory: u64,
}

struct Inner {
    next_id: i32,
    groups: BTreeMap<i32, Group>,
    /// pid -> group id, only for assigned PIDs.
    membership: HashMap<i32, i32>,
}

pub struct GroupIndex {
    probe: Arc<dyn ProcessProbe>,
    inner: RwLock<Inner>,
}

impl GroupIndex {
    pub fn new(probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            probe,
            inner: RwLock::new(Inner {
                next_id: 1,
                groups: BTreeMap::new(),
                membership: HashMap::new(),
            }),
        }
    }

    /// Create an empty group and return its ID.
    pub async fn create_group(&self, name: &str, priority: i32, description: &str) -> i32 {
        let mut inner = self.inner.write().await;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.groups.insert(
            id,
            Group {
                id,
                name: name.to_string(),
                priority,
                description: description.to_string(),
                members: BTreeSet::new(),
                total_cpu: 0.0,
                total_memory: 0,
            },
        );
        debug!("created group {id} ({name})");
        id
    }

    /// Delete a group, leaving its members unassigned.
    pub async fn delete_group(&self, id: i32) -> bool {
        let mut inner = self.inner.write().await;
        let Some(group) = inner.groups.remove(&id) else {
            return false;
        };
        for pid in &group.members {
            inner.membership.remove(pid);
        }
        debug!("deleted group {id} ({})", group.name);
        true
    }

    pub async fn rename_group(&self, id: i32, name: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.groups.get_mut(&id) {
            Some(group) => {
                group.name = name.to_string();
                true
            }
            None => false,
        }
    }

    /// Assign a PID to a group, moving it out of any previous group.
    /// Rejects unknown groups and PIDs that do not currently exist.
    pub async fn add(&self, pid: i32, group_id: i32) -> bool {
        if !self.probe.exists(pid) {
            return false;
        }
        let mut inner = self.inner.write().await;
        if !inner.groups.contains_key(&group_id) {
            return false;
        }
        if let Some(old) = inner.membership.insert(pid, group_id) {
            if old != group_id {
                if let Some(old_group) = inner.groups.get_mut(&old) {
                    old_group.members.remove(&pid);
                }
            }
        }
        inner
            .groups
            .get_mut(&group_id)
            .map(|g| g.members.insert(pid))
            .is_some()
    }

    pub async fn remove(&self, pid: i32, group_id: i32) -> bool {
        let mut inner = self.inner.write().await;
        let Some(group) = inner.groups.get_mut(&group_id) else {
            return false;
        };
        if !group.members.remove(&pid) {
            return false;
        }
        inner.membership.remove(&pid);
        true
    }

    /// The group a PID belongs to, or `UNASSIGNED`.
    pub async fn group_of(&self, pid: i32) -> i32 {
        let inner = self.inner.read().await;
        inner.membership.get(&pid).copied().unwrap_or(UNASSIGNED)
    }

    /// Members of a group; `None` if the group does not exist.
    pub async fn members(&self, id: i32) -> Option<BTreeSet<i32>> {
        let inner = self.inner.read().await;
        inner.groups.get(&id).map(|g| g.members.clone())
    }

    /// Copy of the full pid -> group mapping, for the registry's scan.
    pub async fn membership_snapshot(&self) -> HashMap<i32, i32> {
        self.inner.read().await.membership.clone()
    }

    /// All groups, ID order.
    pub async fn list(&self) -> Vec<Group> {
        self.inner.read().await.groups.values().cloned().collect()
    }

    /// Recompute aggregate statistics from a registry snapshot.
    ///
    /// Members missing from the snapshot have exited and are dropped from
    /// their group.
    pub async fn recompute_stats(&self, records: &[ProcessRecord]) {
        let by_pid: HashMap<i32, &ProcessRecord> =
            records.iter().map(|r| (r.snapshot.pid, r)).collect();

        let mut inner = self.inner.write().await;
        let mut departed = Vec::new();
        for group in inner.groups.values_mut() {
            let mut total_cpu = 0.0;
            let mut total_memory = 0u64;
            group.members.retain(|pid| match by_pid.get(pid) {
                Some(record) => {
                    total_cpu += record.cpu_percent;
                    total_memory += record.snapshot.memory_bytes;
                    true
                }
                None => {
                    departed.push(*pid);
                    false
                }
            });
            group.total_cpu = total_cpu;
            group.total_memory = total_memory;
        }
        for pid in departed {
            inner.membership.remove(&pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProbeError, ProcessSnapshot};
    use nix::sys::signal::Signal;
    use std::sync::Mutex;

    /// Probe whose world is an explicit PID set.
    struct FakeProbe {
        pids: Mutex<BTreeSet<i32>>,
    }

    impl FakeProbe {
        fn with_pids(pids: &[i32]) -> Arc<Self> {
            Arc::new(Self {
                pids: Mutex::new(pids.iter().copied().collect()),
            })
        }
    }

    impl ProcessProbe for FakeProbe {
        fn list_pids(&self) -> Result<Vec<i32>, ProbeError> {
            Ok(self.pids.lock().unwrap().iter().copied().collect())
        }

        fn read_snapshot(&self, pid: i32) -> Result<ProcessSnapshot, ProbeError> {
            if !self.pids.lock().unwrap().contains(&pid) {
                return Err(ProbeError::NotFound);
            }
            Ok(snapshot(pid, 0))
        }

        fn send_signal(&self, pid: i32, _signal: Option<Signal>) -> Result<(), ProbeError> {
            if self.pids.lock().unwrap().contains(&pid) {
                Ok(())
            } else {
                Err(ProbeError::NotFound)
            }
        }

        fn adjust_priority(&self, _: i32, _: i32, _: i32) -> Result<(), ProbeError> {
            Ok(())
        }
    }

    fn snapshot(pid: i32, memory: u64) -> ProcessSnapshot {
        ProcessSnapshot {
            pid,
            parent_pid: 1,
            name: format!("proc-{pid}"),
            memory_bytes: memory,
            thread_count: 1,
            priority: 0,
            policy: 0,
            state_code: 0,
            cumulative_cpu_ns: 0,
            start_time_ms: 0,
        }
    }

    fn record(pid: i32, cpu: f64, memory: u64) -> ProcessRecord {
        ProcessRecord {
            snapshot: snapshot(pid, memory),
            cpu_percent: cpu,
            group_id: UNASSIGNED,
        }
    }

    #[tokio::test]
    async fn ids_are_monotonic_from_one() {
        let index = GroupIndex::new(FakeProbe::with_pids(&[]));
        assert_eq!(index.create_group("a", 0, "").await, 1);
        assert_eq!(index.create_group("b", 0, "").await, 2);
        assert!(index.delete_group(1).await);
        // Deleted IDs are not reused.
        assert_eq!(index.create_group("c", 0, "").await, 3);
    }

    #[tokio::test]
    async fn add_moves_between_groups() {
        let index = GroupIndex::new(FakeProbe::with_pids(&[10]));
        let g1 = index.create_group("first", 0, "").await;
        let g2 = index.create_group("second", 0, "").await;

        assert!(index.add(10, g1).await);
        assert_eq!(index.group_of(10).await, g1);
        assert!(index.members(g1).await.unwrap().contains(&10));

        assert!(index.add(10, g2).await);
        assert_eq!(index.group_of(10).await, g2);
        assert!(!index.members(g1).await.unwrap().contains(&10));
        assert!(index.members(g2).await.unwrap().contains(&10));
    }

    #[tokio::test]
    async fn add_rejects_unknown_group_and_dead_pid() {
        let index = GroupIndex::new(FakeProbe::with_pids(&[10]));
        let g = index.create_group("g", 0, "").await;
        assert!(!index.add(10, g + 1).await);
        assert!(!index.add(11, g).await);
        assert_eq!(index.group_of(10).await, UNASSIGNED);
    }

    #[tokio::test]
    async fn delete_unassigns_members() {
        let index = GroupIndex::new(FakeProbe::with_pids(&[10, 11]));
        let g = index.create_group("x", 0, "").await;
        assert!(index.add(10, g).await);
        assert!(index.add(11, g).await);

        assert!(index.delete_group(g).await);
        assert_eq!(index.group_of(10).await, UNASSIGNED);
        assert_eq!(index.group_of(11).await, UNASSIGNED);
        assert!(index.members(g).await.is_none());
        assert!(!index.delete_group(g).await);
    }

    #[tokio::test]
    async fn remove_only_affects_members() {
        let index = GroupIndex::new(FakeProbe::with_pids(&[10]));
        let g = index.create_group("g", 0, "").await;
        assert!(index.add(10, g).await);

        assert!(!index.remove(10, g + 1).await);
        assert!(!index.remove(11, g).await);
        assert!(index.remove(10, g).await);
        assert_eq!(index.group_of(10).await, UNASSIGNED);
        assert!(!index.remove(10, g).await);
    }

    #[tokio::test]
    async fn recompute_aggregates_and_drops_departed() {
        let index = GroupIndex::new(FakeProbe::with_pids(&[10, 11, 12]));
        let g = index.create_group("workers", 5, "").await;
        for pid in [10, 11, 12] {
            assert!(index.add(pid, g).await);
        }

        index
            .recompute_stats(&[record(10, 12.5, 1000), record(11, 7.5, 2000)])
            .await;

        let groups = index.list().await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members.len(), 2);
        assert!((groups[0].total_cpu - 20.0).abs() < 1e-9);
        assert_eq!(groups[0].total_memory, 3000);
        // PID 12 exited: dropped and unmapped.
        assert_eq!(index.group_of(12).await, UNASSIGNED);
    }

    #[tokio::test]
    async fn rename() {
        let index = GroupIndex::new(FakeProbe::with_pids(&[]));
        let g = index.create_group("old", 0, "").await;
        assert!(index.rename_group(g, "new").await);
        assert_eq!(index.list().await[0].name, "new");
        assert!(!index.rename_group(g + 1, "x").await);
    }
}
