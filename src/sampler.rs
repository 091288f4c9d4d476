//! Sampler task — the periodic heartbeat of the daemon
//!
//! Each tick rescans the process table, recomputes group aggregates from
//! the fresh snapshot, and appends one history sample per live PID. A
//! failed scan keeps the previous table and tries again next tick.

use crate::groups::GroupIndex;
use crate::history::HistoryRing;
use crate::registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub async fn run(
    registry: Arc<Registry>,
    groups: Arc<GroupIndex>,
    history: Arc<HistoryRing>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("sampler shutting down");
                break;
            }
            _ = ticker.tick() => {
                match registry.rescan(&groups).await {
                    Ok(count) => {
                        let records = registry.snapshot_all().await;
                        groups.recompute_stats(&records).await;
                        for record in &records {
                            history.push(
                                record.snapshot.pid,
                                record.cpu_percent,
                                record.snapshot.memory_bytes,
                            );
                        }
                        debug!("sampled {count} processes");
                    }
                    Err(e) => {
                        warn!("sampling failed, serving previous snapshot: {e:#}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProbeError, ProcessProbe, ProcessSnapshot};
    use nix::sys::signal::Signal;

    struct OwnPidProbe;

    impl ProcessProbe for OwnPidProbe {
        fn list_pids(&self) -> Result<Vec<i32>, ProbeError> {
            Ok(vec![1])
        }

        fn read_snapshot(&self, pid: i32) -> Result<ProcessSnapshot, ProbeError> {
            Ok(ProcessSnapshot {
                pid,
                parent_pid: 0,
                name: "init".to_string(),
                memory_bytes: 1024,
                thread_count: 1,
                priority: 0,
                policy: 0,
                state_code: 0,
                cumulative_cpu_ns: 0,
                start_time_ms: 0,
            })
        }

        fn send_signal(&self, _: i32, _: Option<Signal>) -> Result<(), ProbeError> {
            Ok(())
        }

        fn adjust_priority(&self, _: i32, _: i32, _: i32) -> Result<(), ProbeError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn ticks_populate_registry_and_history() {
        let probe = Arc::new(OwnPidProbe);
        let registry = Arc::new(Registry::new(probe.clone(), 1));
        let groups = Arc::new(GroupIndex::new(probe));
        let history = Arc::new(HistoryRing::default());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            registry.clone(),
            groups.clone(),
            history.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(registry.get(1).await.is_some());
        assert!(!history.get(1).is_empty());
        assert!(history.get(1).len() <= 60);
    }
}
