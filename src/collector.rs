use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

use crate::catalog::Target;
use crate::model::{Device, Snapshot};
use crate::prober::{ProbeError, Prober};

/// Why a target contributed nothing to a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFailure {
    pub hostname: String,
    pub kind: &'static str,
    pub error: String,
}

impl TargetFailure {
    fn probe(hostname: &str, err: &ProbeError) -> Self {
        Self {
            hostname: hostname.to_string(),
            kind: err.kind(),
            error: err.to_string(),
        }
    }

    fn timed_out(hostname: &str, deadline: Duration) -> Self {
        Self {
            hostname: hostname.to_string(),
            kind: "timeout",
            error: format!("probe did not finish within {}", humantime::format_duration(deadline)),
        }
    }

    fn panicked(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            kind: "panic",
            error: "probe task panicked".to_string(),
        }
    }

    fn duplicate(hostname: &str, reported: &str, first: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            kind: "duplicate_hostname",
            error: format!("device reports hostname {reported}, already collected from {first}"),
        }
    }
}

/// A target that produced a device in the snapshot, under its catalog name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbedTarget {
    pub hostname: String,
    pub reachable: bool,
}

#[derive(Debug, Clone)]
pub struct CollectOutcome {
    pub snapshot: Snapshot,
    /// Parallel to `snapshot.devices`.
    pub probed: Vec<ProbedTarget>,
    pub failures: Vec<TargetFailure>,
    pub elapsed: Duration,
}

impl CollectOutcome {
    pub fn unreachable(&self) -> usize {
        self.snapshot
            .devices
            .iter()
            .filter(|d| !d.snapshot_successful)
            .count()
    }
}

enum Slot {
    Pending,
    Done(Result<Device, ProbeError>),
    Panicked,
}

/// Probes every target concurrently and gathers one snapshot.
#[derive(Clone)]
pub struct Collector {
    prober: Prober,
    targets: Arc<[Target]>,
    max_concurrency: usize,
    deadline: Duration,
}

impl Collector {
    /// `max_concurrency == 0` starts every probe at once.
    pub fn new(
        prober: Prober,
        targets: Vec<Target>,
        max_concurrency: usize,
        deadline: Duration,
    ) -> Self {
        Self {
            prober,
            targets: targets.into(),
            max_concurrency,
            deadline,
        }
    }

    /// Always returns a snapshot. Failed targets are left out of it and listed
    /// in `failures`; probes still running at the deadline are aborted and
    /// their sessions dropped before this returns. Devices come back in
    /// catalog order, one per reported hostname.
    pub async fn collect(&self) -> CollectOutcome {
        let started = Instant::now();
        let deadline = started + self.deadline;
        let mut snapshot = Snapshot::new(Utc::now());

        let limiter = (self.max_concurrency > 0)
            .then(|| Arc::new(Semaphore::new(self.max_concurrency)));

        let mut tasks = JoinSet::new();
        let mut task_targets: HashMap<task::Id, usize> = HashMap::new();
        for (idx, target) in self.targets.iter().enumerate() {
            let prober = self.prober.clone();
            let target = target.clone();
            let limiter = limiter.clone();
            let handle = tasks.spawn(async move {
                let _permit = match limiter {
                    Some(sem) => sem.acquire_owned().await.ok(),
                    None => None,
                };
                prober.probe(&target).await
            });
            task_targets.insert(handle.id(), idx);
        }

        let mut slots: Vec<Slot> = self.targets.iter().map(|_| Slot::Pending).collect();

        loop {
            let joined = match timeout_at(deadline, tasks.join_next_with_id()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_) => {
                    tasks.abort_all();
                    break;
                }
            };
            record(&mut slots, &task_targets, joined);
        }
        // Aborted probes drop their sessions as they unwind.
        while let Some(joined) = tasks.join_next_with_id().await {
            record(&mut slots, &task_targets, joined);
        }

        let mut failures = Vec::new();
        let mut probed = Vec::new();
        let mut first_seen: HashMap<String, String> = HashMap::new();
        for (target, slot) in self.targets.iter().zip(slots) {
            let host = target.hostname();
            match slot {
                Slot::Done(Ok(device)) => {
                    if let Some(first) = first_seen.get(&device.hostname) {
                        warn!(
                            host = %host,
                            reported = %device.hostname,
                            first = %first,
                            "duplicate device hostname"
                        );
                        failures.push(TargetFailure::duplicate(host, &device.hostname, first));
                        continue;
                    }
                    first_seen.insert(device.hostname.clone(), host.to_string());
                    probed.push(ProbedTarget {
                        hostname: host.to_string(),
                        reachable: device.snapshot_successful,
                    });
                    snapshot.devices.push(device);
                }
                Slot::Done(Err(err)) => {
                    warn!(host = %host, kind = err.kind(), error = %err, "probe failed");
                    failures.push(TargetFailure::probe(host, &err));
                }
                Slot::Panicked => failures.push(TargetFailure::panicked(host)),
                // Only the deadline cancels probes.
                Slot::Pending => {
                    warn!(host = %host, "probe abandoned at deadline");
                    failures.push(TargetFailure::timed_out(host, self.deadline));
                }
            }
        }

        let elapsed = started.elapsed();
        info!(
            targets = self.targets.len(),
            devices = snapshot.devices.len(),
            failures = failures.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "collection finished"
        );

        CollectOutcome {
            snapshot,
            probed,
            failures,
            elapsed,
        }
    }
}

fn record(
    slots: &mut [Slot],
    task_targets: &HashMap<task::Id, usize>,
    joined: Result<(task::Id, Result<Device, ProbeError>), JoinError>,
) {
    match joined {
        Ok((id, result)) => {
            if let Some(&idx) = task_targets.get(&id) {
                slots[idx] = Slot::Done(result);
            }
        }
        Err(err) if err.is_panic() => {
            error!(error = %err, "probe task panicked");
            if let Some(&idx) = task_targets.get(&err.id()) {
                slots[idx] = Slot::Panicked;
            }
        }
        // Cancelled at the deadline; the slot stays pending.
        Err(_) => {}
    }
}
