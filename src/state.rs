use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::collector::{CollectOutcome, TargetFailure};
use crate::model::SnapshotId;

/// Failed collections in a row before a target is reported down.
pub const DOWN_THRESHOLD: u32 = 3;

/// What `/api/status` and the metrics gauges are built from.
#[derive(Debug, Clone, Default, Serialize)]
pub struct State {
    pub started_at_unix: i64,
    pub collections: u64,
    pub last_collection: Option<CollectionSummary>,
    pub last_failures: Vec<TargetFailure>,
    pub targets: BTreeMap<String, TargetHealth>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionSummary {
    pub finished_at_unix: i64,
    pub timestamp: DateTime<Utc>,
    pub targets: usize,
    pub devices: usize,
    pub unreachable: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
    pub delivery: Delivery,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Delivery {
    Stored { id: SnapshotId },
    Uploaded { id: SnapshotId },
    Failed { error: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetHealth {
    pub consecutive_failures: u32,
    pub is_down: bool,
    pub last_success_unix: Option<i64>,
    pub last_state_change_unix: Option<i64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEventKind {
    Down,
    Recovered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    pub hostname: String,
    pub kind: HealthEventKind,
}

impl State {
    pub fn new(now_unix: i64) -> Self {
        Self {
            started_at_unix: now_unix,
            ..Self::default()
        }
    }

    /// Folds one finished collection into the status and returns the
    /// targets whose health flipped.
    pub fn record_collection(
        &mut self,
        outcome: &CollectOutcome,
        delivery: Delivery,
        now_unix: i64,
    ) -> Vec<HealthEvent> {
        let mut events = Vec::new();

        // Keyed by catalog hostname; the device may report another name.
        for target in &outcome.probed {
            let error = (!target.reachable).then(|| "unreachable".to_string());
            update_target_health(
                &mut self.targets,
                &target.hostname,
                error,
                now_unix,
                &mut events,
            );
        }
        for failure in &outcome.failures {
            update_target_health(
                &mut self.targets,
                &failure.hostname,
                Some(format!("{}: {}", failure.kind, failure.error)),
                now_unix,
                &mut events,
            );
        }

        self.collections = self.collections.saturating_add(1);
        self.last_failures = outcome.failures.clone();
        self.last_collection = Some(CollectionSummary {
            finished_at_unix: now_unix,
            timestamp: outcome.snapshot.timestamp,
            targets: outcome.snapshot.devices.len() + outcome.failures.len(),
            devices: outcome.snapshot.devices.len(),
            unreachable: outcome.unreachable(),
            failed: outcome.failures.len(),
            elapsed_ms: outcome.elapsed.as_millis() as u64,
            delivery,
        });

        events
    }

    pub fn targets_down(&self) -> usize {
        self.targets.values().filter(|t| t.is_down).count()
    }
}

fn update_target_health(
    targets: &mut BTreeMap<String, TargetHealth>,
    hostname: &str,
    error: Option<String>,
    now_unix: i64,
    events: &mut Vec<HealthEvent>,
) {
    let entry = targets.entry(hostname.to_string()).or_default();

    let Some(error) = error else {
        let was_down = entry.is_down;
        entry.consecutive_failures = 0;
        entry.is_down = false;
        entry.last_success_unix = Some(now_unix);
        entry.last_error = None;
        if was_down {
            entry.last_state_change_unix = Some(now_unix);
            events.push(HealthEvent {
                hostname: hostname.to_string(),
                kind: HealthEventKind::Recovered,
            });
        }
        return;
    };

    entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
    entry.last_error = Some(error);

    if !entry.is_down && entry.consecutive_failures >= DOWN_THRESHOLD {
        entry.is_down = true;
        entry.last_state_change_unix = Some(now_unix);
        events.push(HealthEvent {
            hostname: hostname.to_string(),
            kind: HealthEventKind::Down,
        });
    }
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
