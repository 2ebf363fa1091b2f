use crate::state::{now_unix, State};
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub netsnap_collections_total: Counter,
    pub netsnap_collection_duration_seconds: Gauge,
    pub netsnap_devices_collected: Gauge,
    pub netsnap_devices_unreachable: Gauge,
    pub netsnap_probe_failures_total: CounterVec,
    pub netsnap_targets_down: Gauge,
    pub netsnap_target_consecutive_failures: GaugeVec,
    pub netsnap_snapshots_stored_total: Counter,
    pub netsnap_snapshots_uploaded_total: Counter,
    pub netsnap_store_errors_total: CounterVec,
    pub netsnap_upload_errors_total: Counter,
    pub netsnap_last_collection_timestamp_seconds: Gauge,
    pub netsnap_uptime_seconds: Gauge,
    pub netsnap_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let netsnap_collections_total = Counter::with_opts(opts!(
            "netsnap_collections_total",
            "Finished collection rounds"
        ))?;
        let netsnap_collection_duration_seconds = Gauge::with_opts(opts!(
            "netsnap_collection_duration_seconds",
            "Wall time of the last collection round in seconds"
        ))?;
        let netsnap_devices_collected = Gauge::with_opts(opts!(
            "netsnap_devices_collected",
            "Devices in the last snapshot, reachable or not"
        ))?;
        let netsnap_devices_unreachable = Gauge::with_opts(opts!(
            "netsnap_devices_unreachable",
            "Devices in the last snapshot whose session could not be opened"
        ))?;
        let netsnap_probe_failures_total = CounterVec::new(
            opts!(
                "netsnap_probe_failures_total",
                "Targets left out of a snapshot, by failure kind"
            ),
            &["kind"],
        )?;
        let netsnap_targets_down = Gauge::with_opts(opts!(
            "netsnap_targets_down",
            "Targets that failed several collections in a row"
        ))?;
        let netsnap_target_consecutive_failures = GaugeVec::new(
            opts!(
                "netsnap_target_consecutive_failures",
                "Consecutive failed collections per target"
            ),
            &["target"],
        )?;
        let netsnap_snapshots_stored_total = Counter::with_opts(opts!(
            "netsnap_snapshots_stored_total",
            "Snapshots written to the local database"
        ))?;
        let netsnap_snapshots_uploaded_total = Counter::with_opts(opts!(
            "netsnap_snapshots_uploaded_total",
            "Snapshots accepted by the remote server"
        ))?;
        let netsnap_store_errors_total = CounterVec::new(
            opts!(
                "netsnap_store_errors_total",
                "Failed database operations by operation"
            ),
            &["operation"],
        )?;
        let netsnap_upload_errors_total = Counter::with_opts(opts!(
            "netsnap_upload_errors_total",
            "Snapshots the remote server did not accept"
        ))?;
        let netsnap_last_collection_timestamp_seconds = Gauge::with_opts(opts!(
            "netsnap_last_collection_timestamp_seconds",
            "Unix time the last collection round finished"
        ))?;
        let netsnap_uptime_seconds =
            Gauge::with_opts(opts!("netsnap_uptime_seconds", "Daemon uptime in seconds"))?;
        let netsnap_scrape_count_total = Counter::with_opts(opts!(
            "netsnap_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &netsnap_collections_total)?;
        register(&registry, &netsnap_collection_duration_seconds)?;
        register(&registry, &netsnap_devices_collected)?;
        register(&registry, &netsnap_devices_unreachable)?;
        register(&registry, &netsnap_probe_failures_total)?;
        register(&registry, &netsnap_targets_down)?;
        register(&registry, &netsnap_target_consecutive_failures)?;
        register(&registry, &netsnap_snapshots_stored_total)?;
        register(&registry, &netsnap_snapshots_uploaded_total)?;
        register(&registry, &netsnap_store_errors_total)?;
        register(&registry, &netsnap_upload_errors_total)?;
        register(&registry, &netsnap_last_collection_timestamp_seconds)?;
        register(&registry, &netsnap_uptime_seconds)?;
        register(&registry, &netsnap_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            netsnap_collections_total,
            netsnap_collection_duration_seconds,
            netsnap_devices_collected,
            netsnap_devices_unreachable,
            netsnap_probe_failures_total,
            netsnap_targets_down,
            netsnap_target_consecutive_failures,
            netsnap_snapshots_stored_total,
            netsnap_snapshots_uploaded_total,
            netsnap_store_errors_total,
            netsnap_upload_errors_total,
            netsnap_last_collection_timestamp_seconds,
            netsnap_uptime_seconds,
            netsnap_scrape_count_total,
        }))
    }

    /// Gauges only; counters are bumped where the event happens.
    pub fn update_from_state(&self, state: &State) {
        self.netsnap_target_consecutive_failures.reset();

        if let Some(last) = &state.last_collection {
            self.netsnap_collection_duration_seconds
                .set(last.elapsed_ms as f64 / 1000.0);
            self.netsnap_devices_collected.set(last.devices as f64);
            self.netsnap_devices_unreachable.set(last.unreachable as f64);
            self.netsnap_last_collection_timestamp_seconds
                .set(last.finished_at_unix as f64);
        }

        for (hostname, health) in &state.targets {
            self.netsnap_target_consecutive_failures
                .with_label_values(&[hostname.as_str()])
                .set(health.consecutive_failures as f64);
        }
        self.netsnap_targets_down.set(state.targets_down() as f64);

        let uptime = now_unix().saturating_sub(state.started_at_unix) as f64;
        self.netsnap_uptime_seconds.set(uptime);
    }

    pub fn inc_collection(&self) {
        self.netsnap_collections_total.inc();
    }

    pub fn inc_probe_failure(&self, kind: &str) {
        self.netsnap_probe_failures_total
            .with_label_values(&[kind])
            .inc();
    }

    pub fn inc_snapshot_stored(&self) {
        self.netsnap_snapshots_stored_total.inc();
    }

    pub fn inc_snapshot_uploaded(&self) {
        self.netsnap_snapshots_uploaded_total.inc();
    }

    pub fn inc_store_error(&self, operation: &str) {
        self.netsnap_store_errors_total
            .with_label_values(&[operation])
            .inc();
    }

    pub fn inc_upload_error(&self) {
        self.netsnap_upload_errors_total.inc();
    }

    pub fn inc_scrape_count(&self) {
        self.netsnap_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{CollectOutcome, ProbedTarget, TargetFailure};
    use crate::model::{Device, Snapshot};
    use crate::state::Delivery;
    use chrono::Utc;
    use std::time::Duration;

    #[test]
    fn gauges_follow_last_collection() {
        let metrics = Metrics::new().unwrap();
        let mut state = State::new(now_unix());
        let mut snapshot = Snapshot::new(Utc::now());
        snapshot
            .devices
            .push(Device::unreachable("leaf1", "Nokia", "nokia_srlinux"));
        let outcome = CollectOutcome {
            snapshot,
            probed: vec![ProbedTarget {
                hostname: "leaf1".to_string(),
                reachable: false,
            }],
            failures: vec![TargetFailure {
                hostname: "leaf2".to_string(),
                kind: "timeout",
                error: "probe did not finish within 100s".to_string(),
            }],
            elapsed: Duration::from_millis(2500),
        };
        state.record_collection(&outcome, Delivery::Stored { id: 1 }, 42);
        metrics.update_from_state(&state);
        metrics.inc_probe_failure("timeout");

        assert_eq!(metrics.netsnap_devices_collected.get(), 1.0);
        assert_eq!(metrics.netsnap_devices_unreachable.get(), 1.0);
        assert_eq!(metrics.netsnap_collection_duration_seconds.get(), 2.5);
        assert_eq!(metrics.netsnap_last_collection_timestamp_seconds.get(), 42.0);
        assert_eq!(
            metrics
                .netsnap_target_consecutive_failures
                .with_label_values(&["leaf2"])
                .get(),
            1.0
        );

        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("netsnap_probe_failures_total{kind=\"timeout\"} 1"));
    }
}
