//! Prometheus recorder and the live metrics loops.

use std::sync::{Arc, OnceLock};

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio_util::sync::CancellationToken;

use bosun_queue::TaskQueueSet;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global recorder. Safe to call more than once.
pub fn init_recorder() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("installing prometheus recorder")
        })
        .clone()
}

/// Render the scrape payload; empty until the recorder is installed.
pub fn render() -> String {
    PROMETHEUS_HANDLE.get().map(|h| h.render()).unwrap_or_default()
}

/// Liveness counter and queue-length gauges, emitted on fixed intervals.
pub fn spawn_live_metrics(queues: Arc<TaskQueueSet>, stop: CancellationToken) {
    let live_stop = stop.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = ticker.tick() => counter!("live_ticks", 1u64),
                _ = live_stop.cancelled() => return,
            }
        }
    });

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    queues.iterate(|q| {
                        gauge!("tasks_queue_length", q.length() as f64, "queue" => q.name().to_string());
                    });
                }
                _ = stop.cancelled() => return,
            }
        }
    });
}
