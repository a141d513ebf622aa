//! Bosun watch: resource monitors with projection-based change detection.
//!
//! A monitor subscribes to one resource kind, applies an optional projection
//! to every delivered object and emits a change signal only when the
//! projected fingerprint changes. Orchestrator-level noise (status churn,
//! resync re-delivery) never reaches the task queues.

#![forbid(unsafe_code)]

pub mod fingerprint;
pub mod kinds;
pub mod projection;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use bosun_core::{checksum_of, ObjectAndFilterResult, WatchEventType};
use futures::TryStreamExt;
use kube::{
    api::{Api, ListParams},
    core::DynamicObject,
    runtime::watcher::{self, Event},
    Client,
};
use metrics::{counter, histogram};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use fingerprint::{resource_id, FingerprintTable};
use kinds::KindSpec;

/// Typed failures at the monitor-creation seam.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("kind '{0}' isn't supported")]
    UnsupportedKind(String),
    #[error("invalid selector '{0}'")]
    InvalidSelector(String),
}

/// Declarative subscription to one resource stream.
#[derive(Debug, Clone)]
pub struct MonitorSpec {
    /// Binding name carried into hook contexts.
    pub name: String,
    /// Lowercase kind from the supported catalogue.
    pub kind: String,
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    /// Projection expression; empty means canonical serialization.
    pub jq_filter: Option<String>,
    /// Watch-event kinds that produce change signals.
    pub watch_events: Vec<WatchEventType>,
}

impl MonitorSpec {
    fn reports(&self, ev: WatchEventType) -> bool {
        self.watch_events.contains(&ev)
    }
}

/// A change signal produced by a monitor.
#[derive(Debug, Clone)]
pub struct KubeEvent {
    pub config_id: String,
    pub binding: String,
    pub watch_event: WatchEventType,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub object: Value,
    pub filter_result: Option<String>,
}

struct MonitorState {
    config_id: String,
    spec: MonitorSpec,
    kind: &'static KindSpec,
    fingerprints: Mutex<FingerprintTable>,
    stop: CancellationToken,
    armed: AtomicBool,
    baseline_done: AtomicBool,
}

/// Owns all monitors and the change-signal channel. Signals are consumed by
/// a single converter task; the channel is owned here, not process-global.
pub struct WatchManager {
    monitors: RwLock<HashMap<String, Arc<MonitorState>>>,
    events_tx: mpsc::Sender<KubeEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<KubeEvent>>>,
    stop: CancellationToken,
}

impl WatchManager {
    pub fn new(stop: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(256);
        WatchManager {
            monitors: RwLock::new(HashMap::new()),
            events_tx: tx,
            events_rx: Mutex::new(Some(rx)),
            stop,
        }
    }

    /// Take the change-signal receiver. Single consumer.
    pub fn take_events(&self) -> Option<mpsc::Receiver<KubeEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    /// Register a monitor. Delivery begins only at `start`; the initial list
    /// runs in `snapshot`.
    pub fn add_monitor(&self, spec: MonitorSpec) -> Result<String, WatchError> {
        let kind = kinds::lookup(&spec.kind)
            .ok_or_else(|| WatchError::UnsupportedKind(spec.kind.clone()))?;
        if let Some(sel) = spec.label_selector.as_deref() {
            validate_selector(sel)?;
        }
        if let Some(sel) = spec.field_selector.as_deref() {
            validate_selector(sel)?;
        }

        let config_id = Uuid::new_v4().to_string();
        let state = Arc::new(MonitorState {
            config_id: config_id.clone(),
            spec,
            kind,
            fingerprints: Mutex::new(FingerprintTable::new()),
            stop: self.stop.child_token(),
            armed: AtomicBool::new(false),
            baseline_done: AtomicBool::new(false),
        });
        info!(config_id = %config_id, kind = state.kind.name, "monitor added");
        self.monitors.write().unwrap().insert(config_id.clone(), state);
        Ok(config_id)
    }

    /// Perform the initial list for a monitor, seed its baseline fingerprint
    /// table and return the Synchronization batch.
    pub async fn snapshot(&self, config_id: &str) -> Result<Vec<ObjectAndFilterResult>> {
        let monitor = self
            .monitor(config_id)
            .with_context(|| format!("unknown monitor '{}'", config_id))?;
        let client = Client::try_default().await?;
        let api = monitor_api(&client, &monitor);

        let page_limit: u32 = std::env::var("BOSUN_SNAPSHOT_PAGE_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(500);

        let mut batch: Vec<ObjectAndFilterResult> = Vec::new();
        let mut continue_token: Option<String> = None;
        loop {
            let mut params = list_params(&monitor.spec);
            if page_limit > 0 {
                params = params.limit(page_limit);
            }
            if let Some(ref token) = continue_token {
                params = params.continue_token(token);
            }
            let list = api.list(&params).await.context("initial list for monitor")?;
            counter!("watch_snapshot_pages_total", 1u64);
            histogram!("watch_snapshot_page_items", list.items.len() as f64);
            for obj in list.items.iter() {
                let raw = object_to_value(obj)?;
                let projected =
                    projection::project(&raw, monitor.spec.jq_filter.as_deref()).await?;
                let id = resource_id(
                    obj.metadata.name.as_deref().unwrap_or(""),
                    obj.metadata.namespace.as_deref().unwrap_or(""),
                );
                monitor.fingerprints.lock().unwrap().seed(id, checksum_of(&projected));
                batch.push(ObjectAndFilterResult {
                    object: raw,
                    filter_result: monitor.spec.jq_filter.as_ref().map(|_| projected),
                });
            }
            continue_token = list.metadata.continue_.clone();
            if continue_token.is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        monitor.baseline_done.store(true, Ordering::SeqCst);
        debug!(config_id, objects = batch.len(), "monitor baseline seeded");
        Ok(batch)
    }

    /// Arm every registered monitor: list if no baseline exists yet, then
    /// attach the change handler to the stream.
    pub async fn start(&self) -> Result<()> {
        let ids: Vec<String> = self.monitors.read().unwrap().keys().cloned().collect();
        for id in ids {
            self.start_monitor(&id).await?;
        }
        Ok(())
    }

    pub async fn start_monitor(&self, config_id: &str) -> Result<()> {
        let monitor = self
            .monitor(config_id)
            .with_context(|| format!("unknown monitor '{}'", config_id))?;
        if monitor.armed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !monitor.baseline_done.load(Ordering::SeqCst) {
            self.snapshot(config_id).await?;
        }
        let events_tx = self.events_tx.clone();
        let m = Arc::clone(&monitor);
        tokio::spawn(async move {
            watch_loop(m, events_tx).await;
        });
        Ok(())
    }

    /// Tear down one monitor and discard its fingerprint table.
    pub fn stop_monitor(&self, config_id: &str) {
        let removed = self.monitors.write().unwrap().remove(config_id);
        match removed {
            Some(m) => {
                m.stop.cancel();
                info!(config_id, "monitor stopped");
            }
            None => warn!(config_id, "stop requested for unknown monitor"),
        }
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.read().unwrap().len()
    }

    fn monitor(&self, config_id: &str) -> Option<Arc<MonitorState>> {
        self.monitors.read().unwrap().get(config_id).cloned()
    }
}

fn list_params(spec: &MonitorSpec) -> ListParams {
    let mut params = ListParams::default();
    if let Some(sel) = spec.label_selector.as_deref() {
        params = params.labels(sel);
    }
    if let Some(sel) = spec.field_selector.as_deref() {
        params = params.fields(sel);
    }
    params
}

fn monitor_api(client: &Client, monitor: &MonitorState) -> Api<DynamicObject> {
    let ar = monitor.kind.api_resource();
    if monitor.kind.namespaced {
        match monitor.spec.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
            None => Api::all_with(client.clone(), &ar),
        }
    } else {
        Api::all_with(client.clone(), &ar)
    }
}

fn object_to_value(obj: &DynamicObject) -> Result<Value> {
    let mut raw = serde_json::to_value(obj).context("serializing object")?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

fn strip_managed_fields(v: &mut Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Long-running stream loop for one monitor, restarting with backoff.
/// Delegated stream errors leave the monitor alive; an expired
/// resourceVersion (410) is repaired by re-listing through the fingerprint
/// table, which swallows unchanged re-deliveries.
async fn watch_loop(monitor: Arc<MonitorState>, events_tx: mpsc::Sender<KubeEvent>) {
    let backoff_max: u64 = std::env::var("BOSUN_WATCH_BACKOFF_MAX_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(30);

    info!(config_id = %monitor.config_id, kind = monitor.kind.name, "watch loop starting");
    let mut backoff: u64 = 1;
    loop {
        if monitor.stop.is_cancelled() {
            info!(config_id = %monitor.config_id, "watch loop stopped");
            return;
        }
        let client = match Client::try_default().await {
            Ok(c) => c,
            Err(e) => {
                warn!(config_id = %monitor.config_id, error = %e, "kube client unavailable; backing off");
                counter!("watch_errors_total", 1u64);
                if sleep_backoff(&monitor, &mut backoff, backoff_max).await {
                    return;
                }
                continue;
            }
        };
        let api = monitor_api(&client, &monitor);
        let mut cfg = watcher::Config::default();
        if let Some(sel) = monitor.spec.label_selector.as_deref() {
            cfg = cfg.labels(sel);
        }
        if let Some(sel) = monitor.spec.field_selector.as_deref() {
            cfg = cfg.fields(sel);
        }
        let stream = watcher::watcher(api, cfg);
        futures::pin_mut!(stream);

        let ended = loop {
            tokio::select! {
                maybe_ev = stream.try_next() => {
                    match maybe_ev {
                        Ok(Some(Event::Applied(obj))) => {
                            handle_delivery(&monitor, &events_tx, &obj, false).await;
                        }
                        Ok(Some(Event::Deleted(obj))) => {
                            handle_delivery(&monitor, &events_tx, &obj, true).await;
                        }
                        Ok(Some(Event::Restarted(list))) => {
                            // Resync re-delivery: unchanged fingerprints stay quiet.
                            debug!(config_id = %monitor.config_id, count = list.len(), "watch restarted");
                            for obj in list.iter() {
                                handle_delivery(&monitor, &events_tx, obj, false).await;
                            }
                        }
                        Ok(None) => break true,
                        Err(e) => {
                            warn!(config_id = %monitor.config_id, error = %e, "watch stream error; will restart");
                            counter!("watch_errors_total", 1u64);
                            break true;
                        }
                    }
                }
                _ = monitor.stop.cancelled() => {
                    info!(config_id = %monitor.config_id, "watch loop stopped");
                    return;
                }
            }
        };

        if ended {
            counter!("watch_restarts_total", 1u64);
            if sleep_backoff(&monitor, &mut backoff, backoff_max).await {
                return;
            }
        } else {
            backoff = 1;
        }
    }
}

/// Returns true when the monitor was stopped during the backoff sleep.
async fn sleep_backoff(monitor: &MonitorState, backoff: &mut u64, backoff_max: u64) -> bool {
    let dur = std::time::Duration::from_secs((*backoff).min(backoff_max));
    histogram!("watch_backoff_ms", dur.as_millis() as f64);
    *backoff = (*backoff * 2).min(backoff_max).max(1);
    tokio::select! {
        _ = tokio::time::sleep(dur) => false,
        _ = monitor.stop.cancelled() => true,
    }
}

/// Project, fingerprint and possibly emit one delivery. Errors are logged
/// and the event dropped; the next delivery re-evaluates.
async fn handle_delivery(
    monitor: &Arc<MonitorState>,
    events_tx: &mpsc::Sender<KubeEvent>,
    obj: &DynamicObject,
    deleted: bool,
) {
    let name = obj.metadata.name.clone().unwrap_or_default();
    let namespace = obj.metadata.namespace.clone().unwrap_or_default();
    let id = resource_id(&name, &namespace);

    let raw = match object_to_value(obj) {
        Ok(v) => v,
        Err(e) => {
            error!(config_id = %monitor.config_id, object = %id, error = %e, "object serialization failed; event dropped");
            return;
        }
    };

    let (watch_event, projected) = if deleted {
        (WatchEventType::Deleted, None)
    } else {
        // Projection runs outside the fingerprint lock.
        let projected = match projection::project(&raw, monitor.spec.jq_filter.as_deref()).await {
            Ok(p) => p,
            Err(e) => {
                error!(config_id = %monitor.config_id, object = %id, error = %e, "projection failed; event dropped");
                counter!("watch_projection_errors_total", 1u64);
                return;
            }
        };
        let ev = if monitor.fingerprints.lock().unwrap().contains(&id) {
            WatchEventType::Modified
        } else {
            WatchEventType::Added
        };
        (ev, Some(projected))
    };

    let checksum = projected.as_deref().map(checksum_of).unwrap_or_default();
    let report = monitor.spec.reports(watch_event);
    let emit =
        monitor.fingerprints.lock().unwrap().observe(watch_event, &id, &checksum, report);
    if !emit {
        return;
    }

    debug!(config_id = %monitor.config_id, object = %id, event = %watch_event, "object changed");
    counter!("watch_change_signals_total", 1u64);
    let event = KubeEvent {
        config_id: monitor.config_id.clone(),
        binding: monitor.spec.name.clone(),
        watch_event,
        kind: monitor.kind.name.to_string(),
        namespace,
        name,
        object: raw,
        filter_result: monitor
            .spec
            .jq_filter
            .as_ref()
            .and_then(|_| projected.clone()),
    };
    if events_tx.send(event).await.is_err() {
        debug!(config_id = %monitor.config_id, "event channel closed");
    }
}

/// Light syntactic validation of label/field selectors: comma-separated
/// clauses of `key`, `!key`, `key=value`, `key==value` or `key!=value`.
fn validate_selector(selector: &str) -> Result<(), WatchError> {
    for clause in selector.split(',') {
        let clause = clause.trim();
        if clause.is_empty() {
            return Err(WatchError::InvalidSelector(selector.to_string()));
        }
        let bare = clause.strip_prefix('!').unwrap_or(clause);
        let key = bare
            .split_once("!=")
            .or_else(|| bare.split_once("=="))
            .or_else(|| bare.split_once('='))
            .map(|(k, _)| k)
            .unwrap_or(bare);
        if key.trim().is_empty() {
            return Err(WatchError::InvalidSelector(selector.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(kind: &str) -> MonitorSpec {
        MonitorSpec {
            name: "monitor".to_string(),
            kind: kind.to_string(),
            namespace: None,
            label_selector: None,
            field_selector: None,
            jq_filter: None,
            watch_events: vec![WatchEventType::Added, WatchEventType::Modified, WatchEventType::Deleted],
        }
    }

    #[test]
    fn add_monitor_rejects_unsupported_kind() {
        let mgr = WatchManager::new(CancellationToken::new());
        let err = mgr.add_monitor(spec("widget")).unwrap_err();
        assert!(matches!(err, WatchError::UnsupportedKind(_)));
    }

    #[test]
    fn add_monitor_rejects_bad_selector() {
        let mgr = WatchManager::new(CancellationToken::new());
        let mut s = spec("pod");
        s.label_selector = Some("=value".to_string());
        let err = mgr.add_monitor(s).unwrap_err();
        assert!(matches!(err, WatchError::InvalidSelector(_)));
    }

    #[test]
    fn add_and_stop_monitor_round_trip() {
        let mgr = WatchManager::new(CancellationToken::new());
        let id = mgr.add_monitor(spec("pod")).unwrap();
        assert_eq!(mgr.monitor_count(), 1);
        mgr.stop_monitor(&id);
        assert_eq!(mgr.monitor_count(), 0);
    }

    #[test]
    fn selector_validation_accepts_common_forms() {
        assert!(validate_selector("app=web").is_ok());
        assert!(validate_selector("app==web,tier!=db").is_ok());
        assert!(validate_selector("app,!legacy").is_ok());
        assert!(validate_selector("").is_err());
        assert!(validate_selector("a,,b").is_err());
    }

    #[test]
    fn events_receiver_is_single_consumer() {
        let mgr = WatchManager::new(CancellationToken::new());
        assert!(mgr.take_events().is_some());
        assert!(mgr.take_events().is_none());
    }
}
