//! Release-resources monitor registry.
//!
//! Tracks which modules have a live monitor over their release manifests,
//! with pause/resume around hook runs and a stop-all used when global
//! values change. The polling collaborator that detects absent resources
//! reports through the event channel; the registry itself is the surface
//! the converge machine consumes.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct AbsentResourcesEvent {
    pub module_name: String,
}

#[derive(Debug)]
struct MonitorEntry {
    manifest_ids: Vec<String>,
    paused: bool,
}

pub struct ReleaseMonitors {
    monitors: Mutex<HashMap<String, MonitorEntry>>,
    tx: mpsc::UnboundedSender<AbsentResourcesEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<AbsentResourcesEvent>>>,
}

impl ReleaseMonitors {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        ReleaseMonitors { monitors: Mutex::new(HashMap::new()), tx, rx: Mutex::new(Some(rx)) }
    }

    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AbsentResourcesEvent>> {
        self.rx.lock().unwrap().take()
    }

    /// Register (or replace) the monitor for a module's release manifests.
    pub fn set_monitor(&self, module: &str, manifest_ids: Vec<String>) {
        debug!(module, manifests = manifest_ids.len(), "release monitor set");
        self.monitors
            .lock()
            .unwrap()
            .insert(module.to_string(), MonitorEntry { manifest_ids, paused: false });
    }

    pub fn has_monitor(&self, module: &str) -> bool {
        self.monitors.lock().unwrap().contains_key(module)
    }

    pub fn manifest_ids(&self, module: &str) -> Vec<String> {
        self.monitors
            .lock()
            .unwrap()
            .get(module)
            .map(|e| e.manifest_ids.clone())
            .unwrap_or_default()
    }

    pub fn pause(&self, module: &str) {
        if let Some(e) = self.monitors.lock().unwrap().get_mut(module) {
            e.paused = true;
        }
    }

    pub fn resume(&self, module: &str) {
        if let Some(e) = self.monitors.lock().unwrap().get_mut(module) {
            e.paused = false;
        }
    }

    pub fn is_paused(&self, module: &str) -> bool {
        self.monitors.lock().unwrap().get(module).map(|e| e.paused).unwrap_or(false)
    }

    pub fn remove(&self, module: &str) {
        self.monitors.lock().unwrap().remove(module);
    }

    /// Drop every monitor; used before a reload-all.
    pub fn stop_all(&self) {
        let mut monitors = self.monitors.lock().unwrap();
        if !monitors.is_empty() {
            info!(count = monitors.len(), "stopping release monitors");
        }
        monitors.clear();
    }

    /// Report resources missing from a module's release (collaborator API).
    pub fn report_absent(&self, module: &str) {
        let _ = self.tx.send(AbsentResourcesEvent { module_name: module.to_string() });
    }
}

impl Default for ReleaseMonitors {
    fn default() -> Self {
        ReleaseMonitors::new()
    }
}
