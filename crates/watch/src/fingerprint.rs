//! Per-monitor fingerprint tables.
//!
//! The stored table is the authority for "has the projection changed?";
//! resourceVersion is deliberately not consulted, so resync re-deliveries
//! with an unchanged projection never produce a signal.

use bosun_core::WatchEventType;
use rustc_hash::FxHashMap;

/// Identity of a watched object inside one monitor.
pub fn resource_id(name: &str, namespace: &str) -> String {
    format!("name={} namespace={}", name, namespace)
}

#[derive(Debug, Default)]
pub struct FingerprintTable {
    checksums: FxHashMap<String, String>,
}

impl FingerprintTable {
    pub fn new() -> Self {
        FingerprintTable::default()
    }

    pub fn len(&self) -> usize {
        self.checksums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checksums.is_empty()
    }

    /// Store the baseline fingerprint computed from the initial list.
    pub fn seed(&mut self, id: String, checksum: String) {
        self.checksums.insert(id, checksum);
    }

    /// Record one delivery and decide whether a change signal is due.
    /// `report` is whether the monitor is configured to emit this event kind.
    pub fn observe(&mut self, event: WatchEventType, id: &str, checksum: &str, report: bool) -> bool {
        match event {
            WatchEventType::Added | WatchEventType::Modified => {
                let changed = self.checksums.get(id).map(String::as_str) != Some(checksum);
                if changed {
                    self.checksums.insert(id.to_string(), checksum.to_string());
                }
                changed && report
            }
            WatchEventType::Deleted => {
                self.checksums.remove(id);
                report
            }
        }
    }

    /// Whether the table already holds an entry; used to classify an
    /// Applied delivery as Added or Modified.
    pub fn contains(&self, id: &str) -> bool {
        self.checksums.contains_key(id)
    }
}
