//! Binding kinds and the binding-context payload delivered to hooks.
//!
//! The JSON emitted for hooks is stable wire format: an array of objects,
//! each with `binding`, `type` and type-specific fields. Internally the
//! payload is a tagged variant so type-specific fields are only reachable
//! through the matching binding kind.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A declared source of hook invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindingType {
    OnStartup,
    Schedule,
    OnKubernetesEvent,
    BeforeAll,
    AfterAll,
    BeforeHelm,
    AfterHelm,
}

impl BindingType {
    /// Name used in log labels and in the `binding` field of lifecycle contexts.
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingType::OnStartup => "onStartup",
            BindingType::Schedule => "schedule",
            BindingType::OnKubernetesEvent => "kubernetes",
            BindingType::BeforeAll => "beforeAll",
            BindingType::AfterAll => "afterAll",
            BindingType::BeforeHelm => "beforeHelm",
            BindingType::AfterHelm => "afterHelm",
        }
    }
}

impl std::fmt::Display for BindingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Watch-event kinds reported by resource monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

impl std::fmt::Display for WatchEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WatchEventType::Added => "Added",
            WatchEventType::Modified => "Modified",
            WatchEventType::Deleted => "Deleted",
        };
        f.write_str(s)
    }
}

/// One object of a Synchronization batch: the projected object plus the
/// textual filter result when a projection expression was configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectAndFilterResult {
    pub object: Value,
    #[serde(rename = "filterResult", skip_serializing_if = "Option::is_none")]
    pub filter_result: Option<String>,
}

/// The payload delivered to one hook invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingContext {
    pub binding: String,
    #[serde(flatten)]
    pub payload: BindingPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BindingPayload {
    Event {
        #[serde(rename = "watchEvent")]
        watch_event: WatchEventType,
        kind: String,
        namespace: String,
        name: String,
        object: Value,
        #[serde(rename = "filterResult", skip_serializing_if = "Option::is_none")]
        filter_result: Option<String>,
    },
    Synchronization {
        objects: Vec<ObjectAndFilterResult>,
    },
    Schedule,
    OnStartup,
    BeforeAll,
    AfterAll,
    BeforeHelm,
    AfterHelm,
}

impl BindingContext {
    /// A lifecycle marker context (OnStartup, BeforeAll, ...). The `binding`
    /// field carries the binding-kind name, matching the wire contract.
    pub fn lifecycle(binding_type: BindingType) -> Self {
        let payload = match binding_type {
            BindingType::OnStartup => BindingPayload::OnStartup,
            BindingType::BeforeAll => BindingPayload::BeforeAll,
            BindingType::AfterAll => BindingPayload::AfterAll,
            BindingType::BeforeHelm => BindingPayload::BeforeHelm,
            BindingType::AfterHelm => BindingPayload::AfterHelm,
            BindingType::Schedule => BindingPayload::Schedule,
            // Kubernetes contexts always carry event data; default to an
            // empty Synchronization batch if ever built through here.
            BindingType::OnKubernetesEvent => BindingPayload::Synchronization { objects: Vec::new() },
        };
        BindingContext { binding: binding_type.as_str().to_string(), payload }
    }

    pub fn schedule(binding: &str) -> Self {
        BindingContext { binding: binding.to_string(), payload: BindingPayload::Schedule }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_context_wire_format() {
        let bc = BindingContext {
            binding: "monitor-pods".to_string(),
            payload: BindingPayload::Event {
                watch_event: WatchEventType::Modified,
                kind: "pod".to_string(),
                namespace: "ns".to_string(),
                name: "p-1".to_string(),
                object: json!({"metadata": {"name": "p-1"}}),
                filter_result: Some("{\"app\":\"x\"}".to_string()),
            },
        };
        let v = serde_json::to_value(&bc).unwrap();
        assert_eq!(v["binding"], "monitor-pods");
        assert_eq!(v["type"], "Event");
        assert_eq!(v["watchEvent"], "Modified");
        assert_eq!(v["filterResult"], "{\"app\":\"x\"}");
    }

    #[test]
    fn lifecycle_context_wire_format() {
        let bc = BindingContext::lifecycle(BindingType::BeforeAll);
        let v = serde_json::to_value(&bc).unwrap();
        assert_eq!(v, json!({"binding": "beforeAll", "type": "BeforeAll"}));
    }

    #[test]
    fn synchronization_context_wire_format() {
        let bc = BindingContext {
            binding: "monitor-pods".to_string(),
            payload: BindingPayload::Synchronization {
                objects: vec![ObjectAndFilterResult {
                    object: json!({"metadata": {"name": "a"}}),
                    filter_result: None,
                }],
            },
        };
        let v = serde_json::to_value(&bc).unwrap();
        assert_eq!(v["type"], "Synchronization");
        assert_eq!(v["objects"].as_array().unwrap().len(), 1);
        assert!(v["objects"][0].get("filterResult").is_none());
    }
}
