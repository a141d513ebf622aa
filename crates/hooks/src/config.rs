//! Hook binding configuration, printed by a hook invoked with `--config`.

use bosun_core::{BindingType, WatchEventType};
use serde::Deserialize;

fn default_queue() -> String {
    "main".to_string()
}

fn default_true() -> bool {
    true
}

fn default_watch_events() -> Vec<WatchEventType> {
    vec![WatchEventType::Added, WatchEventType::Modified, WatchEventType::Deleted]
}

/// One `schedule` binding.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleBinding {
    #[serde(default)]
    pub name: String,
    pub crontab: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default)]
    pub allow_failure: bool,
}

/// One `kubernetes` binding.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesBinding {
    #[serde(default)]
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub label_selector: Option<String>,
    #[serde(default)]
    pub field_selector: Option<String>,
    #[serde(default)]
    pub jq_filter: Option<String>,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default = "default_true")]
    pub wait_for_synchronization: bool,
    #[serde(default = "default_watch_events")]
    pub watch_events: Vec<WatchEventType>,
}

/// The full config document. Binding kinds absent from the document are not
/// bound. Lifecycle orders are floats, smaller runs first.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookConfig {
    pub on_startup: Option<f64>,
    pub before_all: Option<f64>,
    pub after_all: Option<f64>,
    pub before_helm: Option<f64>,
    pub after_helm: Option<f64>,
    #[serde(default)]
    pub schedule: Vec<ScheduleBinding>,
    #[serde(default)]
    pub kubernetes: Vec<KubernetesBinding>,
}

impl HookConfig {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut config: HookConfig = serde_json::from_str(text)?;
        // Unnamed bindings get positional names for log labels and contexts.
        for (i, b) in config.schedule.iter_mut().enumerate() {
            if b.name.is_empty() {
                b.name = format!("schedule-{}", i);
            }
        }
        for (i, b) in config.kubernetes.iter_mut().enumerate() {
            if b.name.is_empty() {
                b.name = format!("kubernetes-{}", i);
            }
        }
        Ok(config)
    }

    /// Lifecycle order for one binding type, when bound.
    pub fn order_for(&self, binding: BindingType) -> Option<f64> {
        match binding {
            BindingType::OnStartup => self.on_startup,
            BindingType::BeforeAll => self.before_all,
            BindingType::AfterAll => self.after_all,
            BindingType::BeforeHelm => self.before_helm,
            BindingType::AfterHelm => self.after_helm,
            _ => None,
        }
    }

    pub fn has_binding(&self, binding: BindingType) -> bool {
        match binding {
            BindingType::Schedule => !self.schedule.is_empty(),
            BindingType::OnKubernetesEvent => !self.kubernetes.is_empty(),
            other => self.order_for(other).is_some(),
        }
    }
}
