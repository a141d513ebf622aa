//! Task records handled by the queue workers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::binding::{BindingContext, BindingType};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Closed set of task types the converge machine dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    GlobalHookRun,
    ModuleHookRun,
    GlobalHookEnableKubernetesBindings,
    GlobalHookEnableScheduleBindings,
    GlobalHookWaitKubernetesSynchronization,
    ReloadAllModules,
    DiscoverModulesState,
    ModuleRun,
    ModuleDelete,
    ModulePurge,
    ModuleManagerRetry,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::GlobalHookRun => "GlobalHookRun",
            TaskType::ModuleHookRun => "ModuleHookRun",
            TaskType::GlobalHookEnableKubernetesBindings => "GlobalHookEnableKubernetesBindings",
            TaskType::GlobalHookEnableScheduleBindings => "GlobalHookEnableScheduleBindings",
            TaskType::GlobalHookWaitKubernetesSynchronization => {
                "GlobalHookWaitKubernetesSynchronization"
            }
            TaskType::ReloadAllModules => "ReloadAllModules",
            TaskType::DiscoverModulesState => "DiscoverModulesState",
            TaskType::ModuleRun => "ModuleRun",
            TaskType::ModuleDelete => "ModuleDelete",
            TaskType::ModulePurge => "ModulePurge",
            TaskType::ModuleManagerRetry => "ModuleManagerRetry",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hook-related metadata attached to a task.
#[derive(Debug, Clone, Default)]
pub struct HookMetadata {
    pub event_description: String,
    pub hook_name: String,
    pub module_name: String,
    pub binding_type: Option<BindingType>,
    pub binding_context: Vec<BindingContext>,
    pub allow_failure: bool,
    /// Run onStartup hooks during ModuleRun / seed first converge.
    pub on_startup_hooks: bool,
    /// Non-empty for Synchronization runs; key of the sync registry.
    pub kubernetes_binding_id: String,
    pub wait_for_synchronization: bool,
    pub last_after_all_hook: bool,
    /// Values checksum snapshot taken at task creation (last AfterAll task).
    pub values_checksum: String,
    pub reload_all_on_values_changes: bool,
}

/// An immutable-ish task record. Metadata is only replaced wholesale by the
/// handler (combined binding contexts); the failure counter is bumped by the
/// queue worker.
#[derive(Debug, Clone)]
pub struct Task {
    id: u64,
    task_type: TaskType,
    queue_name: String,
    log_labels: BTreeMap<String, String>,
    metadata: HookMetadata,
    failure_count: u32,
}

impl Task {
    pub fn new(task_type: TaskType) -> Self {
        Task {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            task_type,
            queue_name: "main".to_string(),
            log_labels: BTreeMap::new(),
            metadata: HookMetadata::default(),
            failure_count: 0,
        }
    }

    pub fn with_queue_name(mut self, name: &str) -> Self {
        self.queue_name = name.to_string();
        self
    }

    pub fn with_log_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.log_labels = labels;
        self
    }

    pub fn with_metadata(mut self, metadata: HookMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn log_labels(&self) -> &BTreeMap<String, String> {
        &self.log_labels
    }

    pub fn metadata(&self) -> &HookMetadata {
        &self.metadata
    }

    pub fn update_metadata(&mut self, metadata: HookMetadata) {
        self.metadata = metadata;
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn increment_failure_count(&mut self) {
        self.failure_count += 1;
    }

    /// Short description for log lines.
    pub fn describe(&self) -> String {
        let mut out = self.task_type.as_str().to_string();
        if !self.metadata.module_name.is_empty() {
            out.push_str(":");
            out.push_str(&self.metadata.module_name);
        }
        if !self.metadata.hook_name.is_empty() {
            out.push_str(":");
            out.push_str(&self.metadata.hook_name);
        }
        out
    }
}
