//! Bosun modules: module enumeration, values layering, enablement and the
//! synchronization registry.

#![forbid(unsafe_code)]

pub mod manager;
pub mod module;
pub mod release;

use bosun_core::BindingContext;

pub use manager::{
    ConfigUpdate, ConfigValuesStore, GlobalHook, HookMatch, ModuleHook, ModuleManager,
    ModuleManagerConfig, ModulesState,
};
pub use module::Module;
pub use release::{HelmCli, ReleaseEngine};

/// Events emitted by the module manager on its own channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleEvent {
    /// Module sections of the config changed; one entry per module.
    ModulesChanged(Vec<String>),
    /// Global config values changed; every module must be reloaded.
    GlobalChanged,
    /// Recoverable internal inconsistency; the consumer enqueues a retry at
    /// the head of the main queue.
    AmbiguousState,
}

/// Everything a caller needs to build one hook task from a binding.
#[derive(Debug, Clone)]
pub struct BindingExecutionInfo {
    pub binding_name: String,
    pub binding_context: Vec<BindingContext>,
    pub queue_name: String,
    pub allow_failure: bool,
    pub wait_for_synchronization: bool,
}

/// A kubernetes binding armed for a hook, with its Synchronization batch.
#[derive(Debug, Clone)]
pub struct EnabledBinding {
    pub config_id: String,
    pub hook_name: String,
    pub info: BindingExecutionInfo,
}
