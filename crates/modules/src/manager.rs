//! The module manager.
//!
//! Owns the module index, the layered values trees, the hook registry, the
//! kubernetes-binding routing table and the synchronization registry. All
//! shared state sits behind one mutex held only for single
//! read-modify-write sections; no lock is held across a hook invocation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bosun_core::{BindingContext, BindingPayload, BindingType, Values};
use bosun_hooks::{HookConfig, HookExecutor, HookInput, KubernetesBinding};
use bosun_watch::{KubeEvent, MonitorSpec, WatchManager};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::module::{camelcase, Module};
use crate::release::ReleaseEngine;
use crate::{BindingExecutionInfo, EnabledBinding, ModuleEvent};

/// Persistence seam for hook config-values patches (the values ConfigMap
/// reconciler implements this).
#[async_trait]
pub trait ConfigValuesStore: Send + Sync {
    async fn save_global(&self, values: &Values) -> Result<()>;
    async fn save_module(&self, module: &str, values: &Values) -> Result<()>;
}

/// A raw config update: YAML per section, parsed while applying so a bad
/// section surfaces as a recoverable ambiguous state.
#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub global: Option<String>,
    pub modules: BTreeMap<String, String>,
}

/// Result of `discover_modules_state`: three disjoint sets plus the newly
/// enabled subset. Deterministic for identical inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModulesState {
    pub enabled_modules: Vec<String>,
    pub newly_enabled_modules: Vec<String>,
    pub modules_to_disable: Vec<String>,
    pub released_unknown_modules: Vec<String>,
}

/// A hook selected for one event, with everything needed to build its task.
#[derive(Debug, Clone)]
pub enum HookMatch {
    Global { hook_name: String, info: BindingExecutionInfo },
    Module { module_name: String, hook_name: String, info: BindingExecutionInfo },
}

#[derive(Debug, Clone)]
pub struct GlobalHook {
    pub name: String,
    pub path: PathBuf,
    pub config: HookConfig,
}

#[derive(Debug, Clone)]
pub struct ModuleHook {
    pub name: String,
    pub module_name: String,
    pub path: PathBuf,
    pub config: HookConfig,
}

#[derive(Debug, Clone)]
enum HookOwner {
    Global { hook: String },
    Module { module: String, hook: String },
}

#[derive(Debug, Clone)]
struct KubeBindingRef {
    owner: HookOwner,
    binding: KubernetesBinding,
}

#[derive(Debug, Clone)]
struct SyncState {
    module: Option<String>,
    wait: bool,
    done: bool,
}

#[derive(Default)]
struct Inner {
    modules: BTreeMap<String, Module>,
    /// Disk order: numeric directory prefix ascending.
    module_order: Vec<String>,
    global_hooks: BTreeMap<String, GlobalHook>,
    module_hooks: BTreeMap<String, ModuleHook>,

    global_static: Values,
    global_config: Values,
    global_dynamic: Values,
    module_config: BTreeMap<String, Values>,
    module_dynamic: BTreeMap<String, Values>,
    /// `enabled` flags carried by config sections.
    config_enabled: BTreeMap<String, bool>,

    enabled_modules: Vec<String>,
    kube_bindings: HashMap<String, KubeBindingRef>,
    sync_states: HashMap<String, SyncState>,
    pending_config: Option<ConfigUpdate>,
}

pub struct ModuleManagerConfig {
    pub modules_dir: PathBuf,
    pub global_hooks_dir: PathBuf,
    pub tmp_dir: PathBuf,
}

pub struct ModuleManager {
    cfg: ModuleManagerConfig,
    watch: Arc<WatchManager>,
    executor: HookExecutor,
    release: Arc<dyn ReleaseEngine>,
    config_store: Arc<dyn ConfigValuesStore>,
    events_tx: mpsc::UnboundedSender<ModuleEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ModuleEvent>>>,
    inner: Mutex<Inner>,
}

impl ModuleManager {
    pub fn new(
        cfg: ModuleManagerConfig,
        watch: Arc<WatchManager>,
        release: Arc<dyn ReleaseEngine>,
        config_store: Arc<dyn ConfigValuesStore>,
    ) -> Self {
        let executor = HookExecutor::new(&cfg.tmp_dir);
        let (tx, rx) = mpsc::unbounded_channel();
        ModuleManager {
            cfg,
            watch,
            executor,
            release,
            config_store,
            events_tx: tx,
            events_rx: Mutex::new(Some(rx)),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Take the event receiver. Single consumer.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ModuleEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    /// Index modules and hooks from disk. Hook `--config` errors are fatal.
    pub async fn init(&self) -> Result<()> {
        info!(modules_dir = %self.cfg.modules_dir.display(), global_hooks_dir = %self.cfg.global_hooks_dir.display(), "initializing module manager");
        std::fs::create_dir_all(&self.cfg.tmp_dir)
            .with_context(|| format!("creating {}", self.cfg.tmp_dir.display()))?;

        let global_static = read_global_static_values(&self.cfg.modules_dir)?;

        // Modules: directory entries matching the prefix pattern, in name
        // order (numeric prefix gives the execution order).
        let mut modules = BTreeMap::new();
        let mut module_order = Vec::new();
        if self.cfg.modules_dir.exists() {
            let mut entries: Vec<String> = std::fs::read_dir(&self.cfg.modules_dir)
                .with_context(|| format!("listing {}", self.cfg.modules_dir.display()))?
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .filter_map(|e| e.file_name().into_string().ok())
                .collect();
            entries.sort();
            for dir_name in entries {
                match Module::load(&self.cfg.modules_dir, &dir_name)? {
                    Some(m) => {
                        info!(module = %m.name, "module found");
                        module_order.push(m.name.clone());
                        modules.insert(m.name.clone(), m);
                    }
                    None => {
                        warn!(dir = %dir_name, "ignoring directory not matching NNN-<name>");
                    }
                }
            }
        }

        // Global hooks.
        let mut global_hooks = BTreeMap::new();
        for path in collect_executables(&self.cfg.global_hooks_dir)? {
            let name = hook_name_for(&self.cfg.global_hooks_dir, &path);
            let config = self.executor.detect_config(&path).await?;
            info!(hook = %name, "global hook registered");
            global_hooks.insert(name.clone(), GlobalHook { name, path, config });
        }

        // Module hooks.
        let mut module_hooks = BTreeMap::new();
        for m in modules.values() {
            for path in collect_executables(&m.hooks_dir())? {
                let name = format!("{}/{}", m.name, hook_name_for(&m.hooks_dir(), &path));
                let config = self.executor.detect_config(&path).await?;
                info!(module = %m.name, hook = %name, "module hook registered");
                module_hooks.insert(
                    name.clone(),
                    ModuleHook { name, module_name: m.name.clone(), path, config },
                );
            }
        }

        let mut inner = self.inner.lock().unwrap();
        inner.global_static = global_static;
        inner.modules = modules;
        inner.module_order = module_order;
        inner.global_hooks = global_hooks;
        inner.module_hooks = module_hooks;
        Ok(())
    }

    // ---- hook lookups -------------------------------------------------

    pub fn get_global_hook(&self, name: &str) -> Option<GlobalHook> {
        self.inner.lock().unwrap().global_hooks.get(name).cloned()
    }

    pub fn get_module_hook(&self, name: &str) -> Option<ModuleHook> {
        self.inner.lock().unwrap().module_hooks.get(name).cloned()
    }

    pub fn get_module_names_in_order(&self) -> Vec<String> {
        self.inner.lock().unwrap().module_order.clone()
    }

    pub fn enabled_modules(&self) -> Vec<String> {
        self.inner.lock().unwrap().enabled_modules.clone()
    }

    /// Global hooks carrying a binding, lifecycle order first, then name.
    pub fn get_global_hooks_in_order(&self, binding: BindingType) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        hooks_in_order(inner.global_hooks.values().map(|h| (&h.name, &h.config)), binding)
    }

    pub fn get_module_hooks_in_order(&self, module: &str, binding: BindingType) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        hooks_in_order(
            inner
                .module_hooks
                .values()
                .filter(|h| h.module_name == module)
                .map(|h| (&h.name, &h.config)),
            binding,
        )
    }

    /// Every queue name referenced by any hook binding.
    pub fn hook_queue_names(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut names: HashSet<String> = HashSet::new();
        let configs = inner
            .global_hooks
            .values()
            .map(|h| &h.config)
            .chain(inner.module_hooks.values().map(|h| &h.config));
        for c in configs {
            for b in c.schedule.iter() {
                names.insert(b.queue.clone());
            }
            for b in c.kubernetes.iter() {
                names.insert(b.queue.clone());
            }
        }
        let mut out: Vec<String> = names.into_iter().collect();
        out.sort();
        out
    }

    // ---- values -------------------------------------------------------

    pub fn global_config_values(&self) -> Values {
        self.inner.lock().unwrap().global_config.clone()
    }

    pub fn global_values(&self) -> Values {
        let inner = self.inner.lock().unwrap();
        global_effective(&inner)
    }

    pub fn global_values_checksum(&self) -> String {
        self.global_values().checksum()
    }

    pub fn module_config_values(&self, module: &str) -> Values {
        self.inner.lock().unwrap().module_config.get(module).cloned().unwrap_or_default()
    }

    pub fn module_values(&self, module: &str) -> Values {
        let inner = self.inner.lock().unwrap();
        module_effective(&inner, module)
    }

    // ---- synchronization registry ------------------------------------

    /// Register a queued Synchronization run for a binding id.
    pub fn synchronization_queued(&self, binding_id: &str, module: Option<&str>, wait: bool) {
        debug!(binding_id, module = module.unwrap_or("global"), wait, "synchronization queued");
        self.inner.lock().unwrap().sync_states.insert(
            binding_id.to_string(),
            SyncState { module: module.map(|m| m.to_string()), wait, done: false },
        );
    }

    pub fn synchronization_done(&self, binding_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        match inner.sync_states.get_mut(binding_id) {
            Some(s) => {
                debug!(binding_id, "synchronization done");
                s.done = true;
            }
            None => debug!(binding_id, "synchronization done for unregistered binding"),
        }
    }

    /// Any global hook kubernetes binding that wants to be waited for.
    pub fn global_synchronization_needed(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .global_hooks
            .values()
            .any(|h| h.config.kubernetes.iter().any(|b| b.wait_for_synchronization))
    }

    pub fn global_synchronization_done(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .sync_states
            .values()
            .filter(|s| s.module.is_none() && s.wait)
            .all(|s| s.done)
    }

    pub fn module_synchronization_needed(&self, module: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .module_hooks
            .values()
            .any(|h| h.module_name == module && !h.config.kubernetes.is_empty())
    }

    pub fn module_synchronization_queued(&self, module: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.sync_states.values().any(|s| s.module.as_deref() == Some(module))
    }

    pub fn module_synchronization_done(&self, module: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        let mut any = false;
        let all_done = inner
            .sync_states
            .values()
            .filter(|s| s.module.as_deref() == Some(module))
            .all(|s| {
                any = true;
                !s.wait || s.done
            });
        any && all_done
    }

    // ---- event routing ------------------------------------------------

    /// Route a change signal to its owning hook.
    pub fn handle_kube_event(&self, ev: &KubeEvent) -> Option<HookMatch> {
        let inner = self.inner.lock().unwrap();
        let binding_ref = match inner.kube_bindings.get(&ev.config_id) {
            Some(r) => r.clone(),
            None => {
                warn!(config_id = %ev.config_id, "kube event for unknown monitor");
                return None;
            }
        };
        drop(inner);

        let ctx = BindingContext {
            binding: ev.binding.clone(),
            payload: BindingPayload::Event {
                watch_event: ev.watch_event,
                kind: ev.kind.clone(),
                namespace: ev.namespace.clone(),
                name: ev.name.clone(),
                object: ev.object.clone(),
                filter_result: ev.filter_result.clone(),
            },
        };
        let info = BindingExecutionInfo {
            binding_name: binding_ref.binding.name.clone(),
            binding_context: vec![ctx],
            queue_name: binding_ref.binding.queue.clone(),
            allow_failure: binding_ref.binding.allow_failure,
            wait_for_synchronization: false,
        };
        Some(match binding_ref.owner {
            HookOwner::Global { hook } => HookMatch::Global { hook_name: hook, info },
            HookOwner::Module { module, hook } => {
                HookMatch::Module { module_name: module, hook_name: hook, info }
            }
        })
    }

    /// All hooks bound to the given crontab; module hooks only for enabled
    /// modules.
    pub fn handle_schedule_event(&self, crontab: &str) -> Vec<HookMatch> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        for h in inner.global_hooks.values() {
            for b in h.config.schedule.iter().filter(|b| b.crontab == crontab) {
                out.push(HookMatch::Global {
                    hook_name: h.name.clone(),
                    info: BindingExecutionInfo {
                        binding_name: b.name.clone(),
                        binding_context: vec![BindingContext::schedule(&b.name)],
                        queue_name: b.queue.clone(),
                        allow_failure: b.allow_failure,
                        wait_for_synchronization: false,
                    },
                });
            }
        }
        for h in inner.module_hooks.values() {
            if !inner.enabled_modules.contains(&h.module_name) {
                continue;
            }
            for b in h.config.schedule.iter().filter(|b| b.crontab == crontab) {
                out.push(HookMatch::Module {
                    module_name: h.module_name.clone(),
                    hook_name: h.name.clone(),
                    info: BindingExecutionInfo {
                        binding_name: b.name.clone(),
                        binding_context: vec![BindingContext::schedule(&b.name)],
                        queue_name: b.queue.clone(),
                        allow_failure: b.allow_failure,
                        wait_for_synchronization: false,
                    },
                });
            }
        }
        out
    }

    /// Crontabs declared by a module's hooks.
    pub fn module_schedule_crontabs(&self, module: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut out: HashSet<String> = HashSet::new();
        for h in inner.module_hooks.values().filter(|h| h.module_name == module) {
            out.extend(h.config.schedule.iter().map(|b| b.crontab.clone()));
        }
        let mut v: Vec<String> = out.into_iter().collect();
        v.sort();
        v
    }

    /// Crontabs of every hook that is currently in force: global hooks
    /// always, module hooks for enabled modules.
    pub fn active_crontabs(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut out: HashSet<String> = HashSet::new();
        for h in inner.global_hooks.values() {
            out.extend(h.config.schedule.iter().map(|b| b.crontab.clone()));
        }
        for h in inner.module_hooks.values() {
            if inner.enabled_modules.contains(&h.module_name) {
                out.extend(h.config.schedule.iter().map(|b| b.crontab.clone()));
            }
        }
        let mut v: Vec<String> = out.into_iter().collect();
        v.sort();
        v
    }

    // ---- kubernetes binding enabling ---------------------------------

    /// Create and baseline monitors for every kubernetes binding of a
    /// global hook. Streams stay unarmed until `start_monitors`.
    pub async fn enable_global_kubernetes_bindings(
        &self,
        hook_name: &str,
    ) -> Result<Vec<EnabledBinding>> {
        let hook = self
            .get_global_hook(hook_name)
            .ok_or_else(|| anyhow!("unknown global hook '{}'", hook_name))?;
        self.enable_kubernetes_bindings(
            &hook.config.kubernetes,
            HookOwner::Global { hook: hook_name.to_string() },
        )
        .await
    }

    pub async fn enable_module_kubernetes_bindings(
        &self,
        module_name: &str,
    ) -> Result<Vec<EnabledBinding>> {
        let hooks: Vec<ModuleHook> = {
            let inner = self.inner.lock().unwrap();
            inner
                .module_hooks
                .values()
                .filter(|h| h.module_name == module_name)
                .cloned()
                .collect()
        };
        let mut out = Vec::new();
        for h in hooks {
            let enabled = self
                .enable_kubernetes_bindings(
                    &h.config.kubernetes,
                    HookOwner::Module { module: module_name.to_string(), hook: h.name.clone() },
                )
                .await?;
            out.extend(enabled);
        }
        Ok(out)
    }

    async fn enable_kubernetes_bindings(
        &self,
        bindings: &[KubernetesBinding],
        owner: HookOwner,
    ) -> Result<Vec<EnabledBinding>> {
        let hook_name = match &owner {
            HookOwner::Global { hook } => hook.clone(),
            HookOwner::Module { hook, .. } => hook.clone(),
        };
        let mut out = Vec::new();
        for b in bindings {
            let spec = MonitorSpec {
                name: b.name.clone(),
                kind: b.kind.clone(),
                namespace: b.namespace.clone(),
                label_selector: b.label_selector.clone(),
                field_selector: b.field_selector.clone(),
                jq_filter: b.jq_filter.clone(),
                watch_events: b.watch_events.clone(),
            };
            let config_id = self.watch.add_monitor(spec)?;
            let objects = self.watch.snapshot(&config_id).await?;
            self.inner
                .lock()
                .unwrap()
                .kube_bindings
                .insert(config_id.clone(), KubeBindingRef { owner: owner.clone(), binding: b.clone() });
            let ctx = BindingContext {
                binding: b.name.clone(),
                payload: BindingPayload::Synchronization { objects },
            };
            out.push(EnabledBinding {
                config_id,
                hook_name: hook_name.clone(),
                info: BindingExecutionInfo {
                    binding_name: b.name.clone(),
                    binding_context: vec![ctx],
                    queue_name: b.queue.clone(),
                    allow_failure: b.allow_failure,
                    wait_for_synchronization: b.wait_for_synchronization,
                },
            });
        }
        Ok(out)
    }

    /// Arm every baselined monitor (change handler attaches to the stream).
    pub async fn start_monitors(&self) -> Result<()> {
        self.watch.start().await
    }

    /// Stop monitors owned by a module's hooks and drop its sync state.
    pub fn disable_module_hooks(&self, module_name: &str) {
        let ids: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            inner
                .kube_bindings
                .iter()
                .filter(|(_, r)| matches!(&r.owner, HookOwner::Module { module, .. } if module == module_name))
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids.iter() {
            self.watch.stop_monitor(id);
        }
        let mut inner = self.inner.lock().unwrap();
        for id in ids.iter() {
            inner.kube_bindings.remove(id);
        }
        inner.sync_states.retain(|_, s| s.module.as_deref() != Some(module_name));
    }

    // ---- hook execution ----------------------------------------------

    /// Run a global hook; returns the global values checksum before and
    /// after, for the reload-all trigger rules.
    pub async fn run_global_hook(
        &self,
        hook_name: &str,
        contexts: &[BindingContext],
    ) -> Result<(String, String)> {
        let hook = self
            .get_global_hook(hook_name)
            .ok_or_else(|| anyhow!("unknown global hook '{}'", hook_name))?;
        let (values_doc, config_doc, before) = {
            let inner = self.inner.lock().unwrap();
            let eff = global_effective(&inner);
            (
                wrap("global", &eff),
                wrap("global", &inner.global_config),
                eff.checksum(),
            )
        };

        let out = self
            .executor
            .execute(HookInput {
                hook_path: &hook.path,
                working_dir: hook.path.parent().unwrap_or(&self.cfg.global_hooks_dir),
                binding_contexts: contexts,
                values: &values_doc,
                config_values: &config_doc,
                extra_env: vec![],
            })
            .await?;

        let mut persist_global: Option<Values> = None;
        let after = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(p) = out.config_values_patch.as_ref() {
                let mut doc = wrap("global", &inner.global_config);
                doc.apply_patch(p).context("applying config values patch")?;
                inner.global_config = unwrap(&doc, "global")?;
                persist_global = Some(inner.global_config.clone());
            }
            if let Some(p) = out.values_patch.as_ref() {
                let mut doc = wrap("global", &inner.global_dynamic);
                doc.apply_patch(p).context("applying values patch")?;
                inner.global_dynamic = unwrap(&doc, "global")?;
            }
            global_effective(&inner).checksum()
        };
        if let Some(v) = persist_global {
            self.config_store.save_global(&v).await?;
        }
        debug!(hook = %hook_name, before = %before, after = %after, "global hook done");
        Ok((before, after))
    }

    /// Run a module hook; returns whether the module's effective values
    /// changed.
    pub async fn run_module_hook(
        &self,
        hook_name: &str,
        contexts: &[BindingContext],
    ) -> Result<bool> {
        let hook = self
            .get_module_hook(hook_name)
            .ok_or_else(|| anyhow!("unknown module hook '{}'", hook_name))?;
        let module_name = hook.module_name.clone();
        let section = camelcase(&module_name);
        let (module_path, values_doc, config_doc, before) = {
            let inner = self.inner.lock().unwrap();
            let module = inner
                .modules
                .get(&module_name)
                .ok_or_else(|| anyhow!("unknown module '{}'", module_name))?;
            let global_eff = global_effective(&inner);
            let module_eff = module_effective(&inner, &module_name);
            let mut values_doc = wrap("global", &global_eff);
            values_doc.0.insert(section.clone(), module_eff.as_value());
            let mut config_doc = wrap("global", &inner.global_config);
            config_doc.0.insert(
                section.clone(),
                inner.module_config.get(&module_name).cloned().unwrap_or_default().as_value(),
            );
            (module.path.clone(), values_doc, config_doc, module_eff.checksum())
        };

        let out = self
            .executor
            .execute(HookInput {
                hook_path: &hook.path,
                working_dir: &module_path,
                binding_contexts: contexts,
                values: &values_doc,
                config_values: &config_doc,
                extra_env: vec![],
            })
            .await?;

        let mut persist_module: Option<Values> = None;
        let mut persist_global: Option<Values> = None;
        let after = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(p) = out.config_values_patch.as_ref() {
                let mut doc = wrap("global", &inner.global_config);
                doc.0.insert(
                    section.clone(),
                    inner.module_config.get(&module_name).cloned().unwrap_or_default().as_value(),
                );
                doc.apply_patch(p).context("applying config values patch")?;
                let new_global = unwrap(&doc, "global")?;
                let new_module = unwrap(&doc, &section)?;
                if new_global != inner.global_config {
                    inner.global_config = new_global.clone();
                    persist_global = Some(new_global);
                }
                inner.module_config.insert(module_name.clone(), new_module.clone());
                persist_module = Some(new_module);
            }
            if let Some(p) = out.values_patch.as_ref() {
                let mut doc = wrap("global", &inner.global_dynamic);
                doc.0.insert(
                    section.clone(),
                    inner.module_dynamic.get(&module_name).cloned().unwrap_or_default().as_value(),
                );
                doc.apply_patch(p).context("applying values patch")?;
                inner.global_dynamic = unwrap(&doc, "global")?;
                let new_dynamic = unwrap(&doc, &section)?;
                inner.module_dynamic.insert(module_name.clone(), new_dynamic);
            }
            module_effective(&inner, &module_name).checksum()
        };
        if let Some(v) = persist_module {
            self.config_store.save_module(&module_name, &v).await?;
        }
        if let Some(v) = persist_global {
            self.config_store.save_global(&v).await?;
        }
        Ok(before != after)
    }

    /// Run a module's onStartup hooks in order.
    pub async fn run_module_on_startup(&self, module_name: &str) -> Result<()> {
        for hook in self.get_module_hooks_in_order(module_name, BindingType::OnStartup) {
            self.run_module_hook(&hook, &[BindingContext::lifecycle(BindingType::OnStartup)])
                .await?;
        }
        Ok(())
    }

    /// Run a module: beforeHelm hooks, release install/upgrade, afterHelm
    /// hooks. Returns whether afterHelm changed values, and the manifest
    /// ids when a release was installed.
    pub async fn run_module(&self, module_name: &str) -> Result<(bool, Option<Vec<String>>)> {
        let (module_path, has_chart) = {
            let inner = self.inner.lock().unwrap();
            let m = inner
                .modules
                .get(module_name)
                .ok_or_else(|| anyhow!("unknown module '{}'", module_name))?;
            (m.path.clone(), m.has_chart)
        };

        if has_chart {
            self.release.delete_single_failed_revision(module_name).await?;
        }

        for hook in self.get_module_hooks_in_order(module_name, BindingType::BeforeHelm) {
            self.run_module_hook(&hook, &[BindingContext::lifecycle(BindingType::BeforeHelm)])
                .await?;
        }

        let manifests = if has_chart {
            let values_path = self.write_release_values(module_name)?;
            let ids = self.release.install_or_upgrade(module_name, &module_path, &values_path).await;
            let _ = std::fs::remove_file(&values_path);
            Some(ids?)
        } else {
            None
        };

        let before = self.module_values(module_name).checksum();
        for hook in self.get_module_hooks_in_order(module_name, BindingType::AfterHelm) {
            self.run_module_hook(&hook, &[BindingContext::lifecycle(BindingType::AfterHelm)])
                .await?;
        }
        let after = self.module_values(module_name).checksum();
        Ok((before != after, manifests))
    }

    pub fn set_module_ready(&self, module_name: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(m) = inner.modules.get_mut(module_name) {
            m.is_ready = true;
        }
    }

    /// Tear a module down: delete its release, stop its monitors, drop its
    /// dynamic state.
    pub async fn delete_module(&self, module_name: &str) -> Result<()> {
        let has_chart = {
            let inner = self.inner.lock().unwrap();
            inner.modules.get(module_name).map(|m| m.has_chart).unwrap_or(false)
        };
        if has_chart {
            self.release.delete(module_name).await?;
        }
        self.disable_module_hooks(module_name);
        let mut inner = self.inner.lock().unwrap();
        inner.module_dynamic.remove(module_name);
        inner.enabled_modules.retain(|m| m != module_name);
        if let Some(m) = inner.modules.get_mut(module_name) {
            m.is_ready = false;
        }
        Ok(())
    }

    fn write_release_values(&self, module_name: &str) -> Result<PathBuf> {
        let doc = {
            let inner = self.inner.lock().unwrap();
            let mut doc = wrap("global", &global_effective(&inner));
            doc.0.insert(
                camelcase(module_name),
                module_effective(&inner, module_name).as_value(),
            );
            doc
        };
        let path = self.cfg.tmp_dir.join(format!("release-values-{}.yaml", module_name));
        let yaml = serde_yaml::to_string(&doc.as_value()).context("serializing release values")?;
        std::fs::write(&path, yaml).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    // ---- discovery ----------------------------------------------------

    /// Compute the enabled set in disk order. Deterministic for identical
    /// inputs: iteration follows the module order, sets come out sorted.
    pub async fn discover_modules_state(&self) -> Result<ModulesState> {
        let (order, prev_enabled) = {
            let inner = self.inner.lock().unwrap();
            (inner.module_order.clone(), inner.enabled_modules.clone())
        };

        let mut enabled: Vec<String> = Vec::new();
        for name in order.iter() {
            let (module, declared) = {
                let inner = self.inner.lock().unwrap();
                let m = inner
                    .modules
                    .get(name)
                    .ok_or_else(|| anyhow!("module '{}' disappeared from index", name))?
                    .clone();
                let declared = inner
                    .config_enabled
                    .get(name)
                    .copied()
                    .or(m.static_enabled)
                    .unwrap_or(true);
                (m, declared)
            };
            if !declared {
                debug!(module = %name, "disabled by config");
                continue;
            }
            if module.check_enabled_script(&enabled, &self.cfg.tmp_dir).await? {
                enabled.push(name.clone());
            }
        }

        let releases = self.release.list_releases().await?;
        let known: HashSet<&String> = order.iter().collect();
        let mut released_unknown: Vec<String> =
            releases.iter().filter(|r| !known.contains(r)).cloned().collect();
        released_unknown.sort();

        let modules_to_disable: Vec<String> = order
            .iter()
            .filter(|m| !enabled.contains(*m))
            .filter(|m| prev_enabled.contains(*m) || releases.contains(*m))
            .cloned()
            .collect();
        let newly_enabled: Vec<String> =
            enabled.iter().filter(|m| !prev_enabled.contains(*m)).cloned().collect();

        self.inner.lock().unwrap().enabled_modules = enabled.clone();
        info!(
            enabled = enabled.len(),
            newly_enabled = newly_enabled.len(),
            to_disable = modules_to_disable.len(),
            released_unknown = released_unknown.len(),
            "modules state discovered"
        );
        Ok(ModulesState {
            enabled_modules: enabled,
            newly_enabled_modules: newly_enabled,
            modules_to_disable,
            released_unknown_modules: released_unknown,
        })
    }

    // ---- config updates ----------------------------------------------

    /// Apply a config update. At startup (`initial`) any bad section is
    /// fatal. At runtime a failure after at least one applied section
    /// stashes the update and emits `AmbiguousState`; a failure with
    /// nothing applied is logged and the update dropped.
    pub fn apply_config(&self, update: ConfigUpdate, initial: bool) -> Result<()> {
        let mut applied_any = false;
        let mut global_changed = false;
        let mut changed_modules: Vec<String> = Vec::new();

        let apply = |this: &Self,
                     applied_any: &mut bool,
                     global_changed: &mut bool,
                     changed_modules: &mut Vec<String>|
         -> Result<()> {
            if let Some(text) = update.global.as_deref() {
                let values = Values::from_yaml(text).context("bad global config section")?;
                let mut inner = this.inner.lock().unwrap();
                if values.checksum() != inner.global_config.checksum() {
                    inner.global_config = values;
                    *global_changed = true;
                }
                *applied_any = true;
            }
            for (name, text) in update.modules.iter() {
                let mut values = Values::from_yaml(text)
                    .with_context(|| format!("bad config section for module '{}'", name))?;
                let enabled = match values.0.remove("enabled") {
                    Some(Value::Bool(b)) => Some(b),
                    Some(other) => {
                        return Err(anyhow!(
                            "module '{}': non-boolean 'enabled' key: {}",
                            name,
                            other
                        ))
                    }
                    None => None,
                };
                let mut inner = this.inner.lock().unwrap();
                if !inner.modules.contains_key(name) {
                    warn!(module = %name, "config section for unknown module");
                }
                let prev_checksum =
                    inner.module_config.get(name).cloned().unwrap_or_default().checksum();
                let prev_enabled = inner.config_enabled.get(name).copied();
                if values.checksum() != prev_checksum || enabled != prev_enabled {
                    changed_modules.push(name.clone());
                }
                inner.module_config.insert(name.clone(), values);
                match enabled {
                    Some(b) => {
                        inner.config_enabled.insert(name.clone(), b);
                    }
                    None => {
                        inner.config_enabled.remove(name);
                    }
                }
                *applied_any = true;
            }
            Ok(())
        };

        match apply(self, &mut applied_any, &mut global_changed, &mut changed_modules) {
            Ok(()) => {
                self.inner.lock().unwrap().pending_config = None;
                if !initial {
                    if global_changed {
                        self.emit(ModuleEvent::GlobalChanged);
                    } else if !changed_modules.is_empty() {
                        self.emit(ModuleEvent::ModulesChanged(changed_modules));
                    }
                }
                Ok(())
            }
            Err(e) if initial => Err(e),
            Err(e) => {
                if applied_any {
                    // Mixed state: stash for ModuleManagerRetry.
                    error!(error = %format!("{:#}", e), "config update partially applied");
                    self.inner.lock().unwrap().pending_config = Some(update);
                    self.emit(ModuleEvent::AmbiguousState);
                } else {
                    error!(error = %format!("{:#}", e), "config update rejected");
                }
                Ok(())
            }
        }
    }

    /// Re-apply a stashed partially-applied config update.
    pub fn retry(&self) {
        let pending = self.inner.lock().unwrap().pending_config.take();
        match pending {
            Some(update) => {
                info!("retrying pending config update");
                let _ = self.apply_config(update, false);
            }
            None => debug!("retry requested with no pending config update"),
        }
    }

    fn emit(&self, ev: ModuleEvent) {
        let _ = self.events_tx.send(ev);
    }
}

// ---- free helpers -----------------------------------------------------

fn global_effective(inner: &Inner) -> Values {
    Values::merged(&[&inner.global_static, &inner.global_config, &inner.global_dynamic])
}

fn module_effective(inner: &Inner, module: &str) -> Values {
    let empty = Values::new();
    let static_v = inner.modules.get(module).map(|m| &m.static_values).unwrap_or(&empty);
    let config_v = inner.module_config.get(module).unwrap_or(&empty);
    let dynamic_v = inner.module_dynamic.get(module).unwrap_or(&empty);
    Values::merged(&[static_v, config_v, dynamic_v])
}

fn wrap(key: &str, values: &Values) -> Values {
    let mut doc = Values::new();
    doc.0.insert(key.to_string(), values.as_value());
    doc
}

fn unwrap(doc: &Values, key: &str) -> Result<Values> {
    match doc.get(key) {
        Some(v) => Values::from_value(v.clone())
            .with_context(|| format!("section '{}' is not a mapping", key)),
        None => Ok(Values::new()),
    }
}

fn read_global_static_values(modules_dir: &Path) -> Result<Values> {
    let path = modules_dir.join("values.yaml");
    if !path.exists() {
        return Ok(Values::new());
    }
    let text =
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    Values::from_yaml(&text).with_context(|| format!("bad {}", path.display()))
}

/// Executable files under a directory tree, sorted for determinism.
fn collect_executables(dir: &Path) -> Result<Vec<PathBuf>> {
    use std::os::unix::fs::PermissionsExt;
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        for entry in std::fs::read_dir(&d).with_context(|| format!("listing {}", d.display()))? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if entry.metadata()?.permissions().mode() & 0o111 != 0 {
                out.push(path);
            } else {
                warn!(file = %path.display(), "ignoring non-executable file");
            }
        }
    }
    out.sort();
    Ok(out)
}

fn hook_name_for(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

/// Hooks carrying a binding, lifecycle order first (smaller first), then
/// name.
fn hooks_in_order<'a>(
    hooks: impl Iterator<Item = (&'a String, &'a HookConfig)>,
    binding: BindingType,
) -> Vec<String> {
    let mut selected: Vec<(f64, String)> = hooks
        .filter(|(_, c)| c.has_binding(binding))
        .map(|(n, c)| (c.order_for(binding).unwrap_or(0.0), n.clone()))
        .collect();
    selected.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal).then(a.1.cmp(&b.1)));
    selected.into_iter().map(|(_, n)| n).collect()
}
