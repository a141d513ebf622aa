//! Bosun operator: converge state machine, task handler and the event
//! plumbing between watchers, schedules, config source and task queues.

#![forbid(unsafe_code)]

pub mod converge;
pub mod kube_config;
pub mod metrics;
pub mod releases;
pub mod schedule;
pub mod server;
pub mod task_handler;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bosun_core::{BindingContext, BindingType, HookMetadata, Task, TaskType};
use bosun_modules::{
    ConfigValuesStore, HelmCli, HookMatch, ModuleEvent, ModuleManager, ModuleManagerConfig,
    ReleaseEngine,
};
use bosun_queue::{QueueDelays, TaskQueueSet};
use bosun_watch::WatchManager;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use converge::ConvergeState;
use kube_config::KubeConfigManager;
use releases::ReleaseMonitors;
use schedule::ScheduleManager;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub modules_dir: PathBuf,
    pub global_hooks_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub namespace: String,
    pub config_map_name: String,
    pub listen_addr: SocketAddr,
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self> {
        Ok(OperatorConfig {
            modules_dir: PathBuf::from(env_or("BOSUN_MODULES_DIR", "modules")),
            global_hooks_dir: PathBuf::from(env_or("BOSUN_GLOBAL_HOOKS_DIR", "global-hooks")),
            tmp_dir: PathBuf::from(env_or("BOSUN_TMP_DIR", "/tmp/bosun")),
            namespace: env_or("BOSUN_NAMESPACE", "bosun"),
            config_map_name: env_or("BOSUN_CONFIGMAP", "bosun"),
            listen_addr: env_or("BOSUN_LISTEN_ADDR", "0.0.0.0:9115")
                .parse()
                .context("parsing BOSUN_LISTEN_ADDR")?,
        })
    }
}

pub struct Operator {
    cfg: OperatorConfig,
    stop: CancellationToken,
    queues: Arc<TaskQueueSet>,
    watch: Arc<WatchManager>,
    module_manager: Arc<ModuleManager>,
    schedule: Arc<ScheduleManager>,
    kube_config: Option<Arc<KubeConfigManager>>,
    release_monitors: Arc<ReleaseMonitors>,
    release_engine: Arc<dyn ReleaseEngine>,
    converge: Arc<ConvergeState>,
}

impl Operator {
    pub fn new(cfg: OperatorConfig, stop: CancellationToken) -> Arc<Self> {
        let kube_config = Arc::new(KubeConfigManager::new(
            &cfg.namespace,
            &cfg.config_map_name,
            stop.child_token(),
        ));
        let release_engine: Arc<dyn ReleaseEngine> = Arc::new(HelmCli::new(&cfg.namespace));
        Operator::build(
            cfg,
            stop,
            release_engine,
            Arc::clone(&kube_config) as Arc<dyn ConfigValuesStore>,
            Some(kube_config),
            QueueDelays::default(),
        )
    }

    /// Assembly seam for tests: inject the release engine, the config store
    /// and fast queue delays. No ConfigMap watcher is attached.
    pub fn with_collaborators(
        cfg: OperatorConfig,
        stop: CancellationToken,
        release_engine: Arc<dyn ReleaseEngine>,
        config_store: Arc<dyn ConfigValuesStore>,
        delays: QueueDelays,
    ) -> Arc<Self> {
        Operator::build(cfg, stop, release_engine, config_store, None, delays)
    }

    fn build(
        cfg: OperatorConfig,
        stop: CancellationToken,
        release_engine: Arc<dyn ReleaseEngine>,
        config_store: Arc<dyn ConfigValuesStore>,
        kube_config: Option<Arc<KubeConfigManager>>,
        delays: QueueDelays,
    ) -> Arc<Self> {
        let watch = Arc::new(WatchManager::new(stop.child_token()));
        let module_manager = Arc::new(ModuleManager::new(
            ModuleManagerConfig {
                modules_dir: cfg.modules_dir.clone(),
                global_hooks_dir: cfg.global_hooks_dir.clone(),
                tmp_dir: cfg.tmp_dir.clone(),
            },
            Arc::clone(&watch),
            Arc::clone(&release_engine),
            config_store,
        ));
        Arc::new(Operator {
            queues: Arc::new(TaskQueueSet::new(stop.child_token()).with_delays(delays)),
            schedule: Arc::new(ScheduleManager::new(stop.child_token())),
            release_monitors: Arc::new(ReleaseMonitors::new()),
            converge: Arc::new(ConvergeState::new()),
            watch,
            module_manager,
            kube_config,
            release_engine,
            cfg,
            stop,
        })
    }

    pub fn module_manager(&self) -> &Arc<ModuleManager> {
        &self.module_manager
    }

    pub fn queues(&self) -> &Arc<TaskQueueSet> {
        &self.queues
    }

    pub fn converge_state(&self) -> &Arc<ConvergeState> {
        &self.converge
    }

    pub fn release_monitors(&self) -> &Arc<ReleaseMonitors> {
        &self.release_monitors
    }

    /// Index modules and hooks, then load and apply the initial config.
    /// Any config parse error here is fatal.
    pub async fn init(&self) -> Result<()> {
        self.module_manager.init().await?;
        if let Some(kc) = self.kube_config.as_ref() {
            let update = kc.load().await?;
            self.module_manager.apply_config(update, true)?;
        }
        Ok(())
    }

    /// Start queues, event plumbing, schedules and the HTTP server. The
    /// main loop is the main queue worker; this returns once everything is
    /// spawned.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!("starting operator");
        metrics::spawn_live_metrics(Arc::clone(&self.queues), self.stop.child_token());

        let main = self.queues.new_named_queue("main", self.task_handler());
        self.prepopulate_main_queue();
        main.start();
        self.init_and_start_hook_queues();

        // Events handler first, so informer events enqueue from the start.
        self.spawn_events_handler();
        self.schedule.start();
        if let Some(kc) = self.kube_config.as_ref() {
            let (tx, rx) = tokio::sync::mpsc::channel(16);
            kc.start(tx);
            self.spawn_config_updates(rx);
        }

        let state = server::ServerState {
            converge: Arc::clone(&self.converge),
            queues: Arc::clone(&self.queues),
            module_manager: Arc::clone(&self.module_manager),
            release_monitors: Arc::clone(&self.release_monitors),
        };
        let addr = self.cfg.listen_addr;
        let stop = self.stop.child_token();
        tokio::spawn(async move {
            if let Err(e) = server::serve(addr, state, stop).await {
                warn!(error = %format!("{:#}", e), "http server failed");
            }
        });
        Ok(())
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Seed the main queue: onStartup runs, schedule/kubernetes binding
    /// enablement, the synchronization barrier, then the first reload-all.
    pub fn prepopulate_main_queue(&self) {
        let main = self
            .queues
            .get_main()
            .expect("main queue created before prepopulation");

        for hook_name in self.module_manager.get_global_hooks_in_order(BindingType::OnStartup) {
            let labels = startup_labels(&hook_name, BindingType::OnStartup.as_str());
            main.add_last(
                Task::new(TaskType::GlobalHookRun)
                    .with_queue_name("main")
                    .with_log_labels(labels)
                    .with_metadata(HookMetadata {
                        event_description: "PrepopulateMainQueue".to_string(),
                        hook_name,
                        binding_type: Some(BindingType::OnStartup),
                        binding_context: vec![BindingContext::lifecycle(BindingType::OnStartup)],
                        reload_all_on_values_changes: false,
                        ..Default::default()
                    }),
            );
        }

        for hook_name in self.module_manager.get_global_hooks_in_order(BindingType::Schedule) {
            let labels = startup_labels(&hook_name, "GlobalHookEnableScheduleBindings");
            main.add_last(
                Task::new(TaskType::GlobalHookEnableScheduleBindings)
                    .with_queue_name("main")
                    .with_log_labels(labels)
                    .with_metadata(HookMetadata {
                        event_description: "PrepopulateMainQueue".to_string(),
                        hook_name,
                        ..Default::default()
                    }),
            );
        }

        for hook_name in
            self.module_manager.get_global_hooks_in_order(BindingType::OnKubernetesEvent)
        {
            let labels = startup_labels(&hook_name, "GlobalHookEnableKubernetesBindings");
            main.add_last(
                Task::new(TaskType::GlobalHookEnableKubernetesBindings)
                    .with_queue_name("main")
                    .with_log_labels(labels)
                    .with_metadata(HookMetadata {
                        event_description: "PrepopulateMainQueue".to_string(),
                        hook_name,
                        ..Default::default()
                    }),
            );
        }

        main.add_last(
            Task::new(TaskType::GlobalHookWaitKubernetesSynchronization)
                .with_queue_name("main")
                .with_log_labels(startup_labels("", "GlobalHookWaitKubernetesSynchronization"))
                .with_metadata(HookMetadata {
                    event_description: "PrepopulateMainQueue".to_string(),
                    ..Default::default()
                }),
        );

        main.add_last(
            Task::new(TaskType::ReloadAllModules)
                .with_queue_name("main")
                .with_log_labels(startup_labels("", "ReloadAllModules"))
                .with_metadata(HookMetadata {
                    event_description: "PrepopulateMainQueue".to_string(),
                    on_startup_hooks: true,
                    ..Default::default()
                }),
        );
    }

    /// Create and start every queue referenced by a hook binding.
    pub fn init_and_start_hook_queues(self: &Arc<Self>) {
        let handler = self.task_handler();
        for name in self.module_manager.hook_queue_names() {
            let q = self.queues.new_named_queue(&name, handler.clone());
            q.start();
        }
    }

    /// Get-or-create a queue at event time; hooks may point at queues that
    /// did not exist at startup.
    fn queue_for(self: &Arc<Self>, name: &str) -> bosun_queue::TaskQueue {
        match self.queues.get(name) {
            Some(q) => q,
            None => {
                let q = self.queues.new_named_queue(name, self.task_handler());
                q.start();
                q
            }
        }
    }

    /// The single converter: external events in, tasks out.
    fn spawn_events_handler(self: &Arc<Self>) {
        let op = Arc::clone(self);
        let mut kube_rx = self.watch.take_events().expect("watch events taken once");
        let mut tick_rx = self.schedule.take_ticks().expect("schedule ticks taken once");
        let mut mm_rx = self.module_manager.take_events().expect("module events taken once");
        let mut absent_rx =
            self.release_monitors.take_events().expect("release events taken once");
        let stop = self.stop.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(ev) = kube_rx.recv() => {
                        let event_id = Uuid::new_v4().to_string();
                        if let Some(m) = op.module_manager.handle_kube_event(&ev) {
                            op.enqueue_hook_match(m, BindingType::OnKubernetesEvent, "Kubernetes", &event_id);
                        }
                    }
                    Some(crontab) = tick_rx.recv() => {
                        let event_id = Uuid::new_v4().to_string();
                        for m in op.module_manager.handle_schedule_event(&crontab) {
                            op.enqueue_hook_match(m, BindingType::Schedule, "Schedule", &event_id);
                        }
                    }
                    Some(ev) = mm_rx.recv() => op.handle_module_manager_event(ev),
                    Some(ev) = absent_rx.recv() => {
                        op.enqueue_module_run_unless_queued(
                            &ev.module_name,
                            "DetectAbsentReleaseResources",
                        );
                    }
                    _ = stop.cancelled() => {
                        info!("events handler stopped");
                        return;
                    }
                }
            }
        });
    }

    fn spawn_config_updates(self: &Arc<Self>, mut rx: tokio::sync::mpsc::Receiver<bosun_modules::ConfigUpdate>) {
        let op = Arc::clone(self);
        let stop = self.stop.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(update) = rx.recv() => {
                        if let Err(e) = op.module_manager.apply_config(update, false) {
                            warn!(error = %format!("{:#}", e), "config update failed");
                        }
                    }
                    _ = stop.cancelled() => return,
                }
            }
        });
    }

    fn handle_module_manager_event(self: &Arc<Self>, ev: ModuleEvent) {
        match ev {
            ModuleEvent::ModulesChanged(modules) => {
                for module in modules {
                    self.enqueue_module_run_unless_queued(&module, "ModuleValuesChanged");
                }
            }
            ModuleEvent::GlobalChanged => {
                info!("global config values changed; queueing reload of all modules");
                self.release_monitors.stop_all();
                let main = self.queue_for("main");
                main.add_last(
                    Task::new(TaskType::ReloadAllModules)
                        .with_queue_name("main")
                        .with_metadata(HookMetadata {
                            event_description: "GlobalConfigValuesChanged".to_string(),
                            on_startup_hooks: false,
                            ..Default::default()
                        }),
                );
            }
            ModuleEvent::AmbiguousState => {
                // Head of the queue: the manager must restore its state
                // before any other converge task runs.
                let main = self.queue_for("main");
                main.add_first(
                    Task::new(TaskType::ModuleManagerRetry).with_queue_name("main"),
                );
                warn!("module manager in ambiguous state; retry queued first");
            }
        }
    }

    fn enqueue_module_run_unless_queued(self: &Arc<Self>, module: &str, reason: &str) {
        let main = self.queue_for("main");
        let mut queued = false;
        main.iterate(|t| {
            if t.task_type() == TaskType::ModuleRun && t.metadata().module_name == module {
                queued = true;
            }
        });
        if queued {
            info!(module, reason, "ModuleRun already queued");
            return;
        }
        info!(module, reason, "queueing ModuleRun");
        main.add_last(
            Task::new(TaskType::ModuleRun)
                .with_queue_name("main")
                .with_metadata(HookMetadata {
                    event_description: reason.to_string(),
                    module_name: module.to_string(),
                    ..Default::default()
                }),
        );
    }

    fn enqueue_hook_match(
        self: &Arc<Self>,
        m: HookMatch,
        binding_type: BindingType,
        event_description: &str,
        event_id: &str,
    ) {
        let task = match m {
            HookMatch::Global { hook_name, info } => {
                let mut labels = BTreeMap::new();
                labels.insert("event.id".to_string(), event_id.to_string());
                labels.insert("hook".to_string(), hook_name.clone());
                labels.insert("hook.type".to_string(), "global".to_string());
                labels.insert("queue".to_string(), info.queue_name.clone());
                labels.insert("binding.name".to_string(), info.binding_name.clone());
                Task::new(TaskType::GlobalHookRun)
                    .with_queue_name(&info.queue_name)
                    .with_log_labels(labels)
                    .with_metadata(HookMetadata {
                        event_description: event_description.to_string(),
                        hook_name,
                        binding_type: Some(binding_type),
                        binding_context: info.binding_context,
                        allow_failure: info.allow_failure,
                        // Live-event global hook runs may trigger reload-all.
                        reload_all_on_values_changes: true,
                        ..Default::default()
                    })
            }
            HookMatch::Module { module_name, hook_name, info } => {
                let mut labels = BTreeMap::new();
                labels.insert("event.id".to_string(), event_id.to_string());
                labels.insert("module".to_string(), module_name.clone());
                labels.insert("hook".to_string(), hook_name.clone());
                labels.insert("hook.type".to_string(), "module".to_string());
                labels.insert("queue".to_string(), info.queue_name.clone());
                Task::new(TaskType::ModuleHookRun)
                    .with_queue_name(&info.queue_name)
                    .with_log_labels(labels)
                    .with_metadata(HookMetadata {
                        event_description: event_description.to_string(),
                        module_name,
                        hook_name,
                        binding_type: Some(binding_type),
                        binding_context: info.binding_context,
                        allow_failure: info.allow_failure,
                        ..Default::default()
                    })
            }
        };
        let queue_name = task.queue_name().to_string();
        self.queue_for(&queue_name).add_last(task);
    }
}

fn startup_labels(hook: &str, binding: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("event.type".to_string(), "OperatorStartup".to_string());
    labels.insert("queue".to_string(), "main".to_string());
    labels.insert("binding".to_string(), binding.to_string());
    if !hook.is_empty() {
        labels.insert("hook".to_string(), hook.to_string());
        labels.insert("hook.type".to_string(), "global".to_string());
    }
    labels
}
