//! The task handler: dispatch by task type, global and per-module
//! lifecycle, synchronization barriers and the reload-all rules.

use std::collections::HashSet;
use std::sync::Arc;

use bosun_core::{BindingContext, BindingType, HookMetadata, Task, TaskType};
use bosun_queue::{combine_binding_context, TaskResult, TaskStatus, DELAY_ON_FAILED_TASK};
use metrics::counter;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::Operator;

fn extend_event_description(desc: &str, suffix: &str) -> String {
    if desc.contains(suffix) {
        desc.to_string()
    } else if desc.is_empty() {
        suffix.to_string()
    } else {
        format!("{}.{}", desc, suffix)
    }
}

impl Operator {
    pub fn task_handler(self: &Arc<Self>) -> bosun_queue::TaskHandlerFn {
        let op = Arc::clone(self);
        Arc::new(move |t: Task| {
            let op = Arc::clone(&op);
            Box::pin(async move { op.handle_task(t).await })
        })
    }

    pub async fn handle_task(self: Arc<Self>, t: Task) -> TaskResult {
        let mut res = match t.task_type() {
            TaskType::GlobalHookRun => self.handle_global_hook_run(&t).await,
            TaskType::ModuleHookRun => self.handle_module_hook_run(&t).await,
            TaskType::GlobalHookEnableKubernetesBindings => {
                self.handle_enable_kubernetes_bindings(&t).await
            }
            TaskType::GlobalHookEnableScheduleBindings => {
                self.handle_enable_schedule_bindings(&t)
            }
            TaskType::GlobalHookWaitKubernetesSynchronization => {
                self.handle_wait_kubernetes_synchronization()
            }
            TaskType::ReloadAllModules => self.handle_reload_all_modules(&t),
            TaskType::DiscoverModulesState => self.handle_discover_modules_state(&t).await,
            TaskType::ModuleRun => self.handle_module_run(&t).await,
            TaskType::ModuleDelete => self.handle_module_delete(&t).await,
            TaskType::ModulePurge => self.handle_module_purge(&t).await,
            TaskType::ModuleManagerRetry => self.handle_module_manager_retry(),
        };

        // Converge flags are re-evaluated after every successful task, once
        // queue mutations have landed.
        if res.status == TaskStatus::Success {
            let op = Arc::clone(&self);
            let orig = res.after_handle.take();
            res.after_handle = Some(Box::new(move || {
                if let Some(main) = op.queues.get_main() {
                    op.converge.check(&main);
                }
                if let Some(f) = orig {
                    f();
                }
            }));
        }
        res
    }

    /// Fuse adjacent same-hook tasks into this one and keep the sync
    /// registry consistent: fused-away Synchronization runs count as done
    /// once their contexts travel with the surviving task.
    fn combine_contexts_for(&self, t: &Task) -> HookMetadata {
        let queue = match self.queues.get(t.queue_name()) {
            Some(q) => q,
            None => return t.metadata().clone(),
        };
        let mut hm = t.metadata().clone();

        let hook_name = hm.hook_name.clone();
        let collect_ids = |out: &mut HashSet<String>| {
            queue.iterate(|tsk| {
                let m = tsk.metadata();
                if m.hook_name == hook_name && !m.kubernetes_binding_id.is_empty() {
                    out.insert(m.kubernetes_binding_id.clone());
                }
            });
        };
        let mut ids_before = HashSet::new();
        collect_ids(&mut ids_before);

        if let Some(contexts) = combine_binding_context(&queue, t, |_| false) {
            hm.binding_context = contexts;
            queue.update_task_metadata(t.id(), hm.clone());
            let mut ids_after = HashSet::new();
            collect_ids(&mut ids_after);
            for id in ids_before.difference(&ids_after) {
                if *id != hm.kubernetes_binding_id {
                    self.module_manager.synchronization_done(id);
                }
            }
        }
        hm
    }

    async fn handle_global_hook_run(&self, t: &Task) -> TaskResult {
        let hm = self.combine_contexts_for(t);
        info!(hook = %hm.hook_name, binding = ?hm.binding_type, "global hook run");

        let res = match self
            .module_manager
            .run_global_hook(&hm.hook_name, &hm.binding_context)
            .await
        {
            Err(e) => {
                if hm.allow_failure {
                    counter!("global_hook_allowed_errors", 1u64, "hook" => hm.hook_name.clone());
                    info!(hook = %hm.hook_name, error = %format!("{:#}", e), "global hook failed, but allowed to fail");
                    TaskResult::success()
                } else {
                    counter!("global_hook_errors", 1u64, "hook" => hm.hook_name.clone());
                    error!(
                        hook = %hm.hook_name,
                        failures = t.failure_count() + 1,
                        error = %format!("{:#}", e),
                        "global hook failed, retry after delay"
                    );
                    TaskResult::fail()
                }
            }
            Ok((before, after)) => {
                debug!(hook = %hm.hook_name, before = %before, after = %after, saved = %hm.values_checksum, "global hook checksums");
                let (reload, event_description) = match hm.binding_type {
                    Some(BindingType::Schedule) if before != after => (
                        true,
                        format!("ScheduleChangeGlobalValues({})", hm.hook_name),
                    ),
                    Some(BindingType::OnKubernetesEvent)
                        if hm.reload_all_on_values_changes && before != after =>
                    {
                        (true, format!("KubernetesChangeGlobalValues({})", hm.hook_name))
                    }
                    Some(BindingType::AfterAll)
                        if hm.last_after_all_hook && after != hm.values_checksum =>
                    {
                        (true, "AfterAllHooksChangeGlobalValues".to_string())
                    }
                    _ => (false, String::new()),
                };
                let mut res = TaskResult::success();
                if reload {
                    info!(trigger = %event_description, "global values changed; reload all modules");
                    self.release_monitors.stop_all();
                    res.tail_tasks.push(
                        Task::new(TaskType::ReloadAllModules)
                            .with_queue_name("main")
                            .with_metadata(HookMetadata {
                                event_description,
                                on_startup_hooks: false,
                                ..Default::default()
                            }),
                    );
                }
                res
            }
        };

        if res.status == TaskStatus::Success && !hm.kubernetes_binding_id.is_empty() {
            info!(binding_id = %hm.kubernetes_binding_id, "synchronization done");
            self.module_manager.synchronization_done(&hm.kubernetes_binding_id);
        }
        res
    }

    async fn handle_module_hook_run(&self, t: &Task) -> TaskResult {
        let hm = self.combine_contexts_for(t);
        info!(module = %hm.module_name, hook = %hm.hook_name, "module hook run");

        self.release_monitors.pause(&hm.module_name);
        let run = self.module_manager.run_module_hook(&hm.hook_name, &hm.binding_context).await;
        self.release_monitors.resume(&hm.module_name);

        let res = match run {
            Err(e) => {
                if hm.allow_failure {
                    counter!("module_hook_allowed_errors", 1u64,
                        "module" => hm.module_name.clone(), "hook" => hm.hook_name.clone());
                    info!(module = %hm.module_name, hook = %hm.hook_name, error = %format!("{:#}", e), "module hook failed, but allowed to fail");
                    TaskResult::success()
                } else {
                    counter!("module_hook_errors", 1u64,
                        "module" => hm.module_name.clone(), "hook" => hm.hook_name.clone());
                    error!(
                        module = %hm.module_name,
                        hook = %hm.hook_name,
                        failures = t.failure_count() + 1,
                        error = %format!("{:#}", e),
                        "module hook failed, retry after delay"
                    );
                    TaskResult::fail()
                }
            }
            Ok(values_changed) => {
                debug!(module = %hm.module_name, hook = %hm.hook_name, values_changed, "module hook success");
                TaskResult::success()
            }
        };

        if res.status == TaskStatus::Success && !hm.kubernetes_binding_id.is_empty() {
            self.module_manager.synchronization_done(&hm.kubernetes_binding_id);
        }
        res
    }

    async fn handle_enable_kubernetes_bindings(self: &Arc<Self>, t: &Task) -> TaskResult {
        let hm = t.metadata().clone();
        info!(hook = %hm.hook_name, "enable kubernetes bindings for global hook");

        let bindings = match self
            .module_manager
            .enable_global_kubernetes_bindings(&hm.hook_name)
            .await
        {
            Ok(b) => b,
            Err(e) => {
                counter!("global_hook_errors", 1u64, "hook" => hm.hook_name.clone());
                error!(
                    hook = %hm.hook_name,
                    failures = t.failure_count() + 1,
                    error = %format!("{:#}", e),
                    "enabling kubernetes bindings failed, retry after delay"
                );
                return TaskResult::fail();
            }
        };

        let event_description =
            extend_event_description(&hm.event_description, "HandleGlobalEnableKubernetesBindings");
        let mut res = TaskResult::success();
        for eb in bindings {
            let binding_id = Uuid::new_v4().to_string();
            if eb.info.wait_for_synchronization {
                self.module_manager.synchronization_queued(&binding_id, None, true);
            }
            let task = Task::new(TaskType::GlobalHookRun)
                .with_queue_name(&eb.info.queue_name)
                .with_metadata(HookMetadata {
                    event_description: event_description.clone(),
                    hook_name: eb.hook_name.clone(),
                    binding_type: Some(BindingType::OnKubernetesEvent),
                    binding_context: eb.info.binding_context,
                    allow_failure: eb.info.allow_failure,
                    // Synchronization runs never trigger a reload-all.
                    reload_all_on_values_changes: false,
                    kubernetes_binding_id: binding_id,
                    wait_for_synchronization: eb.info.wait_for_synchronization,
                    ..Default::default()
                });
            if eb.info.queue_name == t.queue_name() {
                // Runs immediately after this task.
                res.head_tasks.push(task);
            } else {
                self.queue_for(&eb.info.queue_name).add_last(task);
            }
        }

        // Streams attach only after the Synchronization tasks are queued.
        let op = Arc::clone(self);
        res.after_handle = Some(Box::new(move || {
            tokio::spawn(async move {
                if let Err(e) = op.module_manager.start_monitors().await {
                    error!(error = %format!("{:#}", e), "starting monitors failed");
                }
            });
        }));
        res
    }

    fn handle_enable_schedule_bindings(&self, t: &Task) -> TaskResult {
        let hm = t.metadata();
        let hook = match self.module_manager.get_global_hook(&hm.hook_name) {
            Some(h) => h,
            None => {
                error!(hook = %hm.hook_name, "unknown global hook for schedule bindings");
                return TaskResult::fail();
            }
        };
        for b in hook.config.schedule.iter() {
            if let Err(e) = self.schedule.add(&b.crontab) {
                counter!("global_hook_errors", 1u64, "hook" => hm.hook_name.clone());
                error!(hook = %hm.hook_name, error = %format!("{:#}", e), "bad schedule binding");
                return TaskResult::fail();
            }
        }
        info!(hook = %hm.hook_name, bindings = hook.config.schedule.len(), "schedule bindings enabled");
        TaskResult::success()
    }

    fn handle_wait_kubernetes_synchronization(&self) -> TaskResult {
        if self.module_manager.global_synchronization_needed()
            && !self.module_manager.global_synchronization_done()
        {
            debug!("kubernetes synchronization not done; repeat");
            TaskResult::repeat()
        } else {
            info!("kubernetes synchronization done");
            TaskResult::success()
        }
    }

    fn handle_reload_all_modules(&self, t: &Task) -> TaskResult {
        let hm = t.metadata().clone();
        info!("queue beforeAll and discover-modules tasks");

        // A storm of reload triggers collapses: drop adjacent
        // ReloadAllModules tasks until a different task type is hit.
        if let Some(queue) = self.queues.get(t.queue_name()) {
            let mut stop_filter = false;
            queue.filter(|tsk| {
                if tsk.id() == t.id() {
                    return true;
                }
                if tsk.task_type() != TaskType::ReloadAllModules {
                    stop_filter = true;
                }
                stop_filter
            });
        }

        let mut res = TaskResult::success();
        res.after_tasks =
            self.create_reload_all_tasks(hm.on_startup_hooks, &hm.event_description);
        res
    }

    fn create_reload_all_tasks(&self, on_startup: bool, event_description: &str) -> Vec<Task> {
        let mut tasks = Vec::new();
        for hook_name in self.module_manager.get_global_hooks_in_order(BindingType::BeforeAll) {
            tasks.push(
                Task::new(TaskType::GlobalHookRun)
                    .with_queue_name("main")
                    .with_metadata(HookMetadata {
                        event_description: event_description.to_string(),
                        hook_name,
                        binding_type: Some(BindingType::BeforeAll),
                        binding_context: vec![BindingContext::lifecycle(BindingType::BeforeAll)],
                        reload_all_on_values_changes: false,
                        ..Default::default()
                    }),
            );
        }
        tasks.push(
            Task::new(TaskType::DiscoverModulesState)
                .with_queue_name("main")
                .with_metadata(HookMetadata {
                    event_description: event_description.to_string(),
                    on_startup_hooks: on_startup,
                    ..Default::default()
                }),
        );
        tasks
    }

    async fn handle_discover_modules_state(&self, t: &Task) -> TaskResult {
        let hm = t.metadata().clone();
        info!("discover modules state");

        let state = match self.module_manager.discover_modules_state().await {
            Ok(s) => s,
            Err(e) => {
                counter!("modules_discover_errors", 1u64);
                error!(
                    failures = t.failure_count() + 1,
                    error = %format!("{:#}", e),
                    "discover modules failed, retry after delay"
                );
                return TaskResult::fail();
            }
        };

        let event_description =
            extend_event_description(&hm.event_description, "DiscoverModulesState");
        let mut tasks = Vec::new();

        for module in state.enabled_modules.iter() {
            let on_startup_hooks =
                hm.on_startup_hooks || state.newly_enabled_modules.contains(module);
            tasks.push(
                Task::new(TaskType::ModuleRun)
                    .with_queue_name("main")
                    .with_metadata(HookMetadata {
                        event_description: event_description.clone(),
                        module_name: module.clone(),
                        on_startup_hooks,
                        ..Default::default()
                    }),
            );
        }
        for module in state.modules_to_disable.iter() {
            tasks.push(
                Task::new(TaskType::ModuleDelete)
                    .with_queue_name("main")
                    .with_metadata(HookMetadata {
                        event_description: event_description.clone(),
                        module_name: module.clone(),
                        ..Default::default()
                    }),
            );
        }
        for module in state.released_unknown_modules.iter() {
            tasks.push(
                Task::new(TaskType::ModulePurge)
                    .with_queue_name("main")
                    .with_metadata(HookMetadata {
                        event_description: event_description.clone(),
                        module_name: module.clone(),
                        ..Default::default()
                    }),
            );
        }

        let after_all = self.module_manager.get_global_hooks_in_order(BindingType::AfterAll);
        let last = after_all.len().saturating_sub(1);
        for (i, hook_name) in after_all.into_iter().enumerate() {
            let mut metadata = HookMetadata {
                event_description: event_description.clone(),
                hook_name,
                binding_type: Some(BindingType::AfterAll),
                binding_context: vec![BindingContext::lifecycle(BindingType::AfterAll)],
                ..Default::default()
            };
            if i == last {
                // Snapshot now; the post-run comparison detects values
                // changed by the afterAll hooks themselves.
                metadata.last_after_all_hook = true;
                metadata.values_checksum = self.module_manager.global_values_checksum();
            }
            tasks.push(
                Task::new(TaskType::GlobalHookRun)
                    .with_queue_name("main")
                    .with_metadata(metadata),
            );
        }

        for module in state.modules_to_disable.iter() {
            self.module_manager.disable_module_hooks(module);
        }

        let mut res = TaskResult::success();
        res.after_tasks = tasks;
        res
    }

    /// Per-module state machine: onStartup hooks, queue Synchronization
    /// runs on a dedicated sub-queue, hold the barrier, then
    /// beforeHelm/release/afterHelm.
    async fn handle_module_run(self: &Arc<Self>, t: &Task) -> TaskResult {
        let hm = t.metadata().clone();
        let module = hm.module_name.clone();
        let mm = &self.module_manager;
        let sync_queue_name =
            format!("main-subqueue-kubernetes-Synchronization-module-{}", module);

        let fail = |e: anyhow::Error, failures: u32| {
            counter!("module_run_errors", 1u64, "module" => module.clone());
            error!(module = %module, failures, error = %format!("{:#}", e), "module run failed, retry after delay");
            TaskResult::fail()
        };

        let sync_needed = mm.module_synchronization_needed(&module);
        let sync_queued = mm.module_synchronization_queued(&module);
        let sync_done = mm.module_synchronization_done(&module);
        debug!(module = %module, on_startup = hm.on_startup_hooks, sync_needed, sync_queued, sync_done, "module run state");

        if hm.on_startup_hooks && (!sync_needed || (!sync_queued && !sync_done)) {
            info!(module = %module, "module run: startup hooks phase");
            // Discovery may have surfaced hooks with new named queues.
            self.init_and_start_hook_queues();
            if let Err(e) = mm.run_module_on_startup(&module).await {
                return fail(e, t.failure_count() + 1);
            }
        }

        if sync_needed && !sync_queued && !sync_done {
            let bindings = match mm.enable_module_kubernetes_bindings(&module).await {
                Ok(b) => b,
                Err(e) => return fail(e, t.failure_count() + 1),
            };
            let sub_queue = self.queues.new_named_queue(&sync_queue_name, self.task_handler());
            let event_description =
                extend_event_description(&hm.event_description, "EnableKubernetesBindings");
            for eb in bindings {
                let binding_id = Uuid::new_v4().to_string();
                mm.synchronization_queued(
                    &binding_id,
                    Some(&module),
                    eb.info.wait_for_synchronization,
                );
                let task = Task::new(TaskType::ModuleHookRun)
                    .with_queue_name(if eb.info.queue_name == t.queue_name() {
                        &sync_queue_name
                    } else {
                        &eb.info.queue_name
                    })
                    .with_metadata(HookMetadata {
                        event_description: event_description.clone(),
                        module_name: module.clone(),
                        hook_name: eb.hook_name.clone(),
                        binding_type: Some(BindingType::OnKubernetesEvent),
                        binding_context: eb.info.binding_context,
                        allow_failure: eb.info.allow_failure,
                        kubernetes_binding_id: binding_id,
                        wait_for_synchronization: eb.info.wait_for_synchronization,
                        ..Default::default()
                    });
                info!(module = %module, queue = task.queue_name(), "queue module Synchronization task");
                if task.queue_name() == sync_queue_name {
                    sub_queue.add_last(task);
                } else {
                    let name = task.queue_name().to_string();
                    self.queue_for(&name).add_last(task);
                }
            }
            sub_queue.start();

            // This invocation ends; a fresh ModuleRun re-enters at the
            // barrier right behind it.
            let mut res = TaskResult::success();
            res.after_tasks = vec![Task::new(TaskType::ModuleRun)
                .with_queue_name(t.queue_name())
                .with_log_labels(t.log_labels().clone())
                .with_metadata(hm.clone())];
            return res;
        }

        if sync_needed && sync_queued && !sync_done {
            debug!(module = %module, "module synchronization in progress; repeat");
            return TaskResult::repeat();
        }

        info!(module = %module, "module run: hooks and release phase");
        self.queues.remove(&sync_queue_name);
        if let Err(e) = mm.start_monitors().await {
            return fail(e, t.failure_count() + 1);
        }
        for crontab in mm.module_schedule_crontabs(&module) {
            if let Err(e) = self.schedule.add(&crontab) {
                return fail(e, t.failure_count() + 1);
            }
        }

        match mm.run_module(&module).await {
            Err(e) => fail(e, t.failure_count() + 1),
            Ok((values_changed, manifests)) => {
                info!(module = %module, values_changed, "module run success");
                if let Some(ids) = manifests {
                    self.release_monitors.set_monitor(&module, ids);
                }
                let mut res = TaskResult::success();
                if values_changed {
                    // afterHelm changed the values: run the module again,
                    // without the startup phase.
                    let mut metadata = hm.clone();
                    metadata.on_startup_hooks = false;
                    metadata.event_description = extend_event_description(
                        &hm.event_description,
                        "AfterHelmHooksChangeModuleValues",
                    );
                    res.after_tasks = vec![Task::new(TaskType::ModuleRun)
                        .with_queue_name(t.queue_name())
                        .with_metadata(metadata)];
                } else {
                    mm.set_module_ready(&module);
                }
                res
            }
        }
    }

    async fn handle_module_delete(&self, t: &Task) -> TaskResult {
        let hm = t.metadata();
        info!(module = %hm.module_name, "module delete");
        match self.module_manager.delete_module(&hm.module_name).await {
            Err(e) => {
                counter!("module_delete_errors", 1u64, "module" => hm.module_name.clone());
                error!(
                    module = %hm.module_name,
                    failures = t.failure_count() + 1,
                    error = %format!("{:#}", e),
                    "module delete failed, retry after delay"
                );
                TaskResult::fail()
            }
            Ok(()) => {
                self.release_monitors.remove(&hm.module_name);
                info!(module = %hm.module_name, "module delete success");
                TaskResult::success()
            }
        }
    }

    async fn handle_module_purge(&self, t: &Task) -> TaskResult {
        let hm = t.metadata();
        info!(module = %hm.module_name, "module purge");
        // Purge targets unknown releases; errors are not retried.
        match self.release_engine.delete(&hm.module_name).await {
            Err(e) => warn!(module = %hm.module_name, error = %format!("{:#}", e), "module purge failed, no retry"),
            Ok(()) => info!(module = %hm.module_name, "module purge success"),
        }
        TaskResult::success()
    }

    fn handle_module_manager_retry(&self) -> TaskResult {
        counter!("modules_discover_errors", 1u64);
        self.module_manager.retry();
        info!("module manager retry; delay before next task");
        let mut res = TaskResult::success();
        res.delay_before_next = Some(DELAY_ON_FAILED_TASK);
        res
    }
}
