#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bosun_core::{BindingType, HookMetadata, Task, TaskType, Values};
use bosun_modules::{ConfigUpdate, ConfigValuesStore, ReleaseEngine};
use bosun_operator::{Operator, OperatorConfig};
use bosun_queue::{QueueDelays, TaskStatus};
use tokio_util::sync::CancellationToken;

struct FakeRelease {
    releases: Mutex<Vec<String>>,
    installs: Mutex<Vec<String>>,
}

impl FakeRelease {
    fn new(releases: &[&str]) -> Arc<Self> {
        Arc::new(FakeRelease {
            releases: Mutex::new(releases.iter().map(|s| s.to_string()).collect()),
            installs: Mutex::new(Vec::new()),
        })
    }

    fn install_count(&self) -> usize {
        self.installs.lock().unwrap().len()
    }
}

#[async_trait]
impl ReleaseEngine for FakeRelease {
    async fn install_or_upgrade(
        &self,
        release: &str,
        _chart_dir: &Path,
        _values_path: &Path,
    ) -> Result<Vec<String>> {
        self.installs.lock().unwrap().push(release.to_string());
        let mut releases = self.releases.lock().unwrap();
        if !releases.contains(&release.to_string()) {
            releases.push(release.to_string());
        }
        Ok(vec![format!("Deployment/addons/{}", release)])
    }

    async fn delete(&self, release: &str) -> Result<()> {
        self.releases.lock().unwrap().retain(|r| r != release);
        Ok(())
    }

    async fn delete_single_failed_revision(&self, _release: &str) -> Result<()> {
        Ok(())
    }

    async fn list_releases(&self) -> Result<Vec<String>> {
        Ok(self.releases.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct NullStore;

#[async_trait]
impl ConfigValuesStore for NullStore {
    async fn save_global(&self, _values: &Values) -> Result<()> {
        Ok(())
    }

    async fn save_module(&self, _module: &str, _values: &Values) -> Result<()> {
        Ok(())
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::create_dir_all(root.join("modules")).unwrap();
        std::fs::create_dir_all(root.join("global-hooks")).unwrap();
        Fixture { _dir: dir, root }
    }

    fn add_module(&self, dir_name: &str, with_chart: bool) -> PathBuf {
        let path = self.root.join("modules").join(dir_name);
        std::fs::create_dir_all(&path).unwrap();
        if with_chart {
            std::fs::write(path.join("Chart.yaml"), "name: x\nversion: 0.1.0\n").unwrap();
        }
        path
    }

    fn add_hook(&self, rel_path: &str, config_json: &str, body: &str) {
        let path = self.root.join(rel_path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let script = format!(
            "#!/bin/sh\nif [ \"$1\" = \"--config\" ]; then\n  echo '{}'\n  exit 0\nfi\n{}\n",
            config_json, body
        );
        std::fs::write(&path, script).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
    }

    fn operator(&self, release: Arc<dyn ReleaseEngine>) -> Arc<Operator> {
        let cfg = OperatorConfig {
            modules_dir: self.root.join("modules"),
            global_hooks_dir: self.root.join("global-hooks"),
            tmp_dir: self.root.join("tmp"),
            namespace: "addons".to_string(),
            config_map_name: "bosun".to_string(),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
        };
        Operator::with_collaborators(
            cfg,
            CancellationToken::new(),
            release,
            Arc::new(NullStore),
            QueueDelays {
                on_failed_task: Duration::from_millis(20),
                on_repeat: Duration::from_millis(5),
            },
        )
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

fn task_types(queue: &bosun_queue::TaskQueue) -> Vec<TaskType> {
    let mut out = Vec::new();
    queue.iterate(|t| out.push(t.task_type()));
    out
}

#[tokio::test]
async fn prepopulation_seeds_startup_sequence() {
    let fx = Fixture::new();
    fx.add_hook("global-hooks/startup.sh", r#"{"onStartup": 1}"#, "");
    fx.add_hook("global-hooks/cron.sh", r#"{"schedule": [{"crontab": "0 0 * * * *"}]}"#, "");
    fx.add_hook("global-hooks/watcher.sh", r#"{"kubernetes": [{"kind": "pod"}]}"#, "");

    let op = fx.operator(FakeRelease::new(&[]));
    op.init().await.unwrap();
    let main = op.queues().new_named_queue("main", op.task_handler());
    op.prepopulate_main_queue();

    assert_eq!(
        task_types(&main),
        vec![
            TaskType::GlobalHookRun,
            TaskType::GlobalHookEnableScheduleBindings,
            TaskType::GlobalHookEnableKubernetesBindings,
            TaskType::GlobalHookWaitKubernetesSynchronization,
            TaskType::ReloadAllModules,
        ]
    );
}

#[tokio::test]
async fn startup_converge_reaches_ready_and_runs_modules() {
    let fx = Fixture::new();
    fx.add_module("010-demo", true);
    fx.add_hook("global-hooks/startup.sh", r#"{"onStartup": 1}"#, "");
    fx.add_hook("global-hooks/before.sh", r#"{"beforeAll": 1}"#, "");
    fx.add_hook("global-hooks/after.sh", r#"{"afterAll": 1}"#, "");

    let release = FakeRelease::new(&[]);
    let op = fx.operator(release.clone());
    op.init().await.unwrap();
    op.start().await.unwrap();

    wait_until("startup converge", || op.converge_state().startup_converge_done()).await;
    assert_eq!(release.install_count(), 1);
    assert!(op.release_monitors().has_monitor("demo"));
    assert_eq!(op.module_manager().enabled_modules(), vec!["demo"]);
}

#[tokio::test]
async fn module_values_change_reruns_single_module() {
    let fx = Fixture::new();
    fx.add_module("010-demo", true);

    let release = FakeRelease::new(&[]);
    let op = fx.operator(release.clone());
    op.init().await.unwrap();
    op.start().await.unwrap();
    wait_until("startup converge", || op.converge_state().startup_converge_done()).await;
    assert_eq!(release.install_count(), 1);

    // A foreign config edit for the module triggers one ModuleRun.
    op.module_manager()
        .apply_config(
            ConfigUpdate {
                global: None,
                modules: BTreeMap::from([("demo".to_string(), "size: 3\n".to_string())]),
            },
            false,
        )
        .unwrap();

    wait_until("module rerun", || release.install_count() == 2).await;
    assert_eq!(
        op.module_manager().module_values("demo").as_value()["size"],
        serde_json::json!(3)
    );
}

#[tokio::test]
async fn global_values_change_reloads_all_modules() {
    let fx = Fixture::new();
    fx.add_module("010-demo", true);

    let release = FakeRelease::new(&[]);
    let op = fx.operator(release.clone());
    op.init().await.unwrap();
    op.start().await.unwrap();
    wait_until("startup converge", || op.converge_state().startup_converge_done()).await;

    op.release_monitors().set_monitor("demo", vec!["Deployment/addons/demo".to_string()]);
    op.module_manager()
        .apply_config(
            ConfigUpdate {
                global: Some("tier: prod\n".to_string()),
                modules: BTreeMap::new(),
            },
            false,
        )
        .unwrap();

    wait_until("reload install", || release.install_count() == 2).await;
}

#[tokio::test]
async fn schedule_hook_changing_global_values_queues_reload(/* S4 */) {
    let fx = Fixture::new();
    fx.add_hook(
        "global-hooks/cron.sh",
        r#"{"schedule": [{"crontab": "0 0 * * * *"}]}"#,
        r#"echo '[{"op":"add","path":"/global/stamp","value":"new"}]' > "$CONFIG_VALUES_JSON_PATCH_PATH""#,
    );
    let op = fx.operator(FakeRelease::new(&[]));
    op.init().await.unwrap();
    op.queues().new_named_queue("main", op.task_handler());
    op.release_monitors().set_monitor("demo", vec!["Deployment/addons/demo".to_string()]);

    let task = Task::new(TaskType::GlobalHookRun).with_metadata(HookMetadata {
        hook_name: "cron.sh".to_string(),
        binding_type: Some(BindingType::Schedule),
        binding_context: vec![bosun_core::BindingContext::schedule("cron")],
        ..Default::default()
    });
    let res = op.clone().handle_task(task).await;

    assert_eq!(res.status, TaskStatus::Success);
    assert_eq!(res.tail_tasks.len(), 1);
    assert_eq!(res.tail_tasks[0].task_type(), TaskType::ReloadAllModules);
    // Release-resource monitors are stopped before the reload.
    assert!(!op.release_monitors().has_monitor("demo"));

    // A second run with unchanged values stays quiet.
    let task = Task::new(TaskType::GlobalHookRun).with_metadata(HookMetadata {
        hook_name: "cron.sh".to_string(),
        binding_type: Some(BindingType::Schedule),
        binding_context: vec![bosun_core::BindingContext::schedule("cron")],
        ..Default::default()
    });
    let res = op.clone().handle_task(task).await;
    assert!(res.tail_tasks.is_empty());
}

#[tokio::test]
async fn synchronization_phase_never_triggers_reload() {
    let fx = Fixture::new();
    fx.add_hook(
        "global-hooks/watcher.sh",
        r#"{"kubernetes": [{"kind": "pod"}]}"#,
        r#"echo '[{"op":"add","path":"/global/seen","value":true}]' > "$CONFIG_VALUES_JSON_PATCH_PATH""#,
    );
    let op = fx.operator(FakeRelease::new(&[]));
    op.init().await.unwrap();
    op.queues().new_named_queue("main", op.task_handler());

    // Synchronization runs carry reload_all_on_values_changes = false.
    let task = Task::new(TaskType::GlobalHookRun).with_metadata(HookMetadata {
        hook_name: "watcher.sh".to_string(),
        binding_type: Some(BindingType::OnKubernetesEvent),
        reload_all_on_values_changes: false,
        kubernetes_binding_id: "sync-1".to_string(),
        wait_for_synchronization: true,
        ..Default::default()
    });
    op.module_manager().synchronization_queued("sync-1", None, true);
    let res = op.clone().handle_task(task).await;

    assert_eq!(res.status, TaskStatus::Success);
    assert!(res.tail_tasks.is_empty(), "no reload from a synchronization run");
    assert!(op.module_manager().global_synchronization_done());
}

#[tokio::test]
async fn last_after_all_checksum_mismatch_triggers_one_reload(/* S6 */) {
    let fx = Fixture::new();
    fx.add_hook(
        "global-hooks/afterall.sh",
        r#"{"afterAll": 1}"#,
        r#"echo '[{"op":"add","path":"/global/final","value":1}]' > "$CONFIG_VALUES_JSON_PATCH_PATH""#,
    );
    let op = fx.operator(FakeRelease::new(&[]));
    op.init().await.unwrap();
    op.queues().new_named_queue("main", op.task_handler());

    let snapshot = op.module_manager().global_values_checksum();
    let task = Task::new(TaskType::GlobalHookRun).with_metadata(HookMetadata {
        hook_name: "afterall.sh".to_string(),
        binding_type: Some(BindingType::AfterAll),
        last_after_all_hook: true,
        values_checksum: snapshot,
        ..Default::default()
    });
    let res = op.clone().handle_task(task).await;
    assert_eq!(res.tail_tasks.len(), 1);
    assert_eq!(res.tail_tasks[0].task_type(), TaskType::ReloadAllModules);

    // Not the last afterAll hook: no reload even though values changed.
    let task = Task::new(TaskType::GlobalHookRun).with_metadata(HookMetadata {
        hook_name: "afterall.sh".to_string(),
        binding_type: Some(BindingType::AfterAll),
        last_after_all_hook: false,
        ..Default::default()
    });
    let res = op.clone().handle_task(task).await;
    assert!(res.tail_tasks.is_empty());
}

#[tokio::test]
async fn wait_task_polls_until_synchronization_done() {
    let fx = Fixture::new();
    fx.add_hook(
        "global-hooks/watcher.sh",
        r#"{"kubernetes": [{"kind": "pod", "waitForSynchronization": true}]}"#,
        "",
    );
    let op = fx.operator(FakeRelease::new(&[]));
    op.init().await.unwrap();
    op.queues().new_named_queue("main", op.task_handler());

    op.module_manager().synchronization_queued("b-1", None, true);
    let task = Task::new(TaskType::GlobalHookWaitKubernetesSynchronization);
    let res = op.clone().handle_task(task.clone()).await;
    assert_eq!(res.status, TaskStatus::Repeat);

    op.module_manager().synchronization_done("b-1");
    let res = op.clone().handle_task(task).await;
    assert_eq!(res.status, TaskStatus::Success);
}

#[tokio::test]
async fn reload_all_coalesces_adjacent_duplicates() {
    let fx = Fixture::new();
    fx.add_hook("global-hooks/before.sh", r#"{"beforeAll": 1}"#, "");
    let op = fx.operator(FakeRelease::new(&[]));
    op.init().await.unwrap();
    let main = op.queues().new_named_queue("main", op.task_handler());

    // Two adjacent duplicates, then a foreign task, then another reload
    // that must survive.
    main.add_last(Task::new(TaskType::ReloadAllModules));
    main.add_last(Task::new(TaskType::ReloadAllModules));
    main.add_last(Task::new(TaskType::ModuleRun));
    main.add_last(Task::new(TaskType::ReloadAllModules));

    let current = Task::new(TaskType::ReloadAllModules);
    let res = op.clone().handle_task(current).await;

    assert_eq!(res.status, TaskStatus::Success);
    assert_eq!(task_types(&main), vec![TaskType::ModuleRun, TaskType::ReloadAllModules]);
    // beforeAll then discover follow the coalesced reload.
    assert_eq!(res.after_tasks.len(), 2);
    assert_eq!(res.after_tasks[0].task_type(), TaskType::GlobalHookRun);
    assert_eq!(res.after_tasks[1].task_type(), TaskType::DiscoverModulesState);
}

#[tokio::test]
async fn discover_emits_module_lifecycle_and_after_all_tasks() {
    let fx = Fixture::new();
    fx.add_module("010-alpha", false);
    fx.add_hook("global-hooks/afterall.sh", r#"{"afterAll": 1}"#, "");
    let release = FakeRelease::new(&["orphan"]);
    let op = fx.operator(release);
    op.init().await.unwrap();
    op.queues().new_named_queue("main", op.task_handler());

    let task = Task::new(TaskType::DiscoverModulesState).with_metadata(HookMetadata {
        on_startup_hooks: true,
        ..Default::default()
    });
    let res = op.clone().handle_task(task).await;
    assert_eq!(res.status, TaskStatus::Success);

    let types: Vec<TaskType> = res.after_tasks.iter().map(|t| t.task_type()).collect();
    assert_eq!(types, vec![TaskType::ModuleRun, TaskType::ModulePurge, TaskType::GlobalHookRun]);
    let module_run = &res.after_tasks[0];
    assert!(module_run.metadata().on_startup_hooks);
    let after_all = &res.after_tasks[2];
    assert!(after_all.metadata().last_after_all_hook);
    assert!(!after_all.metadata().values_checksum.is_empty());
}

#[tokio::test]
async fn module_manager_retry_delays_the_queue() {
    let fx = Fixture::new();
    let op = fx.operator(FakeRelease::new(&[]));
    op.init().await.unwrap();
    op.queues().new_named_queue("main", op.task_handler());

    let res = op.clone().handle_task(Task::new(TaskType::ModuleManagerRetry)).await;
    assert_eq!(res.status, TaskStatus::Success);
    assert!(res.delay_before_next.is_some());
}

#[tokio::test]
async fn failed_module_delete_is_retried() {
    struct FailingDelete;
    #[async_trait]
    impl ReleaseEngine for FailingDelete {
        async fn install_or_upgrade(
            &self,
            _r: &str,
            _c: &Path,
            _v: &Path,
        ) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn delete(&self, _r: &str) -> Result<()> {
            anyhow::bail!("release engine down")
        }
        async fn delete_single_failed_revision(&self, _r: &str) -> Result<()> {
            Ok(())
        }
        async fn list_releases(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    let fx = Fixture::new();
    let mpath = fx.root.join("modules").join("010-demo");
    std::fs::create_dir_all(&mpath).unwrap();
    std::fs::write(mpath.join("Chart.yaml"), "name: demo\n").unwrap();

    let op = fx.operator(Arc::new(FailingDelete));
    op.init().await.unwrap();
    op.queues().new_named_queue("main", op.task_handler());

    let task = Task::new(TaskType::ModuleDelete).with_metadata(HookMetadata {
        module_name: "demo".to_string(),
        ..Default::default()
    });
    let res = op.clone().handle_task(task.clone()).await;
    assert_eq!(res.status, TaskStatus::Fail);

    // Purge for the same failure is fire-and-forget.
    let purge = Task::new(TaskType::ModulePurge).with_metadata(HookMetadata {
        module_name: "demo".to_string(),
        ..Default::default()
    });
    let res = op.clone().handle_task(purge).await;
    assert_eq!(res.status, TaskStatus::Success);
}
