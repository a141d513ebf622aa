#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use bosun_core::{BindingContext, BindingType, Values};
use bosun_modules::{
    ConfigUpdate, ConfigValuesStore, ModuleEvent, ModuleManager, ModuleManagerConfig,
    ReleaseEngine,
};
use bosun_watch::WatchManager;
use serde_json::json;
use tokio_util::sync::CancellationToken;

struct FakeRelease {
    releases: Mutex<Vec<String>>,
    installs: Mutex<Vec<String>>,
    deletes: Mutex<Vec<String>>,
}

impl FakeRelease {
    fn new(releases: &[&str]) -> Arc<Self> {
        Arc::new(FakeRelease {
            releases: Mutex::new(releases.iter().map(|s| s.to_string()).collect()),
            installs: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ReleaseEngine for FakeRelease {
    async fn install_or_upgrade(
        &self,
        release: &str,
        _chart_dir: &Path,
        values_path: &Path,
    ) -> Result<Vec<String>> {
        assert!(values_path.exists(), "release values file must exist during install");
        self.installs.lock().unwrap().push(release.to_string());
        let mut releases = self.releases.lock().unwrap();
        if !releases.contains(&release.to_string()) {
            releases.push(release.to_string());
        }
        Ok(vec![format!("Deployment/addons/{}", release)])
    }

    async fn delete(&self, release: &str) -> Result<()> {
        self.deletes.lock().unwrap().push(release.to_string());
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
struct RecordingStore {
    saved_global: Mutex<Vec<Values>>,
    saved_modules: Mutex<Vec<(String, Values)>>,
}

#[async_trait]
impl ConfigValuesStore for RecordingStore {
    async fn save_global(&self, values: &Values) -> Result<()> {
        self.saved_global.lock().unwrap().push(values.clone());
        Ok(())
    }

    async fn save_module(&self, module: &str, values: &Values) -> Result<()> {
        self.saved_modules.lock().unwrap().push((module.to_string(), values.clone()));
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
        std::fs::create_dir_all(root.join("tmp")).unwrap();
        Fixture { _dir: dir, root }
    }

    fn add_module(&self, dir_name: &str, values_yaml: Option<&str>) -> PathBuf {
        let path = self.root.join("modules").join(dir_name);
        std::fs::create_dir_all(&path).unwrap();
        if let Some(text) = values_yaml {
            std::fs::write(path.join("values.yaml"), text).unwrap();
        }
        path
    }

    fn write_script(&self, path: &Path, body: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
        let mut perms = std::fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).unwrap();
    }

    fn add_hook(&self, rel_path: &str, config_json: &str, body: &str) {
        let script = format!(
            "#!/bin/sh\nif [ \"$1\" = \"--config\" ]; then\n  echo '{}'\n  exit 0\nfi\n{}\n",
            config_json, body
        );
        self.write_script(&self.root.join(rel_path), &script);
    }

    fn manager(&self, release: Arc<dyn ReleaseEngine>) -> ModuleManager {
        self.manager_with_store(release, Arc::new(RecordingStore::default()))
    }

    fn manager_with_store(
        &self,
        release: Arc<dyn ReleaseEngine>,
        store: Arc<RecordingStore>,
    ) -> ModuleManager {
        let watch = Arc::new(WatchManager::new(CancellationToken::new()));
        ModuleManager::new(
            ModuleManagerConfig {
                modules_dir: self.root.join("modules"),
                global_hooks_dir: self.root.join("global-hooks"),
                tmp_dir: self.root.join("tmp"),
            },
            watch,
            release,
            store,
        )
    }
}

#[tokio::test]
async fn init_indexes_modules_and_hooks_in_order() {
    let fx = Fixture::new();
    fx.add_module("020-beta", None);
    fx.add_module("010-alpha", Some("replicas: 1\n"));
    fx.add_module("junk", None);
    fx.add_hook("global-hooks/second.sh", r#"{"onStartup": 20}"#, "");
    fx.add_hook("global-hooks/first.sh", r#"{"onStartup": 10}"#, "");
    fx.add_hook("global-hooks/none.sh", r#"{}"#, "");

    let mm = fx.manager(FakeRelease::new(&[]));
    mm.init().await.unwrap();

    assert_eq!(mm.get_module_names_in_order(), vec!["alpha", "beta"]);
    assert_eq!(
        mm.get_global_hooks_in_order(BindingType::OnStartup),
        vec!["first.sh", "second.sh"]
    );
    assert!(mm.get_global_hooks_in_order(BindingType::BeforeAll).is_empty());
}

#[tokio::test]
async fn discover_is_deterministic_and_ordered() {
    let fx = Fixture::new();
    fx.add_module("010-alpha", None);
    fx.add_module("020-beta", None);
    let mm = fx.manager(FakeRelease::new(&["orphan"]));
    mm.init().await.unwrap();

    let first = mm.discover_modules_state().await.unwrap();
    assert_eq!(first.enabled_modules, vec!["alpha", "beta"]);
    assert_eq!(first.newly_enabled_modules, vec!["alpha", "beta"]);
    assert_eq!(first.released_unknown_modules, vec!["orphan"]);
    assert!(first.modules_to_disable.is_empty());

    // Identical inputs, identical output (minus the newly-enabled delta).
    let second = mm.discover_modules_state().await.unwrap();
    assert_eq!(second.enabled_modules, first.enabled_modules);
    assert!(second.newly_enabled_modules.is_empty());
}

#[tokio::test]
async fn module_reenabled_by_preceding_module_shows_up_as_newly_enabled() {
    let fx = Fixture::new();
    fx.add_module("010-first", Some("enabled: false\n"));
    let second = fx.add_module("020-second", None);
    // Enabled only when "first" is already enabled.
    fx.write_script(
        &second.join("enabled"),
        "#!/bin/sh\ngrep -q first \"$ENABLED_MODULES_PATH\"\n",
    );

    let mm = fx.manager(FakeRelease::new(&[]));
    mm.init().await.unwrap();

    let state = mm.discover_modules_state().await.unwrap();
    assert!(state.enabled_modules.is_empty());

    // The config enables "first"; "second" follows through its script.
    mm.apply_config(
        ConfigUpdate {
            global: None,
            modules: BTreeMap::from([("first".to_string(), "enabled: true\n".to_string())]),
        },
        false,
    )
    .unwrap();

    let state = mm.discover_modules_state().await.unwrap();
    assert_eq!(state.enabled_modules, vec!["first", "second"]);
    assert_eq!(state.newly_enabled_modules, vec!["first", "second"]);
}

#[tokio::test]
async fn disabling_a_released_module_schedules_disable() {
    let fx = Fixture::new();
    fx.add_module("010-alpha", None);
    let mm = fx.manager(FakeRelease::new(&["alpha"]));
    mm.init().await.unwrap();

    let state = mm.discover_modules_state().await.unwrap();
    assert_eq!(state.enabled_modules, vec!["alpha"]);

    mm.apply_config(
        ConfigUpdate {
            global: None,
            modules: BTreeMap::from([("alpha".to_string(), "enabled: false\n".to_string())]),
        },
        false,
    )
    .unwrap();

    let state = mm.discover_modules_state().await.unwrap();
    assert!(state.enabled_modules.is_empty());
    assert_eq!(state.modules_to_disable, vec!["alpha"]);
}

#[tokio::test]
async fn global_hook_patches_flow_into_layers_and_store() {
    let fx = Fixture::new();
    fx.add_hook(
        "global-hooks/setter.sh",
        r#"{"onStartup": 1}"#,
        r#"echo '[{"op":"add","path":"/global/fromConfig","value":"c"}]' > "$CONFIG_VALUES_JSON_PATCH_PATH"
echo '[{"op":"add","path":"/global/fromDynamic","value":"d"}]' > "$VALUES_JSON_PATCH_PATH""#,
    );
    let store = Arc::new(RecordingStore::default());
    let mm = fx.manager_with_store(FakeRelease::new(&[]), store.clone());
    mm.init().await.unwrap();

    let (before, after) = mm
        .run_global_hook("setter.sh", &[BindingContext::lifecycle(BindingType::OnStartup)])
        .await
        .unwrap();
    assert_ne!(before, after);
    assert_eq!(
        mm.global_values().as_value(),
        json!({"fromConfig": "c", "fromDynamic": "d"})
    );
    assert_eq!(mm.global_config_values().as_value(), json!({"fromConfig": "c"}));

    // The config-values layer is persisted; the dynamic layer is not.
    let saved = store.saved_global.lock().unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].as_value(), json!({"fromConfig": "c"}));
    assert!(store.saved_modules.lock().unwrap().is_empty());
}

#[tokio::test]
async fn module_run_executes_hooks_and_release_in_sequence() {
    let fx = Fixture::new();
    let mpath = fx.add_module("010-demo", Some("replicas: 1\n"));
    std::fs::write(mpath.join("Chart.yaml"), "name: demo\nversion: 0.1.0\n").unwrap();
    fx.add_hook(
        "modules/010-demo/hooks/after.sh",
        r#"{"afterHelm": 1}"#,
        r#"echo '[{"op":"add","path":"/demo/tuned","value":true}]' > "$VALUES_JSON_PATCH_PATH""#,
    );

    let release = FakeRelease::new(&[]);
    let mm = fx.manager(release.clone());
    mm.init().await.unwrap();

    let (values_changed, manifests) = mm.run_module("demo").await.unwrap();
    assert!(values_changed, "afterHelm patch must flip the checksum");
    assert_eq!(manifests.unwrap(), vec!["Deployment/addons/demo"]);
    assert_eq!(*release.installs.lock().unwrap(), vec!["demo"]);
    assert_eq!(mm.module_values("demo").as_value(), json!({"replicas": 1, "tuned": true}));

    // A second run without further patches reports no change.
    let (values_changed, _) = mm.run_module("demo").await.unwrap();
    assert!(!values_changed);
}

#[tokio::test]
async fn delete_module_removes_release_and_dynamic_state() {
    let fx = Fixture::new();
    let mpath = fx.add_module("010-demo", None);
    std::fs::write(mpath.join("Chart.yaml"), "name: demo\n").unwrap();
    let release = FakeRelease::new(&["demo"]);
    let mm = fx.manager(release.clone());
    mm.init().await.unwrap();

    mm.delete_module("demo").await.unwrap();
    assert_eq!(*release.deletes.lock().unwrap(), vec!["demo"]);
}

#[tokio::test]
async fn ambiguous_config_update_stashes_and_retries() {
    let fx = Fixture::new();
    fx.add_module("010-alpha", None);
    let mm = fx.manager(FakeRelease::new(&[]));
    mm.init().await.unwrap();
    let mut events = mm.take_events().unwrap();

    // Global section applies, the module section is broken YAML.
    mm.apply_config(
        ConfigUpdate {
            global: Some("tier: prod\n".to_string()),
            modules: BTreeMap::from([("alpha".to_string(), "{broken".to_string())]),
        },
        false,
    )
    .unwrap();
    assert_eq!(events.try_recv().unwrap(), ModuleEvent::AmbiguousState);

    // Retry re-applies the same stashed update: still ambiguous.
    mm.retry();
    assert_eq!(events.try_recv().unwrap(), ModuleEvent::AmbiguousState);

    // A corrected update goes through and reports the changed module.
    mm.apply_config(
        ConfigUpdate {
            global: Some("tier: prod\n".to_string()),
            modules: BTreeMap::from([("alpha".to_string(), "size: 3\n".to_string())]),
        },
        false,
    )
    .unwrap();
    assert_eq!(
        events.try_recv().unwrap(),
        ModuleEvent::ModulesChanged(vec!["alpha".to_string()])
    );
}

#[tokio::test]
async fn global_change_suppresses_per_module_events() {
    let fx = Fixture::new();
    fx.add_module("010-alpha", None);
    let mm = fx.manager(FakeRelease::new(&[]));
    mm.init().await.unwrap();
    let mut events = mm.take_events().unwrap();

    mm.apply_config(
        ConfigUpdate {
            global: Some("tier: prod\n".to_string()),
            modules: BTreeMap::from([("alpha".to_string(), "size: 3\n".to_string())]),
        },
        false,
    )
    .unwrap();
    assert_eq!(events.try_recv().unwrap(), ModuleEvent::GlobalChanged);
    assert!(events.try_recv().is_err(), "no ModulesChanged after GlobalChanged");
}

#[tokio::test]
async fn initial_config_parse_error_is_fatal() {
    let fx = Fixture::new();
    let mm = fx.manager(FakeRelease::new(&[]));
    mm.init().await.unwrap();
    let err = mm
        .apply_config(
            ConfigUpdate { global: Some("{broken".to_string()), modules: BTreeMap::new() },
            true,
        )
        .unwrap_err();
    assert!(format!("{:#}", err).contains("global"));
}

#[tokio::test]
async fn synchronization_registry_tracks_wait_entries() {
    let fx = Fixture::new();
    fx.add_hook(
        "global-hooks/watcher.sh",
        r#"{"kubernetes": [{"kind": "pod", "waitForSynchronization": true}]}"#,
        "",
    );
    let mm = fx.manager(FakeRelease::new(&[]));
    mm.init().await.unwrap();

    assert!(mm.global_synchronization_needed());
    assert!(mm.global_synchronization_done(), "vacuously done before queuing");

    mm.synchronization_queued("id-1", None, true);
    mm.synchronization_queued("id-2", None, false);
    assert!(!mm.global_synchronization_done());

    mm.synchronization_done("id-1");
    // The non-wait entry does not block.
    assert!(mm.global_synchronization_done());
}

#[tokio::test]
async fn module_synchronization_flags() {
    let fx = Fixture::new();
    fx.add_module("010-demo", None);
    fx.add_hook(
        "modules/010-demo/hooks/watch.sh",
        r#"{"kubernetes": [{"kind": "configmap"}]}"#,
        "",
    );
    let mm = fx.manager(FakeRelease::new(&[]));
    mm.init().await.unwrap();

    assert!(mm.module_synchronization_needed("demo"));
    assert!(!mm.module_synchronization_queued("demo"));
    assert!(!mm.module_synchronization_done("demo"));

    mm.synchronization_queued("bid", Some("demo"), true);
    assert!(mm.module_synchronization_queued("demo"));
    assert!(!mm.module_synchronization_done("demo"));
    mm.synchronization_done("bid");
    assert!(mm.module_synchronization_done("demo"));
}
