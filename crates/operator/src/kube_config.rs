//! Values ConfigMap source.
//!
//! Loads and watches the cluster ConfigMap holding config values: data key
//! `global` plus one key per module, each a YAML document. Writes carry a
//! checksum annotation so our own updates do not re-trigger reloads.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bosun_core::{checksum_of, Values};
use bosun_modules::{ConfigUpdate, ConfigValuesStore};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, Patch, PatchParams},
    runtime::watcher::{self, Event},
    Client,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Annotation carrying a JSON map of section checksums of our own writes.
pub const CHECKSUMS_ANNOTATION: &str = "bosun.io/values-checksums";

pub struct KubeConfigManager {
    namespace: String,
    name: String,
    /// Section -> checksum of the last value we wrote ourselves.
    own_checksums: Mutex<HashMap<String, String>>,
    stop: CancellationToken,
}

impl KubeConfigManager {
    pub fn new(namespace: &str, name: &str, stop: CancellationToken) -> Self {
        KubeConfigManager {
            namespace: namespace.to_string(),
            name: name.to_string(),
            own_checksums: Mutex::new(HashMap::new()),
            stop,
        }
    }

    fn api(client: Client, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(client, namespace)
    }

    /// Initial load; a missing ConfigMap is an empty config.
    pub async fn load(&self) -> Result<ConfigUpdate> {
        let client = Client::try_default().await?;
        let api = Self::api(client, &self.namespace);
        let cm = api
            .get_opt(&self.name)
            .await
            .with_context(|| format!("getting configmap {}/{}", self.namespace, self.name))?;
        match cm {
            Some(cm) => Ok(update_from_data(cm.data.unwrap_or_default())),
            None => {
                info!(name = %self.name, "values configmap not found; starting empty");
                Ok(ConfigUpdate::default())
            }
        }
    }

    /// Watch the ConfigMap and push updates, suppressing sections that
    /// match our own last write.
    pub fn start(self: &std::sync::Arc<Self>, tx: mpsc::Sender<ConfigUpdate>) {
        let this = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if this.stop.is_cancelled() {
                    return;
                }
                let client = match Client::try_default().await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "kube client unavailable for config watch");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };
                let api = Self::api(client, &this.namespace);
                let cfg = watcher::Config::default()
                    .fields(&format!("metadata.name={}", this.name));
                let stream = watcher::watcher(api, cfg);
                futures::pin_mut!(stream);
                loop {
                    tokio::select! {
                        maybe = stream.try_next() => {
                            match maybe {
                                Ok(Some(Event::Applied(cm))) => {
                                    if let Some(update) = this.filtered_update(cm) {
                                        if tx.send(update).await.is_err() { return; }
                                    }
                                }
                                Ok(Some(Event::Restarted(list))) => {
                                    for cm in list {
                                        if let Some(update) = this.filtered_update(cm) {
                                            if tx.send(update).await.is_err() { return; }
                                        }
                                    }
                                }
                                Ok(Some(Event::Deleted(_))) => {
                                    debug!("values configmap deleted");
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(error = %e, "config watch error; restarting");
                                    break;
                                }
                            }
                        }
                        _ = this.stop.cancelled() => return,
                    }
                }
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        });
    }

    /// Build an update from a ConfigMap, dropping sections whose checksum
    /// matches our own last write.
    fn filtered_update(&self, cm: ConfigMap) -> Option<ConfigUpdate> {
        let data = cm.data.unwrap_or_default();
        let own = self.own_checksums.lock().unwrap();
        let mut update = ConfigUpdate::default();
        let mut any = false;
        for (key, text) in data {
            if own.get(&key).map(String::as_str) == Some(checksum_of(&text).as_str()) {
                debug!(section = %key, "own write; section suppressed");
                continue;
            }
            any = true;
            if key == "global" {
                update.global = Some(text);
            } else {
                update.modules.insert(key, text);
            }
        }
        if any {
            Some(update)
        } else {
            None
        }
    }

    async fn save_section(&self, section: &str, values: &Values) -> Result<()> {
        let text = serde_yaml::to_string(&values.as_value())
            .context("serializing config values section")?;
        let checksum = checksum_of(&text);
        self.own_checksums.lock().unwrap().insert(section.to_string(), checksum.clone());

        let annotation = {
            let own = self.own_checksums.lock().unwrap();
            serde_json::to_string(&own.iter().collect::<BTreeMap<_, _>>())
                .context("serializing checksum annotation")?
        };

        let client = Client::try_default().await?;
        let api = Self::api(client, &self.namespace);
        let patch = json!({
            "metadata": {"annotations": {CHECKSUMS_ANNOTATION: annotation}},
            "data": {section: text},
        });
        api.patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("patching configmap section '{}'", section))?;
        info!(section, "config values saved");
        Ok(())
    }
}

#[async_trait]
impl ConfigValuesStore for KubeConfigManager {
    async fn save_global(&self, values: &Values) -> Result<()> {
        self.save_section("global", values).await
    }

    async fn save_module(&self, module: &str, values: &Values) -> Result<()> {
        self.save_section(module, values).await
    }
}

fn update_from_data(data: BTreeMap<String, String>) -> ConfigUpdate {
    let mut update = ConfigUpdate::default();
    for (key, text) in data {
        if key == "global" {
            update.global = Some(text);
        } else {
            update.modules.insert(key, text);
        }
    }
    update
}
