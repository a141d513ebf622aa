//! Release engine seam. The package manager is an external collaborator;
//! only the interface the converge machine consumes lives here, with a
//! default implementation shelling out to the `helm` binary.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[async_trait]
pub trait ReleaseEngine: Send + Sync {
    /// Install or upgrade a release from a chart directory; returns the ids
    /// (`kind/namespace/name`) of the manifests in the release.
    async fn install_or_upgrade(
        &self,
        release: &str,
        chart_dir: &Path,
        values_path: &Path,
    ) -> Result<Vec<String>>;

    async fn delete(&self, release: &str) -> Result<()>;

    /// Prune a stale single failed first revision before a retry.
    async fn delete_single_failed_revision(&self, release: &str) -> Result<()>;

    async fn list_releases(&self) -> Result<Vec<String>>;
}

/// Shell-out implementation over the `helm` CLI.
pub struct HelmCli {
    namespace: String,
    binary: String,
}

impl HelmCli {
    pub fn new(namespace: &str) -> Self {
        let binary = std::env::var("BOSUN_HELM_PATH").unwrap_or_else(|_| "helm".to_string());
        HelmCli { namespace: namespace.to_string(), binary }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!(helm = %self.binary, args = ?args, "helm invocation");
        let out = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("running {} {}", self.binary, args.join(" ")))?;
        if !out.status.success() {
            return Err(anyhow!(
                "helm {} failed: {}: {}",
                args.first().copied().unwrap_or(""),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).to_string())
    }
}

#[derive(Debug, Deserialize)]
struct HelmStatus {
    info: HelmStatusInfo,
    version: u64,
}

#[derive(Debug, Deserialize)]
struct HelmStatusInfo {
    status: String,
}

#[async_trait]
impl ReleaseEngine for HelmCli {
    async fn install_or_upgrade(
        &self,
        release: &str,
        chart_dir: &Path,
        values_path: &Path,
    ) -> Result<Vec<String>> {
        info!(release, chart = %chart_dir.display(), "helm upgrade --install");
        self.run(&[
            "upgrade",
            release,
            &chart_dir.display().to_string(),
            "--install",
            "--namespace",
            &self.namespace,
            "--values",
            &values_path.display().to_string(),
        ])
        .await?;

        let manifest =
            self.run(&["get", "manifest", release, "--namespace", &self.namespace]).await?;
        Ok(manifest_ids(&manifest, &self.namespace))
    }

    async fn delete(&self, release: &str) -> Result<()> {
        info!(release, "helm uninstall");
        self.run(&["uninstall", release, "--namespace", &self.namespace]).await?;
        Ok(())
    }

    async fn delete_single_failed_revision(&self, release: &str) -> Result<()> {
        let out = self
            .run(&["status", release, "--namespace", &self.namespace, "-o", "json"])
            .await;
        let status: HelmStatus = match out {
            Ok(text) => serde_json::from_str(&text).context("parsing helm status")?,
            // No such release: nothing to prune.
            Err(_) => return Ok(()),
        };
        if status.version == 1 && status.info.status == "failed" {
            warn!(release, "pruning single failed first revision");
            self.run(&["uninstall", release, "--namespace", &self.namespace]).await?;
        }
        Ok(())
    }

    async fn list_releases(&self) -> Result<Vec<String>> {
        let out = self.run(&["list", "-q", "--namespace", &self.namespace]).await?;
        Ok(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }
}

#[derive(Debug, Deserialize)]
struct ManifestHeader {
    kind: Option<String>,
    metadata: Option<ManifestMeta>,
}

#[derive(Debug, Deserialize)]
struct ManifestMeta {
    name: Option<String>,
    namespace: Option<String>,
}

/// `kind/namespace/name` ids from a multi-document manifest stream.
fn manifest_ids(manifest: &str, default_namespace: &str) -> Vec<String> {
    let mut ids = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(manifest) {
        let header: ManifestHeader = match ManifestHeader::deserialize(doc) {
            Ok(h) => h,
            Err(_) => continue,
        };
        let (kind, meta) = match (header.kind, header.metadata) {
            (Some(k), Some(m)) => (k, m),
            _ => continue,
        };
        let name = match meta.name {
            Some(n) => n,
            None => continue,
        };
        let ns = meta.namespace.unwrap_or_else(|| default_namespace.to_string());
        ids.push(format!("{}/{}/{}", kind, ns, name));
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_ids_from_multi_doc_stream() {
        let manifest = r#"
---
apiVersion: v1
kind: Service
metadata:
  name: web
  namespace: apps
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
---
# comment-only document
"#;
        let ids = manifest_ids(manifest, "addons");
        assert_eq!(ids, vec!["Service/apps/web", "Deployment/addons/web"]);
    }
}
