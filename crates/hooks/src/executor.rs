//! Hook executable invocation.
//!
//! Inputs are handed over as files whose paths travel in environment
//! variables; patches come back the same way. Exit 0 is success, anything
//! else a failure the caller maps onto the task result.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bosun_core::{BindingContext, Values};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HookConfig;

/// Environment contract of the hook executable.
const VALUES_PATH: &str = "VALUES_PATH";
const CONFIG_VALUES_PATH: &str = "CONFIG_VALUES_PATH";
const BINDING_CONTEXT_PATH: &str = "BINDING_CONTEXT_PATH";
const VALUES_JSON_PATCH_PATH: &str = "VALUES_JSON_PATCH_PATH";
const CONFIG_VALUES_JSON_PATCH_PATH: &str = "CONFIG_VALUES_JSON_PATCH_PATH";

/// One hook invocation.
pub struct HookInput<'a> {
    pub hook_path: &'a Path,
    pub working_dir: &'a Path,
    pub binding_contexts: &'a [BindingContext],
    pub values: &'a Values,
    pub config_values: &'a Values,
    pub extra_env: Vec<(String, String)>,
}

/// Parsed patch output of a successful invocation.
#[derive(Debug, Default)]
pub struct HookOutput {
    pub values_patch: Option<json_patch::Patch>,
    pub config_values_patch: Option<json_patch::Patch>,
}

pub struct HookExecutor {
    tmp_dir: PathBuf,
}

impl HookExecutor {
    pub fn new(tmp_dir: impl Into<PathBuf>) -> Self {
        HookExecutor { tmp_dir: tmp_dir.into() }
    }

    /// Ask a hook for its binding configuration (`<hook> --config`).
    pub async fn detect_config(&self, hook_path: &Path) -> Result<HookConfig> {
        let out = Command::new(hook_path)
            .arg("--config")
            .current_dir(hook_path.parent().unwrap_or(Path::new(".")))
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("running {} --config", hook_path.display()))?;
        if !out.status.success() {
            return Err(anyhow!(
                "hook '{}' --config failed: {} {}",
                hook_path.display(),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        let text = String::from_utf8_lossy(&out.stdout);
        HookConfig::parse(&text)
            .with_context(|| format!("parsing config of hook '{}'", hook_path.display()))
    }

    /// Run the hook with the file/env contract and collect its patches.
    pub async fn execute(&self, input: HookInput<'_>) -> Result<HookOutput> {
        let run_dir = self.tmp_dir.join(format!("hook-run-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&run_dir)
            .with_context(|| format!("creating {}", run_dir.display()))?;
        let result = self.execute_in(&run_dir, input).await;
        // Run artifacts are one-shot; leave nothing behind.
        let _ = std::fs::remove_dir_all(&run_dir);
        result
    }

    async fn execute_in(&self, run_dir: &Path, input: HookInput<'_>) -> Result<HookOutput> {
        let contexts_path = run_dir.join("binding_context.json");
        let values_path = run_dir.join("values.json");
        let config_values_path = run_dir.join("config_values.json");
        let values_patch_path = run_dir.join("values_patch.json");
        let config_values_patch_path = run_dir.join("config_values_patch.json");

        write_json(&contexts_path, &serde_json::to_value(input.binding_contexts)?)?;
        write_json(&values_path, &input.values.as_value())?;
        write_json(&config_values_path, &input.config_values.as_value())?;
        std::fs::write(&values_patch_path, b"").context("creating values patch file")?;
        std::fs::write(&config_values_patch_path, b"").context("creating config patch file")?;

        let hook = input.hook_path.display().to_string();
        debug!(hook = %hook, contexts = input.binding_contexts.len(), "executing hook");

        let mut cmd = Command::new(input.hook_path);
        cmd.current_dir(input.working_dir)
            .env(VALUES_PATH, &values_path)
            .env(CONFIG_VALUES_PATH, &config_values_path)
            .env(BINDING_CONTEXT_PATH, &contexts_path)
            .env(VALUES_JSON_PATCH_PATH, &values_patch_path)
            .env(CONFIG_VALUES_JSON_PATCH_PATH, &config_values_patch_path)
            .kill_on_drop(true);
        for (k, v) in input.extra_env.iter() {
            cmd.env(k, v);
        }

        let out = cmd.output().await.with_context(|| format!("running hook '{}'", hook))?;
        log_output(&hook, "stdout", &out.stdout);
        log_output(&hook, "stderr", &out.stderr);

        if !out.status.success() {
            return Err(anyhow!(
                "hook '{}' failed: {}: {}",
                hook,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }

        Ok(HookOutput {
            values_patch: read_patch(&values_patch_path)
                .with_context(|| format!("values patch of hook '{}'", hook))?,
            config_values_patch: read_patch(&config_values_patch_path)
                .with_context(|| format!("config values patch of hook '{}'", hook))?,
        })
    }
}

fn write_json(path: &Path, value: &serde_json::Value) -> Result<()> {
    let data = serde_json::to_vec(value)?;
    std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// A patch file is either empty (no patch) or a single RFC 6902 document.
fn read_patch(path: &Path) -> Result<Option<json_patch::Patch>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let patch: json_patch::Patch = serde_json::from_str(text).context("parsing json patch")?;
    Ok(Some(patch))
}

fn log_output(hook: &str, stream: &str, bytes: &[u8]) {
    for line in String::from_utf8_lossy(bytes).lines() {
        if line.trim().is_empty() {
            continue;
        }
        if stream == "stderr" {
            warn!(hook = %hook, "{}", line);
        } else {
            info!(hook = %hook, "{}", line);
        }
    }
}
