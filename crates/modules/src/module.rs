//! On-disk module representation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bosun_core::Values;
use tracing::{debug, warn};

/// A module directory entry: `NNN-<name>`, numeric prefix gives the global
/// execution order.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub directory_name: String,
    pub path: PathBuf,
    /// Values from the module's `values.yaml`, `enabled` key removed.
    pub static_values: Values,
    /// `enabled` key of `values.yaml`, when present.
    pub static_enabled: Option<bool>,
    pub has_chart: bool,
    pub is_ready: bool,
}

impl Module {
    /// Parse a directory entry name; `None` when it does not match
    /// `^[0-9]{3}-(.+)$`.
    pub fn parse_directory_name(dir_name: &str) -> Option<String> {
        let (prefix, rest) = dir_name.split_at_checked(3)?;
        if !prefix.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let name = rest.strip_prefix('-')?;
        if name.is_empty() {
            return None;
        }
        Some(name.to_string())
    }

    pub fn load(modules_dir: &Path, dir_name: &str) -> Result<Option<Module>> {
        let name = match Module::parse_directory_name(dir_name) {
            Some(n) => n,
            None => return Ok(None),
        };
        let path = modules_dir.join(dir_name);
        let (static_values, static_enabled) = read_module_values(&path)?;
        let has_chart = path.join("Chart.yaml").exists();
        debug!(module = %name, has_chart, "module loaded");
        Ok(Some(Module {
            name,
            directory_name: dir_name.to_string(),
            path,
            static_values,
            static_enabled,
            has_chart,
            is_ready: false,
        }))
    }

    pub fn hooks_dir(&self) -> PathBuf {
        self.path.join("hooks")
    }

    pub fn enabled_script(&self) -> PathBuf {
        self.path.join("enabled")
    }

    /// Run the module's `enabled` executable with the list of already
    /// enabled preceding modules. Missing script means enabled; non-zero
    /// exit means disabled.
    pub async fn check_enabled_script(
        &self,
        preceding_enabled: &[String],
        tmp_dir: &Path,
    ) -> Result<bool> {
        let script = self.enabled_script();
        if !script.exists() {
            return Ok(true);
        }
        let list_path = tmp_dir.join(format!("enabled-modules-{}.json", self.name));
        std::fs::write(&list_path, serde_json::to_vec(preceding_enabled)?)
            .with_context(|| format!("writing {}", list_path.display()))?;

        let out = tokio::process::Command::new(&script)
            .current_dir(&self.path)
            .env("ENABLED_MODULES_PATH", &list_path)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("running enabled script of module '{}'", self.name))?;
        let _ = std::fs::remove_file(&list_path);

        if !out.status.success() {
            debug!(module = %self.name, status = %out.status, "enabled script disabled module");
        }
        Ok(out.status.success())
    }
}

/// Read `values.yaml`, splitting the reserved `enabled` key from the values.
fn read_module_values(module_path: &Path) -> Result<(Values, Option<bool>)> {
    let values_path = module_path.join("values.yaml");
    if !values_path.exists() {
        return Ok((Values::new(), None));
    }
    let text = std::fs::read_to_string(&values_path)
        .with_context(|| format!("reading {}", values_path.display()))?;
    let mut values =
        Values::from_yaml(&text).with_context(|| format!("bad {}", values_path.display()))?;
    let enabled = match values.0.remove("enabled") {
        Some(serde_json::Value::Bool(b)) => Some(b),
        Some(other) => {
            warn!(module_path = %module_path.display(), "ignoring non-boolean 'enabled' key: {}", other);
            None
        }
        None => None,
    };
    Ok((values, enabled))
}

/// Module names as used in values documents handed to hooks and the release
/// engine: kebab-case directory names become camelCase sections.
pub fn camelcase(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for c in name.chars() {
        if c == '-' || c == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}
