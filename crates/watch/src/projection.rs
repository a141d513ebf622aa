//! Projection of raw objects into the canonical text used for
//! fingerprinting and hook payloads.
//!
//! When a filter expression is configured, projection goes through an
//! external `jq` subprocess; its failure must never tear down a monitor.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

fn jq_path() -> String {
    std::env::var("BOSUN_JQ_PATH").unwrap_or_else(|_| "jq".to_string())
}

/// Produce the canonical projected text for an object. Without a filter the
/// canonical JSON serialization is used.
pub async fn project(object: &Value, jq_filter: Option<&str>) -> Result<String> {
    match jq_filter {
        None | Some("") => Ok(object.to_string()),
        Some(filter) => exec_jq(filter, object).await,
    }
}

async fn exec_jq(filter: &str, object: &Value) -> Result<String> {
    let mut child = Command::new(jq_path())
        .arg("-c")
        .arg(filter)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning {}", jq_path()))?;

    let payload = serde_json::to_vec(object).context("serializing object for projection")?;
    let mut stdin = child.stdin.take().expect("stdin is piped");
    stdin.write_all(&payload).await.context("writing object to jq stdin")?;
    drop(stdin);

    let out = child.wait_with_output().await.context("waiting for jq")?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(anyhow!("jq filter '{}' failed: {}", filter, stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn no_filter_serializes_canonically() {
        let obj = json!({"b": 2, "a": 1});
        let text = project(&obj, None).await.unwrap();
        // serde_json maps are sorted; the text is canonical.
        assert_eq!(text, r#"{"a":1,"b":2}"#);
        assert_eq!(text, project(&obj, Some("")).await.unwrap());
    }
}
