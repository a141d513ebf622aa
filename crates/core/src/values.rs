//! Layered values trees with deep merge, checksums and JSON-patch support.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// SHA-256 hex of a text; the fingerprint/checksum primitive used across
/// the watcher and the values trees.
pub fn checksum_of(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// A JSON-object values tree. `serde_json::Map` keeps keys sorted, so the
/// serialized form is canonical and checksums are stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Values(pub Map<String, Value>);

impl Values {
    pub fn new() -> Self {
        Values(Map::new())
    }

    /// Build from any JSON value; null becomes empty, non-objects are rejected.
    pub fn from_value(v: Value) -> Result<Self> {
        match v {
            Value::Null => Ok(Values::new()),
            Value::Object(map) => Ok(Values(map)),
            other => Err(anyhow!("values must be a mapping, got {}", kind_of(&other))),
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let v: Value = serde_yaml::from_str(text).context("parsing values yaml")?;
        Values::from_value(v)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Deep-merge `over` into self: maps merge recursively, scalars and
    /// sequences are replaced by the overriding layer.
    pub fn merge_from(&mut self, over: &Values) {
        for (k, v) in over.0.iter() {
            merge_value(self.0.entry(k.clone()).or_insert(Value::Null), v);
        }
    }

    /// Effective values: deep-merge of layers in precedence order
    /// (earlier < later).
    pub fn merged(layers: &[&Values]) -> Values {
        let mut out = Values::new();
        for layer in layers {
            out.merge_from(layer);
        }
        out
    }

    /// Stable checksum over the canonical JSON form.
    pub fn checksum(&self) -> String {
        // Map is sorted; to_string is canonical for equal content.
        checksum_of(&Value::Object(self.0.clone()).to_string())
    }

    /// Apply an RFC 6902 patch in place.
    pub fn apply_patch(&mut self, patch: &json_patch::Patch) -> Result<()> {
        let mut doc = Value::Object(std::mem::take(&mut self.0));
        let applied = json_patch::patch(&mut doc, patch);
        match doc {
            Value::Object(map) => self.0 = map,
            other => {
                return Err(anyhow!("patch replaced the values root with {}", kind_of(&other)))
            }
        }
        applied.context("applying values patch")?;
        Ok(())
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn merge_value(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (Value::Object(d), Value::Object(s)) => {
            for (k, v) in s.iter() {
                merge_value(d.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        (d, s) => *d = s.clone(),
    }
}
