//! Ignition config handling
//!
//! Parse, write and merge ignition configs, and pull individual files (the
//! pull secret above all) out of a config. Configs are kept as JSON values;
//! merging follows the ignition convention of keyed-list union: storage
//! files merge by `path`, systemd units and passwd users by `name`, and the
//! override wins on scalar conflicts.

use std::path::Path;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
#[cfg(test)]
use mockall::automock;
use serde_json::{json, Map, Value};

use crate::{Error, Result};

/// An ignition config, held as raw JSON
pub type IgnitionConfig = Value;

/// The empty nested `ignition.config` value.
///
/// Assigned into a host override before merging so only the storage/systemd
/// overrides survive, not the nested merge/replace source references.
pub fn empty_ignition_config() -> Value {
    json!({})
}

/// Capability interface over ignition files
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IgnitionHandler: Send + Sync {
    /// Read and parse an ignition file
    async fn parse_ignition_file(&self, path: &Path) -> Result<IgnitionConfig>;

    /// Serialize a config back to a file
    async fn write_ignition_file(&self, path: &Path, config: IgnitionConfig) -> Result<()>;

    /// Merge `overrides` on top of `base`
    fn merge_ignition_config(
        &self,
        base: &IgnitionConfig,
        overrides: &IgnitionConfig,
    ) -> Result<IgnitionConfig>;
}

/// File-backed [`IgnitionHandler`]
#[derive(Default, Clone)]
pub struct FileIgnition;

#[async_trait]
impl IgnitionHandler for FileIgnition {
    async fn parse_ignition_file(&self, path: &Path) -> Result<IgnitionConfig> {
        let data = tokio::fs::read(path).await?;
        serde_json::from_slice(&data)
            .map_err(|e| Error::ignition(format!("parsing {}: {}", path.display(), e)))
    }

    async fn write_ignition_file(&self, path: &Path, config: IgnitionConfig) -> Result<()> {
        let data = serde_json::to_vec(&config)?;
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    fn merge_ignition_config(
        &self,
        base: &IgnitionConfig,
        overrides: &IgnitionConfig,
    ) -> Result<IgnitionConfig> {
        Ok(merge_values(base, overrides))
    }
}

/// Key used to unify a keyed-list entry, if the list is one of the keyed
/// ignition lists.
fn merge_key(entry: &Value) -> Option<(&'static str, String)> {
    let obj = entry.as_object()?;
    if let Some(path) = obj.get("path").and_then(Value::as_str) {
        return Some(("path", path.to_string()));
    }
    if let Some(name) = obj.get("name").and_then(Value::as_str) {
        return Some(("name", name.to_string()));
    }
    None
}

fn merge_values(base: &Value, overrides: &Value) -> Value {
    match (base, overrides) {
        (Value::Object(base_map), Value::Object(override_map)) => {
            let mut merged: Map<String, Value> = base_map.clone();
            for (key, override_value) in override_map {
                let combined = match merged.get(key) {
                    Some(base_value) => merge_values(base_value, override_value),
                    None => override_value.clone(),
                };
                merged.insert(key.clone(), combined);
            }
            Value::Object(merged)
        }
        (Value::Array(base_items), Value::Array(override_items)) => {
            let mut merged = base_items.clone();
            for override_item in override_items {
                let key = merge_key(override_item);
                let existing = key.as_ref().and_then(|(field, value)| {
                    merged.iter().position(|item| {
                        item.get(field).and_then(Value::as_str) == Some(value.as_str())
                    })
                });
                match existing {
                    Some(index) => merged[index] = merge_values(&merged[index], override_item),
                    None => merged.push(override_item.clone()),
                }
            }
            Value::Array(merged)
        }
        // scalar or type conflict: the override wins
        (_, other) => other.clone(),
    }
}

/// Extract one file's content from an ignition config.
///
/// Contents are data-URLs; base64 and plain encodings are handled.
pub fn file_content_from_ignition(config: &IgnitionConfig, file_path: &str) -> Result<Vec<u8>> {
    let files = config
        .pointer("/storage/files")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::ignition("no storage files in ignition"))?;
    for file in files {
        if file.get("path").and_then(Value::as_str) == Some(file_path) {
            let source = file
                .pointer("/contents/source")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::ignition(format!("{} has no contents source", file_path)))?;
            return decode_data_url(source);
        }
    }
    Err(Error::ignition(format!(
        "path {} not found in ignition",
        file_path
    )))
}

fn decode_data_url(source: &str) -> Result<Vec<u8>> {
    let raw = source
        .strip_prefix("data:")
        .ok_or_else(|| Error::ignition(format!("unsupported contents source {}", source)))?;
    let (meta, payload) = raw
        .split_once(',')
        .ok_or_else(|| Error::ignition("malformed data url"))?;
    if meta.ends_with(";base64") {
        BASE64
            .decode(payload)
            .map_err(|e| Error::ignition(format!("bad base64 payload: {}", e)))
    } else {
        Ok(payload.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn handler() -> FileIgnition {
        FileIgnition
    }

    #[tokio::test]
    async fn parse_and_write_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("master.ign");
        let config = json!({"ignition": {"version": "3.2.0"}});
        handler()
            .write_ignition_file(&path, config.clone())
            .await
            .unwrap();
        let parsed = handler().parse_ignition_file(&path).await.unwrap();
        assert_eq!(parsed, config);
    }

    #[tokio::test]
    async fn parse_rejects_malformed_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.ign");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(matches!(
            handler().parse_ignition_file(&path).await,
            Err(Error::Ignition(_))
        ));
    }

    #[test]
    fn merge_unions_files_by_path() {
        let base = json!({
            "ignition": {"version": "3.2.0"},
            "storage": {"files": [
                {"path": "/etc/motd", "contents": {"source": "data:,base"}},
            ]}
        });
        let overrides = json!({
            "storage": {"files": [
                {"path": "/etc/motd", "contents": {"source": "data:,override"}},
                {"path": "/etc/hostname", "contents": {"source": "data:,node0"}},
            ]}
        });
        let merged = handler().merge_ignition_config(&base, &overrides).unwrap();
        let files = merged.pointer("/storage/files").unwrap().as_array().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(
            files[0].pointer("/contents/source").unwrap(),
            "data:,override"
        );
        assert_eq!(merged.pointer("/ignition/version").unwrap(), "3.2.0");
    }

    #[test]
    fn merge_with_emptied_nested_config_keeps_base_references() {
        // single-node merge: the host override has its nested ignition.config
        // emptied so only storage/systemd overrides apply
        let base = json!({
            "ignition": {"version": "3.2.0", "config": {"merge": [{"source": "https://api:22623"}]}},
        });
        let mut overrides = json!({
            "ignition": {"version": "3.2.0", "config": {"merge": [{"source": "https://other"}]}},
            "storage": {"files": [{"path": "/etc/hostname", "contents": {"source": "data:,sno"}}]}
        });
        overrides["ignition"]["config"] = empty_ignition_config();
        let merged = handler().merge_ignition_config(&base, &overrides).unwrap();
        assert_eq!(
            merged.pointer("/ignition/config/merge/0/source").unwrap(),
            "https://api:22623"
        );
        assert!(merged.pointer("/storage/files/0").is_some());
    }

    #[test]
    fn pull_secret_extraction_decodes_base64() {
        let secret = r#"{"auths":{}}"#;
        let config = json!({
            "storage": {"files": [{
                "path": "/root/.docker/config.json",
                "contents": {"source": format!("data:;base64,{}", BASE64.encode(secret))}
            }]}
        });
        let content =
            file_content_from_ignition(&config, "/root/.docker/config.json").unwrap();
        assert_eq!(content, secret.as_bytes());
    }

    #[test]
    fn missing_file_is_an_error() {
        let config = json!({"storage": {"files": []}});
        assert!(file_content_from_ignition(&config, "/nope").is_err());
    }

    #[test]
    fn plain_data_url_is_passed_through() {
        assert_eq!(decode_data_url("data:,hello").unwrap(), b"hello");
    }
}
