//! pdk-config
//!
//! Layered YAML configuration for the coordination core. Layers merge in
//! order (later wins) and the merged tree is hashed over its canonical
//! encoding, so two processes can compare `config_hash` to assert they run
//! the same coordination policy. The loader also records which layer
//! overrode which key — the first question asked whenever two hosts
//! disagree about a timeout.
//!
//! Typed access goes through [`CoordinationSettings`], which carries the
//! built-in defaults and converts into the per-component config structs.

use anyhow::{Context, Result};
use pdk_schemas::canonical::canonical_json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::time::Duration;

/// A key whose earlier value was replaced by a later layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerOverride {
    /// Dotted path of the replaced key, e.g. `coordination.lock.stale_secs`.
    pub path: String,
    /// The layer file that supplied the winning value.
    pub layer: String,
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
    /// Keys replaced during layering, in merge order. Keys introduced by a
    /// layer (no earlier value) are not listed.
    pub overrides: Vec<LayerOverride>,
}

impl LoadedConfig {
    /// Typed coordination section; absent keys take the built-in defaults.
    pub fn coordination(&self) -> Result<CoordinationSettings> {
        CoordinationSettings::from_config_json(&self.config_json)
    }
}

/// Load YAML layers in order. Objects merge recursively, anything else is
/// replaced by the later layer; replacements are logged with their dotted
/// path and winning layer.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());
    let mut overrides = Vec::new();

    for layer in paths {
        let raw =
            fs::read_to_string(layer).with_context(|| format!("read config layer {layer}"))?;
        let parsed: serde_yaml::Value =
            serde_yaml::from_str(&raw).with_context(|| format!("parse config layer {layer}"))?;
        let as_json = serde_json::to_value(parsed)
            .with_context(|| format!("config layer {layer} does not map onto JSON"))?;
        merge_layer(&mut merged, as_json, layer, &mut Vec::new(), &mut overrides);
    }

    let canonical_json = canonical_json(&merged);
    let mut hasher = Sha256::new();
    hasher.update(canonical_json.as_bytes());

    Ok(LoadedConfig {
        config_hash: hex::encode(hasher.finalize()),
        config_json: merged,
        canonical_json,
        overrides,
    })
}

/// One layer merged into the accumulated tree. `path` is the key stack down
/// to the current node.
fn merge_layer(
    dst: &mut Value,
    src: Value,
    layer: &str,
    path: &mut Vec<String>,
    overrides: &mut Vec<LayerOverride>,
) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (key, value) in src_map {
                path.push(key.clone());
                match dst_map.get_mut(&key) {
                    Some(slot) => merge_layer(slot, value, layer, path, overrides),
                    None => {
                        // New key, not an override.
                        dst_map.insert(key, value);
                    }
                }
                path.pop();
            }
        }
        (slot, value) => {
            if *slot != value {
                overrides.push(LayerOverride {
                    path: path.join("."),
                    layer: layer.to_string(),
                });
            }
            *slot = value;
        }
    }
}

// ---------------------------------------------------------------------------
// CoordinationSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub retry_initial_ms: u64,
    pub retry_factor: f64,
    pub retry_max_delay_ms: u64,
    pub retry_max_attempts: u32,
    pub heartbeat_secs: u64,
    pub stale_secs: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            retry_initial_ms: 200,
            retry_factor: 2.0,
            retry_max_delay_ms: 2_000,
            retry_max_attempts: 6,
            heartbeat_secs: 15,
            stale_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub heartbeat_secs: u64,
    pub stale_secs: u64,
    pub reap_secs: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            heartbeat_secs: 10,
            stale_secs: 60,
            reap_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    pub stall_secs: u64,
    pub sweep_secs: u64,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            stall_secs: 60,
            sweep_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub open_secs: u64,
    pub half_open_successes: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_secs: 30,
            half_open_successes: 2,
        }
    }
}

/// The whole `coordination:` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CoordinationSettings {
    pub lock: LockSettings,
    pub streams: StreamSettings,
    pub ledger: LedgerSettings,
    pub breaker: BreakerSettings,
    pub providers: pdk_provider::ControllerConfig,
}

impl CoordinationSettings {
    /// Build from canonical config JSON. A missing `coordination` section
    /// yields all defaults.
    pub fn from_config_json(cfg: &Value) -> Result<Self> {
        match cfg.pointer("/coordination") {
            Some(section) => serde_json::from_value(section.clone())
                .context("parse coordination config section"),
            None => Ok(Self::default()),
        }
    }

    pub fn lock_config(&self) -> pdk_locks::LockConfig {
        pdk_locks::LockConfig {
            retry_initial: Duration::from_millis(self.lock.retry_initial_ms),
            retry_factor: self.lock.retry_factor,
            retry_max_delay: Duration::from_millis(self.lock.retry_max_delay_ms),
            retry_max_attempts: self.lock.retry_max_attempts,
            heartbeat_interval: Duration::from_secs(self.lock.heartbeat_secs),
            stale_after: Duration::from_secs(self.lock.stale_secs),
        }
    }

    pub fn stream_directory_config(&self) -> pdk_streams::StreamDirectoryConfig {
        pdk_streams::StreamDirectoryConfig {
            heartbeat_interval: Duration::from_secs(self.streams.heartbeat_secs),
            stale_after: Duration::from_secs(self.streams.stale_secs),
            reap_interval: Duration::from_secs(self.streams.reap_secs),
        }
    }

    pub fn ledger_config(&self) -> pdk_streams::LedgerConfig {
        pdk_streams::LedgerConfig {
            stall_after: Duration::from_secs(self.ledger.stall_secs),
            sweep_interval: Duration::from_secs(self.ledger.sweep_secs),
        }
    }

    pub fn breaker_config(&self) -> pdk_provider::BreakerConfig {
        pdk_provider::BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            open_duration: Duration::from_secs(self.breaker.open_secs),
            half_open_successes: self.breaker.half_open_successes,
        }
    }

    pub fn controller_config(&self) -> pdk_provider::ControllerConfig {
        self.providers.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_yaml(dir: &tempfile::TempDir, name: &str, content: &str) -> String {
        let path = dir.path().join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn layered_merge_later_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_yaml(
            &dir,
            "base.yaml",
            "coordination:\n  lock:\n    retry_max_attempts: 6\n    stale_secs: 60\n",
        );
        let over = write_yaml(
            &dir,
            "override.yaml",
            "coordination:\n  lock:\n    retry_max_attempts: 3\n",
        );

        let loaded = load_layered_yaml(&[&base, &over]).unwrap();
        let settings = loaded.coordination().unwrap();
        assert_eq!(settings.lock.retry_max_attempts, 3);
        // Untouched key survives the merge.
        assert_eq!(settings.lock.stale_secs, 60);

        // The replacement is attributed to the winning layer.
        assert_eq!(
            loaded.overrides,
            vec![LayerOverride {
                path: "coordination.lock.retry_max_attempts".into(),
                layer: over.clone(),
            }]
        );
    }

    #[test]
    fn new_keys_are_not_logged_as_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_yaml(&dir, "base.yaml", "coordination:\n  lock:\n    stale_secs: 60\n");
        let extra = write_yaml(
            &dir,
            "extra.yaml",
            "coordination:\n  ledger:\n    stall_secs: 30\n",
        );

        let loaded = load_layered_yaml(&[&base, &extra]).unwrap();
        assert!(loaded.overrides.is_empty(), "{:?}", loaded.overrides);
        assert_eq!(loaded.coordination().unwrap().ledger.stall_secs, 30);
    }

    #[test]
    fn rewriting_the_same_value_is_not_an_override() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_yaml(&dir, "base.yaml", "coordination:\n  lock:\n    stale_secs: 60\n");
        let same = write_yaml(&dir, "same.yaml", "coordination:\n  lock:\n    stale_secs: 60\n");

        let loaded = load_layered_yaml(&[&base, &same]).unwrap();
        assert!(loaded.overrides.is_empty());
    }

    #[test]
    fn config_hash_is_stable_across_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_yaml(&dir, "a.yaml", "coordination:\n  ledger:\n    stall_secs: 30\n    sweep_secs: 5\n");
        let b = write_yaml(&dir, "b.yaml", "coordination:\n  ledger:\n    sweep_secs: 5\n    stall_secs: 30\n");

        let ha = load_layered_yaml(&[&a]).unwrap().config_hash;
        let hb = load_layered_yaml(&[&b]).unwrap().config_hash;
        assert_eq!(ha, hb);
    }

    #[test]
    fn missing_section_yields_builtin_defaults() {
        let settings = CoordinationSettings::from_config_json(&serde_json::json!({})).unwrap();
        assert_eq!(settings.lock.retry_initial_ms, 200);
        assert_eq!(settings.lock.retry_max_attempts, 6);
        assert_eq!(settings.streams.heartbeat_secs, 10);
        assert_eq!(settings.streams.stale_secs, 60);
        assert_eq!(settings.ledger.stall_secs, 60);
        assert_eq!(settings.breaker.failure_threshold, 5);
        assert_eq!(settings.breaker.open_secs, 30);
        assert!(settings.providers.fallbacks.is_empty());
    }

    #[test]
    fn provider_fallbacks_parse() {
        let cfg = serde_json::json!({
            "coordination": {
                "providers": {
                    "fallbacks": {
                        "openai": {
                            "large_context_model": "gpt-4o-128k",
                            "alternate_provider": "anthropic"
                        }
                    }
                }
            }
        });
        let settings = CoordinationSettings::from_config_json(&cfg).unwrap();
        let ctrl = settings.controller_config();
        let fb = ctrl.fallbacks.get("openai").unwrap();
        assert_eq!(fb.large_context_model.as_deref(), Some("gpt-4o-128k"));
        assert_eq!(fb.alternate_provider.as_deref(), Some("anthropic"));
    }
}
