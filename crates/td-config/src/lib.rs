//! Layered YAML configuration loader (§6.5, §10.4).
//!
//! Config documents are merged in a fixed order, canonicalized into a single
//! JSON document with recursively sorted object keys, and hashed (SHA-256)
//! into a `config_hash` that can be stamped onto every run, plan, and log
//! line so any output can be traced back to the exact configuration that
//! produced it.

mod settings;

pub use settings::*;

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse YAML in '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("canonical JSON did not round-trip: {0}")]
    Canonicalize(serde_json::Error),
    #[error("unused configuration key(s) present in LIVE mode: {0:?}")]
    UnusedKeysInLive(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

impl LoadedConfig {
    pub fn settings(&self) -> Settings {
        serde_json::from_value(self.config_json.clone()).unwrap_or_default()
    }
}

/// Built-in defaults, applied before any caller-supplied override file. This
/// keeps `Settings::default()` and this base layer in lock-step: an empty
/// `paths` slice must still produce the documented §6.5 defaults.
const BASE_DEFAULTS_YAML: &str = r#"
max_positions: 20
min_positions: 10
target_position_count: 20
target_invested_ratio: 0.90
max_position_pct: 0.10
min_trade_dollar_threshold: 25
cache_ttl_hours: 16
plan_freshness_hours: 4
circuit_breaker:
  yellow: 5
  orange: 10
  red: 15
provider_timeouts:
  broker: 30
  market_data: 30
  sentiment: 30
  llm_fast: 45
  llm_deep: 600
concurrency:
  per_stage_fanout: 5
  sentiment_batch_size: 5
  sentiment_batch_delay_s: 5
time_zone: America/New_York
arming:
  require_manual_confirmation: true
  confirmation_format: "OVERRIDE {date} LOSS {loss_pct}"
"#;

/// Load and deep-merge YAML files in order (base defaults first, then each
/// path in the order given), canonicalize, and hash.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig, ConfigError> {
    let mut merged = Value::Object(Default::default());

    let base: serde_yaml::Value =
        serde_yaml::from_str(BASE_DEFAULTS_YAML).expect("embedded defaults must parse");
    let base_json = serde_json::to_value(base).expect("embedded defaults must convert");
    deep_merge(&mut merged, base_json);

    for p in paths {
        let s = fs::read_to_string(p).map_err(|source| ConfigError::Read {
            path: p.to_string(),
            source,
        })?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).map_err(|source| ConfigError::Parse {
                path: p.to_string(),
                source,
            })?;
        let json_val = serde_json::to_value(yaml_val).expect("yaml->json conversion failed");
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    let config_json = serde_json::from_str(&canonical).map_err(ConfigError::Canonicalize)?;

    Ok(LoadedConfig {
        config_json,
        canonical_json: canonical,
        config_hash: hash,
    })
}

fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// The recognized key tree of §6.5, used to flag unused keys in an override
/// document rather than silently ignoring or silently trusting them.
fn recognized_key_tree() -> Value {
    serde_json::json!({
        "max_positions": null,
        "min_positions": null,
        "target_position_count": null,
        "target_invested_ratio": null,
        "max_position_pct": null,
        "min_trade_dollar_threshold": null,
        "cache_ttl_hours": null,
        "plan_freshness_hours": null,
        "circuit_breaker": {"yellow": null, "orange": null, "red": null},
        "provider_timeouts": {
            "broker": null, "market_data": null, "sentiment": null,
            "llm_fast": null, "llm_deep": null
        },
        "concurrency": {
            "per_stage_fanout": null, "sentiment_batch_size": null,
            "sentiment_batch_delay_s": null
        },
        "time_zone": null,
        "arming": {"require_manual_confirmation": null, "confirmation_format": null}
    })
}

/// Report dotted-path keys present in `config_json` that aren't in the
/// recognized tree. Paper mode: callers log these as warnings. Live mode:
/// callers should treat a non-empty result as a fatal `ConfigError`.
pub fn report_unused_keys(config_json: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_unused(config_json, &recognized_key_tree(), String::new(), &mut out);
    out
}

fn collect_unused(actual: &Value, allowed: &Value, prefix: String, out: &mut Vec<String>) {
    let (Value::Object(actual_map), Value::Object(allowed_map)) = (actual, allowed) else {
        return;
    };
    for (k, v) in actual_map {
        let path = if prefix.is_empty() {
            k.clone()
        } else {
            format!("{prefix}.{k}")
        };
        match allowed_map.get(k) {
            None => out.push(path),
            Some(Value::Null) => {}
            Some(sub_allowed) => collect_unused(v, sub_allowed, path, out),
        }
    }
}

/// Enforce the LIVE-mode unused-key policy: fatal if any unused key is present.
pub fn enforce_unused_keys_for_live(config_json: &Value) -> Result<(), ConfigError> {
    let unused = report_unused_keys(config_json);
    if unused.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::UnusedKeysInLive(unused))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let loaded = load_layered_yaml(&[]).unwrap();
        let s = loaded.settings();
        assert_eq!(s.max_positions, 20);
        assert_eq!(s.min_positions, 10);
        assert!((s.target_invested_ratio - 0.90).abs() < 1e-9);
        assert_eq!(s.circuit_breaker.orange as i64, 10);
    }

    #[test]
    fn override_file_merges_and_hash_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("override.yaml");
        std::fs::write(&path, "max_positions: 5\n").unwrap();
        let p = path.to_str().unwrap();

        let a = load_layered_yaml(&[p]).unwrap();
        let b = load_layered_yaml(&[p]).unwrap();
        assert_eq!(a.config_hash, b.config_hash);
        assert_eq!(a.settings().max_positions, 5);
        // unrelated defaults survive the merge
        assert_eq!(a.settings().min_positions, 10);
    }

    #[test]
    fn unused_keys_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("override.yaml");
        std::fs::write(&path, "max_positions: 5\nnot_a_real_key: true\n").unwrap();
        let loaded = load_layered_yaml(&[path.to_str().unwrap()]).unwrap();
        let unused = report_unused_keys(&loaded.config_json);
        assert_eq!(unused, vec!["not_a_real_key".to_string()]);
        assert!(enforce_unused_keys_for_live(&loaded.config_json).is_err());
    }
}
