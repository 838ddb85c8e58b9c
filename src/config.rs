//! Persisted configuration map.
//!
//! A flat JSON object keyed by property name. Addon enabled-state overrides
//! and the cached-image list live here under well-known keys. The file is
//! written by the CLI layer; this crate only reads it.

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

/// Key under which the CLI stores the active profile name.
pub const PROFILE_KEY: &str = "profile";

/// Key under which the CLI stores the image list to preload.
pub const CACHED_IMAGES_KEY: &str = "cache";

/// Parsed contents of the persisted configuration file.
pub type ConfigMap = HashMap<String, Value>;

/// Read the configuration map from `path`.
///
/// A missing file is not an error: it reads as an empty map.
pub fn read_config(path: &Path) -> Result<ConfigMap> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ConfigMap::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("reading config file {}", path.display()));
        }
    };
    serde_json::from_str(&content)
        .with_context(|| format!("decoding config file {}", path.display()))
}

/// Look up `name` and render the stored scalar as a string.
pub fn get(config: &ConfigMap, name: &str) -> Option<String> {
    config.get(name).map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// Look up `name` as a boolean.
///
/// Accepts JSON booleans and the strings "true"/"false". Anything else is
/// `None` so callers can fall back to their compile-time default.
pub fn get_bool(config: &ConfigMap, name: &str) -> Option<bool> {
    match config.get(name) {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}
