//! Configuration loading and management

use super::schema::Config;
use super::validate::validate_config;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Prefix for path-style environment overrides, e.g. `RAGCHAT__CHAT__HISTORY_LIMIT`
const ENV_PREFIX: &str = "RAGCHAT__";

/// Configuration loader
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// Create a new config loader with the default config directory
    pub fn new() -> Self {
        let config_dir = dirs::home_dir()
            .map(|h| h.join(".ragchat"))
            .unwrap_or_else(|| PathBuf::from(".ragchat"));

        Self { config_dir }
    }

    /// Create a new config loader with a custom config directory
    pub fn with_dir<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            config_dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Load configuration from file and environment
    pub fn load(&self) -> crate::Result<Config> {
        let config_path = self.config_path();
        let mut merged = serde_json::to_value(Config::default())?;

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let file_value: Value = serde_json::from_str(&content)?;
            merge_values(&mut merged, file_value);
        }

        apply_env_overrides(&mut merged);

        let config: Config = serde_json::from_value(merged)?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, config: &Config) -> crate::Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        let content = serde_json::to_string_pretty(config)?;
        std::fs::write(self.config_path(), content)?;
        Ok(())
    }

    /// Get the config directory path
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Resolve a possibly relative path against the config directory
    pub fn resolve(&self, path: &str) -> PathBuf {
        let candidate = PathBuf::from(path);
        if candidate.is_absolute() {
            candidate
        } else {
            self.config_dir.join(candidate)
        }
    }

    fn config_path(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Deep-merge `overlay` into `base`; scalars and arrays are replaced
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Set `section.key` inside the merged config. Only existing sections can be
/// targeted.
fn set_override(root: &mut Value, path: &[&str], value: Value) -> bool {
    let Some((key, sections)) = path.split_last() else {
        return false;
    };
    let pointer: String = sections.iter().map(|s| format!("/{}", s)).collect();
    match root.pointer_mut(&pointer).and_then(Value::as_object_mut) {
        Some(section) => {
            section.insert(key.to_string(), value);
            true
        }
        None => false,
    }
}

fn apply_env_overrides(config: &mut Value) {
    const ALIASES: [(&str, &[&str]); 3] = [
        ("RAGCHAT_API_URL", &["backend", "api_base_url"]),
        ("RAGCHAT_SOCKET_URL", &["backend", "socket_url"]),
        ("RAGCHAT_LOG_DIR", &["logging", "dir"]),
    ];
    for (var, path) in ALIASES {
        if let Ok(value) = std::env::var(var) {
            set_override(config, path, Value::String(value));
        }
    }

    // Path overrides win over aliases
    let mut overrides: Vec<(String, String)> = std::env::vars()
        .filter(|(key, _)| key.starts_with(ENV_PREFIX))
        .collect();
    overrides.sort();
    for (var, raw) in overrides {
        let path: Vec<String> = var[ENV_PREFIX.len()..]
            .split("__")
            .filter(|s| !s.is_empty())
            .map(str::to_ascii_lowercase)
            .collect();
        let path: Vec<&str> = path.iter().map(String::as_str).collect();
        let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
        if !set_override(config, &path, value) {
            warn!("Ignoring {}: no such configuration section", var);
        }
    }
}
