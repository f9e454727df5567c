//! Application configuration, on-disk preferences and filesystem layout.
pub mod paths;
pub mod preferences;

pub use paths::AppPaths;
pub use preferences::Preferences;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CONFIG_FILE_NAME: &str = "app_config.json";

const REQUIRED_KEYS: [&str; 3] = ["api_base_url", "firmware_manifest_url", "oss_domain_prefix"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("app_config.json is missing required key or value is empty: \"{0}\"")]
    MissingKey(String),

    #[error("Failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Could not determine the user data directory")]
    NoUserDataDir,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub api_base_url: String,
    pub firmware_manifest_url: String,
    #[serde(default)]
    pub firmware_manifest_mirrors: Vec<String>,
    pub oss_domain_prefix: String,
}

impl AppConfig {
    /// Load the bundled file, then let the user file override individual keys
    pub fn load(paths: &AppPaths) -> Result<Self> {
        let bundled_path = paths.bundled_config();
        let user_path = paths.user_config();
        let mut merged = Map::new();

        for path in [&bundled_path, &user_path] {
            match read_object(path) {
                Ok(Some(layer)) => {
                    log::info!("Loaded configuration from {}", path.display());
                    merged.extend(layer);
                }
                Ok(None) => log::debug!("No configuration at {}", path.display()),
                // A broken layer is skipped; missing keys are caught below
                Err(e) => log::error!("Error reading config file: {}", e),
            }
        }

        Self::from_map(&merged)
    }

    /// Validate a merged key/value map
    pub fn from_map(merged: &Map<String, Value>) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            merged
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
                .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
        };

        let mirrors = merged
            .get("firmware_manifest_mirrors")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let [api, manifest, oss] = REQUIRED_KEYS;
        Ok(Self {
            api_base_url: required(api)?,
            firmware_manifest_url: required(manifest)?,
            firmware_manifest_mirrors: mirrors,
            oss_domain_prefix: required(oss)?,
        })
    }

    pub fn api_base_url(&self) -> &str {
        self.api_base_url.trim().trim_end_matches('/')
    }

    pub fn asset_domain_prefix(&self) -> &str {
        self.oss_domain_prefix.trim().trim_end_matches('/')
    }

    pub fn manifest_url(&self) -> &str {
        self.firmware_manifest_url.trim()
    }
}

/// `Ok(None)` when the file does not exist or is not a JSON object
fn read_object(path: &Path) -> Result<Option<Map<String, Value>>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let value: Value = serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(match value {
        Value::Object(map) => Some(map),
        _ => None,
    })
}
