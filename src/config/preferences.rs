use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{ConfigError, Result};

/// User choices persisted between runs
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Preferences {
    pub custom_manifest_path: Option<PathBuf>,
}

impl Preferences {
    /// Missing or unreadable files load as defaults
    pub async fn load(path: &Path) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                log::warn!("Ignoring corrupt preferences at {}: {}", path.display(), e);
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                log::warn!("Could not read preferences at {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let io = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        tokio::fs::write(path, json).await.map_err(io)?;
        log::debug!("Preferences saved to {}", path.display());
        Ok(())
    }
}
