//! File housekeeping for downloaded and dumped images.
use std::path::{Path, PathBuf};

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("Source file does not exist: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("File operation on {} failed: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, FileError>;

/// Native file dialogs, supplied by the host. `None` means the user cancelled.
#[async_trait]
pub trait FilePicker: Send + Sync {
    async fn pick_open(&self, title: &str, extensions: &[&str]) -> Option<PathBuf>;
    async fn pick_save(&self, default_name: &str) -> Option<PathBuf>;
}

/// Picker for hosts without dialogs; always cancels
#[derive(Debug, Default, Clone)]
pub struct NoPicker;

#[async_trait]
impl FilePicker for NoPicker {
    async fn pick_open(&self, _title: &str, _extensions: &[&str]) -> Option<PathBuf> {
        None
    }

    async fn pick_save(&self, _default_name: &str) -> Option<PathBuf> {
        None
    }
}

/// Delete `path`. Deleting a file that is already gone succeeds.
pub async fn remove_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            log::info!("Removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(FileError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Ask where to save, then copy `source` there. `Ok(None)` when cancelled.
pub async fn save_file_as(picker: &dyn FilePicker, default_name: &str, source: &Path) -> Result<Option<PathBuf>> {
    if !tokio::fs::try_exists(source).await.unwrap_or(false) {
        return Err(FileError::SourceMissing(source.to_path_buf()));
    }

    let Some(destination) = picker.pick_save(default_name).await else {
        log::debug!("Save of {} cancelled", source.display());
        return Ok(None);
    };

    tokio::fs::copy(source, &destination)
        .await
        .map_err(|e| FileError::Io {
            path: destination.clone(),
            source: e,
        })?;
    log::info!("Saved {} to {}", source.display(), destination.display());
    Ok(Some(destination))
}
