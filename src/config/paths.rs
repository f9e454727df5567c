use std::path::{Path, PathBuf};

use directories::ProjectDirs;

use super::{ConfigError, Result, CONFIG_FILE_NAME};
use crate::tool::{Packaging, Platform, ToolResolver};

pub const MANIFEST_FILE_NAME: &str = "firmware_manifest.json";
pub const PREFERENCES_FILE_NAME: &str = "preferences.json";
pub const ANALYSIS_SCRIPT_NAME: &str = "analyze_firmware.py";

/// Every environment-dependent location the engine touches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub packaged: bool,
    /// Resources shipped with an installed build
    pub resources_dir: PathBuf,
    /// Source checkout root when running unpackaged
    pub dev_root: PathBuf,
    pub user_data_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub exe_dir: PathBuf,
    pub current_dir: PathBuf,
}

impl AppPaths {
    /// Locate everything from the running executable. Installed builds keep
    /// their resources in `<exe_dir>/resources`.
    pub fn discover(packaged: bool) -> Result<Self> {
        let io_err = |path: &str, source| ConfigError::Io {
            path: PathBuf::from(path),
            source,
        };

        let exe = std::env::current_exe().map_err(|e| io_err("current executable", e))?;
        let exe_dir = exe.parent().map(Path::to_path_buf).unwrap_or_default();
        let current_dir = std::env::current_dir().map_err(|e| io_err("current directory", e))?;
        let dirs = ProjectDirs::from("com", "flashhub", "FlashHub").ok_or(ConfigError::NoUserDataDir)?;

        Ok(Self {
            packaged,
            resources_dir: exe_dir.join("resources"),
            dev_root: current_dir.clone(),
            user_data_dir: dirs.data_dir().to_path_buf(),
            temp_dir: std::env::temp_dir(),
            exe_dir,
            current_dir,
        })
    }

    /// Development layout rooted at `root`, with user data and temp inside it
    pub fn for_root(root: &Path) -> Self {
        Self {
            packaged: false,
            resources_dir: root.join("resources"),
            dev_root: root.to_path_buf(),
            user_data_dir: root.join("user-data"),
            temp_dir: root.join("tmp"),
            exe_dir: root.join("bin"),
            current_dir: root.to_path_buf(),
        }
    }

    pub fn packaging(&self) -> Packaging {
        if self.packaged {
            Packaging::Packaged
        } else {
            Packaging::Development
        }
    }

    /// Where bundled documents (config, manifest) live
    pub fn app_root(&self) -> &Path {
        if self.packaged {
            &self.resources_dir
        } else {
            &self.dev_root
        }
    }

    pub fn bundled_config(&self) -> PathBuf {
        self.app_root().join(CONFIG_FILE_NAME)
    }

    pub fn user_config(&self) -> PathBuf {
        self.user_data_dir.join(CONFIG_FILE_NAME)
    }

    pub fn preferences_file(&self) -> PathBuf {
        self.user_data_dir.join(PREFERENCES_FILE_NAME)
    }

    pub fn bundled_manifest(&self) -> PathBuf {
        self.app_root().join(MANIFEST_FILE_NAME)
    }

    /// Other places a catalog may have been left, in lookup order
    pub fn fallback_manifests(&self) -> Vec<PathBuf> {
        if self.packaged {
            vec![self.exe_dir.join(MANIFEST_FILE_NAME)]
        } else {
            let bundled = self.bundled_manifest();
            let mut paths: Vec<PathBuf> = Vec::new();
            for candidate in [
                self.dev_root.join("..").join(MANIFEST_FILE_NAME),
                self.current_dir.join(MANIFEST_FILE_NAME),
                self.current_dir.join("..").join(MANIFEST_FILE_NAME),
            ] {
                if candidate != bundled && !paths.contains(&candidate) {
                    paths.push(candidate);
                }
            }
            paths
        }
    }

    pub fn analysis_script(&self) -> PathBuf {
        if self.packaged {
            self.resources_dir.join("tools").join(ANALYSIS_SCRIPT_NAME)
        } else {
            self.dev_root.join("resources").join("tools").join("common").join(ANALYSIS_SCRIPT_NAME)
        }
    }

    pub fn download_dir(&self) -> PathBuf {
        self.temp_dir.join("flashhub-downloads")
    }

    pub fn dump_dir(&self) -> PathBuf {
        self.user_data_dir.join("dumps")
    }

    pub fn tool_resolver(&self) -> ToolResolver {
        ToolResolver::new(Platform::current(), self.packaging(), &self.resources_dir, &self.dev_root)
    }
}
