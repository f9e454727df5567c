//! Locates the bundled programmer executable for the running platform.
//!
//! Packaged builds keep one executable under `<resources>/tools/`. Development
//! checkouts keep per-platform builds under `<root>/resources/tools/<platform>/`,
//! and macOS keeps one build per CPU architecture there.
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{Result, ToolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OsFamily {
    MacOs,
    Windows,
    Linux,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arch {
    Arm64,
    X64,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packaging {
    Packaged,
    Development,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: OsFamily,
    pub arch: Arch,
}

impl Platform {
    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "macos" => OsFamily::MacOs,
            "windows" => OsFamily::Windows,
            "linux" => OsFamily::Linux,
            _ => OsFamily::Other,
        };
        let arch = match std::env::consts::ARCH {
            "aarch64" => Arch::Arm64,
            "x86_64" => Arch::X64,
            _ => Arch::Other,
        };
        Self { os, arch }
    }
}

#[derive(Debug, Clone)]
pub struct ToolResolver {
    platform: Platform,
    packaging: Packaging,
    resources_dir: PathBuf,
    dev_root: PathBuf,
}

impl ToolResolver {
    pub fn new(platform: Platform, packaging: Packaging, resources_dir: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            platform,
            packaging,
            resources_dir: resources_dir.into(),
            dev_root: dev_root.into(),
        }
    }

    /// Path where the programmer executable is expected. Pure path
    /// construction; whether the file is actually there is the runner's check.
    pub fn resolve(&self) -> Result<PathBuf> {
        let (platform_dir, file_name) = self.names()?;
        let path = match self.packaging {
            Packaging::Packaged => self.resources_dir.join("tools").join(file_name),
            Packaging::Development => self
                .dev_root
                .join("resources")
                .join("tools")
                .join(platform_dir)
                .join(file_name),
        };
        Ok(path)
    }

    fn names(&self) -> Result<(&'static str, &'static str)> {
        match self.platform.os {
            OsFamily::MacOs => {
                // Packaged builds ship a merged universal binary
                let name = match (self.packaging, self.platform.arch) {
                    (Packaging::Packaged, _) => "esptool",
                    (Packaging::Development, Arch::Arm64) => "esptool-arm64",
                    (Packaging::Development, _) => "esptool-x64",
                };
                Ok(("mac", name))
            }
            OsFamily::Windows => Ok(("win", "esptool.exe")),
            OsFamily::Linux => Ok(("linux", "esptool")),
            OsFamily::Other => Err(ToolError::UnsupportedPlatform(std::env::consts::OS.to_string())),
        }
    }
}
