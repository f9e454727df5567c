pub mod resolver;
pub mod runner;

pub use resolver::{Arch, OsFamily, Packaging, Platform, ToolResolver};
pub use runner::{ProcessRunner, StreamingRun, ToolInvocation, ToolOutput, ToolRunner};

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Programmer tool not available at {}: {reason}", path.display())]
    Unavailable { path: PathBuf, reason: String },

    #[error("No programmer tool build for platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Failed to start {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Tool exited with code {code:?}: {stderr}")]
    ExecutionFailed { code: Option<i32>, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolError {
    /// True when reinstalling the application is the remedy
    pub fn is_missing_tool(&self) -> bool {
        matches!(self, ToolError::Unavailable { .. } | ToolError::UnsupportedPlatform(_))
    }
}

pub type Result<T> = std::result::Result<T, ToolError>;
