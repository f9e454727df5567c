//! Slower, independent analysis used after the tool heuristics give up.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use super::AnalysisResult;
use crate::tool::ToolRunner;

pub const SOURCE_SCRIPT: &str = "script";

/// Anything that can classify a file into the same result shape.
/// `None` means inconclusive.
#[async_trait]
pub trait SecondaryAnalyzer: Send + Sync {
    async fn analyze(&self, file: &Path) -> Option<AnalysisResult>;
}

/// Runs `<interpreter> <script> <file>` and reads a JSON report from stdout
pub struct ScriptAnalyzer {
    interpreter: PathBuf,
    script: PathBuf,
    runner: Arc<dyn ToolRunner>,
}

impl ScriptAnalyzer {
    pub fn new(interpreter: impl Into<PathBuf>, script: impl Into<PathBuf>, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            interpreter: interpreter.into(),
            script: script.into(),
            runner,
        }
    }

    /// Build one using `python3` from `PATH`, if present
    pub fn with_system_python(script: impl Into<PathBuf>, runner: Arc<dyn ToolRunner>) -> Option<Self> {
        let interpreter = find_on_path("python3")?;
        Some(Self::new(interpreter, script, runner))
    }
}

#[async_trait]
impl SecondaryAnalyzer for ScriptAnalyzer {
    async fn analyze(&self, file: &Path) -> Option<AnalysisResult> {
        if !self.script.is_file() {
            log::warn!("Analysis script not found at {}", self.script.display());
            return None;
        }

        let args = vec![
            self.script.to_string_lossy().into_owned(),
            file.to_string_lossy().into_owned(),
        ];
        let invocation = match self.runner.run(&self.interpreter, &args).await {
            Ok(inv) => inv,
            Err(e) => {
                log::warn!("Secondary analyzer could not run: {}", e);
                return None;
            }
        };

        if !invocation.succeeded() {
            log::warn!(
                "Secondary analyzer exited with {:?}: {}",
                invocation.exit_code,
                invocation.stderr_tail(3)
            );
            return None;
        }

        parse_report(&invocation.stdout)
    }
}

/// Decode the script's JSON report
pub fn parse_report(stdout: &str) -> Option<AnalysisResult> {
    let value: serde_json::Value = match serde_json::from_str(stdout.trim()) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("Secondary analyzer printed invalid JSON: {}", e);
            return None;
        }
    };

    if let Some(error) = value.get("error") {
        log::info!("Secondary analyzer reported: {}", error);
        return None;
    }

    match serde_json::from_value::<AnalysisResult>(value) {
        Ok(mut result) => {
            result.source = SOURCE_SCRIPT.to_string();
            Some(result)
        }
        Err(e) => {
            log::warn!("Secondary analyzer report has unexpected shape: {}", e);
            None
        }
    }
}

fn find_on_path(program: &str) -> Option<PathBuf> {
    let candidates: Vec<String> = if cfg!(windows) {
        vec![format!("{}.exe", program), program.to_string()]
    } else {
        vec![program.to_string()]
    };

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .flat_map(|dir| candidates.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}
