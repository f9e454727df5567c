//! Runs the external programmer tool as a child process (never via a shell).
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{Result, ToolError};

/// One finished run of the external tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: Uuid,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
}

impl ToolInvocation {
    pub fn new(program: &Path, args: &[String]) -> Self {
        Self {
            id: Uuid::new_v4(),
            program: program.to_path_buf(),
            args: args.to_vec(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            started_at: Utc::now(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Last non-empty stderr lines, for failure reports
    pub fn stderr_tail(&self, lines: usize) -> String {
        let tail: Vec<&str> = self
            .stderr
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .collect();
        tail[tail.len().saturating_sub(lines)..].join("\n")
    }
}

/// Incremental output of a streaming run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutput {
    Stdout(String),
    Stderr(String),
    Exited(Option<i32>),
}

/// Handle to a streaming run that is still in flight
pub struct StreamingRun {
    handle: JoinHandle<Result<ToolInvocation>>,
}

impl StreamingRun {
    pub fn from_handle(handle: JoinHandle<Result<ToolInvocation>>) -> Self {
        Self { handle }
    }

    /// Wait for the child to exit and collect everything it printed
    pub async fn wait(self) -> Result<ToolInvocation> {
        self.handle
            .await
            .map_err(|e| ToolError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?
    }
}

#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Buffered mode: wait for exit, return full output
    async fn run(&self, program: &Path, args: &[String]) -> Result<ToolInvocation>;

    /// Streaming mode: lines go to `sink` as they arrive, followed by one `Exited`
    async fn run_streaming(
        &self,
        program: &Path,
        args: &[String],
        sink: mpsc::UnboundedSender<ToolOutput>,
    ) -> Result<StreamingRun>;
}

/// Fails with `Unavailable` unless `path` is an existing, executable file
pub async fn ensure_executable(path: &Path) -> Result<()> {
    let metadata = tokio::fs::metadata(path).await.map_err(|e| ToolError::Unavailable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    if !metadata.is_file() {
        return Err(ToolError::Unavailable {
            path: path.to_path_buf(),
            reason: "not a regular file".to_string(),
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(ToolError::Unavailable {
                path: path.to_path_buf(),
                reason: "not marked executable".to_string(),
            });
        }
    }

    Ok(())
}

/// tokio::process backed runner
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    fn command(program: &Path, args: &[String]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd
    }
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(&self, program: &Path, args: &[String]) -> Result<ToolInvocation> {
        ensure_executable(program).await?;

        let mut invocation = ToolInvocation::new(program, args);
        log::debug!("Running {} {}", program.display(), args.join(" "));

        let output = Self::command(program, args)
            .output()
            .await
            .map_err(|source| ToolError::Spawn { path: program.to_path_buf(), source })?;

        invocation.stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        invocation.stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        invocation.exit_code = output.status.code();
        Ok(invocation)
    }

    async fn run_streaming(
        &self,
        program: &Path,
        args: &[String],
        sink: mpsc::UnboundedSender<ToolOutput>,
    ) -> Result<StreamingRun> {
        ensure_executable(program).await?;

        let mut invocation = ToolInvocation::new(program, args);
        log::info!("Spawning {} {}", program.display(), args.join(" "));

        let mut child = Self::command(program, args)
            .spawn()
            .map_err(|source| ToolError::Spawn { path: program.to_path_buf(), source })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let handle = tokio::spawn(async move {
            let out_task = stdout.map(|s| tokio::spawn(pump_lines(s, sink.clone(), ToolOutput::Stdout)));
            let err_task = stderr.map(|s| tokio::spawn(pump_lines(s, sink.clone(), ToolOutput::Stderr)));

            let status = child.wait().await.map_err(ToolError::Io)?;

            if let Some(task) = out_task {
                invocation.stdout = task.await.unwrap_or_default();
            }
            if let Some(task) = err_task {
                invocation.stderr = task.await.unwrap_or_default();
            }
            invocation.exit_code = status.code();

            let _ = sink.send(ToolOutput::Exited(invocation.exit_code));
            Ok::<_, ToolError>(invocation)
        });

        Ok(StreamingRun::from_handle(handle))
    }
}

/// Forward every `\n` or `\r` terminated line to `sink`; returns all text read.
/// Progress output from the tool rewrites one line with `\r`, so both count.
async fn pump_lines<R>(
    mut reader: R,
    sink: mpsc::UnboundedSender<ToolOutput>,
    wrap: fn(String) -> ToolOutput,
) -> String
where
    R: AsyncRead + Unpin,
{
    let mut collected = Vec::new();
    let mut partial = Vec::new();
    let mut buf = [0u8; 1024];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        collected.extend_from_slice(&buf[..n]);
        partial.extend_from_slice(&buf[..n]);

        // Only whole lines are decoded, so a character split across reads survives
        while let Some(pos) = partial.iter().position(|&b| b == b'\n' || b == b'\r') {
            let line: Vec<u8> = partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..pos]);
            if !line.trim().is_empty() {
                let _ = sink.send(wrap(line.into_owned()));
            }
        }
    }

    let rest = String::from_utf8_lossy(&partial);
    if !rest.trim().is_empty() {
        let _ = sink.send(wrap(rest.into_owned()));
    }
    String::from_utf8_lossy(&collected).into_owned()
}
