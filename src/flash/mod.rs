//! Flash (write) and dump (read) operations driven through the programmer tool.
//!
//! Each operation releases the target port from the arbiter before the tool is
//! spawned, relays the tool's output as `FlashLog`/`FlashProgress` events, and
//! releases the port again once the tool is done, whatever the result.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::analysis::parse_hex;
use crate::events::{CoreEvent, EventSink};
use crate::serial::{PortArbiter, ReleaseOutcome};
use crate::tool::{ToolError, ToolInvocation, ToolOutput, ToolResolver, ToolRunner};

pub const DEFAULT_FLASH_BAUD: u32 = 921_600;
pub const DEFAULT_DUMP_ADDRESS: &str = "0x000000";
pub const DEFAULT_DUMP_SIZE: &str = "0x400000";

static PROGRESS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\((\d{1,3})\s*%\)").unwrap());

const STDERR_CONTEXT_LINES: usize = 8;

// Tool messages that mean the device itself could not be reached
const DEVICE_FAILURE_MARKERS: &[&str] = &[
    "could not open",
    "port is busy",
    "permission denied",
    "failed to connect",
    "no serial data received",
    "device not configured",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Port busy, missing or the chip did not answer
    DeviceUnavailable,
    /// Programmer tool not shipped for this platform or not executable
    ToolMissing,
    /// The tool ran and failed mid-way
    OperationFailed,
    InvalidRequest,
}

impl FailureKind {
    /// What the user should try next
    pub fn hint(&self) -> &'static str {
        match self {
            FailureKind::DeviceUnavailable => {
                "Check the cable, unplug and replug the device, and close other programs using the port."
            }
            FailureKind::ToolMissing => "The programmer tool is missing. Reinstall the application.",
            FailureKind::OperationFailed => "The operation failed part-way. Retry, or try a lower baud rate.",
            FailureKind::InvalidRequest => "Check the selected file, offset and size.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FlashOutcome {
    Succeeded {
        /// Dumped image location; `None` for writes
        output_path: Option<PathBuf>,
    },
    Failed {
        kind: FailureKind,
        message: String,
        hint: String,
        /// Last stderr lines of the tool, when it ran
        stderr: Option<String>,
        exit_code: Option<i32>,
    },
}

impl FlashOutcome {
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        FlashOutcome::Failed {
            kind,
            message: message.into(),
            hint: kind.hint().to_string(),
            stderr: None,
            exit_code: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FlashOutcome::Succeeded { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            FlashOutcome::Failed { kind, .. } => Some(*kind),
            FlashOutcome::Succeeded { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashRequest {
    pub port: String,
    pub baud_rate: u32,
    pub file: PathBuf,
    /// Hex string such as `0x10000`
    pub offset: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpRequest {
    pub port: String,
    pub baud_rate: u32,
    pub address: String,
    pub size: String,
}

/// Percentage from a tool line such as `Writing at 0x00010000... (12 %)`
pub fn parse_progress(line: &str) -> Option<u8> {
    let caps = PROGRESS.captures(line)?;
    let percent: u8 = caps.get(1)?.as_str().parse().ok()?;
    (percent <= 100).then_some(percent)
}

/// `firmware_dump_YYYY-MM-DD-HH-MM-SS.bin`
pub fn dump_file_name(at: chrono::DateTime<chrono::Local>) -> String {
    format!("firmware_dump_{}.bin", at.format("%Y-%m-%d-%H-%M-%S"))
}

fn classify_tool_failure(stderr: &str) -> FailureKind {
    let lower = stderr.to_lowercase();
    if DEVICE_FAILURE_MARKERS.iter().any(|m| lower.contains(m)) {
        FailureKind::DeviceUnavailable
    } else {
        FailureKind::OperationFailed
    }
}

pub struct FlashOrchestrator {
    arbiter: Arc<PortArbiter>,
    resolver: ToolResolver,
    runner: Arc<dyn ToolRunner>,
    events: Arc<dyn EventSink>,
    dump_dir: PathBuf,
    // One tool run at a time
    busy: Mutex<()>,
}

impl FlashOrchestrator {
    pub fn new(
        arbiter: Arc<PortArbiter>,
        resolver: ToolResolver,
        runner: Arc<dyn ToolRunner>,
        events: Arc<dyn EventSink>,
        dump_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            arbiter,
            resolver,
            runner,
            events,
            dump_dir: dump_dir.into(),
            busy: Mutex::new(()),
        }
    }

    pub fn dump_dir(&self) -> &Path {
        &self.dump_dir
    }

    fn log(&self, message: impl Into<String>) {
        let message = message.into();
        log::info!("[flash] {}", message);
        self.events.emit(CoreEvent::flash_log(message));
    }

    /// Write `file` to the chip at `offset`
    pub async fn flash(&self, request: &FlashRequest) -> FlashOutcome {
        let Some(offset) = parse_hex(&request.offset) else {
            return FlashOutcome::failed(
                FailureKind::InvalidRequest,
                format!("Invalid flash offset '{}'", request.offset),
            );
        };
        if request.baud_rate == 0 {
            return FlashOutcome::failed(FailureKind::InvalidRequest, "Baud rate must be positive");
        }
        if !tokio::fs::try_exists(&request.file).await.unwrap_or(false) {
            return FlashOutcome::failed(
                FailureKind::InvalidRequest,
                format!("Firmware file not found: {}", request.file.display()),
            );
        }

        let args = vec![
            "--port".to_string(),
            request.port.clone(),
            "--baud".to_string(),
            request.baud_rate.to_string(),
            "write_flash".to_string(),
            "-z".to_string(),
            format!("{:#x}", offset),
            request.file.to_string_lossy().into_owned(),
        ];

        self.log(format!(
            "Flashing {} to {} at {:#x} ({} baud)",
            request.file.display(),
            request.port,
            offset,
            request.baud_rate
        ));

        match self.run_exclusive(&request.port, args).await {
            Ok(()) => {
                self.log("Flash completed successfully");
                FlashOutcome::Succeeded { output_path: None }
            }
            Err(outcome) => outcome,
        }
    }

    /// Read `size` bytes from `address` into a new file under the dump directory
    pub async fn dump(&self, request: &DumpRequest) -> FlashOutcome {
        let (Some(address), Some(size)) = (parse_hex(&request.address), parse_hex(&request.size)) else {
            return FlashOutcome::failed(
                FailureKind::InvalidRequest,
                format!("Invalid dump range '{}' + '{}'", request.address, request.size),
            );
        };
        if size == 0 {
            return FlashOutcome::failed(FailureKind::InvalidRequest, "Dump size must be greater than zero");
        }
        if request.baud_rate == 0 {
            return FlashOutcome::failed(FailureKind::InvalidRequest, "Baud rate must be positive");
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.dump_dir).await {
            return FlashOutcome::failed(
                FailureKind::InvalidRequest,
                format!("Cannot create dump directory {}: {}", self.dump_dir.display(), e),
            );
        }
        let output = self.dump_dir.join(dump_file_name(chrono::Local::now()));

        let args = vec![
            "--port".to_string(),
            request.port.clone(),
            "--baud".to_string(),
            request.baud_rate.to_string(),
            "read_flash".to_string(),
            format!("{:#x}", address),
            format!("{:#x}", size),
            output.to_string_lossy().into_owned(),
        ];

        self.log(format!(
            "Dumping {:#x} bytes from {:#x} on {} to {}",
            size,
            address,
            request.port,
            output.display()
        ));

        if let Err(outcome) = self.run_exclusive(&request.port, args).await {
            return outcome;
        }

        if !tokio::fs::try_exists(&output).await.unwrap_or(false) {
            return FlashOutcome::failed(
                FailureKind::OperationFailed,
                format!("Tool reported success but {} was not written", output.display()),
            );
        }
        self.log(format!("Dump saved to {}", output.display()));
        FlashOutcome::Succeeded {
            output_path: Some(output),
        }
    }

    /// Release the port, run the tool, release again. `Err` carries the
    /// failure outcome.
    async fn run_exclusive(&self, port: &str, args: Vec<String>) -> Result<(), FlashOutcome> {
        let Ok(_busy) = self.busy.try_lock() else {
            return Err(FlashOutcome::failed(
                FailureKind::DeviceUnavailable,
                "Another flash or dump operation is in progress",
            ));
        };

        self.release(port).await;
        let result = self.run_tool(args).await;
        // The tool may have failed before or after touching the port; leave
        // the arbiter without a connection on it either way
        self.release(port).await;
        result
    }

    async fn release(&self, port: &str) {
        match self.arbiter.release_port(port).await {
            ReleaseOutcome::Released => self.log(format!("Closed monitor connection on {}", port)),
            ReleaseOutcome::TimedOut => self.log(format!("Port {} did not close in time, continuing", port)),
            ReleaseOutcome::NotOpen => {}
        }
    }

    async fn run_tool(&self, args: Vec<String>) -> Result<(), FlashOutcome> {
        let tool = self.resolver.resolve().map_err(|e| self.tool_failure(e))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = self
            .runner
            .run_streaming(&tool, &args, tx)
            .await
            .map_err(|e| self.tool_failure(e))?;

        while let Some(output) = rx.recv().await {
            match output {
                ToolOutput::Stdout(line) | ToolOutput::Stderr(line) => self.relay_line(&line),
                ToolOutput::Exited(code) => {
                    log::debug!("Programmer tool exited with {:?}", code);
                    break;
                }
            }
        }

        let invocation = run.wait().await.map_err(|e| self.tool_failure(e))?;
        self.check_exit(&invocation)
    }

    fn relay_line(&self, line: &str) {
        let line = line.trim_end();
        if line.is_empty() {
            return;
        }
        if let Some(percent) = parse_progress(line) {
            self.events.emit(CoreEvent::FlashProgress { percent });
        }
        self.events.emit(CoreEvent::flash_log(line));
    }

    fn check_exit(&self, invocation: &ToolInvocation) -> Result<(), FlashOutcome> {
        if invocation.succeeded() {
            return Ok(());
        }

        let stderr = invocation.stderr_tail(STDERR_CONTEXT_LINES);
        let kind = classify_tool_failure(&format!("{}\n{}", invocation.stdout, invocation.stderr));
        let message = match invocation.exit_code {
            Some(code) => format!("Programmer tool exited with code {}", code),
            None => "Programmer tool was terminated".to_string(),
        };
        self.log(format!("{}: {}", message, stderr));

        Err(FlashOutcome::Failed {
            kind,
            message,
            hint: kind.hint().to_string(),
            stderr: Some(stderr),
            exit_code: invocation.exit_code,
        })
    }

    fn tool_failure(&self, error: ToolError) -> FlashOutcome {
        let kind = if error.is_missing_tool() {
            FailureKind::ToolMissing
        } else {
            FailureKind::OperationFailed
        };
        self.log(format!("Programmer tool error: {}", error));
        FlashOutcome::failed(kind, error.to_string())
    }
}
