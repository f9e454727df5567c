//! Firmware image classification.
//!
//! [`FirmwareAnalyzer`] asks the programmer tool for an `image_info` report on
//! the file itself. If the report is unusable and the file carries an image
//! header at `0x1000` (merged flash image with bootloader), the bootloader
//! slice is extracted to a scratch file and queried instead.
pub mod image_info;
pub mod partitions;
pub mod secondary;

pub use secondary::{ScriptAnalyzer, SecondaryAnalyzer};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::events::{CoreEvent, EventSink};
use crate::tool::{ToolError, ToolResolver, ToolRunner};

const HEADER_WINDOW: usize = 32 * 1024;
const BOOTLOADER_OFFSET: usize = 0x1000;
const BOOTLOADER_SLICE: usize = 16 * 1024;
const IMAGE_MAGIC: u8 = 0xE9;
/// Family assumed for images with a bootloader at `BOOTLOADER_OFFSET`
const OFFSET_FAMILY: &str = "ESP32";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionEntry {
    pub label: String,
    #[serde(rename = "type")]
    pub partition_type: u8,
    pub subtype: u8,
    #[serde(with = "hex_u32")]
    pub offset: u32,
    #[serde(with = "hex_u32")]
    pub size: u32,
    #[serde(default)]
    pub encrypted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AnalysisResult {
    /// Which analyzer produced this
    pub source: String,
    pub chip: String,
    #[serde(with = "hex_u32::option")]
    pub chip_id: Option<u32>,
    pub flash_size: Option<String>,
    pub flash_mode: Option<String>,
    pub flash_freq: Option<String>,
    #[serde(with = "hex_u32::option")]
    pub entry_point: Option<u32>,
    pub segments: Option<u32>,
    pub is_full_image: bool,
    pub partitions: Vec<PartitionEntry>,
    #[serde(with = "hex_u32::option")]
    pub partition_table_offset: Option<u32>,
}

impl Default for AnalysisResult {
    fn default() -> Self {
        Self {
            source: String::new(),
            chip: "Unknown".to_string(),
            chip_id: None,
            flash_size: None,
            flash_mode: None,
            flash_freq: None,
            entry_point: None,
            segments: None,
            is_full_image: false,
            partitions: Vec::new(),
            partition_table_offset: None,
        }
    }
}

/// Negative results are values, not errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum AnalysisOutcome {
    Identified(AnalysisResult),
    Inconclusive,
}

impl AnalysisOutcome {
    pub fn result(&self) -> Option<&AnalysisResult> {
        match self {
            AnalysisOutcome::Identified(r) => Some(r),
            AnalysisOutcome::Inconclusive => None,
        }
    }

    pub fn into_result(self) -> Option<AnalysisResult> {
        match self {
            AnalysisOutcome::Identified(r) => Some(r),
            AnalysisOutcome::Inconclusive => None,
        }
    }
}

/// Parse `0x`-prefixed (or bare) hexadecimal
pub fn parse_hex(text: &str) -> Option<u32> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.is_empty() {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

/// Hex strings on the wire, numbers in memory. Accepts plain JSON numbers too.
mod hex_u32 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    fn decode<E: de::Error>(raw: Raw) -> Result<u32, E> {
        match raw {
            Raw::Number(n) => u32::try_from(n).map_err(|_| E::custom(format!("{} out of range", n))),
            Raw::Text(s) => super::parse_hex(&s).ok_or_else(|| E::custom(format!("invalid hex value '{}'", s))),
        }
    }

    pub fn serialize<S: Serializer>(value: &u32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:#x}", value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        decode(Raw::deserialize(deserializer)?)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(value: &Option<u32>, serializer: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => serializer.serialize_str(&format!("{:#x}", v)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
            Option::<Raw>::deserialize(deserializer)?.map(decode).transpose()
        }
    }
}

/// Temporary file removed on every exit path
struct ScratchFile {
    path: PathBuf,
    removed: bool,
}

impl ScratchFile {
    async fn create(dir: &Path, contents: &[u8]) -> std::io::Result<Self> {
        let scratch = Self {
            path: dir.join(format!("bootloader_extract_{}.bin", Uuid::new_v4())),
            removed: false,
        };
        // On failure `scratch` drops here and removes any partial file
        tokio::fs::write(&scratch.path, contents).await?;
        Ok(scratch)
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn remove(mut self) {
        self.removed = true;
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            log::warn!("Failed to remove scratch file {}: {}", self.path.display(), e);
        }
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if !self.removed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

pub struct FirmwareAnalyzer {
    resolver: ToolResolver,
    runner: Arc<dyn ToolRunner>,
    events: Arc<dyn EventSink>,
    scratch_dir: PathBuf,
}

impl FirmwareAnalyzer {
    pub fn new(
        resolver: ToolResolver,
        runner: Arc<dyn ToolRunner>,
        events: Arc<dyn EventSink>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            resolver,
            runner,
            events,
            scratch_dir: scratch_dir.into(),
        }
    }

    fn log(&self, message: impl Into<String>) {
        let message = message.into();
        log::info!("[analyze] {}", message);
        self.events.emit(CoreEvent::analysis_log(message));
    }

    pub async fn analyze(&self, file: &Path) -> AnalysisOutcome {
        self.log(format!("Starting firmware analysis for: {}", file.display()));

        let tool = match self.resolver.resolve() {
            Ok(path) => path,
            Err(e) => {
                self.log(format!("No programmer tool for this platform: {}", e));
                return AnalysisOutcome::Inconclusive;
            }
        };
        self.log(format!("Using programmer tool at: {}", tool.display()));

        let direct = match self.image_info(&tool, file, "Direct analysis").await {
            Ok(result) => result,
            Err(e) => {
                self.log(format!("Programmer tool unavailable: {}", e));
                return AnalysisOutcome::Inconclusive;
            }
        };

        let result = match direct {
            Some(result) => Some(result),
            None => {
                self.log("Direct analysis failed, trying with 0x1000 offset (bootloader)...");
                self.offset_attempt(&tool, file).await
            }
        };

        match result {
            Some(result) => AnalysisOutcome::Identified(self.attach_partitions(file, result).await),
            None => {
                self.log("Analysis inconclusive");
                AnalysisOutcome::Inconclusive
            }
        }
    }

    /// `Err` only when the tool cannot be run at all
    async fn image_info(&self, tool: &Path, target: &Path, label: &str) -> Result<Option<AnalysisResult>, ToolError> {
        let args = vec!["image_info".to_string(), target.to_string_lossy().into_owned()];
        self.log(format!("Executing: {} {}", tool.display(), args.join(" ")));

        let invocation = match self.runner.run(tool, &args).await {
            Ok(inv) => inv,
            Err(e) if e.is_missing_tool() => return Err(e),
            Err(e) => {
                self.log(format!("{} error: {}", label, e));
                return Ok(None);
            }
        };

        if !invocation.stderr.trim().is_empty() {
            self.log(format!("{} stderr: {}", label, invocation.stderr.trim()));
        }
        if !invocation.succeeded() {
            self.log(format!("{} exited with code {:?}", label, invocation.exit_code));
            return Ok(None);
        }

        let parsed = image_info::parse_image_info(&invocation.stdout);
        match &parsed {
            Some(r) => self.log(format!(
                "{} succeeded: chip {}, flash size {}",
                label,
                r.chip,
                r.flash_size.as_deref().unwrap_or("?")
            )),
            None => self.log(format!("{} produced no usable report", label)),
        }
        Ok(parsed)
    }

    async fn offset_attempt(&self, tool: &Path, file: &Path) -> Option<AnalysisResult> {
        let header = match read_head(file, HEADER_WINDOW).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.log(format!("Could not read {}: {}", file.display(), e));
                return None;
            }
        };

        if header.len() <= BOOTLOADER_OFFSET + 4 {
            self.log("File too small for offset analysis");
            return None;
        }
        if header[BOOTLOADER_OFFSET] != IMAGE_MAGIC {
            self.log(format!(
                "No image magic at 0x1000 (found {:#04x})",
                header[BOOTLOADER_OFFSET]
            ));
            return None;
        }

        self.log("Found ESP image magic (0xE9) at 0x1000, extracting bootloader...");
        let end = header.len().min(BOOTLOADER_OFFSET + BOOTLOADER_SLICE);
        let scratch = match ScratchFile::create(&self.scratch_dir, &header[BOOTLOADER_OFFSET..end]).await {
            Ok(s) => s,
            Err(e) => {
                self.log(format!("Could not write scratch file: {}", e));
                return None;
            }
        };

        let attempt = self.image_info(tool, scratch.path(), "Bootloader analysis").await;
        scratch.remove().await;

        let mut result = attempt.ok().flatten()?;
        result.is_full_image = true;
        if result.chip == "Unknown" {
            result.chip = OFFSET_FAMILY.to_string();
        }
        Some(result)
    }

    async fn attach_partitions(&self, file: &Path, mut result: AnalysisResult) -> AnalysisResult {
        let image = match tokio::fs::read(file).await {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Skipping partition scan of {}: {}", file.display(), e);
                return result;
            }
        };

        if let Some((offset, entries)) = partitions::scan(&image) {
            self.log(format!("Found partition table at {:#x} with {} entries", offset, entries.len()));
            result.partition_table_offset = Some(offset);
            result.partitions = entries;
            result.is_full_image = true;
        }
        result
    }
}

async fn read_head(file: &Path, limit: usize) -> std::io::Result<Vec<u8>> {
    let handle = tokio::fs::File::open(file).await?;
    let mut buf = Vec::with_capacity(limit);
    handle.take(limit as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_parsing() {
        assert_eq!(parse_hex("0x10000"), Some(0x10000));
        assert_eq!(parse_hex("0X1f"), Some(0x1f));
        assert_eq!(parse_hex("8000"), Some(0x8000));
        assert_eq!(parse_hex("0x"), None);
        assert_eq!(parse_hex("zz"), None);
    }

    #[test]
    fn result_serializes_hex_fields() {
        let result = AnalysisResult {
            entry_point: Some(0x40080000),
            ..AnalysisResult::default()
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["entry_point"], "0x40080000");
        assert_eq!(json["chip_id"], serde_json::Value::Null);

        let back: AnalysisResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }

    #[tokio::test]
    async fn scratch_file_is_removed_on_drop() {
        let dir = std::env::temp_dir();
        let path = {
            let scratch = ScratchFile::create(&dir, b"abc").await.unwrap();
            assert!(scratch.path().exists());
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
