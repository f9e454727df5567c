//! Parser for the programmer tool's `image_info` report.
use once_cell::sync::Lazy;
use regex::Regex;

use super::{parse_hex, AnalysisResult};

static FLASH_SIZE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Flash size: (\w+)").unwrap());
static FLASH_FREQ: Lazy<Regex> = Lazy::new(|| Regex::new(r"Flash freq: (\w+)").unwrap());
static FLASH_MODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Flash mode: (\w+)").unwrap());
static ENTRY_POINT: Lazy<Regex> = Lazy::new(|| Regex::new(r"Entry point: (0x[0-9a-fA-F]+)").unwrap());
static SEGMENTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"Segments: (\d+)").unwrap());
static CHIP_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"Chip ID: (0x[0-9a-fA-F]+)").unwrap());

pub const SOURCE_TOOL: &str = "esptool-binary";

// Order matters: plain "esp32" is a substring of every other family
const CHIP_FAMILIES: &[(&str, &str)] = &[
    ("esp32s3", "ESP32-S3"),
    ("esp32c3", "ESP32-C3"),
    ("esp32c6", "ESP32-C6"),
    ("esp32p4", "ESP32-P4"),
    ("esp32", "ESP32"),
];

fn capture<'a>(re: &Regex, text: &'a str) -> Option<&'a str> {
    re.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str())
}

/// Classify the chip family from the raw report. `chip_id` is the ID text as
/// the tool printed it.
pub fn chip_family(stdout: &str, chip_id: Option<&str>) -> String {
    if let Some((_, name)) = CHIP_FAMILIES.iter().find(|(needle, _)| stdout.contains(needle)) {
        return (*name).to_string();
    }
    match chip_id {
        Some(id) => format!("Unknown (ID: {})", id),
        None => "Unknown".to_string(),
    }
}

/// Extract what the report offers. `None` unless at least a flash size or an
/// entry point was found.
pub fn parse_image_info(stdout: &str) -> Option<AnalysisResult> {
    let chip_id_text = capture(&CHIP_ID, stdout);

    let result = AnalysisResult {
        source: SOURCE_TOOL.to_string(),
        chip: chip_family(stdout, chip_id_text),
        chip_id: chip_id_text.and_then(parse_hex),
        flash_size: capture(&FLASH_SIZE, stdout).map(str::to_string),
        flash_freq: capture(&FLASH_FREQ, stdout).map(str::to_string),
        flash_mode: capture(&FLASH_MODE, stdout).map(str::to_string),
        entry_point: capture(&ENTRY_POINT, stdout).and_then(parse_hex),
        segments: capture(&SEGMENTS, stdout).and_then(|s| s.parse().ok()),
        ..AnalysisResult::default()
    };

    if result.flash_size.is_some() || result.entry_point.is_some() {
        Some(result)
    } else {
        None
    }
}
