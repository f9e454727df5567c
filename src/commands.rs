//! Request/response surface for the UI host. Every command maps failures to a
//! user-facing string.
use std::path::{Path, PathBuf};

use crate::analysis::AnalysisOutcome;
use crate::download::DownloadRecord;
use crate::engine::Engine;
use crate::flash::{
    DumpRequest, FlashOutcome, FlashRequest, DEFAULT_DUMP_ADDRESS, DEFAULT_DUMP_SIZE, DEFAULT_FLASH_BAUD,
};
use crate::manifest::ManifestDocument;
use crate::serial::{ConnectionInfo, SerialDeviceInfo, SerialError};

/// Classify a firmware file
pub async fn analyze_firmware(engine: &Engine, file_path: String) -> Result<AnalysisOutcome, String> {
    let path = PathBuf::from(&file_path);
    if !path.is_file() {
        return Err(format!("Failed to analyze firmware: file not found: {}", file_path));
    }
    Ok(engine.analyze(&path).await)
}

/// Write a firmware image to the device
pub async fn flash_firmware(
    engine: &Engine,
    port: String,
    baud_rate: Option<u32>,
    file_path: String,
    offset: String,
) -> Result<FlashOutcome, String> {
    let request = FlashRequest {
        port,
        baud_rate: baud_rate.unwrap_or(DEFAULT_FLASH_BAUD),
        file: PathBuf::from(file_path),
        offset,
    };
    Ok(engine.flasher.flash(&request).await)
}

/// Read a flash region into a new dump file. Omitted values read the first 4 MiB
/// at the flashing baud rate.
pub async fn dump_firmware(
    engine: &Engine,
    port: String,
    baud_rate: Option<u32>,
    address: Option<String>,
    size: Option<String>,
) -> Result<FlashOutcome, String> {
    let request = DumpRequest {
        port,
        baud_rate: baud_rate.unwrap_or(DEFAULT_FLASH_BAUD),
        address: address.unwrap_or_else(|| DEFAULT_DUMP_ADDRESS.to_string()),
        size: size.unwrap_or_else(|| DEFAULT_DUMP_SIZE.to_string()),
    };
    Ok(engine.flasher.dump(&request).await)
}

/// Enumerate serial ports
pub async fn list_ports(engine: &Engine) -> Result<Vec<SerialDeviceInfo>, String> {
    engine
        .arbiter
        .list_ports()
        .await
        .map_err(|e| format!("Failed to list serial ports: {}", e))
}

/// Open a monitor connection
pub async fn connect(engine: &Engine, port: String, baud_rate: u32) -> Result<ConnectionInfo, String> {
    engine
        .arbiter
        .open(&port, baud_rate)
        .await
        .map_err(|e| format!("Failed to connect: {}", e.user_message()))
}

pub async fn disconnect(engine: &Engine) -> Result<(), String> {
    engine
        .arbiter
        .close()
        .await
        .map_err(|e| format!("Failed to disconnect: {}", e))
}

/// Send bytes to the open monitor connection
pub async fn write_serial(engine: &Engine, data: Vec<u8>) -> Result<usize, String> {
    engine.arbiter.write(&data).await.map_err(|e| match e {
        SerialError::NotOpen => "Failed to write: no serial port is open".to_string(),
        other => format!("Failed to write: {}", other.user_message()),
    })
}

pub async fn download_firmware(engine: &Engine, url: String) -> Result<DownloadRecord, String> {
    engine
        .downloads
        .download(&url)
        .await
        .map_err(|e| format!("Failed to download firmware: {}", e))
}

pub async fn remove_file(path: String) -> Result<(), String> {
    crate::files::remove_file(Path::new(&path))
        .await
        .map_err(|e| format!("Failed to remove file: {}", e))
}

/// Copy `source_path` to a location the user picks. `None` when cancelled.
pub async fn save_file_as(engine: &Engine, default_name: String, source_path: String) -> Result<Option<String>, String> {
    crate::files::save_file_as(engine.picker.as_ref(), &default_name, Path::new(&source_path))
        .await
        .map(|saved| saved.map(|p| p.to_string_lossy().into_owned()))
        .map_err(|e| format!("Failed to save file: {}", e))
}

pub async fn get_firmware_manifest(engine: &Engine) -> Result<ManifestDocument, String> {
    Ok(engine.manifest.get_manifest().await)
}

/// Let the user pick a catalog file; returns its path, or `None` when cancelled
pub async fn select_custom_manifest_file(engine: &Engine) -> Result<Option<String>, String> {
    let Some(path) = engine.picker.pick_open("Select firmware manifest", &["json"]).await else {
        return Ok(None);
    };
    engine
        .manifest
        .set_custom_manifest(&path)
        .await
        .map_err(|e| format!("Failed to use custom manifest: {}", e))?;
    Ok(Some(path.to_string_lossy().into_owned()))
}

pub async fn clear_custom_manifest(engine: &Engine) -> Result<(), String> {
    engine
        .manifest
        .clear_custom_manifest()
        .await
        .map_err(|e| format!("Failed to clear custom manifest: {}", e))
}

pub async fn get_custom_manifest_path(engine: &Engine) -> Result<Option<String>, String> {
    Ok(engine
        .manifest
        .custom_manifest_path()
        .await
        .map(|p| p.to_string_lossy().into_owned()))
}

pub fn get_api_base_url(engine: &Engine) -> Result<String, String> {
    Ok(engine.config.api_base_url().to_string())
}

pub fn get_asset_domain_prefix(engine: &Engine) -> Result<String, String> {
    Ok(engine.config.asset_domain_prefix().to_string())
}

/// Start announcing newly attached ports
pub async fn start_device_watch(engine: &Engine) -> Result<(), String> {
    engine
        .watcher
        .start()
        .await
        .map_err(|e| format!("Failed to start device watch: {}", e))
}

pub async fn stop_device_watch(engine: &Engine) -> Result<(), String> {
    engine.watcher.stop().await;
    Ok(())
}
