pub mod arbiter;
pub mod interface;
pub mod vendors;
pub mod watcher;

pub use arbiter::{ConnectionInfo, PortArbiter, ReleaseOutcome};
pub use interface::{SerialBackend, SerialInterface, SerialLink, SystemSerialBackend};
pub use watcher::PortWatcher;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A physical port as seen during one enumeration. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub is_esp: bool,
}

impl SerialDeviceInfo {
    /// Port without USB metadata (built-in UART, Bluetooth, PCI)
    pub fn plain(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            vid: None,
            pid: None,
            serial_number: None,
            manufacturer: None,
            product: None,
            is_esp: false,
        }
    }

    /// Fill in manufacturer from the vendor table and flag known ESP bridges
    pub fn enriched(mut self) -> Self {
        if self.manufacturer.is_none() {
            self.manufacturer = self.vid.and_then(vendors::manufacturer_for).map(str::to_string);
        }
        self.is_esp = match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => vendors::is_esp_bridge(vid, pid),
            _ => false,
        };
        self
    }
}

/// Why an open attempt was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortOpenKind {
    Busy,
    NotFound,
    PermissionDenied,
    Other,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Could not open {port}: {reason}")]
    PortOpen {
        port: String,
        kind: PortOpenKind,
        reason: String,
    },

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Serial port is not open")]
    NotOpen,

    #[error("Device disconnected: {0}")]
    Disconnected(String),

    #[error("Communication timeout")]
    Timeout,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

impl SerialError {
    /// Classify a serialport open failure
    pub fn open_failed(port: &str, err: &serialport::Error) -> Self {
        let description = err.description.to_lowercase();
        let kind = match err.kind() {
            serialport::ErrorKind::NoDevice => PortOpenKind::NotFound,
            serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => PortOpenKind::NotFound,
            _ if description.contains("busy") || description.contains("in use") => PortOpenKind::Busy,
            // Windows reports a port held by another process as access denied
            serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) if cfg!(windows) => PortOpenKind::Busy,
            serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => PortOpenKind::PermissionDenied,
            _ => PortOpenKind::Other,
        };
        SerialError::PortOpen {
            port: port.to_string(),
            kind,
            reason: err.description.clone(),
        }
    }

    /// Message for the end user, phrased around what they can do about it
    pub fn user_message(&self) -> String {
        match self {
            SerialError::PortOpen { port, kind: PortOpenKind::Busy, .. } => format!(
                "{} is busy. Close other programs using the port, or unplug and replug the device.",
                port
            ),
            SerialError::PortOpen { port, kind: PortOpenKind::NotFound, .. } | SerialError::PortNotFound(port) => {
                format!("{} was not found. Check the cable and replug the device.", port)
            }
            SerialError::PortOpen { port, kind: PortOpenKind::PermissionDenied, .. } => {
                format!("Permission denied opening {}. Check that your user may access serial devices.", port)
            }
            SerialError::Disconnected(port) => format!("{} was disconnected. Replug the device and reconnect.", port),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SerialError>;

/// Enumerate and enrich ports on the blocking pool; OS enumeration is synchronous
pub(crate) async fn enumerate_ports(backend: &Arc<dyn SerialBackend>) -> Result<Vec<SerialDeviceInfo>> {
    let backend = backend.clone();
    tokio::task::spawn_blocking(move || backend.available_ports())
        .await
        .map_err(|e| SerialError::IoError(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?
        .map(|ports| ports.into_iter().map(SerialDeviceInfo::enriched).collect())
}
