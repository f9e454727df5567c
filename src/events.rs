//! Outbound event stream toward the UI layer.
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::download::DownloadProgress;

/// Everything the engine pushes toward the UI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoreEvent {
    AnalysisLog { timestamp: DateTime<Utc>, message: String },
    FlashLog { timestamp: DateTime<Utc>, message: String },
    FlashProgress { percent: u8 },
    SerialData { connection_id: Uuid, data: Vec<u8> },
    SerialError { connection_id: Uuid, message: String },
    SerialClosed { connection_id: Uuid, port_name: String },
    DownloadProgress(DownloadProgress),
    ManifestSourceChanged { custom_path: Option<String> },
    DeviceDetected(crate::serial::SerialDeviceInfo),
}

impl CoreEvent {
    pub fn analysis_log(message: impl Into<String>) -> Self {
        CoreEvent::AnalysisLog { timestamp: Utc::now(), message: message.into() }
    }

    pub fn flash_log(message: impl Into<String>) -> Self {
        CoreEvent::FlashLog { timestamp: Utc::now(), message: message.into() }
    }
}

/// Injected publish capability. The transport behind it belongs to the host.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: CoreEvent);
}

/// Fans events out over a tokio broadcast channel
pub struct BroadcastSink {
    tx: broadcast::Sender<CoreEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: CoreEvent) {
        // No subscribers is not an error; the UI may not be listening yet
        let _ = self.tx.send(event);
    }
}

/// Keeps every emitted event in memory, in emission order
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<CoreEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CoreEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Concatenated payload of every `SerialData` event
    pub fn serial_bytes(&self) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                CoreEvent::SerialData { data, .. } => Some(data),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: CoreEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
