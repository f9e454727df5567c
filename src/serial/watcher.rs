//! Polling hot-plug watcher: announces ports that appear between scans.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use super::{SerialBackend, SerialDeviceInfo};
use crate::events::{CoreEvent, EventSink};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

struct WatchSession {
    task_handle: tokio::task::JoinHandle<()>,
    stop_tx: mpsc::Sender<()>,
}

pub struct PortWatcher {
    backend: Arc<dyn SerialBackend>,
    events: Arc<dyn EventSink>,
    poll_interval: Duration,
    session: Mutex<Option<WatchSession>>,
}

impl PortWatcher {
    pub fn new(backend: Arc<dyn SerialBackend>, events: Arc<dyn EventSink>, poll_interval: Duration) -> Self {
        Self {
            backend,
            events,
            poll_interval,
            session: Mutex::new(None),
        }
    }

    /// Start polling. The first scan only seeds the known set.
    pub async fn start(&self) -> Result<(), String> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            log::warn!("Port watcher already running");
            return Err("Port watcher already running".to_string());
        }

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let task_handle = tokio::spawn(watch_loop(
            self.backend.clone(),
            self.events.clone(),
            self.poll_interval,
            stop_rx,
        ));

        *session = Some(WatchSession { task_handle, stop_tx });
        log::info!("Port watcher started ({:?} interval)", self.poll_interval);
        Ok(())
    }

    pub async fn stop(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            let _ = session.stop_tx.send(()).await;
            let _ = timeout(Duration::from_secs(2), session.task_handle).await;
            log::info!("Port watcher stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.session.lock().await.is_some()
    }
}

async fn scan(backend: &Arc<dyn SerialBackend>) -> Option<Vec<SerialDeviceInfo>> {
    match super::enumerate_ports(backend).await {
        Ok(ports) => Some(ports),
        Err(e) => {
            log::error!("Error polling serial ports: {}", e);
            None
        }
    }
}

async fn watch_loop(
    backend: Arc<dyn SerialBackend>,
    events: Arc<dyn EventSink>,
    poll_interval: Duration,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let mut known: HashSet<String> = scan(&backend)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|p| p.port_name)
        .collect();

    let mut interval = tokio::time::interval(poll_interval);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                let Some(ports) = scan(&backend).await else { continue };
                for port in &ports {
                    if !known.contains(&port.port_name) {
                        log::info!("New device detected: {}", port.port_name);
                        events.emit(CoreEvent::DeviceDetected(port.clone()));
                    }
                }
                known = ports.into_iter().map(|p| p.port_name).collect();
            }
        }
    }
}
