//! Owner of the single serial connection a process may hold.
//!
//! The arbiter is either `Closed` or `Open` with exactly one connection. While
//! open, one reader task drains the port and republishes bytes as
//! `CoreEvent::SerialData` in device order. Writes share the link mutex, so a
//! write only starts once the previous one has completed.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{Result, SerialBackend, SerialDeviceInfo, SerialError, SerialLink};
use crate::events::{CoreEvent, EventSink};

const READ_POLL_MS: u64 = 25;
const READ_BUFFER_SIZE: usize = 512;
pub const DEFAULT_RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub port_name: String,
    pub baud_rate: u32,
    pub opened_at: DateTime<Utc>,
}

/// Result of handing the port over to an external tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseOutcome {
    /// Nothing was open on that port
    NotOpen,
    Released,
    /// Close did not finish in time; the connection was dropped anyway
    TimedOut,
}

type SharedLink = Arc<Mutex<Box<dyn SerialLink>>>;

struct ActiveConnection {
    info: ConnectionInfo,
    link: SharedLink,
    stop_tx: watch::Sender<bool>,
    reader: JoinHandle<()>,
    /// Set by whichever side (reader or caller) tears the link down first
    torn_down: Arc<AtomicBool>,
}

enum ArbiterState {
    Closed,
    Open(ActiveConnection),
}

pub struct PortArbiter {
    backend: Arc<dyn SerialBackend>,
    events: Arc<dyn EventSink>,
    state: Arc<Mutex<ArbiterState>>,
    // Serializes open/close/release so two transitions never interleave
    transition: Mutex<()>,
    release_timeout: Duration,
}

impl PortArbiter {
    pub fn new(backend: Arc<dyn SerialBackend>, events: Arc<dyn EventSink>) -> Self {
        Self {
            backend,
            events,
            state: Arc::new(Mutex::new(ArbiterState::Closed)),
            transition: Mutex::new(()),
            release_timeout: DEFAULT_RELEASE_TIMEOUT,
        }
    }

    pub fn with_release_timeout(mut self, release_timeout: Duration) -> Self {
        self.release_timeout = release_timeout;
        self
    }

    /// Enumerate ports, with manufacturer enrichment applied
    pub async fn list_ports(&self) -> Result<Vec<SerialDeviceInfo>> {
        super::enumerate_ports(&self.backend).await
    }

    /// Open `port_name`, closing any connection that is already open first
    pub async fn open(&self, port_name: &str, baud_rate: u32) -> Result<ConnectionInfo> {
        let _transition = self.transition.lock().await;

        if let Some(previous) = self.take_connection().await {
            log::info!("Closing {} before opening {}", previous.info.port_name, port_name);
            if let Err(e) = self.shutdown(previous).await {
                log::warn!("Error closing previous port: {}", e);
            }
        }

        let link = self.backend.open(port_name, baud_rate).await.map_err(|e| {
            log::error!("Failed to open {}: {}", port_name, e);
            e
        })?;

        let info = ConnectionInfo {
            id: Uuid::new_v4(),
            port_name: port_name.to_string(),
            baud_rate,
            opened_at: Utc::now(),
        };
        let link: SharedLink = Arc::new(Mutex::new(link));
        let (stop_tx, stop_rx) = watch::channel(false);
        let torn_down = Arc::new(AtomicBool::new(false));

        // Hold the state lock across the spawn so a reader that fails at once
        // still finds its own connection recorded
        let mut state = self.state.lock().await;
        let reader = tokio::spawn(reader_loop(
            info.clone(),
            link.clone(),
            stop_rx,
            torn_down.clone(),
            self.events.clone(),
            self.state.clone(),
        ));

        *state = ArbiterState::Open(ActiveConnection {
            info: info.clone(),
            link,
            stop_tx,
            reader,
            torn_down,
        });
        drop(state);

        log::info!("Serial monitor connected to {} @ {} baud", port_name, baud_rate);
        Ok(info)
    }

    /// Close the current connection. Closing when already closed is a no-op.
    pub async fn close(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        match self.take_connection().await {
            Some(connection) => self.shutdown(connection).await,
            None => Ok(()),
        }
    }

    /// Release the device before an external tool needs it. Always leaves the
    /// arbiter `Closed`; a close that overruns the bound is logged and dropped.
    pub async fn force_release_for_external_tool(&self) -> ReleaseOutcome {
        let _transition = self.transition.lock().await;
        let Some(connection) = self.take_connection().await else {
            return ReleaseOutcome::NotOpen;
        };
        self.release_with_timeout(connection).await
    }

    /// Like `force_release_for_external_tool`, but only when `port_name` is the
    /// port currently held
    pub async fn release_port(&self, port_name: &str) -> ReleaseOutcome {
        let _transition = self.transition.lock().await;
        let connection = {
            let mut state = self.state.lock().await;
            let holds_port = matches!(&*state, ArbiterState::Open(c) if same_port(&c.info.port_name, port_name));
            if !holds_port {
                return ReleaseOutcome::NotOpen;
            }
            match std::mem::replace(&mut *state, ArbiterState::Closed) {
                ArbiterState::Open(c) => c,
                ArbiterState::Closed => return ReleaseOutcome::NotOpen,
            }
        };
        self.release_with_timeout(connection).await
    }

    /// Write to the open port. Calling this while closed is a caller bug and
    /// returns `SerialError::NotOpen`.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let (id, link) = {
            let state = self.state.lock().await;
            match &*state {
                ArbiterState::Open(c) => (c.info.id, c.link.clone()),
                ArbiterState::Closed => return Err(SerialError::NotOpen),
            }
        };

        let result = link.lock().await.send_data(data).await;
        if let Err(e) = &result {
            log::error!("Serial write failed: {}", e);
            self.events.emit(CoreEvent::SerialError {
                connection_id: id,
                message: e.to_string(),
            });
        }
        result
    }

    pub async fn is_open(&self) -> bool {
        matches!(&*self.state.lock().await, ArbiterState::Open(_))
    }

    pub async fn current(&self) -> Option<ConnectionInfo> {
        match &*self.state.lock().await {
            ArbiterState::Open(c) => Some(c.info.clone()),
            ArbiterState::Closed => None,
        }
    }

    async fn take_connection(&self) -> Option<ActiveConnection> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, ArbiterState::Closed) {
            ArbiterState::Open(c) => Some(c),
            ArbiterState::Closed => None,
        }
    }

    async fn release_with_timeout(&self, connection: ActiveConnection) -> ReleaseOutcome {
        let port_name = connection.info.port_name.clone();
        match tokio::time::timeout(self.release_timeout, self.shutdown(connection)).await {
            Ok(Ok(())) => {
                log::info!("Released {} for external tool", port_name);
                ReleaseOutcome::Released
            }
            Ok(Err(e)) => {
                log::warn!("Error while releasing {}: {}; continuing", port_name, e);
                ReleaseOutcome::Released
            }
            Err(_) => {
                log::warn!(
                    "Releasing {} did not finish within {:?}; continuing",
                    port_name,
                    self.release_timeout
                );
                ReleaseOutcome::TimedOut
            }
        }
    }

    /// Stop the reader, then close the link
    async fn shutdown(&self, connection: ActiveConnection) -> Result<()> {
        let ActiveConnection {
            info,
            link,
            stop_tx,
            reader,
            torn_down,
        } = connection;

        let _ = stop_tx.send(true);
        if let Err(e) = reader.await {
            log::warn!("Serial reader for {} ended abnormally: {}", info.port_name, e);
        }

        if torn_down.swap(true, Ordering::SeqCst) {
            // Reader already closed the link after an error
            return Ok(());
        }
        let result = link.lock().await.close().await;
        self.events.emit(CoreEvent::SerialClosed {
            connection_id: info.id,
            port_name: info.port_name.clone(),
        });
        log::info!("Serial port {} closed", info.port_name);
        result
    }
}

fn same_port(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

async fn reader_loop(
    info: ConnectionInfo,
    link: SharedLink,
    mut stop_rx: watch::Receiver<bool>,
    torn_down: Arc<AtomicBool>,
    events: Arc<dyn EventSink>,
    state: Arc<Mutex<ArbiterState>>,
) {
    let failure = loop {
        if *stop_rx.borrow() {
            return;
        }
        tokio::select! {
            // Only ever flipped to true, or dropped with the connection
            _ = stop_rx.changed() => return,
            read = async {
                let mut buf = [0u8; READ_BUFFER_SIZE];
                let mut guard = link.lock().await;
                guard.read_data(&mut buf, READ_POLL_MS).await.map(|n| buf[..n].to_vec())
            } => {
                match read {
                    Ok(data) if !data.is_empty() => events.emit(CoreEvent::SerialData {
                        connection_id: info.id,
                        data,
                    }),
                    Ok(_) | Err(SerialError::Timeout) => {}
                    Err(e) => break e,
                }
            }
        }
    };

    log::error!("Serial port {} error: {}", info.port_name, failure);
    events.emit(CoreEvent::SerialError {
        connection_id: info.id,
        message: failure.to_string(),
    });

    if !torn_down.swap(true, Ordering::SeqCst) {
        if let Err(e) = link.lock().await.close().await {
            log::warn!("Error closing {} after failure: {}", info.port_name, e);
        }
        events.emit(CoreEvent::SerialClosed {
            connection_id: info.id,
            port_name: info.port_name.clone(),
        });
    }

    // The connection is gone; drop it from the arbiter unless it was replaced
    let mut state = state.lock().await;
    if matches!(&*state, ArbiterState::Open(c) if c.info.id == info.id) {
        *state = ArbiterState::Closed;
    }
}
