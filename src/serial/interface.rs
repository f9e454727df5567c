use std::time::Duration;

use async_trait::async_trait;
use serialport::SerialPortType;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::{Result, SerialDeviceInfo, SerialError};

/// Byte-level access to one open port.
///
/// `read_data` returns `SerialError::Timeout` when nothing arrived within
/// `timeout_ms`, which callers treat as "idle", not as a failure.
#[async_trait]
pub trait SerialLink: Send {
    async fn send_data(&mut self, data: &[u8]) -> Result<usize>;
    async fn read_data(&mut self, buffer: &mut [u8], timeout_ms: u64) -> Result<usize>;
    async fn close(&mut self) -> Result<()>;
}

/// Enumerates and opens ports. Swapped for a fake in tests.
#[async_trait]
pub trait SerialBackend: Send + Sync {
    fn available_ports(&self) -> Result<Vec<SerialDeviceInfo>>;
    async fn open(&self, port_name: &str, baud_rate: u32) -> Result<Box<dyn SerialLink>>;
}

/// The OS serial stack via `serialport` / `tokio-serial`
#[derive(Debug, Default, Clone)]
pub struct SystemSerialBackend;

impl SystemSerialBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SerialBackend for SystemSerialBackend {
    fn available_ports(&self) -> Result<Vec<SerialDeviceInfo>> {
        let ports = serialport::available_ports()?;
        let devices = ports
            .into_iter()
            .map(|port| match port.port_type {
                SerialPortType::UsbPort(usb_info) => SerialDeviceInfo {
                    port_name: port.port_name,
                    vid: Some(usb_info.vid),
                    pid: Some(usb_info.pid),
                    serial_number: usb_info.serial_number,
                    manufacturer: usb_info.manufacturer,
                    product: usb_info.product,
                    is_esp: false,
                },
                _ => SerialDeviceInfo::plain(port.port_name),
            })
            .map(SerialDeviceInfo::enriched)
            .collect();
        Ok(devices)
    }

    async fn open(&self, port_name: &str, baud_rate: u32) -> Result<Box<dyn SerialLink>> {
        let mut interface = SerialInterface::new(port_name);
        interface.connect(baud_rate)?;
        Ok(Box::new(interface))
    }
}

/// One tokio-serial stream
pub struct SerialInterface {
    port_name: String,
    stream: Option<SerialStream>,
}

impl SerialInterface {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            stream: None,
        }
    }

    /// Open the port. Must run inside a tokio runtime.
    pub fn connect(&mut self, baud_rate: u32) -> Result<()> {
        let stream = tokio_serial::new(&self.port_name, baud_rate)
            .timeout(Duration::from_millis(1000))
            .open_native_async()
            .map_err(|e| SerialError::open_failed(&self.port_name, &e))?;

        self.stream = Some(stream);
        log::info!("Opened serial port {} @ {} baud", self.port_name, baud_rate);
        Ok(())
    }

    fn stream_mut(&mut self) -> Result<&mut SerialStream> {
        self.stream.as_mut().ok_or(SerialError::NotOpen)
    }
}

#[async_trait]
impl SerialLink for SerialInterface {
    async fn send_data(&mut self, data: &[u8]) -> Result<usize> {
        let stream = self.stream_mut()?;
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(data.len())
    }

    async fn read_data(&mut self, buffer: &mut [u8], timeout_ms: u64) -> Result<usize> {
        let port_name = self.port_name.clone();
        let stream = self.stream_mut()?;

        match timeout(Duration::from_millis(timeout_ms), stream.read(buffer)).await {
            Err(_) => Err(SerialError::Timeout),
            Ok(Ok(0)) => Err(SerialError::Disconnected(port_name)),
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => Err(SerialError::Timeout),
            Ok(Err(e)) => Err(SerialError::IoError(e)),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            log::info!("Closing serial port {}", self.port_name);
            // Dropping the stream releases the OS handle even if shutdown fails
            stream.shutdown().await?;
        }
        Ok(())
    }
}
