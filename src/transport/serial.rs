//! Serial transport implementation.
//!
//! This module provides serial port communication with a panStamp modem
//! connected via USB or UART. Any other byte stream can be attached in place
//! of the port.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPort, SerialPortBuilderExt};

use crate::error::{Error, Result};
use crate::protocol::LineDecoder;
use crate::transport::{LineReceiver, Transport};

/// Default baud rate of panStamp modems.
pub const DEFAULT_BAUD_RATE: u32 = 38_400;

/// Default length of the DTR reset pulse.
pub const DEFAULT_RESET_DELAY: Duration = Duration::from_millis(100);

/// Default wait for the modem's ready banner.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

const LINE_CHANNEL_CAPACITY: usize = 64;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Configuration for serial transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Length of the DTR pulse that resets the modem on open.
    #[serde(with = "millis")]
    pub reset_delay: Duration,
    /// How long to wait for the modem's ready banner.
    #[serde(with = "millis")]
    pub ready_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("/dev/ttyUSB0")
    }
}

impl SerialConfig {
    /// Creates a new serial configuration with default settings.
    #[must_use]
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            reset_delay: DEFAULT_RESET_DELAY,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    /// Sets the baud rate.
    #[must_use]
    pub const fn baud_rate(mut self, rate: u32) -> Self {
        self.baud_rate = rate;
        self
    }

    /// Sets the reset pulse length.
    #[must_use]
    pub const fn reset_delay(mut self, delay: Duration) -> Self {
        self.reset_delay = delay;
        self
    }

    /// Sets the ready banner timeout.
    #[must_use]
    pub const fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }
}

/// Durations stored as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serial transport for the modem link.
///
/// Uses split read/write halves so the reader task runs while commands are
/// written.
pub struct SerialTransport {
    config: SerialConfig,
    writer: Option<Arc<Mutex<BoxedWriter>>>,
    reader_task: Option<JoinHandle<()>>,
    lines: Option<LineReceiver>,
}

impl SerialTransport {
    /// Creates a new serial transport with the given configuration.
    #[must_use]
    pub const fn new(config: SerialConfig) -> Self {
        Self {
            config,
            writer: None,
            reader_task: None,
            lines: None,
        }
    }

    /// Creates a new serial transport for the given port with default settings.
    #[must_use]
    pub fn with_port(port: impl Into<String>) -> Self {
        Self::new(SerialConfig::new(port))
    }

    /// Uses an already open byte stream instead of the serial port.
    ///
    /// Replaces any current connection. Must be called within a tokio runtime.
    pub fn attach<S>(&mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.close_reader();
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        self.reader_task = Some(tokio::spawn(Self::run_read_loop(Box::new(reader), tx)));
        self.writer = Some(Arc::new(Mutex::new(Box::new(writer))));
        self.lines = Some(rx);
    }

    /// Reads from `reader` and forwards complete lines to `line_tx` until the
    /// stream ends, fails, or the receiver is dropped.
    async fn run_read_loop(mut reader: BoxedReader, line_tx: mpsc::Sender<Result<String>>) {
        let mut decoder = LineDecoder::new();
        let mut buf = [0u8; 1024];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("serial port closed");
                    let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "serial port closed");
                    let _ = line_tx.send(Err(Error::Transport(eof))).await;
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("serial read error: {}", e);
                    let _ = line_tx.send(Err(Error::Transport(e))).await;
                    return;
                }
            };

            tracing::trace!("received {} bytes", n);
            decoder.feed(&buf[..n]);

            while let Some(line) = decoder.decode() {
                tracing::trace!("rx line: {}", line);
                if line_tx.send(Ok(line)).await.is_err() {
                    tracing::debug!("line receiver dropped");
                    return;
                }
            }
        }
    }

    fn close_reader(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.lines = None;
    }
}

impl Transport for SerialTransport {
    fn connect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.writer.is_some() {
                return Ok(());
            }

            tracing::info!("connecting to serial port: {}", self.config.port);

            let mut stream = tokio_serial::new(&self.config.port, self.config.baud_rate)
                .open_native_async()
                .map_err(|source| Error::PortUnavailable {
                    port: self.config.port.clone(),
                    source,
                })?;

            // Pulse DTR to reset the modem; it answers with its ready banner
            if let Err(e) = stream.write_data_terminal_ready(false) {
                tracing::warn!("failed to clear DTR: {}", e);
            }
            tokio::time::sleep(self.config.reset_delay).await;
            if let Err(e) = stream.write_data_terminal_ready(true) {
                tracing::warn!("failed to set DTR: {}", e);
            }
            if let Err(e) = stream.clear(tokio_serial::ClearBuffer::All) {
                tracing::warn!("failed to clear serial buffers: {}", e);
            }

            self.attach(stream);
            tracing::info!("connected to serial port");
            Ok(())
        })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Some(writer) = self.writer.take() {
                tracing::info!("disconnecting from serial port");
                let mut writer = writer.lock().await;
                if let Err(e) = writer.flush().await {
                    tracing::warn!("failed to flush serial port: {}", e);
                }
                let _ = writer.shutdown().await;
            }
            self.close_reader();
            Ok(())
        })
    }

    fn send(&mut self, data: Bytes) -> BoxFuture<'_, Result<()>> {
        let writer = self.writer.clone();
        Box::pin(async move {
            let writer = writer.ok_or(Error::PortClosed)?;
            let mut writer = writer.lock().await;

            tracing::trace!("sending {} bytes", data.len());

            writer.write_all(&data).await?;
            writer.flush().await?;

            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.writer.is_some()
    }

    fn take_lines(&mut self) -> Option<LineReceiver> {
        self.lines.take()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close_reader();
    }
}

/// Lists available serial ports.
///
/// # Errors
///
/// Returns an error if the port list cannot be retrieved.
pub fn list_ports() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports().map_err(|source| Error::PortUnavailable {
        port: String::from("*"),
        source,
    })?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
