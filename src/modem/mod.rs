//! AT command session with the serial modem.
//!
//! The modem is either in data mode, where radio frames flow through, or in
//! command mode, where it answers AT commands and radio traffic is
//! suppressed. A background router splits incoming lines: radio frames
//! (lines opening with `(`) go to the packet channel while in data mode and
//! are dropped in command mode; every other line is an AT response.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::{COMMAND_ESCAPE, CcPacket, FRAME_START, SwapPacket, encode_frame};
use crate::transport::{LineReceiver, SerialConfig, SerialTransport, Transport};

/// Default wait for an AT response.
pub const DEFAULT_AT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Wait for the answer to the command mode escape.
pub const COMMAND_MODE_TIMEOUT: Duration = Duration::from_millis(3000);

/// Banner printed by the modem after power-up or reset.
pub const READY_BANNER: &str = "Modem ready!";

const PACKET_CHANNEL_CAPACITY: usize = 256;
const RESPONSE_CHANNEL_CAPACITY: usize = 16;

/// Radio frames received in data mode. A transport failure arrives as the
/// final `Err` item.
pub type PacketReceiver = mpsc::Receiver<Result<CcPacket>>;

/// Serial mode of the modem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModemMode {
    /// Radio frames flow through.
    #[default]
    Data,
    /// AT commands are accepted.
    Command,
}

/// Settings read back from the modem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModemInfo {
    /// Hardware version.
    pub hardware_version: u32,
    /// Firmware version.
    pub firmware_version: u32,
    /// Radio frequency channel.
    pub frequency_channel: u8,
    /// Radio sync word, the network id.
    pub sync_word: u16,
    /// Gateway address.
    pub device_address: u8,
    /// Current serial mode.
    pub mode: ModemMode,
}

/// AT session with a panStamp serial modem.
pub struct Modem {
    transport: Box<dyn Transport>,
    ready_timeout: Duration,
    at_timeout: Duration,
    info: ModemInfo,
    data_mode: Arc<AtomicBool>,
    responses: Option<mpsc::Receiver<String>>,
    packets: Option<PacketReceiver>,
    router: Option<JoinHandle<()>>,
}

impl Modem {
    /// Creates a modem session over `transport`. Nothing is sent until
    /// [`open`](Self::open).
    #[must_use]
    pub fn new(transport: impl Transport + 'static, ready_timeout: Duration) -> Self {
        Self {
            transport: Box::new(transport),
            ready_timeout,
            at_timeout: DEFAULT_AT_TIMEOUT,
            info: ModemInfo::default(),
            data_mode: Arc::new(AtomicBool::new(true)),
            responses: None,
            packets: None,
            router: None,
        }
    }

    /// Creates a modem session on a serial port.
    #[must_use]
    pub fn serial(config: SerialConfig) -> Self {
        let ready_timeout = config.ready_timeout;
        Self::new(SerialTransport::new(config), ready_timeout)
    }

    /// Sets the default AT response timeout.
    pub fn set_at_timeout(&mut self, timeout: Duration) {
        self.at_timeout = timeout;
    }

    /// Settings read back from the modem, kept current by the setters.
    #[must_use]
    pub const fn info(&self) -> &ModemInfo {
        &self.info
    }

    /// Current serial mode.
    #[must_use]
    pub const fn mode(&self) -> ModemMode {
        self.info.mode
    }

    /// Returns true while the link is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.router.is_some() && self.transport.is_connected()
    }

    /// Takes the channel of received radio frames.
    ///
    /// This can only be called once per [`open`](Self::open).
    pub fn take_packets(&mut self) -> Option<PacketReceiver> {
        self.packets.take()
    }

    /// Opens the link and runs the startup handshake.
    ///
    /// Waits for the ready banner, reads every setting back in command mode
    /// and returns to data mode.
    pub async fn open(&mut self) -> Result<()> {
        self.transport.connect().await?;
        let lines = self.transport.take_lines().ok_or(Error::PortClosed)?;
        self.start_router(lines);

        if let Err(e) = self.handshake().await {
            tracing::error!("modem handshake failed: {}", e);
            let _ = self.close().await;
            return Err(match e {
                Error::ModemInitFailed { .. } => e,
                other => Error::ModemInitFailed {
                    reason: other.to_string(),
                },
            });
        }

        tracing::info!(
            "modem ready: hw {:08X} fw {:08X} channel {} network {:04X} address {}",
            self.info.hardware_version,
            self.info.firmware_version,
            self.info.frequency_channel,
            self.info.sync_word,
            self.info.device_address
        );
        Ok(())
    }

    async fn handshake(&mut self) -> Result<()> {
        let banner = self
            .wait_response(self.ready_timeout, |line| line == READY_BANNER)
            .await;
        if banner.is_err() {
            return Err(Error::ModemInitFailed {
                reason: format!("no {READY_BANNER:?} within {:?}", self.ready_timeout),
            });
        }

        self.enter_command_mode()
            .await
            .map_err(|e| Error::ModemInitFailed {
                reason: format!("unable to enter command mode: {e}"),
            })?;

        self.info.hardware_version = self.query_hex("ATHV?", "hardware version").await?;
        self.info.firmware_version = self.query_hex("ATFV?", "firmware version").await?;
        self.info.frequency_channel = self.query_hex("ATCH?", "frequency channel").await?;
        self.info.sync_word = self.query_hex("ATSW?", "sync word").await?;
        self.info.device_address = self.query_hex("ATDA?", "device address").await?;

        self.enter_data_mode().await
    }

    async fn query_hex<T: TryFrom<u32>>(&mut self, command: &str, what: &str) -> Result<T> {
        let timeout = self.at_timeout;
        let response = self
            .run_at_command(command, timeout)
            .await
            .map_err(|e| Error::ModemInitFailed {
                reason: format!("unable to read {what}: {e}"),
            })?;
        u32::from_str_radix(response.trim(), 16)
            .ok()
            .and_then(|v| T::try_from(v).ok())
            .ok_or_else(|| Error::ModemInitFailed {
                reason: format!("bad {what} {response:?}"),
            })
    }

    /// Stops the router and closes the link.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(router) = self.router.take() {
            router.abort();
        }
        self.responses = None;
        self.packets = None;
        self.transport.disconnect().await
    }

    fn start_router(&mut self, lines: LineReceiver) {
        let (packet_tx, packet_rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);
        let (response_tx, response_rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        self.data_mode.store(true, Ordering::SeqCst);
        self.info.mode = ModemMode::Data;
        self.router = Some(tokio::spawn(Self::route(
            lines,
            Arc::clone(&self.data_mode),
            packet_tx,
            response_tx,
        )));
        self.packets = Some(packet_rx);
        self.responses = Some(response_rx);
    }

    async fn route(
        mut lines: LineReceiver,
        data_mode: Arc<AtomicBool>,
        packet_tx: mpsc::Sender<Result<CcPacket>>,
        response_tx: mpsc::Sender<String>,
    ) {
        while let Some(line) = lines.recv().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!("modem link lost: {}", e);
                    let _ = packet_tx.try_send(Err(e));
                    return;
                }
            };

            if !line.starts_with(char::from(FRAME_START)) {
                tracing::debug!("modem: {}", line);
                if response_tx.try_send(line).is_err() {
                    tracing::warn!("dropping unsolicited modem response");
                }
                continue;
            }

            if !data_mode.load(Ordering::SeqCst) {
                tracing::trace!("dropping radio frame in command mode: {}", line);
                continue;
            }
            match CcPacket::parse(&line) {
                Ok(packet) => {
                    if let Err(mpsc::error::TrySendError::Full(_)) = packet_tx.try_send(Ok(packet))
                    {
                        tracing::warn!("packet queue full, dropping {}", line);
                    }
                }
                Err(e) => tracing::warn!("dropping radio frame {:?}: {}", line, e),
            }
        }
    }

    /// Waits for the next response line accepted by `accept`.
    async fn wait_response(
        &mut self,
        timeout: Duration,
        accept: impl Fn(&str) -> bool,
    ) -> Result<String> {
        let responses = self.responses.as_mut().ok_or(Error::PortClosed)?;
        let wait = async {
            while let Some(line) = responses.recv().await {
                if accept(&line) {
                    return Ok(line);
                }
                tracing::trace!("ignoring modem line {:?}", line);
            }
            Err(Error::ChannelClosed)
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::timeout(timeout))?
    }

    /// Sends `data` and returns the next response line.
    async fn exchange(&mut self, data: Bytes, timeout: Duration) -> Result<String> {
        let responses = self.responses.as_mut().ok_or(Error::PortClosed)?;
        while responses.try_recv().is_ok() {}
        self.transport.send(data).await?;
        self.wait_response(timeout, |_| true).await
    }

    /// Runs an AT command and returns the modem's answer.
    ///
    /// The terminator is appended here. Radio frames arriving meanwhile are
    /// not taken for the answer.
    pub async fn run_at_command(&mut self, command: &str, timeout: Duration) -> Result<String> {
        tracing::debug!("AT command: {}", command);
        self.exchange(encode_frame(command.as_bytes()), timeout)
            .await
    }

    /// Runs an AT command that must be answered with `OK`.
    async fn run_expect_ok(&mut self, command: &str) -> Result<()> {
        let timeout = self.at_timeout;
        let response = self.run_at_command(command, timeout).await?;
        if response.starts_with("OK") {
            Ok(())
        } else {
            Err(Error::AtRejected {
                command: command.to_owned(),
                response,
            })
        }
    }

    /// Switches to command mode. Does nothing if already there.
    pub async fn enter_command_mode(&mut self) -> Result<()> {
        if self.info.mode == ModemMode::Command {
            return Ok(());
        }
        let response = self
            .exchange(Bytes::from_static(COMMAND_ESCAPE), COMMAND_MODE_TIMEOUT)
            .await?;
        if !response.starts_with("OK") {
            return Err(Error::AtRejected {
                command: String::from("+++"),
                response,
            });
        }
        self.set_mode(ModemMode::Command);
        Ok(())
    }

    /// Switches to data mode. Does nothing if already there.
    pub async fn enter_data_mode(&mut self) -> Result<()> {
        if self.info.mode == ModemMode::Data {
            return Ok(());
        }
        self.run_expect_ok("ATO").await?;
        self.set_mode(ModemMode::Data);
        Ok(())
    }

    /// Restarts the modem. It comes back in data mode.
    pub async fn reset(&mut self) -> Result<()> {
        self.enter_command_mode().await?;
        self.run_expect_ok("ATZ").await?;
        self.set_mode(ModemMode::Data);
        Ok(())
    }

    fn set_mode(&mut self, mode: ModemMode) {
        self.info.mode = mode;
        self.data_mode
            .store(mode == ModemMode::Data, Ordering::SeqCst);
    }

    fn check_width(field: &'static str, value: u32, width: usize) -> Result<()> {
        if u64::from(value) >> (8 * width) != 0 {
            return Err(Error::InvalidFieldWidth {
                field,
                value,
                width,
            });
        }
        Ok(())
    }

    /// Sets the radio frequency channel (1 byte).
    ///
    /// Leaves the modem in command mode.
    pub async fn set_frequency_channel(&mut self, value: u32) -> Result<()> {
        Self::check_width("frequency channel", value, 1)?;
        self.enter_command_mode().await?;
        self.run_expect_ok(&format!("ATCH={value:02X}")).await?;
        self.info.frequency_channel = value as u8;
        Ok(())
    }

    /// Sets the radio sync word (2 bytes).
    ///
    /// Leaves the modem in command mode.
    pub async fn set_sync_word(&mut self, value: u32) -> Result<()> {
        Self::check_width("sync word", value, 2)?;
        self.enter_command_mode().await?;
        self.run_expect_ok(&format!("ATSW={value:04X}")).await?;
        self.info.sync_word = value as u16;
        Ok(())
    }

    /// Sets the gateway address (1 byte).
    ///
    /// Leaves the modem in command mode.
    pub async fn set_device_address(&mut self, value: u32) -> Result<()> {
        Self::check_width("device address", value, 1)?;
        self.enter_command_mode().await?;
        self.run_expect_ok(&format!("ATDA={value:02X}")).await?;
        self.info.device_address = value as u8;
        Ok(())
    }

    /// Transmits a SWAP packet from the gateway's current address.
    pub async fn send_packet(&mut self, mut packet: SwapPacket) -> Result<()> {
        if self.info.mode != ModemMode::Data {
            tracing::warn!("sending packet while modem is in command mode");
        }
        packet.src_address = self.info.device_address;
        let frame = packet.to_cc_packet();
        tracing::debug!(
            "tx {:?} to {} reg {}.{}",
            packet.function,
            packet.dest_address,
            packet.reg_address,
            packet.reg_id
        );
        self.transport
            .send(encode_frame(frame.to_hex().as_bytes()))
            .await
    }
}

impl Drop for Modem {
    fn drop(&mut self) {
        if let Some(router) = self.router.take() {
            router.abort();
        }
    }
}
