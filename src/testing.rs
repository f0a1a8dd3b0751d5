//! In-memory modem used by the unit tests.
//!
//! Speaks the AT dialect in command mode and records the hex frames written
//! in data mode. A responder closure can answer data frames the way motes
//! would.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{Mutex, Notify, mpsc};

use crate::error::{Error, Result};
use crate::protocol::{CcPacket, Function, SwapPacket};
use crate::transport::{LineReceiver, SerialTransport, Transport};

/// Produces the radio frames motes send back for a frame the gateway sent.
pub(crate) type Responder = Box<dyn FnMut(&SwapPacket) -> Vec<SwapPacket> + Send>;

pub(crate) struct FakeModemOptions {
    /// Print the ready banner on start.
    pub banner: bool,
    /// AT commands left unanswered.
    pub mute: Vec<&'static str>,
    /// Answer every set command with `ERROR`.
    pub reject_sets: bool,
    pub channel: u8,
    pub sync_word: u16,
    pub address: u8,
    pub responder: Option<Responder>,
}

impl Default for FakeModemOptions {
    fn default() -> Self {
        Self {
            banner: true,
            mute: Vec::new(),
            reject_sets: false,
            channel: 0,
            sync_word: 0xB547,
            address: 1,
            responder: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeState {
    pub command_mode: bool,
    pub channel: u8,
    pub sync_word: u16,
    pub address: u8,
    pub commands: Vec<String>,
    pub data_lines: Vec<String>,
}

pub(crate) struct FakeModem {
    state: Arc<StdMutex<FakeState>>,
    inject_tx: mpsc::UnboundedSender<String>,
    sent: Mutex<mpsc::UnboundedReceiver<SwapPacket>>,
    hangup: Arc<Notify>,
}

/// Status a mote sends to acknowledge `packet`.
pub(crate) fn ack(packet: &SwapPacket) -> SwapPacket {
    let value = packet.value.clone().unwrap_or_default();
    let mut status = SwapPacket::status(packet.reg_address, packet.reg_id, value);
    status.src_address = packet.reg_address;
    status
}

/// Status reported by the mote at `address`.
pub(crate) fn status_from(address: u8, reg_id: u8, value: &[u8]) -> SwapPacket {
    let mut status = SwapPacket::status(address, reg_id, value.into());
    status.src_address = address;
    status
}

impl FakeModem {
    /// Starts the fake and returns a transport attached to it.
    pub fn spawn(options: FakeModemOptions) -> (SerialTransport, Self) {
        let (device, host) = tokio::io::duplex(4096);
        let mut transport = SerialTransport::with_port("fake");
        transport.attach(host);

        let state = Arc::new(StdMutex::new(FakeState {
            command_mode: false,
            channel: options.channel,
            sync_word: options.sync_word,
            address: options.address,
            ..FakeState::default()
        }));
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let hangup = Arc::new(Notify::new());
        tokio::spawn(run(
            device,
            options,
            Arc::clone(&state),
            inject_rx,
            sent_tx,
            Arc::clone(&hangup),
        ));

        (
            transport,
            Self {
                state,
                inject_tx,
                sent: Mutex::new(sent_rx),
                hangup,
            },
        )
    }

    pub fn state(&self) -> FakeState {
        self.state.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state().commands
    }

    pub fn data_lines(&self) -> Vec<String> {
        self.state().data_lines
    }

    /// Packets written in data mode, decoded.
    pub fn sent_packets(&self) -> Vec<SwapPacket> {
        self.data_lines().iter().map(|l| decode_sent(l)).collect()
    }

    /// Writes a raw line to the host.
    pub fn inject_line(&self, line: &str) {
        self.inject_tx.send(line.to_owned()).unwrap();
    }

    /// Writes a received radio frame to the host.
    pub fn inject(&self, packet: &SwapPacket) {
        let mut frame = packet.to_cc_packet();
        frame.rssi = 0x2A;
        frame.lqi = 0x30;
        self.inject_line(&frame.to_wire());
    }

    /// Drops the device end of the link, as an unplugged modem would.
    pub fn hang_up(&self) {
        self.hangup.notify_one();
    }

    /// Waits for the next packet written in data mode.
    pub async fn wait_data_line(&self) -> SwapPacket {
        let mut sent = self.sent.lock().await;
        tokio::time::timeout(Duration::from_secs(2), sent.recv())
            .await
            .expect("no packet sent")
            .expect("fake modem stopped")
    }
}

fn decode_sent(line: &str) -> SwapPacket {
    let frame = CcPacket::new(hex::decode(line).unwrap());
    SwapPacket::decode(&frame).unwrap()
}

async fn run(
    mut device: DuplexStream,
    mut options: FakeModemOptions,
    state: Arc<StdMutex<FakeState>>,
    mut inject_rx: mpsc::UnboundedReceiver<String>,
    sent_tx: mpsc::UnboundedSender<SwapPacket>,
    hangup: Arc<Notify>,
) {
    if options.banner && device.write_all(b"Modem ready!\r\n").await.is_err() {
        return;
    }

    let mut pending = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        tokio::select! {
            biased;
            Some(line) = inject_rx.recv() => {
                if device.write_all(format!("{line}\r").as_bytes()).await.is_err() {
                    return;
                }
            }
            () = hangup.notified() => return,
            read = device.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                pending.extend_from_slice(&buf[..n]);
                for line in take_lines(&mut pending) {
                    let replies = handle(&line, &mut options, &state, &sent_tx);
                    for reply in replies {
                        if device.write_all(format!("{reply}\r").as_bytes()).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn take_lines(pending: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        if pending.starts_with(b"+++") {
            pending.drain(..3);
            lines.push(String::from("+++"));
        } else if let Some(pos) = pending.iter().position(|&b| b == b'\r') {
            let line = String::from_utf8_lossy(&pending[..pos]).into_owned();
            pending.drain(..=pos);
            lines.push(line);
        } else {
            return lines;
        }
    }
}

fn handle(
    line: &str,
    options: &mut FakeModemOptions,
    state: &Arc<StdMutex<FakeState>>,
    sent_tx: &mpsc::UnboundedSender<SwapPacket>,
) -> Vec<String> {
    let mut st = state.lock().unwrap();

    if !st.command_mode && line != "+++" {
        st.data_lines.push(line.to_owned());
        drop(st);
        let packet = decode_sent(line);
        let _ = sent_tx.send(packet.clone());
        return match options.responder.as_mut() {
            Some(responder) => responder(&packet)
                .iter()
                .map(|p| p.to_cc_packet().to_wire())
                .collect(),
            None => Vec::new(),
        };
    }

    st.commands.push(line.to_owned());
    if options.mute.iter().any(|m| *m == line) {
        return Vec::new();
    }

    let reply = match line {
        "+++" => {
            st.command_mode = true;
            return vec![String::from("OK-Command mode")];
        }
        "ATO" => {
            st.command_mode = false;
            return vec![String::from("OK-Data mode")];
        }
        "ATZ" => {
            st.command_mode = false;
            return vec![String::from("OK"), String::from("Modem ready!")];
        }
        "ATHV?" => String::from("0100"),
        "ATFV?" => String::from("00010203"),
        "ATCH?" => format!("{:02X}", st.channel),
        "ATSW?" => format!("{:04X}", st.sync_word),
        "ATDA?" => format!("{:02X}", st.address),
        set if set.len() > 5 && &set[4..5] == "=" => {
            if options.reject_sets {
                String::from("ERROR")
            } else {
                let arg = &set[5..];
                match &set[..4] {
                    "ATCH" => st.channel = u8::from_str_radix(arg, 16).unwrap(),
                    "ATSW" => st.sync_word = u16::from_str_radix(arg, 16).unwrap(),
                    "ATDA" => st.address = u8::from_str_radix(arg, 16).unwrap(),
                    _ => return vec![String::from("ERROR")],
                }
                String::from("OK")
            }
        }
        _ => String::from("ERROR"),
    };
    vec![reply]
}

/// Responder acknowledging every command from the `n`th one on.
pub(crate) fn ack_from(n: usize) -> Responder {
    let mut commands = 0;
    Box::new(move |packet| {
        if packet.function != Function::Command {
            return Vec::new();
        }
        commands += 1;
        if commands >= n {
            vec![ack(packet)]
        } else {
            Vec::new()
        }
    })
}

/// Transport that plugs a fresh [`FakeModem`] in on every connect.
#[derive(Default)]
pub(crate) struct FakeLink {
    current: Option<SerialTransport>,
    modems: Arc<StdMutex<Vec<Arc<FakeModem>>>>,
}

impl FakeLink {
    /// Fake modems in connection order.
    pub fn modems(&self) -> Arc<StdMutex<Vec<Arc<FakeModem>>>> {
        Arc::clone(&self.modems)
    }
}

impl Transport for FakeLink {
    fn connect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.current.is_none() {
                let (transport, fake) = FakeModem::spawn(FakeModemOptions::default());
                self.modems.lock().unwrap().push(Arc::new(fake));
                self.current = Some(transport);
            }
            Ok(())
        })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Some(mut transport) = self.current.take() {
                transport.disconnect().await?;
            }
            Ok(())
        })
    }

    fn send(&mut self, data: Bytes) -> BoxFuture<'_, Result<()>> {
        match self.current.as_mut() {
            Some(transport) => transport.send(data),
            None => Box::pin(async { Err(Error::PortClosed) }),
        }
    }

    fn is_connected(&self) -> bool {
        self.current.as_ref().is_some_and(Transport::is_connected)
    }

    fn take_lines(&mut self) -> Option<LineReceiver> {
        self.current.as_mut().and_then(Transport::take_lines)
    }
}
