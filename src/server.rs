//! SWAP server: discovers motes, tracks their registers and exchanges
//! commands and queries with them.
//!
//! The server owns the [`Modem`]. A dispatch task consumes the radio frames
//! the modem receives, keeps the [`Network`] current and notifies the
//! [`EventHandler`]. Commands and queries wait for their answer through a
//! single expectation slot filled by the dispatch task; callers are
//! serialized so at most one request is outstanding.

use std::path::Path;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, RwLock, oneshot};
use tokio::task::JoinHandle;

use crate::config::{ServerConfig, Settings};
use crate::error::{Error, Result};
use crate::event::EventHandler;
use crate::modem::{Modem, ModemInfo, PacketReceiver};
use crate::protocol::{BROADCAST_ADDRESS, Function, SwapPacket, SystemState, register_id};
use crate::types::{DeviceLibrary, Mote, Network, RegisterKind, Value};

/// Lifecycle of a [`Server`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ServerState {
    /// Not connected.
    #[default]
    Stopped,
    /// Modem handshake and configuration in progress.
    Starting,
    /// Dispatching packets.
    Running,
    /// Shutting down.
    Stopping,
}

/// The single outstanding request.
struct Expectation {
    reg_address: u8,
    reg_id: u8,
    /// Exact value an acknowledgement must carry. `None` for queries.
    value: Option<Value>,
    reply: oneshot::Sender<Value>,
}

impl Expectation {
    fn matches(&self, packet: &SwapPacket) -> bool {
        packet.reg_address == self.reg_address
            && packet.reg_id == self.reg_id
            && self
                .value
                .as_ref()
                .is_none_or(|expected| packet.value.as_ref() == Some(expected))
    }
}

/// State shared between the server handle and its dispatch task.
struct ServerInner {
    network: RwLock<Network>,
    library: DeviceLibrary,
    handler: Arc<dyn EventHandler>,
    expectation: Mutex<Option<Expectation>>,
    gateway_address: AtomicU8,
    state: RwLock<ServerState>,
    network_file: Option<std::path::PathBuf>,
    save_generation: AtomicU64,
    saved_generation: Arc<StdMutex<u64>>,
}

impl ServerInner {
    /// Handles one received packet. Returns the reply to transmit, if any.
    async fn handle_packet(&self, packet: &SwapPacket) -> Option<SwapPacket> {
        tracing::debug!(
            "rx {:?} from {} reg {}.{} value {:?}",
            packet.function,
            packet.src_address,
            packet.reg_address,
            packet.reg_id,
            packet.value
        );
        match packet.function {
            Function::Status => {
                self.handle_status(packet).await;
                None
            }
            Function::Query => self.handle_query(packet).await,
            Function::Command => None,
        }
    }

    async fn handle_status(&self, packet: &SwapPacket) {
        let Some(value) = packet.value.clone() else {
            return;
        };
        // Held across the expectation check so a released caller reads the
        // updated network
        let mut network = self.network.write().await;
        self.check_expectation(packet).await;

        if let Some(mote) = network.get_mut(packet.src_address) {
            mote.security = packet.security;
            mote.nonce = packet.nonce;
            mote.touch();
        }

        match packet.reg_id {
            register_id::PRODUCT_CODE => self.on_product_code(&mut network, packet, &value),
            register_id::DEVICE_ADDR => self.on_address(&mut network, packet.src_address, &value),
            register_id::SYSTEM_STATE => self.on_state(&mut network, packet.reg_address, &value),
            register_id::TX_INTERVAL => {
                if let Some(mote) = network.get_mut(packet.reg_address) {
                    mote.tx_interval = Some(value.to_integer());
                }
            }
            reg_id => self.on_register(&mut network, packet.reg_address, reg_id, value),
        }
    }

    async fn check_expectation(&self, packet: &SwapPacket) {
        let mut slot = self.expectation.lock().await;
        if slot.as_ref().is_some_and(|e| e.matches(packet)) {
            if let (Some(expectation), Some(value)) = (slot.take(), packet.value.clone()) {
                let _ = expectation.reply.send(value);
            }
        }
    }

    fn on_product_code(&self, network: &mut Network, packet: &SwapPacket, code: &Value) {
        let address = packet.src_address;
        if network.contains(address) {
            return;
        }

        let (manufacturer_id, product_id) = Mote::split_product_code(code);
        let mut mote = match self.library.instantiate(address, manufacturer_id, product_id) {
            Ok(mote) => mote,
            Err(e) => {
                tracing::warn!("bad definition for mote {}: {}", address, e);
                Mote::new(address, manufacturer_id, product_id)
            }
        };
        mote.security = packet.security;
        mote.nonce = packet.nonce;
        mote.touch();

        tracing::info!(
            "new mote {} ({:08X}:{:08X})",
            address,
            manufacturer_id,
            product_id
        );
        if mote.is_unconfigured() {
            tracing::info!("mote {} is waiting for an address", address);
        }
        self.handler.new_mote_detected(&mote);
        for endpoint in mote.endpoints() {
            self.handler.new_endpoint_detected(address, endpoint);
        }
        for parameter in mote.config_parameters() {
            self.handler.new_parameter_detected(address, parameter);
        }
        network.add_or_update(mote);
        self.persist(network);
    }

    fn on_address(&self, network: &mut Network, old_address: u8, value: &Value) {
        let Ok(new_address) = u8::try_from(value.to_integer()) else {
            tracing::warn!("mote {} reported invalid address {}", old_address, value);
            return;
        };
        if new_address == old_address {
            return;
        }
        match network.change_address(old_address, new_address) {
            Ok(true) => {
                tracing::info!("mote {} moved to address {}", old_address, new_address);
                if let Some(mote) = network.get(new_address) {
                    self.handler.mote_address_changed(mote, old_address);
                }
                self.persist(network);
            }
            Ok(false) => tracing::debug!("address change of unknown mote {}", old_address),
            Err(e) => tracing::warn!("cannot move mote {}: {}", old_address, e),
        }
    }

    fn on_state(&self, network: &mut Network, address: u8, value: &Value) {
        let Some(mote) = network.get_mut(address) else {
            return;
        };
        let state = SystemState::from(value.as_bytes().first().copied().unwrap_or_default());
        if mote.state != state {
            tracing::info!("mote {} is now {}", address, state);
            mote.state = state;
            self.handler.mote_state_changed(mote);
        }
    }

    fn on_register(&self, network: &mut Network, address: u8, reg_id: u8, value: Value) {
        let Some(register) = network
            .get_mut(address)
            .and_then(|mote| mote.register_mut(reg_id))
        else {
            if !register_id::is_standard(reg_id) {
                tracing::debug!("status of undefined register {} on mote {}", reg_id, address);
            }
            return;
        };
        if register.value() == &value {
            return;
        }
        if let Err(e) = register.set_value(value) {
            tracing::warn!("mote {} register {}: {}", address, reg_id, e);
            return;
        }

        self.handler.register_value_changed(address, register);
        for parameter in register.changed_parameters() {
            match register.kind {
                RegisterKind::Regular => self.handler.endpoint_value_changed(address, parameter),
                RegisterKind::Config => self.handler.parameter_value_changed(address, parameter),
            }
        }
    }

    async fn handle_query(&self, packet: &SwapPacket) -> Option<SwapPacket> {
        if packet.dest_address != self.gateway_address.load(Ordering::SeqCst) {
            return None;
        }
        let network = self.network.read().await;
        let register = network.get(packet.reg_address)?.register(packet.reg_id)?;
        Some(SwapPacket::status(
            packet.reg_address,
            packet.reg_id,
            register.value().clone(),
        ))
    }

    /// Writes a snapshot of `network` to the network file in the background.
    fn persist(&self, network: &Network) {
        let Some(path) = self.network_file.clone() else {
            return;
        };
        let snapshot = network.clone();
        let generation = self.save_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let saved = Arc::clone(&self.saved_generation);
        tokio::task::spawn_blocking(move || {
            let Ok(mut saved) = saved.lock() else {
                return;
            };
            // A newer snapshot already landed
            if *saved > generation {
                return;
            }
            match snapshot.save(&path) {
                Ok(()) => *saved = generation,
                Err(e) => tracing::warn!("unable to save network to {}: {}", path.display(), e),
            }
        });
    }
}

/// SWAP protocol server.
pub struct Server {
    config: ServerConfig,
    modem: Arc<Mutex<Modem>>,
    inner: Arc<ServerInner>,
    requests: Mutex<()>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Creates a server for the modem on the configured serial port.
    ///
    /// Known motes are read from the network file, if one is configured.
    pub fn new(
        config: ServerConfig,
        library: DeviceLibrary,
        handler: impl EventHandler + 'static,
    ) -> Result<Self> {
        let modem = Modem::serial(config.serial.clone());
        Self::with_modem(config, modem, library, handler)
    }

    /// Creates a server from a settings file's content, loading the device
    /// library it names.
    pub fn from_settings(settings: Settings, handler: impl EventHandler + 'static) -> Result<Self> {
        let library = match &settings.devices_file {
            Some(path) => DeviceLibrary::load(path)?,
            None => DeviceLibrary::new(),
        };
        Self::new(settings.server, library, handler)
    }

    /// Creates a server driving an existing modem session.
    pub fn with_modem(
        config: ServerConfig,
        modem: Modem,
        library: DeviceLibrary,
        handler: impl EventHandler + 'static,
    ) -> Result<Self> {
        let network = match &config.network_file {
            Some(path) => Network::load_or_default(path)?,
            None => Network::new(),
        };
        let inner = ServerInner {
            network: RwLock::new(network),
            library,
            handler: Arc::new(handler),
            expectation: Mutex::new(None),
            gateway_address: AtomicU8::new(0),
            state: RwLock::new(ServerState::Stopped),
            network_file: config.network_file.clone(),
            save_generation: AtomicU64::new(0),
            saved_generation: Arc::default(),
        };
        Ok(Self {
            config,
            modem: Arc::new(Mutex::new(modem)),
            inner: Arc::new(inner),
            requests: Mutex::new(()),
            dispatch_task: Mutex::new(None),
        })
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ServerState {
        *self.inner.state.read().await
    }

    /// Returns true while packets are dispatched.
    pub async fn is_running(&self) -> bool {
        self.state().await == ServerState::Running
    }

    /// Snapshot of the known motes.
    pub async fn network(&self) -> Network {
        self.inner.network.read().await.clone()
    }

    /// Snapshot of one mote.
    pub async fn mote(&self, address: u8) -> Option<Mote> {
        self.inner.network.read().await.get(address).cloned()
    }

    /// Settings of the modem.
    pub async fn modem_info(&self) -> ModemInfo {
        self.modem.lock().await.info().clone()
    }

    /// Opens the modem, applies the network configuration and starts
    /// discovery.
    ///
    /// Does nothing unless the server is stopped. On failure the modem is
    /// closed and the server stays stopped.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.write().await;
            if *state != ServerState::Stopped {
                return Ok(());
            }
            *state = ServerState::Starting;
        }
        tracing::info!("starting SWAP server");

        let packets = match self.bring_up().await {
            Ok(packets) => packets,
            Err(e) => {
                tracing::error!("server start failed: {}", e);
                let _ = self.modem.lock().await.close().await;
                *self.inner.state.write().await = ServerState::Stopped;
                return Err(e);
            }
        };

        let task = tokio::spawn(run_dispatch(
            Arc::clone(&self.inner),
            Arc::clone(&self.modem),
            packets,
        ));
        *self.dispatch_task.lock().await = Some(task);
        *self.inner.state.write().await = ServerState::Running;
        self.inner.handler.server_started();

        tracing::info!("SWAP server running, discovering motes");
        let discovery = SwapPacket::query(BROADCAST_ADDRESS, register_id::PRODUCT_CODE);
        if let Err(e) = self.send(discovery).await {
            let _ = self.stop().await;
            return Err(e);
        }
        Ok(())
    }

    async fn bring_up(&self) -> Result<PacketReceiver> {
        let mut modem = self.modem.lock().await;
        modem.open().await?;
        self.sync_network_config(&mut modem).await?;
        self.inner
            .gateway_address
            .store(modem.info().device_address, Ordering::SeqCst);
        modem.take_packets().ok_or(Error::PortClosed)
    }

    /// Pushes every configured radio setting the modem does not have yet.
    async fn sync_network_config(&self, modem: &mut Modem) -> Result<()> {
        let desired = self.config.network;
        let current = modem.info().clone();
        let mut changed = false;

        if let Some(address) = desired.device_address.filter(|a| *a != current.device_address) {
            modem
                .set_device_address(address.into())
                .await
                .map_err(|e| config_sync_failed("device address", e))?;
            changed = true;
        }
        if let Some(id) = desired.network_id.filter(|id| *id != current.sync_word) {
            modem
                .set_sync_word(id.into())
                .await
                .map_err(|e| config_sync_failed("network id", e))?;
            changed = true;
        }
        if let Some(channel) = desired
            .frequency_channel
            .filter(|c| *c != current.frequency_channel)
        {
            modem
                .set_frequency_channel(channel.into())
                .await
                .map_err(|e| config_sync_failed("frequency channel", e))?;
            changed = true;
        }

        if changed {
            modem.enter_data_mode().await?;
        }
        Ok(())
    }

    /// Stops dispatching and closes the modem.
    ///
    /// A request waiting for its answer fails with [`Error::NotRunning`].
    pub async fn stop(&self) -> Result<()> {
        *self.inner.state.write().await = ServerState::Stopping;
        tracing::info!("stopping SWAP server");

        if let Some(task) = self.dispatch_task.lock().await.take() {
            task.abort();
        }
        self.inner.expectation.lock().await.take();
        let result = self.modem.lock().await.close().await;

        *self.inner.state.write().await = ServerState::Stopped;
        result
    }

    async fn ensure_running(&self) -> Result<()> {
        if self.is_running().await {
            Ok(())
        } else {
            Err(Error::NotRunning)
        }
    }

    async fn send(&self, packet: SwapPacket) -> Result<()> {
        self.modem.lock().await.send_packet(packet).await
    }

    /// Sends `packet` until a matching status arrives or the attempts run
    /// out. Returns the status value, `None` after the last attempt.
    async fn transact(&self, packet: SwapPacket, ack_value: Option<Value>) -> Result<Option<Value>> {
        let tries = self.config.max_tries.max(1);
        let timeout = self.config.ack_timeout;

        for attempt in 1..=tries {
            let (reply_tx, reply_rx) = oneshot::channel();
            *self.inner.expectation.lock().await = Some(Expectation {
                reg_address: packet.reg_address,
                reg_id: packet.reg_id,
                value: ack_value.clone(),
                reply: reply_tx,
            });

            if let Err(e) = self.send(packet.clone()).await {
                self.inner.expectation.lock().await.take();
                return Err(e);
            }

            match tokio::time::timeout(timeout, reply_rx).await {
                Ok(Ok(value)) => return Ok(Some(value)),
                Ok(Err(_)) => return Err(Error::NotRunning),
                Err(_) => tracing::debug!(
                    "no answer from mote {} reg {} (attempt {}/{})",
                    packet.reg_address,
                    packet.reg_id,
                    attempt,
                    tries
                ),
            }
        }

        self.inner.expectation.lock().await.take();
        Ok(None)
    }

    /// Commands a register value and waits for the mote to acknowledge it.
    ///
    /// The acknowledgement is a status of the same register carrying exactly
    /// `value`.
    pub async fn set_register(&self, address: u8, reg_id: u8, value: Value) -> Result<()> {
        self.ensure_running().await?;
        let _request = self.requests.lock().await;

        let nonce = self
            .inner
            .network
            .read()
            .await
            .get(address)
            .map_or(0, |mote| mote.nonce);
        let command = SwapPacket::command(address, reg_id, value.clone(), nonce);

        match self.transact(command, Some(value)).await? {
            Some(_) => Ok(()),
            None => Err(Error::NoAcknowledgement {
                attempts: self.config.max_tries.max(1),
            }),
        }
    }

    /// Queries a register and returns the value the mote reports.
    pub async fn query_register(&self, address: u8, reg_id: u8) -> Result<Value> {
        self.ensure_running().await?;
        let _request = self.requests.lock().await;

        match self.transact(SwapPacket::query(address, reg_id), None).await? {
            Some(value) => Ok(value),
            None => Err(Error::NoResponse {
                attempts: self.config.max_tries.max(1),
            }),
        }
    }

    /// Sets one endpoint or parameter from text and commands the resulting
    /// register value.
    pub async fn set_endpoint_value(
        &self,
        address: u8,
        reg_id: u8,
        name: &str,
        text: &str,
    ) -> Result<()> {
        let value = {
            let network = self.inner.network.read().await;
            let mote = network
                .get(address)
                .ok_or(Error::UnknownMote { address })?;
            let register = mote.register(reg_id).ok_or(Error::UnknownRegister {
                address,
                register: reg_id,
            })?;
            register.value_with_parameter(name, text)?
        };
        self.set_register(address, reg_id, value).await
    }

    /// Gives a mote a new address.
    pub async fn set_mote_address(&self, address: u8, new_address: u8) -> Result<()> {
        let value = Value::from_integer(new_address.into(), 1);
        self.set_register(address, register_id::DEVICE_ADDR, value)
            .await
    }

    /// Moves a mote to another network id.
    pub async fn set_mote_network_id(&self, address: u8, network_id: u16) -> Result<()> {
        let value = Value::from_integer(network_id.into(), 2);
        self.set_register(address, register_id::NETWORK_ID, value)
            .await
    }

    /// Moves a mote to another frequency channel.
    pub async fn set_mote_channel(&self, address: u8, channel: u8) -> Result<()> {
        let value = Value::from_integer(channel.into(), 1);
        self.set_register(address, register_id::FREQ_CHANNEL, value)
            .await
    }

    /// Changes a mote's security option.
    pub async fn set_mote_security(&self, address: u8, security: u8) -> Result<()> {
        let value = Value::from_integer(security.into(), 1);
        self.set_register(address, register_id::SECU_OPTION, value)
            .await
    }

    /// Restarts a mote.
    pub async fn restart_mote(&self, address: u8) -> Result<()> {
        self.set_system_state(address, SystemState::Restart).await
    }

    /// Takes a mote out of sync mode.
    pub async fn leave_sync(&self, address: u8) -> Result<()> {
        self.set_system_state(address, SystemState::RxOn).await
    }

    async fn set_system_state(&self, address: u8, state: SystemState) -> Result<()> {
        let value = Value::from_integer(u8::from(state).into(), 1);
        self.set_register(address, register_id::SYSTEM_STATE, value)
            .await
    }

    /// Discards the in-memory network and reloads the network file.
    pub async fn reset_network(&self) -> Result<()> {
        let network = match &self.inner.network_file {
            Some(path) => Network::load_or_default(path)?,
            None => Network::new(),
        };
        *self.inner.network.write().await = network;
        Ok(())
    }

    /// Writes the network to `path`.
    pub async fn save_network(&self, path: impl AsRef<Path>) -> Result<()> {
        self.inner.network.read().await.save(path)
    }
}

fn config_sync_failed(field: &'static str, source: Error) -> Error {
    Error::ConfigSyncFailed {
        field,
        source: Box::new(source),
    }
}

/// Decodes and handles received frames until the link goes away.
async fn run_dispatch(inner: Arc<ServerInner>, modem: Arc<Mutex<Modem>>, mut packets: PacketReceiver) {
    while let Some(frame) = packets.recv().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("modem link lost, dispatch stopped: {}", e);
                break;
            }
        };
        let packet = match SwapPacket::decode(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("dropping packet {}: {}", frame.to_wire(), e);
                continue;
            }
        };

        if let Some(reply) = inner.handle_packet(&packet).await {
            if let Err(e) = modem.lock().await.send_packet(reply).await {
                tracing::warn!("unable to answer query: {}", e);
            }
        }
    }

    // Fail any request still waiting and release the dead link so the
    // next start reconnects
    inner.expectation.lock().await.take();
    if let Err(e) = modem.lock().await.close().await {
        tracing::warn!("closing modem after link loss: {}", e);
    }
    let mut state = inner.state.write().await;
    if *state == ServerState::Running {
        *state = ServerState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::event::{Event, EventDispatcher, EventFilter, EventKind, Subscription};
    use crate::testing::{
        FakeLink, FakeModem, FakeModemOptions, Responder, ack_from, status_from,
    };

    const LIBRARY: &str = r#"{ "devices": [ {
        "manufacturer_id": 1, "product_id": 2, "name": "temphum",
        "registers": [ { "id": 11, "name": "sensor", "parameters": [
            { "name": "temperature", "direction": "input", "position": "0", "size": "2" },
            { "name": "humidity", "direction": "input", "position": "2", "size": "2" } ] },
            { "id": 13, "name": "relay", "parameters": [
            { "name": "on", "type": "binary", "direction": "output", "position": "0.7", "size": "0.1" } ] } ],
        "config_registers": [ { "id": 12, "name": "interval", "parameters": [
            { "name": "period", "size": "1", "default": "30" } ] } ]
    } ] }"#;

    const PRODUCT_CODE: [u8; 8] = [0, 0, 0, 1, 0, 0, 0, 2];

    fn library() -> DeviceLibrary {
        serde_json::from_str(LIBRARY).unwrap()
    }

    fn test_config() -> ServerConfig {
        ServerConfig::default()
            .ack_timeout(Duration::from_millis(100))
            .max_tries(3)
    }

    struct Harness {
        server: Arc<Server>,
        fake: FakeModem,
        events: Subscription,
    }

    /// Logs to the test output; `RUST_LOG=panstamp_swap=debug` to see dispatch.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    async fn harness(options: FakeModemOptions, config: ServerConfig) -> Harness {
        init_tracing();
        let (transport, fake) = FakeModem::spawn(options);
        let mut modem = Modem::new(transport, Duration::from_millis(500));
        modem.set_at_timeout(Duration::from_millis(200));
        let dispatcher = EventDispatcher::new(64);
        let events = dispatcher.subscribe();
        let server = Server::with_modem(config, modem, library(), dispatcher).unwrap();
        Harness {
            server: Arc::new(server),
            fake,
            events,
        }
    }

    /// Started server with the discovery query already consumed.
    async fn running(options: FakeModemOptions, config: ServerConfig) -> Harness {
        let mut h = harness(options, config).await;
        h.server.start().await.unwrap();
        let discovery = h.fake.wait_data_line().await;
        assert_eq!(discovery.function, Function::Query);
        next_kind(&mut h.events, EventKind::ServerStarted).await;
        h
    }

    fn with_responder(responder: Responder) -> FakeModemOptions {
        FakeModemOptions {
            responder: Some(responder),
            ..FakeModemOptions::default()
        }
    }

    async fn next_kind(events: &mut Subscription, kind: EventKind) -> Event {
        let filter = EventFilter::kinds(vec![kind]);
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = events.recv().await.unwrap();
                if filter.matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not raised")
    }

    async fn drain(events: &mut Subscription) -> Vec<Event> {
        let mut drained = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), events.recv()).await
        {
            drained.push(event);
        }
        drained
    }

    async fn discover(h: &mut Harness, address: u8) {
        h.fake.inject(&status_from(address, 0, &PRODUCT_CODE));
        next_kind(&mut h.events, EventKind::NewMote).await;
    }

    #[tokio::test]
    async fn test_start_sends_discovery() {
        let h = running(FakeModemOptions::default(), test_config()).await;
        assert_eq!(h.server.state().await, ServerState::Running);
        let discovery = &h.fake.sent_packets()[0];
        assert_eq!(discovery.dest_address, BROADCAST_ADDRESS);
        assert_eq!(discovery.reg_address, 0);
        assert_eq!(discovery.reg_id, register_id::PRODUCT_CODE);
        assert_eq!(discovery.src_address, 1);
        assert!(discovery.value.is_none());
        // Modem settings already match, nothing to sync
        assert!(!h.fake.commands().iter().any(|c| c.contains('=')));
    }

    #[tokio::test]
    async fn test_start_syncs_network_config() {
        let config = test_config().network(
            crate::config::NetworkConfig::default()
                .device_address(1)
                .network_id(0x1234)
                .frequency_channel(3),
        );
        let h = running(FakeModemOptions::default(), config).await;

        let commands = h.fake.commands();
        assert!(commands.contains(&"ATSW=1234".to_owned()));
        assert!(commands.contains(&"ATCH=03".to_owned()));
        assert!(!commands.iter().any(|c| c.starts_with("ATDA=")));
        assert_eq!(commands.last().unwrap(), "ATO");

        let info = h.server.modem_info().await;
        assert_eq!((info.sync_word, info.frequency_channel), (0x1234, 3));
        assert_eq!(h.fake.state().sync_word, 0x1234);
    }

    #[tokio::test]
    async fn test_start_fails_when_config_rejected() {
        let config = test_config().network(crate::config::NetworkConfig::default().network_id(7));
        let h = harness(
            FakeModemOptions {
                reject_sets: true,
                ..FakeModemOptions::default()
            },
            config,
        )
        .await;

        let err = h.server.start().await.unwrap_err();
        assert!(matches!(
            err,
            Error::ConfigSyncFailed {
                field: "network id",
                ..
            }
        ));
        assert_eq!(h.server.state().await, ServerState::Stopped);
        assert!(matches!(
            h.server.set_register(5, 11, Value::from_integer(1, 1)).await,
            Err(Error::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_start_fails_without_modem() {
        let h = harness(
            FakeModemOptions {
                banner: false,
                ..FakeModemOptions::default()
            },
            test_config(),
        )
        .await;
        assert!(matches!(
            h.server.start().await,
            Err(Error::ModemInitFailed { .. })
        ));
        assert_eq!(h.server.state().await, ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_product_code_creates_mote() {
        let mut h = running(FakeModemOptions::default(), test_config()).await;
        let mut status = status_from(1, 0, &[1, 2, 3, 4]);
        status.nonce = 9;
        h.fake.inject(&status);

        let Event::NewMote(mote) = next_kind(&mut h.events, EventKind::NewMote).await else {
            unreachable!()
        };
        assert_eq!(mote.address, 1);
        assert_eq!(mote.manufacturer_id, 0x0102_0304);
        assert_eq!(mote.product_id, 0);
        assert_eq!(mote.nonce, 9);
        assert!(mote.regular_registers.is_empty());
        assert_eq!(h.server.network().await.len(), 1);
    }

    #[tokio::test]
    async fn test_discovery_is_idempotent() {
        let mut h = running(FakeModemOptions::default(), test_config()).await;
        discover(&mut h, 5).await;
        let events = drain(&mut h.events).await;
        let endpoints = events
            .iter()
            .filter(|e| e.kind() == EventKind::NewEndpoint)
            .count();
        let parameters = events
            .iter()
            .filter(|e| e.kind() == EventKind::NewParameter)
            .count();
        assert_eq!((endpoints, parameters), (3, 1));

        let mut again = status_from(5, 0, &PRODUCT_CODE);
        again.nonce = 4;
        again.security = 1;
        h.fake.inject(&again);
        // Barrier: another mote's discovery, processed after the duplicate
        h.fake.inject(&status_from(6, 0, &[0, 0, 0, 7, 0, 0, 0, 7]));
        let event = next_kind(&mut h.events, EventKind::NewMote).await;
        assert_eq!(event.address(), Some(6));

        let events = drain(&mut h.events).await;
        assert!(events.iter().all(|e| e.kind() != EventKind::NewMote
            && e.kind() != EventKind::NewEndpoint));
        let network = h.server.network().await;
        assert_eq!(network.len(), 2);
        let mote = network.get(5).unwrap();
        assert_eq!((mote.nonce, mote.security), (4, 1));
        assert_eq!(mote.regular_registers.len(), 2);
    }

    #[tokio::test]
    async fn test_state_change_notified_once() {
        let mut h = running(FakeModemOptions::default(), test_config()).await;
        discover(&mut h, 5).await;

        h.fake.inject(&status_from(5, 3, &[3]));
        let event = next_kind(&mut h.events, EventKind::MoteStateChanged).await;
        assert!(EventFilter::state(SystemState::Sync).mote(5).matches(&event));

        h.fake.inject(&status_from(5, 3, &[3]));
        h.fake.inject(&status_from(5, 3, &[2]));
        let event = next_kind(&mut h.events, EventKind::MoteStateChanged).await;
        assert!(EventFilter::state(SystemState::RxOff).matches(&event));
    }

    #[tokio::test]
    async fn test_address_change() {
        let mut h = running(FakeModemOptions::default(), test_config()).await;
        discover(&mut h, 5).await;

        h.fake.inject(&status_from(5, register_id::DEVICE_ADDR, &[8]));
        let event = next_kind(&mut h.events, EventKind::MoteAddressChanged).await;
        assert!(matches!(
            event,
            Event::MoteAddressChanged {
                old_address: 5,
                new_address: 8
            }
        ));

        let network = h.server.network().await;
        assert!(network.get(5).is_none());
        let mote = network.get(8).unwrap();
        assert_eq!(mote.product_id, 2);
        assert_eq!(mote.regular_registers.len(), 2);
    }

    #[tokio::test]
    async fn test_tx_interval_cached_silently() {
        let mut h = running(FakeModemOptions::default(), test_config()).await;
        discover(&mut h, 5).await;
        drain(&mut h.events).await;

        h.fake.inject(&status_from(5, register_id::TX_INTERVAL, &[0x01, 0x2C]));
        h.fake.inject(&status_from(5, 3, &[3]));
        next_kind(&mut h.events, EventKind::MoteStateChanged).await;

        assert_eq!(h.server.mote(5).await.unwrap().tx_interval, Some(300));
    }

    #[tokio::test]
    async fn test_register_update_notifies_changed_endpoints() {
        let mut h = running(FakeModemOptions::default(), test_config()).await;
        discover(&mut h, 5).await;
        drain(&mut h.events).await;

        h.fake.inject(&status_from(5, 11, &[0x00, 0xD7, 0x00, 0x40]));
        let event = next_kind(&mut h.events, EventKind::RegisterChanged).await;
        assert!(matches!(
            event,
            Event::RegisterChanged {
                address: 5,
                register_id: 11,
                ..
            }
        ));
        let changed = drain(&mut h.events).await;
        assert_eq!(changed.len(), 2);
        assert!(changed.iter().all(|e| e.kind() == EventKind::EndpointChanged));

        // Same value again: nothing
        h.fake.inject(&status_from(5, 11, &[0x00, 0xD7, 0x00, 0x40]));
        // Only humidity moves
        h.fake.inject(&status_from(5, 11, &[0x00, 0xD7, 0x00, 0x41]));
        next_kind(&mut h.events, EventKind::RegisterChanged).await;
        let changed = drain(&mut h.events).await;
        assert_eq!(changed.len(), 1);
        let Event::EndpointChanged { endpoint, .. } = &changed[0] else {
            unreachable!()
        };
        assert_eq!(endpoint.name, "humidity");
        assert_eq!(endpoint.value().to_integer(), 0x41);

        let mote = h.server.mote(5).await.unwrap();
        let sensor = mote.register(11).unwrap();
        assert_eq!(sensor.parameter("temperature").unwrap().value().to_integer(), 215);
    }

    #[tokio::test]
    async fn test_config_register_notifies_parameters() {
        let mut h = running(FakeModemOptions::default(), test_config()).await;
        discover(&mut h, 5).await;
        drain(&mut h.events).await;

        h.fake.inject(&status_from(5, 12, &[60]));
        next_kind(&mut h.events, EventKind::RegisterChanged).await;
        let event = next_kind(&mut h.events, EventKind::ParameterChanged).await;
        let Event::ParameterChanged { parameter, .. } = event else {
            unreachable!()
        };
        assert_eq!(parameter.name, "period");
        assert_eq!(parameter.value().to_integer(), 60);
    }

    #[tokio::test]
    async fn test_bad_packets_are_dropped() {
        let mut h = running(FakeModemOptions::default(), test_config()).await;
        discover(&mut h, 5).await;

        h.fake.inject_line("(zz)");
        h.fake.inject_line("(00000102A53C");
        h.fake.inject_line("(0000)0102");
        h.fake.inject_line("(0000)00050000000503");
        h.fake.inject(&status_from(5, 3, &[3]));
        next_kind(&mut h.events, EventKind::MoteStateChanged).await;
        assert!(h.server.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_register_retries_then_fails() {
        let h = running(FakeModemOptions::default(), test_config()).await;

        let result = h.server.set_register(5, 11, Value::from_integer(1, 2)).await;
        assert!(matches!(
            result,
            Err(Error::NoAcknowledgement { attempts: 3 })
        ));
        let commands = h
            .fake
            .sent_packets()
            .into_iter()
            .filter(|p| p.function == Function::Command)
            .count();
        assert_eq!(commands, 3);
    }

    #[tokio::test]
    async fn test_set_register_acknowledged_on_retry() {
        let h = running(with_responder(ack_from(2)), test_config()).await;

        h.server
            .set_register(5, 11, Value::from_integer(0x0102, 2))
            .await
            .unwrap();
        let commands: Vec<_> = h
            .fake
            .sent_packets()
            .into_iter()
            .filter(|p| p.function == Function::Command)
            .collect();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1].value, Some(Value::from_integer(0x0102, 2)));
    }

    #[tokio::test]
    async fn test_set_register_returns_on_first_ack() {
        let config = test_config().ack_timeout(Duration::from_secs(5));
        let h = running(with_responder(ack_from(1)), config).await;

        let started = Instant::now();
        h.server
            .set_register(5, 11, Value::from_integer(7, 1))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_with_other_value_ignored() {
        let responder: Responder = Box::new(|packet| {
            if packet.function == Function::Command {
                vec![status_from(packet.reg_address, packet.reg_id, &[0xEE])]
            } else {
                Vec::new()
            }
        });
        let config = test_config().max_tries(2);
        let h = running(with_responder(responder), config).await;

        assert!(matches!(
            h.server.set_register(5, 11, Value::from_integer(1, 1)).await,
            Err(Error::NoAcknowledgement { attempts: 2 })
        ));
    }

    #[tokio::test]
    async fn test_command_uses_mote_nonce() {
        let mut h = running(with_responder(ack_from(1)), test_config()).await;
        let mut status = status_from(5, 0, &PRODUCT_CODE);
        status.nonce = 0x21;
        h.fake.inject(&status);
        next_kind(&mut h.events, EventKind::NewMote).await;

        h.server.leave_sync(5).await.unwrap();
        let command = h
            .fake
            .sent_packets()
            .into_iter()
            .find(|p| p.function == Function::Command)
            .unwrap();
        assert_eq!(command.nonce, 0x21);
        assert_eq!(command.dest_address, 5);
        assert_eq!(command.reg_id, register_id::SYSTEM_STATE);
        assert_eq!(command.value, Some(Value::from_integer(1, 1)));
    }

    #[tokio::test]
    async fn test_set_endpoint_value() {
        let mut h = running(with_responder(ack_from(1)), test_config()).await;
        discover(&mut h, 5).await;

        h.server.set_endpoint_value(5, 13, "on", "1").await.unwrap();
        let command = h
            .fake
            .sent_packets()
            .into_iter()
            .find(|p| p.function == Function::Command)
            .unwrap();
        assert_eq!(command.reg_id, 13);
        assert_eq!(command.value, Some(Value::from_bytes(vec![0x01])));

        // The acknowledgement updated the register
        let mote = h.server.mote(5).await.unwrap();
        assert_eq!(mote.register(13).unwrap().value().as_bytes(), &[0x01]);

        assert!(matches!(
            h.server.set_endpoint_value(6, 13, "on", "1").await,
            Err(Error::UnknownMote { address: 6 })
        ));
        assert!(matches!(
            h.server.set_endpoint_value(5, 20, "on", "1").await,
            Err(Error::UnknownRegister { register: 20, .. })
        ));
        assert!(matches!(
            h.server.set_endpoint_value(5, 13, "off", "1").await,
            Err(Error::UnknownParameter { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_register() {
        let responder: Responder = Box::new(|packet| {
            if packet.function == Function::Query && packet.reg_id == 11 {
                vec![status_from(packet.reg_address, 11, &[0x12, 0x34, 0, 0])]
            } else {
                Vec::new()
            }
        });
        let h = running(with_responder(responder), test_config()).await;

        let value = h.server.query_register(5, 11).await.unwrap();
        assert_eq!(value.as_bytes(), &[0x12, 0x34, 0, 0]);

        assert!(matches!(
            h.server.query_register(5, 14).await,
            Err(Error::NoResponse { attempts: 3 })
        ));
    }

    #[tokio::test]
    async fn test_answers_queries_addressed_to_gateway() {
        let mut h = running(FakeModemOptions::default(), test_config()).await;
        discover(&mut h, 5).await;
        h.fake.inject(&status_from(5, 11, &[0, 1, 0, 2]));
        next_kind(&mut h.events, EventKind::RegisterChanged).await;

        // Not for us
        let mut query = SwapPacket::query(5, 11);
        query.src_address = 7;
        h.fake.inject(&query);
        // For the gateway
        query.dest_address = 1;
        h.fake.inject(&query);

        let reply = h.fake.wait_data_line().await;
        assert_eq!(reply.function, Function::Status);
        assert_eq!(reply.dest_address, BROADCAST_ADDRESS);
        assert_eq!(reply.src_address, 1);
        assert_eq!((reply.reg_address, reply.reg_id), (5, 11));
        assert_eq!(reply.value, Some(Value::from_bytes(vec![0, 1, 0, 2])));
        assert_eq!(h.fake.sent_packets().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_unblocks_waiting_request() {
        let config = test_config().ack_timeout(Duration::from_secs(10));
        let h = running(FakeModemOptions::default(), config).await;

        let server = Arc::clone(&h.server);
        let pending = tokio::spawn(async move {
            server.set_register(5, 11, Value::from_integer(1, 1)).await
        });
        h.fake.wait_data_line().await;

        h.server.stop().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::NotRunning)));
        assert_eq!(h.server.state().await, ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_after_link_loss() {
        init_tracing();
        let link = FakeLink::default();
        let modems = link.modems();
        let mut modem = Modem::new(link, Duration::from_millis(500));
        modem.set_at_timeout(Duration::from_millis(200));
        let dispatcher = EventDispatcher::new(64);
        let mut events = dispatcher.subscribe();
        let server = Server::with_modem(test_config(), modem, library(), dispatcher).unwrap();

        server.start().await.unwrap();
        let first = Arc::clone(&modems.lock().unwrap()[0]);
        first.wait_data_line().await;
        first.hang_up();

        tokio::time::timeout(Duration::from_secs(2), async {
            while server.state().await != ServerState::Stopped {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("link loss not noticed");
        assert!(!server.modem.lock().await.is_open());
        assert!(matches!(
            server.set_register(5, 11, Value::from_integer(1, 1)).await,
            Err(Error::NotRunning)
        ));

        server.start().await.unwrap();
        assert!(server.is_running().await);
        let second = Arc::clone(&modems.lock().unwrap()[1]);
        let discovery = second.wait_data_line().await;
        assert_eq!(discovery.function, Function::Query);

        second.inject(&status_from(5, 0, &PRODUCT_CODE));
        let event = next_kind(&mut events, EventKind::NewMote).await;
        assert_eq!(event.address(), Some(5));
    }

    #[tokio::test]
    async fn test_network_file_persistence() {
        let path = std::env::temp_dir().join(format!("swap-server-{}.json", std::process::id()));
        std::fs::remove_file(&path).ok();

        let mut h = running(
            FakeModemOptions::default(),
            test_config().network_file(&path),
        )
        .await;
        discover(&mut h, 5).await;
        h.fake.inject(&status_from(6, 0, &PRODUCT_CODE));
        next_kind(&mut h.events, EventKind::NewMote).await;

        // Written in the background; the newest snapshot wins
        let saved = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(network) = Network::load(&path) {
                    if network.len() == 2 {
                        return network;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("network file not written");
        assert_eq!(saved.get(5).unwrap().name, "temphum");
        assert!(saved.get(6).is_some());

        h.server.stop().await.unwrap();
        let (transport, _fake) = FakeModem::spawn(FakeModemOptions::default());
        let modem = Modem::new(transport, Duration::from_millis(500));
        let restarted =
            Server::with_modem(test_config().network_file(&path), modem, library(), ()).unwrap();
        assert!(restarted.mote(5).await.is_some());

        restarted.reset_network().await.unwrap();
        assert_eq!(restarted.network().await.len(), 2);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_unknown_product_still_tracked() {
        let mut h = running(FakeModemOptions::default(), test_config()).await;
        h.fake.inject(&status_from(6, 0, &[0, 0, 0, 7, 0, 0, 0, 7]));
        let Event::NewMote(mote) = next_kind(&mut h.events, EventKind::NewMote).await else {
            unreachable!()
        };
        assert_eq!((mote.manufacturer_id, mote.product_id), (7, 7));
        assert!(mote.regular_registers.is_empty());
    }
}
