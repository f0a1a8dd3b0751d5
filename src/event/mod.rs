//! Notifications raised while the server tracks the network.
//!
//! The server calls an [`EventHandler`] synchronously from its dispatch task.
//! Every hook has a no-op default, so handlers implement only what they need.
//! [`EventDispatcher`] is a ready-made handler that turns each hook into an
//! owned [`Event`] and broadcasts it to async subscribers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::protocol::SystemState;
use crate::types::{Mote, Parameter, Register, Value};

/// Hooks called by the server's dispatch task.
///
/// Handlers must return promptly; they run on the packet path.
#[allow(unused_variables)]
pub trait EventHandler: Send + Sync {
    /// The server finished starting and sent its discovery query.
    fn server_started(&self) {}

    /// A mote announced its product code for the first time.
    fn new_mote_detected(&self, mote: &Mote) {}

    /// An endpoint of a newly detected mote.
    fn new_endpoint_detected(&self, address: u8, endpoint: &Parameter) {}

    /// A configuration parameter of a newly detected mote.
    fn new_parameter_detected(&self, address: u8, parameter: &Parameter) {}

    /// A mote reported a different system state.
    fn mote_state_changed(&self, mote: &Mote) {}

    /// A mote moved to a new address.
    fn mote_address_changed(&self, mote: &Mote, old_address: u8) {}

    /// A register received a new value.
    fn register_value_changed(&self, address: u8, register: &Register) {}

    /// An endpoint value changed with its register.
    fn endpoint_value_changed(&self, address: u8, endpoint: &Parameter) {}

    /// A configuration parameter value changed with its register.
    fn parameter_value_changed(&self, address: u8, parameter: &Parameter) {}
}

/// Handler ignoring everything.
impl EventHandler for () {}

impl<T: EventHandler + ?Sized> EventHandler for Arc<T> {
    fn server_started(&self) {
        (**self).server_started();
    }

    fn new_mote_detected(&self, mote: &Mote) {
        (**self).new_mote_detected(mote);
    }

    fn new_endpoint_detected(&self, address: u8, endpoint: &Parameter) {
        (**self).new_endpoint_detected(address, endpoint);
    }

    fn new_parameter_detected(&self, address: u8, parameter: &Parameter) {
        (**self).new_parameter_detected(address, parameter);
    }

    fn mote_state_changed(&self, mote: &Mote) {
        (**self).mote_state_changed(mote);
    }

    fn mote_address_changed(&self, mote: &Mote, old_address: u8) {
        (**self).mote_address_changed(mote, old_address);
    }

    fn register_value_changed(&self, address: u8, register: &Register) {
        (**self).register_value_changed(address, register);
    }

    fn endpoint_value_changed(&self, address: u8, endpoint: &Parameter) {
        (**self).endpoint_value_changed(address, endpoint);
    }

    fn parameter_value_changed(&self, address: u8, parameter: &Parameter) {
        (**self).parameter_value_changed(address, parameter);
    }
}

/// Kind of an [`Event`], for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ServerStarted,
    NewMote,
    NewEndpoint,
    NewParameter,
    MoteStateChanged,
    MoteAddressChanged,
    RegisterChanged,
    EndpointChanged,
    ParameterChanged,
}

/// Owned notification, as broadcast by [`EventDispatcher`].
#[derive(Debug, Clone)]
pub enum Event {
    /// Server is running.
    ServerStarted,
    /// New mote detected.
    NewMote(Box<Mote>),
    /// Endpoint of a new mote.
    NewEndpoint { address: u8, endpoint: Box<Parameter> },
    /// Configuration parameter of a new mote.
    NewParameter { address: u8, parameter: Box<Parameter> },
    /// Mote system state changed.
    MoteStateChanged { address: u8, state: SystemState },
    /// Mote address changed.
    MoteAddressChanged { old_address: u8, new_address: u8 },
    /// Register value changed.
    RegisterChanged {
        address: u8,
        register_id: u8,
        value: Value,
    },
    /// Endpoint value changed.
    EndpointChanged { address: u8, endpoint: Box<Parameter> },
    /// Configuration parameter value changed.
    ParameterChanged { address: u8, parameter: Box<Parameter> },
}

impl Event {
    /// Returns the kind of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::ServerStarted => EventKind::ServerStarted,
            Self::NewMote(_) => EventKind::NewMote,
            Self::NewEndpoint { .. } => EventKind::NewEndpoint,
            Self::NewParameter { .. } => EventKind::NewParameter,
            Self::MoteStateChanged { .. } => EventKind::MoteStateChanged,
            Self::MoteAddressChanged { .. } => EventKind::MoteAddressChanged,
            Self::RegisterChanged { .. } => EventKind::RegisterChanged,
            Self::EndpointChanged { .. } => EventKind::EndpointChanged,
            Self::ParameterChanged { .. } => EventKind::ParameterChanged,
        }
    }

    /// Address of the mote the event is about. Address changes report the
    /// new address.
    #[must_use]
    pub fn address(&self) -> Option<u8> {
        match self {
            Self::ServerStarted => None,
            Self::NewMote(mote) => Some(mote.address),
            Self::MoteAddressChanged { new_address, .. } => Some(*new_address),
            Self::NewEndpoint { address, .. }
            | Self::NewParameter { address, .. }
            | Self::MoteStateChanged { address, .. }
            | Self::RegisterChanged { address, .. }
            | Self::EndpointChanged { address, .. }
            | Self::ParameterChanged { address, .. } => Some(*address),
        }
    }
}

/// A subscription to events.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Receives the next event. Returns `None` once the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("event subscriber lagged, {} events lost", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Subscription filter for specific events.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by event kinds.
    pub kinds: Option<Vec<EventKind>>,
    /// Filter by mote address.
    pub address: Option<u8>,
    /// Filter for state changes to this state.
    pub state: Option<SystemState>,
}

impl EventFilter {
    /// Creates a filter for specific event kinds.
    #[must_use]
    pub const fn kinds(kinds: Vec<EventKind>) -> Self {
        Self {
            kinds: Some(kinds),
            address: None,
            state: None,
        }
    }

    /// Creates a filter for a mote entering `state`.
    #[must_use]
    pub fn state(state: SystemState) -> Self {
        Self {
            kinds: Some(vec![EventKind::MoteStateChanged]),
            address: None,
            state: Some(state),
        }
    }

    /// Restricts the filter to one mote.
    #[must_use]
    pub const fn mote(mut self, address: u8) -> Self {
        self.address = Some(address);
        self
    }

    /// Checks if an event matches this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }

        if let Some(expected) = self.address {
            if event.address() != Some(expected) {
                return false;
            }
        }

        if let Some(expected) = self.state {
            match event {
                Event::MoteStateChanged { state, .. } if *state == expected => {}
                _ => return false,
            }
        }

        true
    }
}

/// Broadcasts every notification to subscribers.
#[derive(Clone)]
pub struct EventDispatcher {
    sender: broadcast::Sender<Event>,
}

impl EventDispatcher {
    /// Creates a new event dispatcher.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Dispatches an event to all subscribers.
    pub fn dispatch(&self, event: Event) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribes to all events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    /// Waits for an event matching the filter with timeout.
    ///
    /// Returns `None` if the timeout expires or the channel is closed.
    pub async fn wait_for(&self, filter: EventFilter, timeout: Duration) -> Option<Event> {
        let mut subscription = self.subscribe();

        tokio::select! {
            biased;
            result = async {
                while let Some(event) = subscription.recv().await {
                    if filter.matches(&event) {
                        return Some(event);
                    }
                }
                None
            } => result,
            () = tokio::time::sleep(timeout) => None,
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventHandler for EventDispatcher {
    fn server_started(&self) {
        self.dispatch(Event::ServerStarted);
    }

    fn new_mote_detected(&self, mote: &Mote) {
        self.dispatch(Event::NewMote(Box::new(mote.clone())));
    }

    fn new_endpoint_detected(&self, address: u8, endpoint: &Parameter) {
        self.dispatch(Event::NewEndpoint {
            address,
            endpoint: Box::new(endpoint.clone()),
        });
    }

    fn new_parameter_detected(&self, address: u8, parameter: &Parameter) {
        self.dispatch(Event::NewParameter {
            address,
            parameter: Box::new(parameter.clone()),
        });
    }

    fn mote_state_changed(&self, mote: &Mote) {
        self.dispatch(Event::MoteStateChanged {
            address: mote.address,
            state: mote.state,
        });
    }

    fn mote_address_changed(&self, mote: &Mote, old_address: u8) {
        self.dispatch(Event::MoteAddressChanged {
            old_address,
            new_address: mote.address,
        });
    }

    fn register_value_changed(&self, address: u8, register: &Register) {
        self.dispatch(Event::RegisterChanged {
            address,
            register_id: register.id,
            value: register.value().clone(),
        });
    }

    fn endpoint_value_changed(&self, address: u8, endpoint: &Parameter) {
        self.dispatch(Event::EndpointChanged {
            address,
            endpoint: Box::new(endpoint.clone()),
        });
    }

    fn parameter_value_changed(&self, address: u8, parameter: &Parameter) {
        self.dispatch(Event::ParameterChanged {
            address,
            parameter: Box::new(parameter.clone()),
        });
    }
}
