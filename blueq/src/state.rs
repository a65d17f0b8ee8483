use std::fmt;
use std::sync::Weak;

use log::{trace, warn};
use tokio::sync::{broadcast, watch};

use crate::identifier::PeripheralId;
use crate::observer::{ConnectionObserver, ObserverRegistry};
use crate::peripheral::Peripheral;
use crate::Event;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    PoweredOff,
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectionState::PoweredOff => "powered off",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Scanning => "scanning",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

impl ConnectionState {
    /// Whether a hardware event or an accepted command may move the
    /// machine from `self` to `to`
    ///
    /// Any state can fall back to `Disconnected` (unsolicited disconnect or
    /// adapter power cycling) and to `PoweredOff`.
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, to) {
            (_, PoweredOff) => true,
            (_, Disconnected) => true,
            (Disconnected, Scanning) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            // Unsolicited connections, such as a peripheral the system
            // reconnected on our behalf while relaunching.
            (Disconnected, Connected) => true,
            (Connected, Disconnecting) => true,
            (Connecting, Disconnecting) => true,
            _ => false,
        }
    }

    pub fn is_available(self) -> bool {
        self != ConnectionState::PoweredOff
    }
}

/// Owns the adapter/peripheral status and fans every transition out to the
/// observers, the public event stream and the state watch channel
pub(crate) struct ConnectionStateMachine {
    state: ConnectionState,

    // The peripheral we are connecting/connected/disconnecting to
    peripheral: Option<PeripheralId>,

    // Whether observers were told about the current connection, so they
    // only hear about a disconnect of a connection they saw
    announced: bool,

    observers: ObserverRegistry,
    event_bus: broadcast::Sender<Event>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionStateMachine {
    pub(crate) fn new(event_bus: broadcast::Sender<Event>,
                      state_tx: watch::Sender<ConnectionState>)
                      -> Self {
        Self {
            state: ConnectionState::PoweredOff,
            peripheral: None,
            announced: false,
            observers: ObserverRegistry::new(),
            event_bus,
            state_tx,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn peripheral(&self) -> Option<PeripheralId> {
        self.peripheral
    }

    /// The peripheral, if the link to it is currently up
    pub(crate) fn connected_peripheral(&self) -> Option<PeripheralId> {
        match self.state {
            ConnectionState::Connected => self.peripheral,
            _ => None,
        }
    }

    pub(crate) fn register(&mut self, observer: Weak<dyn ConnectionObserver>) {
        self.observers.register(observer);
        trace!("{} connection observer(s) registered", self.observers.len());
    }

    pub(crate) fn unregister(&mut self, observer: &Weak<dyn ConnectionObserver>) {
        self.observers.unregister(observer);
    }

    /// Moves to `to`, notifying observers if the state actually changed.
    ///
    /// Returns false (and leaves the state alone) for a transition the
    /// machine doesn't allow.
    pub(crate) fn transition(&mut self, to: ConnectionState,
                             peripheral: Option<PeripheralId>)
                             -> bool {
        let from = self.state;
        if from == to && self.peripheral == peripheral {
            return true;
        }
        if !from.can_transition_to(to) {
            warn!("Ignoring invalid connection state transition {} -> {}", from, to);
            return false;
        }

        trace!("Connection state: {} -> {}", from, to);
        self.state = to;
        self.peripheral = peripheral;

        if from.is_available() != to.is_available() {
            let available = to.is_available();
            self.observers.notify_all(|o| o.on_availability_changed(available));
            let _ = self.event_bus.send(Event::AvailabilityChanged { available });
        }
        if from != to {
            self.observers.notify_all(|o| o.on_state_changed(to));
            self.state_tx.send_replace(to);
            let _ = self.event_bus.send(Event::StateChanged { state: to });
        }
        // Only connections observers heard about get a matching disconnect
        if matches!(to, ConnectionState::Disconnected | ConnectionState::PoweredOff)
           && std::mem::take(&mut self.announced)
        {
            self.observers.notify_all(|o| o.on_disconnected());
            let _ = self.event_bus.send(Event::PeripheralDisconnected);
        }

        true
    }

    /// Notifies observers of a resolved connection
    ///
    /// This is separate from the `Connected` transition since the resolved
    /// peripheral only exists once discovery has finished.
    pub(crate) fn notify_connected(&mut self, peripheral: &Peripheral) {
        self.announced = true;
        self.observers.notify_all(|o| o.on_connected(peripheral));
        let _ = self.event_bus.send(Event::PeripheralConnected { peripheral: peripheral.clone() });
    }
}
