use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use log::{trace, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::characteristic::{CharacteristicProperties, WriteType};
use crate::identifier::{CharacteristicId, PeripheralHandle, PeripheralId, ServiceId};
use crate::session::{BackendBus, BackendSession, Filter};
use crate::{BackendEvent, Error, GattError, Result};

/// A command the session issued to the fake adapter
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FakeCommand {
    StartScanning(Filter),
    StopScanning,
    Connect(PeripheralId),
    Disconnect(PeripheralId),
    DiscoverServices(PeripheralId),
    DiscoverCharacteristics(PeripheralId, ServiceId),
    Read(PeripheralId, CharacteristicId),
    Write(PeripheralId, CharacteristicId, WriteType, Vec<u8>),
    Subscribe(PeripheralId, CharacteristicId),
    Unsubscribe(PeripheralId, CharacteristicId),
    CancelPending(PeripheralId),
}

#[derive(Debug, Default)]
struct Behaviour {
    rejections: Mutex<VecDeque<String>>,
    cancel_supported: AtomicBool,
}

#[derive(Debug)]
pub struct FakeBackend {
    commands: mpsc::UnboundedSender<FakeCommand>,
    behaviour: Arc<Behaviour>,
}

impl FakeBackend {
    /// Creates a backend reporting through `bus`, plus the controller that
    /// plays the hardware's part
    pub fn new(bus: BackendBus) -> (FakeBackend, FakeAdapter) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let behaviour = Arc::new(Behaviour::default());
        let backend = FakeBackend { commands: commands_tx,
                                    behaviour: behaviour.clone() };
        let adapter = FakeAdapter { bus,
                                    commands: commands_rx,
                                    behaviour,
                                    next_handle: AtomicU32::new(1) };
        (backend, adapter)
    }

    fn record(&self, command: FakeCommand) -> Result<()> {
        trace!("FakeBackend: {:?}", command);

        let rejection = match self.behaviour.rejections.lock() {
            Ok(mut rejections) => rejections.pop_front(),
            Err(_) => None,
        };
        let _ = self.commands.send(command);
        match rejection {
            Some(reason) => Err(Error::Other(anyhow!(reason))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BackendSession for FakeBackend {
    async fn start_scanning(&self, filter: &Filter) -> Result<()> {
        self.record(FakeCommand::StartScanning(filter.clone()))
    }
    async fn stop_scanning(&self) -> Result<()> {
        self.record(FakeCommand::StopScanning)
    }

    async fn peripheral_connect(&self, peripheral: &PeripheralId) -> Result<()> {
        self.record(FakeCommand::Connect(*peripheral))
    }
    async fn peripheral_disconnect(&self, peripheral: &PeripheralId) -> Result<()> {
        self.record(FakeCommand::Disconnect(*peripheral))
    }

    async fn discover_services(&self, peripheral: &PeripheralId) -> Result<()> {
        self.record(FakeCommand::DiscoverServices(*peripheral))
    }
    async fn discover_characteristics(&self, peripheral: &PeripheralId, service: &ServiceId)
                                      -> Result<()> {
        self.record(FakeCommand::DiscoverCharacteristics(*peripheral, *service))
    }

    async fn read_value(&self, peripheral: &PeripheralId, characteristic: &CharacteristicId)
                        -> Result<()> {
        self.record(FakeCommand::Read(*peripheral, *characteristic))
    }
    async fn write_value(&self, peripheral: &PeripheralId, characteristic: &CharacteristicId,
                         write_type: WriteType, data: &[u8])
                         -> Result<()> {
        self.record(FakeCommand::Write(*peripheral, *characteristic, write_type, data.to_vec()))
    }

    async fn subscribe(&self, peripheral: &PeripheralId, characteristic: &CharacteristicId)
                       -> Result<()> {
        self.record(FakeCommand::Subscribe(*peripheral, *characteristic))
    }
    async fn unsubscribe(&self, peripheral: &PeripheralId, characteristic: &CharacteristicId)
                         -> Result<()> {
        self.record(FakeCommand::Unsubscribe(*peripheral, *characteristic))
    }

    async fn cancel_pending(&self, peripheral: &PeripheralId) -> Result<()> {
        if self.behaviour.cancel_supported.load(Ordering::SeqCst) {
            self.record(FakeCommand::CancelPending(*peripheral))
        } else {
            Err(Error::Unsupported)
        }
    }
}

/// The controlling end of a [`FakeBackend`]
///
/// The `expect_*` and `accept_*` helpers are meant for tests and panic when
/// the session doesn't issue the command they expect.
pub struct FakeAdapter {
    bus: BackendBus,
    commands: mpsc::UnboundedReceiver<FakeCommand>,
    behaviour: Arc<Behaviour>,
    next_handle: AtomicU32,
}

impl FakeAdapter {
    /// Reports `event` as if it came from the hardware
    pub fn emit(&self, event: BackendEvent) {
        if self.bus.send(event).is_err() {
            warn!("Session closed, dropping fake backend event");
        }
    }

    pub fn power_on(&self) {
        self.emit(BackendEvent::AdapterPowerChanged { powered_on: true });
    }

    pub fn power_off(&self) {
        self.emit(BackendEvent::AdapterPowerChanged { powered_on: false });
    }

    /// Makes up the identity of a new peripheral
    pub fn declare_peripheral(&self) -> PeripheralId {
        let handle = PeripheralHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        PeripheralId::new(handle, Uuid::new_v4())
    }

    pub fn advertise(&self, peripheral: PeripheralId, name: Option<&str>,
                     services: &[ServiceId]) {
        self.emit(BackendEvent::PeripheralDiscovered {
            peripheral,
            name: name.map(str::to_string),
            rssi: Some(-60),
            service_ids: services.iter().map(|service| service.uuid()).collect(),
        });
    }

    /// Fails the next command with an `Error::Other` carrying `reason`
    pub fn reject_next_command(&self, reason: &str) {
        if let Ok(mut rejections) = self.behaviour.rejections.lock() {
            rejections.push_back(reason.to_string());
        }
    }

    /// Whether `cancel_pending` is supported, off by default
    pub fn set_cancel_supported(&self, supported: bool) {
        self.behaviour.cancel_supported.store(supported, Ordering::SeqCst);
    }

    /// Waits for the next command. Returns `None` once the session is gone.
    pub async fn next_command(&mut self) -> Option<FakeCommand> {
        self.commands.recv().await
    }

    /// The next command, if one has already been issued
    pub fn try_next_command(&mut self) -> Option<FakeCommand> {
        self.commands.try_recv().ok()
    }

    pub async fn expect_command(&mut self, expected: FakeCommand) {
        match self.next_command().await {
            Some(command) => assert_eq!(command, expected, "unexpected backend command"),
            None => panic!("session closed while waiting for {:?}", expected),
        }
    }

    /// Acknowledges a subscribe or unsubscribe
    pub fn notification_state(&self, peripheral: PeripheralId,
                              characteristic: CharacteristicId, enabled: bool) {
        self.emit(BackendEvent::NotificationStateChanged { peripheral,
                                                           characteristic,
                                                           enabled,
                                                           error: None });
    }

    pub fn notify(&self, peripheral: PeripheralId, characteristic: CharacteristicId,
                  value: &[u8]) {
        self.emit(BackendEvent::ValueUpdated { peripheral,
                                               characteristic,
                                               value: value.to_vec() });
    }

    pub fn read_response(&self, peripheral: PeripheralId, characteristic: CharacteristicId,
                         result: std::result::Result<Vec<u8>, GattError>) {
        self.emit(BackendEvent::ValueRead { peripheral, characteristic, result });
    }

    /// Plays the hardware through a complete connect: the connection, then
    /// discovery of `services` and their characteristics
    pub async fn accept_connection(&mut self, peripheral: PeripheralId,
                                   services: &[(ServiceId,
                                                Vec<(CharacteristicId, CharacteristicProperties)>)]) {
        self.expect_command(FakeCommand::Connect(peripheral)).await;
        self.emit(BackendEvent::PeripheralConnected { peripheral });

        self.expect_command(FakeCommand::DiscoverServices(peripheral)).await;
        self.emit(BackendEvent::ServicesDiscovered {
            peripheral,
            services: services.iter().map(|(service, _)| *service).collect(),
            error: None,
        });

        for (service, characteristics) in services {
            self.expect_command(FakeCommand::DiscoverCharacteristics(peripheral, *service))
                .await;
            self.emit(BackendEvent::CharacteristicsDiscovered {
                peripheral,
                service: *service,
                characteristics: characteristics.clone(),
                error: None,
            });
        }
    }

    /// Expects a subscribe to `characteristic` and acknowledges it
    pub async fn accept_subscribe(&mut self, peripheral: PeripheralId,
                                  characteristic: CharacteristicId) {
        self.expect_command(FakeCommand::Subscribe(peripheral, characteristic)).await;
        self.notification_state(peripheral, characteristic, true);
    }

    /// Expects an unsubscribe from `characteristic` and acknowledges it
    pub async fn accept_unsubscribe(&mut self, peripheral: PeripheralId,
                                    characteristic: CharacteristicId) {
        self.expect_command(FakeCommand::Unsubscribe(peripheral, characteristic)).await;
        self.notification_state(peripheral, characteristic, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;

    #[tokio::test]
    async fn rejected_commands_fail_the_operation() {
        let (session, mut adapter) = SessionConfig::new().start_fake().await.unwrap();
        adapter.power_on();
        let peripheral = adapter.declare_peripheral();

        adapter.reject_next_command("radio busy");
        let result = session.connect(peripheral).await;
        assert!(matches!(result, Err(Error::Other(_))));
        assert_eq!(adapter.try_next_command(), Some(FakeCommand::Connect(peripheral)));
        assert_eq!(session.state(), crate::ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn declared_peripherals_are_distinct() {
        let (_session, adapter) = SessionConfig::new().start_fake().await.unwrap();
        let a = adapter.declare_peripheral();
        let b = adapter.declare_peripheral();
        assert_ne!(a, b);
        assert_ne!(a.handle(), b.handle());
    }
}
