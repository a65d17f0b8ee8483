use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::anyhow;
use dashmap::DashMap;
use log::{debug, trace, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::characteristic::WriteType;
use crate::identifier::{CharacteristicId, PeripheralId, ServiceId};
use crate::listen::{ListenCallback, ListenRegistry, ListenRestorer};
use crate::observer::ConnectionObserver;
use crate::peripheral::{DiscoveredPeripheral, Peripheral};
use crate::queue::{ConnectStep, ConnectTarget, InFlight, OperationId, OperationKind,
                   OperationQueue, QueuedOperation, Resolver};
use crate::session::BackendSession;
use crate::state::{ConnectionState, ConnectionStateMachine};
use crate::{BackendEvent, Error, GattError, Result};

pub(crate) enum Request {
    Enqueue(QueuedOperation),
    Cancel(OperationId),
    // Stops the given scan, or with `None` whichever scan is in flight
    StopScan(Option<OperationId>),
    RegisterObserver(Weak<dyn ConnectionObserver>),
    UnregisterObserver(Weak<dyn ConnectionObserver>),
    SetListenRestorer(Option<Arc<dyn ListenRestorer>>),
    IsListening(CharacteristicId, oneshot::Sender<bool>),
    Flush(oneshot::Sender<()>),
}

/// Everything the driver task reacts to, in a single channel so that
/// application requests and hardware events are handled in arrival order
pub(crate) enum Input {
    Request(Request),
    Backend(BackendEvent),
    Shutdown,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Timeouts {
    pub(crate) connect: Duration,
    pub(crate) scan: Option<Duration>,
    pub(crate) operation: Duration,
    pub(crate) restore_window: Duration,
}

enum Progress {
    Done,
    Waiting(QueuedOperation),
}

// Resolves the operation with the error and finishes the current step
macro_rules! or_resolve {
    ($result:expr, $resolve:expr) => {
        match $result {
            Ok(value) => value,
            Err(err) => {
                $resolve(Err(err));
                return Progress::Done;
            }
        }
    };
}

fn gatt_result(error: Option<GattError>) -> Result<()> {
    match error {
        Some(error) => Err(error.into()),
        None => Ok(()),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending::<()>().await,
    }
}

/// Owns the operation queue, the connection state machine and the listen
/// registry, and runs every state change on a single task
pub(crate) struct SessionDriver {
    backend: Box<dyn BackendSession>,
    timeouts: Timeouts,

    state: ConnectionStateMachine,
    queue: OperationQueue,
    listens: ListenRegistry,

    restorer: Option<Arc<dyn ListenRestorer>>,
    restore_deadline: Option<Instant>,

    // Until the adapter first reports its power state requests are held
    // back, after that they fail while it's off
    power_reported: bool,

    // The resolved peripheral while the link is up
    connected: Option<Peripheral>,

    // A peripheral whose connection attempt timed out. The adapter was told
    // to cancel but might still report the connection.
    abandoned: Option<PeripheralId>,

    peripherals: Arc<DashMap<PeripheralId, DiscoveredPeripheral>>,
}

impl SessionDriver {
    pub(crate) fn new(backend: Box<dyn BackendSession>, timeouts: Timeouts,
                      state: ConnectionStateMachine,
                      restorer: Option<Arc<dyn ListenRestorer>>,
                      peripherals: Arc<DashMap<PeripheralId, DiscoveredPeripheral>>)
                      -> Self {
        SessionDriver { backend,
                        timeouts,
                        state,
                        queue: OperationQueue::new(),
                        listens: ListenRegistry::new(),
                        restorer,
                        restore_deadline: None,
                        power_reported: false,
                        connected: None,
                        abandoned: None,
                        peripherals }
    }

    pub(crate) async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>) {
        trace!("Starting session driver task");

        loop {
            let deadline = self.next_deadline();
            let input = tokio::select! {
                biased;

                input = inputs.recv() => input,
                _ = sleep_until(deadline) => {
                    self.on_deadline().await;
                    continue;
                }
            };

            match input {
                Some(Input::Request(request)) => self.handle_request(request).await,
                Some(Input::Backend(event)) => self.handle_backend_event(event).await,
                Some(Input::Shutdown) | None => {
                    trace!("Exiting session driver task since Session has been dropped");
                    break;
                }
            }
        }

        self.shutdown().await;
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.queue.deadline(), self.restore_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Enqueue(mut op) => {
                if self.power_reported && self.state.state() == ConnectionState::PoweredOff {
                    self.reject_while_powered_off(op);
                    return;
                }
                // GATT operations are tied to the link that exists when they
                // are made, so they don't end up running against a different
                // peripheral after a reconnect
                if op.kind.needs_link() {
                    op.bound_to = self.state.connected_peripheral();
                }
                self.queue.push(op);
            }
            Request::Cancel(id) => match self.queue.remove_pending(id) {
                Some(op) => op.fail(Error::Cancelled),
                None => debug!("Ignoring cancellation of {} which isn't pending", id),
            },
            Request::StopScan(scan) => self.stop_scan(scan).await,
            Request::RegisterObserver(observer) => self.state.register(observer),
            Request::UnregisterObserver(observer) => self.state.unregister(&observer),
            Request::SetListenRestorer(restorer) => self.restorer = restorer,
            Request::IsListening(characteristic, reply) => {
                let _ = reply.send(self.listens.is_listening(&characteristic));
            }
            Request::Flush(reply) => {
                let _ = reply.send(());
            }
        }

        self.pump().await;
    }

    fn reject_while_powered_off(&mut self, op: QueuedOperation) {
        let QueuedOperation { id, bound_to, kind } = op;
        match kind {
            OperationKind::EndListen { characteristic, resolve }
                if !self.listens.is_listening(&characteristic)
                   && !self.listens.is_candidate(&characteristic) =>
            {
                trace!("Not listening to {}, nothing to end", characteristic);
                resolve(Ok(()));
            }
            kind => {
                debug!("Adapter is powered off, failing operation {} ({})", id, kind.name());
                QueuedOperation { id, bound_to, kind }.fail(Error::AdapterUnavailable);
            }
        }
    }

    /// Dispatches pending operations until one is left waiting on the
    /// adapter or there is nothing left to do
    async fn pump(&mut self) {
        while self.queue.is_idle() {
            if !self.state.state().is_available() {
                if self.queue.pending_len() > 0 {
                    trace!("Adapter unavailable, {} operation(s) waiting",
                           self.queue.pending_len());
                }
                return;
            }

            let op = match self.queue.next() {
                Some(op) => op,
                None => return,
            };
            let deadline = self.deadline_for(&op.kind);
            if let Progress::Waiting(op) = self.dispatch(op).await {
                self.queue.set_in_flight(op, deadline);
            }
        }
    }

    fn deadline_for(&self, kind: &OperationKind) -> Option<Instant> {
        let timeout = match kind {
            OperationKind::Scan { .. } => self.timeouts.scan,
            OperationKind::Connect { .. } => Some(self.timeouts.connect),
            _ => Some(self.timeouts.operation),
        };
        timeout.map(|timeout| Instant::now() + timeout)
    }

    /// Scans and connects need the adapter to themselves
    fn ensure_idle_link(&self) -> Result<()> {
        match self.state.state() {
            ConnectionState::Disconnected => Ok(()),
            ConnectionState::PoweredOff => Err(Error::AdapterUnavailable),
            ConnectionState::Scanning => Err(Error::Other(anyhow!("Already scanning"))),
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Disconnecting => Err(Error::Other(anyhow!("Already connected"))),
        }
    }

    /// The peripheral a GATT operation should run against
    fn link_for(&self, bound_to: Option<PeripheralId>) -> Result<PeripheralId> {
        match (self.state.connected_peripheral(), bound_to) {
            (None, _) => Err(Error::NotConnected),
            (Some(connected), Some(bound)) if connected != bound => Err(Error::Disconnected),
            (Some(connected), _) => Ok(connected),
        }
    }

    async fn dispatch(&mut self, op: QueuedOperation) -> Progress {
        trace!("Dispatching operation {} ({})", op.id, op.kind.name());

        let QueuedOperation { id, bound_to, kind } = op;
        match kind {
            OperationKind::Scan { filter, discovered, .. } => {
                if discovered.is_closed() {
                    trace!("Scan {} was dropped before it started", id);
                    return Progress::Done;
                }
                let started = match self.ensure_idle_link() {
                    Ok(()) => self.backend.start_scanning(&filter).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = started {
                    let _ = discovered.send(Err(err));
                    return Progress::Done;
                }
                self.state.transition(ConnectionState::Scanning, None);
                Progress::Waiting(QueuedOperation { id,
                                                    bound_to,
                                                    kind: OperationKind::Scan { filter,
                                                                                discovered,
                                                                                started: true } })
            }

            OperationKind::Connect { target, resolve, .. } => {
                if let ConnectTarget::Peripheral(p) = &target {
                    if let Some(connected) = self.connected.as_ref().filter(|c| c.id() == *p) {
                        trace!("Already connected to {}", p);
                        resolve(Ok(connected.clone()));
                        return Progress::Done;
                    }
                }
                or_resolve!(self.ensure_idle_link(), resolve);
                self.abandoned = None;

                let step = match &target {
                    ConnectTarget::Peripheral(p) => or_resolve!(self.begin_connect(*p).await, resolve),
                    ConnectTarget::FirstMatching(filter) => {
                        or_resolve!(self.backend.start_scanning(filter).await, resolve);
                        self.state.transition(ConnectionState::Scanning, None);
                        ConnectStep::Scanning
                    }
                };
                Progress::Waiting(QueuedOperation { id,
                                                    bound_to,
                                                    kind: OperationKind::Connect { target,
                                                                                   step,
                                                                                   resolve } })
            }

            OperationKind::Disconnect { resolve, .. } => {
                let p = or_resolve!(self.link_for(bound_to), resolve);
                or_resolve!(self.backend.peripheral_disconnect(&p).await, resolve);
                self.state.transition(ConnectionState::Disconnecting, Some(p));
                Progress::Waiting(QueuedOperation { id,
                                                    bound_to: Some(p),
                                                    kind: OperationKind::Disconnect { started: true,
                                                                                      resolve } })
            }

            OperationKind::Read { characteristic, resolve } => {
                let p = or_resolve!(self.link_for(bound_to), resolve);
                or_resolve!(self.backend.read_value(&p, &characteristic).await, resolve);
                Progress::Waiting(QueuedOperation { id,
                                                    bound_to: Some(p),
                                                    kind: OperationKind::Read { characteristic,
                                                                                resolve } })
            }

            OperationKind::Write { characteristic, write_type, data, resolve } => {
                let p = or_resolve!(self.link_for(bound_to), resolve);
                or_resolve!(self.backend
                                .write_value(&p, &characteristic, write_type, &data)
                                .await,
                            resolve);
                if write_type == WriteType::WithoutResponse {
                    resolve(Ok(()));
                    return Progress::Done;
                }
                Progress::Waiting(QueuedOperation { id,
                                                    bound_to: Some(p),
                                                    kind: OperationKind::Write { characteristic,
                                                                                 write_type,
                                                                                 data,
                                                                                 resolve } })
            }

            OperationKind::Listen { characteristic, callback, restore_only, resolve } => {
                let callback: ListenCallback = match callback {
                    Some(callback) => callback,
                    None => Box::new(|_: Vec<u8>| ()),
                };

                // A subscription that survived a relaunch is already active on
                // the adapter, it only needs a callback
                if self.listens.is_candidate(&characteristic) {
                    resolve(self.listens.claim(characteristic, callback));
                    self.close_restore_window_if_settled();
                    return Progress::Done;
                }
                if restore_only {
                    resolve(Err(Error::NotListening));
                    return Progress::Done;
                }

                let p = or_resolve!(self.link_for(bound_to), resolve);
                or_resolve!(self.listens.insert(characteristic, p, callback), resolve);
                if let Err(err) = self.backend.subscribe(&p, &characteristic).await {
                    self.listens.remove(&characteristic);
                    resolve(Err(err));
                    return Progress::Done;
                }
                Progress::Waiting(QueuedOperation { id,
                                                    bound_to: Some(p),
                                                    kind: OperationKind::Listen { characteristic,
                                                                                  callback: None,
                                                                                  restore_only,
                                                                                  resolve } })
            }

            OperationKind::EndListen { characteristic, resolve } => {
                if self.listens.is_candidate(&characteristic) {
                    if let Some(p) = self.listens.remove(&characteristic) {
                        self.end_subscription_silently(p, characteristic).await;
                    }
                    self.close_restore_window_if_settled();
                    resolve(Ok(()));
                    return Progress::Done;
                }

                // Restored subscriptions live on the adapter without a link the
                // state machine knows about
                let restored = self.listens.is_restored(&characteristic);
                let p = match self.listens.remove(&characteristic) {
                    Some(p) => p,
                    None => {
                        trace!("Not listening to {}, nothing to end", characteristic);
                        resolve(Ok(()));
                        return Progress::Done;
                    }
                };
                if !restored && self.state.connected_peripheral() != Some(p) {
                    resolve(Ok(()));
                    return Progress::Done;
                }
                or_resolve!(self.backend.unsubscribe(&p, &characteristic).await, resolve);
                Progress::Waiting(QueuedOperation { id,
                                                    bound_to: Some(p),
                                                    kind: OperationKind::EndListen { characteristic,
                                                                                     resolve } })
            }
        }
    }

    async fn begin_connect(&mut self, peripheral: PeripheralId) -> Result<ConnectStep> {
        self.backend.peripheral_connect(&peripheral).await?;
        self.state.transition(ConnectionState::Connecting, Some(peripheral));
        Ok(ConnectStep::AwaitConnected(peripheral))
    }

    /// Tears down a link that came up but whose connect flow failed
    async fn abort_connect(&mut self, peripheral: PeripheralId) {
        if let Err(err) = self.backend.peripheral_disconnect(&peripheral).await {
            log::error!("Failed to disconnect {} after a failed connect: {:?}", peripheral, err);
        }
        self.lose_link(peripheral);
    }

    async fn advance_in_flight(&mut self, in_flight: InFlight, event: BackendEvent) {
        let deadline = in_flight.deadline;
        if let Progress::Waiting(op) = self.advance(in_flight.op, event).await {
            self.queue.set_in_flight(op, deadline);
        }
    }

    /// Moves the in-flight operation on by one step with the event it was
    /// waiting for
    async fn advance(&mut self, op: QueuedOperation, event: BackendEvent) -> Progress {
        let QueuedOperation { id, bound_to, kind } = op;
        match (kind, event) {
            (OperationKind::Connect { target, step, resolve }, event) => {
                self.advance_connect(id, target, step, resolve, event).await
            }
            (OperationKind::Read { resolve, .. }, BackendEvent::ValueRead { result, .. }) => {
                resolve(result.map_err(Error::from));
                Progress::Done
            }
            (OperationKind::Write { resolve, .. }, BackendEvent::ValueWritten { error, .. }) => {
                resolve(gatt_result(error));
                Progress::Done
            }
            (OperationKind::Listen { characteristic, resolve, .. },
             BackendEvent::NotificationStateChanged { error, .. }) => {
                if error.is_some() {
                    self.listens.remove(&characteristic);
                }
                resolve(gatt_result(error));
                Progress::Done
            }
            (OperationKind::EndListen { resolve, .. },
             BackendEvent::NotificationStateChanged { error, .. }) => {
                resolve(gatt_result(error));
                Progress::Done
            }
            (kind, event) => {
                warn!("Operation {} ({}) can't handle {:?}", id, kind.name(), event);
                Progress::Waiting(QueuedOperation { id, bound_to, kind })
            }
        }
    }

    async fn advance_connect(&mut self, id: OperationId, target: ConnectTarget,
                             step: ConnectStep, resolve: Resolver<Peripheral>,
                             event: BackendEvent)
                             -> Progress {
        let waiting = |target, step, resolve| {
            Progress::Waiting(QueuedOperation { id,
                                                bound_to: None,
                                                kind: OperationKind::Connect { target,
                                                                               step,
                                                                               resolve } })
        };

        match (step, event) {
            (ConnectStep::Scanning, BackendEvent::PeripheralDiscovered { peripheral, .. }) => {
                debug!("Found {} while scanning, connecting", peripheral);
                self.end_scanning().await;
                let step = or_resolve!(self.begin_connect(peripheral).await, resolve);
                waiting(target, step, resolve)
            }
            (ConnectStep::AwaitConnected(p), BackendEvent::PeripheralConnected { .. }) => {
                let name = self.peripherals.get(&p).and_then(|item| item.value().name.clone());
                if let Err(err) = self.backend.discover_services(&p).await {
                    self.abort_connect(p).await;
                    resolve(Err(err));
                    return Progress::Done;
                }
                waiting(target, ConnectStep::AwaitServices(Peripheral::new(p, name)), resolve)
            }
            (ConnectStep::AwaitServices(mut peripheral),
             BackendEvent::ServicesDiscovered { services, error, .. }) => {
                if let Some(error) = error {
                    self.abort_connect(peripheral.id()).await;
                    resolve(Err(Error::ConnectionFailed(Some(error))));
                    return Progress::Done;
                }
                for service in &services {
                    peripheral.add_service(*service);
                }
                self.discover_next_service(id, target, peripheral, services.into(), resolve)
                    .await
            }
            (ConnectStep::AwaitCharacteristics { mut peripheral, current, remaining },
             BackendEvent::CharacteristicsDiscovered { characteristics, error, .. }) => {
                if let Some(error) = error {
                    self.abort_connect(peripheral.id()).await;
                    resolve(Err(Error::ConnectionFailed(Some(error))));
                    return Progress::Done;
                }
                for (characteristic, properties) in characteristics {
                    if characteristic.service() != current {
                        log::error!("Spurious characteristic {} reported for service {}",
                                    characteristic, current);
                        continue;
                    }
                    peripheral.add_characteristic(characteristic, properties);
                }
                self.discover_next_service(id, target, peripheral, remaining, resolve)
                    .await
            }
            (step, event) => {
                warn!("Connect {} in step {:?} can't handle {:?}", id, step, event);
                waiting(target, step, resolve)
            }
        }
    }

    async fn discover_next_service(&mut self, id: OperationId, target: ConnectTarget,
                                   peripheral: Peripheral, mut remaining: VecDeque<ServiceId>,
                                   resolve: Resolver<Peripheral>)
                                   -> Progress {
        let current = match remaining.pop_front() {
            Some(service) => service,
            None => {
                debug!("Connected to {}", peripheral.id());
                self.connected = Some(peripheral.clone());
                self.state.notify_connected(&peripheral);
                resolve(Ok(peripheral));
                return Progress::Done;
            }
        };

        if let Err(err) = self.backend
                              .discover_characteristics(&peripheral.id(), &current)
                              .await
        {
            self.abort_connect(peripheral.id()).await;
            resolve(Err(err));
            return Progress::Done;
        }
        let step = ConnectStep::AwaitCharacteristics { peripheral, current, remaining };
        Progress::Waiting(QueuedOperation { id,
                                            bound_to: None,
                                            kind: OperationKind::Connect { target,
                                                                           step,
                                                                           resolve } })
    }

    async fn handle_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::AdapterPowerChanged { powered_on } => {
                self.on_power_changed(powered_on);
            }
            BackendEvent::PeripheralDiscovered { .. } => self.on_peripheral_discovered(event).await,
            BackendEvent::PeripheralConnected { peripheral } => {
                self.on_peripheral_connected(peripheral, event).await;
            }
            BackendEvent::PeripheralConnectionFailed { peripheral, error } => {
                self.on_connection_failed(peripheral, error);
            }
            BackendEvent::PeripheralDisconnected { peripheral, .. } => {
                self.on_peripheral_disconnected(peripheral, event);
            }
            BackendEvent::ValueUpdated { peripheral, characteristic, value } => {
                self.listens.deliver(&characteristic, &peripheral, value);
            }
            BackendEvent::NotificationStateChanged { characteristic, enabled, ref error, .. }
                if (!enabled || error.is_some()) && self.listens.take_ack(&characteristic) =>
            {
                // Unsubscribes the registry issued itself went to the adapter
                // before anything still waiting on this characteristic
                trace!("Subscription to {} ended", characteristic);
            }
            BackendEvent::NotificationStateChanged { .. } => match self.queue.take_matching(&event) {
                Some(in_flight) => self.advance_in_flight(in_flight, event).await,
                None => warn!("Spurious notification state change from backend: {:?}", event),
            },
            BackendEvent::RestorationCandidates { peripheral, characteristics } => {
                self.on_restoration_candidates(peripheral, characteristics).await;
            }
            BackendEvent::ServicesDiscovered { .. }
            | BackendEvent::CharacteristicsDiscovered { .. }
            | BackendEvent::ValueRead { .. }
            | BackendEvent::ValueWritten { .. } => match self.queue.take_matching(&event) {
                Some(in_flight) => self.advance_in_flight(in_flight, event).await,
                None => warn!("Ignoring unexpected event from backend: {:?}", event),
            },
        }

        self.pump().await;
    }

    fn on_power_changed(&mut self, powered_on: bool) {
        self.power_reported = true;
        let current = self.state.state();
        if powered_on {
            if current == ConnectionState::PoweredOff {
                debug!("Adapter powered on");
                self.state.transition(ConnectionState::Disconnected, None);
            } else {
                trace!("Ignoring redundant power on notification");
            }
            return;
        }

        if current == ConnectionState::PoweredOff {
            trace!("Ignoring redundant power off notification");
            return;
        }
        debug!("Adapter powered off while {}", current);

        // Losing power drops any link first, as a regular disconnect
        if let Some(p) = self.state.peripheral() {
            self.lose_link(p);
        }
        self.state.transition(ConnectionState::PoweredOff, None);

        if let Some(in_flight) = self.queue.take_in_flight() {
            in_flight.op.fail(Error::AdapterUnavailable);
        }
        for op in self.queue.drain_pending() {
            op.fail(Error::AdapterUnavailable);
        }
    }

    async fn on_peripheral_discovered(&mut self, event: BackendEvent) {
        let discovered = match &event {
            BackendEvent::PeripheralDiscovered { peripheral, name, rssi, service_ids } => {
                DiscoveredPeripheral { id: *peripheral,
                                       name: name.clone(),
                                       rssi: *rssi,
                                       service_ids: service_ids.clone() }
            }
            _ => return,
        };
        trace!("PeripheralDiscovered: {} ({:?})", discovered.id, discovered.name);

        // Keep the name from an earlier advertisement if this one lacks it
        let mut merged = discovered.clone();
        if let Some(previous) = self.peripherals.get(&discovered.id) {
            if merged.name.is_none() {
                merged.name = previous.value().name.clone();
            }
        }
        self.peripherals.insert(discovered.id, merged);

        let connect = self.queue.take_in_flight_if(|op| match &op.kind {
                                                 OperationKind::Connect {
                                                     target: ConnectTarget::FirstMatching(filter),
                                                     step: ConnectStep::Scanning,
                                                     ..
                                                 } => filter.matches(&discovered),
                                                 _ => false,
                                             });
        if let Some(in_flight) = connect {
            self.advance_in_flight(in_flight, event).await;
            return;
        }

        let mut stream_dropped = false;
        if let Some(in_flight) = self.queue.in_flight() {
            if let OperationKind::Scan { filter, discovered: results, .. } = &in_flight.op.kind {
                if filter.matches(&discovered) && results.send(Ok(discovered)).is_err() {
                    stream_dropped = true;
                }
            }
        }
        if stream_dropped {
            debug!("Scan results dropped by application, stopping scan");
            if self.queue.take_in_flight().is_some() {
                self.end_scanning().await;
            }
        }
    }

    async fn on_peripheral_connected(&mut self, peripheral: PeripheralId, event: BackendEvent) {
        trace!("PeripheralConnected: {}", peripheral);

        match self.state.state() {
            ConnectionState::Connecting if self.state.peripheral() == Some(peripheral) => {
                self.state.transition(ConnectionState::Connected, Some(peripheral));
            }
            ConnectionState::Disconnected if self.abandoned == Some(peripheral) => {
                warn!("Peripheral {} connected after its connection attempt timed out",
                      peripheral);
                self.abandoned = None;
                if let Err(err) = self.backend.peripheral_disconnect(&peripheral).await {
                    log::error!("Failed to disconnect {}: {:?}", peripheral, err);
                }
                return;
            }
            ConnectionState::Disconnected => {
                // e.g. the system reconnected a peripheral for us on relaunch
                debug!("Unsolicited connection to {}", peripheral);
                self.state.transition(ConnectionState::Connected, Some(peripheral));
                let name = self.peripherals
                               .get(&peripheral)
                               .and_then(|item| item.value().name.clone());
                let resolved = Peripheral::new(peripheral, name);
                self.connected = Some(resolved.clone());
                self.state.notify_connected(&resolved);
                return;
            }
            _ => {
                warn!("Spurious, unbalanced/redundant PeripheralConnected notification from backend");
                return;
            }
        }

        if let Some(in_flight) = self.queue.take_matching(&event) {
            self.advance_in_flight(in_flight, event).await;
        }
    }

    fn on_connection_failed(&mut self, peripheral: PeripheralId, error: Option<GattError>) {
        if self.state.state() == ConnectionState::Connecting
           && self.state.peripheral() == Some(peripheral)
        {
            debug!("Failed to connect to {}: {:?}", peripheral, error);
            self.state.transition(ConnectionState::Disconnected, None);
        } else {
            warn!("Spurious connection failure for {} from backend", peripheral);
        }

        let attempt = self.queue.take_in_flight_if(|op| {
                                    matches!(&op.kind,
                                             OperationKind::Connect {
                                                 step: ConnectStep::AwaitConnected(target),
                                                 ..
                                             } if *target == peripheral)
                                });
        if let Some(in_flight) = attempt {
            in_flight.op.fail(Error::ConnectionFailed(error));
        }
    }

    fn on_peripheral_disconnected(&mut self, peripheral: PeripheralId, event: BackendEvent) {
        trace!("PeripheralDisconnected: {}", peripheral);

        let current = self.state.state();
        let ours = self.state.peripheral() == Some(peripheral);
        match current {
            ConnectionState::Connecting if ours => {
                let error = match event {
                    BackendEvent::PeripheralDisconnected { error, .. } => error,
                    _ => None,
                };
                self.on_connection_failed(peripheral, error);
            }
            ConnectionState::Connected | ConnectionState::Disconnecting if ours => {
                // Only a disconnect we asked for is waiting on this
                let requested = self.queue.take_matching(&event);
                if requested.is_none() {
                    debug!("Peripheral {} dropped the link", peripheral);
                }
                self.lose_link(peripheral);
                if let Some(in_flight) = requested {
                    in_flight.op.resolve_link_lost();
                }
            }
            _ => trace!("Ignoring redundant PeripheralDisconnected for {}", peripheral),
        }
    }

    /// Marks the link as down: observers hear about it first, then every
    /// listen and operation that depended on it ends
    fn lose_link(&mut self, peripheral: PeripheralId) {
        self.connected = None;
        self.state.transition(ConnectionState::Disconnected, None);
        self.listens.clear_non_restorable(&peripheral);

        if let Some(in_flight) = self.queue.take_in_flight_if(|op| op.depends_on(&peripheral)) {
            in_flight.op.resolve_link_lost();
        }
        for op in self.queue.drain_bound_to(&peripheral) {
            op.resolve_link_lost();
        }
    }

    async fn on_restoration_candidates(&mut self, peripheral: PeripheralId,
                                       characteristics: Vec<CharacteristicId>) {
        debug!("{} restoration candidate(s) for {}", characteristics.len(), peripheral);

        let restorer = self.restorer.clone();
        let decision = self.listens.begin_restoration(peripheral, characteristics, |c| {
                                        restorer.as_ref()
                                                .map_or(false, |restorer| restorer.can_restore(c))
                                    });

        for characteristic in decision.declined {
            debug!("Ending subscription to {} which won't be restored", characteristic);
            self.end_subscription_silently(peripheral, characteristic).await;
        }
        if !decision.accepted.is_empty() {
            self.restore_deadline = Some(Instant::now() + self.timeouts.restore_window);
        }
    }

    fn close_restore_window_if_settled(&mut self) {
        if !self.listens.has_candidates() {
            self.restore_deadline = None;
        }
    }

    /// Unsubscribes without an operation waiting on the result
    async fn end_subscription_silently(&mut self, peripheral: PeripheralId,
                                       characteristic: CharacteristicId) {
        match self.backend.unsubscribe(&peripheral, &characteristic).await {
            Ok(()) => self.listens.expect_ack(characteristic),
            Err(err) => {
                log::error!("Failed to end subscription to {}: {:?}", characteristic, err)
            }
        }
    }

    async fn stop_scan(&mut self, scan: Option<OperationId>) {
        if let Some(id) = scan {
            if self.queue.remove_pending(id).is_some() {
                trace!("Scan {} dropped before it started", id);
                return;
            }
        }

        let stopped = self.queue.take_in_flight_if(|op| match (scan, &op.kind) {
                                    (Some(id), OperationKind::Scan { .. }) => op.id == id,
                                    (Some(_), _) => false,
                                    (None, kind) => {
                                        matches!(kind,
                                                 OperationKind::Scan { .. }
                                                 | OperationKind::Connect {
                                                     step: ConnectStep::Scanning,
                                                     ..
                                                 })
                                    }
                                });
        let in_flight = match stopped {
            Some(in_flight) => in_flight,
            None => {
                trace!("No scan in flight to stop");
                return;
            }
        };

        self.end_scanning().await;
        if let OperationKind::Scan { .. } = in_flight.op.kind {
            trace!("Scan {} stopped", in_flight.op.id);
        } else {
            in_flight.op.fail(Error::Cancelled);
        }
    }

    async fn end_scanning(&mut self) {
        if let Err(err) = self.backend.stop_scanning().await {
            log::error!("Failed to stop scanning: {:?}", err);
        }
        if self.state.state() == ConnectionState::Scanning {
            self.state.transition(ConnectionState::Disconnected, None);
        }
    }

    async fn on_deadline(&mut self) {
        let now = Instant::now();

        if self.restore_deadline.map_or(false, |deadline| deadline <= now) {
            self.restore_deadline = None;
            for (peripheral, characteristic) in self.listens.expire_candidates() {
                debug!("Restored subscription to {} was never claimed", characteristic);
                self.end_subscription_silently(peripheral, characteristic).await;
            }
        }

        if self.queue.deadline().map_or(false, |deadline| deadline <= now) {
            if let Some(in_flight) = self.queue.take_in_flight() {
                self.on_timeout(in_flight.op).await;
            }
        }

        self.pump().await;
    }

    async fn on_timeout(&mut self, op: QueuedOperation) {
        let QueuedOperation { id, bound_to, kind } = op;
        match kind {
            OperationKind::Scan { .. } => {
                trace!("Scan {} finished", id);
                self.end_scanning().await;
            }
            OperationKind::Connect { step, resolve, .. } => {
                debug!("Connect {} timed out", id);
                match step {
                    ConnectStep::Idle => {}
                    ConnectStep::Scanning => self.end_scanning().await,
                    ConnectStep::AwaitConnected(p) => {
                        if let Err(err) = self.backend.peripheral_disconnect(&p).await {
                            log::error!("Failed to cancel connection to {}: {:?}", p, err);
                        }
                        self.abandoned = Some(p);
                        if self.state.state() == ConnectionState::Connecting {
                            self.state.transition(ConnectionState::Disconnected, None);
                        }
                    }
                    ConnectStep::AwaitServices(peripheral)
                    | ConnectStep::AwaitCharacteristics { peripheral, .. } => {
                        self.abort_connect(peripheral.id()).await;
                    }
                }
                resolve(Err(Error::ConnectionTimeout));
            }
            OperationKind::Disconnect { resolve, .. } => {
                if let Some(p) = bound_to {
                    warn!("Disconnect from {} timed out, dropping the link locally", p);
                    self.lose_link(p);
                }
                resolve(Err(Error::OperationTimeout));
            }
            OperationKind::Read { characteristic, resolve } => {
                debug!("Read {} of {} timed out", id, characteristic);
                self.cancel_pending(bound_to).await;
                resolve(Err(Error::OperationTimeout));
            }
            OperationKind::Write { characteristic, resolve, .. } => {
                debug!("Write {} to {} timed out", id, characteristic);
                self.cancel_pending(bound_to).await;
                resolve(Err(Error::OperationTimeout));
            }
            OperationKind::Listen { characteristic, resolve, .. } => {
                debug!("Listen {} to {} timed out", id, characteristic);
                self.listens.remove(&characteristic);
                self.cancel_pending(bound_to).await;
                // The subscribe may still go through, so the adapter is
                // left unsubscribed either way
                if let Some(p) = bound_to {
                    self.end_subscription_silently(p, characteristic).await;
                }
                resolve(Err(Error::OperationTimeout));
            }
            OperationKind::EndListen { characteristic, resolve } => {
                debug!("End listen {} to {} timed out", id, characteristic);
                self.cancel_pending(bound_to).await;
                resolve(Err(Error::OperationTimeout));
            }
        }
    }

    async fn cancel_pending(&mut self, peripheral: Option<PeripheralId>) {
        if let Some(peripheral) = peripheral {
            match self.backend.cancel_pending(&peripheral).await {
                Ok(()) | Err(Error::Unsupported) => {}
                Err(err) => {
                    log::error!("Failed to cancel pending request for {}: {:?}", peripheral, err)
                }
            }
        }
    }

    /// Resolves everything still outstanding and leaves the adapter idle
    async fn shutdown(&mut self) {
        if let Some(in_flight) = self.queue.take_in_flight() {
            in_flight.op.fail(Error::SessionClosed);
        }
        for op in self.queue.drain_pending() {
            op.fail(Error::SessionClosed);
        }

        match self.state.state() {
            ConnectionState::Scanning => {
                if let Err(err) = self.backend.stop_scanning().await {
                    log::error!("Failed to stop scanning: {:?}", err);
                }
            }
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Disconnecting => {
                if let Some(p) = self.state.peripheral() {
                    if let Err(err) = self.backend.peripheral_disconnect(&p).await {
                        log::error!("Failed to disconnect {}: {:?}", p, err);
                    }
                }
            }
            ConnectionState::PoweredOff | ConnectionState::Disconnected => {}
        }
        trace!("Finished session driver task");
    }
}
