use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use log::trace;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream, WatchStream};

use crate::characteristic::WriteType;
use crate::codec::{Decode, Encode};
use crate::driver::{Input, Request, SessionDriver, Timeouts};
use crate::fake::{FakeAdapter, FakeBackend};
use crate::identifier::{CharacteristicId, PeripheralId, ServiceId};
use crate::listen::{ListenCallback, ListenRestorer};
use crate::observer::{weak_observer, ConnectionObserver};
use crate::peripheral::{DiscoveredPeripheral, Peripheral};
use crate::queue::{self, Completion, ConnectStep, ConnectTarget, OperationId, OperationKind,
                   QueuedOperation, Resolver};
use crate::state::{ConnectionState, ConnectionStateMachine};
use crate::{BackendEvent, Error, Event, Result};

/// The hardware adapter a session drives
///
/// Every command only *initiates* the request: a successful result means
/// the adapter accepted it, and the outcome is reported later by sending a
/// [`BackendEvent`] through the [`BackendBus`] the backend was created with.
/// The session guarantees that at most one command expecting a response is
/// outstanding at a time.
///
/// Note the entry points provide the full peripheral -> characteristic
/// identity so that backends don't need to track relationships between
/// handles themselves.
#[async_trait]
pub trait BackendSession: Send + Sync + fmt::Debug {
    async fn start_scanning(&self, filter: &Filter) -> Result<()>;
    async fn stop_scanning(&self) -> Result<()>;

    async fn peripheral_connect(&self, peripheral: &PeripheralId) -> Result<()>;

    /// Disconnects the peripheral, also used to cancel a pending connection
    /// attempt
    async fn peripheral_disconnect(&self, peripheral: &PeripheralId) -> Result<()>;

    async fn discover_services(&self, peripheral: &PeripheralId) -> Result<()>;
    async fn discover_characteristics(&self, peripheral: &PeripheralId, service: &ServiceId)
                                      -> Result<()>;

    async fn read_value(&self, peripheral: &PeripheralId, characteristic: &CharacteristicId)
                        -> Result<()>;
    async fn write_value(&self, peripheral: &PeripheralId, characteristic: &CharacteristicId,
                         write_type: WriteType, data: &[u8])
                         -> Result<()>;

    async fn subscribe(&self, peripheral: &PeripheralId, characteristic: &CharacteristicId)
                       -> Result<()>;
    async fn unsubscribe(&self, peripheral: &PeripheralId, characteristic: &CharacteristicId)
                         -> Result<()>;

    /// Abandons whatever read or write is outstanding for the peripheral
    /// after it timed out. Backends that can't do this leave the default.
    async fn cancel_pending(&self, _peripheral: &PeripheralId) -> Result<()> {
        Err(Error::Unsupported)
    }
}

/// The channel a backend reports its events through
#[derive(Clone, Debug)]
pub struct BackendBus {
    inputs: mpsc::UnboundedSender<Input>,
}

impl BackendBus {
    pub fn send(&self, event: BackendEvent) -> Result<()> {
        self.inputs
            .send(Input::Backend(event))
            .map_err(|_| Error::SessionClosed)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    pub(crate) service_ids: HashSet<ServiceId>,
}

impl Filter {
    pub fn new() -> Self {
        Self {
            service_ids: HashSet::new(),
        }
    }

    pub fn add_service(&mut self, service: ServiceId) -> &mut Self {
        self.service_ids.insert(service);

        self
    }

    pub fn service_ids(&self) -> impl Iterator<Item = &ServiceId> {
        self.service_ids.iter()
    }

    /// An empty filter matches everything, otherwise a peripheral must
    /// advertise at least one of the filter's services
    pub fn matches(&self, peripheral: &DiscoveredPeripheral) -> bool {
        self.service_ids.is_empty()
        || self.service_ids
               .iter()
               .any(|service| peripheral.has_service_id(service.uuid()))
    }
}

pub struct SessionConfig {
    connect_timeout: Duration,
    scan_timeout: Option<Duration>,
    operation_timeout: Duration,
    restore_window: Duration,
    listen_restorer: Option<Arc<dyn ListenRestorer>>,
}

impl SessionConfig {
    pub fn new() -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_secs(15),
            scan_timeout: Some(Duration::from_secs(10)),
            operation_timeout: Duration::from_secs(10),
            restore_window: Duration::from_secs(30),
            listen_restorer: None,
        }
    }

    /// Bounds the whole connect flow, including service and characteristic
    /// discovery
    pub fn set_connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.connect_timeout = timeout;
        self
    }

    /// How long a scan runs before it stops by itself, or `None` to scan
    /// until explicitly stopped
    pub fn set_scan_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.scan_timeout = timeout;
        self
    }

    /// Bounds reads, writes, listen/end-listen and disconnect
    pub fn set_operation_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.operation_timeout = timeout;
        self
    }

    /// How long restored subscriptions wait to be claimed before they are
    /// ended
    pub fn set_restore_window(&mut self, window: Duration) -> &mut Self {
        self.restore_window = window;
        self
    }

    /// Restoration candidates are reported before the application can make
    /// any request, so a restorer that should see them has to be set here
    pub fn set_listen_restorer(&mut self, restorer: Arc<dyn ListenRestorer>) -> &mut Self {
        self.listen_restorer = Some(restorer);
        self
    }

    /// Starts a session, creating the backend via `make_backend` with the
    /// bus it should report events through
    pub async fn start<B, F>(self, make_backend: F) -> Result<Session>
    where
        B: BackendSession + 'static,
        F: FnOnce(BackendBus) -> Result<B>,
    {
        Session::start(self, make_backend).await
    }

    /// Starts a session driving an in-memory fake adapter, returning the
    /// controller for that adapter alongside the session
    pub async fn start_fake(self) -> Result<(Session, FakeAdapter)> {
        let mut adapter = None;
        let session = Session::start(self, |bus| {
                          let (backend, controller) = FakeBackend::new(bus);
                          adapter = Some(controller);
                          Ok(backend)
                      }).await?;
        match adapter {
            Some(adapter) => Ok((session, adapter)),
            None => Err(Error::SessionClosed),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
}
impl PartialEq for Session {
    fn eq(&self, other: &Session) -> bool {
        Arc::<SessionInner>::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Session {}
impl Hash for Session {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::<SessionInner>::as_ptr(&self.inner), state);
    }
}
impl Deref for Session {
    type Target = SessionInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

// public for the sake of implementing Deref for ergonomics but since
// no members are public and there's no public API for SessionInner
// we don't really leak anything
#[derive(Debug)]
pub struct SessionInner {
    // Requests for the driver task, which owns all queue, connection and
    // listen state. The backend holds a clone of this (via its BackendBus)
    // so hardware events and requests are processed in a single order.
    inputs: mpsc::UnboundedSender<Input>,
    next_operation_id: AtomicU64,

    // The public-facing event stream
    event_bus: broadcast::Sender<Event>,
    state: watch::Receiver<ConnectionState>,

    // Peripherals seen while scanning, maintained by the driver task
    peripherals: Arc<DashMap<PeripheralId, DiscoveredPeripheral>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        // The backend keeps the input channel open, so the driver needs to
        // be told explicitly
        let _ = self.inputs.send(Input::Shutdown);
    }
}

/// The peripherals discovered by [`Session::scan`]
///
/// The stream ends once the scan stops, whether because of
/// [`Session::stop_scan`], the scan timeout or the adapter powering off.
/// Failures are reported as a final `Err` item. Dropping the stream stops
/// the scan.
#[must_use = "the scan stops as soon as the stream is dropped"]
pub struct ScanStream {
    id: OperationId,
    inner: UnboundedReceiverStream<Result<DiscoveredPeripheral>>,
    inputs: mpsc::UnboundedSender<Input>,
}

impl ScanStream {
    pub fn id(&self) -> OperationId {
        self.id
    }
}

impl Drop for ScanStream {
    fn drop(&mut self) {
        // Only this scan is stopped; a scan that already ended is ignored
        let _ = self.inputs.send(Input::Request(Request::StopScan(Some(self.id))));
    }
}

impl Stream for ScanStream {
    type Item = Result<DiscoveredPeripheral>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Session {
    async fn start<B, F>(config: SessionConfig, make_backend: F) -> Result<Self>
    where
        B: BackendSession + 'static,
        F: FnOnce(BackendBus) -> Result<B>,
    {
        let (broadcast_sender, _) = broadcast::channel(16);
        let (state_tx, state_rx) = watch::channel(ConnectionState::PoweredOff);

        // The backend is responsible for feeding the same input channel
        // that carries application requests to the driver
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let backend = make_backend(BackendBus { inputs: inputs_tx.clone() })?;

        let peripherals = Arc::new(DashMap::new());
        let timeouts = Timeouts {
            connect: config.connect_timeout,
            scan: config.scan_timeout,
            operation: config.operation_timeout,
            restore_window: config.restore_window,
        };
        let driver = SessionDriver::new(Box::new(backend),
                                        timeouts,
                                        ConnectionStateMachine::new(broadcast_sender.clone(),
                                                                    state_tx),
                                        config.listen_restorer,
                                        peripherals.clone());
        tokio::spawn(driver.run(inputs_rx));

        Ok(Session { inner: Arc::new(SessionInner { inputs: inputs_tx,
                                                    next_operation_id: AtomicU64::new(0),
                                                    event_bus: broadcast_sender,
                                                    state: state_rx,
                                                    peripherals }) })
    }

    fn next_operation_id(&self) -> OperationId {
        OperationId(self.next_operation_id.fetch_add(1, Ordering::Relaxed))
    }

    fn send(&self, request: Request) {
        // If the driver is gone the request is dropped here, which drops
        // any resolver it carries and so reports SessionClosed
        if self.inputs.send(Input::Request(request)).is_err() {
            trace!("Dropping request for a closed session");
        }
    }

    fn submit<T, F>(&self, make_kind: F) -> Completion<T>
    where
        T: Send + 'static,
        F: FnOnce(Resolver<T>) -> OperationKind,
    {
        let id = self.next_operation_id();
        let (resolve, completion) = queue::completion(id);
        self.send(Request::Enqueue(QueuedOperation::new(id, make_kind(resolve))));
        completion
    }

    /// Starts scanning for peripherals matching `filter`
    ///
    /// Like every other operation the scan is queued, so it only starts once
    /// everything enqueued before it has finished.
    pub fn scan(&self, filter: Filter) -> ScanStream {
        let id = self.next_operation_id();
        let (discovered, rx) = mpsc::unbounded_channel();
        let op = QueuedOperation::new(id, OperationKind::Scan { filter,
                                                                discovered,
                                                                started: false });
        self.send(Request::Enqueue(op));
        ScanStream { id,
                     inner: UnboundedReceiverStream::new(rx),
                     inputs: self.inputs.clone() }
    }

    /// Stops the scan in flight, if any. Queued operations are unaffected.
    pub fn stop_scan(&self) {
        self.send(Request::StopScan(None));
    }

    /// Scans until a peripheral matching `filter` is found and connects to it
    pub fn scan_and_connect(&self, filter: Filter) -> Completion<Peripheral> {
        self.submit(|resolve| OperationKind::Connect { target: ConnectTarget::FirstMatching(filter),
                                                       step: ConnectStep::Idle,
                                                       resolve })
    }

    /// Connects to `peripheral`, resolving once all of its services and
    /// characteristics have been discovered
    pub fn connect(&self, peripheral: PeripheralId) -> Completion<Peripheral> {
        self.submit(|resolve| OperationKind::Connect { target: ConnectTarget::Peripheral(peripheral),
                                                       step: ConnectStep::Idle,
                                                       resolve })
    }

    /// Disconnects the connected peripheral
    ///
    /// If the link drops for any other reason while this is queued or in
    /// flight it still resolves `Ok`, since the peripheral is disconnected
    /// either way.
    pub fn disconnect(&self) -> Completion<()> {
        self.submit(|resolve| OperationKind::Disconnect { started: false, resolve })
    }

    pub fn read(&self, characteristic: CharacteristicId) -> Completion<Vec<u8>> {
        self.submit(|resolve| OperationKind::Read { characteristic, resolve })
    }

    /// Reads and decodes a value. A decode failure only fails this read.
    pub fn read_as<T>(&self, characteristic: CharacteristicId) -> Completion<T>
    where
        T: Decode + Send + 'static,
    {
        let id = self.next_operation_id();
        let (resolve_decoded, completion) = queue::completion::<T>(id);
        let resolve: Resolver<Vec<u8>> = Box::new(move |result: Result<Vec<u8>>| {
            resolve_decoded(result.and_then(|bytes| T::from_bytes(&bytes)))
        });
        self.send(Request::Enqueue(QueuedOperation::new(id, OperationKind::Read { characteristic,
                                                                                  resolve })));
        completion
    }

    pub fn write(&self, characteristic: CharacteristicId, data: Vec<u8>, write_type: WriteType)
                 -> Completion<()> {
        self.submit(|resolve| OperationKind::Write { characteristic,
                                                     write_type,
                                                     data,
                                                     resolve })
    }

    /// Encodes and writes a value. If encoding fails nothing is queued.
    pub fn write_value<T>(&self, characteristic: CharacteristicId, value: &T,
                          write_type: WriteType)
                          -> Completion<()>
    where
        T: Encode + ?Sized,
    {
        match value.to_bytes() {
            Ok(data) => self.write(characteristic, data, write_type),
            Err(err) => Completion::failed(self.next_operation_id(), err),
        }
    }

    /// Subscribes to value changes of `characteristic`
    ///
    /// `callback` is called, in order, with every value update until
    /// `end_listen` is called or the peripheral disconnects. It runs on the
    /// session's task so it should return quickly.
    pub fn listen<F>(&self, characteristic: CharacteristicId, callback: F) -> Completion<()>
    where
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        let callback: ListenCallback = Box::new(callback);
        self.submit(|resolve| OperationKind::Listen { characteristic,
                                                      callback: Some(callback),
                                                      restore_only: false,
                                                      resolve })
    }

    /// Like `listen` but decodes each update, passing decode failures to
    /// the callback instead of ending the subscription
    pub fn listen_as<T, F>(&self, characteristic: CharacteristicId, mut callback: F)
                           -> Completion<()>
    where
        T: Decode + 'static,
        F: FnMut(Result<T>) + Send + 'static,
    {
        self.listen(characteristic, move |bytes| callback(T::from_bytes(&bytes)))
    }

    /// Ends a subscription. Ending a subscription that doesn't exist
    /// succeeds without doing anything.
    ///
    /// Losing the link while this is queued or in flight also resolves it
    /// `Ok` rather than with `Error::Disconnected`: every listen ends with
    /// the link.
    pub fn end_listen(&self, characteristic: CharacteristicId) -> Completion<()> {
        self.submit(|resolve| OperationKind::EndListen { characteristic, resolve })
    }

    /// Reattaches a callback to a subscription that survived a relaunch,
    /// first delivering any updates that arrived in the meantime
    ///
    /// Fails with `Error::NotListening` unless the `ListenRestorer` accepted
    /// `characteristic`.
    pub fn restore_listen<F>(&self, characteristic: CharacteristicId, callback: F)
                             -> Completion<()>
    where
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        let callback: ListenCallback = Box::new(callback);
        self.submit(|resolve| OperationKind::Listen { characteristic,
                                                      callback: Some(callback),
                                                      restore_only: true,
                                                      resolve })
    }

    pub async fn is_listening(&self, characteristic: CharacteristicId) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::IsListening(characteristic, tx));
        rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Cancels an operation that hasn't been dispatched yet, resolving it
    /// with `Error::Cancelled`. Operations already in flight are left to
    /// finish (or time out).
    pub fn cancel(&self, id: OperationId) {
        self.send(Request::Cancel(id));
    }

    /// Resolves once every request made, and every backend event sent,
    /// before this call has been processed
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Flush(tx));
        rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Registers an observer for availability and connection transitions
    ///
    /// Only a weak reference is kept: the observer is forgotten as soon as
    /// the application drops it.
    pub fn register_observer<O>(&self, observer: &Arc<O>)
    where
        O: ConnectionObserver + 'static,
    {
        self.send(Request::RegisterObserver(weak_observer(observer)));
    }

    pub fn unregister_observer<O>(&self, observer: &Arc<O>)
    where
        O: ConnectionObserver + 'static,
    {
        self.send(Request::UnregisterObserver(weak_observer(observer)));
    }

    /// Replaces (or with `None` removes) the listen restorer
    pub fn set_listen_restorer(&self, restorer: Option<Arc<dyn ListenRestorer>>) {
        self.send(Request::SetListenRestorer(restorer));
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_available(&self) -> bool {
        self.state().is_available()
    }

    /// The current connection state followed by every change to it
    ///
    /// Intermediate states may be skipped by a slow consumer, use
    /// `events()` or an observer to see every transition.
    pub fn state_changes(&self) -> impl Stream<Item = ConnectionState> {
        WatchStream::new(self.state.clone())
    }

    /// Returns a stream of availability and connection events
    pub fn events(&self) -> impl Stream<Item = Event> {
        let receiver = self.event_bus.subscribe();
        BroadcastStream::new(receiver).filter_map(|x| async move {
                                          if let Ok(x) = x {
                                              Some(x)
                                          } else {
                                              None
                                          }
                                      })
    }

    /// Every peripheral seen while scanning during this session
    pub fn peripherals(&self) -> Vec<DiscoveredPeripheral> {
        self.peripherals
            .iter()
            .map(|item| item.value().clone())
            .collect()
    }

    pub fn peripheral(&self, id: &PeripheralId) -> Option<DiscoveredPeripheral> {
        self.peripherals.get(id).map(|item| item.value().clone())
    }
}
