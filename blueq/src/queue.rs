use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt;
use log::trace;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::characteristic::WriteType;
use crate::identifier::{CharacteristicId, PeripheralId, ServiceId};
use crate::listen::ListenCallback;
use crate::peripheral::{DiscoveredPeripheral, Peripheral};
use crate::session::Filter;
use crate::{BackendEvent, Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub(crate) u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) type Resolver<T> = Box<dyn FnOnce(Result<T>) + Send>;

/// Creates a resolver + completion pair for a new operation
pub(crate) fn completion<T: Send + 'static>(id: OperationId) -> (Resolver<T>, Completion<T>) {
    let (tx, rx) = oneshot::channel();
    let resolver: Resolver<T> = Box::new(move |result| {
        // The application may have lost interest by dropping the
        // Completion, which isn't an error
        let _ = tx.send(result);
    });
    (resolver, Completion { id, rx })
}

/// The eventual result of an enqueued operation
///
/// The operation is queued as soon as the call that returned the
/// `Completion` returns; awaiting it is only needed to observe the result.
/// Dropping a `Completion` does not cancel the operation, use
/// `Session::cancel` for that.
#[must_use = "the operation runs regardless but its result is only available by awaiting this"]
#[derive(Debug)]
pub struct Completion<T> {
    id: OperationId,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Completion<T> {
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// A completion for a call that failed before it could be queued
    pub(crate) fn failed(id: OperationId, error: Error) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Completion { id, rx }
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx.poll_unpin(cx).map(|result| match result {
            Ok(result) => result,
            Err(_) => Err(Error::SessionClosed),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConnectTarget {
    Peripheral(PeripheralId),
    FirstMatching(Filter),
}

/// Where a connect (or scan-then-connect) flow currently is
#[derive(Debug)]
pub(crate) enum ConnectStep {
    Idle,
    Scanning,
    AwaitConnected(PeripheralId),
    AwaitServices(Peripheral),
    AwaitCharacteristics {
        peripheral: Peripheral,
        current: ServiceId,
        remaining: VecDeque<ServiceId>,
    },
}

pub(crate) enum OperationKind {
    Scan {
        filter: Filter,
        discovered: mpsc::UnboundedSender<Result<DiscoveredPeripheral>>,
        started: bool,
    },
    Connect {
        target: ConnectTarget,
        step: ConnectStep,
        resolve: Resolver<Peripheral>,
    },
    Disconnect {
        started: bool,
        resolve: Resolver<()>,
    },
    Read {
        characteristic: CharacteristicId,
        resolve: Resolver<Vec<u8>>,
    },
    Write {
        characteristic: CharacteristicId,
        write_type: WriteType,
        data: Vec<u8>,
        resolve: Resolver<()>,
    },
    Listen {
        characteristic: CharacteristicId,
        callback: Option<ListenCallback>,
        // Only attach to a restoration candidate, never subscribe afresh
        restore_only: bool,
        resolve: Resolver<()>,
    },
    EndListen {
        characteristic: CharacteristicId,
        resolve: Resolver<()>,
    },
}

impl OperationKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            OperationKind::Scan { .. } => "scan",
            OperationKind::Connect { target: ConnectTarget::FirstMatching(_), .. } => {
                "scan-and-connect"
            }
            OperationKind::Connect { .. } => "connect",
            OperationKind::Disconnect { .. } => "disconnect",
            OperationKind::Read { .. } => "read",
            OperationKind::Write { .. } => "write",
            OperationKind::Listen { restore_only: true, .. } => "restore-listen",
            OperationKind::Listen { .. } => "listen",
            OperationKind::EndListen { .. } => "end-listen",
        }
    }

    /// GATT operations act on whatever peripheral is connected; scans,
    /// connects and restored listens don't depend on an existing link
    pub(crate) fn needs_link(&self) -> bool {
        !matches!(self,
                  OperationKind::Scan { .. }
                  | OperationKind::Connect { .. }
                  | OperationKind::Listen { restore_only: true, .. })
    }
}

/// The hardware event an in-flight operation is waiting for
///
/// Only an event matching this key may advance the operation, and it
/// advances by exactly one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Expectation {
    Discovery,
    Connected(PeripheralId),
    ServicesDiscovered(PeripheralId),
    CharacteristicsDiscovered(PeripheralId, ServiceId),
    ValueRead(PeripheralId, CharacteristicId),
    ValueWritten(PeripheralId, CharacteristicId),
    NotificationState(PeripheralId, CharacteristicId, bool),
    Disconnected(PeripheralId),
    // Scans run until stopped, nothing resolves them
    StopScan,
}

impl Expectation {
    pub(crate) fn matches(&self, event: &BackendEvent) -> bool {
        match (self, event) {
            (Expectation::Discovery, BackendEvent::PeripheralDiscovered { .. }) => true,
            (Expectation::Connected(p), BackendEvent::PeripheralConnected { peripheral }) => {
                p == peripheral
            }
            (Expectation::ServicesDiscovered(p),
             BackendEvent::ServicesDiscovered { peripheral, .. }) => p == peripheral,
            (Expectation::CharacteristicsDiscovered(p, s),
             BackendEvent::CharacteristicsDiscovered { peripheral, service, .. }) => {
                p == peripheral && s == service
            }
            (Expectation::ValueRead(p, c),
             BackendEvent::ValueRead { peripheral, characteristic, .. }) => {
                p == peripheral && c == characteristic
            }
            (Expectation::ValueWritten(p, c),
             BackendEvent::ValueWritten { peripheral, characteristic, .. }) => {
                p == peripheral && c == characteristic
            }
            (Expectation::NotificationState(p, c, enabled),
             BackendEvent::NotificationStateChanged { peripheral,
                                                      characteristic,
                                                      enabled: event_enabled,
                                                      error }) => {
                // A failed request may report the state it was left in
                // rather than the state that was asked for
                p == peripheral && c == characteristic
                && (enabled == event_enabled || error.is_some())
            }
            (Expectation::Disconnected(p), BackendEvent::PeripheralDisconnected { peripheral, .. }) => {
                p == peripheral
            }
            _ => false,
        }
    }
}

pub(crate) struct QueuedOperation {
    pub(crate) id: OperationId,

    // The peripheral whose link this operation depends on, if any. Set when
    // a GATT operation is enqueued (or dispatched) while connected.
    pub(crate) bound_to: Option<PeripheralId>,

    pub(crate) kind: OperationKind,
}

impl fmt::Debug for QueuedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedOperation")
            .field("id", &self.id)
            .field("kind", &self.kind.name())
            .field("bound_to", &self.bound_to)
            .finish()
    }
}

impl QueuedOperation {
    pub(crate) fn new(id: OperationId, kind: OperationKind) -> Self {
        Self { id, bound_to: None, kind }
    }

    pub(crate) fn is_bound_to(&self, peripheral: &PeripheralId) -> bool {
        self.bound_to.as_ref() == Some(peripheral)
    }

    /// Whether losing the link to `peripheral` ends this operation, either
    /// because it was bound to it or because it's a connect flow that
    /// has gotten as far as (or is waiting for) that link
    pub(crate) fn depends_on(&self, peripheral: &PeripheralId) -> bool {
        if self.is_bound_to(peripheral) {
            return true;
        }
        match &self.kind {
            OperationKind::Connect { step, .. } => match step {
                ConnectStep::AwaitConnected(p) => p == peripheral,
                ConnectStep::AwaitServices(p) => p.id() == *peripheral,
                ConnectStep::AwaitCharacteristics { peripheral: p, .. } => {
                    p.id() == *peripheral
                }
                ConnectStep::Idle | ConnectStep::Scanning => false,
            },
            _ => false,
        }
    }

    /// Resolves an operation whose peripheral went away. For a disconnect
    /// or end-listen that is the outcome it asked for.
    pub(crate) fn resolve_link_lost(self) {
        match self.kind {
            OperationKind::Disconnect { resolve, .. } => resolve(Ok(())),
            OperationKind::EndListen { resolve, .. } => resolve(Ok(())),
            _ => self.fail(Error::Disconnected),
        }
    }

    /// The event this operation is waiting for in its current step
    pub(crate) fn expectation(&self) -> Option<Expectation> {
        let peripheral = self.bound_to;
        match &self.kind {
            OperationKind::Scan { .. } => Some(Expectation::StopScan),
            OperationKind::Connect { step, .. } => match step {
                ConnectStep::Idle => None,
                ConnectStep::Scanning => Some(Expectation::Discovery),
                ConnectStep::AwaitConnected(p) => Some(Expectation::Connected(*p)),
                ConnectStep::AwaitServices(peripheral) => {
                    Some(Expectation::ServicesDiscovered(peripheral.id()))
                }
                ConnectStep::AwaitCharacteristics { peripheral, current, .. } => {
                    Some(Expectation::CharacteristicsDiscovered(peripheral.id(), *current))
                }
            },
            OperationKind::Disconnect { started, .. } => {
                peripheral.filter(|_| *started).map(Expectation::Disconnected)
            }
            OperationKind::Read { characteristic, .. } => {
                peripheral.map(|p| Expectation::ValueRead(p, *characteristic))
            }
            OperationKind::Write { characteristic, .. } => {
                peripheral.map(|p| Expectation::ValueWritten(p, *characteristic))
            }
            OperationKind::Listen { characteristic, .. } => {
                peripheral.map(|p| Expectation::NotificationState(p, *characteristic, true))
            }
            OperationKind::EndListen { characteristic, .. } => {
                peripheral.map(|p| Expectation::NotificationState(p, *characteristic, false))
            }
        }
    }

    /// Resolves the operation with `error`, consuming it
    pub(crate) fn fail(self, error: Error) {
        trace!("Operation {} ({}) failed: {}", self.id, self.kind.name(), error);
        match self.kind {
            OperationKind::Scan { discovered, .. } => {
                let _ = discovered.send(Err(error));
            }
            OperationKind::Connect { resolve, .. } => resolve(Err(error)),
            OperationKind::Disconnect { resolve, .. } => resolve(Err(error)),
            OperationKind::Read { resolve, .. } => resolve(Err(error)),
            OperationKind::Write { resolve, .. } => resolve(Err(error)),
            OperationKind::Listen { resolve, .. } => resolve(Err(error)),
            OperationKind::EndListen { resolve, .. } => resolve(Err(error)),
        }
    }
}

/// An operation that has been dispatched and is waiting on the adapter
#[derive(Debug)]
pub(crate) struct InFlight {
    pub(crate) op: QueuedOperation,
    pub(crate) deadline: Option<Instant>,
}

/// Strict FIFO of pending operations plus the (at most one) operation in
/// flight
#[derive(Debug, Default)]
pub(crate) struct OperationQueue {
    pending: VecDeque<QueuedOperation>,
    in_flight: Option<InFlight>,
}

impl OperationQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, op: QueuedOperation) {
        trace!("Enqueued operation {} ({}), {} already pending",
               op.id, op.kind.name(), self.pending.len());
        self.pending.push_back(op);
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Takes the head of the pending list, but only if nothing is in flight
    pub(crate) fn next(&mut self) -> Option<QueuedOperation> {
        if self.in_flight.is_some() {
            return None;
        }
        self.pending.pop_front()
    }

    pub(crate) fn set_in_flight(&mut self, op: QueuedOperation, deadline: Option<Instant>) {
        debug_assert!(self.in_flight.is_none(), "a second operation was put in flight");
        self.in_flight = Some(InFlight { op, deadline });
    }

    pub(crate) fn in_flight(&self) -> Option<&InFlight> {
        self.in_flight.as_ref()
    }

    pub(crate) fn take_in_flight(&mut self) -> Option<InFlight> {
        self.in_flight.take()
    }

    pub(crate) fn take_in_flight_if(&mut self, predicate: impl FnOnce(&QueuedOperation) -> bool)
                                    -> Option<InFlight> {
        match &self.in_flight {
            Some(in_flight) if predicate(&in_flight.op) => self.in_flight.take(),
            _ => None,
        }
    }

    /// Takes the in-flight operation if it's waiting for `event`
    pub(crate) fn take_matching(&mut self, event: &BackendEvent) -> Option<InFlight> {
        self.take_in_flight_if(|op| {
                op.expectation()
                  .map_or(false, |expectation| expectation.matches(event))
            })
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref().and_then(|in_flight| in_flight.deadline)
    }

    /// Removes a pending (not yet dispatched) operation
    pub(crate) fn remove_pending(&mut self, id: OperationId) -> Option<QueuedOperation> {
        let index = self.pending.iter().position(|op| op.id == id)?;
        self.pending.remove(index)
    }

    /// Removes every pending operation bound to `peripheral`, preserving the
    /// order of both the removed and the remaining operations
    pub(crate) fn drain_bound_to(&mut self, peripheral: &PeripheralId) -> Vec<QueuedOperation> {
        let mut removed = vec![];
        let mut kept = VecDeque::with_capacity(self.pending.len());
        for op in self.pending.drain(..) {
            if op.is_bound_to(peripheral) {
                removed.push(op);
            } else {
                kept.push_back(op);
            }
        }
        self.pending = kept;
        removed
    }

    pub(crate) fn drain_pending(&mut self) -> Vec<QueuedOperation> {
        self.pending.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::PeripheralHandle;
    use uuid::Uuid;

    const SERVICE: ServiceId = ServiceId::from_u16(0x180D);
    const MEASUREMENT: CharacteristicId = CharacteristicId::from_u16(0x2A37, SERVICE);

    fn read_op(id: u64) -> (QueuedOperation, Completion<Vec<u8>>) {
        let id = OperationId(id);
        let (resolve, completion) = completion(id);
        (QueuedOperation::new(id, OperationKind::Read { characteristic: MEASUREMENT, resolve }),
         completion)
    }

    #[test]
    fn pending_operations_leave_in_fifo_order() {
        let mut queue = OperationQueue::new();
        for id in 0..3 {
            queue.push(read_op(id).0);
        }
        let order: Vec<u64> = std::iter::from_fn(|| queue.next()).map(|op| op.id.0).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn nothing_is_dispatched_while_an_operation_is_in_flight() {
        let mut queue = OperationQueue::new();
        let (first, _) = read_op(0);
        queue.push(read_op(1).0);
        queue.set_in_flight(first, None);
        assert!(queue.next().is_none());

        queue.take_in_flight();
        assert_eq!(queue.next().map(|op| op.id), Some(OperationId(1)));
    }

    #[tokio::test]
    async fn cancelled_pending_operation_resolves_alone() {
        let mut queue = OperationQueue::new();
        let (a, _a) = read_op(0);
        let (b, b_completion) = read_op(1);
        let (c, _c) = read_op(2);
        queue.push(a);
        queue.push(b);
        queue.push(c);

        queue.remove_pending(OperationId(1)).unwrap().fail(Error::Cancelled);
        assert!(matches!(b_completion.await, Err(Error::Cancelled)));
        assert_eq!(queue.pending_len(), 2);
        assert!(queue.remove_pending(OperationId(1)).is_none());
    }

    #[test]
    fn draining_bound_operations_keeps_the_rest_in_order() {
        let p = PeripheralId::new(PeripheralHandle(1), Uuid::new_v4());
        let mut queue = OperationQueue::new();
        for id in 0..4 {
            let (mut op, _) = read_op(id);
            if id % 2 == 0 {
                op.bound_to = Some(p);
            }
            queue.push(op);
        }
        let drained: Vec<u64> = queue.drain_bound_to(&p).into_iter().map(|op| op.id.0).collect();
        assert_eq!(drained, vec![0, 2]);
        let kept: Vec<u64> = queue.drain_pending().into_iter().map(|op| op.id.0).collect();
        assert_eq!(kept, vec![1, 3]);
    }

    #[test]
    fn expectations_match_on_peripheral_characteristic_and_kind() {
        let p = PeripheralId::new(PeripheralHandle(1), Uuid::new_v4());
        let other = PeripheralId::new(PeripheralHandle(2), Uuid::new_v4());
        let (mut op, _) = read_op(0);
        op.bound_to = Some(p);

        let expectation = op.expectation().unwrap();
        assert!(expectation.matches(&BackendEvent::ValueRead {
            peripheral: p,
            characteristic: MEASUREMENT,
            result: Ok(vec![60]),
        }));
        assert!(!expectation.matches(&BackendEvent::ValueRead {
            peripheral: other,
            characteristic: MEASUREMENT,
            result: Ok(vec![60]),
        }));
        assert!(!expectation.matches(&BackendEvent::ValueUpdated {
            peripheral: p,
            characteristic: MEASUREMENT,
            value: vec![60],
        }));
    }

    #[tokio::test]
    async fn dropped_resolver_reports_session_closed() {
        let (resolve, completion) = completion::<()>(OperationId(9));
        drop(resolve);
        assert!(matches!(completion.await, Err(Error::SessionClosed)));
    }
}
