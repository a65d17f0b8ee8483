use std::collections::{BTreeMap, HashMap};
use std::fmt;

use arrayvec::ArrayVec;
use log::{debug, trace, warn};

use crate::identifier::{CharacteristicId, PeripheralId};
use crate::{Error, Result};

/// How many value updates are held for a restored subscription while
/// waiting for the application to reattach a callback
///
/// The oldest updates are kept; anything arriving once the buffer is full is
/// dropped.
pub const RESTORE_BUFFER_CAPACITY: usize = 16;

pub type ListenCallback = Box<dyn FnMut(Vec<u8>) + Send>;

/// Decides which subscriptions that were active when the process was
/// suspended should survive a relaunch
///
/// Returning `true` is a promise that the application will shortly call
/// `Session::restore_listen` (or `Session::listen`) for that characteristic.
/// Restoration is strictly opt-in: without a restorer every candidate is
/// ended.
pub trait ListenRestorer: Send + Sync {
    fn can_restore(&self, characteristic: &CharacteristicId) -> bool;
}

enum ListenEntry {
    Active {
        peripheral: PeripheralId,
        callback: ListenCallback,
        // Claimed from a restoration candidate, so the adapter holds the
        // subscription even though no connect was ever made for it
        restored: bool,
    },

    // A subscription carried over from before a relaunch that the restorer
    // accepted but that has no callback yet
    Candidate {
        peripheral: PeripheralId,
        buffer: ArrayVec<Vec<u8>, RESTORE_BUFFER_CAPACITY>,
    },
}

impl ListenEntry {
    fn peripheral(&self) -> PeripheralId {
        match self {
            ListenEntry::Active { peripheral, .. } => *peripheral,
            ListenEntry::Candidate { peripheral, .. } => *peripheral,
        }
    }

    fn is_restorable(&self) -> bool {
        matches!(self, ListenEntry::Candidate { .. })
    }
}

impl fmt::Debug for ListenEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenEntry::Active { peripheral, restored, .. } => {
                f.debug_struct("Active")
                 .field("peripheral", peripheral)
                 .field("restored", restored)
                 .finish()
            }
            ListenEntry::Candidate { peripheral, buffer } => f.debug_struct("Candidate")
                                                              .field("peripheral", peripheral)
                                                              .field("buffered", &buffer.len())
                                                              .finish(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    Buffered,
    Overflowed,
    NotListening,
}

/// The result of asking the restorer about every restoration candidate
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct RestorationDecision {
    pub(crate) accepted: Vec<CharacteristicId>,
    pub(crate) declined: Vec<CharacteristicId>,
}

#[derive(Debug, Default)]
pub(crate) struct ListenRegistry {
    entries: BTreeMap<CharacteristicId, ListenEntry>,

    // Unsubscribes the registry issued itself (not on behalf of an
    // operation) whose acknowledgements haven't arrived yet
    unacked: HashMap<CharacteristicId, usize>,
}

impl ListenRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_listening(&self, characteristic: &CharacteristicId) -> bool {
        matches!(self.entries.get(characteristic), Some(ListenEntry::Active { .. }))
    }

    pub(crate) fn is_candidate(&self, characteristic: &CharacteristicId) -> bool {
        matches!(self.entries.get(characteristic), Some(ListenEntry::Candidate { .. }))
    }

    /// Whether `characteristic` has a callback attached to a subscription
    /// that was carried over from before a relaunch
    pub(crate) fn is_restored(&self, characteristic: &CharacteristicId) -> bool {
        matches!(self.entries.get(characteristic),
                 Some(ListenEntry::Active { restored: true, .. }))
    }

    pub(crate) fn has_candidates(&self) -> bool {
        self.entries.values().any(|entry| entry.is_restorable())
    }

    pub(crate) fn insert(&mut self, characteristic: CharacteristicId,
                         peripheral: PeripheralId, callback: ListenCallback)
                         -> Result<()> {
        if self.entries.contains_key(&characteristic) {
            return Err(Error::AlreadyListening);
        }
        trace!("Listening to {}", characteristic);
        self.entries.insert(characteristic, ListenEntry::Active { peripheral,
                                                                  callback,
                                                                  restored: false });
        Ok(())
    }

    /// Attaches a callback to a restoration candidate, first replaying
    /// anything that was buffered while it waited
    pub(crate) fn claim(&mut self, characteristic: CharacteristicId,
                        mut callback: ListenCallback)
                        -> Result<()> {
        let peripheral = match self.entries.get_mut(&characteristic) {
            Some(ListenEntry::Candidate { peripheral, buffer }) => {
                debug!("Restoring listen on {} with {} buffered update(s)",
                       characteristic, buffer.len());
                for value in buffer.drain(..) {
                    callback(value);
                }
                *peripheral
            }
            Some(ListenEntry::Active { .. }) => return Err(Error::AlreadyListening),
            None => return Err(Error::NotListening),
        };
        self.entries.insert(characteristic, ListenEntry::Active { peripheral,
                                                                  callback,
                                                                  restored: true });
        Ok(())
    }

    pub(crate) fn remove(&mut self, characteristic: &CharacteristicId) -> Option<PeripheralId> {
        self.entries.remove(characteristic).map(|entry| {
            trace!("Stopped listening to {}", characteristic);
            entry.peripheral()
        })
    }

    pub(crate) fn deliver(&mut self, characteristic: &CharacteristicId,
                          peripheral: &PeripheralId, value: Vec<u8>)
                          -> Delivery {
        match self.entries.get_mut(characteristic) {
            Some(entry) if entry.peripheral() != *peripheral => {
                warn!("Dropping update for {} from unexpected peripheral {}",
                      characteristic, peripheral);
                Delivery::NotListening
            }
            Some(ListenEntry::Active { callback, .. }) => {
                callback(value);
                Delivery::Delivered
            }
            Some(ListenEntry::Candidate { buffer, .. }) => match buffer.try_push(value) {
                Ok(()) => Delivery::Buffered,
                Err(_) => {
                    warn!("Restore buffer for {} is full, dropping update", characteristic);
                    Delivery::Overflowed
                }
            },
            None => {
                trace!("Ignoring update for {} with no listener", characteristic);
                Delivery::NotListening
            }
        }
    }

    /// Drops every subscription bound to `peripheral` except restoration
    /// candidates, returning the characteristics that were removed
    pub(crate) fn clear_non_restorable(&mut self, peripheral: &PeripheralId)
                                       -> Vec<CharacteristicId> {
        let removed: Vec<CharacteristicId> = self.entries
                                                 .iter()
                                                 .filter(|(_, entry)| {
                                                     !entry.is_restorable()
                                                     && entry.peripheral() == *peripheral
                                                 })
                                                 .map(|(characteristic, _)| *characteristic)
                                                 .collect();
        for characteristic in &removed {
            self.entries.remove(characteristic);
        }
        if !removed.is_empty() {
            debug!("Cleared {} listen(s) for {}", removed.len(), peripheral);
        }
        removed
    }

    /// Phase one of restoration: every candidate is decided before any
    /// value update is looked at.
    ///
    /// Accepted candidates become buffering entries, declined ones are
    /// returned so the caller can end them on the adapter.
    pub(crate) fn begin_restoration(&mut self, peripheral: PeripheralId,
                                    candidates: Vec<CharacteristicId>,
                                    can_restore: impl Fn(&CharacteristicId) -> bool)
                                    -> RestorationDecision {
        let mut decision = RestorationDecision::default();
        for characteristic in candidates {
            if self.entries.contains_key(&characteristic) {
                warn!("Ignoring redundant restoration candidate {}", characteristic);
                continue;
            }
            if can_restore(&characteristic) {
                self.entries.insert(characteristic, ListenEntry::Candidate {
                    peripheral,
                    buffer: ArrayVec::new(),
                });
                decision.accepted.push(characteristic);
            } else {
                decision.declined.push(characteristic);
            }
        }
        decision
    }

    /// Ends the restoration window, removing any candidate that was never
    /// claimed
    pub(crate) fn expire_candidates(&mut self) -> Vec<(PeripheralId, CharacteristicId)> {
        let expired: Vec<(PeripheralId, CharacteristicId)> =
            self.entries
                .iter()
                .filter(|(_, entry)| entry.is_restorable())
                .map(|(characteristic, entry)| (entry.peripheral(), *characteristic))
                .collect();
        for (_, characteristic) in &expired {
            self.entries.remove(characteristic);
        }
        expired
    }

    pub(crate) fn expect_ack(&mut self, characteristic: CharacteristicId) {
        *self.unacked.entry(characteristic).or_insert(0) += 1;
    }

    /// Consumes the acknowledgement for an unsubscribe the registry issued
    /// itself. Returns false if no such unsubscribe was outstanding.
    pub(crate) fn take_ack(&mut self, characteristic: &CharacteristicId) -> bool {
        match self.unacked.get_mut(characteristic) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.unacked.remove(characteristic);
                true
            }
            None => false,
        }
    }
}
