use std::sync::{Arc, Weak};

use log::trace;

use crate::peripheral::Peripheral;
use crate::state::ConnectionState;

/// Implemented by application objects that want to follow adapter
/// availability and connection transitions
///
/// Observers are held weakly by the session so registering one never
/// extends its lifetime; once the last `Arc` is dropped the observer is
/// silently forgotten. All callbacks are invoked from the session's task,
/// so they should return quickly.
pub trait ConnectionObserver: Send + Sync {
    fn on_availability_changed(&self, _available: bool) {}

    /// Called once a connection is fully resolved, after discovery
    fn on_connected(&self, _peripheral: &Peripheral) {}

    /// Called when a connection reported by `on_connected` ends. A link
    /// that drops before it was reported (e.g. because discovery failed)
    /// only shows up through `on_state_changed`.
    fn on_disconnected(&self) {}

    /// Called for every state transition, including `Connected` as soon as
    /// the link comes up and before discovery
    fn on_state_changed(&self, _state: ConnectionState) {}
}

// Observers are compared by the address of the object they point to, not
// by vtable, so the same object registered through different trait object
// casts is still recognised as one entry.
fn observer_addr(weak: &Weak<dyn ConnectionObserver>) -> *const () {
    weak.as_ptr() as *const ()
}

pub(crate) fn weak_observer<O: ConnectionObserver + 'static>(
    observer: &Arc<O>,
) -> Weak<dyn ConnectionObserver> {
    let weak: Weak<O> = Arc::downgrade(observer);
    weak
}

#[derive(Default)]
pub(crate) struct ObserverRegistry {
    observers: Vec<Weak<dyn ConnectionObserver>>,
}

impl ObserverRegistry {
    pub(crate) fn new() -> Self {
        Self { observers: vec![] }
    }

    /// Registering the same observer twice is a no-op
    pub(crate) fn register(&mut self, observer: Weak<dyn ConnectionObserver>) {
        let addr = observer_addr(&observer);
        if !self.observers.iter().any(|existing| observer_addr(existing) == addr) {
            self.observers.push(observer);
        }
    }

    pub(crate) fn unregister(&mut self, observer: &Weak<dyn ConnectionObserver>) {
        let addr = observer_addr(observer);
        self.observers.retain(|existing| observer_addr(existing) != addr);
    }

    pub(crate) fn len(&self) -> usize {
        self.observers.len()
    }

    /// Calls `f` for each live observer in registration order, pruning
    /// any that have been dropped
    pub(crate) fn notify_all<F>(&mut self, mut f: F)
    where
        F: FnMut(&dyn ConnectionObserver),
    {
        let before = self.observers.len();
        self.observers.retain(|weak| match weak.upgrade() {
            Some(observer) => {
                f(observer.as_ref());
                true
            }
            None => false,
        });
        let pruned = before - self.observers.len();
        if pruned > 0 {
            trace!("Pruned {} released connection observer(s)", pruned);
        }
    }
}
