//! Data tree change listeners and their registrations.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::candidate::DataTreeCandidate;

static NEXT_REGISTRATION: AtomicU64 = AtomicU64::new(1);

/// Identifier of a listener registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistrationId(u64);

impl RegistrationId {
    /// Wrap a raw identifier.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocate a process-unique identifier.
    pub fn next() -> Self {
        Self(NEXT_REGISTRATION.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg-{}", self.0)
    }
}

/// Receives the candidates committed below the path it was registered at.
pub trait DataTreeChangeListener: Send + Sync {
    /// Called once per commit with every fragment affecting the registration,
    /// in discovery order.
    fn on_data_tree_changed(&self, changes: Vec<DataTreeCandidate>);
}

type Closer = Box<dyn FnOnce() + Send + 'static>;

/// Handle keeping a listener registered. Closing it, explicitly or by
/// dropping it, removes the registration exactly once.
pub struct ListenerRegistration {
    id: RegistrationId,
    closer: Mutex<Option<Closer>>,
}

impl ListenerRegistration {
    /// Create a registration which runs `closer` when closed.
    pub fn new<F>(id: RegistrationId, closer: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            id,
            closer: Mutex::new(Some(Box::new(closer))),
        }
    }

    /// Create a registration closing every one of `registrations`.
    pub fn composite(registrations: Vec<ListenerRegistration>) -> Self {
        Self::new(RegistrationId::next(), move || {
            for registration in registrations {
                registration.close();
            }
        })
    }

    /// Registration identifier.
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    /// Whether the registration has been closed.
    pub fn is_closed(&self) -> bool {
        self.closer.lock().is_none()
    }

    /// Remove the registration. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        let closer = self.closer.lock().take();
        match closer {
            Some(closer) => {
                trace!("Closing registration {}", self.id);
                closer();
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counting(counter: &Arc<AtomicUsize>) -> ListenerRegistration {
        let counter = Arc::clone(counter);
        ListenerRegistration::new(RegistrationId::next(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_close_runs_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registration = counting(&counter);
        assert!(!registration.is_closed());
        assert!(registration.close());
        assert!(!registration.close());
        drop(registration);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_closes() {
        let counter = Arc::new(AtomicUsize::new(0));
        drop(counting(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_composite_closes_all() {
        let counter = Arc::new(AtomicUsize::new(0));
        let composite = ListenerRegistration::composite(vec![counting(&counter), counting(&counter)]);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        composite.close();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_registration_id_display() {
        assert_eq!(RegistrationId::new(7).to_string(), "reg-7");
        assert_ne!(RegistrationId::next(), RegistrationId::next());
    }
}
