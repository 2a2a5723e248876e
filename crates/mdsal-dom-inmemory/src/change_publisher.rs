//! Delivery of committed shard changes to tree-change listeners.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use mdsal_dom_spi::{
    CandidateDispatch, DataTreeCandidate, DataTreeCandidatePublisher, DataTreeChangeListener, InstanceIdentifier,
    ListenerRegistration, RegistrationId,
};
use tracing::{debug, trace};

/// A listener registered on one path of a shard.
#[derive(Clone)]
pub struct TreeChangeRegistration {
    id: RegistrationId,
    listener: Arc<dyn DataTreeChangeListener>,
}

impl TreeChangeRegistration {
    /// Registration identifier.
    pub fn id(&self) -> RegistrationId {
        self.id
    }
}

impl PartialEq for TreeChangeRegistration {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TreeChangeRegistration {}

impl Hash for TreeChangeRegistration {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TreeChangeRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeChangeRegistration").field("id", &self.id).finish()
    }
}

struct ListenerDispatch;

impl CandidateDispatch<TreeChangeRegistration> for ListenerDispatch {
    fn notify_listener(&self, registration: &TreeChangeRegistration, changes: Vec<DataTreeCandidate>) {
        trace!("Delivering {} changes to {}", changes.len(), registration.id);
        registration.listener.on_data_tree_changed(changes);
    }
}

/// Registration tree of one shard plus candidate dispatch over it.
pub struct ShardChangePublisher {
    publisher: Arc<DataTreeCandidatePublisher<TreeChangeRegistration>>,
}

impl ShardChangePublisher {
    /// Publisher with no registrations.
    pub fn new() -> Self {
        Self {
            publisher: Arc::new(DataTreeCandidatePublisher::new()),
        }
    }

    /// Register `listener` on the absolute `path`. Closing the returned
    /// registration removes it again.
    pub fn register(&self, path: &InstanceIdentifier, listener: Arc<dyn DataTreeChangeListener>) -> ListenerRegistration {
        let registration = TreeChangeRegistration {
            id: RegistrationId::next(),
            listener,
        };
        let id = registration.id;
        let node = self.publisher.register(path, registration.clone());
        debug!("Registered tree-change listener {} at {}", id, path);

        let publisher = Arc::clone(&self.publisher);
        let path = path.clone();
        ListenerRegistration::new(id, move || {
            if publisher.unregister(node, &registration) {
                debug!("Unregistered tree-change listener {} at {}", id, path);
            }
        })
    }

    /// Notify every listener affected by `candidate`. Returns how many were
    /// notified.
    pub fn publish(&self, candidate: &DataTreeCandidate) -> usize {
        self.publisher.process_candidate_tree(candidate, &ListenerDispatch)
    }

    /// Number of live registration-tree nodes, the root included.
    pub fn node_count(&self) -> usize {
        self.publisher.registration_tree().take_snapshot().node_count()
    }
}

impl Default for ShardChangePublisher {
    fn default() -> Self {
        Self::new()
    }
}
