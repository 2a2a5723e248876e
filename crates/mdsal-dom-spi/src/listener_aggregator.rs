//! One listener over several subtrees.
//!
//! Each subtree gets its own [`DataTreeChangeListener`] from
//! [`DataTreeChangeListenerAggregator::create_listener`]. Changes reported
//! before [`DataTreeChangeListenerAggregator::start`] are squashed into an
//! initial write of the latest data; afterwards they are delivered to the
//! downstream [`DataTreeListener`] together with the current data of every
//! subtree.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::aggregator::{BuilderRef, Operational, StateAggregator, StateBuilder, StateSink, Started};
use crate::candidate::{DataTreeCandidate, DataTreeCandidateNode};
use crate::error::{DomError, DomResult};
use crate::listener::{DataTreeChangeListener, ListenerRegistration};
use crate::types::{InstanceIdentifier, NormalizedNode};

/// Current data of each aggregated subtree.
pub type SubtreeData = BTreeMap<InstanceIdentifier, NormalizedNode>;

/// Listener receiving the aggregated changes of several subtrees.
pub trait DataTreeListener: Send + Sync {
    /// Changes of one or more subtrees, plus the current data of every
    /// subtree which has any.
    fn on_data_tree_changed(&self, changes: Vec<DataTreeCandidate>, subtrees: SubtreeData);

    /// The listener cannot be serviced.
    fn on_data_tree_failed(&self, causes: Vec<DomError>);
}

/// Changes reported for one subtree.
#[derive(Clone, Debug)]
pub struct SubtreeChanges {
    /// Subtree the changes belong to.
    pub subtree: InstanceIdentifier,
    /// Candidates in commit order.
    pub changes: Vec<DataTreeCandidate>,
}

/// Accumulates the changes of one subtree.
pub struct ChangesBuilder {
    subtree: InstanceIdentifier,
    changes: Vec<DataTreeCandidate>,
}

impl ChangesBuilder {
    fn new(subtree: InstanceIdentifier) -> Self {
        Self {
            subtree,
            changes: Vec::new(),
        }
    }
}

impl StateBuilder for ChangesBuilder {
    type State = SubtreeChanges;

    fn append(&mut self, state: SubtreeChanges) {
        self.changes.extend(state.changes);
    }

    fn append_initial(&mut self, state: SubtreeChanges) {
        let Some(last) = state.changes.last() else {
            return;
        };
        self.changes.clear();
        if let Some(data) = last.root_node().data_after() {
            self.changes.push(DataTreeCandidate::new(
                last.root_path().clone(),
                DataTreeCandidateNode::written(data),
            ));
        }
    }

    fn build(&mut self) -> SubtreeChanges {
        SubtreeChanges {
            subtree: self.subtree.clone(),
            changes: std::mem::take(&mut self.changes),
        }
    }
}

/// Tracks subtree data and forwards non-empty batches downstream.
struct ListenerSink {
    listener: Arc<dyn DataTreeListener>,
    subtrees: Mutex<SubtreeData>,
}

impl StateSink<SubtreeChanges> for ListenerSink {
    fn notify_listener(&self, states: Vec<SubtreeChanges>) {
        let mut changes = Vec::new();
        let subtrees = {
            let mut subtrees = self.subtrees.lock();
            for state in states {
                let Some(last) = state.changes.last() else {
                    continue;
                };
                match last.root_node().data_after() {
                    Some(data) => {
                        subtrees.insert(state.subtree.clone(), data.clone());
                    }
                    None => {
                        subtrees.remove(&state.subtree);
                    }
                }
                changes.extend(state.changes);
            }
            subtrees.clone()
        };

        if changes.is_empty() {
            return;
        }
        trace!("Delivering {} aggregated changes", changes.len());
        self.listener.on_data_tree_changed(changes, subtrees);
    }
}

/// Per-subtree listener feeding the aggregator.
struct SubtreeListener {
    aggregator: Arc<StateAggregator<ChangesBuilder>>,
    builder: BuilderRef<ChangesBuilder>,
    subtree: InstanceIdentifier,
}

impl DataTreeChangeListener for SubtreeListener {
    fn on_data_tree_changed(&self, changes: Vec<DataTreeCandidate>) {
        if changes.is_empty() {
            return;
        }
        self.aggregator.receive_state(
            &self.builder,
            SubtreeChanges {
                subtree: self.subtree.clone(),
                changes,
            },
        );
    }
}

/// Aggregates several subtree listeners into one [`DataTreeListener`].
pub struct DataTreeChangeListenerAggregator {
    inner: Arc<StateAggregator<ChangesBuilder>>,
}

impl DataTreeChangeListenerAggregator {
    /// Create an aggregator expecting about `size_hint` subtrees.
    pub fn new(size_hint: usize) -> Self {
        Self {
            inner: Arc::new(StateAggregator::new(size_hint)),
        }
    }

    /// Listener to register on `subtree`. Only possible before starting.
    pub fn create_listener(&self, subtree: InstanceIdentifier) -> DomResult<Arc<dyn DataTreeChangeListener>> {
        let builder = self.inner.add_builder(ChangesBuilder::new(subtree.clone()))?;
        Ok(Arc::new(SubtreeListener {
            aggregator: Arc::clone(&self.inner),
            builder,
            subtree,
        }))
    }

    /// Go operational: deliver the initial state to `listener` and return a
    /// registration closing all of `registrations`.
    pub fn start(
        &self,
        listener: Arc<dyn DataTreeListener>,
        registrations: Vec<ListenerRegistration>,
    ) -> DomResult<ListenerRegistration> {
        self.inner.start(|builders| {
            let operational = Operational::new(
                builders,
                Box::new(ListenerSink {
                    listener,
                    subtrees: Mutex::new(SubtreeData::new()),
                }),
            );
            operational.notify_listener();
            Started::Operational(operational)
        })?;
        Ok(ListenerRegistration::composite(registrations))
    }

    /// Give up: report `causes` to `listener` and drop every later change.
    pub fn start_failed(&self, listener: &dyn DataTreeListener, causes: Vec<DomError>) -> DomResult<()> {
        self.inner.start(|_| Started::Failed)?;
        error!("Listener aggregation failed with {} causes", causes.len());
        listener.on_data_tree_failed(causes);
        Ok(())
    }
}
