//! In-memory data tree shard.
//!
//! A shard owns the data below its prefix, minus the subtrees of the child
//! shards attached to it. Reads stitch child shard data back in; writes are
//! split between the shard and its children by the composed cursor of
//! [`InMemoryShardWriteTransaction`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use mdsal_dom_spi::{
    ChainId, DataTreeCandidate, DataTreeCandidateNode, DataTreeChangeListener, DataTreeChangeListenerAggregator,
    DataTreeListener, DomError, DomResult, ForeignShardModificationContext, InstanceIdentifier, ListenerRegistration,
    NormalizedNode, PathArgument, QName, ShardDataModification, ShardProducer, ShardWriteTransaction, TransactionId,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::change_publisher::ShardChangePublisher;
use crate::data_tree::{InMemoryDataTree, PreparedCommit};
use crate::write_transaction::InMemoryShardWriteTransaction;

/// Shard keeping its data in an [`InMemoryDataTree`].
pub struct InMemoryDataTreeShard {
    prefix: InstanceIdentifier,
    tree: InMemoryDataTree,
    publisher: ShardChangePublisher,
    notifications: Mutex<Notifications>,
    children: RwLock<BTreeMap<InstanceIdentifier, Arc<InMemoryDataTreeShard>>>,
}

/// Committed changes waiting for delivery, in commit order.
#[derive(Default)]
struct Notifications {
    pending: VecDeque<DataTreeCandidate>,
    draining: bool,
}

impl InMemoryDataTreeShard {
    /// Empty shard rooted at `prefix`, keeping `history_depth` commits for
    /// conflict detection.
    pub fn new(prefix: InstanceIdentifier, history_depth: usize) -> Arc<Self> {
        let root = prefix
            .last_argument()
            .cloned()
            .unwrap_or_else(|| PathArgument::Node(QName::root()));
        info!("Created in-memory shard at {}", prefix);
        Arc::new(Self {
            tree: InMemoryDataTree::new(root, history_depth),
            prefix,
            publisher: ShardChangePublisher::new(),
            notifications: Mutex::new(Notifications::default()),
            children: RwLock::new(BTreeMap::new()),
        })
    }

    /// Root of the shard's data.
    pub fn prefix(&self) -> &InstanceIdentifier {
        &self.prefix
    }

    /// The shard's own data tree, excluding child shards.
    pub fn tree(&self) -> &InMemoryDataTree {
        &self.tree
    }

    /// The shard's change publisher.
    pub fn publisher(&self) -> &ShardChangePublisher {
        &self.publisher
    }

    /// Attach `child` below this shard.
    ///
    /// The child's prefix must lie strictly below this shard's prefix, must
    /// not overlap another child, and this shard must hold no data there.
    pub fn attach_child(&self, child: Arc<InMemoryDataTreeShard>) -> DomResult<()> {
        let prefix = child.prefix().clone();
        let relative = match prefix.relative_to(&self.prefix) {
            Some(relative) if !relative.is_empty() => relative,
            _ => {
                return Err(DomError::IllegalArgument(format!(
                    "shard {} cannot be a child of {}",
                    prefix, self.prefix
                )))
            }
        };
        if self.tree.read(&relative).is_some() {
            return Err(DomError::IllegalState(format!(
                "shard {} already holds data at {}",
                self.prefix, prefix
            )));
        }

        let mut children = self.children.write();
        if let Some(existing) = children.keys().find(|existing| existing.contains(&prefix) || prefix.contains(existing)) {
            return Err(DomError::IllegalArgument(format!(
                "shard {} overlaps child shard {}",
                prefix, existing
            )));
        }
        children.insert(prefix.clone(), child);
        info!("Attached child shard {} to {}", prefix, self.prefix);
        Ok(())
    }

    /// Detach the child shard at `prefix`.
    pub fn detach_child(&self, prefix: &InstanceIdentifier) -> Option<Arc<InMemoryDataTreeShard>> {
        let removed = self.children.write().remove(prefix);
        match &removed {
            Some(_) => info!("Detached child shard {} from {}", prefix, self.prefix),
            None => warn!("No child shard {} attached to {}", prefix, self.prefix),
        }
        removed
    }

    /// Directly attached child shards, keyed by prefix.
    pub fn child_shards(&self) -> BTreeMap<InstanceIdentifier, Arc<InMemoryDataTreeShard>> {
        self.children.read().clone()
    }

    /// The child shard owning `path`, if any.
    pub fn owning_child(&self, path: &InstanceIdentifier) -> Option<Arc<InMemoryDataTreeShard>> {
        self.children
            .read()
            .iter()
            .find(|(prefix, _)| prefix.contains(path))
            .map(|(_, child)| Arc::clone(child))
    }

    /// The shard ultimately owning `path`: this one or a descendant.
    pub fn find_shard(self: &Arc<Self>, path: &InstanceIdentifier) -> Option<Arc<InMemoryDataTreeShard>> {
        if !self.prefix.contains(path) {
            return None;
        }
        match self.owning_child(path) {
            Some(child) => child.find_shard(path),
            None => Some(Arc::clone(self)),
        }
    }

    /// Producer of write transactions against this shard.
    pub fn create_producer(self: &Arc<Self>) -> Arc<dyn ShardProducer> {
        self.producer_for(None)
    }

    fn producer_for(self: &Arc<Self>, origin: Option<ChainId>) -> Arc<dyn ShardProducer> {
        Arc::new(InMemoryShardProducer {
            shard: Arc::clone(self),
            origin,
        })
    }

    /// New write transaction. Transactions sharing an `origin` chain never
    /// conflict with each other.
    pub fn create_transaction(self: &Arc<Self>, origin: Option<ChainId>) -> DomResult<InMemoryShardWriteTransaction> {
        let mut builder = ShardDataModification::builder(self.prefix.clone());
        for (prefix, child) in self.children.read().iter() {
            builder.add_subshard(ForeignShardModificationContext::new(prefix.clone(), child.producer_for(origin)))?;
        }
        let modification = builder.build()?;
        let local = self.tree.new_modification(origin);
        let id = TransactionId::next();
        debug!("Allocated transaction {} on shard {}", id, self.prefix);
        Ok(InMemoryShardWriteTransaction::new(id, Arc::clone(self), modification, local))
    }

    /// Committed data at the absolute `path`, child shard data included.
    pub fn read(&self, path: &InstanceIdentifier) -> DomResult<Option<NormalizedNode>> {
        let relative = self.relative(path)?;
        if let Some(child) = self.owning_child(path) {
            return child.read(path);
        }
        let local = self.tree.read(&relative);
        self.graft_children(path, local)
    }

    /// Put the data of every child shard below `path` into `local`, the data
    /// this shard holds at `path`.
    pub(crate) fn graft_children(
        &self,
        path: &InstanceIdentifier,
        mut local: Option<NormalizedNode>,
    ) -> DomResult<Option<NormalizedNode>> {
        for (prefix, child) in self.child_shards() {
            let Some(below) = prefix.relative_to(path) else {
                continue;
            };
            let Some(data) = child.read(&prefix)? else {
                continue;
            };
            if is_empty_container(&data) {
                continue;
            }
            let node = local.get_or_insert_with(|| {
                let identifier = path
                    .last_argument()
                    .cloned()
                    .unwrap_or_else(|| PathArgument::Node(QName::root()));
                NormalizedNode::empty_container(identifier)
            });
            graft(node, below.path_arguments(), data);
        }
        Ok(local)
    }

    /// Register `listener` on the absolute `path`. It first receives the
    /// data already present there as a WRITE.
    ///
    /// Paths owned by a child shard are registered with that shard. Paths
    /// with a child shard below them are not supported.
    pub fn register_tree_change_listener(
        &self,
        path: &InstanceIdentifier,
        listener: Arc<dyn DataTreeChangeListener>,
    ) -> DomResult<ListenerRegistration> {
        let relative = self.relative(path)?;
        if let Some(child) = self.owning_child(path) {
            return child.register_tree_change_listener(path, listener);
        }
        if let Some(prefix) = self.children.read().keys().find(|prefix| path.contains(prefix)) {
            return Err(DomError::Unsupported(format!(
                "listening on {} spans child shard {}",
                path, prefix
            )));
        }

        let registration = self.publisher.register(path, Arc::clone(&listener));
        if let Some(data) = self.tree.read(&relative) {
            listener.on_data_tree_changed(vec![DataTreeCandidate::new(
                path.clone(),
                DataTreeCandidateNode::written(&data),
            )]);
        }
        Ok(registration)
    }

    /// Register one listener over several subtrees. It receives the changes
    /// of all of them together with the current data of each.
    pub fn register_listener(
        &self,
        subtrees: Vec<InstanceIdentifier>,
        listener: Arc<dyn DataTreeListener>,
    ) -> DomResult<ListenerRegistration> {
        let aggregator = DataTreeChangeListenerAggregator::new(subtrees.len());
        let mut registrations = Vec::with_capacity(subtrees.len());
        for subtree in subtrees {
            let registered = aggregator
                .create_listener(subtree.clone())
                .and_then(|subtree_listener| self.register_tree_change_listener(&subtree, subtree_listener));
            match registered {
                Ok(registration) => registrations.push(registration),
                Err(e) => {
                    warn!("Failed to listen on {}: {}", subtree, e);
                    drop(registrations);
                    aggregator.start_failed(listener.as_ref(), vec![e.clone()])?;
                    return Err(e);
                }
            }
        }
        aggregator.start(listener, registrations)
    }

    /// Install `prepared` in this shard's tree and notify listeners.
    ///
    /// Changes are queued under the same lock as the tree commit, so every
    /// listener sees them in commit order. Whichever committer finds the
    /// queue idle delivers it; listeners may commit to this shard again,
    /// their changes follow once the current delivery returns.
    pub(crate) fn commit(&self, prepared: PreparedCommit) -> DomResult<()> {
        {
            let mut notifications = self.notifications.lock();
            match self.tree.commit(prepared)? {
                Some(change) => notifications
                    .pending
                    .push_back(DataTreeCandidate::new(self.prefix.clone(), change)),
                None => {
                    trace!("Commit to shard {} changed nothing", self.prefix);
                    return Ok(());
                }
            }
            if notifications.draining {
                return Ok(());
            }
            notifications.draining = true;
        }
        self.drain_notifications();
        Ok(())
    }

    fn drain_notifications(&self) {
        loop {
            let candidate = {
                let mut notifications = self.notifications.lock();
                match notifications.pending.pop_front() {
                    Some(candidate) => candidate,
                    None => {
                        notifications.draining = false;
                        return;
                    }
                }
            };
            let notified = self.publisher.publish(&candidate);
            debug!("Change of shard {} notified {} listeners", self.prefix, notified);
        }
    }

    /// `path` relative to this shard's prefix.
    pub(crate) fn relative(&self, path: &InstanceIdentifier) -> DomResult<InstanceIdentifier> {
        path.relative_to(&self.prefix).ok_or_else(|| {
            DomError::IllegalArgument(format!("{} is outside of shard {}", path, self.prefix))
        })
    }
}

fn is_empty_container(node: &NormalizedNode) -> bool {
    node.child_map().is_some_and(|children| children.is_empty())
}

fn graft(node: &mut NormalizedNode, path: &[PathArgument], data: NormalizedNode) {
    let Some((first, rest)) = path.split_first() else {
        node.merge(data);
        return;
    };
    let Some(children) = node.child_map_mut() else {
        return;
    };
    let child = children
        .entry(first.clone())
        .or_insert_with(|| NormalizedNode::empty_container(first.clone()));
    graft(child, rest, data);
}

struct InMemoryShardProducer {
    shard: Arc<InMemoryDataTreeShard>,
    origin: Option<ChainId>,
}

impl ShardProducer for InMemoryShardProducer {
    fn prefix(&self) -> &InstanceIdentifier {
        self.shard.prefix()
    }

    fn create_transaction(&self) -> DomResult<Box<dyn ShardWriteTransaction>> {
        Ok(Box::new(self.shard.create_transaction(self.origin)?))
    }
}
