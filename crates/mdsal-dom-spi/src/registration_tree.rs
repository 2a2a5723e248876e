//! Prefix tree of listener registrations keyed by path arguments.
//!
//! Structural changes happen through a [`RegistrationTreeLock`] (the write
//! lock); traversals happen through a [`RegistrationTreeSnapshot`] (the read
//! lock). Many snapshots may be open at once; a lock waits until all of them
//! are released, and snapshots wait for an outstanding lock.
//!
//! Nodes live in an arena and refer to their parent by index, which is all
//! that pruning needs. A node left with neither registrations nor children is
//! removed from its parent as soon as its last registration goes away, and so
//! are any ancestors that become empty as a result.

use std::collections::HashMap;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::types::PathArgument;

/// Index of a node in a registration tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

const ROOT: NodeId = NodeId(0);

struct NodeSlot<T> {
    identifier: Option<PathArgument>,
    parent: Option<NodeId>,
    children: HashMap<PathArgument, NodeId>,
    registrations: Vec<T>,
}

impl<T> NodeSlot<T> {
    fn new(identifier: Option<PathArgument>, parent: Option<NodeId>) -> Self {
        Self {
            identifier,
            parent,
            children: HashMap::new(),
            registrations: Vec::new(),
        }
    }

    fn is_unused(&self) -> bool {
        self.registrations.is_empty() && self.children.is_empty()
    }
}

struct Arena<T> {
    slots: Vec<Option<NodeSlot<T>>>,
    free: Vec<usize>,
}

impl<T> Arena<T> {
    fn new() -> Self {
        Self {
            slots: vec![Some(NodeSlot::new(None, None))],
            free: Vec::new(),
        }
    }

    fn get(&self, id: NodeId) -> Option<&NodeSlot<T>> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut NodeSlot<T>> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    fn allocate(&mut self, slot: NodeSlot<T>) -> NodeId {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                NodeId(index)
            }
            None => {
                self.slots.push(Some(slot));
                NodeId(self.slots.len() - 1)
            }
        }
    }

    fn release(&mut self, id: NodeId) {
        if id != ROOT && self.slots.get_mut(id.0).and_then(Option::take).is_some() {
            self.free.push(id.0);
        }
    }

    fn live_nodes(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    fn prune(&mut self, start: NodeId) {
        let mut current = start;
        while current != ROOT {
            let Some(slot) = self.get(current) else {
                return;
            };
            if !slot.is_unused() {
                return;
            }
            let parent = slot.parent;
            let identifier = slot.identifier.clone();
            self.release(current);

            let Some(parent) = parent else {
                return;
            };
            let removed = match (self.get_mut(parent), identifier) {
                (Some(parent_slot), Some(identifier)) => parent_slot.children.remove(&identifier).is_some(),
                _ => false,
            };
            if !removed {
                warn!("Pruned node {:?} was not registered with its parent {:?}", current, parent);
            }
            debug!("Pruned unused registration tree node {:?}", current);
            current = parent;
        }
    }
}

/// A read/write-locked prefix tree of registrations.
pub struct RegistrationTree<T> {
    arena: RwLock<Arena<T>>,
}

impl<T> RegistrationTree<T> {
    /// Create a tree holding only the root node.
    pub fn new() -> Self {
        Self {
            arena: RwLock::new(Arena::new()),
        }
    }

    /// Take the exclusive lock for structural changes.
    pub fn take_lock(&self) -> RegistrationTreeLock<'_, T> {
        RegistrationTreeLock {
            arena: self.arena.write(),
        }
    }

    /// Take a shared, consistent view of the tree for traversal.
    pub fn take_snapshot(&self) -> RegistrationTreeSnapshot<'_, T> {
        RegistrationTreeSnapshot {
            arena: self.arena.read(),
        }
    }
}

impl<T> Default for RegistrationTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to a registration tree. Dropping it releases the lock.
pub struct RegistrationTreeLock<'a, T> {
    arena: RwLockWriteGuard<'a, Arena<T>>,
}

impl<'a, T> RegistrationTreeLock<'a, T> {
    /// Walk `path` from the root, creating any missing node, and return the
    /// node at its end.
    pub fn find_node_for(&mut self, path: &[PathArgument]) -> NodeId {
        let mut current = ROOT;
        for argument in path {
            let existing = self
                .arena
                .get(current)
                .and_then(|slot| slot.children.get(argument).copied());
            current = match existing {
                Some(child) => child,
                None => {
                    let child = self
                        .arena
                        .allocate(NodeSlot::new(Some(argument.clone()), Some(current)));
                    if let Some(slot) = self.arena.get_mut(current) {
                        slot.children.insert(argument.clone(), child);
                    }
                    child
                }
            };
        }
        current
    }

    /// Attach a registration to a node.
    pub fn add_registration(&mut self, node: NodeId, registration: T) {
        match self.arena.get_mut(node) {
            Some(slot) => slot.registrations.push(registration),
            None => warn!("Attempted to register at released node {:?}", node),
        }
    }

    /// Detach a registration from a node, pruning the node and its ancestors
    /// if they end up empty. Returns false if the registration was not there.
    pub fn remove_registration(&mut self, node: NodeId, registration: &T) -> bool
    where
        T: PartialEq,
    {
        let Some(slot) = self.arena.get_mut(node) else {
            warn!("Attempted to remove registration from released node {:?}", node);
            return false;
        };
        let Some(position) = slot.registrations.iter().position(|r| r == registration) else {
            warn!("Registration not present at node {:?}", node);
            return false;
        };
        slot.registrations.remove(position);
        self.arena.prune(node);
        true
    }

    /// Root node view.
    pub fn root_node(&self) -> RegistrationTreeNode<'_, T> {
        RegistrationTreeNode {
            arena: &self.arena,
            id: ROOT,
        }
    }

    /// View of an arbitrary live node.
    pub fn node(&self, id: NodeId) -> Option<RegistrationTreeNode<'_, T>> {
        self.arena.get(id).map(|_| RegistrationTreeNode {
            arena: &self.arena,
            id,
        })
    }

    /// Number of live nodes, root included.
    pub fn node_count(&self) -> usize {
        self.arena.live_nodes()
    }
}

/// Shared, consistent view of a registration tree. Dropping it releases the
/// read lock.
pub struct RegistrationTreeSnapshot<'a, T> {
    arena: RwLockReadGuard<'a, Arena<T>>,
}

impl<'a, T> RegistrationTreeSnapshot<'a, T> {
    /// Root node view.
    pub fn root_node(&self) -> RegistrationTreeNode<'_, T> {
        RegistrationTreeNode {
            arena: &self.arena,
            id: ROOT,
        }
    }

    /// Number of live nodes, root included.
    pub fn node_count(&self) -> usize {
        self.arena.live_nodes()
    }
}

/// Borrowed view of one node, valid while the lock or snapshot it came from
/// is held.
pub struct RegistrationTreeNode<'a, T> {
    arena: &'a Arena<T>,
    id: NodeId,
}

impl<'a, T> Clone for RegistrationTreeNode<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T> Copy for RegistrationTreeNode<'a, T> {}

impl<'a, T> RegistrationTreeNode<'a, T> {
    fn slot(&self) -> Option<&'a NodeSlot<T>> {
        self.arena.get(self.id)
    }

    /// Node index.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Path argument leading to this node; `None` for the root.
    pub fn identifier(&self) -> Option<&'a PathArgument> {
        self.slot().and_then(|slot| slot.identifier.as_ref())
    }

    /// Registrations attached to this node.
    pub fn registrations(&self) -> &'a [T] {
        self.slot().map(|slot| slot.registrations.as_slice()).unwrap_or(&[])
    }

    /// Child registered under exactly `argument`.
    pub fn exact_child(&self, argument: &PathArgument) -> Option<RegistrationTreeNode<'a, T>> {
        let arena = self.arena;
        self.slot()
            .and_then(|slot| slot.children.get(argument))
            .map(|&id| RegistrationTreeNode { arena, id })
    }

    /// Children that match `argument` without being keyed by it: the
    /// wildcard registration for a list entry or leaf-list entry.
    pub fn inexact_children(&self, argument: &PathArgument) -> Vec<RegistrationTreeNode<'a, T>> {
        argument
            .wildcard()
            .and_then(|wildcard| self.exact_child(&wildcard))
            .into_iter()
            .collect()
    }

    /// Number of children.
    pub fn child_count(&self) -> usize {
        self.slot().map(|slot| slot.children.len()).unwrap_or(0)
    }

    /// Parent node; `None` for the root.
    pub fn parent(&self) -> Option<RegistrationTreeNode<'a, T>> {
        let arena = self.arena;
        self.slot()
            .and_then(|slot| slot.parent)
            .map(|id| RegistrationTreeNode { arena, id })
    }
}
