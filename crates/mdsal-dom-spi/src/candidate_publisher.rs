//! Dispatch of committed candidates to the registrations they affect.
//!
//! A candidate is walked in lock-step with a [`RegistrationTree`] snapshot.
//! Each registration met on the way collects the candidate fragments rooted at
//! its node; once the walk is over, every affected registration is notified
//! exactly once with its fragments in discovery order.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::candidate::{DataTreeCandidate, DataTreeCandidateNode, ModificationType};
use crate::registration_tree::{NodeId, RegistrationTree, RegistrationTreeNode};
use crate::types::{InstanceIdentifier, PathArgument};

/// Receiver of grouped candidate fragments.
pub trait CandidateDispatch<T> {
    /// Deliver all fragments that affect `registration`.
    fn notify_listener(&self, registration: &T, changes: Vec<DataTreeCandidate>);

    /// Called for every registration-tree node whose registrations matched a
    /// candidate node, before the fragments are collected.
    fn on_registration_matched(&self, _path: &InstanceIdentifier, _node: &DataTreeCandidateNode, _registrations: &[T]) {}
}

/// Fragments accumulated per registration, in discovery order.
struct ListenerChanges<T> {
    index: HashMap<T, usize>,
    changes: Vec<(T, Vec<DataTreeCandidate>)>,
}

impl<T: Clone + Eq + Hash> ListenerChanges<T> {
    fn new() -> Self {
        Self {
            index: HashMap::new(),
            changes: Vec::new(),
        }
    }

    fn add(&mut self, registration: &T, candidate: DataTreeCandidate) {
        match self.index.get(registration) {
            Some(&slot) => self.changes[slot].1.push(candidate),
            None => {
                self.index.insert(registration.clone(), self.changes.len());
                self.changes.push((registration.clone(), vec![candidate]));
            }
        }
    }
}

/// Registration tree plus the candidate walk over it.
pub struct DataTreeCandidatePublisher<T> {
    tree: RegistrationTree<T>,
}

impl<T: Clone + Eq + Hash> DataTreeCandidatePublisher<T> {
    /// Create a publisher with an empty registration tree.
    pub fn new() -> Self {
        Self {
            tree: RegistrationTree::new(),
        }
    }

    /// The underlying registration tree.
    pub fn registration_tree(&self) -> &RegistrationTree<T> {
        &self.tree
    }

    /// Register at `path` and return the node the registration lives on.
    pub fn register(&self, path: &InstanceIdentifier, registration: T) -> NodeId {
        let mut lock = self.tree.take_lock();
        let node = lock.find_node_for(path.path_arguments());
        lock.add_registration(node, registration);
        node
    }

    /// Remove a registration previously returned by [`Self::register`].
    pub fn unregister(&self, node: NodeId, registration: &T) -> bool {
        self.tree.take_lock().remove_registration(node, registration)
    }

    /// Walk `candidate` against the current registrations and notify every
    /// affected registration once. Returns the number of registrations
    /// notified.
    pub fn process_candidate_tree<D>(&self, candidate: &DataTreeCandidate, dispatch: &D) -> usize
    where
        D: CandidateDispatch<T> + ?Sized,
    {
        let root = candidate.root_node();
        if root.modification_type() == ModificationType::Unmodified {
            debug!("Skipping unmodified candidate {}", candidate.root_path());
            return 0;
        }

        let mut changes = ListenerChanges::new();
        {
            let snapshot = self.tree.take_snapshot();
            lookup_and_notify(
                candidate.root_path().path_arguments(),
                0,
                snapshot.root_node(),
                candidate,
                dispatch,
                &mut changes,
            );
        }

        let notified = changes.changes.len();
        for (registration, fragments) in changes.changes {
            dispatch.notify_listener(&registration, fragments);
        }
        notified
    }
}

impl<T: Clone + Eq + Hash> Default for DataTreeCandidatePublisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup_and_notify<T, D>(
    args: &[PathArgument],
    offset: usize,
    node: RegistrationTreeNode<'_, T>,
    candidate: &DataTreeCandidate,
    dispatch: &D,
    changes: &mut ListenerChanges<T>,
) where
    T: Clone + Eq + Hash,
    D: CandidateDispatch<T> + ?Sized,
{
    if offset == args.len() {
        notify_node(candidate.root_path(), node, candidate.root_node(), dispatch, changes);
        return;
    }

    let argument = &args[offset];
    if let Some(exact) = node.exact_child(argument) {
        lookup_and_notify(args, offset + 1, exact, candidate, dispatch, changes);
    }
    for inexact in node.inexact_children(argument) {
        lookup_and_notify(args, offset + 1, inexact, candidate, dispatch, changes);
    }
}

fn notify_node<T, D>(
    path: &InstanceIdentifier,
    reg_node: RegistrationTreeNode<'_, T>,
    cand_node: &Arc<DataTreeCandidateNode>,
    dispatch: &D,
    changes: &mut ListenerChanges<T>,
) where
    T: Clone + Eq + Hash,
    D: CandidateDispatch<T> + ?Sized,
{
    if cand_node.modification_type() == ModificationType::Unmodified {
        trace!("Skipping unmodified candidate {}", path);
        return;
    }

    let registrations = reg_node.registrations();
    if !registrations.is_empty() {
        dispatch.on_registration_matched(path, cand_node, registrations);
        for registration in registrations {
            changes.add(registration, DataTreeCandidate::new(path.clone(), Arc::clone(cand_node)));
        }
    }

    for child in cand_node.children() {
        let identifier = child.identifier();
        let child_path = path.node(identifier.clone());
        if let Some(exact) = reg_node.exact_child(identifier) {
            notify_node(&child_path, exact, child, dispatch, changes);
        }
        for inexact in reg_node.inexact_children(identifier) {
            notify_node(&child_path, inexact, child, dispatch, changes);
        }
    }
}
