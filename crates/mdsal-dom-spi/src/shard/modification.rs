//! Cursor composition across shard boundaries.
//!
//! A [`ShardDataModification`] mirrors the shape of the shard's data down to
//! the prefixes of its child shards. Its cursor keeps one strategy per level
//! it has entered: levels with no boundary below them write straight to the
//! local cursor, levels with boundaries below them split container writes,
//! and levels inside a child shard go to that shard's own cursor.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{DomError, DomResult};
use crate::shard::cohort::{ForeignShardCohort, ThreePhaseCommitCohort};
use crate::shard::cursor::{container_children, DelegatingStrategy, WriteCursor, WriteCursorStrategy};
use crate::shard::foreign::ForeignShardModificationContext;
use crate::types::{InstanceIdentifier, NormalizedNode, PathArgument};

/// Child shard context shared between the modification tree and the cohorts.
pub type SharedContext = Arc<Mutex<ForeignShardModificationContext>>;

/// A node of the modification tree.
pub enum WriteableModificationNode {
    /// Interior node with at least one boundary below it. The root has no
    /// identifier.
    WithSubshards {
        /// Node identifier.
        identifier: Option<PathArgument>,
        /// Children leading to boundaries.
        children: BTreeMap<PathArgument, Arc<WriteableModificationNode>>,
    },
    /// Root of a child shard.
    Boundary {
        /// Node identifier.
        identifier: PathArgument,
        /// Writes into the child shard.
        context: SharedContext,
    },
}

impl WriteableModificationNode {
    /// Node identifier, `None` for the root.
    pub fn identifier(&self) -> Option<&PathArgument> {
        match self {
            WriteableModificationNode::WithSubshards { identifier, .. } => identifier.as_ref(),
            WriteableModificationNode::Boundary { identifier, .. } => Some(identifier),
        }
    }

    /// Whether this node is the root of a child shard.
    pub fn is_boundary(&self) -> bool {
        matches!(self, WriteableModificationNode::Boundary { .. })
    }

    /// Child on the way to a boundary.
    pub fn child(&self, argument: &PathArgument) -> Option<&Arc<WriteableModificationNode>> {
        match self {
            WriteableModificationNode::WithSubshards { children, .. } => children.get(argument),
            WriteableModificationNode::Boundary { .. } => None,
        }
    }

    /// Children leading to boundaries; empty for boundaries themselves.
    pub fn children_with_subshards(&self) -> impl Iterator<Item = (&PathArgument, &Arc<WriteableModificationNode>)> + '_ {
        let children = match self {
            WriteableModificationNode::WithSubshards { children, .. } => Some(children),
            WriteableModificationNode::Boundary { .. } => None,
        };
        children.into_iter().flatten()
    }

    /// The subtree at this node was removed: empty every child shard below.
    pub fn mark_deleted(&self) -> DomResult<()> {
        match self {
            WriteableModificationNode::WithSubshards { children, .. } => {
                children.values().try_for_each(|child| child.mark_deleted())
            }
            WriteableModificationNode::Boundary { context, .. } => context.lock().mark_deleted(),
        }
    }

    /// Strategy for a cursor entering this node.
    pub fn create_operation(self: &Arc<Self>) -> Box<dyn WriteCursorStrategy> {
        match self.as_ref() {
            WriteableModificationNode::WithSubshards { .. } => Box::new(NodeOperation {
                node: Arc::clone(self),
                root: false,
            }),
            WriteableModificationNode::Boundary { context, .. } => Box::new(ForeignDelegatingStrategy {
                context: Arc::clone(context),
                boundary_root: true,
            }),
        }
    }
}

impl fmt::Debug for WriteableModificationNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteableModificationNode::WithSubshards { identifier, children } => f
                .debug_struct("WithSubshards")
                .field("identifier", identifier)
                .field("children", &children.keys().collect::<Vec<_>>())
                .finish(),
            WriteableModificationNode::Boundary { identifier, context } => f
                .debug_struct("Boundary")
                .field("identifier", identifier)
                .field("shard", context.lock().identifier())
                .finish(),
        }
    }
}

/// Level with boundaries somewhere below it.
struct NodeOperation {
    node: Arc<WriteableModificationNode>,
    root: bool,
}

impl NodeOperation {
    /// Run `apply` with the strategy of `child`, entering and leaving it.
    fn with_child<F>(
        &self,
        local: &mut dyn WriteCursor,
        child: &PathArgument,
        node: &Arc<WriteableModificationNode>,
        apply: F,
    ) -> DomResult<()>
    where
        F: FnOnce(&dyn WriteCursorStrategy, &mut dyn WriteCursor) -> DomResult<()>,
    {
        local.enter(child)?;
        let operation = node.create_operation();
        apply(operation.as_ref(), &mut *local)?;
        operation.exit(local)
    }
}

impl WriteCursorStrategy for NodeOperation {
    fn enter(&self, local: &mut dyn WriteCursor, child: &PathArgument) -> DomResult<Box<dyn WriteCursorStrategy>> {
        local.enter(child)?;
        Ok(match self.node.child(child) {
            Some(node) => node.create_operation(),
            None => Box::new(DelegatingStrategy),
        })
    }

    fn delete(&self, local: &mut dyn WriteCursor, child: &PathArgument) -> DomResult<()> {
        local.delete(child)?;
        if let Some(node) = self.node.child(child) {
            node.mark_deleted()?;
        }
        Ok(())
    }

    fn merge(&self, local: &mut dyn WriteCursor, child: &PathArgument, data: NormalizedNode) -> DomResult<()> {
        match self.node.child(child) {
            None => local.merge(child, data),
            Some(node) => self.with_child(local, child, node, |operation, local| {
                operation.merge_to_current(local, data)
            }),
        }
    }

    fn write(&self, local: &mut dyn WriteCursor, child: &PathArgument, data: NormalizedNode) -> DomResult<()> {
        match self.node.child(child) {
            None => local.write(child, data),
            Some(node) => self.with_child(local, child, node, |operation, local| {
                operation.write_to_current(local, data)
            }),
        }
    }

    fn merge_to_current(&self, local: &mut dyn WriteCursor, data: NormalizedNode) -> DomResult<()> {
        for child in container_children(data)? {
            let identifier = child.identifier().clone();
            self.merge(local, &identifier, child)?;
        }
        Ok(())
    }

    fn write_to_current(&self, local: &mut dyn WriteCursor, data: NormalizedNode) -> DomResult<()> {
        let children = container_children(data)?;
        let written: BTreeSet<PathArgument> = children.iter().map(|child| child.identifier().clone()).collect();

        local.clear()?;
        for child in children {
            let identifier = child.identifier().clone();
            self.write(local, &identifier, child)?;
        }

        // Boundary data never stays in this shard; subtrees the write left
        // out are gone from the child shards too.
        for (key, node) in self.node.children_with_subshards() {
            if !written.contains(key) {
                trace!("Write replaced {} owned by a child shard", key);
                node.mark_deleted()?;
            } else if node.is_boundary() {
                local.delete(key)?;
            }
        }
        Ok(())
    }

    fn clear(&self, local: &mut dyn WriteCursor) -> DomResult<()> {
        local.clear()?;
        self.node.children_with_subshards().try_for_each(|(_, node)| node.mark_deleted())
    }

    fn exit(&self, local: &mut dyn WriteCursor) -> DomResult<()> {
        if self.root {
            return Err(DomError::IllegalState(
                "cannot exit the root of a shard modification".to_string(),
            ));
        }
        local.exit()
    }
}

/// Level owned by a child shard.
struct ForeignDelegatingStrategy {
    context: SharedContext,
    boundary_root: bool,
}

impl WriteCursorStrategy for ForeignDelegatingStrategy {
    fn enter(&self, _local: &mut dyn WriteCursor, child: &PathArgument) -> DomResult<Box<dyn WriteCursorStrategy>> {
        self.context.lock().cursor()?.enter(child)?;
        Ok(Box::new(ForeignDelegatingStrategy {
            context: Arc::clone(&self.context),
            boundary_root: false,
        }))
    }

    fn delete(&self, _local: &mut dyn WriteCursor, child: &PathArgument) -> DomResult<()> {
        self.context.lock().cursor()?.delete(child)
    }

    fn merge(&self, _local: &mut dyn WriteCursor, child: &PathArgument, data: NormalizedNode) -> DomResult<()> {
        self.context.lock().cursor()?.merge(child, data)
    }

    fn write(&self, _local: &mut dyn WriteCursor, child: &PathArgument, data: NormalizedNode) -> DomResult<()> {
        self.context.lock().cursor()?.write(child, data)
    }

    fn merge_to_current(&self, _local: &mut dyn WriteCursor, data: NormalizedNode) -> DomResult<()> {
        let children = container_children(data)?;
        let mut context = self.context.lock();
        let cursor = context.cursor()?;
        for child in children {
            let identifier = child.identifier().clone();
            cursor.merge(&identifier, child)?;
        }
        Ok(())
    }

    fn write_to_current(&self, _local: &mut dyn WriteCursor, data: NormalizedNode) -> DomResult<()> {
        let children = container_children(data)?;
        let mut context = self.context.lock();
        let cursor = context.cursor()?;
        cursor.clear()?;
        for child in children {
            let identifier = child.identifier().clone();
            cursor.write(&identifier, child)?;
        }
        Ok(())
    }

    fn clear(&self, _local: &mut dyn WriteCursor) -> DomResult<()> {
        self.context.lock().cursor()?.clear()
    }

    fn exit(&self, local: &mut dyn WriteCursor) -> DomResult<()> {
        if self.boundary_root {
            local.exit()
        } else {
            self.context.lock().cursor()?.exit()
        }
    }
}

/// Modification of one shard plus the child shards attached below it.
pub struct ShardDataModification {
    prefix: InstanceIdentifier,
    root: Arc<WriteableModificationNode>,
    child_shards: BTreeMap<InstanceIdentifier, SharedContext>,
}

impl ShardDataModification {
    /// Start describing a modification of the shard rooted at `prefix`.
    pub fn builder(prefix: InstanceIdentifier) -> ShardDataModificationBuilder {
        ShardDataModificationBuilder {
            prefix,
            child_shards: BTreeMap::new(),
        }
    }

    /// Root of the modified shard.
    pub fn prefix(&self) -> &InstanceIdentifier {
        &self.prefix
    }

    /// Root of the modification tree.
    pub fn root(&self) -> &Arc<WriteableModificationNode> {
        &self.root
    }

    /// Child shard contexts keyed by prefix.
    pub fn child_shards(&self) -> &BTreeMap<InstanceIdentifier, SharedContext> {
        &self.child_shards
    }

    /// Composed cursor positioned at the shard root, writing locally through
    /// `local`.
    pub fn create_cursor<C: WriteCursor>(&self, local: C) -> ShardDataModificationCursor<C> {
        ShardDataModificationCursor {
            local,
            stack: vec![Box::new(NodeOperation {
                node: Arc::clone(&self.root),
                root: true,
            })],
        }
    }

    /// Ready every child shard transaction.
    pub fn seal(&self) -> DomResult<()> {
        for (prefix, context) in &self.child_shards {
            trace!("Sealing child shard {}", prefix);
            context.lock().ready()?;
        }
        Ok(())
    }

    /// One commit cohort per child shard.
    pub fn cohorts(&self) -> Vec<Box<dyn ThreePhaseCommitCohort>> {
        self.child_shards
            .values()
            .map(|context| Box::new(ForeignShardCohort::new(Arc::clone(context))) as Box<dyn ThreePhaseCommitCohort>)
            .collect()
    }

    /// Release every child shard transaction.
    pub fn close(&self) -> DomResult<()> {
        self.child_shards
            .values()
            .try_for_each(|context| context.lock().close_foreign_transaction())
    }
}

/// Collects the child shards of a [`ShardDataModification`].
pub struct ShardDataModificationBuilder {
    prefix: InstanceIdentifier,
    child_shards: BTreeMap<InstanceIdentifier, SharedContext>,
}

impl ShardDataModificationBuilder {
    /// Add a child shard. Its prefix must lie strictly below the shard root.
    pub fn add_subshard(&mut self, context: ForeignShardModificationContext) -> DomResult<&mut Self> {
        let prefix = context.identifier().clone();
        match prefix.relative_to(&self.prefix) {
            Some(relative) if !relative.is_empty() => {}
            _ => {
                return Err(DomError::IllegalArgument(format!(
                    "child shard {} is not below {}",
                    prefix, self.prefix
                )))
            }
        }
        if self.child_shards.contains_key(&prefix) {
            return Err(DomError::IllegalArgument(format!("child shard {} added twice", prefix)));
        }
        self.child_shards.insert(prefix, Arc::new(Mutex::new(context)));
        Ok(self)
    }

    /// Build the modification tree.
    pub fn build(self) -> DomResult<ShardDataModification> {
        let mut root = NodeBuilder::default();
        for (prefix, context) in &self.child_shards {
            let relative = prefix.relative_to(&self.prefix).unwrap_or_default();
            root.insert(prefix, relative.path_arguments(), Arc::clone(context))?;
        }
        debug!("Built modification of {} with {} child shards", self.prefix, self.child_shards.len());

        Ok(ShardDataModification {
            root: Arc::new(WriteableModificationNode::WithSubshards {
                identifier: None,
                children: root.freeze_children(),
            }),
            prefix: self.prefix,
            child_shards: self.child_shards,
        })
    }
}

#[derive(Default)]
struct NodeBuilder {
    children: BTreeMap<PathArgument, NodeBuilder>,
    boundary: Option<SharedContext>,
}

impl NodeBuilder {
    fn insert(&mut self, prefix: &InstanceIdentifier, path: &[PathArgument], context: SharedContext) -> DomResult<()> {
        let Some((first, rest)) = path.split_first() else {
            return Err(DomError::IllegalArgument(format!("child shard {} has an empty path", prefix)));
        };
        let child = self.children.entry(first.clone()).or_default();
        let nested = child.boundary.is_some() || (rest.is_empty() && !child.children.is_empty());
        if nested {
            return Err(DomError::IllegalArgument(format!(
                "child shard {} overlaps another child shard",
                prefix
            )));
        }
        if rest.is_empty() {
            child.boundary = Some(context);
            Ok(())
        } else {
            child.insert(prefix, rest, context)
        }
    }

    fn freeze_children(self) -> BTreeMap<PathArgument, Arc<WriteableModificationNode>> {
        self.children
            .into_iter()
            .map(|(identifier, child)| {
                let node = child.freeze(identifier.clone());
                (identifier, node)
            })
            .collect()
    }

    fn freeze(self, identifier: PathArgument) -> Arc<WriteableModificationNode> {
        match self.boundary {
            Some(context) => Arc::new(WriteableModificationNode::Boundary { identifier, context }),
            None => Arc::new(WriteableModificationNode::WithSubshards {
                identifier: Some(identifier),
                children: self.freeze_children(),
            }),
        }
    }
}

/// Cursor over a [`ShardDataModification`]: one cursor for the caller, however
/// many shards the writes end up in.
pub struct ShardDataModificationCursor<C> {
    local: C,
    stack: Vec<Box<dyn WriteCursorStrategy>>,
}

fn top(stack: &[Box<dyn WriteCursorStrategy>]) -> DomResult<&dyn WriteCursorStrategy> {
    stack
        .last()
        .map(|strategy| strategy.as_ref())
        .ok_or_else(|| DomError::IllegalState("cursor has no current level".to_string()))
}

impl<C: WriteCursor> ShardDataModificationCursor<C> {
    /// Levels entered below the shard root.
    pub fn depth(&self) -> usize {
        self.stack.len().saturating_sub(1)
    }

    /// The local cursor.
    pub fn local(&self) -> &C {
        &self.local
    }

    /// Give back the local cursor.
    pub fn into_local(self) -> C {
        self.local
    }
}

impl<C: WriteCursor> WriteCursor for ShardDataModificationCursor<C> {
    fn enter(&mut self, child: &PathArgument) -> DomResult<()> {
        let Self { local, stack } = self;
        let next = top(stack)?.enter(local, child)?;
        stack.push(next);
        Ok(())
    }

    fn exit(&mut self) -> DomResult<()> {
        if self.stack.len() <= 1 {
            return Err(DomError::IllegalState(
                "cannot exit the root of a shard modification".to_string(),
            ));
        }
        match self.stack.pop() {
            Some(strategy) => strategy.exit(&mut self.local),
            None => Ok(()),
        }
    }

    fn delete(&mut self, child: &PathArgument) -> DomResult<()> {
        let Self { local, stack } = self;
        top(stack)?.delete(local, child)
    }

    fn merge(&mut self, child: &PathArgument, data: NormalizedNode) -> DomResult<()> {
        let Self { local, stack } = self;
        top(stack)?.merge(local, child, data)
    }

    fn write(&mut self, child: &PathArgument, data: NormalizedNode) -> DomResult<()> {
        let Self { local, stack } = self;
        top(stack)?.write(local, child, data)
    }

    fn clear(&mut self) -> DomResult<()> {
        let Self { local, stack } = self;
        top(stack)?.clear(local)
    }

    fn close(&mut self) -> DomResult<()> {
        self.stack.truncate(1);
        self.local.close()
    }
}
