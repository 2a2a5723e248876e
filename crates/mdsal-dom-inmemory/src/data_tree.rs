//! In-memory data tree with optimistic concurrency.
//!
//! A modification records its operations against a snapshot. Validation
//! checks the paths it touched against the commits that happened since the
//! snapshot; preparation replays the operations onto the current root and
//! computes the candidate; commit installs the new root.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use mdsal_dom_spi::{
    ChainId, DataTreeCandidateNode, DomError, DomResult, InstanceIdentifier, NormalizedNode, PathArgument,
    WriteCursor,
};
use parking_lot::RwLock;
use tracing::{debug, trace};

/// One recorded operation, path relative to the tree root.
#[derive(Clone, Debug, PartialEq)]
enum TreeOperation {
    Write(InstanceIdentifier, NormalizedNode),
    Merge(InstanceIdentifier, NormalizedNode),
    Delete(InstanceIdentifier),
    Clear(InstanceIdentifier),
}

impl TreeOperation {
    fn path(&self) -> &InstanceIdentifier {
        match self {
            TreeOperation::Write(path, _)
            | TreeOperation::Merge(path, _)
            | TreeOperation::Delete(path)
            | TreeOperation::Clear(path) => path,
        }
    }

    fn apply(&self, root: &mut NormalizedNode) -> DomResult<()> {
        match self {
            TreeOperation::Write(path, data) => match path.path_arguments().split_last() {
                None => {
                    check_identifier(path, root.identifier(), data)?;
                    *root = data.clone();
                    Ok(())
                }
                Some((last, parent)) => {
                    check_identifier(path, last, data)?;
                    let children = children_mut(root, parent, path)?;
                    children.insert(last.clone(), data.clone());
                    Ok(())
                }
            },
            TreeOperation::Merge(path, data) => match path.path_arguments().split_last() {
                None => {
                    check_identifier(path, root.identifier(), data)?;
                    root.merge(data.clone());
                    Ok(())
                }
                Some((last, parent)) => {
                    check_identifier(path, last, data)?;
                    let children = children_mut(root, parent, path)?;
                    match children.get_mut(last) {
                        Some(existing) => existing.merge(data.clone()),
                        None => {
                            children.insert(last.clone(), data.clone());
                        }
                    }
                    Ok(())
                }
            },
            TreeOperation::Delete(path) => match path.path_arguments().split_last() {
                None => {
                    *root = NormalizedNode::empty_container(root.identifier().clone());
                    Ok(())
                }
                Some((last, parent)) => {
                    if let Some(NormalizedNode::Container { children, .. }) = existing_mut(root, parent) {
                        children.remove(last);
                    }
                    Ok(())
                }
            },
            TreeOperation::Clear(path) => match path.path_arguments().split_last() {
                None => {
                    *root = NormalizedNode::empty_container(root.identifier().clone());
                    Ok(())
                }
                Some((last, parent)) => {
                    let children = children_mut(root, parent, path)?;
                    children.insert(last.clone(), NormalizedNode::empty_container(last.clone()));
                    Ok(())
                }
            },
        }
    }
}

fn check_identifier(path: &InstanceIdentifier, expected: &PathArgument, data: &NormalizedNode) -> DomResult<()> {
    if data.identifier() != expected {
        return Err(DomError::DataValidationFailed {
            path: path.clone(),
            reason: format!("node {} written where {} is expected", data.identifier(), expected),
        });
    }
    Ok(())
}

/// Child map at `parent`, creating missing containers on the way.
fn children_mut<'a>(
    root: &'a mut NormalizedNode,
    parent: &[PathArgument],
    path: &InstanceIdentifier,
) -> DomResult<&'a mut std::collections::BTreeMap<PathArgument, NormalizedNode>> {
    let mut node = root;
    for argument in parent {
        let children = node.child_map_mut().ok_or_else(|| DomError::DataValidationFailed {
            path: path.clone(),
            reason: format!("cannot descend into leaf above {}", argument),
        })?;
        node = children
            .entry(argument.clone())
            .or_insert_with(|| NormalizedNode::empty_container(argument.clone()));
    }
    node.child_map_mut().ok_or_else(|| DomError::DataValidationFailed {
        path: path.clone(),
        reason: "parent node is a leaf".to_string(),
    })
}

fn existing_mut<'a>(root: &'a mut NormalizedNode, path: &[PathArgument]) -> Option<&'a mut NormalizedNode> {
    let mut node = root;
    for argument in path {
        node = node.child_map_mut()?.get_mut(argument)?;
    }
    Some(node)
}

fn overlaps(a: &InstanceIdentifier, b: &InstanceIdentifier) -> bool {
    a.contains(b) || b.contains(a)
}

/// Immutable view of the tree at one version.
#[derive(Clone, Debug)]
pub struct DataTreeSnapshot {
    root: Arc<NormalizedNode>,
    version: u64,
}

impl DataTreeSnapshot {
    /// Version the snapshot was taken at.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Root node.
    pub fn root(&self) -> &NormalizedNode {
        &self.root
    }

    /// Data at `path`, relative to the tree root.
    pub fn read(&self, path: &InstanceIdentifier) -> Option<NormalizedNode> {
        self.root.find(path.path_arguments()).cloned()
    }
}

/// Pending changes against a snapshot of an [`InMemoryDataTree`].
#[derive(Clone, Debug)]
pub struct DataTreeModification {
    base_version: u64,
    origin: Option<ChainId>,
    operations: Vec<TreeOperation>,
    view: NormalizedNode,
}

impl DataTreeModification {
    fn record(&mut self, operation: TreeOperation) -> DomResult<()> {
        trace!("Recording {:?}", operation.path());
        operation.apply(&mut self.view)?;
        self.operations.push(operation);
        Ok(())
    }

    /// Replace the data at `path`.
    pub fn write(&mut self, path: InstanceIdentifier, data: NormalizedNode) -> DomResult<()> {
        self.record(TreeOperation::Write(path, data))
    }

    /// Merge `data` into the node at `path`.
    pub fn merge(&mut self, path: InstanceIdentifier, data: NormalizedNode) -> DomResult<()> {
        self.record(TreeOperation::Merge(path, data))
    }

    /// Remove the node at `path`. Removing nothing is fine.
    pub fn delete(&mut self, path: InstanceIdentifier) -> DomResult<()> {
        self.record(TreeOperation::Delete(path))
    }

    /// Replace the node at `path` with an empty container.
    pub fn clear(&mut self, path: InstanceIdentifier) -> DomResult<()> {
        self.record(TreeOperation::Clear(path))
    }

    /// Data at `path` as this modification sees it.
    pub fn read(&self, path: &InstanceIdentifier) -> Option<NormalizedNode> {
        self.view.find(path.path_arguments()).cloned()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Version of the snapshot this modification started from.
    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    /// Chain the modification belongs to.
    pub fn origin(&self) -> Option<ChainId> {
        self.origin
    }

    fn touched(&self) -> BTreeSet<InstanceIdentifier> {
        self.operations.iter().map(|operation| operation.path().clone()).collect()
    }
}

/// A modification checked against the tree and ready to be installed.
#[derive(Debug)]
pub struct PreparedCommit {
    base_version: u64,
    modification: DataTreeModification,
    after: NormalizedNode,
    candidate: Option<DataTreeCandidateNode>,
}

impl PreparedCommit {
    /// The change this commit makes, `None` when it changes nothing.
    pub fn candidate(&self) -> Option<&DataTreeCandidateNode> {
        self.candidate.as_ref()
    }
}

struct CommitRecord {
    version: u64,
    origin: Option<ChainId>,
    touched: BTreeSet<InstanceIdentifier>,
}

struct TreeState {
    root: Arc<NormalizedNode>,
    version: u64,
    history: VecDeque<CommitRecord>,
}

/// Versioned tree of normalized data.
pub struct InMemoryDataTree {
    history_depth: usize,
    state: RwLock<TreeState>,
}

impl InMemoryDataTree {
    /// Empty tree whose root node is `root_identifier`. The last
    /// `history_depth` commits are kept for conflict detection.
    pub fn new(root_identifier: PathArgument, history_depth: usize) -> Self {
        Self {
            history_depth: history_depth.max(1),
            state: RwLock::new(TreeState {
                root: Arc::new(NormalizedNode::empty_container(root_identifier)),
                version: 0,
                history: VecDeque::new(),
            }),
        }
    }

    /// Current version; bumped by every commit.
    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    /// Snapshot of the current state.
    pub fn take_snapshot(&self) -> DataTreeSnapshot {
        let state = self.state.read();
        DataTreeSnapshot {
            root: Arc::clone(&state.root),
            version: state.version,
        }
    }

    /// Committed data at `path`, relative to the tree root.
    pub fn read(&self, path: &InstanceIdentifier) -> Option<NormalizedNode> {
        self.state.read().root.find(path.path_arguments()).cloned()
    }

    /// Start a modification of the current state on behalf of `origin`.
    pub fn new_modification(&self, origin: Option<ChainId>) -> DataTreeModification {
        let snapshot = self.take_snapshot();
        DataTreeModification {
            base_version: snapshot.version,
            origin,
            operations: Vec::new(),
            view: snapshot.root.as_ref().clone(),
        }
    }

    /// Check `modification` against everything committed since its snapshot.
    pub fn validate(&self, modification: &DataTreeModification) -> DomResult<()> {
        let state = self.state.read();
        check_conflicts(&state, modification)
    }

    /// Validate and compute the outcome of `modification`.
    pub fn prepare(&self, modification: DataTreeModification) -> DomResult<PreparedCommit> {
        let state = self.state.read();
        check_conflicts(&state, &modification)?;
        let after = rebase(&state, &modification)?;
        let candidate = DataTreeCandidateNode::diff(state.root.identifier().clone(), Some(state.root.as_ref()), Some(&after));
        Ok(PreparedCommit {
            base_version: state.version,
            modification,
            after,
            candidate,
        })
    }

    /// Install a prepared commit and return the change it made.
    ///
    /// Commits that landed after preparation are checked for conflicts and
    /// the modification is replayed on top of them.
    pub fn commit(&self, prepared: PreparedCommit) -> DomResult<Option<DataTreeCandidateNode>> {
        let mut state = self.state.write();
        let PreparedCommit {
            base_version,
            modification,
            mut after,
            mut candidate,
        } = prepared;

        if state.version != base_version {
            debug!("Tree moved from version {} to {} since prepare, rebasing", base_version, state.version);
            check_conflicts(&state, &modification)?;
            after = rebase(&state, &modification)?;
            candidate = DataTreeCandidateNode::diff(state.root.identifier().clone(), Some(state.root.as_ref()), Some(&after));
        }

        if candidate.is_none() {
            trace!("Commit on version {} changed nothing", state.version);
            return Ok(None);
        }

        state.version += 1;
        state.root = Arc::new(after);
        let record = CommitRecord {
            version: state.version,
            origin: modification.origin,
            touched: modification.touched(),
        };
        state.history.push_back(record);
        while state.history.len() > self.history_depth {
            state.history.pop_front();
        }
        debug!("Committed version {}", state.version);
        Ok(candidate)
    }
}

fn check_conflicts(state: &TreeState, modification: &DataTreeModification) -> DomResult<()> {
    if modification.base_version == state.version {
        return Ok(());
    }
    let oldest = state.history.front().map_or(state.version + 1, |record| record.version);
    if oldest > modification.base_version + 1 {
        return Err(DomError::OptimisticLockFailed {
            path: InstanceIdentifier::empty(),
            reason: format!(
                "snapshot version {} is older than the retained history",
                modification.base_version
            ),
        });
    }

    let touched = modification.touched();
    for record in state.history.iter().filter(|record| record.version > modification.base_version) {
        if modification.origin.is_some() && record.origin == modification.origin {
            continue;
        }
        for mine in &touched {
            if let Some(theirs) = record.touched.iter().find(|theirs| overlaps(mine, theirs)) {
                return Err(DomError::OptimisticLockFailed {
                    path: mine.clone(),
                    reason: format!("concurrently modified at {} by version {}", theirs, record.version),
                });
            }
        }
    }
    Ok(())
}

fn rebase(state: &TreeState, modification: &DataTreeModification) -> DomResult<NormalizedNode> {
    if modification.base_version == state.version {
        return Ok(modification.view.clone());
    }
    let mut root = state.root.as_ref().clone();
    for operation in &modification.operations {
        operation.apply(&mut root)?;
    }
    Ok(root)
}

/// [`WriteCursor`] recording into a [`DataTreeModification`].
pub struct DataTreeModificationCursor {
    modification: DataTreeModification,
    path: Vec<PathArgument>,
}

impl DataTreeModificationCursor {
    /// Cursor positioned at the tree root.
    pub fn new(modification: DataTreeModification) -> Self {
        Self {
            modification,
            path: Vec::new(),
        }
    }

    /// The modification being written.
    pub fn modification(&self) -> &DataTreeModification {
        &self.modification
    }

    /// Current position relative to the tree root.
    pub fn current_path(&self) -> InstanceIdentifier {
        InstanceIdentifier::new(self.path.clone())
    }

    /// Give back the modification.
    pub fn into_modification(self) -> DataTreeModification {
        self.modification
    }

    fn child_path(&self, child: &PathArgument) -> InstanceIdentifier {
        let mut path = self.path.clone();
        path.push(child.clone());
        InstanceIdentifier::new(path)
    }
}

impl WriteCursor for DataTreeModificationCursor {
    fn enter(&mut self, child: &PathArgument) -> DomResult<()> {
        self.path.push(child.clone());
        Ok(())
    }

    fn exit(&mut self) -> DomResult<()> {
        match self.path.pop() {
            Some(_) => Ok(()),
            None => Err(DomError::IllegalState("cursor is already at the tree root".to_string())),
        }
    }

    fn delete(&mut self, child: &PathArgument) -> DomResult<()> {
        let path = self.child_path(child);
        self.modification.delete(path)
    }

    fn merge(&mut self, child: &PathArgument, data: NormalizedNode) -> DomResult<()> {
        let path = self.child_path(child);
        self.modification.merge(path, data)
    }

    fn write(&mut self, child: &PathArgument, data: NormalizedNode) -> DomResult<()> {
        let path = self.child_path(child);
        self.modification.write(path, data)
    }

    fn clear(&mut self) -> DomResult<()> {
        let path = self.current_path();
        self.modification.clear(path)
    }

    fn close(&mut self) -> DomResult<()> {
        self.path.clear();
        Ok(())
    }
}
