//! Data-tree candidates: before/after diffs of one committed change.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{DomError, DomResult};
use crate::types::{InstanceIdentifier, NormalizedNode, PathArgument};

/// How a candidate node was modified.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModificationType {
    /// Neither the node nor any descendant changed.
    Unmodified,
    /// The node was written (created or replaced).
    Write,
    /// The node was deleted.
    Delete,
    /// Some descendant changed.
    SubtreeModified,
    /// A non-presence container came into existence through a child.
    Appeared,
    /// A non-presence container vanished because its last child went away.
    Disappeared,
}

impl fmt::Display for ModificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModificationType::Unmodified => "UNMODIFIED",
            ModificationType::Write => "WRITE",
            ModificationType::Delete => "DELETE",
            ModificationType::SubtreeModified => "SUBTREE_MODIFIED",
            ModificationType::Appeared => "APPEARED",
            ModificationType::Disappeared => "DISAPPEARED",
        };
        f.write_str(name)
    }
}

/// One node of a candidate tree.
#[derive(Clone, Debug, PartialEq)]
pub struct DataTreeCandidateNode {
    identifier: PathArgument,
    modification_type: ModificationType,
    data_before: Option<NormalizedNode>,
    data_after: Option<NormalizedNode>,
    children: Vec<Arc<DataTreeCandidateNode>>,
}

impl DataTreeCandidateNode {
    /// A node with no recorded children.
    pub fn terminal(
        identifier: PathArgument,
        modification_type: ModificationType,
        data_before: Option<NormalizedNode>,
        data_after: Option<NormalizedNode>,
    ) -> Self {
        Self {
            identifier,
            modification_type,
            data_before,
            data_after,
            children: Vec::new(),
        }
    }

    /// A node with explicit children.
    pub fn with_children(
        identifier: PathArgument,
        modification_type: ModificationType,
        data_before: Option<NormalizedNode>,
        data_after: Option<NormalizedNode>,
        children: Vec<DataTreeCandidateNode>,
    ) -> Self {
        Self {
            identifier,
            modification_type,
            data_before,
            data_after,
            children: children.into_iter().map(Arc::new).collect(),
        }
    }

    /// An unmodified node whose data stays `data`.
    pub fn unmodified(identifier: PathArgument, data: Option<NormalizedNode>) -> Self {
        Self::terminal(identifier, ModificationType::Unmodified, data.clone(), data)
    }

    /// A WRITE of `node` over nothing, with every descendant reported as
    /// written too. Used for initial notifications.
    pub fn written(node: &NormalizedNode) -> Self {
        match Self::diff(node.identifier().clone(), None, Some(node)) {
            Some(candidate) => candidate,
            None => Self::unmodified(node.identifier().clone(), Some(node.clone())),
        }
    }

    /// Structural difference between two versions of one node.
    ///
    /// Returns `None` when both sides are equal. Containers present on both
    /// sides are reported as [`ModificationType::SubtreeModified`] with one
    /// child per changed child; everything else is a WRITE or a DELETE.
    pub fn diff(
        identifier: PathArgument,
        before: Option<&NormalizedNode>,
        after: Option<&NormalizedNode>,
    ) -> Option<Self> {
        let modification_type = match (before, after) {
            (None, None) => return None,
            (Some(b), Some(a)) if b == a => return None,
            (None, Some(_)) => ModificationType::Write,
            (Some(_), None) => ModificationType::Delete,
            (Some(b), Some(a)) if b.is_container() && a.is_container() => {
                ModificationType::SubtreeModified
            }
            (Some(_), Some(_)) => ModificationType::Write,
        };

        let keys: BTreeSet<&PathArgument> = before
            .into_iter()
            .chain(after)
            .flat_map(|node| node.children().map(NormalizedNode::identifier))
            .collect();

        let children = keys
            .into_iter()
            .filter_map(|key| {
                Self::diff(
                    key.clone(),
                    before.and_then(|b| b.child(key)),
                    after.and_then(|a| a.child(key)),
                )
            })
            .map(Arc::new)
            .collect();

        Some(Self {
            identifier,
            modification_type,
            data_before: before.cloned(),
            data_after: after.cloned(),
            children,
        })
    }

    /// Node identifier.
    pub fn identifier(&self) -> &PathArgument {
        &self.identifier
    }

    /// Modification type.
    pub fn modification_type(&self) -> ModificationType {
        self.modification_type
    }

    /// Data before the change.
    pub fn data_before(&self) -> Option<&NormalizedNode> {
        self.data_before.as_ref()
    }

    /// Data after the change.
    pub fn data_after(&self) -> Option<&NormalizedNode> {
        self.data_after.as_ref()
    }

    /// Modified children.
    pub fn children(&self) -> &[Arc<DataTreeCandidateNode>] {
        &self.children
    }

    /// Modified child with the given identifier.
    pub fn child(&self, identifier: &PathArgument) -> Option<&Arc<DataTreeCandidateNode>> {
        self.children.iter().find(|child| child.identifier() == identifier)
    }
}

/// A change rooted at a path.
#[derive(Clone, Debug, PartialEq)]
pub struct DataTreeCandidate {
    root_path: InstanceIdentifier,
    root_node: Arc<DataTreeCandidateNode>,
}

impl DataTreeCandidate {
    /// Create a candidate.
    pub fn new(root_path: InstanceIdentifier, root_node: impl Into<Arc<DataTreeCandidateNode>>) -> Self {
        Self {
            root_path,
            root_node: root_node.into(),
        }
    }

    /// Path of the root node.
    pub fn root_path(&self) -> &InstanceIdentifier {
        &self.root_path
    }

    /// Root node of the change.
    pub fn root_node(&self) -> &Arc<DataTreeCandidateNode> {
        &self.root_node
    }

    /// The same change re-rooted below `prefix`.
    pub fn prefixed(&self, prefix: &InstanceIdentifier) -> Self {
        Self {
            root_path: prefix.join(&self.root_path),
            root_node: Arc::clone(&self.root_node),
        }
    }
}

/// Fold a sequence of changes of one path into a single change.
pub fn compress_candidates(input: &[DataTreeCandidate]) -> DomResult<DataTreeCandidate> {
    let (first, rest) = input
        .split_first()
        .ok_or_else(|| DomError::IllegalArgument("input must not be empty".to_string()))?;
    if rest.is_empty() {
        return Ok(first.clone());
    }

    let root_path = first.root_path();
    let mut roots = Vec::with_capacity(input.len());
    for candidate in input {
        if candidate.root_path() != root_path {
            return Err(DomError::IllegalArgument(format!(
                "expecting root path {}, encountered {}",
                root_path,
                candidate.root_path()
            )));
        }
        roots.push(candidate.root_node().as_ref());
    }

    Ok(DataTreeCandidate::new(root_path.clone(), compress_nodes(&roots)?))
}

fn compress_nodes(input: &[&DataTreeCandidateNode]) -> DomResult<DataTreeCandidateNode> {
    let (first, last) = match (input.first(), input.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => return Err(DomError::IllegalArgument("no nodes to compress".to_string())),
    };
    if input.len() == 1 {
        return Ok(first.clone());
    }

    match last.modification_type() {
        ModificationType::Delete | ModificationType::Write => Ok(DataTreeCandidateNode::terminal(
            last.identifier().clone(),
            last.modification_type(),
            first.data_before().cloned(),
            last.data_after().cloned(),
        )),
        _ => slow_compress_nodes(first, input),
    }
}

fn slow_compress_nodes(
    first: &DataTreeCandidateNode,
    input: &[&DataTreeCandidateNode],
) -> DomResult<DataTreeCandidateNode> {
    use ModificationType::*;

    let illegal = |event: &str, state: ModificationType| {
        DomError::IllegalArgument(format!("{} event on {} node", event, state))
    };

    let mut significant: Vec<&DataTreeCandidateNode> = Vec::with_capacity(input.len());
    let mut mod_type = Unmodified;
    for &node in input {
        match node.modification_type() {
            Unmodified => continue,
            Delete | Write => {
                mod_type = node.modification_type();
                significant.clear();
            }
            SubtreeModified => match mod_type {
                Appeared | SubtreeModified | Write => {}
                Unmodified => mod_type = SubtreeModified,
                Delete | Disappeared => return Err(illegal("subtree modification", mod_type)),
            },
            Appeared => match mod_type {
                Delete => mod_type = Write,
                Disappeared => mod_type = SubtreeModified,
                Unmodified => mod_type = Appeared,
                Appeared | SubtreeModified | Write => return Err(illegal("appear", mod_type)),
            },
            Disappeared => match mod_type {
                Appeared => mod_type = SubtreeModified,
                SubtreeModified | Unmodified => mod_type = Disappeared,
                Write => mod_type = Delete,
                Delete | Disappeared => return Err(illegal("disappear", mod_type)),
            },
        }
        significant.push(node);
    }

    let identifier = first.identifier().clone();
    let before = first.data_before().cloned();
    let require_before = |state: ModificationType| {
        if before.is_none() {
            Err(DomError::IllegalArgument(format!("{} result without prior data", state)))
        } else {
            Ok(())
        }
    };

    match mod_type {
        Unmodified => Ok(DataTreeCandidateNode::unmodified(identifier, before)),
        Delete => {
            require_before(Delete)?;
            Ok(DataTreeCandidateNode::terminal(identifier, Delete, before, None))
        }
        Write => match significant.as_slice() {
            [only] => Ok(DataTreeCandidateNode::terminal(
                identifier,
                Write,
                before,
                only.data_after().cloned(),
            )),
            _ => Err(DomError::Unsupported(format!(
                "compressing {} writes into one node",
                significant.len()
            ))),
        },
        Appeared => {
            if before.is_some() {
                return Err(DomError::IllegalArgument(
                    "APPEARED result over existing data".to_string(),
                ));
            }
            Err(DomError::Unsupported("compressing into an APPEARED node".to_string()))
        }
        Disappeared | SubtreeModified => {
            require_before(mod_type)?;
            Err(DomError::Unsupported(format!("compressing into a {} node", mod_type)))
        }
    }
}
