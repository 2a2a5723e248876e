//! Data-tree addressing and content types shared by every DOM component.
//!
//! Paths are sequences of [`PathArgument`]s. List entries and leaf-list
//! entries carry predicates; their [`PathArgument::wildcard`] form is what a
//! listener registers on when it wants every entry of a list.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomError, DomResult};

/// Qualified name of a schema node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QName(String);

impl QName {
    /// Create a qualified name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Name of the implicit container at the root of every data tree.
    pub fn root() -> Self {
        Self("data".to_string())
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Value held by a leaf or used as a list key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    /// Boolean value.
    Bool(bool),
    /// Signed integer value.
    Int(i64),
    /// String value.
    Str(String),
}

impl Value {
    fn parse(text: &str) -> Self {
        match text {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => text
                .parse::<i64>()
                .map(Value::Int)
                .unwrap_or_else(|_| Value::Str(text.to_string())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Str(v) => f.write_str(v),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// One step of a path through the data tree.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PathArgument {
    /// Plain node: container, list or leaf.
    Node(QName),
    /// List entry selected by its key leaves.
    Entry {
        /// List name.
        name: QName,
        /// Key leaf values.
        keys: BTreeMap<QName, Value>,
    },
    /// Leaf-list entry selected by its value.
    LeafValue {
        /// Leaf-list name.
        name: QName,
        /// Entry value.
        value: Value,
    },
}

impl PathArgument {
    /// Plain node argument.
    pub fn node(name: impl Into<String>) -> Self {
        PathArgument::Node(QName::new(name))
    }

    /// List entry argument with a single key leaf.
    pub fn entry(name: impl Into<String>, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(QName::new(key), value.into());
        PathArgument::Entry {
            name: QName::new(name),
            keys,
        }
    }

    /// Leaf-list entry argument.
    pub fn leaf_value(name: impl Into<String>, value: impl Into<Value>) -> Self {
        PathArgument::LeafValue {
            name: QName::new(name),
            value: value.into(),
        }
    }

    /// The schema node name this argument addresses.
    pub fn node_type(&self) -> &QName {
        match self {
            PathArgument::Node(name) => name,
            PathArgument::Entry { name, .. } => name,
            PathArgument::LeafValue { name, .. } => name,
        }
    }

    /// The predicate-free form matching every entry of the same list or
    /// leaf-list, or `None` for plain node arguments.
    pub fn wildcard(&self) -> Option<PathArgument> {
        match self {
            PathArgument::Node(_) => None,
            PathArgument::Entry { name, .. } | PathArgument::LeafValue { name, .. } => {
                Some(PathArgument::Node(name.clone()))
            }
        }
    }

    fn parse(segment: &str, input: &str) -> DomResult<Self> {
        let invalid = |reason: &str| DomError::InvalidPath {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let Some(open) = segment.find('[') else {
            if segment.is_empty() {
                return Err(invalid("empty path segment"));
            }
            return Ok(PathArgument::node(segment));
        };

        let name = &segment[..open];
        if name.is_empty() {
            return Err(invalid("missing node name before predicate"));
        }
        let predicate = segment[open + 1..]
            .strip_suffix(']')
            .ok_or_else(|| invalid("unterminated predicate"))?;

        if let Some(value) = predicate.strip_prefix(".=") {
            return Ok(PathArgument::leaf_value(name, Value::parse(value)));
        }

        let mut keys = BTreeMap::new();
        for pair in predicate.split(',') {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| invalid("predicate must be key=value"))?;
            if key.is_empty() {
                return Err(invalid("empty key name"));
            }
            keys.insert(QName::new(key), Value::parse(value));
        }
        Ok(PathArgument::Entry {
            name: QName::new(name),
            keys,
        })
    }
}

impl fmt::Display for PathArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathArgument::Node(name) => write!(f, "{}", name),
            PathArgument::Entry { name, keys } => {
                write!(f, "{}[", name)?;
                for (i, (key, value)) in keys.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}={}", key, value)?;
                }
                f.write_str("]")
            }
            PathArgument::LeafValue { name, value } => write!(f, "{}[.={}]", name, value),
        }
    }
}

/// Absolute or relative path into a data tree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceIdentifier(Vec<PathArgument>);

impl InstanceIdentifier {
    /// The empty path, addressing the root of a tree.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Build a path from its arguments.
    pub fn new(arguments: Vec<PathArgument>) -> Self {
        Self(arguments)
    }

    /// Path arguments, root first.
    pub fn path_arguments(&self) -> &[PathArgument] {
        &self.0
    }

    /// Whether this is the empty path.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of path arguments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Last path argument, if any.
    pub fn last_argument(&self) -> Option<&PathArgument> {
        self.0.last()
    }

    /// Child path.
    pub fn node(&self, child: PathArgument) -> Self {
        let mut arguments = self.0.clone();
        arguments.push(child);
        Self(arguments)
    }

    /// Concatenation of this path and a relative one.
    pub fn join(&self, relative: &InstanceIdentifier) -> Self {
        let mut arguments = self.0.clone();
        arguments.extend(relative.0.iter().cloned());
        Self(arguments)
    }

    /// Parent path, `None` for the empty path.
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Whether `other` is equal to or a descendant of this path.
    pub fn contains(&self, other: &InstanceIdentifier) -> bool {
        other.0.starts_with(&self.0)
    }

    /// The part of this path below `prefix`, if `prefix` contains it.
    pub fn relative_to(&self, prefix: &InstanceIdentifier) -> Option<Self> {
        self.0
            .strip_prefix(prefix.0.as_slice())
            .map(|rest| Self(rest.to_vec()))
    }
}

impl fmt::Display for InstanceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for argument in &self.0 {
            write!(f, "/{}", argument)?;
        }
        Ok(())
    }
}

impl FromStr for InstanceIdentifier {
    type Err = DomError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let body = trimmed.strip_prefix('/').ok_or_else(|| DomError::InvalidPath {
            input: input.to_string(),
            reason: "path must start with '/'".to_string(),
        })?;
        if body.is_empty() {
            return Ok(Self::empty());
        }
        body.split('/')
            .map(|segment| PathArgument::parse(segment, input))
            .collect::<DomResult<Vec<_>>>()
            .map(Self)
    }
}

impl From<Vec<PathArgument>> for InstanceIdentifier {
    fn from(arguments: Vec<PathArgument>) -> Self {
        Self(arguments)
    }
}

impl FromIterator<PathArgument> for InstanceIdentifier {
    fn from_iter<I: IntoIterator<Item = PathArgument>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A node of normalized data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormalizedNode {
    /// Terminal value.
    Leaf {
        /// Node identifier.
        identifier: PathArgument,
        /// Leaf value.
        value: Value,
    },
    /// Interior node: container, list, list entry or leaf-list.
    Container {
        /// Node identifier.
        identifier: PathArgument,
        /// Children keyed by their identifiers.
        children: BTreeMap<PathArgument, NormalizedNode>,
    },
}

impl NormalizedNode {
    /// Leaf node.
    pub fn leaf(identifier: PathArgument, value: impl Into<Value>) -> Self {
        NormalizedNode::Leaf {
            identifier,
            value: value.into(),
        }
    }

    /// Container node holding the given children.
    pub fn container(identifier: PathArgument, children: impl IntoIterator<Item = NormalizedNode>) -> Self {
        NormalizedNode::Container {
            identifier,
            children: children
                .into_iter()
                .map(|child| (child.identifier().clone(), child))
                .collect(),
        }
    }

    /// Empty container with the given identifier.
    pub fn empty_container(identifier: PathArgument) -> Self {
        NormalizedNode::Container {
            identifier,
            children: BTreeMap::new(),
        }
    }

    /// Empty root container of a data tree.
    pub fn empty_root() -> Self {
        Self::empty_container(PathArgument::Node(QName::root()))
    }

    /// Node identifier.
    pub fn identifier(&self) -> &PathArgument {
        match self {
            NormalizedNode::Leaf { identifier, .. } => identifier,
            NormalizedNode::Container { identifier, .. } => identifier,
        }
    }

    /// Whether the node can have children.
    pub fn is_container(&self) -> bool {
        matches!(self, NormalizedNode::Container { .. })
    }

    /// Child map of a container, `None` for leaves.
    pub fn child_map(&self) -> Option<&BTreeMap<PathArgument, NormalizedNode>> {
        match self {
            NormalizedNode::Container { children, .. } => Some(children),
            NormalizedNode::Leaf { .. } => None,
        }
    }

    /// Mutable child map of a container, `None` for leaves.
    pub fn child_map_mut(&mut self) -> Option<&mut BTreeMap<PathArgument, NormalizedNode>> {
        match self {
            NormalizedNode::Container { children, .. } => Some(children),
            NormalizedNode::Leaf { .. } => None,
        }
    }

    /// Iterate over the children; leaves have none.
    pub fn children(&self) -> impl Iterator<Item = &NormalizedNode> + '_ {
        self.child_map().into_iter().flat_map(|children| children.values())
    }

    /// Direct child lookup.
    pub fn child(&self, argument: &PathArgument) -> Option<&NormalizedNode> {
        self.child_map().and_then(|children| children.get(argument))
    }

    /// Descendant lookup along a relative path.
    pub fn find(&self, path: &[PathArgument]) -> Option<&NormalizedNode> {
        path.iter().try_fold(self, |node, argument| node.child(argument))
    }

    /// Merge `other` into this node: containers merge child by child, anything
    /// else is replaced.
    pub fn merge(&mut self, other: NormalizedNode) {
        match other {
            NormalizedNode::Container { children: incoming, .. } if self.is_container() => {
                let Some(children) = self.child_map_mut() else {
                    return;
                };
                for (argument, child) in incoming {
                    match children.get_mut(&argument) {
                        Some(existing) => existing.merge(child),
                        None => {
                            children.insert(argument, child);
                        }
                    }
                }
            }
            other => *self = other,
        }
    }
}
