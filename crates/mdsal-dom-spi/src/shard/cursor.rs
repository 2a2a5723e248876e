//! Write cursors and the per-level strategies composing them.

use crate::error::{DomError, DomResult};
use crate::types::{NormalizedNode, PathArgument};

/// Positional writer over a data tree.
///
/// The cursor starts at some node; `enter`/`exit` move it up and down, and
/// modifications address direct children of the current node.
pub trait WriteCursor: Send {
    /// Descend into `child`. The child does not need to exist.
    fn enter(&mut self, child: &PathArgument) -> DomResult<()>;

    /// Descend along `path`.
    fn enter_path(&mut self, path: &[PathArgument]) -> DomResult<()> {
        path.iter().try_for_each(|argument| self.enter(argument))
    }

    /// Return to the parent of the current node.
    fn exit(&mut self) -> DomResult<()>;

    /// Return `depth` levels up.
    fn exit_n(&mut self, depth: usize) -> DomResult<()> {
        (0..depth).try_for_each(|_| self.exit())
    }

    /// Remove `child` of the current node.
    fn delete(&mut self, child: &PathArgument) -> DomResult<()>;

    /// Merge `data` into `child` of the current node.
    fn merge(&mut self, child: &PathArgument, data: NormalizedNode) -> DomResult<()>;

    /// Replace `child` of the current node with `data`.
    fn write(&mut self, child: &PathArgument, data: NormalizedNode) -> DomResult<()>;

    /// Replace the current node with an empty container.
    fn clear(&mut self) -> DomResult<()>;

    /// Finish using the cursor.
    fn close(&mut self) -> DomResult<()>;
}

/// Behavior of a composed cursor at one level of the tree.
///
/// `local` is the cursor of the shard doing the composition; strategies for
/// levels owned by another shard ignore it except when leaving that shard.
pub trait WriteCursorStrategy: Send {
    /// Descend into `child`, returning the strategy for that level.
    fn enter(&self, local: &mut dyn WriteCursor, child: &PathArgument) -> DomResult<Box<dyn WriteCursorStrategy>>;

    /// Remove `child`.
    fn delete(&self, local: &mut dyn WriteCursor, child: &PathArgument) -> DomResult<()>;

    /// Merge `data` into `child`.
    fn merge(&self, local: &mut dyn WriteCursor, child: &PathArgument, data: NormalizedNode) -> DomResult<()>;

    /// Replace `child` with `data`.
    fn write(&self, local: &mut dyn WriteCursor, child: &PathArgument, data: NormalizedNode) -> DomResult<()>;

    /// Merge the children of container `data` into the current node.
    fn merge_to_current(&self, local: &mut dyn WriteCursor, data: NormalizedNode) -> DomResult<()>;

    /// Replace the current node's children with those of container `data`.
    fn write_to_current(&self, local: &mut dyn WriteCursor, data: NormalizedNode) -> DomResult<()>;

    /// Empty the current node.
    fn clear(&self, local: &mut dyn WriteCursor) -> DomResult<()>;

    /// Leave the level this strategy was created for.
    fn exit(&self, local: &mut dyn WriteCursor) -> DomResult<()>;
}

/// Children of a container, in identifier order.
pub(crate) fn container_children(data: NormalizedNode) -> DomResult<Vec<NormalizedNode>> {
    match data {
        NormalizedNode::Container { children, .. } => Ok(children.into_values().collect()),
        NormalizedNode::Leaf { identifier, .. } => Err(DomError::IllegalArgument(format!(
            "{} is not a container",
            identifier
        ))),
    }
}

/// Levels without shard boundaries below them: everything goes to the local
/// cursor.
#[derive(Debug, Default, Clone, Copy)]
pub struct DelegatingStrategy;

impl WriteCursorStrategy for DelegatingStrategy {
    fn enter(&self, local: &mut dyn WriteCursor, child: &PathArgument) -> DomResult<Box<dyn WriteCursorStrategy>> {
        local.enter(child)?;
        Ok(Box::new(DelegatingStrategy))
    }

    fn delete(&self, local: &mut dyn WriteCursor, child: &PathArgument) -> DomResult<()> {
        local.delete(child)
    }

    fn merge(&self, local: &mut dyn WriteCursor, child: &PathArgument, data: NormalizedNode) -> DomResult<()> {
        local.merge(child, data)
    }

    fn write(&self, local: &mut dyn WriteCursor, child: &PathArgument, data: NormalizedNode) -> DomResult<()> {
        local.write(child, data)
    }

    fn merge_to_current(&self, local: &mut dyn WriteCursor, data: NormalizedNode) -> DomResult<()> {
        for child in container_children(data)? {
            let identifier = child.identifier().clone();
            local.merge(&identifier, child)?;
        }
        Ok(())
    }

    fn write_to_current(&self, local: &mut dyn WriteCursor, data: NormalizedNode) -> DomResult<()> {
        let children = container_children(data)?;
        local.clear()?;
        for child in children {
            let identifier = child.identifier().clone();
            local.write(&identifier, child)?;
        }
        Ok(())
    }

    fn clear(&self, local: &mut dyn WriteCursor) -> DomResult<()> {
        local.clear()
    }

    fn exit(&self, local: &mut dyn WriteCursor) -> DomResult<()> {
        local.exit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::test_support::RecordingCursor;

    #[test]
    fn test_enter_path_and_exit_n() {
        let (mut cursor, log) = RecordingCursor::new("local");
        let path = vec![PathArgument::node("a"), PathArgument::node("b")];
        cursor.enter_path(&path).unwrap();
        cursor.write(&PathArgument::node("c"), NormalizedNode::leaf(PathArgument::node("c"), 1)).unwrap();
        cursor.exit_n(2).unwrap();
        assert!(cursor.exit().is_err());
        assert_eq!(*log.lock(), vec!["local write /a/b/c"]);
    }

    #[test]
    fn test_delegating_write_to_current_clears_first() {
        let (mut cursor, log) = RecordingCursor::new("local");
        cursor.enter(&PathArgument::node("top")).unwrap();
        let data = NormalizedNode::container(
            PathArgument::node("top"),
            vec![
                NormalizedNode::leaf(PathArgument::node("x"), 1),
                NormalizedNode::leaf(PathArgument::node("y"), 2),
            ],
        );
        DelegatingStrategy.write_to_current(&mut cursor, data).unwrap();
        assert_eq!(
            *log.lock(),
            vec!["local clear /top", "local write /top/x", "local write /top/y"]
        );
    }

    #[test]
    fn test_container_children_rejects_leaf() {
        let leaf = NormalizedNode::leaf(PathArgument::node("x"), 1);
        assert!(matches!(container_children(leaf), Err(DomError::IllegalArgument(_))));
    }
}
