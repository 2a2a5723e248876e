//! Write transactions against an in-memory shard and its child shards.

use std::fmt;
use std::sync::Arc;

use mdsal_dom_spi::shard::submit;
use mdsal_dom_spi::shard::ShardDataModificationCursor;
use mdsal_dom_spi::{
    AggregateCommitCohort, DomError, DomResult, InstanceIdentifier, NormalizedNode, PathArgument,
    ShardDataModification, ShardWriteTransaction, ThreePhaseCommitCohort, TransactionId, WriteCursor,
};
use tracing::{debug, trace, warn};

use crate::cohort::LocalShardCohort;
use crate::data_tree::{DataTreeModification, DataTreeModificationCursor};
use crate::shard::InMemoryDataTreeShard;

type ComposedCursor = ShardDataModificationCursor<DataTreeModificationCursor>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TxState {
    Open,
    Ready,
    Committed,
    Aborted,
    Closed,
}

/// Write transaction over one shard. Writes below an attached child shard go
/// to a transaction of that child; all of them commit together.
pub struct InMemoryShardWriteTransaction {
    id: TransactionId,
    shard: Arc<InMemoryDataTreeShard>,
    modification: ShardDataModification,
    local: Option<DataTreeModification>,
    cursor: Option<ComposedCursor>,
    cohort: Option<AggregateCommitCohort>,
    state: TxState,
}

impl InMemoryShardWriteTransaction {
    pub(crate) fn new(
        id: TransactionId,
        shard: Arc<InMemoryDataTreeShard>,
        modification: ShardDataModification,
        local: DataTreeModification,
    ) -> Self {
        Self {
            id,
            shard,
            modification,
            local: Some(local),
            cursor: None,
            cohort: None,
            state: TxState::Open,
        }
    }

    /// The shard written to.
    pub fn shard(&self) -> &Arc<InMemoryDataTreeShard> {
        &self.shard
    }

    /// Whether the transaction still accepts writes.
    pub fn is_open(&self) -> bool {
        self.state == TxState::Open
    }

    fn check_state(&self, expected: TxState, operation: &str) -> DomResult<()> {
        if self.state != expected {
            return Err(DomError::IllegalState(format!(
                "cannot {} transaction {} in state {:?}",
                operation, self.id, self.state
            )));
        }
        Ok(())
    }

    fn open_cursor(&mut self) -> DomResult<&mut ComposedCursor> {
        self.check_state(TxState::Open, "write")?;
        match &mut self.cursor {
            Some(cursor) => Ok(cursor),
            slot => {
                let local = self
                    .local
                    .take()
                    .ok_or_else(|| DomError::IllegalState(format!("transaction {} lost its modification", self.id)))?;
                trace!("Opening cursor of transaction {}", self.id);
                Ok(slot.insert(self.modification.create_cursor(DataTreeModificationCursor::new(local))))
            }
        }
    }

    fn root_cursor(&mut self) -> DomResult<&mut ComposedCursor> {
        let cursor = self.open_cursor()?;
        if cursor.depth() != 0 {
            return Err(DomError::IllegalState("cursor is not positioned at the shard root".to_string()));
        }
        Ok(cursor)
    }

    fn close_open_cursor(&mut self) -> DomResult<()> {
        let Some(mut cursor) = self.cursor.take() else {
            return Ok(());
        };
        let closed = cursor.close();
        self.local = Some(cursor.into_local().into_modification());
        closed
    }

    /// Run `apply` on the parent of `path` with the last path argument.
    fn at_parent<F>(&mut self, relative: &InstanceIdentifier, apply: F) -> DomResult<()>
    where
        F: FnOnce(&mut dyn WriteCursor, &PathArgument) -> DomResult<()>,
    {
        let Some((last, parent)) = relative.path_arguments().split_last() else {
            return Err(DomError::IllegalArgument("path addresses the shard root".to_string()));
        };
        let cursor = self.root_cursor()?;
        let result = cursor.enter_path(parent).and_then(|()| apply(&mut *cursor, last));
        let unwound = cursor.exit_n(cursor.depth());
        result.and(unwound)
    }

    /// Replace the data at the absolute `path`.
    pub fn write(&mut self, path: &InstanceIdentifier, data: NormalizedNode) -> DomResult<()> {
        let relative = self.shard.relative(path)?;
        if relative.is_empty() {
            let children = root_children(path, data)?;
            let cursor = self.root_cursor()?;
            cursor.clear()?;
            for child in children {
                let identifier = child.identifier().clone();
                cursor.write(&identifier, child)?;
            }
            return Ok(());
        }
        self.at_parent(&relative, |cursor, last| cursor.write(last, data))
    }

    /// Merge `data` into the absolute `path`.
    pub fn merge(&mut self, path: &InstanceIdentifier, data: NormalizedNode) -> DomResult<()> {
        let relative = self.shard.relative(path)?;
        if relative.is_empty() {
            let children = root_children(path, data)?;
            let cursor = self.root_cursor()?;
            for child in children {
                let identifier = child.identifier().clone();
                cursor.merge(&identifier, child)?;
            }
            return Ok(());
        }
        self.at_parent(&relative, |cursor, last| cursor.merge(last, data))
    }

    /// Remove the data at the absolute `path`.
    pub fn delete(&mut self, path: &InstanceIdentifier) -> DomResult<()> {
        let relative = self.shard.relative(path)?;
        if relative.is_empty() {
            return self.root_cursor()?.clear();
        }
        self.at_parent(&relative, |cursor, last| cursor.delete(last))
    }

    /// Data at the absolute `path`: this transaction's writes to the shard
    /// itself, and committed data of child shards.
    pub fn read(&self, path: &InstanceIdentifier) -> DomResult<Option<NormalizedNode>> {
        self.check_state(TxState::Open, "read")?;
        let relative = self.shard.relative(path)?;
        if let Some(child) = self.shard.owning_child(path) {
            return child.read(path);
        }
        let local = match (&self.local, &self.cursor) {
            (Some(modification), _) => modification.read(&relative),
            (None, Some(cursor)) => cursor.local().modification().read(&relative),
            (None, None) => None,
        };
        self.shard.graft_children(path, local)
    }

    /// Ready the transaction if needed and run the whole three-phase commit.
    /// The transaction is closed afterwards either way.
    pub fn submit(&mut self) -> DomResult<()> {
        if self.state == TxState::Open {
            ShardWriteTransaction::ready(self)?;
        }
        let id = self.id;
        let result = match self.cohort.as_mut() {
            Some(cohort) if self.state == TxState::Ready => submit(id, cohort),
            _ => Err(DomError::IllegalState(format!("transaction {} is not ready", id))),
        };
        match &result {
            Ok(()) => {
                self.state = TxState::Committed;
                debug!("Transaction {} committed to shard {}", id, self.shard.prefix());
            }
            Err(e) => {
                self.state = TxState::Aborted;
                warn!("Transaction {} failed on shard {}: {}", id, self.shard.prefix(), e);
            }
        }
        let closed = ShardWriteTransaction::close(self);
        result.and(closed)
    }

    fn ready_cohort(&mut self, phase: &str) -> DomResult<&mut AggregateCommitCohort> {
        self.check_state(TxState::Ready, phase)?;
        self.cohort
            .as_mut()
            .ok_or_else(|| DomError::IllegalState(format!("transaction {} has no cohort", self.id)))
    }
}

fn root_children(path: &InstanceIdentifier, data: NormalizedNode) -> DomResult<Vec<NormalizedNode>> {
    match data {
        NormalizedNode::Container { children, .. } => Ok(children.into_values().collect()),
        NormalizedNode::Leaf { .. } => Err(DomError::DataValidationFailed {
            path: path.clone(),
            reason: "shard root must be a container".to_string(),
        }),
    }
}

impl ShardWriteTransaction for InMemoryShardWriteTransaction {
    fn identifier(&self) -> TransactionId {
        self.id
    }

    fn cursor(&mut self, prefix: &InstanceIdentifier) -> DomResult<&mut dyn WriteCursor> {
        if self.cursor.is_none() {
            let relative = self.shard.relative(prefix)?;
            let cursor = self.open_cursor()?;
            cursor.enter_path(relative.path_arguments())?;
        }
        Ok(self.open_cursor()?)
    }

    fn close_cursor(&mut self) -> DomResult<()> {
        self.close_open_cursor()
    }

    fn ready(&mut self) -> DomResult<()> {
        self.check_state(TxState::Open, "ready")?;
        self.close_open_cursor()?;
        self.modification.seal()?;
        let local = self
            .local
            .take()
            .ok_or_else(|| DomError::IllegalState(format!("transaction {} lost its modification", self.id)))?;

        let mut cohort = AggregateCommitCohort::default();
        cohort.push(Box::new(LocalShardCohort::new(Arc::clone(&self.shard), local)));
        for foreign in self.modification.cohorts() {
            cohort.push(foreign);
        }
        debug!("Transaction {} ready with {} participants", self.id, cohort.len());
        self.cohort = Some(cohort);
        self.state = TxState::Ready;
        Ok(())
    }

    fn validate(&mut self) -> DomResult<bool> {
        self.ready_cohort("validate")?.can_commit()
    }

    fn prepare(&mut self) -> DomResult<()> {
        self.ready_cohort("prepare")?.pre_commit()
    }

    fn commit(&mut self) -> DomResult<()> {
        self.ready_cohort("commit")?.commit()?;
        self.state = TxState::Committed;
        Ok(())
    }

    fn abort(&mut self) -> DomResult<()> {
        debug!("Aborting transaction {}", self.id);
        self.state = TxState::Aborted;
        self.cursor = None;
        match self.cohort.as_mut() {
            Some(cohort) => cohort.abort(),
            None => self
                .modification
                .child_shards()
                .values()
                .try_for_each(|context| context.lock().abort()),
        }
    }

    fn close(&mut self) -> DomResult<()> {
        if self.state == TxState::Closed {
            return Ok(());
        }
        self.state = TxState::Closed;
        self.cursor = None;
        self.cohort = None;
        self.modification.close()
    }
}

impl fmt::Debug for InMemoryShardWriteTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryShardWriteTransaction")
            .field("id", &self.id)
            .field("shard", self.shard.prefix())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdsal_dom_spi::ChainId;

    fn path(text: &str) -> InstanceIdentifier {
        text.parse().unwrap()
    }

    fn leaf(name: &str, value: i64) -> NormalizedNode {
        NormalizedNode::leaf(PathArgument::node(name), value)
    }

    fn container(name: &str, children: Vec<NormalizedNode>) -> NormalizedNode {
        NormalizedNode::container(PathArgument::node(name), children)
    }

    fn shards() -> (Arc<InMemoryDataTreeShard>, Arc<InMemoryDataTreeShard>) {
        let parent = InMemoryDataTreeShard::new(path("/top"), 16);
        let child = InMemoryDataTreeShard::new(path("/top/inner/child"), 16);
        parent.attach_child(Arc::clone(&child)).unwrap();
        (parent, child)
    }

    #[test]
    fn test_container_write_is_split_across_shards() {
        let (parent, child) = shards();
        let mut tx = parent.create_transaction(None).unwrap();
        tx.write(
            &path("/top/inner"),
            container("inner", vec![leaf("a", 1), container("child", vec![leaf("x", 2)])]),
        )
        .unwrap();
        tx.submit().unwrap();

        assert_eq!(parent.tree().read(&path("/inner/a")), Some(leaf("a", 1)));
        assert!(parent.tree().read(&path("/inner/child")).is_none());
        assert_eq!(child.tree().read(&path("/x")), Some(leaf("x", 2)));
        assert_eq!(parent.read(&path("/top/inner/child/x")).unwrap(), Some(leaf("x", 2)));
    }

    #[test]
    fn test_delete_above_child_empties_it() {
        let (parent, child) = shards();
        let mut tx = parent.create_transaction(None).unwrap();
        tx.write(&path("/top/inner/child/x"), leaf("x", 1)).unwrap();
        tx.write(&path("/top/inner/a"), leaf("a", 1)).unwrap();
        tx.submit().unwrap();

        let mut tx = parent.create_transaction(None).unwrap();
        tx.delete(&path("/top/inner")).unwrap();
        tx.submit().unwrap();
        assert!(parent.tree().read(&path("/inner")).is_none());
        assert!(child.tree().read(&path("/x")).is_none());
    }

    #[test]
    fn test_read_sees_own_writes() {
        let (parent, _) = shards();
        let mut tx = parent.create_transaction(None).unwrap();
        tx.merge(&path("/top"), container("top", vec![leaf("a", 1)])).unwrap();
        assert_eq!(tx.read(&path("/top/a")).unwrap(), Some(leaf("a", 1)));
        assert!(parent.read(&path("/top/a")).unwrap().is_none());
        assert!(tx.read(&path("/elsewhere")).is_err());
    }

    #[test]
    fn test_untouched_child_takes_no_part() {
        let (parent, child) = shards();
        let mut tx = parent.create_transaction(None).unwrap();
        tx.write(&path("/top/a"), leaf("a", 1)).unwrap();
        tx.submit().unwrap();
        assert_eq!(child.tree().version(), 0);
        assert_eq!(parent.tree().version(), 1);
    }

    #[test]
    fn test_conflict_aborts_both_shards() {
        let (parent, child) = shards();
        let mut first = parent.create_transaction(None).unwrap();
        let mut second = parent.create_transaction(None).unwrap();
        first.write(&path("/top/a"), leaf("a", 1)).unwrap();
        second.write(&path("/top/a"), leaf("a", 2)).unwrap();
        second.write(&path("/top/inner/child/x"), leaf("x", 2)).unwrap();

        first.submit().unwrap();
        assert!(matches!(second.submit(), Err(DomError::OptimisticLockFailed { .. })));
        assert_eq!(parent.tree().read(&path("/a")), Some(leaf("a", 1)));
        assert!(child.tree().read(&path("/x")).is_none());
    }

    #[test]
    fn test_chained_transactions_do_not_conflict() {
        let (parent, _) = shards();
        let chain = Some(ChainId::new(3));
        let mut first = parent.create_transaction(chain).unwrap();
        let mut second = parent.create_transaction(chain).unwrap();
        first.write(&path("/top/a"), leaf("a", 1)).unwrap();
        second.write(&path("/top/a"), leaf("a", 2)).unwrap();
        first.submit().unwrap();
        second.submit().unwrap();
        assert_eq!(parent.tree().read(&path("/a")), Some(leaf("a", 2)));
    }

    #[test]
    fn test_chain_origin_reaches_child_shards() {
        let (parent, child) = shards();
        let chain = Some(ChainId::new(4));
        let mut first = parent.create_transaction(chain).unwrap();
        let mut second = parent.create_transaction(chain).unwrap();
        first.write(&path("/top/inner/child/x"), leaf("x", 1)).unwrap();
        second.write(&path("/top/inner/child/x"), leaf("x", 2)).unwrap();
        first.submit().unwrap();
        second.submit().unwrap();
        assert_eq!(child.tree().read(&path("/x")), Some(leaf("x", 2)));
    }

    #[test]
    fn test_lifecycle_is_enforced() {
        let (parent, _) = shards();
        let mut tx = parent.create_transaction(None).unwrap();
        assert!(tx.validate().is_err());
        tx.ready().unwrap();
        assert!(!tx.is_open());
        assert!(tx.write(&path("/top/a"), leaf("a", 1)).is_err());
        assert!(tx.validate().unwrap());
        tx.prepare().unwrap();
        tx.commit().unwrap();
        tx.close().unwrap();
        tx.close().unwrap();
    }

    #[test]
    fn test_cursor_opens_at_requested_prefix() {
        let (parent, _) = shards();
        let mut tx = parent.create_transaction(None).unwrap();
        {
            let cursor = tx.cursor(&path("/top/inner")).unwrap();
            cursor.write(&PathArgument::node("a"), leaf("a", 5)).unwrap();
        }
        assert_eq!(tx.read(&path("/top/inner/a")).unwrap(), Some(leaf("a", 5)));
        tx.close_cursor().unwrap();
        tx.submit().unwrap();
        assert_eq!(parent.read(&path("/top/inner/a")).unwrap(), Some(leaf("a", 5)));
    }
}
