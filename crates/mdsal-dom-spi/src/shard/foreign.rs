//! Writes into a child shard on behalf of its parent.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{DomError, DomResult};
use crate::shard::cursor::WriteCursor;
use crate::transaction::TransactionId;
use crate::types::InstanceIdentifier;

/// A write transaction against one shard.
///
/// Lifecycle: open a cursor and write, `ready`, then either the three commit
/// phases (`validate`, `prepare`, `commit`) or `abort`.
pub trait ShardWriteTransaction: Send {
    /// Transaction identifier.
    fn identifier(&self) -> TransactionId;

    /// The transaction's cursor. The first call opens it positioned at
    /// `prefix`; later calls return the open cursor wherever it stands.
    fn cursor(&mut self, prefix: &InstanceIdentifier) -> DomResult<&mut dyn WriteCursor>;

    /// Close the open cursor, if any.
    fn close_cursor(&mut self) -> DomResult<()>;

    /// Seal the transaction against further writes.
    fn ready(&mut self) -> DomResult<()>;

    /// First commit phase. `false` vetoes the commit.
    fn validate(&mut self) -> DomResult<bool>;

    /// Second commit phase.
    fn prepare(&mut self) -> DomResult<()>;

    /// Final commit phase.
    fn commit(&mut self) -> DomResult<()>;

    /// Abandon the transaction at any point before `commit`.
    fn abort(&mut self) -> DomResult<()>;

    /// Release the transaction.
    fn close(&mut self) -> DomResult<()>;
}

/// Source of write transactions for one shard.
pub trait ShardProducer: Send + Sync {
    /// Root of the data the producer writes.
    fn prefix(&self) -> &InstanceIdentifier;

    /// Allocate a new transaction.
    fn create_transaction(&self) -> DomResult<Box<dyn ShardWriteTransaction>>;
}

/// The part of a parent transaction that targets one child shard.
///
/// The child transaction is created on first use, so child shards nobody
/// writes to take no part in the commit.
pub struct ForeignShardModificationContext {
    identifier: InstanceIdentifier,
    producer: Arc<dyn ShardProducer>,
    tx: Option<Box<dyn ShardWriteTransaction>>,
    cursor_open: bool,
    ready: bool,
}

impl ForeignShardModificationContext {
    /// Context writing to `identifier` through `producer`.
    pub fn new(identifier: InstanceIdentifier, producer: Arc<dyn ShardProducer>) -> Self {
        Self {
            identifier,
            producer,
            tx: None,
            cursor_open: false,
            ready: false,
        }
    }

    /// Prefix of the child shard.
    pub fn identifier(&self) -> &InstanceIdentifier {
        &self.identifier
    }

    /// Whether anything has been written to the child shard.
    pub fn is_modified(&self) -> bool {
        self.tx.is_some()
    }

    /// Whether [`Self::ready`] has run.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Cursor into the child shard, positioned at its prefix when first
    /// opened.
    pub fn cursor(&mut self) -> DomResult<&mut dyn WriteCursor> {
        if self.ready {
            return Err(DomError::IllegalState(format!(
                "modification of {} has already been readied",
                self.identifier
            )));
        }

        let tx = match &mut self.tx {
            Some(tx) => tx,
            slot => {
                let tx = self.producer.create_transaction()?;
                debug!("Allocated transaction {} on child shard {}", tx.identifier(), self.identifier);
                slot.insert(tx)
            }
        };
        self.cursor_open = true;
        tx.cursor(&self.identifier)
    }

    /// The subtree owned by the child shard was deleted by the parent.
    pub fn mark_deleted(&mut self) -> DomResult<()> {
        self.cursor()?.clear()
    }

    /// Close the cursor and seal the child transaction.
    pub fn ready(&mut self) -> DomResult<()> {
        if self.ready {
            return Ok(());
        }
        self.ready = true;
        let Some(tx) = self.tx.as_mut() else {
            trace!("Child shard {} was not modified", self.identifier);
            return Ok(());
        };
        if self.cursor_open {
            tx.close_cursor()?;
            self.cursor_open = false;
        }
        tx.ready()
    }

    /// First commit phase of the child transaction.
    pub fn validate(&mut self) -> DomResult<bool> {
        match self.readied_transaction()? {
            Some(tx) => tx.validate(),
            None => Ok(true),
        }
    }

    /// Second commit phase of the child transaction.
    pub fn prepare(&mut self) -> DomResult<()> {
        match self.readied_transaction()? {
            Some(tx) => tx.prepare(),
            None => Ok(()),
        }
    }

    /// Final commit phase of the child transaction.
    pub fn commit(&mut self) -> DomResult<()> {
        match self.readied_transaction()? {
            Some(tx) => tx.commit(),
            None => Ok(()),
        }
    }

    /// Abort the child transaction, if one was started.
    pub fn abort(&mut self) -> DomResult<()> {
        match self.tx.as_mut() {
            Some(tx) => tx.abort(),
            None => Ok(()),
        }
    }

    /// Release the child transaction.
    pub fn close_foreign_transaction(&mut self) -> DomResult<()> {
        match self.tx.take() {
            Some(mut tx) => {
                self.cursor_open = false;
                tx.close()
            }
            None => Ok(()),
        }
    }

    fn readied_transaction(&mut self) -> DomResult<Option<&mut Box<dyn ShardWriteTransaction>>> {
        if !self.ready {
            return Err(DomError::IllegalState(format!(
                "modification of {} has not been readied",
                self.identifier
            )));
        }
        Ok(self.tx.as_mut())
    }
}

impl fmt::Debug for ForeignShardModificationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignShardModificationContext")
            .field("identifier", &self.identifier)
            .field("modified", &self.is_modified())
            .field("ready", &self.ready)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::test_support::MockProducer;
    use crate::types::{NormalizedNode, PathArgument};

    fn context(producer: &Arc<MockProducer>) -> ForeignShardModificationContext {
        ForeignShardModificationContext::new("/top/child".parse().unwrap(), producer.clone())
    }

    #[test]
    fn test_untouched_context_commits_trivially() {
        let producer = MockProducer::new("/top/child");
        let mut context = context(&producer);
        assert!(!context.is_modified());
        context.ready().unwrap();
        assert!(context.validate().unwrap());
        context.prepare().unwrap();
        context.commit().unwrap();
        assert!(producer.log.lock().is_empty());
    }

    #[test]
    fn test_cursor_is_created_lazily_and_reused() {
        let producer = MockProducer::new("/top/child");
        let mut context = context(&producer);
        let leaf = PathArgument::node("x");
        context.cursor().unwrap().write(&leaf, NormalizedNode::leaf(leaf.clone(), 1)).unwrap();
        context.cursor().unwrap().delete(&leaf).unwrap();
        assert!(context.is_modified());

        context.ready().unwrap();
        assert!(context.validate().unwrap());
        context.prepare().unwrap();
        context.commit().unwrap();
        assert_eq!(
            *producer.log.lock(),
            vec![
                "child write /top/child/x",
                "child delete /top/child/x",
                "child close-cursor",
                "child ready",
                "child validate",
                "child prepare",
                "child commit",
            ]
        );
        assert_eq!(producer.created(), 1);
    }

    #[test]
    fn test_phases_require_ready() {
        let producer = MockProducer::new("/top/child");
        let mut context = context(&producer);
        context.cursor().unwrap();
        assert!(matches!(context.validate(), Err(DomError::IllegalState(_))));
        context.ready().unwrap();
        assert!(context.cursor().is_err());
    }

    #[test]
    fn test_mark_deleted_clears_child_root() {
        let producer = MockProducer::new("/top/child");
        let mut context = context(&producer);
        context.mark_deleted().unwrap();
        context.abort().unwrap();
        context.close_foreign_transaction().unwrap();
        assert!(!context.is_modified());
        assert_eq!(
            *producer.log.lock(),
            vec!["child clear /top/child", "child abort", "child close"]
        );
    }
}
