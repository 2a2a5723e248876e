//! Sharded writes.
//!
//! A shard owns the data below its prefix except where a child shard is
//! attached. Writes issued through one cursor are split between the local
//! modification and one transaction per child shard written to, and the
//! resulting transactions commit together.

pub mod cohort;
pub mod cursor;
pub mod foreign;
pub mod modification;

pub use cohort::{submit, AggregateCommitCohort, ForeignShardCohort, ThreePhaseCommitCohort};
pub use cursor::{DelegatingStrategy, WriteCursor, WriteCursorStrategy};
pub use foreign::{ForeignShardModificationContext, ShardProducer, ShardWriteTransaction};
pub use modification::{
    ShardDataModification, ShardDataModificationBuilder, ShardDataModificationCursor, SharedContext,
    WriteableModificationNode,
};

#[cfg(test)]
pub(crate) mod test_support {
    //! Recording doubles for cursors and child shards.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::cursor::WriteCursor;
    use super::foreign::{ShardProducer, ShardWriteTransaction};
    use crate::error::{DomError, DomResult};
    use crate::transaction::TransactionId;
    use crate::types::{InstanceIdentifier, NormalizedNode, PathArgument};

    pub(crate) type Log = Arc<Mutex<Vec<String>>>;

    /// Cursor logging every modification as "label op /path".
    pub(crate) struct RecordingCursor {
        label: String,
        path: Vec<PathArgument>,
        base: usize,
        log: Log,
    }

    impl RecordingCursor {
        pub(crate) fn new(label: &str) -> (Self, Log) {
            Self::with_base(label, InstanceIdentifier::empty())
        }

        pub(crate) fn with_base(label: &str, base: InstanceIdentifier) -> (Self, Log) {
            let log = Log::default();
            (Self::with_log(label, base, Arc::clone(&log)), log)
        }

        pub(crate) fn with_log(label: &str, base: InstanceIdentifier, log: Log) -> Self {
            Self {
                label: label.to_string(),
                base: base.len(),
                path: base.path_arguments().to_vec(),
                log,
            }
        }

        fn record(&self, op: &str, child: Option<&PathArgument>) {
            let mut path = InstanceIdentifier::new(self.path.clone());
            if let Some(child) = child {
                path = path.node(child.clone());
            }
            self.log.lock().push(format!("{} {} {}", self.label, op, path));
        }
    }

    impl WriteCursor for RecordingCursor {
        fn enter(&mut self, child: &PathArgument) -> DomResult<()> {
            self.path.push(child.clone());
            Ok(())
        }

        fn exit(&mut self) -> DomResult<()> {
            if self.path.len() <= self.base {
                return Err(DomError::IllegalState("exit past cursor base".to_string()));
            }
            self.path.pop();
            Ok(())
        }

        fn delete(&mut self, child: &PathArgument) -> DomResult<()> {
            self.record("delete", Some(child));
            Ok(())
        }

        fn merge(&mut self, child: &PathArgument, _data: NormalizedNode) -> DomResult<()> {
            self.record("merge", Some(child));
            Ok(())
        }

        fn write(&mut self, child: &PathArgument, _data: NormalizedNode) -> DomResult<()> {
            self.record("write", Some(child));
            Ok(())
        }

        fn clear(&mut self) -> DomResult<()> {
            self.record("clear", None);
            Ok(())
        }

        fn close(&mut self) -> DomResult<()> {
            Ok(())
        }
    }

    /// Child shard transaction logging into its producer's log.
    pub(crate) struct MockTransaction {
        id: TransactionId,
        label: String,
        cursor: Option<RecordingCursor>,
        veto: bool,
        log: Log,
    }

    impl MockTransaction {
        fn record(&self, phase: &str) {
            self.log.lock().push(format!("{} {}", self.label, phase));
        }
    }

    impl ShardWriteTransaction for MockTransaction {
        fn identifier(&self) -> TransactionId {
            self.id
        }

        fn cursor(&mut self, prefix: &InstanceIdentifier) -> DomResult<&mut dyn WriteCursor> {
            let Self { label, log, cursor, .. } = self;
            Ok(cursor.get_or_insert_with(|| RecordingCursor::with_log(label, prefix.clone(), Arc::clone(log))))
        }

        fn close_cursor(&mut self) -> DomResult<()> {
            self.cursor = None;
            self.record("close-cursor");
            Ok(())
        }

        fn ready(&mut self) -> DomResult<()> {
            self.record("ready");
            Ok(())
        }

        fn validate(&mut self) -> DomResult<bool> {
            self.record("validate");
            Ok(!self.veto)
        }

        fn prepare(&mut self) -> DomResult<()> {
            self.record("prepare");
            Ok(())
        }

        fn commit(&mut self) -> DomResult<()> {
            self.record("commit");
            Ok(())
        }

        fn abort(&mut self) -> DomResult<()> {
            self.record("abort");
            Ok(())
        }

        fn close(&mut self) -> DomResult<()> {
            self.record("close");
            Ok(())
        }
    }

    /// Producer of [`MockTransaction`]s labelled after the last prefix element.
    pub(crate) struct MockProducer {
        prefix: InstanceIdentifier,
        label: String,
        created: AtomicUsize,
        pub(crate) veto: bool,
        pub(crate) log: Log,
    }

    impl MockProducer {
        pub(crate) fn new(prefix: &str) -> Arc<Self> {
            let prefix: InstanceIdentifier = prefix.parse().expect("valid test prefix");
            let label = prefix
                .last_argument()
                .map(|argument| argument.to_string())
                .unwrap_or_default();
            Arc::new(Self {
                prefix,
                label,
                created: AtomicUsize::new(0),
                veto: false,
                log: Log::default(),
            })
        }

        pub(crate) fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }
    }

    impl ShardProducer for MockProducer {
        fn prefix(&self) -> &InstanceIdentifier {
            &self.prefix
        }

        fn create_transaction(&self) -> DomResult<Box<dyn ShardWriteTransaction>> {
            let id = TransactionId::new(self.created.fetch_add(1, Ordering::SeqCst) as u64 + 1);
            Ok(Box::new(MockTransaction {
                id,
                label: self.label.clone(),
                cursor: None,
                veto: self.veto,
                log: Arc::clone(&self.log),
            }))
        }
    }
}
