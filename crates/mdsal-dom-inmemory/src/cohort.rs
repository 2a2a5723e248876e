//! Commit participant for a shard's own data tree.

use std::sync::Arc;

use mdsal_dom_spi::{DomError, DomResult, ThreePhaseCommitCohort};

use crate::data_tree::{DataTreeModification, PreparedCommit};
use crate::shard::InMemoryDataTreeShard;

/// Validates, prepares and installs one modification of a shard's tree, then
/// publishes the resulting change.
pub struct LocalShardCohort {
    shard: Arc<InMemoryDataTreeShard>,
    modification: Option<DataTreeModification>,
    prepared: Option<PreparedCommit>,
}

impl LocalShardCohort {
    /// Cohort committing `modification` to `shard`.
    pub fn new(shard: Arc<InMemoryDataTreeShard>, modification: DataTreeModification) -> Self {
        Self {
            shard,
            modification: Some(modification),
            prepared: None,
        }
    }

    fn out_of_order(&self, phase: &str) -> DomError {
        DomError::IllegalState(format!("{} of shard {} out of order", phase, self.shard.prefix()))
    }
}

impl ThreePhaseCommitCohort for LocalShardCohort {
    fn can_commit(&mut self) -> DomResult<bool> {
        let modification = self.modification.as_ref().ok_or_else(|| self.out_of_order("can-commit"))?;
        self.shard.tree().validate(modification)?;
        Ok(true)
    }

    fn pre_commit(&mut self) -> DomResult<()> {
        let modification = self.modification.take().ok_or_else(|| self.out_of_order("pre-commit"))?;
        self.prepared = Some(self.shard.tree().prepare(modification)?);
        Ok(())
    }

    fn commit(&mut self) -> DomResult<()> {
        let prepared = self.prepared.take().ok_or_else(|| self.out_of_order("commit"))?;
        self.shard.commit(prepared)
    }

    fn abort(&mut self) -> DomResult<()> {
        self.modification = None;
        self.prepared = None;
        Ok(())
    }
}
