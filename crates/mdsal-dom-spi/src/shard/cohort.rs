//! Three-phase commit across the shards a transaction touched.

use tracing::{debug, error, warn};

use crate::error::{DomError, DomResult};
use crate::shard::modification::SharedContext;
use crate::transaction::TransactionId;

/// One participant of a three-phase commit.
pub trait ThreePhaseCommitCohort: Send {
    /// Vote on the commit. `false` vetoes it.
    fn can_commit(&mut self) -> DomResult<bool>;

    /// Prepare the commit after every participant voted yes.
    fn pre_commit(&mut self) -> DomResult<()>;

    /// Make the prepared commit visible.
    fn commit(&mut self) -> DomResult<()>;

    /// Undo everything done so far.
    fn abort(&mut self) -> DomResult<()>;
}

/// Cohort of one child shard. Untouched child shards vote yes and do nothing.
pub struct ForeignShardCohort {
    context: SharedContext,
}

impl ForeignShardCohort {
    /// Cohort driving `context`.
    pub fn new(context: SharedContext) -> Self {
        Self { context }
    }
}

impl ThreePhaseCommitCohort for ForeignShardCohort {
    fn can_commit(&mut self) -> DomResult<bool> {
        self.context.lock().validate()
    }

    fn pre_commit(&mut self) -> DomResult<()> {
        self.context.lock().prepare()
    }

    fn commit(&mut self) -> DomResult<()> {
        self.context.lock().commit()
    }

    fn abort(&mut self) -> DomResult<()> {
        self.context.lock().abort()
    }
}

/// All-or-nothing composition of several cohorts.
///
/// A veto or a failure in the first two phases aborts every participant.
#[derive(Default)]
pub struct AggregateCommitCohort {
    cohorts: Vec<Box<dyn ThreePhaseCommitCohort>>,
}

impl AggregateCommitCohort {
    /// Compose `cohorts`; phases run in this order.
    pub fn new(cohorts: Vec<Box<dyn ThreePhaseCommitCohort>>) -> Self {
        Self { cohorts }
    }

    /// Add a participant.
    pub fn push(&mut self, cohort: Box<dyn ThreePhaseCommitCohort>) {
        self.cohorts.push(cohort);
    }

    /// Number of participants.
    pub fn len(&self) -> usize {
        self.cohorts.len()
    }

    /// Whether there are no participants.
    pub fn is_empty(&self) -> bool {
        self.cohorts.is_empty()
    }

    fn abort_all(&mut self) -> DomResult<()> {
        let mut first = None;
        for cohort in &mut self.cohorts {
            if let Err(e) = cohort.abort() {
                warn!("Abort of a commit participant failed: {}", e);
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Abort everyone after `cause` failed a phase, and hand `cause` back.
    fn abort_after(&mut self, cause: DomError) -> DomError {
        if let Err(e) = self.abort_all() {
            warn!("Commit failed with {} and could not be fully aborted: {}", cause, e);
        }
        cause
    }

    /// First participant vetoing or failing the vote.
    fn collect_votes(&mut self) -> DomResult<Option<usize>> {
        for (index, cohort) in self.cohorts.iter_mut().enumerate() {
            if !cohort.can_commit()? {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    fn pre_commit_all(&mut self) -> DomResult<()> {
        for cohort in self.cohorts.iter_mut() {
            cohort.pre_commit()?;
        }
        Ok(())
    }
}

impl ThreePhaseCommitCohort for AggregateCommitCohort {
    fn can_commit(&mut self) -> DomResult<bool> {
        match self.collect_votes() {
            Ok(None) => Ok(true),
            Ok(Some(index)) => {
                debug!("Participant {} vetoed the commit", index);
                self.abort_all()?;
                Ok(false)
            }
            Err(e) => Err(self.abort_after(e)),
        }
    }

    fn pre_commit(&mut self) -> DomResult<()> {
        self.pre_commit_all().map_err(|e| self.abort_after(e))
    }

    fn commit(&mut self) -> DomResult<()> {
        for (index, cohort) in self.cohorts.iter_mut().enumerate() {
            if let Err(e) = cohort.commit() {
                error!("Participant {} failed to commit, earlier participants stay committed: {}", index, e);
                return Err(e);
            }
        }
        Ok(())
    }

    fn abort(&mut self) -> DomResult<()> {
        self.abort_all()
    }
}

/// Run all three phases of `cohort` on behalf of `transaction`.
pub fn submit(transaction: TransactionId, cohort: &mut dyn ThreePhaseCommitCohort) -> DomResult<()> {
    if !cohort.can_commit()? {
        return Err(DomError::CommitFailed {
            transaction,
            reason: "a participant vetoed the commit".to_string(),
        });
    }
    cohort.pre_commit()?;
    cohort.commit()
}
