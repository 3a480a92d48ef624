//! Applying replicated events to the local copy of an execution.
//!
//! The flow for one [`ReplicationTask`], under the execution lock:
//!
//! 1. Load the cached state (or the persisted one, or start a new execution).
//! 2. [`BranchManager`]: pick or fork the local branch the events belong to.
//! 3. [`ConflictResolver`]: keep the cached state or rebuild it from that branch.
//! 4. Apply the events to the state if the branch is (now) current, otherwise
//!    only extend that branch's version history.
//! 5. Check the update condition, append the events to the branch in the
//!    history store, write the state back with compare-and-swap and install
//!    it in the context.
//!
//! Nothing is installed in the context unless every step succeeds. A failed
//! write-back takes its appended nodes back out of the history store, and a
//! branch created for the task (a fork, or the first branch of a new
//! execution) is deleted.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::branch::{BranchDecision, BranchManager};
use crate::context::{ExecutionCache, ExecutionContext, WorkflowContext};
use crate::error::{HistoryError, Result};
use crate::event::HistoryEvent;
use crate::identifier::WorkflowIdentifier;
use crate::rebuild::{RebuildContext, StateRebuilder};
use crate::resolver::ConflictResolver;
use crate::state::MutableState;
use crate::store::{ExecutionStore, HistoryStore};
use crate::version_history::{BranchToken, FIRST_EVENT_ID, VersionHistory, VersionHistoryItem};

/// A batch of events replicated from another cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationTask {
    pub workflow: WorkflowIdentifier,
    pub first_event_id: i64,
    /// One past the last event in the batch.
    pub next_event_id: i64,
    /// Version every event in the batch was written at.
    pub version: i64,
    /// Sender's history of the branch, including this batch.
    pub version_history: VersionHistory,
    pub events: Vec<HistoryEvent>,
}

impl ReplicationTask {
    /// Build a task from a non-empty batch and the sender's branch history.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::InvalidArgument`] if the result fails
    /// [`ReplicationTask::validate`].
    pub fn new(
        workflow: WorkflowIdentifier,
        version_history: VersionHistory,
        events: Vec<HistoryEvent>,
    ) -> Result<Self> {
        let (Some(first), Some(last)) = (events.first(), events.last()) else {
            return Err(HistoryError::invalid("replication task has no events"));
        };
        let task = Self {
            workflow,
            first_event_id: first.event_id,
            next_event_id: last.event_id + 1,
            version: last.version,
            version_history,
            events,
        };
        task.validate()?;
        Ok(task)
    }

    /// Check the task is self-consistent.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::InvalidArgument`] describing the first problem:
    /// a bad identifier, an empty or inverted range, non-contiguous ids,
    /// events at another version, or a version history not covering the batch.
    pub fn validate(&self) -> Result<()> {
        self.workflow.validate()?;
        if self.first_event_id < FIRST_EVENT_ID || self.first_event_id >= self.next_event_id {
            return Err(HistoryError::invalid(format!(
                "invalid event range [{}, {})",
                self.first_event_id, self.next_event_id
            )));
        }
        let expected_len = usize::try_from(self.next_event_id - self.first_event_id).unwrap_or(0);
        if self.events.len() != expected_len {
            return Err(HistoryError::invalid(format!(
                "range [{}, {}) does not match {} events",
                self.first_event_id,
                self.next_event_id,
                self.events.len()
            )));
        }
        for (event_id, event) in (self.first_event_id..).zip(&self.events) {
            if event.event_id != event_id {
                return Err(HistoryError::invalid(format!(
                    "event {} found where {event_id} was expected",
                    event.event_id
                )));
            }
            if event.version != self.version {
                return Err(HistoryError::invalid(format!(
                    "event {} has version {}, task version is {}",
                    event.event_id, event.version, self.version
                )));
            }
        }
        let last = VersionHistoryItem::new(self.next_event_id - 1, self.version);
        if self.version_history.last_item()? != last {
            return Err(HistoryError::invalid(format!(
                "version history does not end at the task's last event {last}"
            )));
        }
        Ok(())
    }
}

/// What happened to a replication task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Events appended to the current branch and applied to the state.
    Applied,
    /// Events appended to a non-current branch; the state did not change.
    Backfilled,
    /// Every event was already present.
    Duplicate,
}

/// Outcome plus whether the cached state had to be rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyResult {
    pub outcome: ApplyOutcome,
    pub rebuilt: bool,
}

/// Applies [`ReplicationTask`]s for one shard.
pub struct ReplicationTaskApplier {
    history_store: Arc<dyn HistoryStore>,
    execution_store: Arc<dyn ExecutionStore>,
    cache: Arc<ExecutionCache>,
    rebuilder: Arc<dyn StateRebuilder + Send + Sync>,
    rebuild_timeout: Option<Duration>,
}

impl std::fmt::Debug for ReplicationTaskApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationTaskApplier")
            .field("rebuild_timeout", &self.rebuild_timeout)
            .finish_non_exhaustive()
    }
}

impl ReplicationTaskApplier {
    #[must_use]
    pub fn new(
        history_store: Arc<dyn HistoryStore>,
        execution_store: Arc<dyn ExecutionStore>,
        cache: Arc<ExecutionCache>,
        rebuilder: Arc<dyn StateRebuilder + Send + Sync>,
    ) -> Self {
        Self {
            history_store,
            execution_store,
            cache,
            rebuilder,
            rebuild_timeout: None,
        }
    }

    /// Abort rebuilds taking longer than `timeout`.
    #[must_use]
    pub const fn with_rebuild_timeout(mut self, timeout: Duration) -> Self {
        self.rebuild_timeout = Some(timeout);
        self
    }

    /// Apply one task.
    ///
    /// # Errors
    ///
    /// - [`HistoryError::InvalidArgument`] for a malformed task.
    /// - [`HistoryError::MissingEvents`] if earlier events must be resent first.
    /// - [`HistoryError::LockTimeout`] or [`HistoryError::ConditionFailed`],
    ///   which the caller may retry.
    /// - Resolver, store and rebuild errors unchanged.
    #[instrument(skip_all, fields(execution = %task.workflow, first_event_id = task.first_event_id, version = task.version))]
    pub fn apply(&self, task: &ReplicationTask) -> Result<ApplyResult> {
        task.validate()?;
        self.cache
            .with_execution(&task.workflow, |context| self.apply_locked(context, task))
    }

    fn rebuild_context(&self) -> RebuildContext {
        self.rebuild_timeout
            .map_or_else(RebuildContext::new, RebuildContext::with_timeout)
    }

    fn apply_locked(&self, context: &mut WorkflowContext, task: &ReplicationTask) -> Result<ApplyResult> {
        let (mut state, is_new) = self.load(context, task)?;
        let decision = BranchManager::new(self.history_store.as_ref()).prepare_version_history(
            Arc::make_mut(&mut state),
            &task.version_history,
            task.first_event_id,
        )?;
        let (index, owns_branch) = match decision {
            BranchDecision::Append { index } => (index, is_new),
            BranchDecision::Fork { index } => (index, true),
            BranchDecision::Duplicate => {
                return Ok(ApplyResult {
                    outcome: ApplyOutcome::Duplicate,
                    rebuilt: false,
                });
            }
        };

        let branch_token = state.version_histories().version_history(index)?.branch_token().clone();
        let result = self.write_task(context, task, state, index, &branch_token, is_new);
        if result.is_err() && owns_branch {
            discard_branch(self.history_store.as_ref(), &branch_token);
        }
        result
    }

    fn write_task(
        &self,
        context: &mut WorkflowContext,
        task: &ReplicationTask,
        state: Arc<MutableState>,
        index: usize,
        branch_token: &BranchToken,
        is_new: bool,
    ) -> Result<ApplyResult> {
        let ctx = self.rebuild_context();
        let mut resolver = ConflictResolver::new(self.rebuilder.as_ref(), &mut *context, state);
        let (mut state, mut rebuilt) = resolver.prepare_mutable_state(&ctx, index, task.version)?;

        let histories = state.version_histories();
        let current_last = histories.current_version_history()?.last_item().ok();
        let target = histories.version_history(index)?;
        let winning = index == histories.current_index()
            || current_last.is_none_or(|item| target.contains_item(&item));
        if winning && state.next_event_id() != task.first_event_id {
            // The target extends the current branch but the cached state
            // never saw the events in between.
            let request_id = Uuid::new_v4().to_string();
            state = resolver.rebuild(&ctx, index, &request_id)?;
            rebuilt = true;
        }
        drop(resolver);

        let next = Arc::make_mut(&mut state);
        let outcome = if winning {
            if next.version_histories().current_index() != index {
                next.version_histories_mut().set_current_index(index)?;
            }
            next.apply_events(&task.events)?;
            ApplyOutcome::Applied
        } else {
            let branch = next.version_histories_mut().version_history_mut(index)?;
            for event in &task.events {
                branch.add_or_update_item(VersionHistoryItem::new(event.event_id, event.version))?;
            }
            ApplyOutcome::Backfilled
        };
        let appended = persist_events(
            self.history_store.as_ref(),
            self.execution_store.as_ref(),
            next,
            branch_token,
            &task.events,
            is_new,
        )?;

        let history_size = context.history_size() + i64::try_from(appended).unwrap_or(i64::MAX);
        context.set_mutable_state(state);
        context.set_history_size(history_size);

        info!(index, ?outcome, rebuilt, "replication task applied");
        Ok(ApplyResult { outcome, rebuilt })
    }

    fn load(
        &self,
        context: &mut WorkflowContext,
        task: &ReplicationTask,
    ) -> Result<(Arc<MutableState>, bool)> {
        if let Some(state) = load_cached(context, self.execution_store.as_ref())? {
            return Ok((state, false));
        }
        if task.first_event_id != FIRST_EVENT_ID {
            return Err(HistoryError::MissingEvents {
                next_event_id: FIRST_EVENT_ID,
                first_event_id: task.first_event_id,
            });
        }
        let branch_token = self.history_store.new_branch()?;
        debug!(branch = %branch_token, "starting replicated execution");
        Ok((Arc::new(MutableState::new(&task.workflow, branch_token)), true))
    }
}

/// Append `events` to `branch_token`, then write `state` back.
///
/// An update checks the persisted condition before touching the history
/// store, and a store that has moved past `state` is reported as
/// [`HistoryError::ConditionFailed`]. If the write-back fails after the
/// append, the appended node is deleted again. On success `state` carries
/// the new update condition; returns the appended size in bytes.
pub(crate) fn persist_events(
    history_store: &dyn HistoryStore,
    execution_store: &dyn ExecutionStore,
    state: &mut MutableState,
    branch_token: &BranchToken,
    events: &[HistoryEvent],
    is_new: bool,
) -> Result<usize> {
    if !is_new {
        execution_store.check_update_condition(&state.identifier(), state.update_condition())?;
    }
    let appended = history_store
        .append_history_nodes(branch_token, events)
        .map_err(|err| match err {
            HistoryError::BranchDiscontinuity { .. } if !is_new => {
                stale_condition(execution_store, state, err)
            }
            err => err,
        })?;

    let written = if is_new {
        execution_store.create_workflow_execution(state)
    } else {
        execution_store.update_workflow_execution(state, state.update_condition())
    };
    match written {
        Ok(condition) => {
            state.set_update_condition(condition);
            Ok(appended)
        }
        Err(err) => {
            let undone = events.first().map_or(Ok(0), |first| {
                history_store.delete_history_nodes(branch_token, first.event_id)
            });
            if let Err(undo) = undone {
                warn!(branch = %branch_token, error = %undo, "failed to remove nodes of a failed write");
            }
            Err(err)
        }
    }
}

/// The history store rejected a batch built from `state`: someone else wrote first.
fn stale_condition(
    execution_store: &dyn ExecutionStore,
    state: &MutableState,
    err: HistoryError,
) -> HistoryError {
    match execution_store.get_workflow_execution(&state.identifier()) {
        Ok(persisted) => {
            debug!(error = %err, "history branch moved past the cached state");
            HistoryError::ConditionFailed {
                expected: state.update_condition(),
                actual: persisted.update_condition(),
            }
        }
        Err(_) => err,
    }
}

/// Delete a branch created for a write that was not persisted.
pub(crate) fn discard_branch(history_store: &dyn HistoryStore, branch_token: &BranchToken) {
    match history_store.delete_history_branch(branch_token) {
        Ok(()) => debug!(branch = %branch_token, "deleted unused history branch"),
        Err(err) => warn!(branch = %branch_token, error = %err, "failed to delete unused history branch"),
    }
}

/// The context's cached state, loading it from the store on a miss.
///
/// Returns `None` if the execution was never persisted.
pub(crate) fn load_cached(
    context: &mut WorkflowContext,
    execution_store: &dyn ExecutionStore,
) -> Result<Option<Arc<MutableState>>> {
    if let Some(state) = context.mutable_state() {
        return Ok(Some(Arc::clone(state)));
    }
    match execution_store.get_workflow_execution(context.identifier()) {
        Ok(state) => {
            debug!(execution = %context.identifier(), "loaded persisted execution");
            let state = Arc::new(state);
            context.set_mutable_state(Arc::clone(&state));
            Ok(Some(state))
        }
        Err(HistoryError::ExecutionNotFound(_)) => Ok(None),
        Err(err) => Err(err),
    }
}
