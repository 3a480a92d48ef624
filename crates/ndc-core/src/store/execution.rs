//! Execution persistence with optimistic write-back.
//!
//! The update condition of a persisted execution counts its writes: `1`
//! after creation, one more after every successful update. A writer loads a
//! state, remembers that condition, mutates, and writes back with the
//! condition it loaded; if another writer got there first the write fails
//! with [`HistoryError::ConditionFailed`]. The counter never goes back, even
//! when a rebuild moves the execution onto a shorter branch.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::warn;

use crate::error::{HistoryError, Result};
use crate::identifier::WorkflowIdentifier;
use crate::state::MutableState;

/// Persisted execution snapshots.
pub trait ExecutionStore: Send + Sync {
    /// Persist a brand-new execution and return its update condition.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::InvalidArgument`] if the execution already exists.
    fn create_workflow_execution(&self, state: &MutableState) -> Result<i64>;

    /// Load a persisted execution with its update condition set.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::ExecutionNotFound`] if nothing is persisted.
    fn get_workflow_execution(&self, id: &WorkflowIdentifier) -> Result<MutableState>;

    /// Compare-and-swap write-back; returns the new update condition.
    ///
    /// # Errors
    ///
    /// - [`HistoryError::ExecutionNotFound`] if nothing is persisted.
    /// - [`HistoryError::ConditionFailed`] if the persisted condition is not
    ///   `expected_condition`.
    fn update_workflow_execution(&self, state: &MutableState, expected_condition: i64) -> Result<i64>;

    /// Fail unless the persisted condition is still `expected_condition`.
    ///
    /// # Errors
    ///
    /// - [`HistoryError::ExecutionNotFound`] if nothing is persisted.
    /// - [`HistoryError::ConditionFailed`] on a mismatch.
    fn check_update_condition(&self, id: &WorkflowIdentifier, expected_condition: i64) -> Result<()> {
        let actual = self.get_workflow_execution(id)?.update_condition();
        condition_matches(id, expected_condition, actual)
    }
}

/// Condition written on creation.
pub const INITIAL_UPDATE_CONDITION: i64 = 1;

fn condition_matches(id: &WorkflowIdentifier, expected: i64, actual: i64) -> Result<()> {
    if actual == expected {
        return Ok(());
    }
    warn!(execution = %id, expected_condition = expected, actual, "update condition mismatch");
    Err(HistoryError::ConditionFailed { expected, actual })
}

/// Process-local [`ExecutionStore`].
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    executions: Mutex<HashMap<WorkflowIdentifier, MutableState>>,
}

impl MemoryExecutionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifiers of every persisted execution, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::StorageUnavailable`] if the store lock is poisoned.
    pub fn execution_ids(&self) -> Result<Vec<WorkflowIdentifier>> {
        let mut ids: Vec<_> = self.lock()?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<WorkflowIdentifier, MutableState>>> {
        self.executions
            .lock()
            .map_err(|_| HistoryError::StorageUnavailable("execution store lock poisoned".into()))
    }
}

fn persisted(state: &MutableState, condition: i64) -> MutableState {
    let mut snapshot = state.clone();
    snapshot.set_update_condition(condition);
    snapshot
}

impl ExecutionStore for MemoryExecutionStore {
    fn create_workflow_execution(&self, state: &MutableState) -> Result<i64> {
        let id = state.identifier();
        let mut executions = self.lock()?;
        if executions.contains_key(&id) {
            return Err(HistoryError::invalid(format!(
                "workflow execution {id} already exists"
            )));
        }
        executions.insert(id, persisted(state, INITIAL_UPDATE_CONDITION));
        Ok(INITIAL_UPDATE_CONDITION)
    }

    fn get_workflow_execution(&self, id: &WorkflowIdentifier) -> Result<MutableState> {
        self.lock()?
            .get(id)
            .cloned()
            .ok_or_else(|| HistoryError::ExecutionNotFound(id.to_string()))
    }

    fn update_workflow_execution(&self, state: &MutableState, expected_condition: i64) -> Result<i64> {
        let id = state.identifier();
        let mut executions = self.lock()?;
        let current = executions
            .get_mut(&id)
            .ok_or_else(|| HistoryError::ExecutionNotFound(id.to_string()))?;

        let actual = current.update_condition();
        condition_matches(&id, expected_condition, actual)?;

        *current = persisted(state, actual + 1);
        Ok(actual + 1)
    }

    fn check_update_condition(&self, id: &WorkflowIdentifier, expected_condition: i64) -> Result<()> {
        let actual = self
            .lock()?
            .get(id)
            .map(MutableState::update_condition)
            .ok_or_else(|| HistoryError::ExecutionNotFound(id.to_string()))?;
        condition_matches(id, expected_condition, actual)
    }
}
