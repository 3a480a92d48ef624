//! One cluster's history service: local writes plus replicated ones.
//!
//! [`HistoryEngine`] wires the stores, the execution cache and the
//! replication applier together from a [`Config`]. Local writes always land
//! on the current branch and produce the [`ReplicationTask`] that other
//! clusters apply.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::config::Config;
use crate::context::{ExecutionCache, ExecutionContext, WorkflowContext};
use crate::error::{HistoryError, Result};
use crate::event::{EventKind, HistoryEvent};
use crate::identifier::WorkflowIdentifier;
use crate::raw_history::{RawHistoryRequest, RawHistoryResponse, read_raw_history};
use crate::rebuild::HistoryReplayer;
use crate::replication::{
    ApplyResult, ReplicationTask, ReplicationTaskApplier, discard_branch, load_cached, persist_events,
};
use crate::state::MutableState;
use crate::store::{ExecutionStore, HistoryStore, MemoryExecutionStore, MemoryHistoryStore};
use crate::version_history::FIRST_EVENT_ID;

pub struct HistoryEngine {
    history_store: Arc<dyn HistoryStore>,
    execution_store: Arc<dyn ExecutionStore>,
    cache: Arc<ExecutionCache>,
    applier: ReplicationTaskApplier,
    max_event_batch_size: usize,
}

impl std::fmt::Debug for HistoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryEngine")
            .field("max_event_batch_size", &self.max_event_batch_size)
            .field("applier", &self.applier)
            .finish_non_exhaustive()
    }
}

impl HistoryEngine {
    #[must_use]
    pub fn new(
        config: &Config,
        history_store: Arc<dyn HistoryStore>,
        execution_store: Arc<dyn ExecutionStore>,
    ) -> Self {
        let cache = Arc::new(ExecutionCache::new(
            config.cache.lock_timeout(),
            config.cache.max_executions,
        ));
        let rebuilder = Arc::new(
            HistoryReplayer::new(Arc::clone(&history_store))
                .with_page_size(config.replication.rebuild_page_size),
        );
        let mut applier = ReplicationTaskApplier::new(
            Arc::clone(&history_store),
            Arc::clone(&execution_store),
            Arc::clone(&cache),
            rebuilder,
        );
        if let Some(timeout) = config.replication.rebuild_timeout() {
            applier = applier.with_rebuild_timeout(timeout);
        }
        Self {
            history_store,
            execution_store,
            cache,
            applier,
            max_event_batch_size: config.replication.max_event_batch_size.max(1),
        }
    }

    /// Engine backed by fresh in-memory stores.
    #[must_use]
    pub fn in_memory(config: &Config) -> Self {
        Self::new(
            config,
            Arc::new(MemoryHistoryStore::new()),
            Arc::new(MemoryExecutionStore::new()),
        )
    }

    #[must_use]
    pub fn history_store(&self) -> &Arc<dyn HistoryStore> {
        &self.history_store
    }

    /// Start a new execution with its first event written at `version`.
    ///
    /// # Errors
    ///
    /// - [`HistoryError::InvalidArgument`] for a bad identifier or an
    ///   execution that already exists.
    /// - Store and lock errors unchanged.
    #[instrument(skip(self, timestamp), fields(execution = %id))]
    pub fn start_workflow_execution(
        &self,
        id: &WorkflowIdentifier,
        version: i64,
        workflow_type: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<ReplicationTask> {
        id.validate()?;
        self.cache.with_execution(id, |context| {
            if load_cached(context, self.execution_store.as_ref())?.is_some() {
                return Err(HistoryError::invalid(format!(
                    "workflow execution {id} already exists"
                )));
            }
            let branch_token = self.history_store.new_branch()?;
            let mut state = MutableState::new(id, branch_token.clone());
            let started = HistoryEvent::new(
                FIRST_EVENT_ID,
                version,
                timestamp,
                EventKind::WorkflowExecutionStarted {
                    workflow_type: workflow_type.to_string(),
                    input: None,
                },
            );
            let committed = state
                .apply_event(&started)
                .and_then(|()| self.commit(context, state, vec![started], true));
            let task = committed.inspect_err(|_| {
                discard_branch(self.history_store.as_ref(), &branch_token);
            })?;
            info!(version, workflow_type, "workflow execution started");
            Ok(task)
        })
    }

    /// Append locally produced events to the current branch at `version`.
    ///
    /// # Errors
    ///
    /// - [`HistoryError::InvalidArgument`] for an empty or oversized batch, a
    ///   version below the last write version, or events the state rejects.
    /// - [`HistoryError::ExecutionNotFound`] for an unknown execution.
    /// - [`HistoryError::ConditionFailed`] if the persisted execution moved
    ///   since it was cached. The cached state is dropped, so a retry starts
    ///   from the persisted one.
    #[instrument(skip(self, kinds, timestamp), fields(execution = %id, events = kinds.len()))]
    pub fn append_events(
        &self,
        id: &WorkflowIdentifier,
        version: i64,
        kinds: Vec<EventKind>,
        timestamp: DateTime<Utc>,
    ) -> Result<ReplicationTask> {
        if kinds.is_empty() {
            return Err(HistoryError::invalid("no events to append"));
        }
        if kinds.len() > self.max_event_batch_size {
            return Err(HistoryError::invalid(format!(
                "batch of {} events exceeds the limit of {}",
                kinds.len(),
                self.max_event_batch_size
            )));
        }
        self.cache.with_execution(id, |context| {
            let cached = load_cached(context, self.execution_store.as_ref())?
                .ok_or_else(|| HistoryError::ExecutionNotFound(id.to_string()))?;
            let mut state = MutableState::clone(&cached);
            let events: Vec<_> = (state.next_event_id()..)
                .zip(kinds)
                .map(|(event_id, kind)| HistoryEvent::new(event_id, version, timestamp, kind))
                .collect();
            state.apply_events(&events)?;
            self.commit(context, state, events, false)
        })
    }

    /// Apply a task produced by another cluster.
    ///
    /// # Errors
    ///
    /// See [`ReplicationTaskApplier::apply`].
    pub fn apply_replication_task(&self, task: &ReplicationTask) -> Result<ApplyResult> {
        self.applier.apply(task)
    }

    /// The execution's current state.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::ExecutionNotFound`] for an unknown execution.
    pub fn mutable_state(&self, id: &WorkflowIdentifier) -> Result<Arc<MutableState>> {
        self.cache.with_execution(id, |context| {
            load_cached(context, self.execution_store.as_ref())?
                .ok_or_else(|| HistoryError::ExecutionNotFound(id.to_string()))
        })
    }

    /// Every event on the execution's current branch.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::ExecutionNotFound`] for an unknown execution,
    /// otherwise store errors.
    pub fn current_branch_events(&self, id: &WorkflowIdentifier) -> Result<Vec<HistoryEvent>> {
        let state = self.mutable_state(id)?;
        let current = state.version_histories().current_version_history()?;
        self.history_store
            .read_history_events(current.branch_token(), FIRST_EVENT_ID, current.next_event_id())
    }

    /// One page of raw history; see [`read_raw_history`].
    ///
    /// # Errors
    ///
    /// See [`read_raw_history`].
    pub fn raw_history(&self, request: &RawHistoryRequest) -> Result<RawHistoryResponse> {
        read_raw_history(self.history_store.as_ref(), request, |id| {
            Ok(self.mutable_state(id)?.version_histories().clone())
        })
    }

    /// Append `events` to the current branch and persist `state`.
    fn commit(
        &self,
        context: &mut WorkflowContext,
        mut state: MutableState,
        events: Vec<HistoryEvent>,
        is_new: bool,
    ) -> Result<ReplicationTask> {
        let current = state.version_histories().current_version_history()?.clone();
        let appended = persist_events(
            self.history_store.as_ref(),
            self.execution_store.as_ref(),
            &mut state,
            current.branch_token(),
            &events,
            is_new,
        )?;

        let history_size = context.history_size() + i64::try_from(appended).unwrap_or(i64::MAX);
        context.set_mutable_state(Arc::new(state));
        context.set_history_size(history_size);
        ReplicationTask::new(context.identifier().clone(), current, events)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
