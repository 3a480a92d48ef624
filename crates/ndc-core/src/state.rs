//! Mutable state: the in-memory execution state derived from history events.
//!
//! A [`MutableState`] is what the history service caches per execution. It is
//! always a pure function of the events on its current branch, replayed in
//! event-id order via [`MutableState::apply_event`], plus two pieces of
//! bookkeeping that are *not* derived from events:
//!
//! - the [`VersionHistories`] of every branch the execution has, and
//! - the update condition used for optimistic write-back.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HistoryError, Result};
use crate::event::{EventKind, HistoryEvent};
use crate::identifier::WorkflowIdentifier;
use crate::version_history::{
    BranchToken, EMPTY_VERSION, FIRST_EVENT_ID, VersionHistories, VersionHistory,
    VersionHistoryItem,
};

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// No start event applied yet.
    Created,
    Running,
    Completed,
}

/// Execution-level fields derived from history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub workflow_type: String,
    pub status: ExecutionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub close_time: Option<DateTime<Utc>>,
    pub signal_count: u64,
    pub result: Option<String>,
}

impl ExecutionInfo {
    fn new(id: &WorkflowIdentifier) -> Self {
        Self {
            domain_id: id.domain_id.clone(),
            workflow_id: id.workflow_id.clone(),
            run_id: id.run_id.clone(),
            workflow_type: String::new(),
            status: ExecutionStatus::Created,
            start_time: None,
            close_time: None,
            signal_count: 0,
            result: None,
        }
    }

    #[must_use]
    pub fn identifier(&self) -> WorkflowIdentifier {
        WorkflowIdentifier::new(&self.domain_id, &self.workflow_id, &self.run_id)
    }
}

/// A scheduled activity that has not completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityInfo {
    pub scheduled_event_id: i64,
    pub version: i64,
    pub activity_id: String,
    pub activity_type: String,
}

/// A started timer that has neither fired nor been canceled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerInfo {
    pub timer_id: String,
    pub started_event_id: i64,
    pub version: i64,
    pub expiry_time: DateTime<Utc>,
}

/// In-memory state of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutableState {
    execution_info: ExecutionInfo,
    version_histories: VersionHistories,
    pending_activities: BTreeMap<i64, ActivityInfo>,
    pending_timers: BTreeMap<String, TimerInfo>,
    next_event_id: i64,
    last_write_version: i64,
    update_condition: i64,
}

impl MutableState {
    /// Fresh state for `id` whose current branch is the (empty) `branch_token`.
    #[must_use]
    pub fn new(id: &WorkflowIdentifier, branch_token: BranchToken) -> Self {
        Self {
            execution_info: ExecutionInfo::new(id),
            version_histories: VersionHistories::new(VersionHistory::empty(branch_token)),
            pending_activities: BTreeMap::new(),
            pending_timers: BTreeMap::new(),
            next_event_id: FIRST_EVENT_ID,
            last_write_version: EMPTY_VERSION,
            update_condition: 0,
        }
    }

    #[must_use]
    pub const fn execution_info(&self) -> &ExecutionInfo {
        &self.execution_info
    }

    #[must_use]
    pub fn identifier(&self) -> WorkflowIdentifier {
        self.execution_info.identifier()
    }

    #[must_use]
    pub const fn version_histories(&self) -> &VersionHistories {
        &self.version_histories
    }

    pub fn version_histories_mut(&mut self) -> &mut VersionHistories {
        &mut self.version_histories
    }

    pub fn set_version_histories(&mut self, version_histories: VersionHistories) {
        self.version_histories = version_histories;
    }

    /// Token for optimistic write-back: the persisted next event id this state was loaded at.
    #[must_use]
    pub const fn update_condition(&self) -> i64 {
        self.update_condition
    }

    pub fn set_update_condition(&mut self, update_condition: i64) {
        self.update_condition = update_condition;
    }

    #[must_use]
    pub const fn next_event_id(&self) -> i64 {
        self.next_event_id
    }

    /// Version of the last applied event ([`EMPTY_VERSION`] before the first).
    #[must_use]
    pub const fn last_write_version(&self) -> i64 {
        self.last_write_version
    }

    #[must_use]
    pub const fn pending_activities(&self) -> &BTreeMap<i64, ActivityInfo> {
        &self.pending_activities
    }

    #[must_use]
    pub const fn pending_timers(&self) -> &BTreeMap<String, TimerInfo> {
        &self.pending_timers
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.execution_info.status == ExecutionStatus::Running
    }

    /// Apply a batch in order. Stops at the first rejected event.
    ///
    /// # Errors
    ///
    /// See [`MutableState::apply_event`].
    pub fn apply_events(&mut self, events: &[HistoryEvent]) -> Result<()> {
        for event in events {
            self.apply_event(event)?;
        }
        Ok(())
    }

    /// Apply the next event of the current branch.
    ///
    /// Extends the current version history, advances the next event id and
    /// updates the derived fields for the event kind.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::InvalidArgument`] if the event id is not the
    /// next one, the version moves backward, or the event is inconsistent
    /// with the pending work (completing an unknown activity, firing an
    /// unknown timer, writing after completion, a second start event).
    pub fn apply_event(&mut self, event: &HistoryEvent) -> Result<()> {
        if event.event_id != self.next_event_id {
            return Err(HistoryError::invalid(format!(
                "event {} applied out of order: next event id is {}",
                event.event_id, self.next_event_id
            )));
        }
        if self.execution_info.status == ExecutionStatus::Completed {
            return Err(HistoryError::invalid(format!(
                "event {} applied after execution {} completed",
                event.event_id,
                self.identifier()
            )));
        }
        let is_start = matches!(event.kind, EventKind::WorkflowExecutionStarted { .. });
        if is_start != (event.event_id == FIRST_EVENT_ID) {
            return Err(HistoryError::invalid(format!(
                "event {} of type {}: only the first event may start the execution",
                event.event_id,
                event.kind.event_type()
            )));
        }

        // Validate the payload before touching anything, so a rejected event
        // leaves the state unchanged.
        self.check_payload(event)?;
        self.version_histories
            .current_version_history_mut()?
            .add_or_update_item(VersionHistoryItem::new(event.event_id, event.version))?;

        match &event.kind {
            EventKind::WorkflowExecutionStarted { workflow_type, .. } => {
                self.execution_info.workflow_type.clone_from(workflow_type);
                self.execution_info.status = ExecutionStatus::Running;
                self.execution_info.start_time = Some(event.timestamp);
            }
            EventKind::ActivityTaskScheduled {
                activity_id,
                activity_type,
            } => {
                self.pending_activities.insert(
                    event.event_id,
                    ActivityInfo {
                        scheduled_event_id: event.event_id,
                        version: event.version,
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                    },
                );
            }
            EventKind::ActivityTaskCompleted {
                scheduled_event_id, ..
            } => {
                self.pending_activities.remove(scheduled_event_id);
            }
            EventKind::TimerStarted {
                timer_id,
                fire_after_secs,
            } => {
                let expiry_time = i64::try_from(*fire_after_secs)
                    .ok()
                    .and_then(Duration::try_seconds)
                    .and_then(|delay| event.timestamp.checked_add_signed(delay))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                self.pending_timers.insert(
                    timer_id.clone(),
                    TimerInfo {
                        timer_id: timer_id.clone(),
                        started_event_id: event.event_id,
                        version: event.version,
                        expiry_time,
                    },
                );
            }
            EventKind::TimerFired { timer_id } | EventKind::TimerCanceled { timer_id } => {
                self.pending_timers.remove(timer_id);
            }
            EventKind::WorkflowExecutionSignaled { .. } => {
                self.execution_info.signal_count += 1;
            }
            EventKind::WorkflowExecutionCompleted { result } => {
                self.execution_info.status = ExecutionStatus::Completed;
                self.execution_info.close_time = Some(event.timestamp);
                self.execution_info.result.clone_from(result);
                self.pending_activities.clear();
                self.pending_timers.clear();
            }
        }

        self.next_event_id = event.event_id + 1;
        self.last_write_version = event.version;
        Ok(())
    }

    fn check_payload(&self, event: &HistoryEvent) -> Result<()> {
        if event.version < self.last_write_version {
            return Err(HistoryError::invalid(format!(
                "event {} has version {} lower than last write version {}",
                event.event_id, event.version, self.last_write_version
            )));
        }
        match &event.kind {
            EventKind::ActivityTaskCompleted {
                scheduled_event_id, ..
            } if !self.pending_activities.contains_key(scheduled_event_id) => {
                Err(HistoryError::invalid(format!(
                    "event {} completes unknown activity scheduled at {scheduled_event_id}",
                    event.event_id
                )))
            }
            EventKind::TimerStarted { timer_id, .. } if self.pending_timers.contains_key(timer_id) => {
                Err(HistoryError::invalid(format!(
                    "event {} starts timer '{timer_id}' which is already pending",
                    event.event_id
                )))
            }
            EventKind::TimerFired { timer_id } | EventKind::TimerCanceled { timer_id }
                if !self.pending_timers.contains_key(timer_id) =>
            {
                Err(HistoryError::invalid(format!(
                    "event {} references unknown timer '{timer_id}'",
                    event.event_id
                )))
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
