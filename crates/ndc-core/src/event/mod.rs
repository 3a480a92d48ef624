//! History events of a workflow execution.
//!
//! An execution's history is an append-only sequence of [`HistoryEvent`]s
//! with contiguous ids starting at [`FIRST_EVENT_ID`](crate::version_history::FIRST_EVENT_ID).
//! Every event carries the failover version of the cluster that wrote it.
//! Events are persisted in batches, one [`DataBlob`] per batch; see [`codec`].

pub mod codec;

pub use codec::{DataBlob, Encoding, decode_batch, encode_batch};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single event in an execution's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Position in the history, contiguous from 1.
    pub event_id: i64,

    /// Failover version of the cluster that wrote the event.
    pub version: i64,

    /// Wall-clock time the event was written.
    pub timestamp: DateTime<Utc>,

    /// Typed payload.
    #[serde(flatten)]
    pub kind: EventKind,
}

impl HistoryEvent {
    #[must_use]
    pub const fn new(event_id: i64, version: i64, timestamp: DateTime<Utc>, kind: EventKind) -> Self {
        Self {
            event_id,
            version,
            timestamp,
            kind,
        }
    }
}

impl std::fmt::Display for HistoryEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} v{} {}",
            self.event_id,
            self.version,
            self.kind.event_type()
        )
    }
}

/// Event payloads the mutable state understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventKind {
    WorkflowExecutionStarted {
        workflow_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<String>,
    },
    ActivityTaskScheduled {
        activity_id: String,
        activity_type: String,
    },
    ActivityTaskCompleted {
        scheduled_event_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    TimerStarted {
        timer_id: String,
        fire_after_secs: u64,
    },
    TimerFired {
        timer_id: String,
    },
    TimerCanceled {
        timer_id: String,
    },
    WorkflowExecutionSignaled {
        signal_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<String>,
    },
    WorkflowExecutionCompleted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
}

impl EventKind {
    /// Stable `snake_case` name, matching the serialized `event_type` tag.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::WorkflowExecutionStarted { .. } => "workflow_execution_started",
            Self::ActivityTaskScheduled { .. } => "activity_task_scheduled",
            Self::ActivityTaskCompleted { .. } => "activity_task_completed",
            Self::TimerStarted { .. } => "timer_started",
            Self::TimerFired { .. } => "timer_fired",
            Self::TimerCanceled { .. } => "timer_canceled",
            Self::WorkflowExecutionSignaled { .. } => "workflow_execution_signaled",
            Self::WorkflowExecutionCompleted { .. } => "workflow_execution_completed",
        }
    }

    /// True for events that close the execution.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::WorkflowExecutionCompleted { .. })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
