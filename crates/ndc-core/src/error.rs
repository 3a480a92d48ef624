use std::fmt;
use std::time::Duration;

use crate::version_history::VersionHistoryItem;

/// Machine-readable error kinds. Every [`HistoryError`] maps to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    Conflict,
    StorageUnavailable,
    NoCommonAncestor,
    Cancelled,
    LockTimeout,
    Internal,
}

impl ErrorKind {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotFound => "E1001",
            Self::InvalidArgument => "E1002",
            Self::Conflict => "E2001",
            Self::StorageUnavailable => "E3001",
            Self::NoCommonAncestor => "E4001",
            Self::Cancelled => "E5001",
            Self::LockTimeout => "E5002",
            Self::Internal => "E9001",
        }
    }

    /// Short human-facing summary for logs.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotFound => "Entity not found",
            Self::InvalidArgument => "Invalid argument",
            Self::Conflict => "Update condition mismatch",
            Self::StorageUnavailable => "History storage unavailable",
            Self::NoCommonAncestor => "Branches share no common ancestor",
            Self::Cancelled => "Operation cancelled",
            Self::LockTimeout => "Execution lock contention",
            Self::Internal => "Internal unexpected error",
        }
    }

    /// Optional remediation hint for operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::NotFound => None,
            Self::InvalidArgument => Some("Fix the request; retrying it unchanged will fail again."),
            Self::Conflict => Some("Reload the execution and retry against the fresh state."),
            Self::StorageUnavailable => Some("Retry with backoff; the store reported a transient failure."),
            Self::NoCommonAncestor => {
                Some("Branch bookkeeping is corrupted. Inspect the execution's version histories.")
            }
            Self::Cancelled => None,
            Self::LockTimeout => Some("Retry after the current writer releases the execution."),
            Self::Internal => Some("Retry once. If persistent, report a bug with logs."),
        }
    }

    /// Whether the outer retry policy may retry an operation failing with this kind.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Conflict | Self::StorageUnavailable | Self::LockTimeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors produced by version-history bookkeeping, stores, rebuild and replication.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// A version history has no items.
    #[error("version history is empty")]
    EmptyHistory,

    /// A branch index does not name a branch.
    #[error("version history index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    /// No branch contains the item.
    #[error("no version history contains item {0}")]
    ItemNotFound(VersionHistoryItem),

    /// The store does not know the branch token.
    #[error("history branch not found: {0}")]
    BranchNotFound(String),

    /// No persisted execution for the identifier.
    #[error("workflow execution not found: {0}")]
    ExecutionNotFound(String),

    /// Malformed identifiers, ranges or items.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A replication task starts past the branch's next event; earlier events must be resent.
    #[error("missing events: branch continues at {next_event_id}, task starts at {first_event_id}")]
    MissingEvents {
        next_event_id: i64,
        first_event_id: i64,
    },

    /// A batch does not start at the branch's next event id in the store.
    #[error("batch starting at event {first_event_id} does not continue branch {branch} at {next_event_id}")]
    BranchDiscontinuity {
        branch: String,
        next_event_id: i64,
        first_event_id: i64,
    },

    /// Optimistic write-back failed.
    #[error("update condition mismatch: expected {expected}, persisted {actual}")]
    ConditionFailed { expected: i64, actual: i64 },

    /// Transient store failure.
    #[error("history storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Two branches of one execution share no prefix.
    #[error("version histories share no common ancestor")]
    NoCommonAncestor,

    /// The rebuild context was cancelled or its deadline passed.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// The execution lock could not be acquired in time.
    #[error("execution lock for {execution} timed out after {waited:?}")]
    LockTimeout { execution: String, waited: Duration },

    /// Event batch encoding or decoding failed.
    #[error("event codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A rebuilt state does not follow the branch it was replayed from.
    #[error("rebuilt state ends at {actual} but target branch ends at {expected}")]
    RebuildMismatch {
        expected: VersionHistoryItem,
        actual: VersionHistoryItem,
    },

    /// A stored blob failed checksum verification.
    #[error("history node {node_id} on branch {branch} failed checksum verification")]
    CorruptedBlob { branch: String, node_id: i64 },
}

impl HistoryError {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyHistory
            | Self::IndexOutOfRange { .. }
            | Self::InvalidArgument(_)
            | Self::MissingEvents { .. }
            | Self::BranchDiscontinuity { .. } => ErrorKind::InvalidArgument,
            Self::ItemNotFound(_) | Self::BranchNotFound(_) | Self::ExecutionNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::ConditionFailed { .. } => ErrorKind::Conflict,
            Self::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            Self::NoCommonAncestor => ErrorKind::NoCommonAncestor,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::LockTimeout { .. } => ErrorKind::LockTimeout,
            Self::Codec(_) | Self::RebuildMismatch { .. } | Self::CorruptedBlob { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// Shorthand for [`HistoryError::InvalidArgument`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

impl From<rusqlite::Error> for HistoryError {
    fn from(err: rusqlite::Error) -> Self {
        // Busy/locked and I/O failures alike are surfaced as transient; the
        // caller's retry policy decides.
        Self::StorageUnavailable(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = HistoryError> = std::result::Result<T, E>;
