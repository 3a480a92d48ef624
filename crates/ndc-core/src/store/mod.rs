//! History and execution persistence.
//!
//! The history store is an append-only blob store keyed by branch token and
//! node id. A *node* is one event batch: its id is the batch's first event
//! id, and it is stored as an opaque [`DataBlob`] with a BLAKE3 checksum.
//!
//! ```text
//! branch A: [1..=3] [4..=5] [6..=9]
//! fork at 6 -> branch B: [1..=3] [4..=5]   (same tree, new branch id)
//! ```
//!
//! Nodes are only ever appended at the branch tip. The two delete operations
//! exist to take back a write whose execution write-back failed.
//!
//! Two implementations ship with the crate:
//!
//! - [`memory::MemoryHistoryStore`], used by tests and the simulator.
//! - [`sqlite::SqliteHistoryStore`], a single-file store with WAL and a busy timeout.
//!
//! Executions are persisted through [`ExecutionStore`], whose only write path
//! is a compare-and-swap on the update condition. See [`execution`].

pub mod execution;
pub mod memory;
pub mod sqlite;

pub use execution::{ExecutionStore, MemoryExecutionStore};
pub use memory::MemoryHistoryStore;
pub use sqlite::SqliteHistoryStore;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HistoryError, Result};
use crate::event::{DataBlob, HistoryEvent, decode_batch};
use crate::version_history::BranchToken;

/// Default number of nodes returned per page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

// ---------------------------------------------------------------------------
// Branch tokens
// ---------------------------------------------------------------------------

/// Decoded form of a [`BranchToken`] issued by the stores in this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchInfo {
    /// Shared by every branch forked from the same execution history.
    pub tree_id: Uuid,
    pub branch_id: Uuid,
}

impl BranchInfo {
    /// A branch in a brand-new tree.
    #[must_use]
    pub fn new_tree() -> Self {
        Self {
            tree_id: Uuid::new_v4(),
            branch_id: Uuid::new_v4(),
        }
    }

    /// A new branch in the same tree.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self {
            tree_id: self.tree_id,
            branch_id: Uuid::new_v4(),
        }
    }

    /// Encode as an opaque token.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Codec`] if serialization fails.
    pub fn to_token(&self) -> Result<BranchToken> {
        Ok(BranchToken::new(serde_json::to_vec(self)?))
    }

    /// Decode a token produced by [`BranchInfo::to_token`].
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::InvalidArgument`] for a malformed token.
    pub fn from_token(token: &BranchToken) -> Result<Self> {
        serde_json::from_slice(token.as_bytes())
            .map_err(|err| HistoryError::invalid(format!("malformed branch token {token}: {err}")))
    }
}

// ---------------------------------------------------------------------------
// Requests / responses
// ---------------------------------------------------------------------------

/// Page request over one branch, `[min_event_id, max_event_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadHistoryBranchRequest {
    pub branch_token: BranchToken,
    /// Inclusive.
    pub min_event_id: i64,
    /// Exclusive.
    pub max_event_id: i64,
    /// Maximum number of nodes per page.
    pub page_size: usize,
    /// Empty for the first page.
    pub next_page_token: Vec<u8>,
}

impl ReadHistoryBranchRequest {
    #[must_use]
    pub fn new(branch_token: BranchToken, min_event_id: i64, max_event_id: i64, page_size: usize) -> Self {
        Self {
            branch_token,
            min_event_id,
            max_event_id,
            page_size,
            next_page_token: Vec::new(),
        }
    }

    /// Check the range and page size, returning the node id to resume from.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::InvalidArgument`] for an empty range, a zero page
    /// size or a malformed continuation token.
    pub fn validate(&self) -> Result<i64> {
        if self.min_event_id >= self.max_event_id {
            return Err(HistoryError::invalid(format!(
                "empty event range [{}, {})",
                self.min_event_id, self.max_event_id
            )));
        }
        if self.page_size == 0 {
            return Err(HistoryError::invalid("page size must be positive"));
        }
        if self.next_page_token.is_empty() {
            return Ok(i64::MIN);
        }
        std::str::from_utf8(&self.next_page_token)
            .ok()
            .and_then(|text| text.parse::<i64>().ok())
            .ok_or_else(|| HistoryError::invalid("malformed history page token"))
    }
}

/// One page of raw blobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadRawHistoryBranchResponse {
    pub blobs: Vec<DataBlob>,
    /// Empty when the range is exhausted.
    pub next_page_token: Vec<u8>,
    /// Total encoded bytes in `blobs`.
    pub size: usize,
}

/// Continuation token resuming at `node_id`.
pub(crate) fn page_token(node_id: i64) -> Vec<u8> {
    node_id.to_string().into_bytes()
}

/// Hex BLAKE3 checksum stored alongside every node.
pub(crate) fn checksum(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

// ---------------------------------------------------------------------------
// HistoryStore
// ---------------------------------------------------------------------------

/// Append-only event storage keyed by branch.
pub trait HistoryStore: Send + Sync {
    /// Create an empty branch in a new tree.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::StorageUnavailable`] on store failure.
    fn new_branch(&self) -> Result<BranchToken>;

    /// Append one batch to the end of a branch, returning its encoded size.
    ///
    /// # Errors
    ///
    /// - [`HistoryError::BranchNotFound`] for an unknown token.
    /// - [`HistoryError::BranchDiscontinuity`] if the batch does not start at
    ///   the branch's next event id.
    /// - [`HistoryError::InvalidArgument`] for an empty batch.
    fn append_history_nodes(&self, branch_token: &BranchToken, events: &[HistoryEvent]) -> Result<usize>;

    /// Remove the nodes with id `from_node_id` or later, returning how many
    /// were removed. Undoes an append whose write-back failed.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::BranchNotFound`] for an unknown token.
    fn delete_history_nodes(&self, branch_token: &BranchToken, from_node_id: i64) -> Result<usize>;

    /// Remove a branch and its nodes. Unknown tokens are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::StorageUnavailable`] on store failure.
    fn delete_history_branch(&self, branch_token: &BranchToken) -> Result<()>;

    /// Read one page of raw batches overlapping `[min_event_id, max_event_id)`.
    ///
    /// # Errors
    ///
    /// - [`HistoryError::BranchNotFound`] for an unknown token.
    /// - [`HistoryError::InvalidArgument`] for a bad range or token.
    /// - [`HistoryError::CorruptedBlob`] if a checksum does not match.
    fn read_raw_history_branch(
        &self,
        request: &ReadHistoryBranchRequest,
    ) -> Result<ReadRawHistoryBranchResponse>;

    /// Create a branch sharing the base branch's events before `fork_event_id`.
    ///
    /// # Errors
    ///
    /// - [`HistoryError::BranchNotFound`] for an unknown base.
    /// - [`HistoryError::InvalidArgument`] if `fork_event_id` is not in
    ///   `(FIRST_EVENT_ID, next_event_id]` of the base.
    fn fork_history_branch(&self, base: &BranchToken, fork_event_id: i64) -> Result<BranchToken>;

    /// Read and decode every event in `[min_event_id, max_event_id)`.
    ///
    /// # Errors
    ///
    /// Any error of [`HistoryStore::read_raw_history_branch`] or the codec.
    fn read_history_events(
        &self,
        branch_token: &BranchToken,
        min_event_id: i64,
        max_event_id: i64,
    ) -> Result<Vec<HistoryEvent>> {
        let mut request =
            ReadHistoryBranchRequest::new(branch_token.clone(), min_event_id, max_event_id, DEFAULT_PAGE_SIZE);
        let mut events = Vec::new();
        loop {
            let response = self.read_raw_history_branch(&request)?;
            for blob in &response.blobs {
                events.extend(
                    decode_batch(blob)?
                        .into_iter()
                        .filter(|event| event.event_id >= min_event_id && event.event_id < max_event_id),
                );
            }
            if response.next_page_token.is_empty() {
                return Ok(events);
            }
            request.next_page_token = response.next_page_token;
        }
    }
}

/// Split a batch at `fork_event_id`, keeping only events before it.
pub(crate) fn truncate_batch(blob: &DataBlob, fork_event_id: i64) -> Result<Vec<HistoryEvent>> {
    Ok(decode_batch(blob)?
        .into_iter()
        .filter(|event| event.event_id < fork_event_id)
        .collect())
}
