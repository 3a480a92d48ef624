//! State rebuild: replaying a branch's persisted events into a fresh state.
//!
//! The conflict resolver only depends on the [`StateRebuilder`] trait. The
//! concrete [`HistoryReplayer`] reads the target branch page by page through
//! a [`HistoryStore`] and applies every event in event-id order.
//!
//! Rebuilds are cooperative about cancellation: the [`RebuildContext`] is
//! checked before every page and every event.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{HistoryError, Result};
use crate::event::decode_batch;
use crate::identifier::WorkflowIdentifier;
use crate::state::MutableState;
use crate::store::{DEFAULT_PAGE_SIZE, HistoryStore, ReadHistoryBranchRequest};
use crate::version_history::{BranchToken, FIRST_EVENT_ID};

// ---------------------------------------------------------------------------
// RebuildContext
// ---------------------------------------------------------------------------

/// Cancellation flag plus optional deadline for one rebuild.
///
/// Clones share the flag, so a caller can keep one handle and cancel a
/// rebuild running with another.
#[derive(Debug, Clone, Default)]
pub struct RebuildContext {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl RebuildContext {
    /// A context that never expires.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A context expiring `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::default(),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Fail if cancelled or past the deadline.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Cancelled`].
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(HistoryError::Cancelled("rebuild cancelled".into()));
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(HistoryError::Cancelled("rebuild deadline exceeded".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StateRebuilder
// ---------------------------------------------------------------------------

/// Reconstructs an execution's state from a persisted branch.
pub trait StateRebuilder {
    /// Replay `branch_token` into a fresh state for `target_id`.
    ///
    /// `start_event_id` is the first event after the branch's common ancestor
    /// with the state being replaced. Returns the new state and the number
    /// of history bytes read. Never writes to storage.
    ///
    /// # Errors
    ///
    /// - [`HistoryError::BranchNotFound`] for an unknown branch.
    /// - [`HistoryError::Cancelled`] if `ctx` is cancelled or expires.
    /// - Store, codec and event-application errors unchanged.
    fn rebuild(
        &self,
        ctx: &RebuildContext,
        source_id: &WorkflowIdentifier,
        branch_token: &BranchToken,
        start_event_id: i64,
        target_id: &WorkflowIdentifier,
        request_id: &str,
    ) -> Result<(MutableState, i64)>;
}

/// [`StateRebuilder`] replaying a branch through a [`HistoryStore`].
#[derive(Clone)]
pub struct HistoryReplayer {
    store: Arc<dyn HistoryStore>,
    page_size: usize,
}

impl std::fmt::Debug for HistoryReplayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryReplayer")
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl HistoryReplayer {
    #[must_use]
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self {
            store,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Nodes read per page (at least one).
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

impl StateRebuilder for HistoryReplayer {
    fn rebuild(
        &self,
        ctx: &RebuildContext,
        source_id: &WorkflowIdentifier,
        branch_token: &BranchToken,
        start_event_id: i64,
        target_id: &WorkflowIdentifier,
        request_id: &str,
    ) -> Result<(MutableState, i64)> {
        if start_event_id < FIRST_EVENT_ID {
            return Err(HistoryError::invalid(format!(
                "rebuild start event {start_event_id} precedes the first event"
            )));
        }

        let mut state = MutableState::new(target_id, branch_token.clone());
        let mut request = ReadHistoryBranchRequest::new(
            branch_token.clone(),
            FIRST_EVENT_ID,
            i64::MAX,
            self.page_size,
        );
        let mut size = 0usize;
        let mut pages = 0usize;
        let mut suffix_events = 0usize;

        loop {
            ctx.check()?;
            let response = self.store.read_raw_history_branch(&request)?;
            pages += 1;
            size += response.size;

            for blob in &response.blobs {
                for event in decode_batch(blob)? {
                    ctx.check()?;
                    state.apply_event(&event)?;
                    if event.event_id >= start_event_id {
                        suffix_events += 1;
                    }
                }
            }

            if response.next_page_token.is_empty() {
                break;
            }
            debug!(request_id, page = pages, "history page replayed");
            request.next_page_token = response.next_page_token;
        }

        if state.next_event_id() < start_event_id {
            return Err(HistoryError::invalid(format!(
                "branch {branch_token} ends at event {} before rebuild start {start_event_id}",
                state.next_event_id() - 1
            )));
        }

        info!(
            source = %source_id,
            target = %target_id,
            branch = %branch_token,
            request_id,
            start_event_id,
            next_event_id = state.next_event_id(),
            suffix_events,
            pages,
            size,
            "replayed history branch"
        );
        Ok((state, i64::try_from(size).unwrap_or(i64::MAX)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, HistoryEvent};
    use crate::store::{BranchInfo, MemoryHistoryStore};
    use crate::version_history::VersionHistoryItem;
    use chrono::Utc;

    fn event(event_id: i64, version: i64) -> HistoryEvent {
        let kind = if event_id == FIRST_EVENT_ID {
            EventKind::WorkflowExecutionStarted {
                workflow_type: "order".into(),
                input: None,
            }
        } else {
            EventKind::WorkflowExecutionSignaled {
                signal_name: format!("s{event_id}"),
                input: None,
            }
        };
        HistoryEvent::new(event_id, version, Utc::now(), kind)
    }

    fn seeded() -> (Arc<MemoryHistoryStore>, BranchToken) {
        let store = Arc::new(MemoryHistoryStore::new());
        let token = store.new_branch().unwrap();
        for (range, version) in [(1..=2, 10), (3..=5, 10), (6..=7, 12)] {
            let batch: Vec<_> = range.map(|id| event(id, version)).collect();
            store.append_history_nodes(&token, &batch).unwrap();
        }
        (store, token)
    }

    fn id() -> WorkflowIdentifier {
        WorkflowIdentifier::new("d", "wf", "r")
    }

    #[test]
    fn replays_whole_branch_across_pages() {
        let (store, token) = seeded();
        let replayer = HistoryReplayer::new(store).with_page_size(1);

        let (state, size) = replayer
            .rebuild(&RebuildContext::new(), &id(), &token, 4, &id(), "req-1")
            .unwrap();
        assert_eq!(state.next_event_id(), 8);
        assert_eq!(state.execution_info().signal_count, 6);
        assert!(size > 0);
        let current = state.version_histories().current_version_history().unwrap();
        assert_eq!(current.branch_token(), &token);
        assert_eq!(
            current.items(),
            &[VersionHistoryItem::new(5, 10), VersionHistoryItem::new(7, 12)]
        );
    }

    #[test]
    fn unknown_branch_is_not_found() {
        let (store, _) = seeded();
        let replayer = HistoryReplayer::new(store);
        let missing = BranchInfo::new_tree().to_token().unwrap();
        let err = replayer
            .rebuild(&RebuildContext::new(), &id(), &missing, 2, &id(), "req")
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn cancelled_context_aborts() {
        let (store, token) = seeded();
        let replayer = HistoryReplayer::new(store);
        let ctx = RebuildContext::new();
        let handle = ctx.clone();
        handle.cancel();
        assert!(ctx.is_cancelled());
        let err = replayer
            .rebuild(&ctx, &id(), &token, 2, &id(), "req")
            .unwrap_err();
        assert!(matches!(err, HistoryError::Cancelled(_)));
    }

    #[test]
    fn expired_deadline_aborts() {
        let (store, token) = seeded();
        let replayer = HistoryReplayer::new(store);
        let ctx = RebuildContext::with_timeout(Duration::ZERO);
        let err = replayer
            .rebuild(&ctx, &id(), &token, 2, &id(), "req")
            .unwrap_err();
        assert!(err.to_string().contains("deadline"));
    }

    #[test]
    fn start_past_branch_end_is_invalid() {
        let (store, token) = seeded();
        let replayer = HistoryReplayer::new(store);
        let err = replayer
            .rebuild(&RebuildContext::new(), &id(), &token, 10, &id(), "req")
            .unwrap_err();
        assert!(matches!(err, HistoryError::InvalidArgument(_)));
    }

    #[test]
    fn rebuild_never_writes() {
        let (store, token) = seeded();
        let before = store.read_history_events(&token, 1, i64::MAX).unwrap();
        let replayer = HistoryReplayer::new(store.clone());
        replayer
            .rebuild(&RebuildContext::new(), &id(), &token, 3, &id(), "req")
            .unwrap();
        assert_eq!(store.read_history_events(&token, 1, i64::MAX).unwrap(), before);
        assert_eq!(store.branch_count().unwrap(), 1);
    }
}
