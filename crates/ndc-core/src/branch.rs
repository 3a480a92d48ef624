//! Mapping an incoming replicated history onto a local branch.
//!
//! A replication task carries the sender's version history for the branch
//! its events were written on. The branch manager finds the local branch
//! sharing the most history with it and decides where the events go:
//!
//! - the shared point is the local branch's tip: append there;
//! - the events are already covered locally: duplicate, drop the task;
//! - otherwise fork a new local branch at the shared point and append there.
//!
//! Events past the local tip are never guessed at; the task fails with
//! [`HistoryError::MissingEvents`] and the sender has to resend from earlier.

use tracing::{debug, info};

use crate::error::{HistoryError, Result};
use crate::state::MutableState;
use crate::store::HistoryStore;
use crate::version_history::{FIRST_EVENT_ID, VersionHistory};

/// Where a replication task's events belong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchDecision {
    /// Append to the local branch at this index.
    Append { index: usize },
    /// Append to the branch at this index, forked in the store for these
    /// events. The caller deletes it if the events are not persisted.
    Fork { index: usize },
    /// Every event is already present locally.
    Duplicate,
}

/// Chooses (and if needed creates) the local branch for incoming events.
pub struct BranchManager<'a> {
    store: &'a dyn HistoryStore,
}

impl<'a> BranchManager<'a> {
    #[must_use]
    pub fn new(store: &'a dyn HistoryStore) -> Self {
        Self { store }
    }

    /// Prepare `state`'s version histories for events starting at `first_event_id`.
    ///
    /// May fork a branch in the store and add it to `state`'s version
    /// histories, reported as [`BranchDecision::Fork`]. Never changes the
    /// current branch.
    ///
    /// # Errors
    ///
    /// - [`HistoryError::MissingEvents`] if the events start past the chosen
    ///   branch's next event id.
    /// - [`HistoryError::NoCommonAncestor`] if no local branch shares history
    ///   with `incoming`.
    /// - Store errors from forking.
    pub fn prepare_version_history(
        &self,
        state: &mut MutableState,
        incoming: &VersionHistory,
        first_event_id: i64,
    ) -> Result<BranchDecision> {
        let histories = state.version_histories();
        if histories.current_version_history()?.is_empty() {
            // Nothing written locally yet: the only candidate is the empty branch.
            let index = histories.current_index();
            return verify_events_order(FIRST_EVENT_ID, first_event_id)
                .map(|fresh| if fresh { BranchDecision::Append { index } } else { BranchDecision::Duplicate });
        }

        let (index, lca) = histories.find_lca_version_history_index_and_item(incoming)?;
        let local = histories.version_history(index)?;

        if local.is_lca_appendable(&lca) {
            if !verify_events_order(local.next_event_id(), first_event_id)? {
                debug!(index, first_event_id, "duplicate replication task");
                return Ok(BranchDecision::Duplicate);
            }
            return Ok(BranchDecision::Append { index });
        }

        let mut forked = local.duplicate_until_lca_item(&lca)?;
        if !verify_events_order(forked.next_event_id(), first_event_id)? {
            debug!(index, first_event_id, "duplicate replication task on shared prefix");
            return Ok(BranchDecision::Duplicate);
        }

        let token = self
            .store
            .fork_history_branch(local.branch_token(), lca.event_id + 1)?;
        forked.set_branch_token(token.clone());
        let new_index = match state.version_histories_mut().add_version_history(forked) {
            Ok((_, new_index)) => new_index,
            Err(err) => {
                self.store.delete_history_branch(&token)?;
                return Err(err);
            }
        };

        info!(
            base_index = index,
            new_index,
            lca_event_id = lca.event_id,
            lca_version = lca.version,
            "forked local branch for replicated events"
        );
        Ok(BranchDecision::Fork { index: new_index })
    }
}

/// `Ok(true)` when the events continue the branch, `Ok(false)` for duplicates.
fn verify_events_order(next_event_id: i64, first_event_id: i64) -> Result<bool> {
    match first_event_id.cmp(&next_event_id) {
        std::cmp::Ordering::Less => Ok(false),
        std::cmp::Ordering::Equal => Ok(true),
        std::cmp::Ordering::Greater => Err(HistoryError::MissingEvents {
            next_event_id,
            first_event_id,
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
