//! N-data-center conflict resolution.
//!
//! When a replicated event arrives for a branch other than the one the cached
//! state follows, the resolver decides whether the cached state is still
//! usable or has to be rebuilt from the target branch:
//!
//! ```text
//! branch_index == current                    -> valid
//! target contains current's last item        -> valid (target extends current)
//! incoming_version <  current last version   -> valid (event lands on a losing branch)
//! incoming_version == current last version   -> invalid argument
//! otherwise                                  -> rebuild from the target branch
//! ```
//!
//! A rebuild replays the target branch into a fresh state, carries the
//! version histories (current index moved to the target) and the update
//! condition over from the old state, and clears the execution context. It is
//! all-or-nothing: on any error the context and the cached state are untouched.

use std::sync::Arc;

use tracing::{debug, error, info};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::error::{HistoryError, Result};
use crate::rebuild::{RebuildContext, StateRebuilder};
use crate::state::MutableState;
use crate::version_history::{EMPTY_EVENT_ID, EMPTY_VERSION, VersionHistoryItem};

/// Resolver bound to one execution's context and cached state.
pub struct ConflictResolver<'a> {
    rebuilder: &'a dyn StateRebuilder,
    context: &'a mut dyn ExecutionContext,
    mutable_state: Arc<MutableState>,
}

impl<'a> ConflictResolver<'a> {
    #[must_use]
    pub fn new(
        rebuilder: &'a dyn StateRebuilder,
        context: &'a mut dyn ExecutionContext,
        mutable_state: Arc<MutableState>,
    ) -> Self {
        Self {
            rebuilder,
            context,
            mutable_state,
        }
    }

    /// State to apply an event at `incoming_version` to branch `branch_index` on.
    ///
    /// Returns the cached state handle itself and `false` when it is still
    /// valid, or a rebuilt state and `true`.
    ///
    /// # Errors
    ///
    /// - [`HistoryError::IndexOutOfRange`] for an unknown branch index.
    /// - [`HistoryError::InvalidArgument`] if the incoming version equals the
    ///   current branch's last version on a divergent branch.
    /// - Any error of [`ConflictResolver::rebuild`].
    pub fn prepare_mutable_state(
        &mut self,
        ctx: &RebuildContext,
        branch_index: usize,
        incoming_version: i64,
    ) -> Result<(Arc<MutableState>, bool)> {
        let histories = self.mutable_state.version_histories();
        let current_index = histories.current_index();
        let target = histories.version_history(branch_index)?;

        if branch_index == current_index {
            debug!(branch_index, "event targets the current branch");
            return Ok((Arc::clone(&self.mutable_state), false));
        }

        let current_last = histories.current_version_history()?.last_item()?;
        if target.contains_item(&current_last) {
            debug!(branch_index, current_index, "target branch extends the current branch");
            return Ok((Arc::clone(&self.mutable_state), false));
        }
        if incoming_version < current_last.version {
            debug!(
                branch_index,
                incoming_version,
                current_version = current_last.version,
                "event lands on a losing branch"
            );
            return Ok((Arc::clone(&self.mutable_state), false));
        }
        if incoming_version == current_last.version {
            return Err(HistoryError::invalid(format!(
                "incoming version {incoming_version} equals the current branch's last write \
                 version on divergent branch {branch_index}"
            )));
        }

        let request_id = Uuid::new_v4().to_string();
        let rebuilt = self.rebuild(ctx, branch_index, &request_id)?;
        Ok((rebuilt, true))
    }

    /// Replace the cached state with one replayed from branch `branch_index`.
    ///
    /// # Errors
    ///
    /// - [`HistoryError::IndexOutOfRange`] for an unknown branch index.
    /// - [`HistoryError::NoCommonAncestor`] if the target shares no prefix
    ///   with the current branch.
    /// - [`HistoryError::RebuildMismatch`] if the replayed state does not end
    ///   where the target branch does.
    /// - Rebuilder errors unchanged.
    pub fn rebuild(
        &mut self,
        ctx: &RebuildContext,
        branch_index: usize,
        request_id: &str,
    ) -> Result<Arc<MutableState>> {
        let update_condition = self.mutable_state.update_condition();
        let histories = self.mutable_state.version_histories();
        let id = self.mutable_state.identifier();

        let target = histories.version_history(branch_index)?;
        let current = histories.current_version_history()?;
        let lca = target.find_lca_item(current).inspect_err(|err| {
            error!(
                execution = %id,
                branch_index,
                current_index = histories.current_index(),
                error = %err,
                "version histories share no common ancestor"
            );
        })?;

        info!(
            execution = %id,
            branch_index,
            lca_event_id = lca.event_id,
            lca_version = lca.version,
            request_id,
            "rebuilding mutable state"
        );
        let (mut rebuilt, history_size) = self.rebuilder.rebuild(
            ctx,
            &id,
            target.branch_token(),
            lca.event_id + 1,
            &id,
            request_id,
        )?;

        let rebuilt_history = rebuilt.version_histories().current_version_history()?;
        if rebuilt_history.items() != target.items() {
            let missing = VersionHistoryItem::new(EMPTY_EVENT_ID, EMPTY_VERSION);
            return Err(HistoryError::RebuildMismatch {
                expected: target.last_item().unwrap_or(missing),
                actual: rebuilt_history.last_item().unwrap_or(missing),
            });
        }

        let mut version_histories = histories.clone();
        version_histories.set_current_index(branch_index)?;
        rebuilt.set_version_histories(version_histories);
        rebuilt.set_update_condition(update_condition);

        self.context.clear();
        self.context.set_history_size(history_size);

        info!(
            execution = %id,
            branch_index,
            next_event_id = rebuilt.next_event_id(),
            history_size,
            request_id,
            "mutable state rebuilt"
        );
        self.mutable_state = Arc::new(rebuilt);
        Ok(Arc::clone(&self.mutable_state))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
