//! The set of branches belonging to one execution.

use serde::{Deserialize, Serialize};

use crate::error::{HistoryError, Result};

use super::history::{VersionHistory, VersionHistoryItem};

/// All branches of one execution plus the index of the current one.
///
/// Branches are only ever added or extended. Moving `current_index` is the
/// caller's decision; nothing here changes it implicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistories {
    current_index: usize,
    histories: Vec<VersionHistory>,
}

impl VersionHistories {
    /// Start the set with the execution's first branch as current.
    #[must_use]
    pub fn new(initial: VersionHistory) -> Self {
        Self {
            current_index: 0,
            histories: vec![initial],
        }
    }

    /// Index of the branch the execution's state follows.
    #[must_use]
    pub const fn current_index(&self) -> usize {
        self.current_index
    }

    /// Number of branches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.histories.len()
    }

    /// True when there are no branches; never the case after [`Self::new`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }

    /// Every branch, in the order they were added.
    #[must_use]
    pub fn histories(&self) -> &[VersionHistory] {
        &self.histories
    }

    /// Make `index` the current branch.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::IndexOutOfRange`] for an unknown index.
    pub fn set_current_index(&mut self, index: usize) -> Result<()> {
        self.check_index(index)?;
        self.current_index = index;
        Ok(())
    }

    /// Branch at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::IndexOutOfRange`] for an unknown index.
    pub fn version_history(&self, index: usize) -> Result<&VersionHistory> {
        self.check_index(index)?;
        Ok(&self.histories[index])
    }

    /// Mutable branch at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::IndexOutOfRange`] for an unknown index.
    pub fn version_history_mut(&mut self, index: usize) -> Result<&mut VersionHistory> {
        self.check_index(index)?;
        Ok(&mut self.histories[index])
    }

    /// The current branch.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::IndexOutOfRange`] if the set is corrupted.
    pub fn current_version_history(&self) -> Result<&VersionHistory> {
        self.version_history(self.current_index)
    }

    /// The current branch, mutably.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::IndexOutOfRange`] if the set is corrupted.
    pub fn current_version_history_mut(&mut self) -> Result<&mut VersionHistory> {
        self.version_history_mut(self.current_index)
    }

    /// Insert a branch, deduplicating against branches on the same physical chain.
    ///
    /// A branch sharing its token with an existing branch is not added again:
    /// a prefix (or an equal copy) of the existing branch returns its index, a
    /// strict extension replaces it in place. Returns `(created, index)`.
    ///
    /// # Errors
    ///
    /// - [`HistoryError::EmptyHistory`] if `branch` has no items.
    /// - [`HistoryError::InvalidArgument`] if the first item's version differs
    ///   from the current branch's, or the token already names a divergent branch.
    pub fn add_version_history(&mut self, branch: VersionHistory) -> Result<(bool, usize)> {
        let incoming_first = branch.first_item()?;
        let current_first = self.current_version_history()?.first_item()?;
        if incoming_first.version != current_first.version {
            return Err(HistoryError::invalid(format!(
                "version history first item {incoming_first} does not match current first item {current_first}"
            )));
        }

        for (index, existing) in self.histories.iter_mut().enumerate() {
            if existing.branch_token() != branch.branch_token() {
                continue;
            }
            if branch.is_prefix_of(existing) {
                return Ok((false, index));
            }
            if existing.is_prefix_of(&branch) {
                *existing = branch;
                return Ok((false, index));
            }
            return Err(HistoryError::invalid(format!(
                "branch token {} already names a divergent version history",
                branch.branch_token()
            )));
        }

        self.histories.push(branch);
        Ok((true, self.histories.len() - 1))
    }

    /// Index of the first branch containing `item`.
    ///
    /// A linear scan: executions fork rarely, so branch counts stay small.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::ItemNotFound`] if no branch contains `item`.
    pub fn find_first_version_history_index_by_item(
        &self,
        item: &VersionHistoryItem,
    ) -> Result<usize> {
        self.histories
            .iter()
            .position(|history| history.contains_item(item))
            .ok_or(HistoryError::ItemNotFound(*item))
    }

    /// Local branch sharing the most history with `incoming`, and that LCA item.
    ///
    /// Prefers the highest LCA event id; on ties, the shorter local branch.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::NoCommonAncestor`] if any local branch shares no
    /// prefix with `incoming`.
    pub fn find_lca_version_history_index_and_item(
        &self,
        incoming: &VersionHistory,
    ) -> Result<(usize, VersionHistoryItem)> {
        let mut best: Option<(usize, VersionHistoryItem, i64)> = None;

        for (index, local) in self.histories.iter().enumerate() {
            let lca = local.find_lca_item(incoming)?;
            let local_last_event_id = local.last_item()?.event_id;

            let better = match best {
                None => true,
                Some((_, best_lca, best_len)) => {
                    lca.event_id > best_lca.event_id
                        || (lca.event_id == best_lca.event_id && local_last_event_id < best_len)
                }
            };
            if better {
                best = Some((index, lca, local_last_event_id));
            }
        }

        best.map(|(index, lca, _)| (index, lca))
            .ok_or(HistoryError::EmptyHistory)
    }

    /// True iff no branch was last written at a higher version than the current one.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::EmptyHistory`] if any branch is empty.
    pub fn is_rebuilt(&self) -> Result<bool> {
        let current_last = self.current_version_history()?.last_item()?;
        for history in &self.histories {
            if history.last_item()?.version > current_last.version {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index < self.histories.len() {
            Ok(())
        } else {
            Err(HistoryError::IndexOutOfRange {
                index,
                len: self.histories.len(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
