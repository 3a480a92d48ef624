//! A single branch: ordered version history items plus its branch token.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{HistoryError, Result};

use super::{EMPTY_EVENT_ID, FIRST_EVENT_ID};

// ---------------------------------------------------------------------------
// BranchToken
// ---------------------------------------------------------------------------

/// Opaque identifier of a physical event chain in the history store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchToken(Vec<u8>);

impl BranchToken {
    /// Wrap raw token bytes.
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw token bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True for a token not yet assigned by a store.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for BranchToken {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for BranchToken {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for BranchToken {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

impl fmt::Display for BranchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) => f.write_str(text),
            Err(_) => {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// VersionHistoryItem
// ---------------------------------------------------------------------------

/// The last event id written at a version on some branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionHistoryItem {
    pub event_id: i64,
    pub version: i64,
}

impl VersionHistoryItem {
    /// Item for `event_id` written at `version`.
    #[must_use]
    pub const fn new(event_id: i64, version: i64) -> Self {
        Self { event_id, version }
    }
}

impl fmt::Display for VersionHistoryItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(event_id={}, version={})", self.event_id, self.version)
    }
}

// ---------------------------------------------------------------------------
// VersionHistory
// ---------------------------------------------------------------------------

/// One branch of an execution's history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistory {
    branch_token: BranchToken,
    items: Vec<VersionHistoryItem>,
}

impl VersionHistory {
    /// Build a branch from items, validating ordering.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::InvalidArgument`] if event ids are not strictly
    /// increasing or versions decrease.
    pub fn new(branch_token: impl Into<BranchToken>, items: Vec<VersionHistoryItem>) -> Result<Self> {
        let mut history = Self::empty(branch_token);
        for item in items {
            history.add_or_update_item(item)?;
        }
        Ok(history)
    }

    /// A branch with a token and no items yet.
    #[must_use]
    pub fn empty(branch_token: impl Into<BranchToken>) -> Self {
        Self {
            branch_token: branch_token.into(),
            items: Vec::new(),
        }
    }

    /// Store branch holding this branch's events.
    #[must_use]
    pub const fn branch_token(&self) -> &BranchToken {
        &self.branch_token
    }

    /// Point this branch at another store branch, keeping its items.
    pub fn set_branch_token(&mut self, branch_token: impl Into<BranchToken>) {
        self.branch_token = branch_token.into();
    }

    /// Items in event id order.
    #[must_use]
    pub fn items(&self) -> &[VersionHistoryItem] {
        &self.items
    }

    /// True before the branch's first event.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// First item of the branch.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::EmptyHistory`] if the branch has no items.
    pub fn first_item(&self) -> Result<VersionHistoryItem> {
        self.items.first().copied().ok_or(HistoryError::EmptyHistory)
    }

    /// Last item of the branch.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::EmptyHistory`] if the branch has no items.
    pub fn last_item(&self) -> Result<VersionHistoryItem> {
        self.items.last().copied().ok_or(HistoryError::EmptyHistory)
    }

    /// Event id following the branch's last event ([`FIRST_EVENT_ID`] when empty).
    #[must_use]
    pub fn next_event_id(&self) -> i64 {
        self.items
            .last()
            .map_or(FIRST_EVENT_ID, |item| item.event_id + 1)
    }

    /// Version the branch wrote `event_id` at, if the branch reaches it.
    #[must_use]
    pub fn event_version(&self, event_id: i64) -> Option<i64> {
        if event_id < FIRST_EVENT_ID {
            return None;
        }
        self.items
            .iter()
            .find(|item| event_id <= item.event_id)
            .map(|item| item.version)
    }

    /// Append an event position, extending the last item when the version matches.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::InvalidArgument`] if the event id does not move
    /// forward or the version moves backward.
    pub fn add_or_update_item(&mut self, item: VersionHistoryItem) -> Result<()> {
        if item.event_id <= EMPTY_EVENT_ID {
            return Err(HistoryError::invalid(format!(
                "version history item {item} has a non-positive event id"
            )));
        }

        let Some(last) = self.items.last_mut() else {
            self.items.push(item);
            return Ok(());
        };

        if item.version < last.version {
            return Err(HistoryError::invalid(format!(
                "cannot add item {item}: version is lower than last item {last}"
            )));
        }
        if item.event_id <= last.event_id {
            return Err(HistoryError::invalid(format!(
                "cannot add item {item}: event id does not follow last item {last}"
            )));
        }

        if item.version == last.version {
            last.event_id = item.event_id;
        } else {
            self.items.push(item);
        }
        Ok(())
    }

    /// True iff this branch wrote `item.event_id` at `item.version`.
    #[must_use]
    pub fn contains_item(&self, item: &VersionHistoryItem) -> bool {
        let mut prev_event_id = FIRST_EVENT_ID - 1;
        for current in &self.items {
            if item.version == current.version {
                return prev_event_id < item.event_id && item.event_id <= current.event_id;
            }
            if item.version < current.version {
                return false;
            }
            prev_event_id = current.event_id;
        }
        false
    }

    /// Latest item both branches agree on.
    ///
    /// Walks both item lists from the end. Equal versions mean the two branches
    /// agree up to the smaller of the two event ids; otherwise the side holding
    /// the higher version steps back, since that version only exists on it.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::NoCommonAncestor`] if no version is shared.
    pub fn find_lca_item(&self, other: &Self) -> Result<VersionHistoryItem> {
        let mut local = self.items.len();
        let mut remote = other.items.len();

        while local > 0 && remote > 0 {
            let local_item = self.items[local - 1];
            let remote_item = other.items[remote - 1];

            match local_item.version.cmp(&remote_item.version) {
                std::cmp::Ordering::Equal => {
                    return Ok(if local_item.event_id > remote_item.event_id {
                        remote_item
                    } else {
                        local_item
                    });
                }
                std::cmp::Ordering::Greater => local -= 1,
                std::cmp::Ordering::Less => remote -= 1,
            }
        }

        Err(HistoryError::NoCommonAncestor)
    }

    /// True iff `item` is this branch's last item, so events can append directly.
    #[must_use]
    pub fn is_lca_appendable(&self, item: &VersionHistoryItem) -> bool {
        self.items.last() == Some(item)
    }

    /// True iff every event of `self` appears with the same version on `other`.
    #[must_use]
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        match (self.last_item(), self.find_lca_item(other)) {
            (Ok(last), Ok(lca)) => last == lca,
            _ => false,
        }
    }

    /// Copy of this branch truncated at `lca`, with the same branch token.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::ItemNotFound`] if the branch does not contain `lca`.
    pub fn duplicate_until_lca_item(&self, lca: &VersionHistoryItem) -> Result<Self> {
        if !self.contains_item(lca) {
            return Err(HistoryError::ItemNotFound(*lca));
        }

        let mut items: Vec<VersionHistoryItem> = self
            .items
            .iter()
            .copied()
            .take_while(|item| item.version < lca.version)
            .collect();
        items.push(*lca);

        Ok(Self {
            branch_token: self.branch_token.clone(),
            items,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn history(token: &str, items: &[(i64, i64)]) -> VersionHistory {
        VersionHistory::new(
            token,
            items
                .iter()
                .map(|&(event_id, version)| VersionHistoryItem::new(event_id, version))
                .collect(),
        )
        .expect("well-formed history")
    }

    // ===================================================================
    // construction and append
    // ===================================================================

    #[test]
    fn empty_history_has_no_first_or_last_item() {
        let h = VersionHistory::empty("token");
        assert!(matches!(h.first_item(), Err(HistoryError::EmptyHistory)));
        assert!(matches!(h.last_item(), Err(HistoryError::EmptyHistory)));
        assert_eq!(h.next_event_id(), FIRST_EVENT_ID);
    }

    #[test]
    fn same_version_extends_last_item() {
        let mut h = history("token", &[(3, 10)]);
        h.add_or_update_item(VersionHistoryItem::new(5, 10)).unwrap();
        assert_eq!(h.items(), &[VersionHistoryItem::new(5, 10)]);

        h.add_or_update_item(VersionHistoryItem::new(6, 12)).unwrap();
        assert_eq!(h.items().len(), 2);
        assert_eq!(h.last_item().unwrap(), VersionHistoryItem::new(6, 12));
        assert_eq!(h.next_event_id(), 7);
    }

    #[test]
    fn lower_version_is_rejected() {
        let mut h = history("token", &[(3, 10)]);
        let err = h.add_or_update_item(VersionHistoryItem::new(4, 9)).unwrap_err();
        assert!(matches!(err, HistoryError::InvalidArgument(_)));
    }

    #[test]
    fn non_increasing_event_id_is_rejected() {
        let mut h = history("token", &[(3, 10)]);
        let err = h.add_or_update_item(VersionHistoryItem::new(3, 11)).unwrap_err();
        assert!(matches!(err, HistoryError::InvalidArgument(_)));

        let err = VersionHistory::new("t", vec![VersionHistoryItem::new(0, 1)]).unwrap_err();
        assert!(matches!(err, HistoryError::InvalidArgument(_)));
    }

    #[test]
    fn event_version_resolves_segments() {
        let h = history("token", &[(3, 10), (7, 12), (8, 21)]);
        assert_eq!(h.event_version(0), None);
        assert_eq!(h.event_version(1), Some(10));
        assert_eq!(h.event_version(3), Some(10));
        assert_eq!(h.event_version(4), Some(12));
        assert_eq!(h.event_version(8), Some(21));
        assert_eq!(h.event_version(9), None);
    }

    // ===================================================================
    // contains_item
    // ===================================================================

    #[test]
    fn contains_item_checks_segment_bounds() {
        let h = history("token", &[(3, 10), (7, 12)]);
        assert!(h.contains_item(&VersionHistoryItem::new(1, 10)));
        assert!(h.contains_item(&VersionHistoryItem::new(3, 10)));
        assert!(!h.contains_item(&VersionHistoryItem::new(4, 10)));
        assert!(h.contains_item(&VersionHistoryItem::new(4, 12)));
        assert!(h.contains_item(&VersionHistoryItem::new(7, 12)));
        assert!(!h.contains_item(&VersionHistoryItem::new(3, 12)));
        assert!(!h.contains_item(&VersionHistoryItem::new(8, 12)));
        assert!(!h.contains_item(&VersionHistoryItem::new(5, 11)));
        assert!(!h.contains_item(&VersionHistoryItem::new(9, 13)));
    }

    // ===================================================================
    // find_lca_item
    // ===================================================================

    #[test]
    fn lca_of_identical_histories_is_last_item() {
        let a = history("a", &[(3, 10), (7, 12)]);
        let b = history("b", &[(3, 10), (7, 12)]);
        assert_eq!(a.find_lca_item(&b).unwrap(), VersionHistoryItem::new(7, 12));
    }

    #[test]
    fn lca_same_version_picks_shorter_branch() {
        // branch0 ends at 5, branch1 at 2, both written at version 12.
        let branch0 = history("b0", &[(5, 12)]);
        let branch1 = history("b1", &[(2, 12)]);
        assert_eq!(
            branch0.find_lca_item(&branch1).unwrap(),
            VersionHistoryItem::new(2, 12)
        );
        assert_eq!(
            branch1.find_lca_item(&branch0).unwrap(),
            VersionHistoryItem::new(2, 12)
        );
    }

    #[test]
    fn lca_skips_versions_only_one_side_has() {
        //  (3,10) ─ (7,12) ─ (9,21)       local
        //        └─ (5,12) ─ (6,15)       remote
        let local = history("local", &[(3, 10), (7, 12), (9, 21)]);
        let remote = history("remote", &[(3, 10), (5, 12), (6, 15)]);
        assert_eq!(
            local.find_lca_item(&remote).unwrap(),
            VersionHistoryItem::new(5, 12)
        );
    }

    #[test]
    fn lca_is_symmetric() {
        let local = history("local", &[(3, 10), (7, 12), (9, 21)]);
        let remote = history("remote", &[(2, 10), (4, 15)]);
        assert_eq!(
            local.find_lca_item(&remote).unwrap(),
            remote.find_lca_item(&local).unwrap(),
            "LCA must be symmetric"
        );
        assert_eq!(
            local.find_lca_item(&remote).unwrap(),
            VersionHistoryItem::new(2, 10)
        );
    }

    #[test]
    fn lca_disjoint_versions_fail() {
        let a = history("a", &[(3, 10)]);
        let b = history("b", &[(3, 11)]);
        assert!(matches!(
            a.find_lca_item(&b),
            Err(HistoryError::NoCommonAncestor)
        ));
        let empty = VersionHistory::empty("e");
        assert!(matches!(
            a.find_lca_item(&empty),
            Err(HistoryError::NoCommonAncestor)
        ));
    }

    // ===================================================================
    // prefix / duplicate_until_lca_item
    // ===================================================================

    #[test]
    fn prefix_detection() {
        let long = history("t", &[(3, 10), (7, 12)]);
        let short = history("t", &[(3, 10), (5, 12)]);
        let other = history("t", &[(3, 10), (5, 13)]);
        assert!(short.is_prefix_of(&long));
        assert!(long.is_prefix_of(&long));
        assert!(!long.is_prefix_of(&short));
        assert!(!other.is_prefix_of(&long));
        assert!(!VersionHistory::empty("t").is_prefix_of(&long));
    }

    #[test]
    fn duplicate_until_lca_truncates_segment() {
        let h = history("t", &[(3, 10), (7, 12), (9, 21)]);
        let dup = h
            .duplicate_until_lca_item(&VersionHistoryItem::new(5, 12))
            .unwrap();
        assert_eq!(dup.branch_token(), h.branch_token());
        assert_eq!(
            dup.items(),
            &[VersionHistoryItem::new(3, 10), VersionHistoryItem::new(5, 12)]
        );
        assert!(dup.is_lca_appendable(&VersionHistoryItem::new(5, 12)));
    }

    #[test]
    fn duplicate_until_missing_item_fails() {
        let h = history("t", &[(3, 10), (7, 12)]);
        let err = h
            .duplicate_until_lca_item(&VersionHistoryItem::new(8, 12))
            .unwrap_err();
        assert!(matches!(err, HistoryError::ItemNotFound(_)));
        let err = h
            .duplicate_until_lca_item(&VersionHistoryItem::new(2, 11))
            .unwrap_err();
        assert!(matches!(err, HistoryError::ItemNotFound(_)));
    }

    #[test]
    fn branch_token_display_falls_back_to_hex() {
        assert_eq!(BranchToken::from("abc").to_string(), "abc");
        assert_eq!(BranchToken::new(vec![0xff, 0x01]).to_string(), "ff01");
    }
}
