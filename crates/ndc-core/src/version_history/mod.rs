//! Version histories: branch identity and version comparison for one execution.
//!
//! Every cluster appending events to an execution stamps them with its
//! failover *version*. A [`VersionHistory`] summarizes one branch of the
//! execution's event log as a list of [`VersionHistoryItem`]s, each marking
//! the last event id written at a version:
//!
//! ```text
//! items: (3, v10) (7, v12) (8, v21)
//! events 1..=3 written at v10, 4..=7 at v12, 8 at v21
//! ```
//!
//! [`VersionHistories`] holds every branch an execution has ever had, plus the
//! index of the branch the cached mutable state currently follows.
//!
//! # Invariants
//!
//! - Items are strictly increasing by event id and by version.
//! - A written history is never empty; branches are never removed.
//! - Two branches agree up to event `P` iff they carry identical versions for
//!   every event id `<= P`. [`VersionHistory::find_lca_item`] returns the
//!   largest such point.
//!
//! # Sub-modules
//!
//! - [`history`]: [`VersionHistoryItem`], [`VersionHistory`], [`BranchToken`].
//! - [`histories`]: [`VersionHistories`].

pub mod histories;
pub mod history;

pub use histories::VersionHistories;
pub use history::{BranchToken, VersionHistory, VersionHistoryItem};

/// Event id of the first event of every execution.
pub const FIRST_EVENT_ID: i64 = 1;

/// Placeholder event id meaning "not set".
pub const EMPTY_EVENT_ID: i64 = 0;

/// Placeholder version meaning "not set".
pub const EMPTY_VERSION: i64 = -24;
