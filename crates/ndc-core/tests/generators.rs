use ndc_core::version_history::{VersionHistory, VersionHistoryItem};
use proptest::prelude::*;

/// Writes as `(events, version step)` runs; versions only move forward.
pub fn arb_writes() -> impl Strategy<Value = Vec<(i64, i64)>> + Clone {
    prop::collection::vec((1i64..6, 0i64..4), 1..12)
}

/// Apply `writes` one event at a time starting at `first_version`.
pub fn history_from_writes(token: &str, first_version: i64, writes: &[(i64, i64)]) -> VersionHistory {
    let mut history = VersionHistory::empty(token);
    let mut event_id = 0;
    let mut version = first_version;
    for &(events, step) in writes {
        version += step;
        for _ in 0..events {
            event_id += 1;
            history
                .add_or_update_item(VersionHistoryItem::new(event_id, version))
                .expect("forward write");
        }
    }
    history
}

pub fn arb_version_history() -> impl Strategy<Value = VersionHistory> + Clone {
    (0i64..100, arb_writes()).prop_map(|(first_version, writes)| {
        history_from_writes("branch", first_version, &writes)
    })
}

/// Extend `base` (cut at `fork_point`) with events at versions above all of
/// `base`'s, starting from `version_offset` so sibling forks never share one.
pub fn fork_of(
    base: &VersionHistory,
    token: &str,
    fork_point: VersionHistoryItem,
    version_offset: i64,
    suffix: &[i64],
) -> VersionHistory {
    let mut forked = base
        .duplicate_until_lca_item(&fork_point)
        .expect("fork point on base");
    forked.set_branch_token(token);
    let top = base.last_item().expect("non-empty base").version;
    let mut event_id = fork_point.event_id;
    for (step, &events) in suffix.iter().enumerate() {
        let version = top + version_offset + 2 * i64::try_from(step).expect("small");
        for _ in 0..events {
            event_id += 1;
            forked
                .add_or_update_item(VersionHistoryItem::new(event_id, version))
                .expect("forward write");
        }
    }
    forked
}
