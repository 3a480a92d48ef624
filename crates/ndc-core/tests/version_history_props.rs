use ndc_core::version_history::{VersionHistories, VersionHistoryItem};
use proptest::prelude::*;

#[path = "generators.rs"]
mod generators;
use generators::*;

/// An item somewhere on `history`, chosen by `pick`.
fn item_at(history: &ndc_core::VersionHistory, pick: prop::sample::Index) -> VersionHistoryItem {
    let last = history.last_item().expect("non-empty").event_id;
    let event_id = 1 + i64::try_from(pick.index(usize::try_from(last).expect("positive"))).expect("small");
    let version = history.event_version(event_id).expect("inside branch");
    VersionHistoryItem::new(event_id, version)
}

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(512))]

    #[test]
    fn items_strictly_increase(history in arb_version_history()) {
        for pair in history.items().windows(2) {
            prop_assert!(pair[0].event_id < pair[1].event_id);
            prop_assert!(pair[0].version < pair[1].version);
        }
    }

    #[test]
    fn every_written_event_is_contained(history in arb_version_history()) {
        let last = history.last_item().expect("non-empty");
        for event_id in 1..=last.event_id {
            let version = history.event_version(event_id).expect("inside branch");
            prop_assert!(history.contains_item(&VersionHistoryItem::new(event_id, version)));
        }
        prop_assert!(!history.contains_item(&VersionHistoryItem::new(last.event_id + 1, last.version)));
    }

    #[test]
    fn lca_is_symmetric_and_exact(
        base in arb_version_history(),
        pick in any::<prop::sample::Index>(),
        left in prop::collection::vec(1i64..4, 0..4),
        right in prop::collection::vec(1i64..4, 0..4),
    ) {
        let fork_point = item_at(&base, pick);
        let a = fork_of(&base, "a", fork_point, 1, &left);
        let b = fork_of(&base, "b", fork_point, 2, &right);

        let ab = a.find_lca_item(&b).expect("shared prefix");
        let ba = b.find_lca_item(&a).expect("shared prefix");
        prop_assert_eq!(ab, ba);
        prop_assert_eq!(ab, fork_point);
    }

    #[test]
    fn lca_with_self_is_last_item(history in arb_version_history()) {
        prop_assert_eq!(
            history.find_lca_item(&history).expect("shared"),
            history.last_item().expect("non-empty")
        );
    }

    #[test]
    fn adding_contained_branch_is_idempotent(
        history in arb_version_history(),
        pick in any::<prop::sample::Index>(),
    ) {
        let mut histories = VersionHistories::new(history.clone());
        let before = histories.clone();

        let prefix = history
            .duplicate_until_lca_item(&item_at(&history, pick))
            .expect("item on branch");
        prop_assert_eq!(histories.add_version_history(prefix).expect("add prefix"), (false, 0));
        prop_assert_eq!(histories.add_version_history(history).expect("add self"), (false, 0));
        prop_assert_eq!(histories, before);
    }

    #[test]
    fn best_lca_branch_shares_most_history(
        base in arb_version_history(),
        pick in any::<prop::sample::Index>(),
        left in prop::collection::vec(1i64..4, 1..4),
        right in prop::collection::vec(1i64..4, 1..4),
    ) {
        let fork_point = item_at(&base, pick);
        let local = fork_of(&base, "local", fork_point, 1, &left);
        let incoming = fork_of(&base, "incoming", fork_point, 2, &right);

        let mut histories = VersionHistories::new(base.clone());
        let (_, index) = histories.add_version_history(local).expect("add fork");
        let current = histories.current_index();

        let (best, lca) = histories
            .find_lca_version_history_index_and_item(&incoming)
            .expect("shared prefix");
        prop_assert_eq!(lca, fork_point);
        // Both branches share exactly the fork point; ties go to the shorter one.
        let expected = if base.last_item().expect("non-empty").event_id
            <= histories.version_history(index).expect("fork").last_item().expect("non-empty").event_id
        {
            current
        } else {
            index
        };
        prop_assert_eq!(best, expected);
    }
}
