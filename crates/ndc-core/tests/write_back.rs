//! Integration tests: optimistic write-back against shared stores.
//!
//! Covers:
//!   - Two engines sharing both stores: a stale cache gets a retryable
//!     conflict, and the retry works from the persisted execution
//!   - A write-back failing after the history append takes the append back
//!   - A history store that moved past the cached state reads as a conflict
//!   - A branch forked for a failed task is deleted again

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use ndc_core::config::Config;
use ndc_core::error::Result;
use ndc_core::event::EventKind;
use ndc_core::state::MutableState;
use ndc_core::store::{ExecutionStore, HistoryStore, MemoryExecutionStore, MemoryHistoryStore};
use ndc_core::version_history::BranchToken;
use ndc_core::{ApplyOutcome, ErrorKind, HistoryEngine, HistoryError, WorkflowIdentifier};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

fn id() -> WorkflowIdentifier {
    WorkflowIdentifier::new("billing", "subscription-3", "run-1")
}

fn signal(name: &str) -> EventKind {
    EventKind::WorkflowExecutionSignaled {
        signal_name: name.into(),
        input: None,
    }
}

/// Execution store whose next update fails after the history append went through.
#[derive(Debug, Default)]
struct FlakyExecutionStore {
    inner: MemoryExecutionStore,
    fail_next_update: AtomicBool,
}

impl FlakyExecutionStore {
    fn fail_next_update(&self) {
        self.fail_next_update.store(true, Ordering::SeqCst);
    }
}

impl ExecutionStore for FlakyExecutionStore {
    fn create_workflow_execution(&self, state: &MutableState) -> Result<i64> {
        self.inner.create_workflow_execution(state)
    }

    fn get_workflow_execution(&self, id: &WorkflowIdentifier) -> Result<MutableState> {
        self.inner.get_workflow_execution(id)
    }

    fn update_workflow_execution(&self, state: &MutableState, expected_condition: i64) -> Result<i64> {
        if self.fail_next_update.swap(false, Ordering::SeqCst) {
            return Err(HistoryError::ConditionFailed {
                expected: expected_condition,
                actual: expected_condition + 1,
            });
        }
        self.inner.update_workflow_execution(state, expected_condition)
    }
}

/// Execution store that skips the early condition check, as if another
/// writer slipped in between the check and the history append.
#[derive(Debug, Default)]
struct UncheckedExecutionStore(MemoryExecutionStore);

impl ExecutionStore for UncheckedExecutionStore {
    fn create_workflow_execution(&self, state: &MutableState) -> Result<i64> {
        self.0.create_workflow_execution(state)
    }

    fn get_workflow_execution(&self, id: &WorkflowIdentifier) -> Result<MutableState> {
        self.0.get_workflow_execution(id)
    }

    fn update_workflow_execution(&self, state: &MutableState, expected_condition: i64) -> Result<i64> {
        self.0.update_workflow_execution(state, expected_condition)
    }

    fn check_update_condition(&self, _id: &WorkflowIdentifier, _expected_condition: i64) -> Result<()> {
        Ok(())
    }
}

fn engine(history: &Arc<MemoryHistoryStore>, executions: Arc<dyn ExecutionStore>) -> HistoryEngine {
    HistoryEngine::new(&Config::default(), Arc::clone(history) as Arc<dyn HistoryStore>, executions)
}

fn current_branch(engine: &HistoryEngine) -> BranchToken {
    engine
        .mutable_state(&id())
        .expect("state")
        .version_histories()
        .current_version_history()
        .expect("current")
        .branch_token()
        .clone()
}

fn stored_ids(history: &MemoryHistoryStore, branch: &BranchToken) -> Vec<i64> {
    history
        .read_history_events(branch, 1, i64::MAX)
        .expect("read")
        .iter()
        .map(|event| event.event_id)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn stale_cache_conflicts_then_recovers() {
    let history = Arc::new(MemoryHistoryStore::new());
    let executions: Arc<dyn ExecutionStore> = Arc::new(MemoryExecutionStore::new());
    let a = engine(&history, Arc::clone(&executions));
    let b = engine(&history, Arc::clone(&executions));

    a.start_workflow_execution(&id(), 1, "renewal", Utc::now())
        .expect("start");
    assert_eq!(b.mutable_state(&id()).expect("cache on b").next_event_id(), 2);
    a.append_events(&id(), 1, vec![signal("from-a")], Utc::now())
        .expect("append on a");

    let err = b
        .append_events(&id(), 1, vec![signal("from-b")], Utc::now())
        .expect_err("b's cache is stale");
    assert!(matches!(
        err,
        HistoryError::ConditionFailed {
            expected: 1,
            actual: 2
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(err.kind().is_retryable());

    let task = b
        .append_events(&id(), 1, vec![signal("from-b")], Utc::now())
        .expect("retry on b");
    assert_eq!(task.first_event_id, 3);
    assert_eq!(b.mutable_state(&id()).expect("state").update_condition(), 3);

    // Now a is the stale one.
    let err = a
        .append_events(&id(), 1, vec![signal("again")], Utc::now())
        .expect_err("a's cache is stale");
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let task = a
        .append_events(&id(), 1, vec![signal("again")], Utc::now())
        .expect("retry on a");
    assert_eq!(task.first_event_id, 4);

    assert_eq!(stored_ids(&history, &current_branch(&a)), vec![1, 2, 3, 4]);
    assert_eq!(
        b.current_branch_events(&id()).expect("events on b").len(),
        4
    );
}

#[test]
fn failed_write_back_takes_back_appended_events() {
    let history = Arc::new(MemoryHistoryStore::new());
    let executions = Arc::new(FlakyExecutionStore::default());
    let engine = engine(&history, Arc::clone(&executions) as Arc<dyn ExecutionStore>);

    engine
        .start_workflow_execution(&id(), 1, "renewal", Utc::now())
        .expect("start");
    let branch = current_branch(&engine);

    executions.fail_next_update();
    let err = engine
        .append_events(&id(), 1, vec![signal("lost")], Utc::now())
        .expect_err("write-back fails");
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(stored_ids(&history, &branch), vec![1]);

    let task = engine
        .append_events(&id(), 1, vec![signal("kept")], Utc::now())
        .expect("retry");
    assert_eq!(task.first_event_id, 2);
    assert_eq!(stored_ids(&history, &branch), vec![1, 2]);
}

#[test]
fn failed_replicated_write_back_can_be_retried() {
    let source = HistoryEngine::in_memory(&Config::default());
    let history = Arc::new(MemoryHistoryStore::new());
    let executions = Arc::new(FlakyExecutionStore::default());
    let target = engine(&history, Arc::clone(&executions) as Arc<dyn ExecutionStore>);

    let started = source
        .start_workflow_execution(&id(), 1, "renewal", Utc::now())
        .expect("start");
    let signalled = source
        .append_events(&id(), 1, vec![signal("paid")], Utc::now())
        .expect("append");
    target.apply_replication_task(&started).expect("replicate start");

    executions.fail_next_update();
    let err = target
        .apply_replication_task(&signalled)
        .expect_err("write-back fails");
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(stored_ids(&history, &current_branch(&target)), vec![1]);

    let result = target
        .apply_replication_task(&signalled)
        .expect("retry the same task");
    assert_eq!(result.outcome, ApplyOutcome::Applied);
    assert_eq!(stored_ids(&history, &current_branch(&target)), vec![1, 2]);
}

#[test]
fn moved_history_branch_reads_as_conflict() {
    let history = Arc::new(MemoryHistoryStore::new());
    let executions: Arc<dyn ExecutionStore> = Arc::new(UncheckedExecutionStore::default());
    let a = engine(&history, Arc::clone(&executions));
    let b = engine(&history, Arc::clone(&executions));

    a.start_workflow_execution(&id(), 1, "renewal", Utc::now())
        .expect("start");
    b.mutable_state(&id()).expect("cache on b");
    a.append_events(&id(), 1, vec![signal("from-a")], Utc::now())
        .expect("append on a");

    let err = b
        .append_events(&id(), 1, vec![signal("from-b")], Utc::now())
        .expect_err("history branch moved");
    assert!(matches!(
        err,
        HistoryError::ConditionFailed {
            expected: 1,
            actual: 2
        }
    ));

    let task = b
        .append_events(&id(), 1, vec![signal("from-b")], Utc::now())
        .expect("retry on b");
    assert_eq!(task.first_event_id, 3);
}

#[test]
fn fork_of_failed_task_is_deleted() {
    let source = HistoryEngine::in_memory(&Config::default());
    let history = Arc::new(MemoryHistoryStore::new());
    let executions = Arc::new(FlakyExecutionStore::default());
    let target = engine(&history, Arc::clone(&executions) as Arc<dyn ExecutionStore>);

    for task in [
        source
            .start_workflow_execution(&id(), 1, "renewal", Utc::now())
            .expect("start"),
        source
            .append_events(&id(), 1, vec![signal("paid")], Utc::now())
            .expect("append"),
    ] {
        target.apply_replication_task(&task).expect("replicate");
    }
    target
        .append_events(&id(), 2, vec![signal("local")], Utc::now())
        .expect("local write on target");
    let conflicting = source
        .append_events(&id(), 11, vec![signal("remote")], Utc::now())
        .expect("conflicting write on source");
    assert_eq!(history.branch_count().expect("count"), 1);

    executions.fail_next_update();
    let err = target
        .apply_replication_task(&conflicting)
        .expect_err("write-back fails");
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(history.branch_count().expect("count"), 1);

    let result = target
        .apply_replication_task(&conflicting)
        .expect("retry the same task");
    assert_eq!(result.outcome, ApplyOutcome::Applied);
    assert!(result.rebuilt);
    assert_eq!(history.branch_count().expect("count"), 2);
    assert_eq!(stored_ids(&history, &current_branch(&target)), vec![1, 2, 3]);
}
