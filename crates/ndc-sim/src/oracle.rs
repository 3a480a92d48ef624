use ndc_core::ReplicationTask;
use ndc_core::version_history::VersionHistoryItem;
use serde::Serialize;

use crate::cluster::{ClusterSnapshot, Delivery, SimulatedCluster};
use crate::network::ClusterId;

// ── Core result types ─────────────────────────────────────────────────────────

/// Outcome of one or more invariant checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OracleResult {
    /// `true` iff no violations were found.
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    #[must_use]
    pub(crate) const fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    #[must_use]
    pub(crate) fn from_violations(violations: Vec<InvariantViolation>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
        }
    }

    /// Accumulate the failures of `other`.
    #[must_use]
    pub(crate) fn merge(mut self, other: Self) -> Self {
        if !other.passed {
            self.passed = false;
            self.violations.extend(other.violations);
        }
        self
    }
}

// ── Invariant violation diagnostics ──────────────────────────────────────────

/// A single failed invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "invariant", rename_all = "snake_case")]
pub enum InvariantViolation {
    /// A cluster never learned about the execution.
    MissingExecution { cluster: ClusterId },

    /// Two clusters ended on different current branches.
    BranchDivergence {
        cluster_a: ClusterId,
        cluster_b: ClusterId,
        items_a: Vec<VersionHistoryItem>,
        items_b: Vec<VersionHistoryItem>,
    },

    /// Same current branch, different derived state.
    StateDivergence {
        cluster_a: ClusterId,
        cluster_b: ClusterId,
        field: String,
    },

    /// Current branch events differ; `event_id` is the first mismatch.
    HistoryDivergence {
        cluster_a: ClusterId,
        cluster_b: ClusterId,
        event_id: i64,
    },

    /// The current branch does not carry the highest last version.
    StaleCurrentBranch { cluster: ClusterId },

    /// Tasks still parked after the network drained.
    StuckTasks { cluster: ClusterId, deferred: usize },

    /// A task was rejected instead of applied, backfilled or deferred.
    TaskRejected {
        cluster: ClusterId,
        first_event_id: i64,
        version: i64,
        error: String,
    },

    /// Re-applying an applied task was not a pure duplicate.
    Idempotence {
        cluster: ClusterId,
        first_event_id: i64,
        version: i64,
        outcome: String,
    },
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingExecution { cluster } => {
                write!(f, "MissingExecution: cluster {cluster} has no execution")
            }
            Self::BranchDivergence {
                cluster_a,
                cluster_b,
                items_a,
                items_b,
            } => write!(
                f,
                "BranchDivergence: clusters {cluster_a} and {cluster_b} diverge \
                 (items_a={items_a:?}, items_b={items_b:?})"
            ),
            Self::StateDivergence {
                cluster_a,
                cluster_b,
                field,
            } => write!(
                f,
                "StateDivergence: clusters {cluster_a} and {cluster_b} disagree on {field}"
            ),
            Self::HistoryDivergence {
                cluster_a,
                cluster_b,
                event_id,
            } => write!(
                f,
                "HistoryDivergence: clusters {cluster_a} and {cluster_b} differ at event {event_id}"
            ),
            Self::StaleCurrentBranch { cluster } => write!(
                f,
                "StaleCurrentBranch: cluster {cluster} follows a branch below the highest version"
            ),
            Self::StuckTasks { cluster, deferred } => {
                write!(f, "StuckTasks: cluster {cluster} still holds {deferred} deferred tasks")
            }
            Self::TaskRejected {
                cluster,
                first_event_id,
                version,
                error,
            } => write!(
                f,
                "TaskRejected: cluster {cluster} rejected [{first_event_id}@{version}]: {error}"
            ),
            Self::Idempotence {
                cluster,
                first_event_id,
                version,
                outcome,
            } => write!(
                f,
                "Idempotence: cluster {cluster} re-applied [{first_event_id}@{version}] as {outcome}"
            ),
        }
    }
}

// ── Oracle ───────────────────────────────────────────────────────────────────

/// Invariant checks run once the network has drained.
pub struct ConvergenceOracle;

impl ConvergenceOracle {
    /// Every check that only needs end-of-run snapshots.
    #[must_use]
    pub fn check_all(snapshots: &[ClusterSnapshot]) -> OracleResult {
        Self::check_executions(snapshots)
            .merge(Self::check_convergence(snapshots))
            .merge(Self::check_current_branches(snapshots))
            .merge(Self::check_drained(snapshots))
    }

    /// Every cluster knows the execution.
    #[must_use]
    pub fn check_executions(snapshots: &[ClusterSnapshot]) -> OracleResult {
        OracleResult::from_violations(
            snapshots
                .iter()
                .filter(|snapshot| snapshot.execution_info.is_none())
                .map(|snapshot| InvariantViolation::MissingExecution {
                    cluster: snapshot.cluster,
                })
                .collect(),
        )
    }

    /// Every cluster matches the first one: current branch items, derived
    /// state and the events on the current branch.
    #[must_use]
    pub fn check_convergence(snapshots: &[ClusterSnapshot]) -> OracleResult {
        let Some((reference, rest)) = snapshots.split_first() else {
            return OracleResult::pass();
        };
        let mut violations = Vec::new();
        for other in rest {
            if other.current_items != reference.current_items {
                violations.push(InvariantViolation::BranchDivergence {
                    cluster_a: reference.cluster,
                    cluster_b: other.cluster,
                    items_a: reference.current_items.clone(),
                    items_b: other.current_items.clone(),
                });
                continue;
            }
            for field in state_mismatches(reference, other) {
                violations.push(InvariantViolation::StateDivergence {
                    cluster_a: reference.cluster,
                    cluster_b: other.cluster,
                    field: field.to_string(),
                });
            }
            if let Some(event_id) = first_event_mismatch(reference, other) {
                violations.push(InvariantViolation::HistoryDivergence {
                    cluster_a: reference.cluster,
                    cluster_b: other.cluster,
                    event_id,
                });
            }
        }
        OracleResult::from_violations(violations)
    }

    /// No non-current branch ends at a higher version than the current one.
    #[must_use]
    pub fn check_current_branches(snapshots: &[ClusterSnapshot]) -> OracleResult {
        OracleResult::from_violations(
            snapshots
                .iter()
                .filter(|snapshot| snapshot.execution_info.is_some() && !snapshot.current_is_highest)
                .map(|snapshot| InvariantViolation::StaleCurrentBranch {
                    cluster: snapshot.cluster,
                })
                .collect(),
        )
    }

    /// Nothing is left parked.
    #[must_use]
    pub fn check_drained(snapshots: &[ClusterSnapshot]) -> OracleResult {
        OracleResult::from_violations(
            snapshots
                .iter()
                .filter(|snapshot| snapshot.deferred > 0)
                .map(|snapshot| InvariantViolation::StuckTasks {
                    cluster: snapshot.cluster,
                    deferred: snapshot.deferred,
                })
                .collect(),
        )
    }

    /// Re-deliver every task to every cluster: each must be a duplicate and
    /// leave the snapshot unchanged.
    ///
    /// Mutates nothing when the invariant holds.
    #[must_use]
    pub fn check_idempotence(
        clusters: &[SimulatedCluster],
        snapshots: &[ClusterSnapshot],
        tasks: &[ReplicationTask],
    ) -> OracleResult {
        let mut violations = Vec::new();
        for (cluster, before) in clusters.iter().zip(snapshots) {
            for task in tasks {
                let outcome = match cluster.apply(task) {
                    Ok(Delivery::Duplicate) => continue,
                    Ok(other) => format!("{other:?}"),
                    Err(err) => err.to_string(),
                };
                violations.push(InvariantViolation::Idempotence {
                    cluster: cluster.id(),
                    first_event_id: task.first_event_id,
                    version: task.version,
                    outcome,
                });
            }
            let after = tasks
                .first()
                .and_then(|task| cluster.snapshot(&task.workflow).ok());
            if let Some(after) = after.filter(|after| after != before) {
                violations.push(InvariantViolation::Idempotence {
                    cluster: cluster.id(),
                    first_event_id: after.next_event_id,
                    version: after.last_write_version,
                    outcome: "state changed".into(),
                });
            }
        }
        OracleResult::from_violations(violations)
    }
}

fn state_mismatches(a: &ClusterSnapshot, b: &ClusterSnapshot) -> Vec<&'static str> {
    let mut fields = Vec::new();
    if a.execution_info != b.execution_info {
        fields.push("execution_info");
    }
    if a.pending_activities != b.pending_activities {
        fields.push("pending_activities");
    }
    if a.pending_timers != b.pending_timers {
        fields.push("pending_timers");
    }
    if a.next_event_id != b.next_event_id {
        fields.push("next_event_id");
    }
    if a.last_write_version != b.last_write_version {
        fields.push("last_write_version");
    }
    fields
}

fn first_event_mismatch(a: &ClusterSnapshot, b: &ClusterSnapshot) -> Option<i64> {
    if let Some(event) = a.events.iter().zip(&b.events).find_map(|(x, y)| (x != y).then_some(x)) {
        return Some(event.event_id);
    }
    (a.events.len() != b.events.len()).then(|| {
        let shorter = a.events.len().min(b.events.len());
        i64::try_from(shorter).map_or(i64::MAX, |len| len + 1)
    })
}
