use chrono::{DateTime, Utc};
use ndc_core::config::Config;
use ndc_core::event::{EventKind, HistoryEvent, decode_batch};
use ndc_core::raw_history::RawHistoryRequest;
use ndc_core::state::{ActivityInfo, ExecutionInfo, TimerInfo};
use ndc_core::version_history::VersionHistoryItem;
use ndc_core::{ApplyOutcome, HistoryEngine, HistoryError, ReplicationTask, WorkflowIdentifier};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::network::ClusterId;
use crate::rng::DeterministicRng;

/// Version a cluster writes at in `round`.
///
/// Unique per `(round, cluster)` as long as `increment` exceeds the
/// cluster count, and increasing with the round.
#[must_use]
pub fn failover_version(round: u64, cluster: ClusterId, increment: i64) -> i64 {
    let round = i64::try_from(round).unwrap_or(i64::MAX);
    let cluster = i64::try_from(cluster).unwrap_or(i64::MAX);
    round.saturating_mul(increment).saturating_add(cluster)
}

/// What happened to a delivered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    Applied,
    /// Applied after switching to the task's branch.
    Rebuilt,
    Backfilled,
    Duplicate,
    /// Arrived before its prefix; parked until the gap is filled.
    Deferred,
}

/// Result of a local write attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalWrite {
    Written(ReplicationTask),
    /// The cluster does not know the execution yet.
    NoExecution,
    /// The current branch already carries a higher version.
    Stale { last_write_version: i64 },
}

/// Observable end state of one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub cluster: ClusterId,
    pub current_items: Vec<VersionHistoryItem>,
    pub branch_count: usize,
    pub current_is_highest: bool,
    pub execution_info: Option<ExecutionInfo>,
    pub pending_activities: Vec<ActivityInfo>,
    pub pending_timers: Vec<TimerInfo>,
    pub next_event_id: i64,
    pub last_write_version: i64,
    pub events: Vec<HistoryEvent>,
    pub deferred: usize,
}

#[derive(Debug, Clone)]
struct DeferredTask {
    from: ClusterId,
    task: ReplicationTask,
    attempts: u32,
}

/// One data center: a history engine with its own stores and cache.
#[derive(Debug)]
pub struct SimulatedCluster {
    id: ClusterId,
    engine: HistoryEngine,
    deferred: Vec<DeferredTask>,
}

impl SimulatedCluster {
    #[must_use]
    pub fn new(id: ClusterId, config: &Config) -> Self {
        Self {
            id,
            engine: HistoryEngine::in_memory(config),
            deferred: Vec::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ClusterId {
        self.id
    }

    #[must_use]
    pub const fn engine(&self) -> &HistoryEngine {
        &self.engine
    }

    #[must_use]
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Start `workflow` here at `version`.
    ///
    /// # Errors
    ///
    /// Returns engine errors unchanged.
    pub fn start(
        &self,
        workflow: &WorkflowIdentifier,
        version: i64,
        timestamp: DateTime<Utc>,
    ) -> ndc_core::error::Result<ReplicationTask> {
        self.engine
            .start_workflow_execution(workflow, version, "simulated", timestamp)
    }

    /// Append a random batch of up to `max_events` events valid against the
    /// current state.
    ///
    /// # Errors
    ///
    /// Returns engine errors other than an unknown execution.
    pub fn local_write(
        &self,
        workflow: &WorkflowIdentifier,
        version: i64,
        max_events: u8,
        timestamp: DateTime<Utc>,
        rng: &mut DeterministicRng,
    ) -> ndc_core::error::Result<LocalWrite> {
        let state = match self.engine.mutable_state(workflow) {
            Ok(state) => state,
            Err(HistoryError::ExecutionNotFound(_)) => return Ok(LocalWrite::NoExecution),
            Err(err) => return Err(err),
        };
        if version < state.last_write_version() {
            return Ok(LocalWrite::Stale {
                last_write_version: state.last_write_version(),
            });
        }

        let count = 1 + rng.next_bounded(u64::from(max_events.max(1)));
        let mut activities: Vec<i64> = state.pending_activities().keys().copied().collect();
        let mut timers: Vec<String> = state.pending_timers().keys().cloned().collect();
        let mut kinds = Vec::new();
        for (offset, event_id) in (0..count).zip(state.next_event_id()..) {
            let tag = format!("{}-{version}-{offset}", self.id);
            let kind = match rng.next_bounded(6) {
                1 => {
                    activities.push(event_id);
                    EventKind::ActivityTaskScheduled {
                        activity_id: format!("activity-{tag}"),
                        activity_type: "charge".into(),
                    }
                }
                2 if !activities.is_empty() => EventKind::ActivityTaskCompleted {
                    scheduled_event_id: activities.swap_remove(rng.pick_index(activities.len())),
                    result: Some(tag),
                },
                3 => {
                    let timer_id = format!("timer-{tag}");
                    timers.push(timer_id.clone());
                    EventKind::TimerStarted {
                        timer_id,
                        fire_after_secs: 30,
                    }
                }
                4 if !timers.is_empty() => EventKind::TimerFired {
                    timer_id: timers.swap_remove(rng.pick_index(timers.len())),
                },
                5 if !timers.is_empty() => EventKind::TimerCanceled {
                    timer_id: timers.swap_remove(rng.pick_index(timers.len())),
                },
                _ => EventKind::WorkflowExecutionSignaled {
                    signal_name: format!("signal-{tag}"),
                    input: None,
                },
            };
            kinds.push(kind);
        }

        let task = self.engine.append_events(workflow, version, kinds, timestamp)?;
        Ok(LocalWrite::Written(task))
    }

    /// Apply a task sent by `from`, parking it if its prefix is missing.
    ///
    /// # Errors
    ///
    /// Returns engine errors other than missing events.
    pub fn receive(
        &mut self,
        from: ClusterId,
        task: ReplicationTask,
    ) -> ndc_core::error::Result<Delivery> {
        match self.apply(&task) {
            Err(HistoryError::MissingEvents { next_event_id, .. }) => {
                debug!(
                    cluster = self.id,
                    from,
                    next_event_id,
                    first_event_id = task.first_event_id,
                    "task deferred"
                );
                self.deferred.push(DeferredTask {
                    from,
                    task,
                    attempts: 0,
                });
                Ok(Delivery::Deferred)
            }
            other => other,
        }
    }

    /// Apply a task, without deferral.
    ///
    /// # Errors
    ///
    /// Returns engine errors unchanged.
    pub fn apply(&self, task: &ReplicationTask) -> ndc_core::error::Result<Delivery> {
        let result = self.engine.apply_replication_task(task)?;
        Ok(match (result.outcome, result.rebuilt) {
            (ApplyOutcome::Applied, true) => Delivery::Rebuilt,
            (ApplyOutcome::Applied, false) => Delivery::Applied,
            (ApplyOutcome::Backfilled, _) => Delivery::Backfilled,
            (ApplyOutcome::Duplicate, _) => Delivery::Duplicate,
        })
    }

    /// Retry parked tasks until none makes progress.
    ///
    /// Returns the outcome of every task that left the queue.
    ///
    /// # Errors
    ///
    /// Returns engine errors other than missing events.
    pub fn retry_deferred(&mut self) -> ndc_core::error::Result<Vec<(ClusterId, Delivery)>> {
        let mut settled = Vec::new();
        loop {
            let mut progressed = false;
            for mut parked in std::mem::take(&mut self.deferred) {
                match self.apply(&parked.task) {
                    Ok(delivery) => {
                        settled.push((parked.from, delivery));
                        progressed = true;
                    }
                    Err(HistoryError::MissingEvents { .. }) => {
                        parked.attempts += 1;
                        self.deferred.push(parked);
                    }
                    Err(err) => return Err(err),
                }
            }
            if !progressed {
                return Ok(settled);
            }
        }
    }

    /// Parked tasks retried at least `attempts` times, with their senders.
    #[must_use]
    pub fn stalled(&self, attempts: u32) -> Vec<(ClusterId, ReplicationTask)> {
        self.deferred
            .iter()
            .filter(|parked| parked.attempts >= attempts)
            .map(|parked| (parked.from, parked.task.clone()))
            .collect()
    }

    /// Snapshot of `workflow` as seen here.
    ///
    /// # Errors
    ///
    /// Returns engine errors other than an unknown execution.
    pub fn snapshot(&self, workflow: &WorkflowIdentifier) -> ndc_core::error::Result<ClusterSnapshot> {
        let state = match self.engine.mutable_state(workflow) {
            Ok(state) => state,
            Err(HistoryError::ExecutionNotFound(_)) => {
                return Ok(ClusterSnapshot {
                    cluster: self.id,
                    current_items: Vec::new(),
                    branch_count: 0,
                    current_is_highest: false,
                    execution_info: None,
                    pending_activities: Vec::new(),
                    pending_timers: Vec::new(),
                    next_event_id: 0,
                    last_write_version: 0,
                    events: Vec::new(),
                    deferred: self.deferred.len(),
                });
            }
            Err(err) => return Err(err),
        };
        let histories = state.version_histories();
        Ok(ClusterSnapshot {
            cluster: self.id,
            current_items: histories.current_version_history()?.items().to_vec(),
            branch_count: histories.len(),
            current_is_highest: histories.is_rebuilt()?,
            execution_info: Some(state.execution_info().clone()),
            pending_activities: state.pending_activities().values().cloned().collect(),
            pending_timers: state.pending_timers().values().cloned().collect(),
            next_event_id: state.next_event_id(),
            last_write_version: state.last_write_version(),
            events: self.engine.current_branch_events(workflow)?,
            deferred: self.deferred.len(),
        })
    }
}

/// Rebuild the events before `task` from `source`'s history, one task per event.
///
/// Single-event tasks keep every resent task either wholly new or wholly
/// duplicate on the receiver.
///
/// # Errors
///
/// Returns raw history, decode and task validation errors.
pub fn resend_tasks(
    source: &HistoryEngine,
    task: &ReplicationTask,
    page_size: usize,
) -> ndc_core::error::Result<Vec<ReplicationTask>> {
    let end = VersionHistoryItem::new(task.first_event_id, task.version);
    let mut request = RawHistoryRequest::new(task.workflow.clone(), page_size).with_end(end);
    let mut tasks = Vec::new();
    loop {
        let response = source.raw_history(&request)?;
        for blob in &response.blobs {
            for event in decode_batch(blob)? {
                if event.event_id >= task.first_event_id {
                    continue;
                }
                let item = VersionHistoryItem::new(event.event_id, event.version);
                let history = response.version_history.duplicate_until_lca_item(&item)?;
                tasks.push(ReplicationTask::new(
                    task.workflow.clone(),
                    history,
                    vec![event],
                )?);
            }
        }
        if response.next_page_token.is_empty() {
            return Ok(tasks);
        }
        request.next_page_token = response.next_page_token;
    }
}
