//! Deterministic simulation of N clusters replicating one workflow execution.
//!
//! Each cluster runs its own [`HistoryEngine`](ndc_core::HistoryEngine) with
//! private stores. Every round, clusters write local events at their failover
//! version and ship the resulting replication tasks over a FIFO network with
//! delay and partitions. Concurrent writes fork the history; the conflict
//! resolver has to bring every cluster onto the same winning branch.
//!
//! After the last round the network is healed and drained, then the
//! [`oracle`] checks convergence.
//!
//! # Conventions
//!
//! - **Errors**: `anyhow::Result` at this level; engine errors pass through.
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `debug!`).

pub mod campaign;
pub mod cluster;
pub mod network;
pub mod oracle;
pub mod rng;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, TimeZone, Utc};
use ndc_core::config::Config;
use ndc_core::{ReplicationTask, WorkflowIdentifier};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::{
    ClusterSnapshot, Delivery, LocalWrite, SimulatedCluster, failover_version, resend_tasks,
};
use crate::network::{ClusterId, FaultConfig, SimulatedNetwork};
use crate::oracle::{ConvergenceOracle, InvariantViolation, OracleResult};
use crate::rng::DeterministicRng;

/// Simulated wall clock origin; round `n` happens `n` seconds later.
const EPOCH_SECS: i64 = 1_700_000_000;

/// Parameters of one simulation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub cluster_count: usize,
    pub rounds: u64,
    /// Chance per round that a cluster writes.
    pub write_rate_percent: u8,
    pub max_events_per_write: u8,
    /// Failover version step per round; must exceed `cluster_count`.
    pub failover_version_increment: i64,
    /// Retry passes before a parked task's prefix is fetched from its sender.
    pub resend_after_attempts: u32,
    /// Page size for rebuild replays and resend reads.
    pub history_page_size: usize,
    pub fault: FaultConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            cluster_count: 3,
            rounds: 24,
            write_rate_percent: 40,
            max_events_per_write: 3,
            failover_version_increment: 10,
            resend_after_attempts: 2,
            history_page_size: 4,
            fault: FaultConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// # Errors
    ///
    /// Returns an error naming the first out-of-range parameter.
    pub fn validate(&self) -> Result<()> {
        if self.cluster_count == 0 {
            bail!("cluster_count must be > 0");
        }
        if self.rounds == 0 {
            bail!("rounds must be > 0");
        }
        if self.max_events_per_write == 0 {
            bail!("max_events_per_write must be > 0");
        }
        if self.history_page_size == 0 {
            bail!("history_page_size must be > 0");
        }
        let clusters = i64::try_from(self.cluster_count).context("cluster_count too large")?;
        if self.failover_version_increment <= clusters {
            bail!(
                "failover_version_increment ({}) must exceed cluster_count ({clusters})",
                self.failover_version_increment
            );
        }
        Ok(())
    }
}

/// Counters over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationStats {
    pub writes: u64,
    pub stale_writes: u64,
    pub delivered: u64,
    pub applied: u64,
    pub rebuilds: u64,
    pub backfills: u64,
    pub duplicates: u64,
    pub deferrals: u64,
    pub resends: u64,
    pub partitions: u64,
}

impl SimulationStats {
    fn record(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Applied => self.applied += 1,
            Delivery::Rebuilt => {
                self.applied += 1;
                self.rebuilds += 1;
            }
            Delivery::Backfilled => self.backfills += 1,
            Delivery::Duplicate => self.duplicates += 1,
            Delivery::Deferred => self.deferrals += 1,
        }
    }
}

/// What happened in one step of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEventKind {
    Start {
        cluster: ClusterId,
        version: i64,
    },
    Write {
        cluster: ClusterId,
        version: i64,
        first_event_id: i64,
        next_event_id: i64,
    },
    StaleWrite {
        cluster: ClusterId,
        version: i64,
        last_write_version: i64,
    },
    Send {
        from: ClusterId,
        to: ClusterId,
        seq: u64,
    },
    Deliver {
        from: ClusterId,
        to: ClusterId,
        seq: u64,
        first_event_id: i64,
        version: i64,
        delivery: Delivery,
    },
    Retry {
        cluster: ClusterId,
        from: ClusterId,
        delivery: Delivery,
    },
    Resend {
        cluster: ClusterId,
        from: ClusterId,
        before_event_id: i64,
        events: usize,
    },
    Reject {
        cluster: ClusterId,
        first_event_id: i64,
        version: i64,
        error: String,
    },
    Partition {
        cluster: ClusterId,
        until_round: u64,
    },
    Heal {
        cluster: ClusterId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub round: u64,
    pub kind: TraceEventKind,
}

/// Everything a run produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimulationResult {
    pub seed: u64,
    pub trace: Vec<TraceEvent>,
    pub stats: SimulationStats,
    pub snapshots: Vec<ClusterSnapshot>,
    pub oracle: OracleResult,
    /// The run exercised both a rebuild onto a new branch and a backfill.
    pub interesting_state_reached: bool,
}

/// Drives one seeded run.
#[derive(Debug)]
pub struct Simulator {
    config: SimulationConfig,
    workflow: WorkflowIdentifier,
    rng: DeterministicRng,
    network: SimulatedNetwork,
    clusters: Vec<SimulatedCluster>,
    tasks: Vec<ReplicationTask>,
    rejections: Vec<InvariantViolation>,
    trace: Vec<TraceEvent>,
    stats: SimulationStats,
}

impl Simulator {
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        let mut engine_config = Config::default();
        engine_config.replication.rebuild_page_size = config.history_page_size;
        let clusters = (0..config.cluster_count)
            .map(|id| SimulatedCluster::new(id, &engine_config))
            .collect();
        Ok(Self {
            workflow: WorkflowIdentifier::new("sim", "workflow", format!("run-{}", config.seed)),
            rng: DeterministicRng::new(config.seed),
            network: SimulatedNetwork::new(config.fault),
            clusters,
            tasks: Vec::new(),
            rejections: Vec::new(),
            trace: Vec::new(),
            stats: SimulationStats::default(),
            config,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Run every round, drain the network and check the invariants.
    ///
    /// # Errors
    ///
    /// Returns internal errors: engine failures outside task application, or
    /// a network that does not drain.
    pub fn run(&mut self) -> Result<SimulationResult> {
        info!(
            seed = self.config.seed,
            clusters = self.config.cluster_count,
            rounds = self.config.rounds,
            "simulation started"
        );
        self.start()?;
        for round in 0..self.config.rounds {
            self.update_partitions(round);
            self.deliver(round)?;
            self.write(round)?;
        }
        self.drain()?;

        let snapshots = self
            .clusters
            .iter()
            .map(|cluster| cluster.snapshot(&self.workflow))
            .collect::<ndc_core::error::Result<Vec<_>>>()?;
        let oracle = OracleResult::from_violations(std::mem::take(&mut self.rejections))
            .merge(ConvergenceOracle::check_all(&snapshots))
            .merge(ConvergenceOracle::check_idempotence(
                &self.clusters,
                &snapshots,
                &self.tasks,
            ));
        if oracle.passed {
            info!(seed = self.config.seed, "simulation converged");
        } else {
            warn!(
                seed = self.config.seed,
                violations = oracle.violations.len(),
                "simulation violated invariants"
            );
        }

        Ok(SimulationResult {
            seed: self.config.seed,
            trace: self.trace.clone(),
            interesting_state_reached: self.stats.rebuilds > 0 && self.stats.backfills > 0,
            stats: self.stats.clone(),
            snapshots,
            oracle,
        })
    }

    fn timestamp(round: u64) -> Result<DateTime<Utc>> {
        let secs = i64::try_from(round)
            .ok()
            .and_then(|round| EPOCH_SECS.checked_add(round))
            .context("round out of range")?;
        Utc.timestamp_opt(secs, 0)
            .single()
            .context("simulated timestamp out of range")
    }

    fn push(&mut self, round: u64, kind: TraceEventKind) {
        self.trace.push(TraceEvent { round, kind });
    }

    fn start(&mut self) -> Result<()> {
        let version = failover_version(0, 0, self.config.failover_version_increment);
        let task = self.clusters[0]
            .start(&self.workflow, version, Self::timestamp(0)?)
            .context("failed to start the simulated workflow")?;
        self.push(0, TraceEventKind::Start {
            cluster: 0,
            version,
        });
        self.broadcast(0, task, 0);
        Ok(())
    }

    fn broadcast(&mut self, from: ClusterId, task: ReplicationTask, round: u64) {
        for to in (0..self.clusters.len()).filter(|&to| to != from) {
            let seq = self
                .network
                .send(from, to, task.clone(), round, &mut self.rng);
            self.push(round, TraceEventKind::Send { from, to, seq });
        }
        self.tasks.push(task);
    }

    fn update_partitions(&mut self, round: u64) {
        for cluster in self.network.heal_expired(round) {
            self.push(round, TraceEventKind::Heal { cluster });
        }
        if let Some((cluster, until_round)) =
            self.network
                .maybe_partition(self.clusters.len(), round, &mut self.rng)
        {
            debug!(cluster, until_round, "cluster partitioned");
            self.stats.partitions += 1;
            self.push(round, TraceEventKind::Partition {
                cluster,
                until_round,
            });
        }
    }

    fn write(&mut self, round: u64) -> Result<()> {
        let timestamp = Self::timestamp(round)?;
        for index in 0..self.clusters.len() {
            if !self.rng.hit_rate_percent(self.config.write_rate_percent) {
                continue;
            }
            let version = failover_version(round, index, self.config.failover_version_increment);
            let write = self.clusters[index]
                .local_write(
                    &self.workflow,
                    version,
                    self.config.max_events_per_write,
                    timestamp,
                    &mut self.rng,
                )
                .with_context(|| format!("local write on cluster {index} failed"))?;
            match write {
                LocalWrite::Written(task) => {
                    self.stats.writes += 1;
                    self.push(round, TraceEventKind::Write {
                        cluster: index,
                        version,
                        first_event_id: task.first_event_id,
                        next_event_id: task.next_event_id,
                    });
                    self.broadcast(index, task, round);
                }
                LocalWrite::Stale { last_write_version } => {
                    self.stats.stale_writes += 1;
                    self.push(round, TraceEventKind::StaleWrite {
                        cluster: index,
                        version,
                        last_write_version,
                    });
                }
                LocalWrite::NoExecution => {}
            }
        }
        Ok(())
    }

    fn deliver(&mut self, round: u64) -> Result<()> {
        for message in self.network.deliver_ready(round, &mut self.rng) {
            self.stats.delivered += 1;
            let (first_event_id, version) = (message.task.first_event_id, message.task.version);
            match self.clusters[message.to].receive(message.from, message.task) {
                Ok(delivery) => {
                    self.stats.record(delivery);
                    self.push(round, TraceEventKind::Deliver {
                        from: message.from,
                        to: message.to,
                        seq: message.seq,
                        first_event_id,
                        version,
                        delivery,
                    });
                }
                Err(err) => self.reject(round, message.to, first_event_id, version, &err),
            }
        }
        for cluster in 0..self.clusters.len() {
            self.settle(cluster, round)?;
        }
        Ok(())
    }

    /// Retry parked tasks, fetching missing prefixes from the sender once
    /// retries alone stop helping.
    fn settle(&mut self, cluster: ClusterId, round: u64) -> Result<()> {
        self.retry(cluster, round)?;
        let stalled = self.clusters[cluster].stalled(self.config.resend_after_attempts);
        if stalled.is_empty() {
            return Ok(());
        }
        for (from, task) in stalled {
            let resent = resend_tasks(
                self.clusters[from].engine(),
                &task,
                self.config.history_page_size,
            )
            .with_context(|| format!("cluster {from} failed to resend history to {cluster}"))?;
            self.stats.resends += 1;
            self.push(round, TraceEventKind::Resend {
                cluster,
                from,
                before_event_id: task.first_event_id,
                events: resent.len(),
            });
            for event_task in &resent {
                if let Err(err) = self.clusters[cluster].apply(event_task) {
                    self.reject(round, cluster, event_task.first_event_id, event_task.version, &err);
                }
            }
        }
        self.retry(cluster, round)
    }

    fn retry(&mut self, cluster: ClusterId, round: u64) -> Result<()> {
        let settled = self.clusters[cluster]
            .retry_deferred()
            .with_context(|| format!("retrying deferred tasks on cluster {cluster}"))?;
        for (from, delivery) in settled {
            self.stats.record(delivery);
            self.push(round, TraceEventKind::Retry {
                cluster,
                from,
                delivery,
            });
        }
        Ok(())
    }

    fn reject(
        &mut self,
        round: u64,
        cluster: ClusterId,
        first_event_id: i64,
        version: i64,
        err: &ndc_core::HistoryError,
    ) {
        warn!(cluster, first_event_id, version, error = %err, "replication task rejected");
        self.push(round, TraceEventKind::Reject {
            cluster,
            first_event_id,
            version,
            error: err.to_string(),
        });
        self.rejections.push(InvariantViolation::TaskRejected {
            cluster,
            first_event_id,
            version,
            error: err.to_string(),
        });
    }

    /// Heal every partition and deliver until the network is empty.
    fn drain(&mut self) -> Result<()> {
        let mut round = self.config.rounds;
        for cluster in self.network.heal_all() {
            self.push(round, TraceEventKind::Heal { cluster });
        }
        let limit = round
            + self.config.rounds
            + u64::from(self.network.fault_config().max_delay_rounds)
            + 2;
        while self.network.pending_len() > 0 {
            if round > limit {
                bail!(
                    "network still holds {} tasks after round {limit}",
                    self.network.pending_len()
                );
            }
            self.deliver(round)?;
            round += 1;
        }
        for cluster in 0..self.clusters.len() {
            self.settle(cluster, round)?;
        }
        Ok(())
    }
}
