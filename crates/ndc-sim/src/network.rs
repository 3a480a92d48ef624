use std::collections::{BTreeMap, VecDeque};

use ndc_core::ReplicationTask;
use serde::{Deserialize, Serialize};

use crate::rng::DeterministicRng;

/// Index of a simulated cluster.
pub type ClusterId = usize;

/// Fault injection for the replication links.
///
/// Links never drop or duplicate tasks: a real replication queue is durable
/// and ordered per source. Faults are delay and partitions, and tasks from
/// different sources interleave arbitrarily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Maximum extra delivery delay in rounds.
    pub max_delay_rounds: u8,
    /// Percentage chance per round to isolate one cluster.
    pub partition_rate_percent: u8,
    /// Rounds an isolated cluster stays isolated.
    pub partition_duration_rounds: u8,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            max_delay_rounds: 2,
            partition_rate_percent: 5,
            partition_duration_rounds: 3,
        }
    }
}

/// A replication task in flight between two clusters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkMessage {
    pub from: ClusterId,
    pub to: ClusterId,
    /// Network-wide send sequence, for traces.
    pub seq: u64,
    pub task: ReplicationTask,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingMessage {
    deliver_at_round: u64,
    message: NetworkMessage,
}

/// Deterministic network of FIFO links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedNetwork {
    links: BTreeMap<(ClusterId, ClusterId), VecDeque<PendingMessage>>,
    /// Isolated cluster -> round it reconnects at.
    partitions: BTreeMap<ClusterId, u64>,
    next_seq: u64,
    fault: FaultConfig,
}

impl SimulatedNetwork {
    #[must_use]
    pub const fn new(fault: FaultConfig) -> Self {
        Self {
            links: BTreeMap::new(),
            partitions: BTreeMap::new(),
            next_seq: 0,
            fault,
        }
    }

    #[must_use]
    pub const fn fault_config(&self) -> FaultConfig {
        self.fault
    }

    #[must_use]
    pub fn is_partitioned(&self, cluster: ClusterId) -> bool {
        self.partitions.contains_key(&cluster)
    }

    /// Number of tasks not yet delivered, held ones included.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.links.values().map(VecDeque::len).sum()
    }

    /// Queue `task` on the `from -> to` link. Returns the assigned send sequence.
    ///
    /// The delivery round never precedes the one of an earlier task on the
    /// same link, so delay cannot reorder a link.
    pub fn send(
        &mut self,
        from: ClusterId,
        to: ClusterId,
        task: ReplicationTask,
        round: u64,
        rng: &mut DeterministicRng,
    ) -> u64 {
        let delay = rng.next_bounded(u64::from(self.fault.max_delay_rounds) + 1);
        let link = self.links.entry((from, to)).or_default();
        let earliest = link.back().map_or(0, |last| last.deliver_at_round);
        let seq = self.next_seq;
        self.next_seq += 1;
        link.push_back(PendingMessage {
            deliver_at_round: round.saturating_add(delay).max(earliest),
            message: NetworkMessage {
                from,
                to,
                seq,
                task,
            },
        });
        seq
    }

    /// Isolate a random cluster with the configured probability.
    ///
    /// Returns the isolated cluster and the round it reconnects at.
    pub fn maybe_partition(
        &mut self,
        cluster_count: usize,
        round: u64,
        rng: &mut DeterministicRng,
    ) -> Option<(ClusterId, u64)> {
        if cluster_count < 2 || !rng.hit_rate_percent(self.fault.partition_rate_percent) {
            return None;
        }
        let cluster = rng.pick_index(cluster_count);
        if self.is_partitioned(cluster) {
            return None;
        }
        let until = round + u64::from(self.fault.partition_duration_rounds.max(1));
        self.partitions.insert(cluster, until);
        Some((cluster, until))
    }

    /// Reconnect clusters whose isolation has ended by `round`.
    pub fn heal_expired(&mut self, round: u64) -> Vec<ClusterId> {
        let healed: Vec<_> = self
            .partitions
            .iter()
            .filter(|&(_, &until)| until <= round)
            .map(|(&cluster, _)| cluster)
            .collect();
        for cluster in &healed {
            self.partitions.remove(cluster);
        }
        healed
    }

    /// Reconnect every cluster.
    pub fn heal_all(&mut self) -> Vec<ClusterId> {
        let healed = self.partitions.keys().copied().collect();
        self.partitions.clear();
        healed
    }

    /// Deliver every task due by `round` on links between connected clusters.
    ///
    /// Each link keeps its order; links are interleaved at random.
    pub fn deliver_ready(&mut self, round: u64, rng: &mut DeterministicRng) -> Vec<NetworkMessage> {
        let mut ready: Vec<VecDeque<NetworkMessage>> = Vec::new();
        for (&(from, to), link) in &mut self.links {
            if self.partitions.contains_key(&from) || self.partitions.contains_key(&to) {
                continue;
            }
            let mut due = VecDeque::new();
            while link.front().is_some_and(|next| next.deliver_at_round <= round) {
                if let Some(pending) = link.pop_front() {
                    due.push_back(pending.message);
                }
            }
            if !due.is_empty() {
                ready.push(due);
            }
        }
        self.links.retain(|_, link| !link.is_empty());

        let mut delivered = Vec::new();
        while !ready.is_empty() {
            let index = rng.pick_index(ready.len());
            if let Some(message) = ready[index].pop_front() {
                delivered.push(message);
            }
            if ready[index].is_empty() {
                ready.swap_remove(index);
            }
        }
        delivered
    }
}
