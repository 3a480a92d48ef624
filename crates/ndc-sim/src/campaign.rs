//! Campaign runner for deterministic simulation campaigns.
//!
//! Executes many seeds with the same parameters, collecting pass/fail
//! results and the first failing seed for replay.

use std::ops::Range;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::network::FaultConfig;
use crate::oracle::InvariantViolation;
use crate::{SimulationConfig, SimulationResult, Simulator};

/// Campaign-level configuration: which seeds to run and the simulation
/// parameters shared by all of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Range of seeds to execute, e.g., `0..100`.
    pub seed_range: Range<u64>,
    pub cluster_count: usize,
    pub rounds: u64,
    /// Chance per round that a cluster writes (percent, 0–100).
    pub write_rate_percent: u8,
    pub max_events_per_write: u8,
    /// Maximum delivery delay in rounds.
    pub fault_max_delay: u8,
    /// Chance per round to isolate a cluster (percent, 0–100).
    pub fault_partition_percent: u8,
    /// Rounds an isolated cluster stays isolated.
    pub fault_partition_duration: u8,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            seed_range: 0..100,
            cluster_count: 3,
            rounds: 24,
            write_rate_percent: 40,
            max_events_per_write: 3,
            fault_max_delay: 3,
            fault_partition_percent: 10,
            fault_partition_duration: 3,
        }
    }
}

impl CampaignConfig {
    /// Build a [`SimulationConfig`] for a specific seed.
    #[must_use]
    pub fn sim_config_for_seed(&self, seed: u64) -> SimulationConfig {
        let defaults = SimulationConfig::default();
        let clusters = i64::try_from(self.cluster_count).unwrap_or(i64::MAX);
        SimulationConfig {
            seed,
            cluster_count: self.cluster_count,
            rounds: self.rounds,
            write_rate_percent: self.write_rate_percent,
            max_events_per_write: self.max_events_per_write,
            // Next power of ten above the cluster count keeps versions readable.
            failover_version_increment: (1..)
                .map(|exp| 10_i64.saturating_pow(exp))
                .find(|step| *step > clusters)
                .unwrap_or(defaults.failover_version_increment),
            fault: FaultConfig {
                max_delay_rounds: self.fault_max_delay,
                partition_rate_percent: self.fault_partition_percent,
                partition_duration_rounds: self.fault_partition_duration,
            },
            ..defaults
        }
    }

    /// Validate configuration before running.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        self.sim_config_for_seed(self.seed_range.start).validate()
    }
}

/// Failure details for a single seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub violations: Vec<String>,
}

/// Aggregate report produced by a campaign run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// First seed that failed (for prioritized replay).
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    /// Seeds whose run included both a rebuild and a backfill.
    pub interesting_states_reached: usize,
}

impl CampaignReport {
    /// True if every seed passed.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run a full campaign across all seeds in the config.
///
/// # Errors
///
/// Returns an error if config validation fails or a simulation encounters
/// an internal error.
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        interesting_states_reached: 0,
    };

    for seed in config.seed_range.clone() {
        report.seeds_run += 1;
        let result = replay_seed(seed, config)?;
        if result.interesting_state_reached {
            report.interesting_states_reached += 1;
        }
        if result.oracle.passed {
            report.seeds_passed += 1;
            continue;
        }
        report.first_failure.get_or_insert(seed);
        report.failures.push(SeedFailure {
            seed,
            violations: result.oracle.violations.iter().map(format_violation).collect(),
        });
    }

    Ok(report)
}

/// Run a single seed and return Ok(()) on pass, Err(violations) on failure.
///
/// # Errors
///
/// Returns an `anyhow::Error` if the simulation itself encounters an internal
/// error (invalid config, etc). The inner `Result` distinguishes pass from
/// invariant violations.
pub fn run_single_seed(
    seed: u64,
    config: &CampaignConfig,
) -> Result<std::result::Result<(), Vec<InvariantViolation>>> {
    let result = replay_seed(seed, config)?;
    if result.oracle.passed {
        Ok(Ok(()))
    } else {
        Ok(Err(result.oracle.violations))
    }
}

/// Replay a single seed with its full trace, for debugging.
///
/// # Errors
///
/// Returns an error when config validation or simulation fails.
pub fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<SimulationResult> {
    let mut simulator = Simulator::new(config.sim_config_for_seed(seed))?;
    simulator.run()
}

fn format_violation(violation: &InvariantViolation) -> String {
    violation.to_string()
}
