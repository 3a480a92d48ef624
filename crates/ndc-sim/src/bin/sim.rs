#![forbid(unsafe_code)]

use std::env;
use std::ops::Range;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use ndc_sim::campaign::{CampaignConfig, run_campaign};
use ndc_sim::{SimulationConfig, Simulator};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "ndc-sim: deterministic multi-cluster replication simulator",
    long_about = None
)]
struct Cli {
    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct ShapeArgs {
    /// Number of simulated clusters.
    #[arg(long, default_value_t = 3)]
    clusters: usize,

    /// Rounds of local writes before the final drain.
    #[arg(long, default_value_t = 24)]
    rounds: u64,

    /// Chance per round that a cluster writes (percent).
    #[arg(long, default_value_t = 40)]
    write_rate: u8,

    /// Maximum delivery delay in rounds.
    #[arg(long, default_value_t = 3)]
    max_delay: u8,

    /// Chance per round to isolate a cluster (percent).
    #[arg(long, default_value_t = 10)]
    partition_rate: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Run one seed",
        after_help = "EXAMPLES:\n    # Replay seed 42 with four clusters\n    ndc-sim run --seed 42 --clusters 4\n\n    # Dump the full trace\n    ndc-sim run --seed 42 --json"
    )]
    Run {
        #[arg(long, default_value_t = 0)]
        seed: u64,

        #[command(flatten)]
        shape: ShapeArgs,
    },

    #[command(
        about = "Run a range of seeds",
        after_help = "EXAMPLES:\n    # Seeds 0..500\n    ndc-sim campaign --seeds 0..500"
    )]
    Campaign {
        /// Seed range as `start..end`.
        #[arg(long, default_value = "0..100", value_parser = parse_seed_range)]
        seeds: Range<u64>,

        #[command(flatten)]
        shape: ShapeArgs,
    },
}

fn parse_seed_range(raw: &str) -> Result<Range<u64>> {
    let (start, end) = raw
        .split_once("..")
        .with_context(|| format!("expected start..end, got '{raw}'"))?;
    let start = start.trim().parse().context("invalid range start")?;
    let end = end.trim().parse().context("invalid range end")?;
    Ok(start..end)
}

fn campaign_config(seed_range: Range<u64>, shape: &ShapeArgs) -> CampaignConfig {
    CampaignConfig {
        seed_range,
        cluster_count: shape.clusters,
        rounds: shape.rounds,
        write_rate_percent: shape.write_rate,
        fault_max_delay: shape.max_delay,
        fault_partition_percent: shape.partition_rate,
        ..CampaignConfig::default()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("NDC_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "ndc=debug,info"
        } else {
            "ndc=info,warn"
        })
    });

    let format = env::var("NDC_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { seed, shape } => {
            let config: SimulationConfig =
                campaign_config(seed..seed.saturating_add(1), &shape).sim_config_for_seed(seed);
            let result = Simulator::new(config)?.run()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!(
                    "seed {}: trace_events={} writes={} rebuilds={} backfills={} resends={} converged={}",
                    result.seed,
                    result.trace.len(),
                    result.stats.writes,
                    result.stats.rebuilds,
                    result.stats.backfills,
                    result.stats.resends,
                    result.oracle.passed
                );
                for violation in &result.oracle.violations {
                    println!("  {violation}");
                }
            }
            if !result.oracle.passed {
                bail!("seed {seed} violated {} invariants", result.oracle.violations.len());
            }
        }
        Commands::Campaign { seeds, shape } => {
            let config = campaign_config(seeds, &shape);
            info!(seeds = ?config.seed_range, clusters = config.cluster_count, "campaign started");
            let report = run_campaign(&config)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "campaign: {}/{} seeds passed, {} reached rebuild+backfill",
                    report.seeds_passed, report.seeds_run, report.interesting_states_reached
                );
                if let Some(seed) = report.first_failure {
                    println!("first failure: seed {seed} (replay with `ndc-sim run --seed {seed}`)");
                }
            }
            if !report.all_passed() {
                bail!("{} seeds failed", report.failures.len());
            }
        }
    }

    Ok(())
}
