#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use weave_sim::campaign::{CampaignConfig, replay_seed, run_campaign};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "weave-sim: deterministic convergence campaigns for weave replicas",
    long_about = None
)]
struct Cli {
    /// Campaign config file (TOML). Missing files fall back to defaults.
    #[arg(long, global = true, default_value = "weave-sim.toml")]
    config: PathBuf,

    /// Emit JSON instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a range of seeds and report failures.
    Run {
        #[arg(long)]
        first_seed: Option<u64>,
        #[arg(long)]
        seeds: Option<u64>,
        #[arg(long)]
        agents: Option<usize>,
        #[arg(long)]
        rounds: Option<u64>,
    },
    /// Re-run one seed and print its trace.
    Replay {
        #[arg(long)]
        seed: u64,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("WEAVE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("weave_sim=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = CampaignConfig::load(&cli.config)?;

    match cli.command {
        Commands::Run {
            first_seed,
            seeds,
            agents,
            rounds,
        } => {
            if let Some(first_seed) = first_seed {
                config.first_seed = first_seed;
            }
            if let Some(seeds) = seeds {
                config.seeds = seeds;
            }
            if let Some(agents) = agents {
                config.agent_count = agents;
            }
            if let Some(rounds) = rounds {
                config.rounds = rounds;
            }

            let report = run_campaign(&config)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "seeds={} passed={} interesting={}",
                    report.seeds_run, report.seeds_passed, report.interesting_states_reached
                );
                for failure in &report.failures {
                    println!("seed {} failed:", failure.seed);
                    for violation in &failure.violations {
                        println!("  {violation}");
                    }
                }
                if let Some(seed) = report.first_failure {
                    println!("replay with: weave-sim replay --seed {seed}");
                }
            }
            Ok(if report.all_passed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Replay { seed } => {
            let result = replay_seed(seed, &config)?;
            if cli.json {
                let out = serde_json::json!({
                    "seed": seed,
                    "trace": result.trace,
                    "states": result.states,
                    "violations": result.oracle.violations,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                for event in &result.trace {
                    println!("{:>4} {}", event.round, serde_json::to_string(&event.kind)?);
                }
                for violation in &result.oracle.violations {
                    println!("violation: {violation}");
                }
                println!(
                    "seed={seed} events={} violations={}",
                    result.trace.len(),
                    result.oracle.violations.len()
                );
            }
            Ok(if result.oracle.passed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
