//! Cluster supervision CLI.
//!
//! Operates on an agency tree stored as a JSON file: validates it, lists its
//! jobs, and runs supervision cycles against it through the in-memory store,
//! writing the resulting tree back.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;
use supervision::core::invariants::{orphaned_locks, validate_invariants};
use supervision::core::jobs::all_jobs;
use supervision::core::snapshot::Snapshot;
use supervision::exit_codes;
use supervision::io::agency_store::{load_agency, read_agency, write_agency};
use supervision::io::config::{SupervisionConfig, load_config};
use supervision::io::memory_agency::InMemoryAgency;
use supervision::logging;
use supervision::looping::{LoopOptions, LoopStop, run_loop};
use supervision::supervision::{CycleReport, run_cycle};

const DEFAULT_CONFIG: &str = "supervision.toml";

#[derive(Parser)]
#[command(
    name = "supervision",
    version,
    about = "Cluster supervision jobs over an agency tree"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check an agency file against the schema and invariants.
    Check {
        #[arg(long)]
        agency: PathBuf,
    },
    /// List every job as `<status> <jobId> <type>`.
    Jobs {
        #[arg(long)]
        agency: PathBuf,
    },
    /// Run one supervision cycle and write the tree back.
    Cycle {
        #[arg(long)]
        agency: PathBuf,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Seed for server selection (overrides `rng_seed`).
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Run cycles with Current following Plan until quiescent.
    Simulate {
        #[arg(long)]
        agency: PathBuf,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        #[arg(long)]
        seed: Option<u64>,
        /// Upper bound on cycles.
        #[arg(long, default_value_t = 100)]
        cycles: u32,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Check { agency } => cmd_check(&agency),
        Command::Jobs { agency } => cmd_jobs(&agency),
        Command::Cycle {
            agency,
            config,
            seed,
        } => cmd_cycle(&agency, &config, seed),
        Command::Simulate {
            agency,
            config,
            seed,
            cycles,
        } => cmd_simulate(&agency, &config, seed, cycles),
    }
}

fn cmd_check(path: &Path) -> Result<i32> {
    let snapshot = Snapshot::new(read_agency(path)?);
    let errors = validate_invariants(&snapshot);
    for error in &errors {
        println!("error: {error}");
    }
    for lock in orphaned_locks(&snapshot) {
        println!("warning: {lock}");
    }
    if errors.is_empty() {
        Ok(exit_codes::OK)
    } else {
        Ok(exit_codes::INVALID)
    }
}

fn cmd_jobs(path: &Path) -> Result<i32> {
    let snapshot = Snapshot::new(read_agency(path)?);
    for (status, doc) in all_jobs(&snapshot) {
        println!("{status} {} {}", doc.job_id, doc.job_type);
    }
    Ok(exit_codes::OK)
}

fn cmd_cycle(path: &Path, config_path: &Path, seed: Option<u64>) -> Result<i32> {
    let config = load_config(config_path)?;
    let agency = InMemoryAgency::new(load_agency(path)?);
    let mut rng = make_rng(&config, seed);
    let report = run_cycle(&agency, &config, Utc::now(), &mut rng)?;
    print_report(&report);
    write_agency(path, &agency.root()?).context("write agency back")?;
    Ok(exit_codes::OK)
}

fn cmd_simulate(path: &Path, config_path: &Path, seed: Option<u64>, cycles: u32) -> Result<i32> {
    let config = load_config(config_path)?;
    let agency = InMemoryAgency::new(load_agency(path)?);
    let mut rng = make_rng(&config, seed);
    let options = LoopOptions {
        max_cycles: cycles,
        simulate_current: true,
        pause: false,
    };
    let outcome = run_loop(&agency, &config, options, &mut rng, Utc::now, |cycle, report| {
        println!("cycle {cycle}");
        print_report(report);
    })?;
    write_agency(path, &agency.root()?).context("write agency back")?;
    match outcome.stop {
        LoopStop::Quiescent => {
            println!(
                "quiescent after {} cycles, {} jobs created",
                outcome.cycles, outcome.created
            );
            Ok(exit_codes::OK)
        }
        LoopStop::MaxCycles { max_cycles } => {
            println!(
                "stopped after {max_cycles} cycles, {} jobs outstanding",
                outcome.outstanding
            );
            if outcome.outstanding > 0 {
                Ok(exit_codes::OUTSTANDING)
            } else {
                Ok(exit_codes::OK)
            }
        }
    }
}

fn make_rng(config: &SupervisionConfig, seed: Option<u64>) -> StdRng {
    match seed.or(config.rng_seed) {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

fn print_report(report: &CycleReport) {
    for step in &report.steps {
        println!("  {} {} {}", step.job_id, step.job_type, step.outcome);
    }
    for id in &report.created {
        println!("  created {id}");
    }
    if report.cleanups > 0 {
        println!("  cleanups {}", report.cleanups);
    }
}
