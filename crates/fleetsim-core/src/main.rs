//! fleetsim CLI: simulate LLM inference fleets without GPUs.

use clap::{Parser, Subcommand};
use fleetsim_core::config::SimConfig;
use fleetsim_core::{metrics, scheduler, workload};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "fleetsim",
    about = "Discrete-event simulator for LLM inference fleets",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation with the configured policies.
    Run {
        /// Path to TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
        /// JSONL request stream. Overrides `[workload]`.
        #[arg(short, long)]
        workload: Option<PathBuf>,
        /// Write the deterministic JSON report to this file.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run the same workload under several routing policies.
    Compare {
        /// Path to TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
        /// JSONL request stream. Overrides `[workload]`.
        #[arg(short, long)]
        workload: Option<PathBuf>,
        /// Comma-separated routing policy names. Defaults to all.
        #[arg(short, long, value_delimiter = ',')]
        policies: Vec<String>,
        /// Write the JSON reports to this file.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List every available policy and scorer.
    ListPolicies,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            workload: workload_path,
            output,
        } => {
            let sim_config = load_config(&config);
            let requests = load_requests(&sim_config, workload_path.as_deref());

            let started = Instant::now();
            let report = fleetsim_core::run_simulation(sim_config, requests).unwrap_or_else(|e| {
                eprintln!("Simulation failed: {}", e);
                std::process::exit(1);
            });
            eprintln!(
                "Wall clock: {} ms ({} events)",
                started.elapsed().as_millis(),
                report.diagnostics.events_processed
            );
            println!("{}", metrics::format_table(&report.metrics));

            if let Some(output_path) = output {
                let json = report.to_json().unwrap_or_else(|e| {
                    eprintln!("Error serializing report: {}", e);
                    std::process::exit(1);
                });
                write_output(&output_path, &json);
            }
        }
        Commands::Compare {
            config,
            workload: workload_path,
            policies,
            output,
        } => {
            let sim_config = load_config(&config);
            let requests = load_requests(&sim_config, workload_path.as_deref());
            let names: Vec<&str> = if policies.is_empty() {
                fleetsim_algorithms::available_algorithms()
            } else {
                policies.iter().map(|s| s.as_str()).collect()
            };

            let started = Instant::now();
            let reports = fleetsim_core::compare_policies(&sim_config, &requests, &names)
                .unwrap_or_else(|e| {
                    eprintln!("Comparison failed: {}", e);
                    std::process::exit(1);
                });
            eprintln!("Wall clock: {} ms", started.elapsed().as_millis());

            let results: Vec<_> = reports.iter().map(|r| r.metrics.clone()).collect();
            println!("{}", metrics::format_comparison_table(&results));
            for result in &results {
                println!("{}", metrics::format_table(result));
            }

            if let Some(output_path) = output {
                let json = serde_json::to_string_pretty(&reports).unwrap_or_else(|e| {
                    eprintln!("Error serializing reports: {}", e);
                    std::process::exit(1);
                });
                write_output(&output_path, &json);
            }
        }
        Commands::ListPolicies => {
            print_list("Routing policies", &fleetsim_algorithms::available_algorithms());
            print_list(
                "Admission policies",
                &fleetsim_algorithms::available_admission_policies(),
            );
            print_list("Scorers", &fleetsim_algorithms::available_scorers());
            print_list("Instance schedulers", &scheduler::available_schedulers());
            print_list("Priority policies", &scheduler::available_priority_policies());
        }
    }
}

fn print_list(title: &str, names: &[&str]) {
    println!("{}:", title);
    for name in names {
        println!("  - {}", name);
    }
}

fn load_config(path: &Path) -> SimConfig {
    SimConfig::from_file(path).unwrap_or_else(|e| {
        eprintln!("Error loading config: {}", e);
        std::process::exit(1);
    })
}

fn load_requests(config: &SimConfig, path: Option<&Path>) -> Vec<fleetsim_core::Request> {
    workload::from_config(config, path).unwrap_or_else(|e| {
        eprintln!("Error loading workload: {}", e);
        std::process::exit(1);
    })
}

fn write_output(path: &Path, json: &str) {
    std::fs::write(path, json).unwrap_or_else(|e| {
        eprintln!("Error writing output: {}", e);
        std::process::exit(1);
    });
    println!("Results written to {}", path.display());
}
