// src/cli/commands.rs
use crate::types::AlgorithmType;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// xmr_core-rs CLI - mining orchestration core for RandomX pools
#[derive(Parser, Debug)]
#[command(name = "xmr_core-rs")]
#[command(version, about, long_about = None)]
pub struct Commands {
    /// The action to perform (start mining, run benchmarks, or generate config)
    #[command(subcommand)]
    pub action: Action,
}

/// Top-level commands for the miner application
#[derive(Subcommand, Debug)]
pub enum Action {
    /// Connect to the configured pools and mine until Ctrl-C
    Start(StartOptions),

    /// Measure hashrate offline against a synthetic job
    Benchmark(BenchmarkOptions),

    /// Generate configuration file template
    Config(ConfigOptions),
}

/// Options for starting the mining operation
#[derive(Parser, Debug)]
pub struct StartOptions {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Number of worker threads to use (overrides config)
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Donation level in percent (overrides config)
    #[arg(short, long)]
    pub donate_level: Option<u8>,

    /// Build the full RandomX dataset (overrides config)
    #[arg(long)]
    pub fast: bool,
}

/// Options for running mining benchmarks
#[derive(Parser, Debug)]
pub struct BenchmarkOptions {
    /// Algorithm to benchmark
    #[arg(short, long, default_value = "rx/0")]
    pub algorithm: AlgorithmType,

    /// Duration of benchmark in seconds
    #[arg(short, long, default_value_t = 60)]
    pub duration: u64,

    /// Number of threads to use
    #[arg(short, long, default_value_t = num_cpus::get())]
    pub threads: usize,

    /// Build the full RandomX dataset
    #[arg(long)]
    pub fast: bool,
}

/// Options for generating configuration files
#[derive(Parser, Debug)]
pub struct ConfigOptions {
    /// Output file path
    #[arg(short, long, default_value = "config.toml")]
    pub output: PathBuf,

    /// Include the commented donation section
    #[arg(short, long)]
    pub donate: bool,
}
