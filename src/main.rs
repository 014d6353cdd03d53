// src/main.rs
use clap::Parser;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use xmr_core_rs::cli::{self, Action};
use xmr_core_rs::config;
use xmr_core_rs::coordinator::Coordinator;
use xmr_core_rs::miner::algorithm::randomx::RandomXFactory;
use xmr_core_rs::miner::{
    BackendConfig, HasherFactory, Job, ResultQueue, SequencerRegistry, WorkerPool,
};
use xmr_core_rs::stats::{ShareStats, StatsReporter};
use xmr_core_rs::types::AlgorithmType;
use xmr_core_rs::utils::{self, MinerError};

/// Difficulty of the synthetic benchmark job
const BENCH_DIFFICULTY: u64 = 1_000_000;

/// Main entry point
///
/// # Returns
/// - `Ok(())` on successful execution
/// - `Err(MinerError)` if any operation fails
fn main() -> Result<(), MinerError> {
    let cli = cli::Commands::parse();

    match cli.action {
        Action::Start(opts) => start_mining(opts),
        Action::Benchmark(opts) => run_benchmark(opts),
        Action::Config(opts) => generate_config(opts),
    }
}

/// Starts the coordinator and mines until Ctrl-C
///
/// # Operations
/// 1. Initializes logging
/// 2. Loads configuration and applies CLI overrides
/// 3. Starts workers (self-test) and the network thread
/// 4. Waits for Ctrl-C, then stops everything
fn start_mining(opts: cli::StartOptions) -> Result<(), MinerError> {
    utils::init_logging();

    let mut config = config::load(&opts.config)?;
    if let Some(threads) = opts.threads {
        config.cpu.threads = threads;
    }
    if let Some(level) = opts.donate_level {
        config.donate.level = level;
    }
    config.randomx.fast |= opts.fast;
    config.validate()?;

    let factory = Arc::new(RandomXFactory::new(config.randomx.fast));
    let backends = vec![BackendConfig::new(factory, config.cpu_threads())];
    log::info!(
        "{} pool(s), {} CPU thread(s), donate level {}%",
        config.pools.iter().filter(|pool| pool.enabled).count(),
        config.cpu_threads(),
        config.donate.level
    );

    let mut coordinator = Coordinator::new(config.coordinator_settings(), backends);
    coordinator.start(&config.pools, &config.donation())?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(tokio::signal::ctrl_c())?;

    log::info!("shutting down");
    coordinator.stop();
    let shares = coordinator.shares();
    log::info!(
        "accepted {} rejected {} invalid {}",
        shares.accepted,
        shares.rejected,
        shares.invalid
    );
    Ok(())
}

/// Runs the worker pool against a synthetic job without any network
///
/// # Operations
/// 1. Initializes benchmark-specific logging
/// 2. Installs a fixed job and starts the workers
/// 3. Feeds the hashrate windows once per second
/// 4. Reports the final hashrate and the shares found
fn run_benchmark(opts: cli::BenchmarkOptions) -> Result<(), MinerError> {
    utils::init_bench_logging();

    let factory = Arc::new(RandomXFactory::new(opts.fast));
    if !factory.supports(opts.algorithm) {
        return Err(MinerError::AlgorithmError(format!(
            "no kernel for {}",
            opts.algorithm
        )));
    }

    let job = benchmark_job(opts.algorithm)?;
    let registry = Arc::new(SequencerRegistry::new());
    let queue = ResultQueue::new(None, Arc::new(ShareStats::default()));
    let pool = WorkerPool::new(registry.clone(), queue.sink(), 1024);

    let found = Arc::new(AtomicU64::new(0));
    let counter = found.clone();
    let mut consumer = queue.spawn(move |_| {
        counter.fetch_add(1, Ordering::Relaxed);
    })?;

    log::info!(
        "Starting {} benchmark for {} seconds on {} thread(s)",
        opts.algorithm,
        opts.duration,
        opts.threads
    );
    pool.job_early_notification(&job);
    registry.install_job(job);
    pool.start(&[BackendConfig::new(factory, opts.threads)])?;

    let mut reporter = StatsReporter::new(Duration::from_secs(5));
    let started = Instant::now();
    let deadline = started + Duration::from_secs(opts.duration);
    while Instant::now() < deadline {
        std::thread::sleep(Duration::from_secs(1));
        let now = Instant::now();
        pool.tick(now);
        let hashrate = pool.hashrate();
        if reporter.maybe_report(now, &hashrate, Default::default()).is_some() {
            for (id, rates) in hashrate.workers.iter().enumerate() {
                log::debug!("thread {}: {:.1} H/s", id, rates[0].unwrap_or(0.0));
            }
        }
    }

    pool.stop();
    consumer.stop();

    let elapsed = started.elapsed().as_secs_f64();
    let total = pool.total_hashes();
    log::info!("Benchmark results:");
    log::info!("Total hashes: {}", total);
    log::info!("Average hashrate: {:.2} H/s", total as f64 / elapsed);
    log::info!("{}", pool.hashrate());
    log::info!(
        "Shares at difficulty {}: {}",
        BENCH_DIFFICULTY,
        found.load(Ordering::Relaxed)
    );
    log::logger().flush();

    Ok(())
}

/// Builds the fixed job the benchmark hashes
fn benchmark_job(algorithm: AlgorithmType) -> Result<Job, MinerError> {
    let blob = vec![0u8; 76];
    Job::new(
        "benchmark",
        algorithm,
        blob,
        u64::MAX / BENCH_DIFFICULTY,
        "benchmark",
    )?
    .with_seed(vec![0u8; 32])
}

/// Generates configuration template file
///
/// # Arguments
/// * `opts` - Configuration generation options
fn generate_config(opts: cli::ConfigOptions) -> Result<(), MinerError> {
    let config = config::generate_template(opts.donate);
    std::fs::write(&opts.output, config)?;
    println!("configuration template written to {}", opts.output.display());
    Ok(())
}
