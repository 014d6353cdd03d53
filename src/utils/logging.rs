// src/utils/logging.rs
//! Logging configuration and utilities
//!
//! This module handles logging setup for the miner, including:
//! - Standard logging configuration
//! - Benchmark-specific logging
//! - Custom log formatting with the emitting thread's name
//!
//! Uses `env_logger` under the hood. Both initializers are idempotent so the
//! library can be embedded in hosts that already installed a logger.

use env_logger::{Builder, Target};
use log::LevelFilter;
use std::env;

/// Initializes the logging subsystem
///
/// # Configuration
/// - Logs to stdout
/// - Default log level: Info
/// - `RUST_LOG` overrides the default filter when set
pub fn init_logging() {
    init_with_default(LevelFilter::Info);
}

/// Configures benchmark-specific logging
///
/// Same format as [`init_logging`], but defaults to Debug so per-thread
/// hashrate lines are visible.
pub fn init_bench_logging() {
    init_with_default(LevelFilter::Debug);
}

fn init_with_default(level: LevelFilter) {
    let mut builder = common_log_config();

    if env::var("RUST_LOG").is_err() {
        builder.filter_level(level);
    } else {
        builder.parse_env("RUST_LOG");
    }

    // A logger may already be installed by the embedding application.
    let _ = builder.try_init();
}

/// Creates a base logger builder with the common format
///
/// `[timestamp level thread module:line] message`
fn common_log_config() -> Builder {
    let mut builder = Builder::new();

    builder
        .format(|buf, record| {
            use std::io::Write;
            let ts = buf.timestamp_millis();
            let thread = std::thread::current();
            let thread = thread.name().unwrap_or("-").to_string();
            let module = record.module_path().unwrap_or_default();
            let line = record.line().unwrap_or(0);

            writeln!(
                buf,
                "[{} {} {} {}:{}] {}",
                ts,
                record.level(),
                thread,
                module,
                line,
                record.args()
            )
        })
        .target(Target::Stdout);

    builder
}
