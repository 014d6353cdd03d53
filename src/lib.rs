//! xmr_core-rs - mining orchestration core in Rust
//!
//! This crate provides the machinery between mining pools and hash kernels:
//! - Pool protocol clients with failover, keep-alive and reconnect backoff
//! - Time-boxed donation switching
//! - Lock-free job distribution to CPU worker threads
//! - Result verification, submission and share accounting
//! - Hashrate windows and hardware monitoring
//!
//! Hash kernels plug in through [`miner::HasherFactory`]; RandomX ships
//! as the built-in adapter.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

/// Miner core: kernels, jobs, workers and the result pipeline
pub mod miner;

/// Pool clients, endpoint strategies and the IO driver
pub mod network;

/// Statistics collection and reporting functionality
pub mod stats;

/// Utility functions and error handling
pub mod utils;

/// Command-line interface definitions
pub mod cli;

/// Configuration management
pub mod config;

/// Top-level controller wiring workers to the network
pub mod coordinator;

/// Shared type definitions
pub mod types;

#[cfg(test)]
mod test_support;

// Core exports
pub use cli::Commands;
pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorSettings};
pub use miner::{BackendConfig, Hasher, HasherFactory, Job, JobResult, WorkerPool};
pub use network::{DonationConfig, Network, NetworkStatus, PoolConfig};
pub use stats::{HardwareStats, HashrateReport, ShareSnapshot, StatsReporter};
pub use types::{AlgorithmType, BackendType};
pub use utils::{MinerError, init_logging};
