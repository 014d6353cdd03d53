// src/miner/mod.rs
//! Core mining functionality
//!
//! This module contains all components related to the mining process:
//! - Hash kernel interface and the RandomX adapter
//! - Job values and lock-free job distribution
//! - Worker threads and the pool that owns them
//! - The result pipeline from workers to the network thread

/// Hash kernel interface
///
/// Defines the [`Hasher`] / [`HasherFactory`] pair every compute backend
/// implements, plus the RandomX adapter.
pub mod algorithm;

/// Job and result value types, target parsing and nonce layout
pub mod job;

/// Result submission queue and GPU candidate re-verification
pub mod results;

/// Generation counters and job slots shared with every worker
pub mod sequencer;

/// Worker thread implementation
///
/// Contains the worker loop that performs actual hash computations.
pub mod worker;

/// Worker pool lifecycle: self-test, start, stop, hashrate
pub mod worker_pool;

// Re-export main components for cleaner imports
pub use self::algorithm::{Hasher, HasherFactory};
pub use self::job::{Job, JobResult};
pub use self::results::{ResultQueue, ResultSink, Submission};
pub use self::sequencer::SequencerRegistry;
pub use self::worker::WorkerState;
pub use self::worker_pool::{BackendConfig, DEFAULT_BATCH_SIZE, WorkerPool};
