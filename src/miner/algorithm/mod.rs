// src/miner/algorithm/mod.rs
//! Hash kernel interface
//!
//! The core never implements a proof-of-work algorithm itself. Kernels plug
//! in through [`HasherFactory`], which builds one [`Hasher`] per worker
//! thread, so a hasher never shares mutable state with another worker.
//!
//! Currently ships:
//! - RandomX (`rx/0`) through the `rust-randomx` bindings

/// RandomX kernel adapter
///
/// Shares one dataset per seed between all workers and rebuilds it when the
/// endpoint rotates the seed.
pub mod randomx;

use crate::miner::job::Job;
use crate::types::{AlgorithmType, BackendType};
use crate::utils::error::MinerError;

/// Per-worker compute kernel
pub trait Hasher: Send {
    /// Runs the kernel against fixed known-answer vectors
    ///
    /// # Returns
    /// `true` when every vector matched
    fn self_test(&mut self) -> bool;

    /// Called once per job switch before any `hash` call for that job
    ///
    /// Kernels whose state depends on the job (e.g. a RandomX seed) rebuild
    /// it here.
    fn prepare(&mut self, job: &Job) -> Result<(), MinerError> {
        let _ = job;
        Ok(())
    }

    /// Hashes a blob that already carries `nonce` in its nonce field
    ///
    /// # Arguments
    /// * `blob` - Worker-owned blob copy with the nonce written in
    /// * `nonce` - The nonce value, for kernels that consume it separately
    /// * `height` - Block height of the job
    fn hash(&mut self, blob: &[u8], nonce: u32, height: u64) -> [u8; 32];
}

/// Builds hashers for one worker class
pub trait HasherFactory: Send + Sync {
    /// Worker class the produced hashers belong to
    fn backend(&self) -> BackendType;

    /// Algorithms the produced hashers can mine
    fn algorithms(&self) -> Vec<AlgorithmType>;

    /// Builds the hasher for worker `worker_id`
    ///
    /// Allocation failures surface here and abort pool start.
    fn create(&self, worker_id: usize) -> Result<Box<dyn Hasher>, MinerError>;

    /// Advisory notice that `job` is about to become current
    ///
    /// Lets a kernel warm job-dependent state ahead of time. Ignoring it must
    /// not affect correctness.
    fn early_notification(&self, job: &Job) {
        let _ = job;
    }

    /// Whether this factory can mine `algorithm`
    fn supports(&self, algorithm: AlgorithmType) -> bool {
        self.algorithms().contains(&algorithm)
    }
}
