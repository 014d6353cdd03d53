// src/miner/algorithm/randomx.rs
//! RandomX kernel adapter
//!
//! Wraps the `rust-randomx` bindings behind the [`Hasher`] interface:
//! - One RandomX context per seed, shared by every worker through an `Arc`
//! - A thread-local `rust_randomx::Hasher` per worker
//! - Early job notifications warm the context for an upcoming seed

use crate::miner::algorithm::{Hasher, HasherFactory};
use crate::miner::job::Job;
use crate::types::{AlgorithmType, BackendType};
use crate::utils::error::MinerError;
use rust_randomx::{Context, Hasher as RxHasher};
use std::sync::{Arc, Mutex, OnceLock, TryLockError};

/// Known-answer vector from the RandomX reference test suite
const SELF_TEST_KEY: &[u8] = b"test key 000";
const SELF_TEST_INPUT: &[u8] = b"This is a test";
const SELF_TEST_HASH: [u8; 32] = [
    0x63, 0x91, 0x83, 0xaa, 0xe1, 0xbf, 0x4c, 0x9a, 0x35, 0x88, 0x4c, 0xb4, 0x6b, 0x09, 0xca,
    0xd9, 0x17, 0x5f, 0x04, 0xef, 0xd7, 0x68, 0x4e, 0x72, 0x62, 0xa0, 0xac, 0x1c, 0x2f, 0x0b,
    0x4e, 0x3f,
];

/// Shared RandomX state
///
/// The dataset is the memory-intensive part (~2080MB in fast mode, ~256MB in
/// light mode), so exactly one exists per seed.
struct Shared {
    fast: bool,
    dataset: Mutex<Option<(Vec<u8>, Arc<Context>)>>,
    test_context: OnceLock<Arc<Context>>,
}

impl Shared {
    /// Returns the context for `seed`, building it when the seed changed
    ///
    /// Building happens under the lock so concurrent workers wait for one
    /// initialization instead of each allocating a dataset.
    fn context_for(&self, seed: &[u8]) -> Result<Arc<Context>, MinerError> {
        let mut dataset = self
            .dataset
            .lock()
            .map_err(|_| MinerError::AlgorithmError("RandomX dataset lock poisoned".into()))?;

        if let Some((cached_seed, context)) = dataset.as_ref() {
            if cached_seed.as_slice() == seed {
                return Ok(context.clone());
            }
        }

        log::info!(
            "initializing RandomX {} dataset for seed {}",
            if self.fast { "fast" } else { "light" },
            hex::encode(seed)
        );
        let started = std::time::Instant::now();
        let context = Arc::new(Context::new(seed, self.fast));
        log::info!("RandomX dataset ready ({} ms)", started.elapsed().as_millis());

        *dataset = Some((seed.to_vec(), context.clone()));
        Ok(context)
    }

    /// Whether a warm-up for `seed` would build anything
    ///
    /// Never blocks: while another initialization holds the lock the answer
    /// is no, workers pick the seed up in `prepare` anyway.
    fn needs_warm_up(&self, seed: &[u8]) -> bool {
        match self.dataset.try_lock() {
            Ok(dataset) => dataset
                .as_ref()
                .is_none_or(|(cached_seed, _)| cached_seed.as_slice() != seed),
            Err(TryLockError::WouldBlock) => false,
            Err(TryLockError::Poisoned(_)) => false,
        }
    }

    fn test_context(&self) -> Arc<Context> {
        self.test_context
            .get_or_init(|| Arc::new(Context::new(SELF_TEST_KEY, false)))
            .clone()
    }
}

/// Builds RandomX hashers for CPU workers
#[derive(Clone)]
pub struct RandomXFactory {
    shared: Arc<Shared>,
}

impl RandomXFactory {
    /// Creates a factory
    ///
    /// # Arguments
    /// * `fast` - Use the full dataset (more memory, much higher hashrate)
    pub fn new(fast: bool) -> Self {
        RandomXFactory {
            shared: Arc::new(Shared {
                fast,
                dataset: Mutex::new(None),
                test_context: OnceLock::new(),
            }),
        }
    }
}

impl HasherFactory for RandomXFactory {
    fn backend(&self) -> BackendType {
        BackendType::Cpu
    }

    fn algorithms(&self) -> Vec<AlgorithmType> {
        vec![AlgorithmType::RandomX]
    }

    fn create(&self, _worker_id: usize) -> Result<Box<dyn Hasher>, MinerError> {
        Ok(Box::new(RandomX {
            shared: self.shared.clone(),
            seed: None,
            hasher: None,
        }))
    }

    fn early_notification(&self, job: &Job) {
        if !self.supports(job.algorithm()) || !self.shared.needs_warm_up(job.seed()) {
            return;
        }
        let seed = job.seed().to_vec();
        let shared = self.shared.clone();
        rayon::spawn(move || {
            if let Err(e) = shared.context_for(&seed) {
                log::warn!("RandomX warm-up failed: {}", e);
            }
        });
    }
}

/// Per-worker RandomX hasher
pub struct RandomX {
    shared: Arc<Shared>,
    seed: Option<Vec<u8>>,
    hasher: Option<RxHasher>,
}

impl Hasher for RandomX {
    fn self_test(&mut self) -> bool {
        let hasher = RxHasher::new(self.shared.test_context());
        let output = hasher.hash(SELF_TEST_INPUT);
        output.as_ref() == SELF_TEST_HASH.as_slice()
    }

    fn prepare(&mut self, job: &Job) -> Result<(), MinerError> {
        if job.algorithm() != AlgorithmType::RandomX {
            return Err(MinerError::AlgorithmError(format!(
                "RandomX hasher cannot mine {}",
                job.algorithm()
            )));
        }
        if self.seed.as_deref() == Some(job.seed()) {
            return Ok(());
        }
        let context = self.shared.context_for(job.seed())?;
        self.hasher = Some(RxHasher::new(context));
        self.seed = Some(job.seed().to_vec());
        Ok(())
    }

    fn hash(&mut self, blob: &[u8], _nonce: u32, _height: u64) -> [u8; 32] {
        let mut digest = [0xffu8; 32];
        if let Some(hasher) = &self.hasher {
            let output = hasher.hash(blob);
            digest.copy_from_slice(&output.as_ref()[..32]);
        }
        digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warm_up_needed_until_a_seed_is_cached() {
        let factory = RandomXFactory::new(false);
        assert!(factory.shared.needs_warm_up(&[1; 32]));
    }

    #[test]
    fn test_warm_up_skipped_while_initialization_runs() {
        let factory = RandomXFactory::new(false);
        let _building = factory.shared.dataset.lock().unwrap();
        assert!(!factory.shared.needs_warm_up(&[1; 32]));

        // Must return immediately instead of queueing a second build.
        factory.early_notification(&crate::test_support::make_job("j", 1));
    }
}
