// src/miner/worker_pool.rs
//! Worker pool lifecycle
//!
//! The pool is the only owner of worker threads. Starting is all-or-nothing:
//! every worker must pass its self-test before any of them may mine, and a
//! single failure joins everything that was spawned.

use crate::miner::algorithm::HasherFactory;
use crate::miner::job::Job;
use crate::miner::results::ResultSink;
use crate::miner::sequencer::SequencerRegistry;
use crate::miner::worker::{Worker, WorkerCounters, WorkerState};
use crate::stats::hashrate::{Hashrate, HashrateReport};
use crate::types::BackendType;
use crate::utils::error::MinerError;
use crossbeam_channel::Sender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

/// Nonces a worker reserves per batch unless configured otherwise
pub const DEFAULT_BATCH_SIZE: u64 = 32_768;

/// Threads to start for one hasher factory
#[derive(Clone)]
pub struct BackendConfig {
    /// Factory building one hasher per thread
    pub factory: Arc<dyn HasherFactory>,
    /// Number of worker threads
    pub threads: usize,
}

impl BackendConfig {
    /// Creates a backend entry
    pub fn new(factory: Arc<dyn HasherFactory>, threads: usize) -> Self {
        BackendConfig { factory, threads }
    }
}

struct WorkerHandle {
    backend: BackendType,
    counters: Arc<WorkerCounters>,
    thread: Option<JoinHandle<()>>,
}

/// Owns every worker thread and their hashrate samples
pub struct WorkerPool {
    registry: Arc<SequencerRegistry>,
    sink: ResultSink,
    batch_size: u64,
    workers: Mutex<Vec<WorkerHandle>>,
    factories: Mutex<Vec<Arc<dyn HasherFactory>>>,
    hashrate: Mutex<Hashrate>,
}

impl WorkerPool {
    /// Creates an empty pool
    ///
    /// # Arguments
    /// * `registry` - Sequencer the workers follow
    /// * `sink` - Result ingress handed to every worker
    /// * `batch_size` - Nonces per reservation, see [`DEFAULT_BATCH_SIZE`]
    pub fn new(registry: Arc<SequencerRegistry>, sink: ResultSink, batch_size: u64) -> Self {
        WorkerPool {
            registry,
            sink,
            batch_size: batch_size.max(1),
            workers: Mutex::new(Vec::new()),
            factories: Mutex::new(Vec::new()),
            hashrate: Mutex::new(Hashrate::new(0)),
        }
    }

    /// Spawns and self-tests every configured worker
    ///
    /// On any self-test or hasher creation failure every spawned thread is
    /// joined and the error is returned, leaving the pool empty.
    pub fn start(&self, backends: &[BackendConfig]) -> Result<(), MinerError> {
        let mut workers = self
            .workers
            .lock()
            .map_err(|_| MinerError::TaskError("worker list poisoned".into()))?;
        if !workers.is_empty() {
            return Err(MinerError::TaskError("worker pool already started".into()));
        }

        let total: usize = backends.iter().map(|b| b.threads).sum();
        if total == 0 {
            return Err(MinerError::ConfigError("no worker threads configured".into()));
        }

        let (ready_tx, ready_rx) = crossbeam_channel::unbounded();
        let mut spawned: Vec<(WorkerHandle, Sender<bool>)> = Vec::with_capacity(total);

        if let Err(e) = self.spawn_all(backends, &ready_tx, &mut spawned) {
            abort(spawned);
            return Err(e);
        }
        drop(ready_tx);

        let mut failed = Vec::new();
        for _ in 0..spawned.len() {
            match ready_rx.recv() {
                Ok((id, true)) => log::debug!("worker {} passed self-test", id),
                Ok((id, false)) => failed.push(id),
                Err(_) => {
                    failed.push(usize::MAX);
                    break;
                }
            }
        }
        if !failed.is_empty() {
            abort(spawned);
            failed.sort_unstable();
            return Err(MinerError::SelfTestError(format!(
                "workers {:?} failed their known-answer test",
                failed
            )));
        }

        for (handle, gate) in spawned {
            let _ = gate.send(true);
            workers.push(handle);
        }

        let mut factories = self
            .factories
            .lock()
            .map_err(|_| MinerError::TaskError("factory list poisoned".into()))?;
        factories.extend(backends.iter().filter(|b| b.threads > 0).map(|b| b.factory.clone()));

        if let Ok(mut hashrate) = self.hashrate.lock() {
            *hashrate = Hashrate::new(workers.len());
        }
        log::info!("started {} worker threads", workers.len());
        Ok(())
    }

    fn spawn_all(
        &self,
        backends: &[BackendConfig],
        ready: &Sender<(usize, bool)>,
        spawned: &mut Vec<(WorkerHandle, Sender<bool>)>,
    ) -> Result<(), MinerError> {
        for backend in backends {
            let class = backend.factory.backend();
            for _ in 0..backend.threads {
                let id = spawned.len();
                let hasher = backend.factory.create(id)?;
                let worker = Worker::new(
                    id,
                    class,
                    hasher,
                    self.registry.clone(),
                    self.sink.clone(),
                    self.batch_size,
                );
                let counters = worker.counters();
                let (gate_tx, gate_rx) = crossbeam_channel::bounded(1);
                let ready = ready.clone();
                let thread = std::thread::Builder::new()
                    .name(format!("worker-{}", id))
                    .spawn(move || worker.run(ready, gate_rx))?;

                spawned.push((
                    WorkerHandle {
                        backend: class,
                        counters,
                        thread: Some(thread),
                    },
                    gate_tx,
                ));
            }
        }
        Ok(())
    }

    /// Signals shutdown and joins every worker
    pub fn stop(&self) {
        self.registry.shutdown();
        let Ok(mut workers) = self.workers.lock() else {
            return;
        };
        let mut joined = 0;
        for (id, worker) in workers.iter_mut().enumerate() {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    log::error!("worker {} terminated abnormally", id);
                }
                joined += 1;
            }
        }
        if joined > 0 {
            log::info!("worker pool stopped, {} threads joined", joined);
        }
    }

    /// Samples every worker's hash counter
    pub fn tick(&self, now: Instant) {
        let Ok(workers) = self.workers.lock() else {
            return;
        };
        if let Ok(mut hashrate) = self.hashrate.lock() {
            for (id, worker) in workers.iter().enumerate() {
                hashrate.add(id, worker.counters.hashes(), now);
            }
        }
    }

    /// Per-worker and total hashrate over the standard windows
    pub fn hashrate(&self) -> HashrateReport {
        match self.hashrate.lock() {
            Ok(mut hashrate) => hashrate.update_highest(),
            Err(_) => HashrateReport::default(),
        }
    }

    /// Total hashes computed by all workers
    pub fn total_hashes(&self) -> u64 {
        self.workers
            .lock()
            .map(|workers| workers.iter().map(|w| w.counters.hashes()).sum())
            .unwrap_or(0)
    }

    /// Lifecycle state of each worker, by worker id
    pub fn worker_states(&self) -> Vec<(BackendType, WorkerState)> {
        self.workers
            .lock()
            .map(|workers| {
                workers
                    .iter()
                    .map(|w| (w.backend, w.counters.state()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Forwards an advisory job notice to every factory able to mine it
    pub fn job_early_notification(&self, job: &Job) {
        if let Ok(factories) = self.factories.lock() {
            for factory in factories.iter().filter(|f| f.supports(job.algorithm())) {
                factory.early_notification(job);
            }
        }
    }

    /// Sequencer shared with the workers
    pub fn registry(&self) -> &Arc<SequencerRegistry> {
        &self.registry
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn abort(spawned: Vec<(WorkerHandle, Sender<bool>)>) {
    for (mut handle, gate) in spawned {
        let _ = gate.send(false);
        if let Some(thread) = handle.thread.take() {
            let _ = thread.join();
        }
    }
}
