// src/miner/worker.rs
//! Worker thread implementation
//!
//! A worker owns one [`Hasher`] and drives it over nonce batches reserved
//! from the current job envelope. Job switches are detected through the
//! sequencer generation, which is re-checked before every nonce, so a worker
//! never spends more than one hash on superseded or paused work.

use crate::miner::algorithm::Hasher;
use crate::miner::job::{JobResult, meets_target};
use crate::miner::results::ResultSink;
use crate::miner::sequencer::{JobEnvelope, SequencerRegistry};
use crate::types::BackendType;
use crossbeam_channel::{Receiver, Sender};
use std::fmt;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

/// Sleep between polls while paused or waiting for work
pub const IDLE_SLEEP: Duration = Duration::from_millis(20);

/// Lifecycle of a worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Thread spawned, nothing run yet
    Created = 0,
    /// Running the hasher's known-answer vectors
    SelfTesting = 1,
    /// Waiting for the start signal or for a job
    Idle = 2,
    /// Hashing a nonce batch
    Mining = 3,
    /// Holding a job while the pool is paused
    Paused = 4,
    /// Shutdown observed, flushing pending candidates
    Draining = 5,
    /// Thread finished (normally, by self-test failure or by panic)
    Stopped = 6,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => WorkerState::Created,
            1 => WorkerState::SelfTesting,
            2 => WorkerState::Idle,
            3 => WorkerState::Mining,
            4 => WorkerState::Paused,
            5 => WorkerState::Draining,
            _ => WorkerState::Stopped,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Created => "created",
            WorkerState::SelfTesting => "self-testing",
            WorkerState::Idle => "idle",
            WorkerState::Mining => "mining",
            WorkerState::Paused => "paused",
            WorkerState::Draining => "draining",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Counters a worker publishes for the pool to observe
///
/// Written only by the owning worker thread.
#[derive(Debug)]
pub struct WorkerCounters {
    hashes: AtomicU64,
    state: AtomicU8,
}

impl Default for WorkerCounters {
    fn default() -> Self {
        WorkerCounters {
            hashes: AtomicU64::new(0),
            state: AtomicU8::new(WorkerState::Created as u8),
        }
    }
}

impl WorkerCounters {
    /// Total hashes computed since the worker started
    pub fn hashes(&self) -> u64 {
        self.hashes.load(Ordering::Relaxed)
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn add_hashes(&self, count: u64) {
        self.hashes.fetch_add(count, Ordering::Relaxed);
    }
}

/// Per-worker cursor over the job currently being mined
struct WorkerJob {
    envelope: Arc<JobEnvelope>,
    blob: Vec<u8>,
    nonce_cursor: u64,
    nonce_end: u64,
    generation: u64,
    exhausted: bool,
}

impl WorkerJob {
    fn new(envelope: Arc<JobEnvelope>, generation: u64) -> Self {
        let blob = envelope.job().blob().to_vec();
        WorkerJob {
            envelope,
            blob,
            nonce_cursor: 0,
            nonce_end: 0,
            generation,
            exhausted: false,
        }
    }

    fn take_range(&mut self, batch: u64) -> Option<Range<u64>> {
        if self.nonce_cursor >= self.nonce_end {
            let range = self.envelope.reserve(batch)?;
            self.nonce_cursor = range.start;
            self.nonce_end = range.end;
        }
        let range = self.nonce_cursor..self.nonce_end;
        self.nonce_cursor = self.nonce_end;
        Some(range)
    }
}

/// One mining thread
pub struct Worker {
    id: usize,
    backend: BackendType,
    hasher: Box<dyn Hasher>,
    registry: Arc<SequencerRegistry>,
    sink: ResultSink,
    counters: Arc<WorkerCounters>,
    batch_size: u64,
}

impl Worker {
    /// Creates a worker around an already built hasher
    ///
    /// # Arguments
    /// * `id` - Pool-wide worker index
    /// * `backend` - Worker class, selects the sequencer counter to follow
    /// * `hasher` - Kernel instance owned by this worker
    /// * `registry` - Shared job sequencer
    /// * `sink` - Result ingress
    /// * `batch_size` - Nonces reserved per batch
    pub fn new(
        id: usize,
        backend: BackendType,
        hasher: Box<dyn Hasher>,
        registry: Arc<SequencerRegistry>,
        sink: ResultSink,
        batch_size: u64,
    ) -> Self {
        Worker {
            id,
            backend,
            hasher,
            registry,
            sink,
            counters: Arc::new(WorkerCounters::default()),
            batch_size: batch_size.max(1),
        }
    }

    /// Counters shared with the pool
    pub fn counters(&self) -> Arc<WorkerCounters> {
        self.counters.clone()
    }

    /// Thread body: self-test, wait for the start gate, then mine
    ///
    /// # Arguments
    /// * `ready` - Receives `(id, passed)` once the self-test finished
    /// * `gate` - `true` starts mining, `false` or a dropped sender aborts
    pub fn run(mut self, ready: Sender<(usize, bool)>, gate: Receiver<bool>) {
        self.counters.set_state(WorkerState::SelfTesting);
        let passed = panic::catch_unwind(AssertUnwindSafe(|| self.hasher.self_test()))
            .unwrap_or(false);
        if !passed {
            log::error!("worker {} ({}) failed self-test", self.id, self.backend);
        }
        self.counters.set_state(WorkerState::Idle);

        if ready.send((self.id, passed)).is_err() || !passed {
            self.counters.set_state(WorkerState::Stopped);
            return;
        }
        if !gate.recv().unwrap_or(false) {
            self.counters.set_state(WorkerState::Stopped);
            return;
        }

        let id = self.id;
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| self.mine())) {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::error!("worker {} stopped after a kernel panic: {}", id, reason);
        }
        self.counters.set_state(WorkerState::Stopped);
    }

    fn mine(&mut self) {
        let mut current: Option<WorkerJob> = None;
        let mut candidates: Vec<(u32, [u8; 32])> = Vec::new();

        loop {
            if self.registry.is_shutdown(self.backend) {
                self.counters.set_state(WorkerState::Draining);
                break;
            }

            let local = current.as_ref().map_or(0, |job| job.generation);
            if self.registry.is_stale(self.backend, local) {
                match self.registry.fetch_for_worker(self.backend, local) {
                    Some((envelope, generation)) => {
                        current = Some(self.switch_job(envelope, generation));
                    }
                    None => {
                        self.counters.set_state(WorkerState::Idle);
                        std::thread::sleep(IDLE_SLEEP);
                        continue;
                    }
                }
            }

            if self.registry.is_paused() {
                self.counters.set_state(WorkerState::Paused);
                std::thread::sleep(IDLE_SLEEP);
                continue;
            }

            let Some(job) = current.as_mut() else {
                std::thread::sleep(IDLE_SLEEP);
                continue;
            };
            if job.exhausted {
                self.counters.set_state(WorkerState::Idle);
                std::thread::sleep(IDLE_SLEEP);
                continue;
            }
            let Some(range) = job.take_range(self.batch_size) else {
                log::warn!(
                    "worker {} exhausted the nonce space of job {}",
                    self.id,
                    job.envelope.job().id()
                );
                job.exhausted = true;
                continue;
            };

            self.counters.set_state(WorkerState::Mining);
            self.mine_range(job, range, &mut candidates);
            if !candidates.is_empty() {
                self.flush_candidates(job, &mut candidates);
            }
        }
    }

    fn switch_job(&mut self, envelope: Arc<JobEnvelope>, generation: u64) -> WorkerJob {
        let mut job = WorkerJob::new(envelope, generation);
        if let Err(e) = self.hasher.prepare(job.envelope.job()) {
            log::warn!(
                "worker {} cannot mine job {}: {}",
                self.id,
                job.envelope.job().id(),
                e
            );
            job.exhausted = true;
        }
        job
    }

    fn mine_range(
        &mut self,
        job: &mut WorkerJob,
        range: Range<u64>,
        candidates: &mut Vec<(u32, [u8; 32])>,
    ) {
        let shared = job.envelope.clone();
        let target = shared.job().target();
        let height = shared.job().height();
        let mut hashed = 0u64;

        for position in range {
            if self.registry.is_stale(self.backend, job.generation) {
                break;
            }
            let nonce = shared.job().compose_nonce(position);
            shared.job().write_nonce(&mut job.blob, nonce);
            let digest = self.hasher.hash(&job.blob, nonce, height);
            hashed += 1;

            if meets_target(&digest, target) {
                if self.backend.is_gpu() {
                    candidates.push((nonce, digest));
                } else {
                    let result = JobResult::new(shared.job(), nonce, digest, self.backend);
                    if let Err(e) = self.sink.submit(result) {
                        log::warn!("worker {} dropped a result: {}", self.id, e);
                    }
                }
            }
        }
        self.counters.add_hashes(hashed);
    }

    fn flush_candidates(&self, job: &WorkerJob, candidates: &mut Vec<(u32, [u8; 32])>) {
        let hits = std::mem::take(candidates);
        if let Err(e) = self
            .sink
            .submit_candidates(job.envelope.job().clone(), self.backend, hits)
        {
            log::warn!("worker {} dropped candidates: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::miner::results::Submission;
    use crate::test_support::{StubHasher, make_job};

    fn spawn_worker(
        registry: Arc<SequencerRegistry>,
        backend: BackendType,
        hasher: StubHasher,
    ) -> (
        std::thread::JoinHandle<()>,
        Arc<WorkerCounters>,
        crossbeam_channel::Receiver<Submission>,
    ) {
        let (sink, rx) = ResultSink::channel();
        let worker = Worker::new(0, backend, Box::new(hasher), registry, sink, 64);
        let counters = worker.counters();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (gate_tx, gate_rx) = crossbeam_channel::bounded(1);
        let handle = std::thread::spawn(move || worker.run(ready_tx, gate_rx));
        assert_eq!(ready_rx.recv().unwrap(), (0, true));
        gate_tx.send(true).unwrap();
        (handle, counters, rx)
    }

    #[test]
    fn test_state_round_trips_through_atomic() {
        let counters = WorkerCounters::default();
        assert_eq!(counters.state(), WorkerState::Created);
        counters.set_state(WorkerState::Paused);
        assert_eq!(counters.state(), WorkerState::Paused);
        assert_eq!(WorkerState::Draining.to_string(), "draining");
    }

    #[test]
    fn test_worker_reports_hit_as_result() {
        let registry = Arc::new(SequencerRegistry::new());
        let hasher = StubHasher::with_hits([10]);
        let (handle, counters, rx) = spawn_worker(registry.clone(), BackendType::Cpu, hasher);

        registry.install_job(make_job("j1", 1));
        let submission = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        registry.shutdown();
        handle.join().unwrap();

        match submission {
            Submission::Verified(result) => {
                assert_eq!(result.nonce, 10);
                assert_eq!(result.job_id, "j1");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(counters.hashes() > 10);
        assert_eq!(counters.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_gpu_hits_are_sent_as_candidates() {
        let registry = Arc::new(SequencerRegistry::new());
        let hasher = StubHasher::with_hits([3, 5]);
        let (handle, _, rx) = spawn_worker(registry.clone(), BackendType::OpenCl, hasher);

        registry.install_job(make_job("gpu", 1));
        let submission = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        registry.shutdown();
        handle.join().unwrap();

        match submission {
            Submission::Candidates { job, backend, hits } => {
                assert_eq!(job.id(), "gpu");
                assert_eq!(backend, BackendType::OpenCl);
                assert_eq!(hits.iter().map(|(n, _)| *n).collect::<Vec<_>>(), vec![3, 5]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_failed_self_test_never_waits_for_gate() {
        let registry = Arc::new(SequencerRegistry::new());
        let (sink, _rx) = ResultSink::channel();
        let worker = Worker::new(
            3,
            BackendType::Cpu,
            Box::new(StubHasher::failing_self_test()),
            registry,
            sink,
            64,
        );
        let counters = worker.counters();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (_gate_tx, gate_rx) = crossbeam_channel::bounded::<bool>(1);
        let handle = std::thread::spawn(move || worker.run(ready_tx, gate_rx));

        assert_eq!(ready_rx.recv().unwrap(), (3, false));
        handle.join().unwrap();
        assert_eq!(counters.state(), WorkerState::Stopped);
    }
}
