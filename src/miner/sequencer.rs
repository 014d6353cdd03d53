// src/miner/sequencer.rs
//! Lock-free job versioning shared by the coordinator and every worker
//!
//! Each worker class owns a generation counter and a job slot. Writers
//! publish a job envelope into the slot and then advance the counter; workers
//! compare their cached generation against the counter with one atomic load
//! and only touch the slot when it moved.
//!
//! Writers serialize on an internal lock so a resume can never re-publish a
//! slot that an install is replacing. Readers never take it.
//!
//! Counters start at 1. A counter of 0 is the terminal shutdown signal.

use crate::miner::job::Job;
use crate::types::BackendType;
use arc_swap::ArcSwapOption;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A published job plus the shared nonce reservation cursor for it
#[derive(Debug)]
pub struct JobEnvelope {
    job: Job,
    cursor: AtomicU64,
}

impl JobEnvelope {
    fn new(job: Job, cursor: u64) -> Self {
        JobEnvelope {
            job,
            cursor: AtomicU64::new(cursor),
        }
    }

    /// The installed job
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Reserves the next `batch` positions of the job's nonce space
    ///
    /// Returns `None` once the space is exhausted.
    pub fn reserve(&self, batch: u64) -> Option<Range<u64>> {
        let space = self.job.nonce_space();
        let start = self.cursor.fetch_add(batch, Ordering::Relaxed);
        if start >= space {
            return None;
        }
        Some(start..(start + batch).min(space))
    }

    fn position(&self) -> u64 {
        self.cursor.load(Ordering::Relaxed)
    }
}

/// Generation counters, job slots and the global pause flag
pub struct SequencerRegistry {
    sequences: [AtomicU64; BackendType::COUNT],
    slots: [ArcSwapOption<JobEnvelope>; BackendType::COUNT],
    latest: ArcSwapOption<Job>,
    paused: AtomicBool,
    writer: Mutex<()>,
}

impl Default for SequencerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SequencerRegistry {
    /// Creates a registry with every counter at 1 and no job installed
    pub fn new() -> Self {
        SequencerRegistry {
            sequences: [AtomicU64::new(1), AtomicU64::new(1), AtomicU64::new(1)],
            slots: [
                ArcSwapOption::empty(),
                ArcSwapOption::empty(),
                ArcSwapOption::empty(),
            ],
            latest: ArcSwapOption::empty(),
            paused: AtomicBool::new(false),
            writer: Mutex::new(()),
        }
    }

    /// Current generation of a worker class
    pub fn current(&self, class: BackendType) -> u64 {
        self.sequences[class.index()].load(Ordering::Acquire)
    }

    /// Whether a worker holding `local` must refetch its job
    pub fn is_stale(&self, class: BackendType, local: u64) -> bool {
        self.current(class) != local
    }

    /// Whether the class received the terminal shutdown signal
    pub fn is_shutdown(&self, class: BackendType) -> bool {
        self.current(class) == 0
    }

    /// Whether mining is globally paused
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Advances a class counter so every worker sees its job as stale
    ///
    /// Returns the new generation, or `None` after shutdown.
    pub fn bump(&self, class: BackendType) -> Option<u64> {
        let _writer = self.lock_writer();
        self.advance(class)
    }

    /// Publishes a new job to every worker class
    pub fn install_job(&self, job: Job) {
        let _writer = self.lock_writer();
        for class in BackendType::ALL {
            self.publish(class, &job, 0);
        }
        self.latest.store(Some(Arc::new(job)));
    }

    /// Returns the envelope and generation a worker should switch to
    ///
    /// `None` when `local` is still current or nothing was installed yet.
    pub fn fetch_for_worker(
        &self,
        class: BackendType,
        local: u64,
    ) -> Option<(Arc<JobEnvelope>, u64)> {
        let generation = self.current(class);
        if generation == local || generation == 0 {
            return None;
        }
        let envelope = self.slots[class.index()].load_full()?;
        Some((envelope, generation))
    }

    /// Most recently installed job, if any
    pub fn latest_job(&self) -> Option<Arc<Job>> {
        self.latest.load_full()
    }

    /// Raises the pause flag and kicks workers out of their nonce batches
    pub fn pause(&self) {
        let _writer = self.lock_writer();
        self.paused.store(true, Ordering::Release);
        for class in BackendType::ALL {
            self.advance(class);
        }
    }

    /// Clears the pause flag and re-publishes the last job
    ///
    /// The re-published envelope keeps its nonce position so nonces mined
    /// before the pause are not handed out again.
    pub fn resume(&self) {
        let _writer = self.lock_writer();
        self.paused.store(false, Ordering::Release);
        for class in BackendType::ALL {
            match self.slots[class.index()].load_full() {
                Some(envelope) => {
                    self.publish(class, envelope.job(), envelope.position());
                }
                None => {
                    self.advance(class);
                }
            }
        }
    }

    /// Terminal stop: every class counter drops to 0
    pub fn shutdown(&self) {
        let _writer = self.lock_writer();
        for sequence in &self.sequences {
            sequence.store(0, Ordering::Release);
        }
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        // The guard protects no data, so a poisoned lock is still usable.
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Callers hold the writer lock.
    fn advance(&self, class: BackendType) -> Option<u64> {
        let sequence = &self.sequences[class.index()];
        let current = sequence.load(Ordering::Acquire);
        if current == 0 {
            return None;
        }
        sequence.store(current + 1, Ordering::Release);
        Some(current + 1)
    }

    // Callers hold the writer lock. The slot is filled before the counter
    // moves so a reader that sees the new generation also sees its job.
    fn publish(&self, class: BackendType, job: &Job, position: u64) {
        let sequence = &self.sequences[class.index()];
        let current = sequence.load(Ordering::Acquire);
        if current == 0 {
            return;
        }
        let next = current + 1;
        let envelope = JobEnvelope::new(job.with_generation(next), position);
        self.slots[class.index()].store(Some(Arc::new(envelope)));
        sequence.store(next, Ordering::Release);
    }
}
