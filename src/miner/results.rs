// src/miner/results.rs
//! Result submission pipeline
//!
//! Workers push results into a [`ResultSink`] without knowing anything about
//! network state. A single consumer thread drains the channel, re-verifies
//! GPU candidates on the rayon pool and hands verified results to a dispatch
//! closure (the coordinator forwards them to the network thread).

use crate::miner::algorithm::{Hasher, HasherFactory};
use crate::miner::job::{Job, JobResult, meets_target};
use crate::stats::ShareStats;
use crate::types::BackendType;
use crate::utils::error::MinerError;
use crossbeam_channel::{Receiver, Sender};
use rayon::prelude::*;
use std::sync::Arc;
use std::thread::JoinHandle;

/// One message on the result channel
#[derive(Debug)]
pub enum Submission {
    /// A CPU result, already checked against the target by the worker
    Verified(JobResult),
    /// A batch of GPU hits that still needs CPU re-verification
    Candidates {
        /// Job the hits were mined on
        job: Job,
        /// Worker class that produced them
        backend: BackendType,
        /// `(nonce, digest)` pairs as reported by the device
        hits: Vec<(u32, [u8; 32])>,
    },
    /// Terminates the consumer thread
    Stop,
}

/// Cloneable producer handle held by every worker
#[derive(Clone)]
pub struct ResultSink {
    sender: Sender<Submission>,
}

impl ResultSink {
    /// Creates a sink and the matching receiver
    pub fn channel() -> (Self, Receiver<Submission>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (ResultSink { sender }, receiver)
    }

    /// Queues a verified result
    pub fn submit(&self, result: JobResult) -> Result<(), MinerError> {
        self.sender.send(Submission::Verified(result))?;
        Ok(())
    }

    /// Queues GPU candidates for re-verification
    pub fn submit_candidates(
        &self,
        job: Job,
        backend: BackendType,
        hits: Vec<(u32, [u8; 32])>,
    ) -> Result<(), MinerError> {
        self.sender.send(Submission::Candidates { job, backend, hits })?;
        Ok(())
    }
}

/// Owner of the result channel before the consumer starts
pub struct ResultQueue {
    sink: ResultSink,
    receiver: Receiver<Submission>,
    verifier: Option<Arc<dyn HasherFactory>>,
    stats: Arc<ShareStats>,
}

impl ResultQueue {
    /// Creates the queue
    ///
    /// # Arguments
    /// * `verifier` - CPU hasher factory used to re-check GPU candidates;
    ///   without one, candidates are only checked against the target
    /// * `stats` - Counters receiving invalid candidate counts
    pub fn new(verifier: Option<Arc<dyn HasherFactory>>, stats: Arc<ShareStats>) -> Self {
        let (sink, receiver) = ResultSink::channel();
        ResultQueue {
            sink,
            receiver,
            verifier,
            stats,
        }
    }

    /// Producer handle for workers
    pub fn sink(&self) -> ResultSink {
        self.sink.clone()
    }

    /// Starts the consumer thread
    ///
    /// `dispatch` receives every verified result exactly once, in channel
    /// order for CPU results.
    pub fn spawn<F>(self, mut dispatch: F) -> Result<ResultConsumer, MinerError>
    where
        F: FnMut(JobResult) + Send + 'static,
    {
        let ResultQueue {
            sink,
            receiver,
            verifier,
            stats,
        } = self;

        let handle = std::thread::Builder::new()
            .name("results".into())
            .spawn(move || {
                for submission in receiver {
                    match submission {
                        Submission::Verified(result) => dispatch(result),
                        Submission::Candidates { job, backend, hits } => {
                            let verified =
                                verify_candidates(&job, backend, hits, verifier.as_ref(), &stats);
                            verified.into_iter().for_each(&mut dispatch);
                        }
                        Submission::Stop => break,
                    }
                }
                log::debug!("result consumer stopped");
            })?;

        Ok(ResultConsumer {
            sender: sink.sender,
            handle: Some(handle),
        })
    }
}

/// Handle of the running consumer thread
pub struct ResultConsumer {
    sender: Sender<Submission>,
    handle: Option<JoinHandle<()>>,
}

impl ResultConsumer {
    /// Stops the consumer after it drained everything queued before the call
    pub fn stop(&mut self) {
        let _ = self.sender.send(Submission::Stop);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("result consumer panicked");
            }
        }
    }
}

impl Drop for ResultConsumer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Re-hashes GPU candidates on the CPU
///
/// A candidate is valid when the recomputed digest equals the device's
/// digest and meets the job target.
fn verify_candidates(
    job: &Job,
    backend: BackendType,
    hits: Vec<(u32, [u8; 32])>,
    verifier: Option<&Arc<dyn HasherFactory>>,
    stats: &ShareStats,
) -> Vec<JobResult> {
    let checked: Vec<(u32, [u8; 32], bool)> = match verifier {
        Some(factory) => hits
            .into_par_iter()
            .map_init(
                || prepared_hasher(factory.as_ref(), job),
                |hasher, (nonce, digest)| {
                    let valid = match hasher {
                        Some(hasher) => {
                            let mut blob = job.blob().to_vec();
                            job.write_nonce(&mut blob, nonce);
                            hasher.hash(&blob, nonce, job.height()) == digest
                        }
                        None => false,
                    };
                    (nonce, digest, valid && meets_target(&digest, job.target()))
                },
            )
            .collect(),
        None => hits
            .into_iter()
            .map(|(nonce, digest)| (nonce, digest, meets_target(&digest, job.target())))
            .collect(),
    };

    checked
        .into_iter()
        .filter_map(|(nonce, digest, valid)| {
            if valid {
                Some(JobResult::new(job, nonce, digest, backend))
            } else {
                stats.add_invalid();
                log::warn!(
                    "{} compute error: nonce {:08x} of job {} failed verification",
                    backend,
                    nonce,
                    job.id()
                );
                None
            }
        })
        .collect()
}

fn prepared_hasher(factory: &dyn HasherFactory, job: &Job) -> Option<Box<dyn Hasher>> {
    let mut hasher = match factory.create(0) {
        Ok(hasher) => hasher,
        Err(e) => {
            log::error!("cannot create verification hasher: {}", e);
            return None;
        }
    };
    match hasher.prepare(job) {
        Ok(()) => Some(hasher),
        Err(e) => {
            log::error!("cannot verify job {}: {}", job.id(), e);
            None
        }
    }
}
