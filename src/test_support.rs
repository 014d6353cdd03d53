// src/test_support.rs
//! Shared fixtures for unit tests

use crate::miner::algorithm::{Hasher, HasherFactory};
use crate::miner::job::Job;
use crate::network::client::{IoAction, IoCommand, IoEvent};
use crate::types::{AlgorithmType, BackendType};
use crate::utils::error::MinerError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A minimal 76-byte blob; `marker` lands in byte 0 so tests can tell jobs
/// apart from inside a hasher
pub fn sample_blob(marker: u8) -> Vec<u8> {
    let mut blob = vec![0u8; 76];
    blob[0] = marker;
    blob[75] = 0x5a;
    blob
}

/// A RandomX job with difficulty 1000 issued by `session-0`
pub fn make_job(id: &str, marker: u8) -> Job {
    Job::new(
        id,
        AlgorithmType::RandomX,
        sample_blob(marker),
        u64::MAX / 1000,
        "session-0",
    )
    .expect("valid job")
}

/// Builds [`StubHasher`]s; every knob is shared with the hashers it built
#[derive(Clone)]
pub struct StubFactory {
    backend: BackendType,
    hits: Arc<HashSet<u32>>,
    fail_self_test: Option<usize>,
    panic_worker: Option<usize>,
    delay: Option<Duration>,
    blob_counts: Arc<Mutex<HashMap<u8, u64>>>,
    nonces: Arc<Mutex<Vec<u32>>>,
}

impl Default for StubFactory {
    fn default() -> Self {
        StubFactory {
            backend: BackendType::Cpu,
            hits: Arc::new(HashSet::new()),
            fail_self_test: None,
            panic_worker: None,
            delay: None,
            blob_counts: Arc::new(Mutex::new(HashMap::new())),
            nonces: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl StubFactory {
    /// Hashers that return an all-zero digest exactly for `hits`
    pub fn with_hits(hits: impl IntoIterator<Item = u32>) -> Self {
        StubFactory {
            hits: Arc::new(hits.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn fail_self_test_for(mut self, worker_id: usize) -> Self {
        self.fail_self_test = Some(worker_id);
        self
    }

    /// The hasher of `worker_id` panics on its first hash
    pub fn panic_on(mut self, worker_id: usize) -> Self {
        self.panic_worker = Some(worker_id);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = backend;
        self
    }

    /// Hash counts keyed by blob[0]
    pub fn blob_counts(&self) -> Arc<Mutex<HashMap<u8, u64>>> {
        self.blob_counts.clone()
    }

    /// Every nonce hashed, in completion order
    pub fn nonce_log(&self) -> Arc<Mutex<Vec<u32>>> {
        self.nonces.clone()
    }
}

impl HasherFactory for StubFactory {
    fn backend(&self) -> BackendType {
        self.backend
    }

    fn algorithms(&self) -> Vec<AlgorithmType> {
        vec![AlgorithmType::RandomX]
    }

    fn create(&self, worker_id: usize) -> Result<Box<dyn Hasher>, MinerError> {
        Ok(Box::new(StubHasher {
            hits: self.hits.clone(),
            self_test_passes: self.fail_self_test != Some(worker_id),
            panics: self.panic_worker == Some(worker_id),
            delay: self.delay,
            blob_counts: Some(self.blob_counts.clone()),
            nonces: Some(self.nonces.clone()),
        }))
    }
}

/// Deterministic hasher: `[0; 32]` for hit nonces, `[0xff; 32]` otherwise
pub struct StubHasher {
    hits: Arc<HashSet<u32>>,
    self_test_passes: bool,
    panics: bool,
    delay: Option<Duration>,
    blob_counts: Option<Arc<Mutex<HashMap<u8, u64>>>>,
    nonces: Option<Arc<Mutex<Vec<u32>>>>,
}

impl StubHasher {
    pub fn with_hits(hits: impl IntoIterator<Item = u32>) -> Self {
        StubHasher {
            hits: Arc::new(hits.into_iter().collect()),
            self_test_passes: true,
            panics: false,
            delay: None,
            blob_counts: None,
            nonces: None,
        }
    }

    pub fn failing_self_test() -> Self {
        StubHasher {
            self_test_passes: false,
            ..Self::with_hits([])
        }
    }
}

impl Hasher for StubHasher {
    fn self_test(&mut self) -> bool {
        self.self_test_passes
    }

    fn hash(&mut self, blob: &[u8], nonce: u32, _height: u64) -> [u8; 32] {
        if self.panics {
            panic!("stub kernel fault");
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if let Some(counts) = &self.blob_counts {
            *counts.lock().unwrap().entry(blob[0]).or_insert(0) += 1;
        }
        if let Some(nonces) = &self.nonces {
            nonces.lock().unwrap().push(nonce);
        }
        if self.hits.contains(&nonce) {
            [0u8; 32]
        } else {
            [0xffu8; 32]
        }
    }
}

/// Scripted endpoint for driving protocol clients without sockets
///
/// Every client resolves to 127.0.0.1:3333. Connects succeed unless a
/// refusal budget is set for the client; logins succeed with session
/// `session-{client}` and a job unless the client is set to reject login.
#[derive(Debug, Default)]
pub struct MockIo {
    refusals: HashMap<usize, u32>,
    login_errors: HashSet<usize>,
    connects: HashMap<usize, u32>,
    sent: Vec<(usize, serde_json::Value)>,
    jobs: u32,
}

impl MockIo {
    /// Refuses the next `times` connects of `client`
    pub fn refuse(mut self, client: usize, times: u32) -> Self {
        self.set_refusals(client, times);
        self
    }

    /// Rejects every login of `client`
    pub fn reject_login(mut self, client: usize) -> Self {
        self.login_errors.insert(client);
        self
    }

    pub fn set_refusals(&mut self, client: usize, times: u32) {
        self.refusals.insert(client, times);
    }

    /// Connect attempts seen for `client`
    pub fn connects(&self, client: usize) -> u32 {
        self.connects.get(&client).copied().unwrap_or(0)
    }

    /// Submit requests seen for `client`
    pub fn submits(&self, client: usize) -> usize {
        self.sent
            .iter()
            .filter(|(id, request)| *id == client && request["method"] == "submit")
            .count()
    }

    /// Answers one batch of commands
    pub fn respond(&mut self, commands: Vec<IoCommand>) -> Vec<(usize, u64, IoEvent)> {
        let mut replies = Vec::new();
        for IoCommand {
            client,
            epoch,
            action,
        } in commands
        {
            let event = match action {
                IoAction::Resolve { .. } => {
                    IoEvent::Resolved(Ok(vec!["127.0.0.1:3333".parse().unwrap()]))
                }
                IoAction::Connect { .. } => {
                    *self.connects.entry(client).or_insert(0) += 1;
                    match self.refusals.get_mut(&client) {
                        Some(left) if *left > 0 => {
                            *left -= 1;
                            IoEvent::Connected(Err("connection refused".into()))
                        }
                        _ => IoEvent::Connected(Ok(())),
                    }
                }
                IoAction::StartTls => IoEvent::TlsReady(Err("no TLS in tests".into())),
                IoAction::Send(line) => match self.answer(client, &line) {
                    Some(reply) => IoEvent::Line(reply),
                    None => continue,
                },
                IoAction::Close => continue,
            };
            replies.push((client, epoch, event));
        }
        replies
    }

    fn answer(&mut self, client: usize, line: &str) -> Option<String> {
        let request: serde_json::Value = serde_json::from_str(line).unwrap();
        let id = request["id"].clone();
        let method = request["method"].as_str().unwrap_or_default().to_string();
        self.sent.push((client, request));

        let reply = match method.as_str() {
            "login" if self.login_errors.contains(&client) => serde_json::json!({
                "id": id, "jsonrpc": "2.0",
                "error": {"code": -1, "message": "Invalid address"}
            }),
            "login" => {
                self.jobs += 1;
                serde_json::json!({
                    "id": id, "jsonrpc": "2.0", "error": null,
                    "result": {
                        "id": format!("session-{}", client),
                        "job": {
                            "job_id": format!("job-{}", self.jobs),
                            "blob": hex::encode(sample_blob(client as u8)),
                            "target": "b88d0600",
                            "algo": "rx/0",
                            "height": 100,
                            "seed_hash": "00".repeat(32)
                        },
                        "extensions": ["algo", "keepalive"],
                        "status": "OK"
                    }
                })
            }
            "submit" | "keepalived" => serde_json::json!({
                "id": id, "jsonrpc": "2.0", "error": null,
                "result": {"status": "OK"}
            }),
            _ => return None,
        };
        Some(reply.to_string())
    }
}
