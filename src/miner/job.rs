// src/miner/job.rs
//! Job and result value types
//!
//! A [`Job`] is built once by the protocol client and then shared read-only
//! by every worker. Workers never touch the job's blob: each one keeps a
//! private copy and writes nonces into that copy only.

use crate::types::{AlgorithmType, BackendType};
use crate::utils::error::MinerError;

/// Largest blob an endpoint may send
pub const MAX_BLOB_SIZE: usize = 408;

/// Smallest blob that still contains a nonce field
pub const MIN_BLOB_SIZE: usize = 76;

/// Largest seed (RandomX key) accepted from an endpoint
pub const MAX_SEED_SIZE: usize = 32;

/// Job index of work coming from the primary strategy
pub const PRIMARY_INDEX: u8 = 0;

/// Job index of work coming from the donation strategy
pub const DONATE_INDEX: u8 = 1;

/// Nonce bits an endpoint leaves to the miner in NiceHash mode
const NICEHASH_NONCE_MASK: u32 = 0x00FF_FFFF;

/// One unit of minable work issued by an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    id: String,
    algorithm: AlgorithmType,
    blob: Vec<u8>,
    target: u64,
    height: u64,
    seed: Vec<u8>,
    client_id: String,
    generation: u64,
    index: u8,
    nicehash: bool,
}

impl Job {
    /// Builds a job, validating blob size and target
    ///
    /// # Arguments
    /// * `id` - Endpoint-assigned job id
    /// * `algorithm` - Algorithm the blob must be hashed with
    /// * `blob` - Hashing blob (76..=408 bytes)
    /// * `target` - 64-bit threshold, a digest meets it when its last eight
    ///   bytes read as little-endian are below this value
    /// * `client_id` - Session id of the issuing endpoint connection
    pub fn new(
        id: impl Into<String>,
        algorithm: AlgorithmType,
        blob: Vec<u8>,
        target: u64,
        client_id: impl Into<String>,
    ) -> Result<Self, MinerError> {
        if blob.len() < MIN_BLOB_SIZE || blob.len() > MAX_BLOB_SIZE {
            return Err(MinerError::InputError(format!(
                "blob size {} out of range {}..={}",
                blob.len(),
                MIN_BLOB_SIZE,
                MAX_BLOB_SIZE
            )));
        }
        if target == 0 {
            return Err(MinerError::InputError("zero target".into()));
        }

        let offset = algorithm.nonce_offset() + algorithm.nonce_size() - 1;
        let nicehash = algorithm.nonce_size() == 4 && blob[offset] != 0;

        Ok(Job {
            id: id.into(),
            algorithm,
            blob,
            target,
            height: 0,
            seed: Vec::new(),
            client_id: client_id.into(),
            generation: 0,
            index: PRIMARY_INDEX,
            nicehash,
        })
    }

    /// Sets the block height
    pub fn with_height(mut self, height: u64) -> Self {
        self.height = height;
        self
    }

    /// Sets the algorithm seed (RandomX key)
    pub fn with_seed(mut self, seed: Vec<u8>) -> Result<Self, MinerError> {
        if seed.len() > MAX_SEED_SIZE {
            return Err(MinerError::InputError(format!(
                "seed size {} exceeds {}",
                seed.len(),
                MAX_SEED_SIZE
            )));
        }
        self.seed = seed;
        Ok(self)
    }

    /// Tags the job with the strategy it came from
    pub fn with_index(mut self, index: u8) -> Self {
        self.index = index;
        self
    }

    /// Forces NiceHash nonce handling on top of blob detection
    pub fn with_nicehash(mut self, nicehash: bool) -> Self {
        self.nicehash |= nicehash;
        self
    }

    /// Returns a copy stamped with the sequencer generation it was installed at
    pub fn with_generation(&self, generation: u64) -> Self {
        Job {
            generation,
            ..self.clone()
        }
    }

    /// Endpoint-assigned job id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Algorithm to hash with
    pub fn algorithm(&self) -> AlgorithmType {
        self.algorithm
    }

    /// Original blob as sent by the endpoint
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// 64-bit share target
    pub fn target(&self) -> u64 {
        self.target
    }

    /// Share difficulty implied by the target
    pub fn difficulty(&self) -> u64 {
        u64::MAX / self.target
    }

    /// Block height, 0 when the endpoint did not send one
    pub fn height(&self) -> u64 {
        self.height
    }

    /// Algorithm seed, empty when not applicable
    pub fn seed(&self) -> &[u8] {
        &self.seed
    }

    /// Session id of the connection that issued the job
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Sequencer generation the job was installed at (0 before install)
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 0 for primary work, 1 for donation work
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Whether only the low 24 nonce bits belong to the miner
    pub fn is_nicehash(&self) -> bool {
        self.nicehash
    }

    /// Number of distinct nonces the miner may try on this job
    pub fn nonce_space(&self) -> u64 {
        if self.nicehash {
            u64::from(NICEHASH_NONCE_MASK) + 1
        } else {
            u64::from(u32::MAX) + 1
        }
    }

    /// Maps a position in the nonce space onto a full nonce value
    ///
    /// In NiceHash mode the top byte assigned by the endpoint is preserved.
    pub fn compose_nonce(&self, position: u64) -> u32 {
        let position = position as u32;
        if self.nicehash {
            (self.nonce_prefix() & !NICEHASH_NONCE_MASK) | (position & NICEHASH_NONCE_MASK)
        } else {
            position
        }
    }

    /// Writes a nonce into a worker-owned copy of the blob
    ///
    /// Only the nonce sub-range is modified.
    pub fn write_nonce(&self, blob: &mut [u8], nonce: u32) {
        let offset = self.algorithm.nonce_offset();
        match self.algorithm.nonce_size() {
            8 => blob[offset..offset + 8].copy_from_slice(&u64::from(nonce).to_le_bytes()),
            _ => blob[offset..offset + 4].copy_from_slice(&nonce.to_le_bytes()),
        }
    }

    fn nonce_prefix(&self) -> u32 {
        let offset = self.algorithm.nonce_offset();
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.blob[offset..offset + 4]);
        u32::from_le_bytes(raw)
    }
}

/// Parses a hex target as sent in job notifications
///
/// Eight hex characters carry a compact 32-bit target which is expanded to
/// 64 bits, sixteen characters carry the 64-bit target directly. Both are
/// little-endian.
pub fn parse_target(hex_target: &str) -> Result<u64, MinerError> {
    let raw = hex::decode(hex_target)?;
    let target = match raw.len() {
        1..=4 => {
            let mut bytes = [0u8; 4];
            bytes[..raw.len()].copy_from_slice(&raw);
            let compact = u64::from(u32::from_le_bytes(bytes));
            if compact == 0 {
                0
            } else {
                u64::MAX / (u64::from(u32::MAX) / compact)
            }
        }
        5..=8 => {
            let mut bytes = [0u8; 8];
            bytes[..raw.len()].copy_from_slice(&raw);
            u64::from_le_bytes(bytes)
        }
        _ => {
            return Err(MinerError::InputError(format!(
                "target of {} bytes",
                raw.len()
            )));
        }
    };

    if target == 0 {
        return Err(MinerError::InputError("zero target".into()));
    }
    Ok(target)
}

/// Value of a digest as compared against a 64-bit target
pub fn digest_value(digest: &[u8; 32]) -> u64 {
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&digest[24..32]);
    u64::from_le_bytes(tail)
}

/// Whether a digest satisfies the target
pub fn meets_target(digest: &[u8; 32], target: u64) -> bool {
    digest_value(digest) < target
}

/// A candidate share produced by a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    /// Job the share belongs to
    pub job_id: String,
    /// Session id of the connection that issued the job
    pub client_id: String,
    /// 0 = primary strategy, 1 = donation strategy
    pub index: u8,
    /// Full nonce as written into the blob
    pub nonce: u32,
    /// Resulting digest
    pub digest: [u8; 32],
    /// Difficulty the digest actually reached
    pub difficulty: u64,
    /// Worker class that found it
    pub backend: BackendType,
    /// Algorithm of the job
    pub algorithm: AlgorithmType,
    /// Height of the job
    pub height: u64,
}

impl JobResult {
    /// Creates a result for `job` from a worker hit
    pub fn new(job: &Job, nonce: u32, digest: [u8; 32], backend: BackendType) -> Self {
        let value = digest_value(&digest);
        JobResult {
            job_id: job.id.clone(),
            client_id: job.client_id.clone(),
            index: job.index,
            nonce,
            digest,
            difficulty: if value == 0 { u64::MAX } else { u64::MAX / value },
            backend,
            algorithm: job.algorithm,
            height: job.height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_blob;

    #[test]
    fn test_compact_target_expands_to_64_bits() {
        // 0x00068db8 is the compact form most pools use for difficulty ~10k
        let target = parse_target("b88d0600").unwrap();
        assert_eq!(target, u64::MAX / (u64::from(u32::MAX) / 0x0006_8db8));
        let difficulty = u64::MAX / target;
        assert!((10_000..10_100).contains(&difficulty), "difficulty {}", difficulty);
    }

    #[test]
    fn test_wide_target_is_little_endian() {
        let target = parse_target("0000000000010000").unwrap();
        assert_eq!(target, 0x0000_0100_0000_0000);
    }

    #[test]
    fn test_zero_or_malformed_target_rejected() {
        assert!(parse_target("00000000").is_err());
        assert!(parse_target("zz").is_err());
        assert!(parse_target("000000000000000000").is_err());
    }

    #[test]
    fn test_blob_bounds() {
        let id = "job";
        assert!(Job::new(id, AlgorithmType::RandomX, vec![0; 75], 1, "c").is_err());
        assert!(Job::new(id, AlgorithmType::RandomX, vec![0; 409], 1, "c").is_err());
        assert!(Job::new(id, AlgorithmType::RandomX, vec![0; 408], 1, "c").is_ok());
        assert!(Job::new(id, AlgorithmType::RandomX, vec![0; 76], 0, "c").is_err());
    }

    #[test]
    fn test_write_nonce_only_touches_nonce_field() {
        let job = Job::new("j", AlgorithmType::RandomX, sample_blob(0xaa), 1, "c").unwrap();
        let mut copy = job.blob().to_vec();
        job.write_nonce(&mut copy, 0x0403_0201);

        assert_eq!(&copy[39..43], &[1, 2, 3, 4]);
        assert_eq!(&copy[..39], &job.blob()[..39]);
        assert_eq!(&copy[43..], &job.blob()[43..]);
        assert_eq!(job.blob()[39..43], [0, 0, 0, 0], "shared job must stay untouched");
    }

    #[test]
    fn test_nicehash_detected_from_reserved_byte() {
        let mut blob = sample_blob(0);
        blob[42] = 0x7f;
        let job = Job::new("j", AlgorithmType::RandomX, blob, 1, "c").unwrap();

        assert!(job.is_nicehash());
        assert_eq!(job.nonce_space(), 1 << 24);
        assert_eq!(job.compose_nonce(0x12_3456), 0x7f12_3456);
        // positions beyond 24 bits never leak into the reserved byte
        assert_eq!(job.compose_nonce(0xff12_3456), 0x7f12_3456);
    }

    #[test]
    fn test_forced_nicehash_keeps_prefix_zero() {
        let job = Job::new("j", AlgorithmType::RandomX, sample_blob(0), 1, "c")
            .unwrap()
            .with_nicehash(true);
        assert!(job.is_nicehash());
        assert_eq!(job.compose_nonce(0x0100_0001), 0x0000_0001);
    }

    #[test]
    fn test_result_difficulty_from_digest() {
        let job = Job::new("j", AlgorithmType::RandomX, sample_blob(0), 1000, "sess")
            .unwrap()
            .with_index(DONATE_INDEX)
            .with_height(7);
        let mut digest = [0xffu8; 32];
        digest[24..32].copy_from_slice(&500u64.to_le_bytes());

        let result = JobResult::new(&job, 9, digest, BackendType::Cpu);
        assert!(meets_target(&digest, job.target()));
        assert_eq!(result.difficulty, u64::MAX / 500);
        assert_eq!(result.index, DONATE_INDEX);
        assert_eq!(result.client_id, "sess");
        assert_eq!(result.height, 7);
    }
}
