// src/types.rs
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Proof-of-work algorithms understood by the protocol layer
///
/// The enum covers every algorithm name an endpoint may negotiate. Whether
/// a job can actually be mined depends on the hasher backends registered
/// with the coordinator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AlgorithmType {
    /// RandomX (Monero, `rx/0`)
    #[value(name = "rx/0", alias = "randomx")]
    RandomX,

    /// RandomWOW (Wownero, `rx/wow`)
    #[value(name = "rx/wow")]
    RandomWow,

    /// CryptoNight variant 1 (legacy, `cn/1`)
    #[value(name = "cn/1", alias = "cryptonight-v7")]
    CryptoNightV7,

    /// CryptoNight-R (legacy, `cn/r`)
    #[value(name = "cn/r", alias = "cryptonight-r")]
    CryptoNightR,
}

impl AlgorithmType {
    /// Canonical wire name used in login and submit requests
    pub fn name(&self) -> &'static str {
        match self {
            AlgorithmType::RandomX => "rx/0",
            AlgorithmType::RandomWow => "rx/wow",
            AlgorithmType::CryptoNightV7 => "cn/1",
            AlgorithmType::CryptoNightR => "cn/r",
        }
    }

    /// Byte offset of the nonce field inside a job blob
    ///
    /// Every CryptoNote-family algorithm keeps its 4-byte nonce right after
    /// the major/minor version, timestamp and previous block hash.
    pub fn nonce_offset(&self) -> usize {
        39
    }

    /// Width of the nonce field in bytes
    pub fn nonce_size(&self) -> usize {
        4
    }
}

impl fmt::Display for AlgorithmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AlgorithmType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rx/0" | "randomx" | "rx" => Ok(AlgorithmType::RandomX),
            "rx/wow" | "randomwow" => Ok(AlgorithmType::RandomWow),
            "cn/1" | "cnv7" | "cryptonight-v7" => Ok(AlgorithmType::CryptoNightV7),
            "cn/r" | "cnr" | "cryptonight-r" => Ok(AlgorithmType::CryptoNightR),
            _ => Err(format!("Unknown algorithm: {}", s)),
        }
    }
}

impl TryFrom<String> for AlgorithmType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AlgorithmType> for String {
    fn from(value: AlgorithmType) -> Self {
        value.name().to_string()
    }
}

/// Worker classes, each with its own generation counter and job slot
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BackendType {
    /// CPU worker threads
    Cpu,
    /// NVIDIA CUDA devices
    Cuda,
    /// OpenCL devices
    OpenCl,
}

impl BackendType {
    /// Number of worker classes
    pub const COUNT: usize = 3;

    /// All worker classes in counter order
    pub const ALL: [BackendType; BackendType::COUNT] =
        [BackendType::Cpu, BackendType::Cuda, BackendType::OpenCl];

    /// Index of this class in per-class tables
    pub fn index(&self) -> usize {
        match self {
            BackendType::Cpu => 0,
            BackendType::Cuda => 1,
            BackendType::OpenCl => 2,
        }
    }

    /// GPU results are re-verified on the CPU before submission
    pub fn is_gpu(&self) -> bool {
        !matches!(self, BackendType::Cpu)
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendType::Cpu => write!(f, "cpu"),
            BackendType::Cuda => write!(f, "cuda"),
            BackendType::OpenCl => write!(f, "opencl"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_aliases() {
        assert_eq!("randomx".parse::<AlgorithmType>(), Ok(AlgorithmType::RandomX));
        assert_eq!("RX/0".parse::<AlgorithmType>(), Ok(AlgorithmType::RandomX));
        assert_eq!("cnr".parse::<AlgorithmType>(), Ok(AlgorithmType::CryptoNightR));
        assert!("kawpow".parse::<AlgorithmType>().is_err());
    }

    #[test]
    fn test_algorithm_serde_uses_wire_names() {
        let json = serde_json::to_string(&AlgorithmType::RandomWow).unwrap();
        assert_eq!(json, "\"rx/wow\"");
        let back: AlgorithmType = serde_json::from_str("\"cryptonight-v7\"").unwrap();
        assert_eq!(back, AlgorithmType::CryptoNightV7);
    }

    #[test]
    fn test_backend_indices_are_dense() {
        for (i, backend) in BackendType::ALL.iter().enumerate() {
            assert_eq!(backend.index(), i);
        }
        assert!(!BackendType::Cpu.is_gpu());
        assert!(BackendType::OpenCl.is_gpu());
    }
}
