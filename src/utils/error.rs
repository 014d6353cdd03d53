// src/utils/error.rs
use crate::miner::results::Submission;
use std::io;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Main error type for the mining core
///
/// Only initialization and configuration paths return these to callers.
/// Runtime network failures are absorbed by the protocol client, which turns
/// them into reconnect attempts instead of propagating them.
#[derive(Error, Debug)]
pub enum MinerError {
    /// Errors related to mining algorithms (e.g., unsupported algorithm)
    #[error("Algorithm error: {0}")]
    AlgorithmError(String),

    /// Errors related to network connectivity
    #[error("Network connection error: {0}")]
    ConnectionError(String),

    /// Errors in protocol handling or invalid protocol messages
    #[error("Protocol violation: {0}")]
    ProtocolError(String),

    /// A hasher failed its known-answer test, the pool refuses to start
    #[error("Self-test failed: {0}")]
    SelfTestError(String),

    /// Standard I/O operation errors
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// URL parsing errors
    #[error("URL parse error: {0}")]
    UrlError(#[from] url::ParseError),

    /// WebSocket communication errors
    #[error("WebSocket error: {0}")]
    WsError(#[from] tungstenite::Error),

    /// Configuration file or parameter errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Thread communication channel errors
    #[error("Thread communication error: {0}")]
    ChannelError(String),

    /// Invalid user input or parameter errors
    #[error("Invalid input: {0}")]
    InputError(String),

    /// Worker or background task execution errors
    #[error("Task execution error: {0}")]
    TaskError(String),
}

/// Converts crossbeam channel send errors for submissions into MinerError
///
/// Raised when the result consumer has already shut down.
impl From<crossbeam_channel::SendError<Submission>> for MinerError {
    fn from(e: crossbeam_channel::SendError<Submission>) -> Self {
        MinerError::ChannelError(format!("Result send failed: {}", e))
    }
}

/// Converts hex decoding errors into MinerError
///
/// Used when an endpoint sends malformed blob, target or seed fields.
impl From<hex::FromHexError> for MinerError {
    fn from(e: hex::FromHexError) -> Self {
        MinerError::InputError(format!("Hex conversion failed: {}", e))
    }
}

/// Converts async task join errors into MinerError
impl From<tokio::task::JoinError> for MinerError {
    fn from(e: tokio::task::JoinError) -> Self {
        MinerError::TaskError(format!("Async task failed: {}", e))
    }
}
