// src/network/messages.rs
//! JSON-RPC wire types
//!
//! Requests are serialized from typed parameter structs. Inbound lines are
//! classified into notifications (carry a `method`) and responses (carry an
//! `id`) before their payload is interpreted.

use crate::miner::job::{Job, parse_target};
use crate::types::AlgorithmType;
use crate::utils::error::MinerError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Outbound JSON-RPC call
#[derive(Debug, Serialize)]
pub struct Request<P: Serialize> {
    /// Correlation id, unique per connection
    pub id: u64,
    /// Always `"2.0"`
    pub jsonrpc: &'static str,
    /// Method name
    pub method: &'static str,
    /// Method parameters
    pub params: P,
}

impl<P: Serialize> Request<P> {
    /// Builds a request
    pub fn new(id: u64, method: &'static str, params: P) -> Self {
        Request {
            id,
            jsonrpc: "2.0",
            method,
            params,
        }
    }

    /// Serializes to one line without the trailing newline
    pub fn to_line(&self) -> Result<String, MinerError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// `login` parameters
#[derive(Debug, Clone, Serialize)]
pub struct LoginParams {
    /// Wallet address or pool username
    pub login: String,
    /// Password, often `x`
    pub pass: String,
    /// User agent
    pub agent: String,
    /// Algorithms the miner can hash
    pub algo: Vec<String>,
    /// Rig identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rigid: Option<String>,
}

/// `submit` parameters
#[derive(Debug, Clone, Serialize)]
pub struct SubmitParams {
    /// Job the share belongs to
    pub id: String,
    /// Nonce as the hex of its little-endian bytes
    pub nonce: String,
    /// Full digest in hex
    pub result: String,
    /// Algorithm name, sent when the endpoint negotiated `algo`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algo: Option<String>,
}

/// `keepalived` parameters
#[derive(Debug, Clone, Serialize)]
pub struct KeepaliveParams {
    /// Session id returned by login
    pub id: String,
}

/// Error object of a JSON-RPC response
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RpcError {
    /// Endpoint error code
    #[serde(default)]
    pub code: i64,
    /// Human readable reason
    #[serde(default)]
    pub message: String,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Classified inbound line
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Server-initiated call such as `job`
    Notification {
        /// Method name
        method: String,
        /// Raw parameters
        params: Value,
    },
    /// Answer to one of our requests
    Response {
        /// Correlation id of the request
        id: u64,
        /// `result` or `error` payload
        outcome: Result<Value, RpcError>,
    },
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Value,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Value,
}

/// Parses and classifies one inbound line
pub fn parse_line(line: &str) -> Result<Message, MinerError> {
    let raw: RawMessage = serde_json::from_str(line)?;

    if let Some(method) = raw.method {
        return Ok(Message::Notification {
            method,
            params: raw.params,
        });
    }

    let id = raw
        .id
        .as_u64()
        .ok_or_else(|| MinerError::ProtocolError(format!("message without method or id: {}", line)))?;

    let outcome = if raw.error.is_null() {
        Ok(raw.result)
    } else {
        Err(match serde_json::from_value::<RpcError>(raw.error.clone()) {
            Ok(error) => error,
            Err(_) => RpcError {
                code: -1,
                message: raw.error.to_string(),
            },
        })
    };
    Ok(Message::Response { id, outcome })
}

/// Payload of a `job` notification or of the job embedded in a login result
#[derive(Debug, Clone, Deserialize)]
pub struct JobParams {
    /// Job id
    #[serde(default)]
    pub job_id: Option<String>,
    /// Some endpoints send the job id as `id`
    #[serde(default)]
    pub id: Option<String>,
    /// Hashing blob in hex
    pub blob: String,
    /// Compact or full target in hex
    pub target: String,
    /// Algorithm name, when the endpoint negotiates algorithms
    #[serde(default)]
    pub algo: Option<String>,
    /// Block height
    #[serde(default)]
    pub height: Option<u64>,
    /// RandomX seed in hex
    #[serde(default)]
    pub seed_hash: Option<String>,
}

impl JobParams {
    /// Builds a validated [`Job`]
    ///
    /// # Arguments
    /// * `client_id` - Session id of the issuing connection
    /// * `default_algo` - Algorithm to assume when the job names none
    /// * `nicehash` - Force NiceHash nonce handling
    pub fn into_job(
        self,
        client_id: &str,
        default_algo: AlgorithmType,
        nicehash: bool,
    ) -> Result<Job, MinerError> {
        let id = self
            .job_id
            .or(self.id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| MinerError::ProtocolError("job without id".into()))?;

        let algorithm = match self.algo.as_deref() {
            Some(name) => AlgorithmType::from_str(name).map_err(MinerError::ProtocolError)?,
            None => default_algo,
        };

        let blob = hex::decode(&self.blob)?;
        let target = parse_target(&self.target)?;
        let seed = match &self.seed_hash {
            Some(seed) => hex::decode(seed)?,
            None => Vec::new(),
        };

        Job::new(id, algorithm, blob, target, client_id)?
            .with_height(self.height.unwrap_or(0))
            .with_seed(seed)
            .map(|job| job.with_nicehash(nicehash))
    }
}

/// `login` result
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResult {
    /// Session id, required for submits
    pub id: String,
    /// Initial job
    #[serde(default)]
    pub job: Option<JobParams>,
    /// Protocol extensions the endpoint supports
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Status string, `OK` on success
    #[serde(default)]
    pub status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_login_request_shape() {
        let params = LoginParams {
            login: "wallet".into(),
            pass: "x".into(),
            agent: "xmr_core-rs/0.1.0".into(),
            algo: vec!["rx/0".into()],
            rigid: None,
        };
        let line = Request::new(1, "login", params).to_line().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();

        assert_eq!(
            value,
            json!({
                "id": 1,
                "jsonrpc": "2.0",
                "method": "login",
                "params": {"login": "wallet", "pass": "x", "agent": "xmr_core-rs/0.1.0", "algo": ["rx/0"]}
            })
        );
    }

    #[test]
    fn test_submit_request_carries_job_id() {
        let params = SubmitParams {
            id: "job-42".into(),
            nonce: "01020304".into(),
            result: "ab".repeat(32),
            algo: None,
        };
        let line = Request::new(2, "submit", params).to_line().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();

        assert_eq!(
            value,
            json!({
                "id": 2,
                "jsonrpc": "2.0",
                "method": "submit",
                "params": {"id": "job-42", "nonce": "01020304", "result": "ab".repeat(32)}
            })
        );
    }

    #[test]
    fn test_notification_and_response_classified() {
        let job = parse_line(r#"{"jsonrpc":"2.0","method":"job","params":{"job_id":"7"}}"#).unwrap();
        assert!(matches!(job, Message::Notification { ref method, .. } if method == "job"));

        let ok = parse_line(r#"{"id":4,"jsonrpc":"2.0","error":null,"result":{"status":"OK"}}"#)
            .unwrap();
        assert_eq!(
            ok,
            Message::Response {
                id: 4,
                outcome: Ok(json!({"status": "OK"}))
            }
        );

        let rejected =
            parse_line(r#"{"id":5,"error":{"code":-1,"message":"Low difficulty share"}}"#).unwrap();
        match rejected {
            Message::Response { id: 5, outcome: Err(error) } => {
                assert_eq!(error.message, "Low difficulty share")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_lines_rejected() {
        assert!(parse_line("not json").is_err());
        assert!(parse_line(r#"{"result":true}"#).is_err());
        assert!(parse_line(r#"{"id":"abc","result":true}"#).is_err());
    }

    #[test]
    fn test_job_params_into_job() {
        let params: JobParams = serde_json::from_value(json!({
            "job_id": "j1",
            "blob": hex::encode(crate::test_support::sample_blob(1)),
            "target": "b88d0600",
            "algo": "rx/0",
            "height": 3000000,
            "seed_hash": "00".repeat(32)
        }))
        .unwrap();
        let job = params.into_job("sess", AlgorithmType::RandomX, false).unwrap();

        assert_eq!(job.id(), "j1");
        assert_eq!(job.client_id(), "sess");
        assert_eq!(job.height(), 3_000_000);
        assert_eq!(job.seed().len(), 32);
        assert!((10_000..10_100).contains(&job.difficulty()));
    }

    #[test]
    fn test_job_with_unknown_algorithm_rejected() {
        let params: JobParams = serde_json::from_value(json!({
            "job_id": "j1",
            "blob": hex::encode(crate::test_support::sample_blob(1)),
            "target": "b88d0600",
            "algo": "kawpow"
        }))
        .unwrap();
        assert!(params.into_job("sess", AlgorithmType::RandomX, false).is_err());
    }
}
