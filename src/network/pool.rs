// src/network/pool.rs
//! Endpoint configuration
//!
//! A [`PoolConfig`] is loaded once and never mutated; each one backs exactly
//! one long-lived protocol client. [`Endpoint`] is the parsed connection
//! target derived from its URL.

use crate::types::AlgorithmType;
use crate::utils::error::MinerError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Keep-alive interval used when the endpoint advertises the extension but
/// the pool entry does not set one
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(60);

/// Time allowed for resolve + connect + TLS before the attempt is abandoned
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Time a request may stay unanswered
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(20);

/// Upper bound of the linear reconnect backoff multiplier
pub const DEFAULT_BACKOFF_CAP: u32 = 6;

/// Configuration for connecting to a mining pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool URL (e.g. "stratum+tcp://pool.example.com:3333", "wss://host/path"
    /// or a bare "host:port")
    pub url: String,
    /// Wallet address or pool username
    #[serde(default)]
    pub user: String,
    /// Worker password (often "x" if not required)
    #[serde(default = "default_password")]
    pub password: String,
    /// Rig identifier sent as `rigid` in the login request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rig_id: Option<String>,
    /// Algorithm to assume for jobs that do not name one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algo: Option<AlgorithmType>,
    /// Use TLS even when the URL scheme does not ask for it
    #[serde(default)]
    pub tls: bool,
    /// Keep-alive interval in seconds, 0 disables keep-alive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive: Option<u64>,
    /// Force NiceHash nonce handling
    #[serde(default)]
    pub nicehash: bool,
    /// Per-pool override of the global retry count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Per-pool override of the global retry pause in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_pause: Option<u64>,
    /// SOCKS5 proxy as "host:port"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socks5: Option<String>,
    /// Disabled entries are skipped when building strategies
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_password() -> String {
    "x".to_string()
}

fn default_true() -> bool {
    true
}

impl PoolConfig {
    /// Creates an entry with defaults for everything but URL and user
    pub fn new(url: impl Into<String>, user: impl Into<String>) -> Self {
        PoolConfig {
            url: url.into(),
            user: user.into(),
            password: default_password(),
            rig_id: None,
            algo: None,
            tls: false,
            keepalive: None,
            nicehash: false,
            retries: None,
            retry_pause: None,
            socks5: None,
            enabled: true,
        }
    }

    /// Parses the connection target
    pub fn endpoint(&self) -> Result<Endpoint, MinerError> {
        let mut endpoint = Endpoint::parse(&self.url)?;
        endpoint.tls |= self.tls;
        if let Some(proxy) = &self.socks5 {
            endpoint.proxy = Some(parse_host_port(proxy)?);
        }
        Ok(endpoint)
    }

    /// Checks the entry without connecting
    pub fn validate(&self) -> Result<(), MinerError> {
        self.endpoint()?;
        if self.user.is_empty() {
            return Err(MinerError::ConfigError(format!(
                "pool {} has no user",
                self.url
            )));
        }
        Ok(())
    }
}

/// Framing used on the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Newline-delimited JSON over a byte stream
    Tcp,
    /// One JSON document per WebSocket text frame
    WebSocket,
}

/// Parsed connection target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Wrap the connection in TLS
    pub tls: bool,
    /// Framing
    pub transport: TransportKind,
    /// Request path for WebSocket endpoints
    pub path: String,
    /// SOCKS5 proxy to tunnel through
    pub proxy: Option<(String, u16)>,
}

impl Endpoint {
    /// Parses a pool URL
    ///
    /// Accepts `stratum+tcp://`, `stratum+ssl://`, `tcp://`, `ssl://`,
    /// `ws://`, `wss://` and bare `host:port`.
    pub fn parse(url: &str) -> Result<Self, MinerError> {
        if !url.contains("://") {
            let (host, port) = parse_host_port(url)?;
            return Ok(Endpoint {
                host,
                port,
                tls: false,
                transport: TransportKind::Tcp,
                path: "/".into(),
                proxy: None,
            });
        }

        let parsed = Url::parse(url)?;
        let (transport, tls) = match parsed.scheme() {
            "stratum+tcp" | "tcp" => (TransportKind::Tcp, false),
            "stratum+ssl" | "stratum+tls" | "ssl" | "tls" => (TransportKind::Tcp, true),
            "ws" => (TransportKind::WebSocket, false),
            "wss" => (TransportKind::WebSocket, true),
            other => {
                return Err(MinerError::ConfigError(format!(
                    "unsupported scheme '{}' in {}",
                    other, url
                )));
            }
        };

        let host = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| MinerError::ConfigError(format!("no host in {}", url)))?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| MinerError::ConfigError(format!("no port in {}", url)))?;

        let mut path = parsed.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Endpoint {
            host,
            port,
            tls,
            transport,
            path,
            proxy: None,
        })
    }
}

fn parse_host_port(value: &str) -> Result<(String, u16), MinerError> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| MinerError::ConfigError(format!("expected host:port, got '{}'", value)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(MinerError::ConfigError(format!("no host in '{}'", value)));
    }
    let port = port
        .parse::<u16>()
        .map_err(|e| MinerError::ConfigError(format!("bad port in '{}': {}", value, e)))?;
    Ok((host.to_string(), port))
}

/// Global network settings shared by every client
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSettings {
    /// User agent sent at login
    pub agent: String,
    /// Consecutive failures tolerated before failing over
    pub retries: u32,
    /// Base reconnect pause
    pub retry_pause: Duration,
    /// Algorithms offered at login
    pub algorithms: Vec<AlgorithmType>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            agent: format!("xmr_core-rs/{}", env!("CARGO_PKG_VERSION")),
            retries: 5,
            retry_pause: Duration::from_secs(5),
            algorithms: vec![AlgorithmType::RandomX],
        }
    }
}

/// Effective settings of one protocol client
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// User agent sent at login
    pub agent: String,
    /// Algorithms offered at login
    pub algorithms: Vec<AlgorithmType>,
    /// Failures tolerated before a strategy moves on
    pub retries: u32,
    /// Base reconnect pause
    pub retry_pause: Duration,
    /// Backoff multiplier cap
    pub backoff_cap: u32,
    /// Resolve + connect + TLS budget
    pub connect_timeout: Duration,
    /// Request answer budget
    pub response_timeout: Duration,
}

impl ClientOptions {
    /// Merges global settings with the per-pool overrides
    pub fn for_pool(settings: &NetworkSettings, pool: &PoolConfig) -> Self {
        ClientOptions {
            agent: settings.agent.clone(),
            algorithms: settings.algorithms.clone(),
            retries: pool.retries.unwrap_or(settings.retries),
            retry_pause: pool
                .retry_pause
                .map(Duration::from_secs)
                .unwrap_or(settings.retry_pause),
            backoff_cap: DEFAULT_BACKOFF_CAP,
            connect_timeout: CONNECT_TIMEOUT,
            response_timeout: RESPONSE_TIMEOUT,
        }
    }

    /// Reconnect delay after `failures` consecutive failures
    ///
    /// Linear in `failures`, never below one second per step, never above
    /// `backoff_cap` steps.
    pub fn reconnect_delay(&self, failures: u32) -> Duration {
        let step = self.retry_pause.max(Duration::from_secs(1));
        step * failures.clamp(1, self.backoff_cap.max(1))
    }
}
