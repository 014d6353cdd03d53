// src/network/client.rs
//! Protocol client state machine
//!
//! The client performs no IO itself. Every operation appends [`IoCommand`]s
//! for the IO driver and [`ClientEvent`]s for the owning strategy; the driver
//! feeds outcomes back through [`Client::handle_io`]. Each connection attempt
//! gets a fresh epoch and IO events carrying an older epoch are dropped, so a
//! socket that was given up on can never disturb its successor.
//!
//! Time never advances on its own: callers pass `now` into every method,
//! which keeps all timeouts testable with a synthetic clock.

use crate::miner::job::{Job, JobResult, PRIMARY_INDEX};
use crate::network::messages::{
    JobParams, KeepaliveParams, LoginParams, LoginResult, Message, Request, RpcError,
    SubmitParams, parse_line,
};
use crate::network::pool::{ClientOptions, DEFAULT_KEEPALIVE, Endpoint, PoolConfig};
use crate::types::AlgorithmType;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Longest inbound line accepted before the connection is dropped
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Submissions remembered for duplicate suppression
const RECENT_SUBMISSIONS: usize = 256;

/// Submit errors after which the endpoint will not accept anything else
const CRITICAL_ERRORS: [&str; 3] = [
    "Unauthenticated",
    "your IP is banned",
    "IP Address currently banned",
];

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Idle, not trying to connect
    Unconnected,
    /// Waiting for DNS
    Resolving,
    /// Waiting for the transport connection
    Connecting,
    /// Waiting for the TLS handshake
    TlsHandshake,
    /// Login sent, waiting for its response
    Authenticating,
    /// Logged in, receiving jobs
    Connected,
    /// Shutting the socket down
    Closing,
    /// Waiting out the reconnect delay
    Reconnecting,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Unconnected => "unconnected",
            ClientState::Resolving => "resolving",
            ClientState::Connecting => "connecting",
            ClientState::TlsHandshake => "tls-handshake",
            ClientState::Authenticating => "authenticating",
            ClientState::Connected => "connected",
            ClientState::Closing => "closing",
            ClientState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// IO the driver must perform for a client
#[derive(Debug, Clone, PartialEq)]
pub enum IoAction {
    /// Resolve a host name
    Resolve {
        /// Host to resolve (the proxy when one is configured)
        host: String,
        /// Port to attach to the results
        port: u16,
    },
    /// Open the transport connection
    Connect {
        /// Resolved candidates, tried in order
        addrs: Vec<SocketAddr>,
        /// Target, including framing and proxy settings
        endpoint: Endpoint,
    },
    /// Upgrade the open connection to TLS
    StartTls,
    /// Write one JSON line
    Send(String),
    /// Close the connection of this epoch
    Close,
}

/// An [`IoAction`] addressed to one client connection
#[derive(Debug, Clone, PartialEq)]
pub struct IoCommand {
    /// Client id
    pub client: usize,
    /// Connection epoch the action belongs to
    pub epoch: u64,
    /// What to do
    pub action: IoAction,
}

/// Outcome of an [`IoAction`], or inbound data
#[derive(Debug, Clone, PartialEq)]
pub enum IoEvent {
    /// DNS finished
    Resolved(Result<Vec<SocketAddr>, String>),
    /// Transport connect finished
    Connected(Result<(), String>),
    /// TLS handshake finished
    TlsReady(Result<(), String>),
    /// One inbound line without its terminator
    Line(String),
    /// The peer or the transport closed the connection
    Closed(Option<String>),
}

/// Notifications for the owning strategy
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Login accepted, the client is now `Connected`
    LoginSuccess,
    /// New job from the endpoint
    Job(Job),
    /// Connection lost or attempt failed; the client will retry by itself
    Closed {
        /// Consecutive failures including this one
        failures: u32,
    },
    /// A submit was answered, rejected or timed out
    ResultAccepted {
        /// The submitted result
        result: JobResult,
        /// Rejection reason, `None` when accepted
        error: Option<String>,
        /// Time between submit and answer
        latency: Duration,
    },
}

#[derive(Debug)]
enum RequestKind {
    Login,
    Submit(JobResult),
    Keepalive,
}

#[derive(Debug)]
struct PendingRequest {
    issued: Instant,
    kind: RequestKind,
}

#[derive(Debug, Default, Clone, Copy)]
struct Extensions {
    algo: bool,
    nicehash: bool,
    keepalive: bool,
}

/// One endpoint connection
pub struct Client {
    id: usize,
    pool: PoolConfig,
    endpoint: Result<Endpoint, String>,
    options: ClientOptions,
    index: u8,

    state: ClientState,
    epoch: u64,
    failures: u32,
    sequence: u64,
    deadline: Option<Instant>,
    last_send: Option<Instant>,
    last_error: Option<String>,

    session: Option<String>,
    job: Option<Job>,
    extensions: Extensions,
    pending: BTreeMap<u64, PendingRequest>,
    recent: VecDeque<(String, u32)>,
    recent_set: HashSet<(String, u32)>,

    commands: Vec<IoCommand>,
    events: Vec<ClientEvent>,
}

impl Client {
    /// Creates an unconnected client
    ///
    /// # Arguments
    /// * `id` - Unique id, used to route IO events back to this client
    /// * `pool` - Endpoint configuration
    /// * `options` - Effective timeouts and retry settings
    pub fn new(id: usize, pool: PoolConfig, options: ClientOptions) -> Self {
        let endpoint = pool.endpoint().map_err(|e| e.to_string());
        Client {
            id,
            pool,
            endpoint,
            options,
            index: PRIMARY_INDEX,
            state: ClientState::Unconnected,
            epoch: 0,
            failures: 0,
            sequence: 0,
            deadline: None,
            last_send: None,
            last_error: None,
            session: None,
            job: None,
            extensions: Extensions::default(),
            pending: BTreeMap::new(),
            recent: VecDeque::new(),
            recent_set: HashSet::new(),
            commands: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Tags every job from this client with `index`
    pub fn with_index(mut self, index: u8) -> Self {
        self.index = index;
        self
    }

    /// Client id
    pub fn id(&self) -> usize {
        self.id
    }

    /// Endpoint configuration
    pub fn pool(&self) -> &PoolConfig {
        &self.pool
    }

    /// Current lifecycle state
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Whether the client is logged in
    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    /// Consecutive failures since the last successful login
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Failures tolerated before a strategy should move on
    pub fn retries(&self) -> u32 {
        self.options.retries
    }

    /// Session id of the current login
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Most recent job of the current session
    pub fn current_job(&self) -> Option<&Job> {
        self.job.as_ref()
    }

    /// Text of the most recent failure
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Current connection epoch
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Takes the IO the driver must perform
    pub fn drain_commands(&mut self) -> Vec<IoCommand> {
        std::mem::take(&mut self.commands)
    }

    /// Takes the notifications for the strategy
    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.events)
    }

    /// Starts a connection attempt
    ///
    /// Does nothing when an attempt or a session is already in progress.
    pub fn connect(&mut self, now: Instant) {
        if !matches!(
            self.state,
            ClientState::Unconnected | ClientState::Reconnecting
        ) {
            return;
        }

        let endpoint = match &self.endpoint {
            Ok(endpoint) => endpoint.clone(),
            Err(e) => {
                let reason = format!("invalid pool url: {}", e);
                self.state = ClientState::Resolving;
                self.fail(reason, now);
                return;
            }
        };

        self.epoch += 1;
        self.state = ClientState::Resolving;
        self.deadline = Some(now + self.options.connect_timeout);
        let (host, port) = endpoint
            .proxy
            .clone()
            .unwrap_or_else(|| (endpoint.host.clone(), endpoint.port));
        log::debug!("[{}] resolving {}:{}", self.pool.url, host, port);
        self.push(IoAction::Resolve { host, port });
    }

    /// Drops the connection without emitting a close event or retrying
    pub fn disconnect(&mut self) {
        if self.has_socket() {
            self.push(IoAction::Close);
        }
        if self.state != ClientState::Unconnected {
            log::debug!("[{}] disconnected", self.pool.url);
        }
        self.epoch += 1;
        self.state = ClientState::Unconnected;
        self.failures = 0;
        self.deadline = None;
        self.session = None;
        self.job = None;
        self.pending.clear();
    }

    /// Sends a result to the endpoint
    ///
    /// # Returns
    /// The request id, or `None` when the client is not logged in, the
    /// result belongs to another session, or it was already submitted
    pub fn submit(&mut self, result: JobResult, now: Instant) -> Option<u64> {
        if self.state != ClientState::Connected {
            log::debug!(
                "[{}] not connected, dropping result for job {}",
                self.pool.url,
                result.job_id
            );
            return None;
        }
        let session = self.session.clone()?;
        if result.client_id != session {
            log::debug!(
                "[{}] result for job {} belongs to session {}, dropping",
                self.pool.url,
                result.job_id,
                result.client_id
            );
            return None;
        }

        let key = (result.job_id.clone(), result.nonce);
        if self.recent_set.contains(&key) {
            log::debug!(
                "[{}] duplicate result {:08x} for job {}",
                self.pool.url,
                result.nonce,
                result.job_id
            );
            return None;
        }
        self.remember(key);

        let params = SubmitParams {
            id: result.job_id.clone(),
            nonce: hex::encode(result.nonce.to_le_bytes()),
            result: hex::encode(result.digest),
            algo: self
                .extensions
                .algo
                .then(|| result.algorithm.name().to_string()),
        };
        let id = self.next_id();
        let line = match Request::new(id, "submit", params).to_line() {
            Ok(line) => line,
            Err(e) => {
                log::error!("[{}] cannot encode submit: {}", self.pool.url, e);
                return None;
            }
        };
        self.send(line, now);
        self.pending.insert(
            id,
            PendingRequest {
                issued: now,
                kind: RequestKind::Submit(result),
            },
        );
        Some(id)
    }

    /// Periodic housekeeping: timeouts, keep-alive and reconnects
    pub fn tick(&mut self, now: Instant) {
        match self.state {
            ClientState::Resolving | ClientState::Connecting | ClientState::TlsHandshake => {
                if self.deadline.is_some_and(|deadline| now >= deadline) {
                    self.fail("connect timeout".into(), now);
                }
            }
            ClientState::Authenticating | ClientState::Connected => {
                self.sweep_pending(now);
                if self.state == ClientState::Connected {
                    self.keepalive(now);
                }
            }
            ClientState::Reconnecting => {
                if self.deadline.is_some_and(|deadline| now >= deadline) {
                    self.connect(now);
                }
            }
            ClientState::Unconnected | ClientState::Closing => {}
        }
    }

    /// Feeds back the outcome of an IO action
    pub fn handle_io(&mut self, epoch: u64, event: IoEvent, now: Instant) {
        if epoch != self.epoch {
            log::trace!(
                "[{}] ignoring {:?} from stale epoch {}",
                self.pool.url,
                event,
                epoch
            );
            return;
        }

        match (self.state, event) {
            (ClientState::Resolving, IoEvent::Resolved(Ok(addrs))) => {
                if addrs.is_empty() {
                    self.fail("DNS returned no addresses".into(), now);
                    return;
                }
                let Ok(endpoint) = self.endpoint.clone() else {
                    return;
                };
                self.state = ClientState::Connecting;
                self.push(IoAction::Connect { addrs, endpoint });
            }
            (ClientState::Resolving, IoEvent::Resolved(Err(e))) => {
                self.fail(format!("DNS error: {}", e), now);
            }
            (ClientState::Connecting, IoEvent::Connected(Ok(()))) => {
                if self.endpoint.as_ref().is_ok_and(|endpoint| endpoint.tls) {
                    self.state = ClientState::TlsHandshake;
                    self.push(IoAction::StartTls);
                } else {
                    self.login(now);
                }
            }
            (ClientState::Connecting, IoEvent::Connected(Err(e))) => {
                self.fail(format!("connect error: {}", e), now);
            }
            (ClientState::TlsHandshake, IoEvent::TlsReady(Ok(()))) => self.login(now),
            (ClientState::TlsHandshake, IoEvent::TlsReady(Err(e))) => {
                self.fail(format!("TLS error: {}", e), now);
            }
            (ClientState::Authenticating | ClientState::Connected, IoEvent::Line(line)) => {
                self.handle_line(&line, now);
            }
            (_, IoEvent::Closed(reason)) if self.has_socket() => {
                self.fail(reason.unwrap_or_else(|| "connection closed".into()), now);
            }
            (state, event) => {
                log::debug!(
                    "[{}] unexpected {:?} while {}",
                    self.pool.url,
                    event,
                    state
                );
            }
        }
    }

    fn handle_line(&mut self, line: &str, now: Instant) {
        if line.len() > MAX_LINE_LENGTH {
            self.fail(format!("line of {} bytes exceeds limit", line.len()), now);
            return;
        }
        if line.trim().is_empty() {
            return;
        }

        match parse_line(line) {
            Ok(Message::Notification { method, params }) => {
                if method == "job" && self.state == ClientState::Connected {
                    self.handle_job(params, now);
                } else {
                    log::debug!("[{}] unsupported method {}", self.pool.url, method);
                }
            }
            Ok(Message::Response { id, outcome }) => self.handle_response(id, outcome, now),
            Err(e) => self.fail(format!("invalid message: {}", e), now),
        }
    }

    fn handle_response(&mut self, id: u64, outcome: Result<Value, RpcError>, now: Instant) {
        let Some(request) = self.pending.remove(&id) else {
            log::debug!("[{}] dropping unmatched response {}", self.pool.url, id);
            return;
        };
        let latency = now.saturating_duration_since(request.issued);

        match request.kind {
            RequestKind::Login => self.handle_login(outcome, now),
            RequestKind::Submit(result) => {
                let error = outcome.err().map(|e| e.message);
                let critical = error
                    .as_deref()
                    .is_some_and(|message| CRITICAL_ERRORS.iter().any(|c| message.contains(c)));
                self.events.push(ClientEvent::ResultAccepted {
                    result,
                    error: error.clone(),
                    latency,
                });
                if critical {
                    self.fail(error.unwrap_or_default(), now);
                }
            }
            RequestKind::Keepalive => {
                if let Err(e) = outcome {
                    log::debug!("[{}] keepalive error: {}", self.pool.url, e);
                }
            }
        }
    }

    fn handle_login(&mut self, outcome: Result<Value, RpcError>, now: Instant) {
        let value = match outcome {
            Ok(value) => value,
            Err(e) => {
                self.fail(format!("login error: {}", e.message), now);
                return;
            }
        };
        let login: LoginResult = match serde_json::from_value(value) {
            Ok(login) => login,
            Err(e) => {
                self.fail(format!("invalid login response: {}", e), now);
                return;
            }
        };
        if login.id.is_empty() {
            self.fail("login response without session id".into(), now);
            return;
        }

        self.extensions = Extensions::default();
        for extension in &login.extensions {
            match extension.as_str() {
                "algo" => self.extensions.algo = true,
                "nicehash" => self.extensions.nicehash = true,
                "keepalive" => self.extensions.keepalive = true,
                other => log::trace!("[{}] ignoring extension {}", self.pool.url, other),
            }
        }

        log::info!(
            "[{}] logged in, session {}",
            self.pool.url,
            login.id
        );
        self.session = Some(login.id);
        self.state = ClientState::Connected;
        self.failures = 0;
        self.deadline = None;
        self.last_error = None;
        self.events.push(ClientEvent::LoginSuccess);

        if let Some(job) = login.job {
            self.accept_job(job, now);
        }
    }

    fn handle_job(&mut self, params: Value, now: Instant) {
        match serde_json::from_value::<JobParams>(params) {
            Ok(job) => self.accept_job(job, now),
            Err(e) => log::warn!("[{}] invalid job: {}", self.pool.url, e),
        }
    }

    fn accept_job(&mut self, params: JobParams, now: Instant) {
        let Some(session) = self.session.clone() else {
            return;
        };
        let default_algo = self
            .pool
            .algo
            .or_else(|| self.options.algorithms.first().copied())
            .unwrap_or(AlgorithmType::RandomX);
        let nicehash = self.pool.nicehash || self.extensions.nicehash;

        let job = match params.into_job(&session, default_algo, nicehash) {
            Ok(job) => job.with_index(self.index),
            Err(e) => {
                log::warn!("[{}] rejected job: {}", self.pool.url, e);
                return;
            }
        };

        if let Some(current) = &self.job {
            if current.id() == job.id() && current.blob() == job.blob() {
                log::warn!(
                    "[{}] duplicate job {} received, reconnecting",
                    self.pool.url,
                    job.id()
                );
                self.fail("duplicate job".into(), now);
                return;
            }
        }

        log::info!(
            "[{}] new job {} diff {} algo {} height {}",
            self.pool.url,
            job.id(),
            job.difficulty(),
            job.algorithm(),
            job.height()
        );
        self.job = Some(job.clone());
        self.events.push(ClientEvent::Job(job));
    }

    fn login(&mut self, now: Instant) {
        self.state = ClientState::Authenticating;
        let params = LoginParams {
            login: self.pool.user.clone(),
            pass: self.pool.password.clone(),
            agent: self.options.agent.clone(),
            algo: self
                .options
                .algorithms
                .iter()
                .map(|algo| algo.name().to_string())
                .collect(),
            rigid: self.pool.rig_id.clone(),
        };
        let id = self.next_id();
        match Request::new(id, "login", params).to_line() {
            Ok(line) => {
                self.send(line, now);
                self.pending.insert(
                    id,
                    PendingRequest {
                        issued: now,
                        kind: RequestKind::Login,
                    },
                );
            }
            Err(e) => self.fail(format!("cannot encode login: {}", e), now),
        }
    }

    fn keepalive(&mut self, now: Instant) {
        let interval = match self.pool.keepalive {
            Some(0) => return,
            Some(secs) => Duration::from_secs(secs),
            None if self.extensions.keepalive => DEFAULT_KEEPALIVE,
            None => return,
        };
        let due = self
            .last_send
            .is_none_or(|last| now.saturating_duration_since(last) >= interval);
        if !due || self.pending.values().any(|r| matches!(r.kind, RequestKind::Keepalive)) {
            return;
        }
        let Some(session) = self.session.clone() else {
            return;
        };

        let id = self.next_id();
        if let Ok(line) = Request::new(id, "keepalived", KeepaliveParams { id: session }).to_line()
        {
            self.send(line, now);
            self.pending.insert(
                id,
                PendingRequest {
                    issued: now,
                    kind: RequestKind::Keepalive,
                },
            );
        }
    }

    fn sweep_pending(&mut self, now: Instant) {
        let timeout = self.options.response_timeout;
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, request)| now.saturating_duration_since(request.issued) >= timeout)
            .map(|(id, _)| *id)
            .collect();

        let mut fatal = None;
        for id in expired {
            let Some(request) = self.pending.remove(&id) else {
                continue;
            };
            match request.kind {
                RequestKind::Submit(result) => {
                    log::warn!(
                        "[{}] submit {} for job {} timed out",
                        self.pool.url,
                        id,
                        result.job_id
                    );
                    self.events.push(ClientEvent::ResultAccepted {
                        result,
                        error: Some("timeout".into()),
                        latency: now.saturating_duration_since(request.issued),
                    });
                }
                RequestKind::Login => fatal = Some("login timeout"),
                RequestKind::Keepalive => fatal = Some("keepalive timeout"),
            }
        }
        if let Some(reason) = fatal {
            self.fail(reason.into(), now);
        }
    }

    /// Gives up on the current connection and schedules a retry
    fn fail(&mut self, reason: String, now: Instant) {
        if matches!(
            self.state,
            ClientState::Unconnected | ClientState::Reconnecting
        ) {
            return;
        }
        if self.has_socket() {
            self.push(IoAction::Close);
        }

        self.epoch += 1;
        self.failures = self.failures.saturating_add(1);
        let delay = self.options.reconnect_delay(self.failures);
        log::warn!(
            "[{}] {}, retry in {} s (failure {})",
            self.pool.url,
            reason,
            delay.as_secs(),
            self.failures
        );

        for (_, request) in std::mem::take(&mut self.pending) {
            if let RequestKind::Submit(result) = request.kind {
                self.events.push(ClientEvent::ResultAccepted {
                    result,
                    error: Some("connection closed".into()),
                    latency: now.saturating_duration_since(request.issued),
                });
            }
        }

        self.state = ClientState::Reconnecting;
        self.deadline = Some(now + delay);
        self.session = None;
        self.job = None;
        self.last_error = Some(reason);
        self.events.push(ClientEvent::Closed {
            failures: self.failures,
        });
    }

    fn has_socket(&self) -> bool {
        matches!(
            self.state,
            ClientState::Connecting
                | ClientState::TlsHandshake
                | ClientState::Authenticating
                | ClientState::Connected
                | ClientState::Closing
        )
    }

    fn remember(&mut self, key: (String, u32)) {
        if self.recent.len() == RECENT_SUBMISSIONS {
            if let Some(oldest) = self.recent.pop_front() {
                self.recent_set.remove(&oldest);
            }
        }
        self.recent.push_back(key.clone());
        self.recent_set.insert(key);
    }

    fn next_id(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn send(&mut self, line: String, now: Instant) {
        self.last_send = Some(now);
        self.push(IoAction::Send(line));
    }

    fn push(&mut self, action: IoAction) {
        self.commands.push(IoCommand {
            client: self.id,
            epoch: self.epoch,
            action,
        });
    }
}
