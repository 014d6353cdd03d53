// src/network/mod.rs
//! Network communication components
//!
//! This module handles all network interactions with mining pools:
//! - `Client`: IO-free protocol state machine, one per configured pool
//! - `Strategy`: single pool, ordered failover and donation policies
//! - `Network`: routes jobs and results between strategies and the miner
//! - `IoDriver`: executes client IO on the network thread's tokio runtime

/// Protocol client state machine
pub mod client;

/// Strategy routing and donation job suppression
pub mod dispatch;

/// JSON-RPC request and notification types
pub mod messages;

/// Pool configuration and endpoint parsing
pub mod pool;

/// Endpoint selection policies
pub mod strategy;

/// TCP, WebSocket and SOCKS5 transports
pub mod transport;

// Re-export main components for cleaner imports
pub use client::{Client, ClientEvent, ClientState, IoAction, IoCommand, IoEvent};
pub use dispatch::{DonationConfig, Network, NetworkEvent, NetworkStatus};
pub use pool::{Endpoint, NetworkSettings, PoolConfig};
pub use strategy::{DonateStrategy, FailoverStrategy, SinglePoolStrategy, Strategy, StrategyEvent};
pub use transport::{IoDriver, IoReport};
