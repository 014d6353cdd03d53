//! Statistics collection and reporting module
//!
//! This module provides functionality for tracking and reporting mining statistics,
//! including:
//! - Hashrate windows per worker
//! - Share acceptance/rejection/invalid tracking and submit latency
//! - Hardware monitoring (CPU usage, memory, temperature)
//!
//! The periodic status line is produced by [`StatsReporter`].

/// Rolling hashrate windows (10s / 60s / 15m) per worker
pub mod hashrate;

/// Submodule containing the statistics reporter implementation
///
/// The reporter handles:
/// - Atomic share counters shared across threads
/// - Hardware monitoring
/// - Periodic reporting of stats
pub mod reporter;

// Re-export main components
pub use hashrate::{Hashrate, HashrateReport};
pub use reporter::{HardwareStats, ShareSnapshot, ShareStats, StatsReporter};
