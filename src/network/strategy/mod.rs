// src/network/strategy/mod.rs
//! Endpoint selection policies
//!
//! A strategy owns one or more protocol clients and decides which of them is
//! authoritative. Strategies are driven exactly like clients: every call may
//! queue IO commands and events which the network layer drains afterwards.

use crate::miner::job::{Job, JobResult};
use crate::network::client::{Client, IoCommand, IoEvent};
use std::time::{Duration, Instant};

mod donate;
mod failover;
mod single;

pub use donate::{DONATE_CONNECT_BUDGET, DonateStrategy};
pub use failover::FailoverStrategy;
pub use single::SinglePoolStrategy;

/// Notifications from a strategy to the network layer
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyEvent {
    /// A client became authoritative
    Active {
        /// Client id
        client: usize,
        /// Pool URL of that client
        url: String,
    },
    /// The authoritative client was lost
    Paused,
    /// New job from the authoritative client
    Job(Job),
    /// Answer to a submitted result
    ResultAccepted {
        /// The submitted result
        result: JobResult,
        /// Rejection reason, `None` when accepted
        error: Option<String>,
        /// Time between submit and answer
        latency: Duration,
    },
}

/// Capability set shared by every selection policy
pub trait Strategy: Send {
    /// Starts connecting
    fn connect(&mut self, now: Instant);

    /// Drops every connection without retrying
    fn disconnect(&mut self);

    /// Re-emits the current job of the active client, if any
    fn resume(&mut self);

    /// Routes a result to the active client
    ///
    /// Returns the request id, or `None` when nothing could take it.
    fn submit(&mut self, result: JobResult, now: Instant) -> Option<u64>;

    /// Periodic housekeeping; deferred connects are issued here
    fn tick(&mut self, now: Instant);

    /// Feeds an IO event to the owning client
    ///
    /// Returns `false` when no client of this strategy has id `client`.
    fn on_io(&mut self, client: usize, epoch: u64, event: IoEvent, now: Instant) -> bool;

    /// Takes queued IO commands of every owned client
    fn drain_commands(&mut self) -> Vec<IoCommand>;

    /// Takes queued notifications
    fn drain_events(&mut self) -> Vec<StrategyEvent>;

    /// The authoritative client
    fn active_client(&self) -> Option<&Client>;

    /// Whether a client is authoritative
    fn is_active(&self) -> bool {
        self.active_client().is_some()
    }

    /// Most recent failure text of any owned client
    fn last_error(&self) -> Option<String>;
}

/// Builds the primary strategy for a set of clients
///
/// A single client gets [`SinglePoolStrategy`], several get
/// [`FailoverStrategy`].
pub fn for_clients(mut clients: Vec<Client>) -> Option<Box<dyn Strategy>> {
    match clients.len() {
        0 => None,
        1 => clients
            .pop()
            .map(|client| Box::new(SinglePoolStrategy::new(client)) as Box<dyn Strategy>),
        _ => Some(Box::new(FailoverStrategy::new(clients))),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Drives strategies against [`MockIo`](crate::test_support::MockIo)

    use super::*;
    use crate::test_support::MockIo;

    /// Runs IO until quiescent, collecting strategy events
    pub fn settle(strategy: &mut dyn Strategy, io: &mut MockIo, now: Instant) -> Vec<StrategyEvent> {
        let mut events = strategy.drain_events();
        loop {
            let commands = strategy.drain_commands();
            if commands.is_empty() {
                break;
            }
            for (client, epoch, event) in io.respond(commands) {
                strategy.on_io(client, epoch, event, now);
            }
            events.extend(strategy.drain_events());
        }
        events
    }

    /// Ticks once and settles
    pub fn tick(strategy: &mut dyn Strategy, io: &mut MockIo, now: Instant) -> Vec<StrategyEvent> {
        strategy.tick(now);
        settle(strategy, io, now)
    }
}
