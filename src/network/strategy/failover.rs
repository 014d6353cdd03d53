// src/network/strategy/failover.rs
//! Ordered fallback across several endpoints
//!
//! Only the attempted client is ever connecting. It retries in place until
//! its failure count exceeds its retry budget, then it is shut down and the
//! next client in order (wrapping to the first) is connected on the
//! following tick. The first client to log in while nothing is active, or
//! the primary at any time, becomes authoritative and every other client is
//! disconnected.

use super::{Strategy, StrategyEvent};
use crate::miner::job::JobResult;
use crate::network::client::{Client, ClientEvent, IoCommand, IoEvent};
use std::time::Instant;

/// Prefer-primary failover over an ordered client list
pub struct FailoverStrategy {
    clients: Vec<Client>,
    /// Index of the client currently being tried; close events from any
    /// other client are ignored
    attempt: usize,
    active: Option<usize>,
    /// Connect deferred to the next tick
    scheduled: Option<usize>,
    events: Vec<StrategyEvent>,
}

impl FailoverStrategy {
    /// Creates the strategy; `clients[0]` is the primary
    pub fn new(clients: Vec<Client>) -> Self {
        FailoverStrategy {
            clients,
            attempt: 0,
            active: None,
            scheduled: None,
            events: Vec::new(),
        }
    }

    /// Owned clients in priority order
    pub fn clients(&self) -> &[Client] {
        &self.clients
    }

    /// Index of the client currently being tried
    pub fn attempted(&self) -> usize {
        self.attempt
    }

    fn pump(&mut self, index: usize) {
        for event in self.clients[index].drain_events() {
            match event {
                ClientEvent::LoginSuccess => self.on_login(index),
                ClientEvent::Job(job) => {
                    if self.active == Some(index) {
                        self.events.push(StrategyEvent::Job(job));
                    }
                }
                ClientEvent::Closed { failures } => self.on_close(index, failures),
                ClientEvent::ResultAccepted {
                    result,
                    error,
                    latency,
                } => self.events.push(StrategyEvent::ResultAccepted {
                    result,
                    error,
                    latency,
                }),
            }
        }
    }

    fn on_login(&mut self, index: usize) {
        if index != 0 && self.active.is_some() {
            log::debug!(
                "[{}] logged in while another pool is active, disconnecting",
                self.clients[index].pool().url
            );
            self.clients[index].disconnect();
            return;
        }

        for (other, client) in self.clients.iter_mut().enumerate() {
            if other != index {
                client.disconnect();
            }
        }
        self.scheduled = None;
        self.attempt = index;

        if self.active != Some(index) {
            self.active = Some(index);
            let url = self.clients[index].pool().url.clone();
            log::info!("use pool {}", url);
            self.events.push(StrategyEvent::Active {
                client: self.clients[index].id(),
                url,
            });
        }
    }

    fn on_close(&mut self, index: usize, failures: u32) {
        if self.active == Some(index) {
            self.active = None;
            self.events.push(StrategyEvent::Paused);
        }
        if index != self.attempt || self.clients.len() == 1 {
            return;
        }
        if failures <= self.clients[index].retries() {
            return;
        }

        let next = (index + 1) % self.clients.len();
        log::warn!(
            "[{}] giving up after {} failures, switching to {}",
            self.clients[index].pool().url,
            failures,
            self.clients[next].pool().url
        );
        self.clients[index].disconnect();
        self.scheduled = Some(next);
    }
}

impl Strategy for FailoverStrategy {
    fn connect(&mut self, now: Instant) {
        self.attempt = 0;
        self.scheduled = None;
        self.clients[0].connect(now);
        self.pump(0);
    }

    fn disconnect(&mut self) {
        for client in &mut self.clients {
            client.disconnect();
        }
        self.active = None;
        self.scheduled = None;
    }

    fn resume(&mut self) {
        let Some(index) = self.active else {
            return;
        };
        if let Some(job) = self.clients[index].current_job() {
            self.events.push(StrategyEvent::Job(job.clone()));
        }
    }

    fn submit(&mut self, result: JobResult, now: Instant) -> Option<u64> {
        let index = self.active?;
        let id = self.clients[index].submit(result, now);
        self.pump(index);
        id
    }

    fn tick(&mut self, now: Instant) {
        if let Some(next) = self.scheduled.take() {
            self.attempt = next;
            self.clients[next].connect(now);
        }
        for index in 0..self.clients.len() {
            self.clients[index].tick(now);
            self.pump(index);
        }
    }

    fn on_io(&mut self, client: usize, epoch: u64, event: IoEvent, now: Instant) -> bool {
        let Some(index) = self.clients.iter().position(|c| c.id() == client) else {
            return false;
        };
        self.clients[index].handle_io(epoch, event, now);
        self.pump(index);
        true
    }

    fn drain_commands(&mut self) -> Vec<IoCommand> {
        self.clients
            .iter_mut()
            .flat_map(|client| client.drain_commands())
            .collect()
    }

    fn drain_events(&mut self) -> Vec<StrategyEvent> {
        std::mem::take(&mut self.events)
    }

    fn active_client(&self) -> Option<&Client> {
        self.active.map(|index| &self.clients[index])
    }

    fn last_error(&self) -> Option<String> {
        self.clients[self.attempt]
            .last_error()
            .or_else(|| self.clients.iter().find_map(|c| c.last_error()))
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::client::ClientState;
    use crate::network::pool::{ClientOptions, NetworkSettings, PoolConfig};
    use crate::network::strategy::testing::{settle, tick};
    use crate::test_support::MockIo;
    use std::time::Duration;

    fn failover(pools: usize, retries: u32) -> FailoverStrategy {
        let settings = NetworkSettings {
            retries,
            ..NetworkSettings::default()
        };
        let clients = (0..pools)
            .map(|id| {
                let pool = PoolConfig::new(format!("pool{}.example.com:3333", id), "wallet");
                let options = ClientOptions::for_pool(&settings, &pool);
                Client::new(id, pool, options)
            })
            .collect();
        FailoverStrategy::new(clients)
    }

    /// Ticks once per second until `done` holds, returning the time reached
    fn run_until(
        strategy: &mut FailoverStrategy,
        io: &mut MockIo,
        mut now: Instant,
        done: impl Fn(&FailoverStrategy, &MockIo) -> bool,
    ) -> Instant {
        for _ in 0..1_000 {
            if done(strategy, io) {
                return now;
            }
            now += Duration::from_secs(1);
            tick(strategy, io, now);
        }
        panic!("condition not reached");
    }

    fn connected(strategy: &FailoverStrategy) -> usize {
        strategy
            .clients()
            .iter()
            .filter(|c| c.state() == ClientState::Connected)
            .count()
    }

    #[test]
    fn test_primary_wins_when_healthy() {
        let now = Instant::now();
        let mut io = MockIo::default();
        let mut strategy = failover(3, 2);

        strategy.connect(now);
        let events = settle(&mut strategy, &mut io, now);
        assert!(matches!(events[0], StrategyEvent::Active { client: 0, .. }));
        assert_eq!(io.connects(1), 0);
        assert_eq!(io.connects(2), 0);
    }

    /// pool 0 refuses three times with two retries: one switch to pool 1,
    /// and pool 0 stays quiet until pool 1 fails too.
    #[test]
    fn test_failover_after_retries_exhausted() {
        let now = Instant::now();
        let mut io = MockIo::default().refuse(0, u32::MAX);
        let mut strategy = failover(2, 2);

        strategy.connect(now);
        settle(&mut strategy, &mut io, now);
        let now = run_until(&mut strategy, &mut io, now, |s, _| s.is_active());

        assert_eq!(io.connects(0), 3);
        assert_eq!(io.connects(1), 1);
        assert_eq!(strategy.active_client().map(|c| c.id()), Some(1));

        let mut later = now;
        for _ in 0..120 {
            later += Duration::from_secs(1);
            tick(&mut strategy, &mut io, later);
        }
        assert_eq!(io.connects(0), 3, "pool 0 must not be retried while pool 1 serves");

        // pool 1 goes away for good: after its own retries we wrap to pool 0
        io.set_refusals(1, u32::MAX);
        let epoch = strategy.clients()[1].epoch();
        strategy.on_io(1, epoch, IoEvent::Closed(None), later);
        assert_eq!(strategy.drain_events(), vec![StrategyEvent::Paused]);
        run_until(&mut strategy, &mut io, later, |_, io| io.connects(0) == 4);
        assert_eq!(io.connects(1), 3);
    }

    #[test]
    fn test_zero_retries_is_one_attempt_per_pool_deferred_to_tick() {
        let now = Instant::now();
        let mut io = MockIo::default().refuse(0, u32::MAX).refuse(1, u32::MAX);
        let mut strategy = failover(3, 0);

        strategy.connect(now);
        settle(&mut strategy, &mut io, now);
        assert_eq!(io.connects(0), 1);
        assert_eq!(io.connects(1), 0, "next pool waits for the tick");

        tick(&mut strategy, &mut io, now + Duration::from_secs(1));
        assert_eq!(io.connects(1), 1);
        assert_eq!(io.connects(2), 0);

        tick(&mut strategy, &mut io, now + Duration::from_secs(2));
        assert_eq!(io.connects(2), 1);
        assert_eq!(strategy.active_client().map(|c| c.id()), Some(2));
        assert_eq!(io.connects(0), 1);
        assert_eq!(io.connects(1), 1);
    }

    #[test]
    fn test_snap_back_to_primary_after_cycle() {
        let now = Instant::now();
        let mut io = MockIo::default().refuse(0, 1);
        let mut strategy = failover(2, 0);

        strategy.connect(now);
        settle(&mut strategy, &mut io, now);
        let now = run_until(&mut strategy, &mut io, now, |s, _| s.is_active());
        assert_eq!(strategy.active_client().map(|c| c.id()), Some(1));

        io.set_refusals(1, u32::MAX);
        let epoch = strategy.clients()[1].epoch();
        strategy.on_io(1, epoch, IoEvent::Closed(Some("reset".into())), now);
        run_until(&mut strategy, &mut io, now, |s, _| s.is_active());

        assert_eq!(strategy.active_client().map(|c| c.id()), Some(0));
        assert_eq!(strategy.clients()[1].state(), ClientState::Unconnected);
    }

    #[test]
    fn test_at_most_one_connected_client() {
        let now = Instant::now();
        let mut io = MockIo::default().refuse(0, 2).refuse(1, 1);
        let mut strategy = failover(3, 0);

        strategy.connect(now);
        settle(&mut strategy, &mut io, now);
        let mut t = now;
        for _ in 0..300 {
            t += Duration::from_secs(1);
            tick(&mut strategy, &mut io, t);
            assert!(connected(&strategy) <= 1);
        }
        assert_eq!(connected(&strategy), 1);
    }

    #[test]
    fn test_submit_goes_to_active_client() {
        let now = Instant::now();
        let mut io = MockIo::default().refuse(0, u32::MAX);
        let mut strategy = failover(2, 0);
        strategy.connect(now);
        settle(&mut strategy, &mut io, now);
        let now = run_until(&mut strategy, &mut io, now, |s, _| s.is_active());

        let job = strategy.active_client().unwrap().current_job().unwrap().clone();
        let result = JobResult::new(&job, 7, [0; 32], crate::types::BackendType::Cpu);
        assert!(strategy.submit(result, now).is_some());
        let events = settle(&mut strategy, &mut io, now);
        assert!(matches!(
            &events[0],
            StrategyEvent::ResultAccepted { error: None, .. }
        ));
        assert_eq!(io.submits(1), 1);
    }

    #[test]
    fn test_stale_close_from_other_client_ignored() {
        let now = Instant::now();
        let mut io = MockIo::default();
        let mut strategy = failover(2, 0);
        strategy.connect(now);
        settle(&mut strategy, &mut io, now);

        // pool 1 was never attempted; a close for it changes nothing
        strategy.on_io(1, 0, IoEvent::Closed(None), now);
        tick(&mut strategy, &mut io, now + Duration::from_secs(1));
        assert_eq!(strategy.attempted(), 0);
        assert_eq!(io.connects(1), 0);
        assert!(strategy.is_active());
    }
}
