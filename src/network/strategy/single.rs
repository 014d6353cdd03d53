// src/network/strategy/single.rs
//! Strategy for a lone endpoint
//!
//! The client reconnects after every failure with no retry budget. It is
//! active from login until its connection drops.

use super::{Strategy, StrategyEvent};
use crate::miner::job::JobResult;
use crate::network::client::{Client, ClientEvent, IoCommand, IoEvent};
use std::time::Instant;

/// One client that retries in place forever
pub struct SinglePoolStrategy {
    client: Client,
    active: bool,
    events: Vec<StrategyEvent>,
}

impl SinglePoolStrategy {
    /// Wraps a client
    pub fn new(client: Client) -> Self {
        SinglePoolStrategy {
            client,
            active: false,
            events: Vec::new(),
        }
    }

    fn pump(&mut self) {
        for event in self.client.drain_events() {
            match event {
                ClientEvent::LoginSuccess => {
                    self.active = true;
                    self.events.push(StrategyEvent::Active {
                        client: self.client.id(),
                        url: self.client.pool().url.clone(),
                    });
                }
                ClientEvent::Job(job) => {
                    if self.active {
                        self.events.push(StrategyEvent::Job(job));
                    }
                }
                ClientEvent::Closed { .. } => {
                    if std::mem::take(&mut self.active) {
                        self.events.push(StrategyEvent::Paused);
                    }
                }
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
}

impl Strategy for SinglePoolStrategy {
    fn connect(&mut self, now: Instant) {
        self.client.connect(now);
        self.pump();
    }

    fn disconnect(&mut self) {
        self.client.disconnect();
        self.active = false;
    }

    fn resume(&mut self) {
        if !self.active {
            return;
        }
        if let Some(job) = self.client.current_job() {
            self.events.push(StrategyEvent::Job(job.clone()));
        }
    }

    fn submit(&mut self, result: JobResult, now: Instant) -> Option<u64> {
        let id = self.client.submit(result, now);
        self.pump();
        id
    }

    fn tick(&mut self, now: Instant) {
        self.client.tick(now);
        self.pump();
    }

    fn on_io(&mut self, client: usize, epoch: u64, event: IoEvent, now: Instant) -> bool {
        if client != self.client.id() {
            return false;
        }
        self.client.handle_io(epoch, event, now);
        self.pump();
        true
    }

    fn drain_commands(&mut self) -> Vec<IoCommand> {
        self.client.drain_commands()
    }

    fn drain_events(&mut self) -> Vec<StrategyEvent> {
        std::mem::take(&mut self.events)
    }

    fn active_client(&self) -> Option<&Client> {
        self.active.then_some(&self.client)
    }

    fn last_error(&self) -> Option<String> {
        self.client.last_error().map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::pool::{ClientOptions, NetworkSettings, PoolConfig};
    use crate::network::strategy::testing::{settle, tick};
    use crate::test_support::MockIo;
    use std::time::Duration;

    fn strategy() -> SinglePoolStrategy {
        let pool = PoolConfig::new("127.0.0.1:3333", "wallet");
        let options = ClientOptions::for_pool(&NetworkSettings::default(), &pool);
        SinglePoolStrategy::new(Client::new(0, pool, options))
    }

    #[test]
    fn test_active_then_job() {
        let now = Instant::now();
        let mut io = MockIo::default();
        let mut strategy = strategy();

        strategy.connect(now);
        let events = settle(&mut strategy, &mut io, now);
        assert!(matches!(events[0], StrategyEvent::Active { client: 0, .. }));
        assert!(matches!(events[1], StrategyEvent::Job(_)));
        assert!(strategy.is_active());
    }

    #[test]
    fn test_retries_in_place_forever() {
        let now = Instant::now();
        let mut io = MockIo::default().refuse(0, 10);
        let mut strategy = strategy();

        strategy.connect(now);
        settle(&mut strategy, &mut io, now);
        let mut t = now;
        // ten backoff steps: 5+10+15+20+25+30*5 seconds
        for _ in 0..400 {
            t += Duration::from_secs(1);
            tick(&mut strategy, &mut io, t);
            if strategy.is_active() {
                break;
            }
        }
        assert!(strategy.is_active());
        assert_eq!(io.connects(0), 11);
    }

    #[test]
    fn test_lost_connection_pauses_and_resume_replays_job() {
        let now = Instant::now();
        let mut io = MockIo::default();
        let mut strategy = strategy();
        strategy.connect(now);
        settle(&mut strategy, &mut io, now);

        strategy.resume();
        assert!(matches!(strategy.drain_events()[0], StrategyEvent::Job(_)));

        let epoch = strategy.active_client().unwrap().epoch();
        strategy.on_io(0, epoch, IoEvent::Closed(None), now);
        assert_eq!(strategy.drain_events(), vec![StrategyEvent::Paused]);
        assert!(!strategy.is_active());
        assert_eq!(strategy.last_error().as_deref(), Some("connection closed"));
    }
}
