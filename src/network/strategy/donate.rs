// src/network/strategy/donate.rs
//! Time-boxed switching to the donation endpoint
//!
//! Out of every 100 minutes, `level` minutes are spent mining for the
//! donation endpoint. The first idle period is scaled by a random factor in
//! `[0.5, 1.5)` so that many instances started together do not donate in
//! lockstep.

use super::{Strategy, StrategyEvent};
use crate::miner::job::JobResult;
use crate::network::client::{Client, IoCommand, IoEvent};
use rand::Rng;
use std::time::{Duration, Instant};

/// Time allowed for the donation endpoint to become active
pub const DONATE_CONNECT_BUDGET: Duration = Duration::from_secs(120);

const MINUTE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DonateState {
    /// Not started
    Stopped,
    Idle { until: Instant },
    Connecting { deadline: Instant },
    Active { until: Instant },
}

/// Wraps the donation endpoint strategy with the donate/idle timer
pub struct DonateStrategy {
    inner: Box<dyn Strategy>,
    donate_time: Duration,
    idle_time: Duration,
    first_idle_factor: f64,
    state: DonateState,
    events: Vec<StrategyEvent>,
}

impl DonateStrategy {
    /// Creates the strategy for donation `level` (percent, 1..=99)
    pub fn new(inner: Box<dyn Strategy>, level: u8) -> Self {
        Self::with_rng(inner, level, &mut rand::thread_rng())
    }

    /// Like [`DonateStrategy::new`] with a caller-provided random source
    pub fn with_rng<R: Rng>(inner: Box<dyn Strategy>, level: u8, rng: &mut R) -> Self {
        let level = u32::from(level.clamp(1, 99));
        DonateStrategy {
            inner,
            donate_time: MINUTE * level,
            idle_time: MINUTE * (100 - level),
            first_idle_factor: rng.gen_range(0.5..1.5),
            state: DonateState::Stopped,
            events: Vec::new(),
        }
    }

    /// Length of one donation window
    pub fn donate_time(&self) -> Duration {
        self.donate_time
    }

    /// Length of the pause between windows
    pub fn idle_time(&self) -> Duration {
        self.idle_time
    }

    fn finish_window(&mut self, now: Instant) {
        let was_active = matches!(self.state, DonateState::Active { .. });
        self.inner.disconnect();
        self.state = DonateState::Idle {
            until: now + self.idle_time,
        };
        if was_active {
            log::info!(
                "donation window closed, next in {} min",
                self.idle_time.as_secs() / 60
            );
            self.events.push(StrategyEvent::Paused);
        }
    }

    fn pump(&mut self, now: Instant) {
        for event in self.inner.drain_events() {
            match event {
                StrategyEvent::Active { client, url } => {
                    if let DonateState::Connecting { .. } = self.state {
                        self.state = DonateState::Active {
                            until: now + self.donate_time,
                        };
                        log::info!(
                            "donating for {} min to {}",
                            self.donate_time.as_secs() / 60,
                            url
                        );
                        self.events.push(StrategyEvent::Active { client, url });
                    }
                }
                StrategyEvent::Paused => {
                    if let DonateState::Active { .. } = self.state {
                        log::warn!("donation connection lost, ending window early");
                        self.finish_window(now);
                    }
                }
                StrategyEvent::Job(job) => {
                    if let DonateState::Active { .. } = self.state {
                        self.events.push(StrategyEvent::Job(job));
                    }
                }
                accepted @ StrategyEvent::ResultAccepted { .. } => self.events.push(accepted),
            }
        }
    }
}

impl Strategy for DonateStrategy {
    /// Arms the timer; the donation endpoint is only contacted when the
    /// first idle period ends
    fn connect(&mut self, now: Instant) {
        if self.state != DonateState::Stopped {
            return;
        }
        let first = self.idle_time.mul_f64(self.first_idle_factor);
        log::debug!("first donation in {} s", first.as_secs());
        self.state = DonateState::Idle { until: now + first };
    }

    fn disconnect(&mut self) {
        self.inner.disconnect();
        self.state = DonateState::Stopped;
    }

    fn resume(&mut self) {
        if let DonateState::Active { .. } = self.state {
            self.inner.resume();
            self.events.extend(self.inner.drain_events());
        }
    }

    fn submit(&mut self, result: JobResult, now: Instant) -> Option<u64> {
        if !matches!(self.state, DonateState::Active { .. }) {
            return None;
        }
        let id = self.inner.submit(result, now);
        self.pump(now);
        id
    }

    fn tick(&mut self, now: Instant) {
        match self.state {
            DonateState::Stopped => return,
            DonateState::Idle { until } => {
                if now >= until {
                    self.state = DonateState::Connecting {
                        deadline: now + DONATE_CONNECT_BUDGET,
                    };
                    self.inner.connect(now);
                }
            }
            DonateState::Connecting { deadline } => {
                if now >= deadline {
                    log::warn!("donation endpoint unreachable, skipping this window");
                    self.finish_window(now);
                }
            }
            DonateState::Active { until } => {
                if now >= until {
                    self.finish_window(now);
                }
            }
        }
        self.inner.tick(now);
        self.pump(now);
    }

    fn on_io(&mut self, client: usize, epoch: u64, event: IoEvent, now: Instant) -> bool {
        if !self.inner.on_io(client, epoch, event, now) {
            return false;
        }
        self.pump(now);
        true
    }

    fn drain_commands(&mut self) -> Vec<IoCommand> {
        self.inner.drain_commands()
    }

    fn drain_events(&mut self) -> Vec<StrategyEvent> {
        std::mem::take(&mut self.events)
    }

    fn active_client(&self) -> Option<&Client> {
        match self.state {
            DonateState::Active { .. } => self.inner.active_client(),
            _ => None,
        }
    }

    fn last_error(&self) -> Option<String> {
        self.inner.last_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::pool::{ClientOptions, NetworkSettings, PoolConfig};
    use crate::network::strategy::SinglePoolStrategy;
    use crate::network::strategy::testing::{settle, tick};
    use crate::test_support::MockIo;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn donate(level: u8, seed: u64) -> DonateStrategy {
        let pool = PoolConfig::new("donate.example.com:3333", "donor");
        let options = ClientOptions::for_pool(&NetworkSettings::default(), &pool);
        let inner = SinglePoolStrategy::new(Client::new(7, pool, options));
        DonateStrategy::with_rng(Box::new(inner), level, &mut StdRng::seed_from_u64(seed))
    }

    /// Simulates `total` seconds in one-second ticks and returns the time
    /// spent active
    fn active_time(strategy: &mut DonateStrategy, io: &mut MockIo, total: u64) -> Duration {
        let start = Instant::now();
        strategy.connect(start);
        let mut active = Duration::ZERO;
        for second in 1..=total {
            let now = start + Duration::from_secs(second);
            tick(strategy, io, now);
            if strategy.is_active() {
                active += Duration::from_secs(1);
            }
        }
        active
    }

    #[test]
    fn test_windows_follow_level() {
        let strategy = donate(1, 1);
        assert_eq!(strategy.donate_time(), Duration::from_secs(60));
        assert_eq!(strategy.idle_time(), Duration::from_secs(99 * 60));
        assert!((0.5..1.5).contains(&strategy.first_idle_factor));
    }

    /// 1% over 60 000 simulated seconds lands within 540..=660 s active.
    #[test]
    fn test_donation_time_converges_to_level() {
        for seed in 0..8 {
            let mut io = MockIo::default();
            let mut strategy = donate(1, seed);
            let active = active_time(&mut strategy, &mut io, 60_000);
            assert!(
                (Duration::from_secs(540)..=Duration::from_secs(660)).contains(&active),
                "seed {} donated {:?}",
                seed,
                active
            );
        }
    }

    #[test]
    fn test_nothing_happens_before_first_idle_period() {
        let start = Instant::now();
        let mut io = MockIo::default();
        let mut strategy = donate(5, 3);
        strategy.connect(start);

        let first = strategy.idle_time().mul_f64(strategy.first_idle_factor);
        tick(&mut strategy, &mut io, start + first - Duration::from_secs(1));
        assert_eq!(io.connects(7), 0);

        let events = tick(&mut strategy, &mut io, start + first);
        assert_eq!(io.connects(7), 1);
        assert!(matches!(events[0], StrategyEvent::Active { client: 7, .. }));
        assert!(matches!(events[1], StrategyEvent::Job(_)));
    }

    #[test]
    fn test_window_ends_with_pause_event() {
        let start = Instant::now();
        let mut io = MockIo::default();
        let mut strategy = donate(1, 4);
        strategy.connect(start);
        let first = strategy.idle_time().mul_f64(strategy.first_idle_factor);
        tick(&mut strategy, &mut io, start + first);
        assert!(strategy.is_active());

        let events = tick(&mut strategy, &mut io, start + first + Duration::from_secs(60));
        assert_eq!(events, vec![StrategyEvent::Paused]);
        assert!(!strategy.is_active());
    }

    #[test]
    fn test_lost_connection_ends_window_early() {
        let start = Instant::now();
        let mut io = MockIo::default();
        let mut strategy = donate(1, 5);
        strategy.connect(start);
        let first = strategy.idle_time().mul_f64(strategy.first_idle_factor);
        let now = start + first;
        tick(&mut strategy, &mut io, now);

        let epoch = strategy.active_client().unwrap().epoch();
        strategy.on_io(7, epoch, IoEvent::Closed(None), now + Duration::from_secs(10));
        assert_eq!(strategy.drain_events(), vec![StrategyEvent::Paused]);
        assert!(!strategy.is_active());

        // the inner client was shut down instead of retrying
        settle(&mut strategy, &mut io, now + Duration::from_secs(10));
        tick(&mut strategy, &mut io, now + Duration::from_secs(100));
        assert_eq!(io.connects(7), 1);
    }

    #[test]
    fn test_unreachable_endpoint_abandoned_after_budget() {
        let start = Instant::now();
        let mut io = MockIo::default().refuse(7, u32::MAX);
        let mut strategy = donate(1, 6);
        strategy.connect(start);
        let first = strategy.idle_time().mul_f64(strategy.first_idle_factor);

        let mut now = start + first;
        tick(&mut strategy, &mut io, now);
        let attempts_at_start = io.connects(7);
        for _ in 0..DONATE_CONNECT_BUDGET.as_secs() {
            now += Duration::from_secs(1);
            tick(&mut strategy, &mut io, now);
        }
        let attempts = io.connects(7);
        assert!(attempts > attempts_at_start, "the client retried inside the budget");

        tick(&mut strategy, &mut io, now + Duration::from_secs(600));
        assert_eq!(io.connects(7), attempts, "no retries between windows");
        assert!(!strategy.is_active());
    }

    #[test]
    fn test_submit_only_while_active() {
        let start = Instant::now();
        let mut io = MockIo::default();
        let mut strategy = donate(1, 7);
        let job = crate::test_support::make_job("j", 1);
        let result = JobResult::new(&job, 1, [0; 32], crate::types::BackendType::Cpu);
        strategy.connect(start);
        assert_eq!(strategy.submit(result, start), None);
    }
}
