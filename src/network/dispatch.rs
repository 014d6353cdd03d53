// src/network/dispatch.rs
//! Routing between the primary strategy, the donation strategy and the
//! coordinator
//!
//! Runs on the network thread. While a donation window is open, jobs from
//! the primary strategy are held back and results tagged with the donation
//! index go to the donation endpoint. Closing the window replays the
//! primary's current job.

use crate::miner::job::{DONATE_INDEX, Job, JobResult};
use crate::network::client::{Client, IoCommand, IoEvent};
use crate::network::pool::{ClientOptions, NetworkSettings, PoolConfig};
use crate::network::strategy::{self, DonateStrategy, Strategy, StrategyEvent};
use crate::utils::error::MinerError;
use std::time::{Duration, Instant};

/// Donation setup
#[derive(Debug, Clone, PartialEq)]
pub struct DonationConfig {
    /// Percent of mining time, 0 disables donation
    pub level: u8,
    /// Donation endpoints in failover order
    pub pools: Vec<PoolConfig>,
}

impl DonationConfig {
    /// Donation switched off
    pub fn disabled() -> Self {
        DonationConfig {
            level: 0,
            pools: Vec::new(),
        }
    }
}

/// Notifications for the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// Install this job
    Job(Job),
    /// No endpoint is serving work, stop mining
    Pause,
    /// An endpoint became authoritative
    Active {
        /// Pool URL
        url: String,
        /// Whether this is the donation endpoint
        donation: bool,
    },
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

/// Snapshot of the connection situation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkStatus {
    /// URL of the endpoint jobs currently come from
    pub active: Option<String>,
    /// Whether a donation window is open
    pub donating: bool,
    /// Most recent failure of the primary strategy
    pub last_error: Option<String>,
}

/// Owns every strategy of the process
pub struct Network {
    primary: Box<dyn Strategy>,
    donate: Option<DonateStrategy>,
    donating: bool,
    events: Vec<NetworkEvent>,
}

impl Network {
    /// Builds clients and strategies
    ///
    /// Client ids are assigned in order: primary pools first, then the
    /// donation pools.
    ///
    /// # Errors
    /// `ConfigError` when no pool is enabled or an entry is invalid
    pub fn new(
        settings: &NetworkSettings,
        pools: &[PoolConfig],
        donation: &DonationConfig,
    ) -> Result<Self, MinerError> {
        let mut next_id = 0;
        let primary_clients = build_clients(settings, pools, &mut next_id)?;
        let primary = strategy::for_clients(primary_clients)
            .ok_or_else(|| MinerError::ConfigError("no enabled pool configured".into()))?;

        let donate = if donation.level == 0 {
            None
        } else {
            let clients = build_clients(settings, &donation.pools, &mut next_id)?;
            let clients = clients
                .into_iter()
                .map(|client| client.with_index(DONATE_INDEX))
                .collect();
            match strategy::for_clients(clients) {
                Some(inner) => Some(DonateStrategy::new(inner, donation.level)),
                None => {
                    log::warn!("donation level {} but no donation pool", donation.level);
                    None
                }
            }
        };

        Ok(Self::from_strategies(primary, donate))
    }

    /// Assembles a network from ready-made strategies
    pub fn from_strategies(primary: Box<dyn Strategy>, donate: Option<DonateStrategy>) -> Self {
        Network {
            primary,
            donate,
            donating: false,
            events: Vec::new(),
        }
    }

    /// Starts the primary strategy and arms the donation timer
    pub fn connect(&mut self, now: Instant) {
        self.primary.connect(now);
        if let Some(donate) = &mut self.donate {
            donate.connect(now);
        }
        self.pump();
    }

    /// Drops every connection
    pub fn disconnect(&mut self) {
        self.primary.disconnect();
        if let Some(donate) = &mut self.donate {
            donate.disconnect();
        }
        self.donating = false;
    }

    /// Periodic housekeeping of every strategy
    pub fn tick(&mut self, now: Instant) {
        self.primary.tick(now);
        if let Some(donate) = &mut self.donate {
            donate.tick(now);
        }
        self.pump();
    }

    /// Routes an IO event to the strategy owning `client`
    pub fn on_io(&mut self, client: usize, epoch: u64, event: IoEvent, now: Instant) {
        let mut handled = self.primary.on_io(client, epoch, event.clone(), now);
        if !handled {
            if let Some(donate) = &mut self.donate {
                handled = donate.on_io(client, epoch, event, now);
            }
        }
        if !handled {
            log::trace!("IO event for unknown client {}", client);
        }
        self.pump();
    }

    /// Routes a result by its index
    pub fn submit(&mut self, result: JobResult, now: Instant) -> Option<u64> {
        let id = if result.index == DONATE_INDEX {
            match &mut self.donate {
                Some(donate) => donate.submit(result, now),
                None => None,
            }
        } else {
            self.primary.submit(result, now)
        };
        self.pump();
        id
    }

    /// Takes IO commands of every strategy
    pub fn drain_commands(&mut self) -> Vec<IoCommand> {
        let mut commands = self.primary.drain_commands();
        if let Some(donate) = &mut self.donate {
            commands.extend(donate.drain_commands());
        }
        commands
    }

    /// Takes queued notifications
    pub fn drain_events(&mut self) -> Vec<NetworkEvent> {
        std::mem::take(&mut self.events)
    }

    /// Whether a donation window is open
    pub fn is_donating(&self) -> bool {
        self.donating
    }

    /// Current connection situation
    pub fn status(&self) -> NetworkStatus {
        let active: Option<&Client> = if self.donating {
            self.donate.as_ref().and_then(|donate| donate.active_client())
        } else {
            self.primary.active_client()
        };
        NetworkStatus {
            active: active.map(|client| client.pool().url.clone()),
            donating: self.donating,
            last_error: self.primary.last_error(),
        }
    }

    fn pump(&mut self) {
        loop {
            let donate_events = match &mut self.donate {
                Some(donate) => donate.drain_events(),
                None => Vec::new(),
            };
            let primary_events = self.primary.drain_events();
            if donate_events.is_empty() && primary_events.is_empty() {
                break;
            }
            for event in donate_events {
                self.on_donate_event(event);
            }
            for event in primary_events {
                self.on_primary_event(event);
            }
        }
    }

    fn on_donate_event(&mut self, event: StrategyEvent) {
        match event {
            StrategyEvent::Active { url, .. } => {
                self.donating = true;
                self.events.push(NetworkEvent::Active {
                    url,
                    donation: true,
                });
            }
            StrategyEvent::Job(job) => self.events.push(NetworkEvent::Job(job)),
            StrategyEvent::Paused => {
                self.donating = false;
                match self.primary.active_client() {
                    Some(client) => {
                        let url = client.pool().url.clone();
                        self.events.push(NetworkEvent::Active {
                            url,
                            donation: false,
                        });
                        self.primary.resume();
                    }
                    None => self.events.push(NetworkEvent::Pause),
                }
            }
            StrategyEvent::ResultAccepted {
                result,
                error,
                latency,
            } => self.events.push(NetworkEvent::ResultAccepted {
                result,
                error,
                latency,
            }),
        }
    }

    fn on_primary_event(&mut self, event: StrategyEvent) {
        match event {
            StrategyEvent::Active { url, .. } => {
                if !self.donating {
                    self.events.push(NetworkEvent::Active {
                        url,
                        donation: false,
                    });
                }
            }
            StrategyEvent::Job(job) => {
                if self.donating {
                    log::debug!("holding back job {} during donation", job.id());
                } else {
                    self.events.push(NetworkEvent::Job(job));
                }
            }
            StrategyEvent::Paused => {
                if !self.donating {
                    self.events.push(NetworkEvent::Pause);
                }
            }
            StrategyEvent::ResultAccepted {
                result,
                error,
                latency,
            } => self.events.push(NetworkEvent::ResultAccepted {
                result,
                error,
                latency,
            }),
        }
    }
}

fn build_clients(
    settings: &NetworkSettings,
    pools: &[PoolConfig],
    next_id: &mut usize,
) -> Result<Vec<Client>, MinerError> {
    let mut clients = Vec::new();
    for pool in pools.iter().filter(|pool| pool.enabled) {
        pool.validate()?;
        let options = ClientOptions::for_pool(settings, pool);
        clients.push(Client::new(*next_id, pool.clone(), options));
        *next_id += 1;
    }
    Ok(clients)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockIo;
    use crate::types::BackendType;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn settle(network: &mut Network, io: &mut MockIo, now: Instant) -> Vec<NetworkEvent> {
        let mut events = network.drain_events();
        loop {
            let commands = network.drain_commands();
            if commands.is_empty() {
                break;
            }
            for (client, epoch, event) in io.respond(commands) {
                network.on_io(client, epoch, event, now);
            }
            events.extend(network.drain_events());
        }
        events
    }

    fn network_with_donation() -> Network {
        let settings = NetworkSettings::default();
        let mut next = 0;
        let primary = build_clients(
            &settings,
            &[PoolConfig::new("primary.example.com:3333", "wallet")],
            &mut next,
        )
        .unwrap();
        let donation = build_clients(
            &settings,
            &[PoolConfig::new("donate.example.com:3333", "donor")],
            &mut next,
        )
        .unwrap()
        .into_iter()
        .map(|client| client.with_index(DONATE_INDEX))
        .collect();

        let donate = DonateStrategy::with_rng(
            strategy::for_clients(donation).unwrap(),
            1,
            &mut StdRng::seed_from_u64(9),
        );
        Network::from_strategies(strategy::for_clients(primary).unwrap(), Some(donate))
    }

    fn jobs(events: &[NetworkEvent]) -> Vec<&Job> {
        events
            .iter()
            .filter_map(|event| match event {
                NetworkEvent::Job(job) => Some(job),
                _ => None,
            })
            .collect()
    }

    /// Ticks once a second until a donation window opens
    fn run_to_donation(network: &mut Network, io: &mut MockIo, start: Instant) -> (Instant, Vec<NetworkEvent>) {
        let mut now = start;
        for _ in 0..20_000 {
            now += Duration::from_secs(1);
            network.tick(now);
            let events = settle(network, io, now);
            if network.is_donating() {
                return (now, events);
            }
        }
        panic!("donation never started");
    }

    #[test]
    fn test_rejects_empty_pool_list() {
        let mut disabled = PoolConfig::new("pool.example.com:3333", "wallet");
        disabled.enabled = false;
        let result = Network::new(
            &NetworkSettings::default(),
            &[disabled],
            &DonationConfig::disabled(),
        );
        assert!(matches!(result, Err(MinerError::ConfigError(_))));
    }

    #[test]
    fn test_primary_job_flows_through() {
        let now = Instant::now();
        let mut io = MockIo::default();
        let mut network = Network::new(
            &NetworkSettings::default(),
            &[PoolConfig::new("pool.example.com:3333", "wallet")],
            &DonationConfig::disabled(),
        )
        .unwrap();

        network.connect(now);
        let events = settle(&mut network, &mut io, now);
        assert_eq!(
            events[0],
            NetworkEvent::Active {
                url: "pool.example.com:3333".into(),
                donation: false
            }
        );
        assert_eq!(jobs(&events).len(), 1);
        assert_eq!(network.status().active.as_deref(), Some("pool.example.com:3333"));
    }

    #[test]
    fn test_donation_window_switches_jobs_and_results() {
        let start = Instant::now();
        let mut io = MockIo::default();
        let mut network = network_with_donation();
        network.connect(start);
        settle(&mut network, &mut io, start);

        let (now, events) = run_to_donation(&mut network, &mut io, start);
        let donation_jobs = jobs(&events);
        assert_eq!(donation_jobs.len(), 1);
        assert_eq!(donation_jobs[0].index(), DONATE_INDEX);
        assert_eq!(donation_jobs[0].client_id(), "session-1");
        assert!(network.status().donating);

        // a primary job during the window is held back
        let primary_job = serde_json::json!({
            "method": "job",
            "params": {
                "job_id": "held",
                "blob": hex::encode(crate::test_support::sample_blob(9)),
                "target": "b88d0600"
            }
        });
        network.on_io(0, 1, IoEvent::Line(primary_job.to_string()), now);
        assert!(jobs(&network.drain_events()).is_empty());

        // donation results go to the donation client
        let result = JobResult::new(donation_jobs[0], 3, [0; 32], BackendType::Cpu);
        assert!(network.submit(result, now).is_some());
        settle(&mut network, &mut io, now);
        assert_eq!(io.submits(1), 1);
        assert_eq!(io.submits(0), 0);

        // closing the window replays the primary's latest job
        let end = now + Duration::from_secs(60);
        network.tick(end);
        let events = settle(&mut network, &mut io, end);
        assert!(!network.is_donating());
        let replayed = jobs(&events);
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].id(), "held");
        assert_eq!(replayed[0].index(), 0);
    }

    #[test]
    fn test_primary_loss_during_donation_is_silent_until_window_ends() {
        let start = Instant::now();
        let mut io = MockIo::default();
        let mut network = network_with_donation();
        network.connect(start);
        settle(&mut network, &mut io, start);
        let (now, _) = run_to_donation(&mut network, &mut io, start);

        io.set_refusals(0, u32::MAX);
        network.on_io(0, 1, IoEvent::Closed(None), now);
        assert!(!network.drain_events().contains(&NetworkEvent::Pause));

        let end = now + Duration::from_secs(60);
        network.tick(end);
        let events = settle(&mut network, &mut io, end);
        assert!(events.contains(&NetworkEvent::Pause));
        assert_eq!(network.status().active, None);
        assert!(network.status().last_error.is_some());
    }
}
