// src/coordinator.rs
//! Top-level mining controller
//!
//! The coordinator owns the worker pool, the result consumer thread and the
//! network thread. Jobs flow from the network thread into the sequencer;
//! results flow from the consumer thread to the network thread over a tokio
//! channel so workers never wait on network IO.
//!
//! Pause and resume requests are forwarded to the network thread as well, so
//! it stays the only thread that writes jobs into the sequencer.

use crate::miner::job::{Job, JobResult};
use crate::miner::results::{ResultConsumer, ResultQueue};
use crate::miner::sequencer::SequencerRegistry;
use crate::miner::worker::WorkerState;
use crate::miner::worker_pool::{BackendConfig, DEFAULT_BATCH_SIZE, WorkerPool};
use crate::network::dispatch::{DonationConfig, Network, NetworkEvent, NetworkStatus};
use crate::network::pool::{NetworkSettings, PoolConfig};
use crate::network::transport::IoDriver;
use crate::stats::{HashrateReport, ShareSnapshot, ShareStats, StatsReporter};
use crate::types::BackendType;
use crate::utils::error::MinerError;
use arc_swap::{ArcSwap, ArcSwapOption};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

/// Callback invoked on the network thread for every installed job
pub type JobListener = Box<dyn Fn(&Job) + Send + Sync>;

/// Callback invoked on the network thread for every answered result, with
/// the rejection reason when the endpoint refused it
pub type ResultListener = Box<dyn Fn(&JobResult, Option<&str>) + Send + Sync>;

/// Coordinator-wide settings
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorSettings {
    /// Settings shared by every protocol client
    pub network: NetworkSettings,
    /// Nonces per worker reservation
    pub batch_size: u64,
    /// Status line interval, zero disables it
    pub print_time: Duration,
    /// Network housekeeping cadence
    pub tick: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        CoordinatorSettings {
            network: NetworkSettings::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            print_time: Duration::from_secs(60),
            tick: Duration::from_secs(1),
        }
    }
}

#[derive(Default)]
struct Shared {
    job_listener: ArcSwapOption<JobListener>,
    result_listener: ArcSwapOption<ResultListener>,
    status: ArcSwap<NetworkStatus>,
}

/// Requests from the owning thread to the network thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Pause,
    Resume,
}

struct Running {
    pool: Arc<WorkerPool>,
    consumer: ResultConsumer,
    network: Option<JoinHandle<()>>,
    control: UnboundedSender<Control>,
    stop: Option<oneshot::Sender<()>>,
}

/// Owns the worker pool, result pipeline and network thread
pub struct Coordinator {
    settings: CoordinatorSettings,
    backends: Vec<BackendConfig>,
    stats: Arc<ShareStats>,
    shared: Arc<Shared>,
    running: Option<Running>,
}

impl Coordinator {
    /// Creates an idle coordinator
    ///
    /// # Arguments
    /// * `settings` - Network, batch and reporting settings
    /// * `backends` - Hasher factories and their thread counts
    pub fn new(settings: CoordinatorSettings, backends: Vec<BackendConfig>) -> Self {
        Coordinator {
            settings,
            backends,
            stats: Arc::new(ShareStats::default()),
            shared: Arc::new(Shared::default()),
            running: None,
        }
    }

    /// Starts workers and connects to the pools
    ///
    /// Worker self-tests run first; if any fails nothing is left running and
    /// the error is returned. Network failures never fail `start`, they show
    /// up in [`Coordinator::status`].
    ///
    /// # Arguments
    /// * `pools` - Primary pools in failover order
    /// * `donation` - Donation level and endpoints
    pub fn start(&mut self, pools: &[PoolConfig], donation: &DonationConfig) -> Result<(), MinerError> {
        if self.running.is_some() {
            return Err(MinerError::TaskError("coordinator already started".into()));
        }

        let network = Network::new(&self.settings.network, pools, donation)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let registry = Arc::new(SequencerRegistry::new());
        let verifier = self
            .backends
            .iter()
            .find(|backend| backend.factory.backend() == BackendType::Cpu)
            .map(|backend| backend.factory.clone());
        let queue = ResultQueue::new(verifier, self.stats.clone());
        let pool = Arc::new(WorkerPool::new(
            registry.clone(),
            queue.sink(),
            self.settings.batch_size,
        ));
        pool.start(&self.backends)?;

        let (result_tx, result_rx) = unbounded_channel();
        let consumer = match queue.spawn(move |result| {
            if result_tx.send(result).is_err() {
                log::debug!("network thread gone, dropping result");
            }
        }) {
            Ok(consumer) => consumer,
            Err(e) => {
                pool.stop();
                return Err(e);
            }
        };

        self.shared.status.store(Arc::new(NetworkStatus::default()));

        let (stop_tx, stop_rx) = oneshot::channel();
        let (control_tx, control_rx) = unbounded_channel();
        let network_loop = NetworkLoop {
            network,
            registry,
            pool: pool.clone(),
            stats: self.stats.clone(),
            shared: self.shared.clone(),
            reporter: StatsReporter::new(self.settings.print_time),
            user_paused: false,
            network_paused: false,
        };
        let tick = self.settings.tick;
        let spawned = std::thread::Builder::new()
            .name("network".into())
            .spawn(move || {
                runtime.block_on(network_loop.run(result_rx, control_rx, stop_rx, tick))
            });

        let network_thread = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                pool.stop();
                drop(consumer);
                return Err(e.into());
            }
        };

        self.running = Some(Running {
            pool,
            consumer,
            network: Some(network_thread),
            control: control_tx,
            stop: Some(stop_tx),
        });
        Ok(())
    }

    /// Stops mining and disconnects; joins every thread
    pub fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        running.pool.stop();
        running.consumer.stop();
        if let Some(stop) = running.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = running.network.take() {
            if thread.join().is_err() {
                log::error!("network thread panicked");
            }
        }
        log::info!("coordinator stopped");
    }

    /// Suspends mining without touching the connections
    ///
    /// Takes effect on the network thread shortly after the call returns.
    pub fn pause(&self) {
        self.send_control(Control::Pause);
    }

    /// Resumes mining on the latest job
    ///
    /// Stays paused while no endpoint is serving work.
    pub fn resume(&self) {
        self.send_control(Control::Resume);
    }

    fn send_control(&self, control: Control) {
        let Some(running) = &self.running else {
            log::debug!("{:?} ignored, coordinator not running", control);
            return;
        };
        if running.control.send(control).is_err() {
            log::warn!("network thread gone, {:?} ignored", control);
        }
    }

    /// Installs the callback for new jobs
    pub fn set_job_listener<F>(&self, listener: F)
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        let listener: JobListener = Box::new(listener);
        self.shared.job_listener.store(Some(Arc::new(listener)));
    }

    /// Installs the callback for answered results
    pub fn set_result_listener<F>(&self, listener: F)
    where
        F: Fn(&JobResult, Option<&str>) + Send + Sync + 'static,
    {
        let listener: ResultListener = Box::new(listener);
        self.shared.result_listener.store(Some(Arc::new(listener)));
    }

    /// Per-worker and total hashrate
    pub fn current_hashrate(&self) -> HashrateReport {
        self.running
            .as_ref()
            .map(|running| running.pool.hashrate())
            .unwrap_or_default()
    }

    /// Lifecycle state of each worker
    pub fn worker_states(&self) -> Vec<(BackendType, WorkerState)> {
        self.running
            .as_ref()
            .map(|running| running.pool.worker_states())
            .unwrap_or_default()
    }

    /// Share counters
    pub fn shares(&self) -> ShareSnapshot {
        self.stats.snapshot()
    }

    /// Connection situation as last seen by the network thread
    pub fn status(&self) -> NetworkStatus {
        self.shared.status.load_full().as_ref().clone()
    }

    /// Whether `start` succeeded and `stop` was not called yet
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the network thread
struct NetworkLoop {
    network: Network,
    registry: Arc<SequencerRegistry>,
    pool: Arc<WorkerPool>,
    stats: Arc<ShareStats>,
    shared: Arc<Shared>,
    reporter: StatsReporter,
    user_paused: bool,
    network_paused: bool,
}

impl NetworkLoop {
    async fn run(
        mut self,
        mut results: UnboundedReceiver<JobResult>,
        mut control: UnboundedReceiver<Control>,
        mut stop: oneshot::Receiver<()>,
        tick: Duration,
    ) {
        let (io_tx, mut io_rx) = unbounded_channel();
        let mut driver = IoDriver::new(io_tx);
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.network.connect(Instant::now());
        self.flush(&mut driver);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                Some((client, epoch, event)) = io_rx.recv() => {
                    self.network.on_io(client, epoch, event, Instant::now());
                }
                Some(result) = results.recv() => {
                    if self.network.submit(result, Instant::now()).is_none() {
                        log::debug!("result dropped, no endpoint for its session");
                    }
                }
                Some(request) = control.recv() => self.control(request),
                _ = ticker.tick() => {
                    let now = Instant::now();
                    self.network.tick(now);
                    self.pool.tick(now);
                    let hashrate = self.pool.hashrate();
                    self.reporter.maybe_report(now, &hashrate, self.stats.snapshot());
                }
            }
            self.flush(&mut driver);
        }

        self.network.disconnect();
        self.flush(&mut driver);
        driver.shutdown();
        log::debug!("network loop finished");
    }

    fn flush(&mut self, driver: &mut IoDriver) {
        for command in self.network.drain_commands() {
            driver.execute(command);
        }
        for event in self.network.drain_events() {
            self.handle(event);
        }
        self.shared.status.store(Arc::new(self.network.status()));
    }

    fn control(&mut self, request: Control) {
        match request {
            Control::Pause => {
                self.user_paused = true;
                self.registry.pause();
                log::info!("paused");
            }
            Control::Resume => {
                self.user_paused = false;
                if self.network_paused {
                    log::info!("resume deferred until an endpoint serves work");
                } else {
                    self.registry.resume();
                    log::info!("resumed");
                }
            }
        }
    }

    fn handle(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Job(job) => {
                self.pool.job_early_notification(&job);
                self.registry.install_job(job.clone());
                self.network_paused = false;
                if self.registry.is_paused() && !self.user_paused {
                    self.registry.resume();
                }
                if let Some(listener) = self.shared.job_listener.load_full() {
                    listener(&job);
                }
            }
            NetworkEvent::Pause => {
                log::warn!("no active connection, mining paused");
                self.network_paused = true;
                self.registry.pause();
            }
            NetworkEvent::Active { url, donation } => {
                if donation {
                    log::info!("switched to donation endpoint {}", url);
                } else {
                    log::info!("mining on {}", url);
                }
            }
            NetworkEvent::ResultAccepted {
                result,
                error,
                latency,
            } => {
                match &error {
                    None => {
                        self.stats.add_accepted(result.difficulty, latency);
                        let shares = self.stats.snapshot();
                        log::info!(
                            "accepted ({}/{}) diff {} ({} ms)",
                            shares.accepted,
                            shares.rejected,
                            result.difficulty,
                            latency.as_millis()
                        );
                    }
                    Some(reason) => {
                        self.stats.add_rejected(latency);
                        let shares = self.stats.snapshot();
                        log::warn!(
                            "rejected ({}/{}) diff {} \"{}\" ({} ms)",
                            shares.accepted,
                            shares.rejected,
                            result.difficulty,
                            reason,
                            latency.as_millis()
                        );
                    }
                }
                if let Some(listener) = self.shared.result_listener.load_full() {
                    listener(&result, error.as_deref());
                }
            }
        }
    }
}
