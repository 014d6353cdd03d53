// src/stats/reporter.rs
use crate::stats::hashrate::HashrateReport;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use sysinfo::{Components, System};

/// Share outcome counters shared by the network thread and the result
/// consumer
#[derive(Debug, Default)]
pub struct ShareStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    invalid: AtomicU64,
    total_difficulty: AtomicU64,
    latency_ms: AtomicU64,
    answered: AtomicU64,
}

/// Point-in-time copy of [`ShareStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShareSnapshot {
    /// Shares the endpoint accepted
    pub accepted: u64,
    /// Shares the endpoint rejected or never answered
    pub rejected: u64,
    /// GPU candidates that failed CPU re-verification
    pub invalid: u64,
    /// Sum of the difficulty of accepted shares
    pub total_difficulty: u64,
    /// Mean submit round-trip in milliseconds
    pub avg_latency_ms: u64,
}

impl ShareStats {
    /// Counts an accepted share
    pub fn add_accepted(&self, difficulty: u64, latency: Duration) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.total_difficulty.fetch_add(difficulty, Ordering::Relaxed);
        self.add_latency(latency);
    }

    /// Counts a rejected or timed-out share
    pub fn add_rejected(&self, latency: Duration) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        self.add_latency(latency);
    }

    /// Counts a candidate that failed verification
    pub fn add_invalid(&self) {
        self.invalid.fetch_add(1, Ordering::Relaxed);
    }

    fn add_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.fetch_add(millis, Ordering::Relaxed);
        self.answered.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counter values
    pub fn snapshot(&self) -> ShareSnapshot {
        let answered = self.answered.load(Ordering::Relaxed);
        ShareSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            total_difficulty: self.total_difficulty.load(Ordering::Relaxed),
            avg_latency_ms: self
                .latency_ms
                .load(Ordering::Relaxed)
                .checked_div(answered)
                .unwrap_or(0),
        }
    }
}

/// Statistics related to hardware performance
#[derive(Debug, Clone)]
pub struct HardwareStats {
    /// Current CPU usage percentage (0-100)
    pub cpu_usage: f32,
    /// Memory currently used by the system (in bytes)
    pub memory_used: u64,
    /// Current CPU temperature in Celsius, 0 when no sensor reports one
    pub temperature: f32,
}

/// Periodic one-line status report
pub struct StatsReporter {
    /// System information collector
    system: System,
    /// Hardware component information collector
    components: Components,
    /// Interval at which stats are reported
    report_interval: Duration,
    last_report: Option<Instant>,
}

impl StatsReporter {
    /// Creates a new StatsReporter with the specified reporting interval
    ///
    /// # Arguments
    /// * `report_interval` - How often to log statistics, zero disables it
    pub fn new(report_interval: Duration) -> Self {
        StatsReporter {
            system: System::new(),
            components: Components::new_with_refreshed_list(),
            report_interval,
            last_report: None,
        }
    }

    /// Gets the current hardware statistics
    ///
    /// This refreshes system information before returning the stats.
    pub fn get_hardware_stats(&mut self) -> HardwareStats {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();
        self.components.refresh(true);

        let cpus = self.system.cpus();
        let cpu_usage = if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32
        };

        let temperature = self
            .components
            .iter()
            .find(|c| c.label().contains("CPU"))
            .and_then(|c| c.temperature())
            .unwrap_or(0.0);

        HardwareStats {
            cpu_usage,
            memory_used: self.system.used_memory(),
            temperature,
        }
    }

    /// Logs the status line when the interval elapsed since the last one
    ///
    /// # Returns
    /// The logged line, if one was due
    pub fn maybe_report(
        &mut self,
        now: Instant,
        hashrate: &HashrateReport,
        shares: ShareSnapshot,
    ) -> Option<String> {
        if self.report_interval.is_zero() {
            return None;
        }
        match self.last_report {
            None => {
                self.last_report = Some(now);
                return None;
            }
            Some(last) if now.saturating_duration_since(last) < self.report_interval => {
                return None;
            }
            Some(_) => {}
        }
        self.last_report = Some(now);

        let hardware = self.get_hardware_stats();
        let line = format_status(hashrate, shares, &hardware);
        log::info!("{}", line);
        Some(line)
    }
}

/// Renders the periodic status line
pub fn format_status(
    hashrate: &HashrateReport,
    shares: ShareSnapshot,
    hardware: &HardwareStats,
) -> String {
    format!(
        "{} | accepted/rejected/invalid: {}/{}/{} | diff total: {} | latency: {} ms | CPU: {:.1}% | Temp: {:.1}°C",
        hashrate,
        shares.accepted,
        shares.rejected,
        shares.invalid,
        shares.total_difficulty,
        shares.avg_latency_ms,
        hardware.cpu_usage,
        hardware.temperature
    )
}
