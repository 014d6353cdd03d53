// src/stats/hashrate.rs
//! Rolling per-worker hashrate
//!
//! Each worker's cumulative hash counter is sampled on `tick`; rates are the
//! counter delta between the newest sample and the oldest sample still
//! inside a window, divided by the elapsed time between them.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Short, medium and long averaging windows
pub const WINDOWS: [Duration; 3] = [
    Duration::from_secs(10),
    Duration::from_secs(60),
    Duration::from_secs(15 * 60),
];

/// Hashrate over each of [`WINDOWS`], `None` while not enough samples exist
pub type Rates = [Option<f64>; 3];

/// Snapshot produced by [`Hashrate::report`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HashrateReport {
    /// Rates per worker, indexed by worker id
    pub workers: Vec<Rates>,
    /// Sum over all workers
    pub total: Rates,
    /// Highest short-window total seen so far
    pub highest: f64,
}

impl fmt::Display for HashrateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let format_rate = |rate: Option<f64>| match rate {
            Some(rate) => format!("{:.1}", rate),
            None => "n/a".to_string(),
        };
        write!(
            f,
            "speed 10s/60s/15m {} {} {} H/s max {:.1} H/s",
            format_rate(self.total[0]),
            format_rate(self.total[1]),
            format_rate(self.total[2]),
            self.highest
        )
    }
}

/// Sample store for every worker
#[derive(Debug, Default)]
pub struct Hashrate {
    samples: Vec<VecDeque<(Instant, u64)>>,
    highest: f64,
}

impl Hashrate {
    /// Creates an empty store for `workers` workers
    pub fn new(workers: usize) -> Self {
        Hashrate {
            samples: vec![VecDeque::new(); workers],
            highest: 0.0,
        }
    }

    /// Records worker `id`'s cumulative hash count at `now`
    pub fn add(&mut self, id: usize, hashes: u64, now: Instant) {
        if id >= self.samples.len() {
            self.samples.resize_with(id + 1, VecDeque::new);
        }
        let samples = &mut self.samples[id];
        samples.push_back((now, hashes));

        // keep one sample older than the longest window as its baseline
        let horizon = WINDOWS[2];
        while samples.len() > 2
            && samples
                .get(1)
                .is_some_and(|(at, _)| now.saturating_duration_since(*at) >= horizon)
        {
            samples.pop_front();
        }
    }

    /// Current rates for every worker and in total
    pub fn report(&self) -> HashrateReport {
        let workers: Vec<Rates> = self
            .samples
            .iter()
            .map(|samples| WINDOWS.map(|window| rate(samples, window)))
            .collect();

        let mut total = [None; 3];
        for (i, slot) in total.iter_mut().enumerate() {
            let known: Vec<f64> = workers.iter().filter_map(|rates| rates[i]).collect();
            if !known.is_empty() {
                *slot = Some(known.iter().sum());
            }
        }

        HashrateReport {
            workers,
            total,
            highest: self.highest.max(total[0].unwrap_or(0.0)),
        }
    }

    /// Updates the highest short-window total and returns the report
    pub fn update_highest(&mut self) -> HashrateReport {
        let report = self.report();
        self.highest = report.highest;
        report
    }
}

fn rate(samples: &VecDeque<(Instant, u64)>, window: Duration) -> Option<f64> {
    let &(newest_at, newest) = samples.back()?;
    let &(oldest_at, oldest) = samples
        .iter()
        .find(|(at, _)| newest_at.saturating_duration_since(*at) <= window)?;

    let elapsed = newest_at.saturating_duration_since(oldest_at).as_secs_f64();
    if elapsed <= 0.0 {
        return None;
    }
    Some(newest.saturating_sub(oldest) as f64 / elapsed)
}
