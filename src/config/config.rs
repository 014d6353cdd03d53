// src/config/config.rs
use crate::{
    coordinator::CoordinatorSettings,
    miner::worker_pool::DEFAULT_BATCH_SIZE,
    network::{dispatch::DonationConfig, pool::NetworkSettings, pool::PoolConfig},
    utils::error::MinerError,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Highest accepted donation level in percent
pub const MAX_DONATE_LEVEL: u8 = 99;

/// Main configuration structure for the mining application
///
/// Contains the ordered pool list, reconnect policy, CPU worker settings,
/// RandomX mode and the donation schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Primary pools in failover order
    #[serde(default)]
    pub pools: Vec<PoolConfig>,

    /// Consecutive failures tolerated before moving to the next pool
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Base reconnect pause in seconds
    #[serde(default = "default_retry_pause")]
    pub retry_pause: u64,

    /// Seconds between status lines, 0 disables them
    #[serde(default = "default_print_time")]
    pub print_time: u64,

    /// User agent sent at login (default: crate name and version)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,

    /// CPU backend settings
    #[serde(default)]
    pub cpu: CpuConfig,

    /// RandomX kernel settings
    #[serde(default)]
    pub randomx: RandomXConfig,

    /// Donation schedule
    #[serde(default)]
    pub donate: DonateConfig,
}

/// CPU worker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuConfig {
    /// Whether CPU workers are started at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Number of worker threads, 0 means one per logical core
    #[serde(default)]
    pub threads: usize,

    /// Size of nonce batches each worker reserves at once
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
}

/// RandomX kernel settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RandomXConfig {
    /// Build the full dataset (about 2 GiB) instead of the light cache
    #[serde(default)]
    pub fast: bool,
}

/// Donation settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DonateConfig {
    /// Minutes out of every 100 spent on the donation pools, 0 disables
    #[serde(default)]
    pub level: u8,

    /// Donation endpoints in failover order
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
}

fn default_retries() -> u32 {
    5
}

fn default_retry_pause() -> u64 {
    5
}

fn default_print_time() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> u64 {
    DEFAULT_BATCH_SIZE
}

impl Default for CpuConfig {
    fn default() -> Self {
        CpuConfig {
            enabled: true,
            threads: 0,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl Config {
    /// Loads and validates configuration from a file
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file (TOML format)
    ///
    /// # Returns
    /// * `Ok(Config)` - Successfully loaded configuration
    /// * `Err(MinerError)` - If file couldn't be read, parsed or validated
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, MinerError> {
        let path = path.into();
        let config_str = std::fs::read_to_string(&path).map_err(|e| {
            MinerError::ConfigError(format!(
                "Failed to read config at {}: {}",
                path.display(),
                e
            ))
        })?;

        let config = Self::parse(&config_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document without validating it
    pub fn parse(config_str: &str) -> Result<Self, MinerError> {
        toml::from_str(config_str)
            .map_err(|e| MinerError::ConfigError(format!("Invalid config format: {}", e)))
    }

    /// Checks cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), MinerError> {
        if !self.pools.iter().any(|pool| pool.enabled) {
            return Err(MinerError::ConfigError(
                "at least one enabled [[pools]] entry is required".into(),
            ));
        }
        for pool in self.pools.iter().filter(|pool| pool.enabled) {
            pool.validate()?;
        }

        if !self.cpu.enabled {
            return Err(MinerError::ConfigError(
                "no backend enabled, set cpu.enabled = true".into(),
            ));
        }
        if self.cpu.batch_size == 0 {
            return Err(MinerError::ConfigError("cpu.batch_size must be positive".into()));
        }

        if self.donate.level > MAX_DONATE_LEVEL {
            return Err(MinerError::ConfigError(format!(
                "donate.level {} is above {}",
                self.donate.level, MAX_DONATE_LEVEL
            )));
        }
        if self.donate.level > 0 && !self.donate.pools.iter().any(|pool| pool.enabled) {
            return Err(MinerError::ConfigError(
                "donate.level is set but no donate.pools entry is enabled".into(),
            ));
        }
        for pool in self.donate.pools.iter().filter(|pool| pool.enabled) {
            pool.validate()?;
        }

        for url in self.tls_pools() {
            log::warn!(
                "pool {} requires TLS, which this build does not provide; it will never become active",
                url
            );
        }
        Ok(())
    }

    /// URLs of enabled pools that need a TLS transport
    pub fn tls_pools(&self) -> Vec<&str> {
        self.pools
            .iter()
            .chain(&self.donate.pools)
            .filter(|pool| pool.enabled)
            .filter(|pool| pool.endpoint().map(|endpoint| endpoint.tls).unwrap_or(false))
            .map(|pool| pool.url.as_str())
            .collect()
    }

    /// Number of CPU worker threads to start
    pub fn cpu_threads(&self) -> usize {
        if self.cpu.threads == 0 {
            num_cpus::get()
        } else {
            self.cpu.threads
        }
    }

    /// Settings shared by every protocol client
    pub fn network_settings(&self) -> NetworkSettings {
        let mut settings = NetworkSettings {
            retries: self.retries,
            retry_pause: Duration::from_secs(self.retry_pause),
            ..NetworkSettings::default()
        };
        if let Some(agent) = &self.agent {
            settings.agent = agent.clone();
        }
        settings
    }

    /// Settings for [`crate::coordinator::Coordinator::new`]
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            network: self.network_settings(),
            batch_size: self.cpu.batch_size,
            print_time: Duration::from_secs(self.print_time),
            ..CoordinatorSettings::default()
        }
    }

    /// Donation schedule for [`crate::coordinator::Coordinator::start`]
    pub fn donation(&self) -> DonationConfig {
        DonationConfig {
            level: self.donate.level,
            pools: self.donate.pools.clone(),
        }
    }

    /// Generates a configuration template string
    ///
    /// # Arguments
    /// * `donate` - Include a commented-out donation section
    ///
    /// # Returns
    /// String containing a commented TOML configuration template
    pub fn generate_template(donate: bool) -> String {
        let mut template = String::new();
        template.push_str("# xmr_core-rs configuration\n\n");
        template.push_str("# Consecutive failures before switching to the next pool\n");
        template.push_str("retries = 5\n");
        template.push_str("# Base reconnect pause in seconds (grows linearly, capped at 6x)\n");
        template.push_str("retry_pause = 5\n");
        template.push_str("# Seconds between status lines (0 = off)\n");
        template.push_str("print_time = 60\n\n");

        template.push_str("# Pools are tried in order; the first one is preferred\n");
        template.push_str("[[pools]]\n");
        template.push_str("url = \"stratum+tcp://pool.example.com:3333\"\n");
        template.push_str("user = \"your_wallet_address\"\n");
        template.push_str("password = \"x\"\n");
        template.push_str("# rig_id = \"rig01\"\n");
        template.push_str("# keepalive = 60\n");
        template.push_str("# socks5 = \"127.0.0.1:9050\"\n\n");

        template.push_str("[[pools]]\n");
        template.push_str("url = \"ws://backup.example.com:8080/ws\"\n");
        template.push_str("user = \"your_wallet_address\"\n\n");

        template.push_str("[cpu]\n");
        template.push_str("enabled = true\n");
        template.push_str("# Worker threads (0 = one per logical core)\n");
        template.push_str("threads = 0\n");
        template.push_str("# Nonces reserved per batch\n");
        template.push_str(&format!("batch_size = {}\n\n", DEFAULT_BATCH_SIZE));

        template.push_str("[randomx]\n");
        template.push_str("# Full dataset: ~2 GiB of memory, much higher hashrate\n");
        template.push_str("fast = false\n");

        if donate {
            template.push_str("\n# Minutes out of every 100 spent on the donation pools\n");
            template.push_str("# [donate]\n");
            template.push_str("# level = 1\n");
            template.push_str("# [[donate.pools]]\n");
            template.push_str("# url = \"stratum+tcp://donate.example.com:3333\"\n");
            template.push_str("# user = \"donation_wallet_address\"\n");
        }

        template
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parses_and_validates() {
        let config = Config::parse(&Config::generate_template(true)).unwrap();
        config.validate().unwrap();
        assert_eq!(config.pools.len(), 2);
        assert_eq!(config.pools[0].password, "x");
        assert_eq!(config.pools[1].password, "x");
        assert_eq!(config.cpu.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.donate.level, 0);
        assert!(!config.randomx.fast);
    }

    #[test]
    fn test_tls_pools_reported() {
        let config = Config::parse(
            r#"
            [[pools]]
            url = "stratum+ssl://secure.example.com:443"
            user = "wallet"

            [[pools]]
            url = "plain.example.com:3333"
            user = "wallet"
            tls = true

            [[pools]]
            url = "other.example.com:3333"
            user = "wallet"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(
            config.tls_pools(),
            vec!["stratum+ssl://secure.example.com:443", "plain.example.com:3333"]
        );
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = Config::parse(
            r#"
            [[pools]]
            url = "pool.example.com:3333"
            user = "wallet"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.retries, 5);
        assert_eq!(config.retry_pause, 5);
        assert!(config.cpu.enabled);
        assert_eq!(config.cpu_threads(), num_cpus::get());

        let settings = config.coordinator_settings();
        assert_eq!(settings.network.retry_pause, Duration::from_secs(5));
        assert_eq!(settings.print_time, Duration::from_secs(60));
        assert!(settings.network.agent.starts_with("xmr_core-rs/"));
    }

    #[test]
    fn test_overrides_reach_settings() {
        let config = Config::parse(
            r#"
            retries = 1
            retry_pause = 2
            agent = "rig/1.0"

            [[pools]]
            url = "stratum+ssl://pool.example.com:443"
            user = "wallet"
            keepalive = 0

            [cpu]
            threads = 3
            batch_size = 1024

            [donate]
            level = 2
            [[donate.pools]]
            url = "donate.example.com:3333"
            user = "donor"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.cpu_threads(), 3);
        assert_eq!(config.pools[0].keepalive, Some(0));

        let settings = config.coordinator_settings();
        assert_eq!(settings.network.retries, 1);
        assert_eq!(settings.network.agent, "rig/1.0");
        assert_eq!(settings.batch_size, 1024);

        let donation = config.donation();
        assert_eq!(donation.level, 2);
        assert_eq!(donation.pools[0].user, "donor");
    }

    #[test]
    fn test_validation_errors() {
        let no_pools = Config::parse("retries = 3").unwrap();
        assert!(matches!(no_pools.validate(), Err(MinerError::ConfigError(_))));

        let disabled = Config::parse(
            r#"
            [[pools]]
            url = "pool.example.com:3333"
            enabled = false
            "#,
        )
        .unwrap();
        assert!(disabled.validate().is_err());

        let donate_without_pools = Config::parse(
            r#"
            [[pools]]
            url = "pool.example.com:3333"
            user = "wallet"
            [donate]
            level = 5
            "#,
        )
        .unwrap();
        assert!(donate_without_pools.validate().is_err());

        let zero_batch = Config::parse(
            r#"
            [[pools]]
            url = "pool.example.com:3333"
            user = "wallet"
            [cpu]
            batch_size = 0
            "#,
        )
        .unwrap();
        assert!(zero_batch.validate().is_err());
    }

    #[test]
    fn test_syntax_error_is_config_error() {
        assert!(matches!(
            Config::parse("[[pools]\nurl ="),
            Err(MinerError::ConfigError(_))
        ));
    }

    #[test]
    fn test_load_reports_missing_file() {
        let err = Config::load("/nonexistent/xmr_core-rs.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/xmr_core-rs.toml"));
    }
}
