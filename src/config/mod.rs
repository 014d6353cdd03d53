// src/config/mod.rs
//! Configuration management for the mining core
//!
//! This module handles all configuration-related functionality including:
//! - Loading, parsing and validating configuration files
//! - Generating configuration templates
//! - Deriving coordinator, network and donation settings
//!
//! The configuration uses TOML format: an ordered `[[pools]]` list plus
//! `[cpu]`, `[randomx]` and `[donate]` sections.

/// Core configuration implementation
///
/// Contains the [`Config`] struct and related types that define
/// the miner's configuration structure and behavior.
pub mod config;

// Re-export key items for easy access
pub use config::{Config, CpuConfig, DonateConfig, RandomXConfig};

use crate::utils::error::MinerError;
use std::path::PathBuf;

/// Loads and validates miner configuration from a TOML file
///
/// # Arguments
/// * `path` - Path to the configuration file (anything convertible to PathBuf)
///
/// # Returns
/// * `Ok(Config)` - Successfully loaded configuration
/// * `Err(MinerError)` - If the file couldn't be read, parsed or validated
pub fn load(path: impl Into<PathBuf>) -> Result<Config, MinerError> {
    Config::load(path)
}

/// Generates a commented configuration template
///
/// # Arguments
/// * `donate` - Whether to include the commented donation section
///
/// # Returns
/// String containing a ready-to-use TOML configuration template
pub fn generate_template(donate: bool) -> String {
    Config::generate_template(donate)
}
