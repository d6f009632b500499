use serde::Deserialize;
use std::{fs, path::Path, time::Duration};
use anyhow::{Context, Result};

use crate::builder::{FeePolicy, DEFAULT_FEE_RATE, DEFAULT_MIN_FEE};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub fees: Fees,
    #[serde(default)]
    pub polling: Polling,
    #[serde(default)]
    pub oracle: Oracle,
    #[serde(default)]
    pub metrics: Metrics,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Storage {
    #[serde(default = "default_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct Fees {
    #[serde(default = "default_fee_rate")]
    pub fee_rate: u64,             // nicks per word
    #[serde(default = "default_min_fee")]
    pub min_fee: u64,
}

/// Acceptance is a short bounded poll; inclusion a long one with a time budget.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct Polling {
    #[serde(default = "default_acceptance_interval_ms")]
    pub acceptance_interval_ms: u64,
    #[serde(default = "default_acceptance_attempts")]
    pub acceptance_attempts: u32,
    #[serde(default = "default_inclusion_interval_secs")]
    pub inclusion_interval_secs: u64,
    #[serde(default = "default_inclusion_budget_secs")]
    pub inclusion_budget_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Oracle {
    #[serde(default = "default_endpoint")]
    pub ledger_endpoint: String,
    #[serde(default = "default_settle_ms")]
    pub signer_settle_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub query_retry_attempts: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub query_retry_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Metrics {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_path() -> String { "./data".into() }
fn default_fee_rate() -> u64 { DEFAULT_FEE_RATE }
fn default_min_fee() -> u64 { DEFAULT_MIN_FEE }
fn default_acceptance_interval_ms() -> u64 { 2_000 }
fn default_acceptance_attempts() -> u32 { 15 }
fn default_inclusion_interval_secs() -> u64 { 30 }
fn default_inclusion_budget_secs() -> u64 { 30 * 60 }
fn default_endpoint() -> String { "http://127.0.0.1:5555".into() }
fn default_settle_ms() -> u64 { 500 }
fn default_retry_attempts() -> usize { 3 }
fn default_retry_delay_ms() -> u64 { 1_000 }
fn default_bind() -> String { "0.0.0.0:9100".into() }

impl Default for Storage {
    fn default() -> Self { Storage { path: default_path() } }
}

impl Default for Fees {
    fn default() -> Self { Fees { fee_rate: default_fee_rate(), min_fee: default_min_fee() } }
}

impl Default for Polling {
    fn default() -> Self {
        Polling {
            acceptance_interval_ms: default_acceptance_interval_ms(),
            acceptance_attempts: default_acceptance_attempts(),
            inclusion_interval_secs: default_inclusion_interval_secs(),
            inclusion_budget_secs: default_inclusion_budget_secs(),
        }
    }
}

impl Default for Oracle {
    fn default() -> Self {
        Oracle {
            ledger_endpoint: default_endpoint(),
            signer_settle_ms: default_settle_ms(),
            query_retry_attempts: default_retry_attempts(),
            query_retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self { Metrics { bind: default_bind() } }
}

impl Fees {
    pub fn policy(&self) -> FeePolicy {
        FeePolicy { fee_rate: self.fee_rate, min_fee: self.min_fee }
    }
}

impl Polling {
    pub fn acceptance_interval(&self) -> Duration { Duration::from_millis(self.acceptance_interval_ms) }
    pub fn inclusion_interval(&self) -> Duration { Duration::from_secs(self.inclusion_interval_secs) }
    pub fn inclusion_budget(&self) -> Duration { Duration::from_secs(self.inclusion_budget_secs) }
}

impl Oracle {
    pub fn settle_delay(&self) -> Duration { Duration::from_millis(self.signer_settle_ms) }
    pub fn retry_delay(&self) -> Duration { Duration::from_millis(self.query_retry_delay_ms) }
}

/// Read the TOML file at `p` and deserialize into `Config`.
/// *Adds context* so user errors print a friendlier message.
///
/// # Errors
/// * Returns an anyhow::Error if the file cannot be read or parsed.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("🗂️  couldn’t read config file {}", p.as_ref().display()))?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<Config> {
    toml::from_str(text)
        .with_context(|| "📝  invalid TOML in config file".to_string())
}
