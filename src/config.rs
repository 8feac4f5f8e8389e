//! Cranker configuration from environment variables

use solana_pubkey::Pubkey;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Tunables of the decision core, worker pool and retry scheduler
#[derive(Debug, Clone)]
pub struct CrankerConfig {
    /// Wallet paying for cranks; its balance feed gates every attempt
    pub wallet: Pubkey,

    /// No crank is attempted while the balance is at or below this (lamports)
    pub balance_threshold: u64,

    /// Minimum slot distance between two attempts on the same pipeline
    pub retry_cooldown_slots: u64,

    /// Retry scheduler timeout in milliseconds
    pub retry_delay_ms: u64,

    /// Upper bound of the random delay added to `retry_delay_ms`
    pub retry_jitter_ms: u64,

    /// Re-signal a pipeline after its crank failed
    pub retry_on_failure: bool,

    /// Treat a depleted wallet as agent-fatal
    pub halt_on_depleted: bool,

    pub worker_count: usize,
    pub worker_backoff_initial_ms: u64,
    pub worker_backoff_max_ms: u64,

    /// Retries of one crank request after its first failed submission
    pub worker_max_retries: u32,

    /// Capacity of the control command mailbox
    pub command_buffer: usize,

    pub rust_log: String,
}

impl CrankerConfig {
    /// Defaults for everything but the wallet
    pub fn new(wallet: Pubkey) -> Self {
        Self {
            wallet,
            balance_threshold: 10_000_000,
            retry_cooldown_slots: 30,
            retry_delay_ms: 10_000,
            retry_jitter_ms: 1_000,
            retry_on_failure: true,
            halt_on_depleted: false,
            worker_count: 1,
            worker_backoff_initial_ms: 500,
            worker_backoff_max_ms: 5_000,
            worker_max_retries: 2,
            command_buffer: 16,
            rust_log: "info".to_string(),
        }
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `CRANKER_WALLET` (required, base58 pubkey)
    /// - `BALANCE_THRESHOLD_LAMPORTS` (default: 10000000)
    /// - `RETRY_COOLDOWN_SLOTS` (default: 30)
    /// - `RETRY_DELAY_MS` (default: 10000)
    /// - `RETRY_JITTER_MS` (default: 1000)
    /// - `RETRY_ON_FAILURE` (default: true)
    /// - `HALT_ON_DEPLETED` (default: false)
    /// - `CRANK_WORKERS` (default: 1)
    /// - `WORKER_BACKOFF_INITIAL_MS` (default: 500)
    /// - `WORKER_BACKOFF_MAX_MS` (default: 5000)
    /// - `WORKER_MAX_RETRIES` (default: 2)
    /// - `COMMAND_BUFFER` (default: 16)
    /// - `RUST_LOG` (default: info)
    pub fn from_env() -> Result<Self, ConfigError> {
        let wallet_str = env::var("CRANKER_WALLET")
            .map_err(|_| ConfigError::MissingVariable("CRANKER_WALLET".to_string()))?;
        let wallet = Pubkey::from_str(wallet_str.trim()).map_err(|_| {
            ConfigError::InvalidValue(format!(
                "CRANKER_WALLET is not a valid pubkey: {}",
                wallet_str
            ))
        })?;

        let defaults = Self::new(wallet);

        let config = Self {
            wallet,
            balance_threshold: parse_or("BALANCE_THRESHOLD_LAMPORTS", defaults.balance_threshold),
            retry_cooldown_slots: parse_or("RETRY_COOLDOWN_SLOTS", defaults.retry_cooldown_slots),
            retry_delay_ms: parse_or("RETRY_DELAY_MS", defaults.retry_delay_ms),
            retry_jitter_ms: parse_or("RETRY_JITTER_MS", defaults.retry_jitter_ms),
            retry_on_failure: parse_bool_or("RETRY_ON_FAILURE", defaults.retry_on_failure),
            halt_on_depleted: parse_bool_or("HALT_ON_DEPLETED", defaults.halt_on_depleted),
            worker_count: parse_or("CRANK_WORKERS", defaults.worker_count),
            worker_backoff_initial_ms: parse_or(
                "WORKER_BACKOFF_INITIAL_MS",
                defaults.worker_backoff_initial_ms,
            ),
            worker_backoff_max_ms: parse_or(
                "WORKER_BACKOFF_MAX_MS",
                defaults.worker_backoff_max_ms,
            ),
            worker_max_retries: parse_or("WORKER_MAX_RETRIES", defaults.worker_max_retries),
            command_buffer: parse_or("COMMAND_BUFFER", defaults.command_buffer),
            rust_log: env::var("RUST_LOG").unwrap_or(defaults.rust_log),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::InvalidValue(
                "CRANK_WORKERS must be at least 1".to_string(),
            ));
        }

        if self.worker_backoff_initial_ms > self.worker_backoff_max_ms {
            return Err(ConfigError::InvalidValue(format!(
                "WORKER_BACKOFF_INITIAL_MS ({}) exceeds WORKER_BACKOFF_MAX_MS ({})",
                self.worker_backoff_initial_ms, self.worker_backoff_max_ms
            )));
        }

        if self.command_buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "COMMAND_BUFFER must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn retry_jitter(&self) -> Duration {
        Duration::from_millis(self.retry_jitter_ms)
    }
}

fn parse_or<T: FromStr>(var: &str, default: T) -> T {
    match env::var(var) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("Invalid {} '{}', using default", var, raw);
            default
        }),
        Err(_) => default,
    }
}

fn parse_bool_or(var: &str, default: bool) -> bool {
    env::var(var)
        .ok()
        .and_then(|s| s.trim().to_lowercase().parse::<bool>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 6] = [
        "CRANKER_WALLET",
        "BALANCE_THRESHOLD_LAMPORTS",
        "RETRY_COOLDOWN_SLOTS",
        "CRANK_WORKERS",
        "HALT_ON_DEPLETED",
        "WORKER_BACKOFF_INITIAL_MS",
    ];

    fn clear() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    // Single test: environment variables are process-global
    #[test]
    fn test_config_from_env() {
        clear();
        assert_eq!(
            CrankerConfig::from_env().unwrap_err(),
            ConfigError::MissingVariable("CRANKER_WALLET".to_string())
        );

        env::set_var("CRANKER_WALLET", "not-a-key");
        assert!(matches!(
            CrankerConfig::from_env(),
            Err(ConfigError::InvalidValue(_))
        ));

        let wallet = Pubkey::new_from_array([7; 32]);
        env::set_var("CRANKER_WALLET", wallet.to_string());
        let config = CrankerConfig::from_env().unwrap();
        assert_eq!(config.wallet, wallet);
        assert_eq!(config.balance_threshold, 10_000_000);
        assert_eq!(config.retry_cooldown_slots, 30);
        assert_eq!(config.worker_count, 1);
        assert!(config.retry_on_failure);
        assert!(!config.halt_on_depleted);

        env::set_var("BALANCE_THRESHOLD_LAMPORTS", "5000");
        env::set_var("RETRY_COOLDOWN_SLOTS", "garbage");
        env::set_var("HALT_ON_DEPLETED", "TRUE");
        let config = CrankerConfig::from_env().unwrap();
        assert_eq!(config.balance_threshold, 5_000);
        assert_eq!(config.retry_cooldown_slots, 30);
        assert!(config.halt_on_depleted);

        env::set_var("CRANK_WORKERS", "0");
        assert!(matches!(
            CrankerConfig::from_env(),
            Err(ConfigError::InvalidValue(_))
        ));

        env::set_var("CRANK_WORKERS", "2");
        env::set_var("WORKER_BACKOFF_INITIAL_MS", "999999");
        assert!(matches!(
            CrankerConfig::from_env(),
            Err(ConfigError::InvalidValue(_))
        ));

        clear();
    }
}
