use std::env;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use dotenvy::dotenv;
use uuid::Uuid;

/// Configuration for the drain loop.
#[derive(Debug, Clone)]
pub struct DrainConfig {
    /// How long to wait between cycles when the last batch was not full.
    pub poll_interval: Duration,
    /// Maximum envelopes fetched per cycle. Must be at least 1.
    pub batch_size: usize,
    /// Consecutive failures after which an envelope is reported as poison.
    /// Must be at least 1; a threshold of 1 flags every failure.
    pub poison_threshold: u32,
    /// Envelopes whose consecutive failures are remembered at once. Past
    /// this, envelopes outside the current batch are forgotten.
    pub max_tracked_failures: usize,
    /// How long to back off after the store itself errors.
    pub error_backoff: Duration,
    /// Identifies this drainer in logs.
    pub worker_id: String,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            batch_size: 100,
            poison_threshold: 5,
            max_tracked_failures: 10_000,
            error_backoff: Duration::from_secs(1),
            worker_id: format!("courier-{}", Uuid::new_v4()),
        }
    }
}

impl DrainConfig {
    /// Create a default config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables
    ///
    /// Every variable is optional; unset ones keep their default.
    ///
    /// - `COURIER_POLL_INTERVAL_SECS`
    /// - `COURIER_BATCH_SIZE`
    /// - `COURIER_POISON_THRESHOLD`
    /// - `COURIER_WORKER_ID`
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            poll_interval: match lookup("COURIER_POLL_INTERVAL_SECS") {
                Some(secs) => Duration::from_secs(
                    secs.parse()
                        .context("COURIER_POLL_INTERVAL_SECS must be a whole number of seconds")?,
                ),
                None => defaults.poll_interval,
            },
            batch_size: match lookup("COURIER_BATCH_SIZE") {
                Some(size) => size
                    .parse()
                    .context("COURIER_BATCH_SIZE must be a valid number")?,
                None => defaults.batch_size,
            },
            poison_threshold: match lookup("COURIER_POISON_THRESHOLD") {
                Some(threshold) => threshold
                    .parse()
                    .context("COURIER_POISON_THRESHOLD must be a valid number")?,
                None => defaults.poison_threshold,
            },
            error_backoff: defaults.error_backoff,
            max_tracked_failures: defaults.max_tracked_failures,
            worker_id: lookup("COURIER_WORKER_ID").unwrap_or(defaults.worker_id),
        };

        ensure!(config.batch_size > 0, "COURIER_BATCH_SIZE must be at least 1");
        ensure!(
            config.poison_threshold > 0,
            "COURIER_POISON_THRESHOLD must be at least 1"
        );
        Ok(config)
    }
}
