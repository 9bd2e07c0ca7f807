//! Configuration for the worker controllers.

use std::time::Duration;

use anyhow::{Context, Result};
use nodepool_reconcile::{BackoffPolicy, ControllerOptions};

/// Worker controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend type handled by this process; workers of other types are
    /// ignored.
    pub extension_type: String,

    /// Reconcile on every spec change instead of waiting for the operation
    /// annotation.
    pub ignore_operation_annotation: bool,

    /// Workers per controller.
    pub max_concurrent_reconciles: usize,

    /// First retry delay after a failed reconcile.
    pub backoff_base: Duration,

    /// Upper bound for retry delays.
    pub backoff_max: Duration,

    /// How long in-flight reconciles may finish after shutdown.
    pub drain_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            extension_type: "local".to_string(),
            ignore_operation_annotation: false,
            max_concurrent_reconciles: 5,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(300),
            drain_timeout: Duration::from_secs(30),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let extension_type = lookup("NODEPOOL_EXTENSION_TYPE").unwrap_or(defaults.extension_type);

        let ignore_operation_annotation = lookup("NODEPOOL_IGNORE_OPERATION_ANNOTATION")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(defaults.ignore_operation_annotation);

        let max_concurrent_reconciles = match lookup("NODEPOOL_MAX_CONCURRENT_RECONCILES") {
            Some(v) => v
                .parse()
                .context("NODEPOOL_MAX_CONCURRENT_RECONCILES must be a positive integer")?,
            None => defaults.max_concurrent_reconciles,
        };
        if max_concurrent_reconciles == 0 {
            anyhow::bail!("NODEPOOL_MAX_CONCURRENT_RECONCILES must be at least 1");
        }

        let backoff_base = match lookup("NODEPOOL_BACKOFF_BASE_MS") {
            Some(v) => Duration::from_millis(
                v.parse()
                    .context("NODEPOOL_BACKOFF_BASE_MS must be an integer")?,
            ),
            None => defaults.backoff_base,
        };

        let backoff_max = match lookup("NODEPOOL_BACKOFF_MAX_SECS") {
            Some(v) => Duration::from_secs(
                v.parse()
                    .context("NODEPOOL_BACKOFF_MAX_SECS must be an integer")?,
            ),
            None => defaults.backoff_max,
        };
        if backoff_max < backoff_base {
            anyhow::bail!("NODEPOOL_BACKOFF_MAX_SECS must not be below NODEPOOL_BACKOFF_BASE_MS");
        }

        let drain_timeout = match lookup("NODEPOOL_DRAIN_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(
                v.parse()
                    .context("NODEPOOL_DRAIN_TIMEOUT_SECS must be an integer")?,
            ),
            None => defaults.drain_timeout,
        };

        let log_level = lookup("NODEPOOL_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            extension_type,
            ignore_operation_annotation,
            max_concurrent_reconciles,
            backoff_base,
            backoff_max,
            drain_timeout,
            log_level,
        })
    }

    /// Options shared by both controllers.
    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            max_concurrent_reconciles: self.max_concurrent_reconciles,
            backoff: BackoffPolicy::new(self.backoff_base, self.backoff_max),
            drain_timeout: self.drain_timeout,
        }
    }
}
