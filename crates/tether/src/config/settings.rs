use crate::error::{Error, Result};
use crate::transport::DEFAULT_MAX_PAYLOAD;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub hub: HubConfig,
}

impl Config {
    /// Load config from a JSON file. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON for this
    /// schema, or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content, &path.display().to_string())
    }

    /// Parse and validate config from JSON text.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if parsing or validation fails.
    pub fn from_json(content: &str, config_name: &str) -> Result<Self> {
        super::validation::warn_unknown_fields(content, config_name);
        let config: Self = serde_json::from_str(content)
            .map_err(|e| Error::config(format!("{config_name}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns `Error::Config` naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        self.connection.validate()?;
        self.hub.validate()
    }
}

/// Longest accepted keepalive window (one day)
pub const MAX_PONG_WAIT_MS: u64 = 86_400_000;

/// Per-connection limits and timings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Largest payload accepted in either direction, in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Keepalive window: a read fails if no pong arrived within this long
    #[serde(default = "default_pong_wait_ms")]
    pub pong_wait_ms: u64,

    /// Upper bound on a single outbound frame write
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl ConnectionConfig {
    /// The keepalive window, clamped to [`MAX_PONG_WAIT_MS`] so deadline
    /// arithmetic cannot overflow for hand-built configs.
    #[must_use]
    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms.min(MAX_PONG_WAIT_MS))
    }

    /// Pings go out at 90% of the pong wait so a healthy peer always answers
    /// before the read deadline.
    #[must_use]
    pub fn ping_period(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }

    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_message_size == 0 {
            return Err(Error::config("connection.maxMessageSize must be > 0"));
        }
        if self.pong_wait_ms == 0 {
            return Err(Error::config("connection.pongWaitMs must be > 0"));
        }
        if self.pong_wait_ms > MAX_PONG_WAIT_MS {
            return Err(Error::config(format!(
                "connection.pongWaitMs must be <= {MAX_PONG_WAIT_MS}"
            )));
        }
        if self.send_timeout_ms == 0 {
            return Err(Error::config("connection.sendTimeoutMs must be > 0"));
        }
        self.retry.validate()
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            pong_wait_ms: default_pong_wait_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Dial retry policy. The default retries forever on a fixed one-second interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_retry_interval_ms")]
    pub interval_ms: u64,

    /// Total connect attempts including the first; `None` retries until cancelled
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Multiplier applied to the delay after each failed retry (1.0 = fixed)
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
}

impl RetryPolicy {
    /// Fixed-interval retry with no cap.
    #[must_use]
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay before retry number `retry` (1-based).
    // Delays are milliseconds well inside f64's exact integer range
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.interval_ms as f64 * self.backoff_factor.powi(exponent);
        let capped = scaled.min(self.max_interval_ms.max(self.interval_ms) as f64);
        Duration::from_millis(capped as u64)
    }

    /// Whether another attempt is allowed after `attempts` have failed.
    #[must_use]
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }

    fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(Error::config("connection.retry.intervalMs must be > 0"));
        }
        if self.backoff_factor.is_nan() || self.backoff_factor < 1.0 {
            return Err(Error::config(
                "connection.retry.backoffFactor must be >= 1.0",
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(Error::config("connection.retry.maxAttempts must be > 0"));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval_ms: default_retry_interval_ms(),
            max_attempts: None,
            backoff_factor: default_backoff_factor(),
            max_interval_ms: default_max_interval_ms(),
        }
    }
}

/// Queue sizes for the hub's control loop and request stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    #[serde(default = "default_capacity")]
    pub command_capacity: usize,

    #[serde(default = "default_capacity")]
    pub request_capacity: usize,
}

impl HubConfig {
    fn validate(&self) -> Result<()> {
        if self.command_capacity == 0 {
            return Err(Error::config("hub.commandCapacity must be > 0"));
        }
        if self.request_capacity == 0 {
            return Err(Error::config("hub.requestCapacity must be > 0"));
        }
        Ok(())
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_capacity: default_capacity(),
            request_capacity: default_capacity(),
        }
    }
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_PAYLOAD
}
fn default_pong_wait_ms() -> u64 {
    60_000
}
fn default_send_timeout_ms() -> u64 {
    10_000
}
fn default_retry_interval_ms() -> u64 {
    1_000
}
fn default_backoff_factor() -> f64 {
    1.0
}
fn default_max_interval_ms() -> u64 {
    30_000
}
fn default_capacity() -> usize {
    64
}
