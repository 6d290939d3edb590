//! Typed options for connections and queues.
//!
//! Both option sets deserialize from JSON with camelCase keys
//! (`{"minRetryDelayMs": 50, "maxTotalRetryMs": 60000}`); missing keys take
//! their defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default minimum reconnect delay.
pub const DEFAULT_MIN_RETRY_DELAY_MS: u64 = 100;

/// Default maximum reconnect delay (5 minutes).
pub const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 5 * 60 * 1000;

/// Default idle liveness probe interval.
pub const DEFAULT_PING_INTERVAL_MS: u64 = 5_000;

/// Default bound on one discovery query (connect + command).
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 2_000;

/// Default bound on opening a store connection.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;

/// Default blocking-pop wait.
pub const DEFAULT_QUEUE_TIMEOUT_MS: u64 = 5_000;

/// Options for a resilient connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientOptions {
    /// First reconnect delay; 0 means "use the default".
    pub min_retry_delay_ms: u64,
    /// Reconnect delay cap; 0 means "use the default".
    pub max_retry_delay_ms: u64,
    /// Give up once cumulative reconnect delay exceeds this (None = never).
    pub max_total_retry_ms: Option<u64>,
    /// Idle PING interval while connected (0 disables the probe).
    pub ping_interval_ms: u64,
    pub discovery_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            min_retry_delay_ms: DEFAULT_MIN_RETRY_DELAY_MS,
            max_retry_delay_ms: DEFAULT_MAX_RETRY_DELAY_MS,
            max_total_retry_ms: None,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            discovery_timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl ClientOptions {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_retry_delays(mut self, min: Duration, max: Duration) -> Self {
        self.min_retry_delay_ms = duration_ms(min);
        self.max_retry_delay_ms = duration_ms(max);
        self
    }

    pub fn with_max_total_retry(mut self, budget: Duration) -> Self {
        self.max_total_retry_ms = Some(duration_ms(budget));
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval_ms = duration_ms(interval);
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn min_retry_delay(&self) -> Duration {
        Duration::from_millis(non_zero_or(
            self.min_retry_delay_ms,
            DEFAULT_MIN_RETRY_DELAY_MS,
        ))
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(non_zero_or(
            self.max_retry_delay_ms,
            DEFAULT_MAX_RETRY_DELAY_MS,
        ))
    }

    pub fn max_total_retry(&self) -> Option<Duration> {
        self.max_total_retry_ms.map(Duration::from_millis)
    }

    /// `Duration::ZERO` when the probe is disabled.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(non_zero_or(
            self.discovery_timeout_ms,
            DEFAULT_DISCOVERY_TIMEOUT_MS,
        ))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(non_zero_or(
            self.connect_timeout_ms,
            DEFAULT_CONNECT_TIMEOUT_MS,
        ))
    }
}

/// What a consumer does with a worker error nobody is subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Escalation {
    /// Log and abort the process (crash-and-restart semantics).
    #[default]
    Abort,
    /// Log, stop dequeuing, and hand the error to whoever joins the queue.
    HaltLoop,
}

/// Options for a work queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueOptions {
    /// Upper bound on one blocking pop.
    pub timeout_ms: u64,
    pub escalation: Escalation,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_QUEUE_TIMEOUT_MS,
            escalation: Escalation::default(),
        }
    }
}

impl QueueOptions {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_escalation(mut self, escalation: Escalation) -> Self {
        self.escalation = escalation;
        self
    }

    /// Blocking-pop timeout in whole seconds.
    ///
    /// Rounds up and never returns 0: a zero timeout blocks forever on the
    /// store side, which would pin the connection during shutdown.
    pub fn blocking_timeout_secs(&self) -> u64 {
        self.timeout_ms.div_ceil(1000).max(1)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn non_zero_or(value: u64, default: u64) -> u64 {
    if value == 0 { default } else { value }
}
