//! Environment-driven settings.

use std::time::Duration;

use anyhow::Context;

use keyline_core::{ClientOptions, Endpoint, QueueOptions};

pub const DEFAULT_SENTINELS: &str = "127.0.0.1:26379";
pub const DEFAULT_MASTER: &str = "mymaster";
pub const DEFAULT_QUEUE: &str = "jobs";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// `KEYLINE_SENTINELS`, comma-separated `host:port` list.
    pub sentinels: Vec<Endpoint>,
    /// `KEYLINE_MASTER`, the logical name the sentinels monitor.
    pub master: String,
    /// `KEYLINE_QUEUE`, list key.
    pub queue: String,
    /// `KEYLINE_CLIENT_OPTIONS`, JSON (camelCase keys).
    pub client: ClientOptions,
    /// `KEYLINE_QUEUE_TIMEOUT_MS`.
    pub queue_options: QueueOptions,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup; unset keys take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let sentinels_raw =
            lookup("KEYLINE_SENTINELS").unwrap_or_else(|| DEFAULT_SENTINELS.to_string());
        let sentinels = Endpoint::parse_list(&sentinels_raw)
            .with_context(|| format!("invalid KEYLINE_SENTINELS: {sentinels_raw:?}"))?;
        if sentinels.is_empty() {
            anyhow::bail!("KEYLINE_SENTINELS names no sentinel");
        }

        let client = match lookup("KEYLINE_CLIENT_OPTIONS") {
            Some(json) => {
                ClientOptions::from_json(&json).context("invalid KEYLINE_CLIENT_OPTIONS")?
            }
            None => ClientOptions::default(),
        };

        let mut queue_options = QueueOptions::default();
        if let Some(raw) = lookup("KEYLINE_QUEUE_TIMEOUT_MS") {
            let ms: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid KEYLINE_QUEUE_TIMEOUT_MS: {raw:?}"))?;
            queue_options = queue_options.with_timeout(Duration::from_millis(ms));
        }

        Ok(Self {
            sentinels,
            master: lookup("KEYLINE_MASTER").unwrap_or_else(|| DEFAULT_MASTER.to_string()),
            queue: lookup("KEYLINE_QUEUE").unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            client,
            queue_options,
        })
    }
}
