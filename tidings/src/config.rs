//! Configuration constants and defaults for the tidings runtime
//!
//! Every value can be overridden through [`ConfigBuilder`]. The operational flags can also be
//! read from the environment with [`Config::from_env`].

use std::time::Duration;

/// Runtime configuration shared by the event store, relay and consumers
#[derive(Debug, Clone)]
pub struct Config {
    /// Largest encoded payload accepted by the outbox, in bytes
    pub max_payload_size: usize,

    /// Rejects every mutating command while set (maintenance window)
    pub block_modifying_operations: bool,

    /// Number of broker partitions messages are spread over
    pub partitions: u16,

    /// Outbox rows relayed per partition and tick
    pub relay_batch_size: u16,

    /// Broker records consumed per partition and tick
    pub consumer_batch_size: u16,

    /// Interval between two relay or consumer ticks
    pub poll_interval: Duration,

    /// Age after which an open business transaction is reported as stale
    pub stale_transaction_after: Duration,

    /// How long a finished business transaction is remembered to absorb redeliveries
    pub finished_transaction_retention: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD_SIZE,
            block_modifying_operations: false,
            partitions: PARTITIONS,
            relay_batch_size: RELAY_BATCH_SIZE,
            consumer_batch_size: CONSUMER_BATCH_SIZE,
            poll_interval: POLL_INTERVAL,
            stale_transaction_after: STALE_TRANSACTION_AFTER,
            finished_transaction_retention: FINISHED_TRANSACTION_RETENTION,
        }
    }
}

/// Default maximum payload size (900 KiB)
///
/// Kept below the broker's own message limit so oversized events fail at staging time instead
/// of being rejected on publish.
pub const MAX_PAYLOAD_SIZE: usize = 921_600;

/// Default number of partitions
pub const PARTITIONS: u16 = 4;

/// Default number of outbox rows relayed per batch
pub const RELAY_BATCH_SIZE: u16 = 100;

/// Default number of broker records fetched per batch
pub const CONSUMER_BATCH_SIZE: u16 = 100;

/// Default interval between relay and consumer ticks
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default age after which an open business transaction is logged as stale
pub const STALE_TRANSACTION_AFTER: Duration = Duration::from_secs(3600);

/// Default retention of finished business transaction records (7 days)
pub const FINISHED_TRANSACTION_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

pub const ENV_BLOCK_MODIFYING_OPERATIONS: &str = "TIDINGS_BLOCK_MODIFYING_OPERATIONS";
pub const ENV_MAX_PAYLOAD_SIZE: &str = "TIDINGS_MAX_PAYLOAD_SIZE";
pub const ENV_PARTITIONS: &str = "TIDINGS_PARTITIONS";

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Defaults overlaid with the `TIDINGS_*` environment variables. Unparsable values are
    /// ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_BLOCK_MODIFYING_OPERATIONS) {
            match value.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => config.block_modifying_operations = true,
                "0" | "false" | "no" | "off" | "" => config.block_modifying_operations = false,
                other => tracing::warn!("invalid {ENV_BLOCK_MODIFYING_OPERATIONS} value `{other}`"),
            }
        }

        if let Some(value) = lookup(ENV_MAX_PAYLOAD_SIZE) {
            match value.trim().parse() {
                Ok(size) => config.max_payload_size = size,
                Err(e) => tracing::warn!("invalid {ENV_MAX_PAYLOAD_SIZE} value `{value}`: {e}"),
            }
        }

        if let Some(value) = lookup(ENV_PARTITIONS) {
            match value.trim().parse::<u16>() {
                Ok(partitions) if partitions > 0 => config.partitions = partitions,
                _ => tracing::warn!("invalid {ENV_PARTITIONS} value `{value}`"),
            }
        }

        config
    }
}

/// Configuration builder for customizing tidings behavior
#[derive(Debug)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn max_payload_size(mut self, size: usize) -> Self {
        self.config.max_payload_size = size;
        self
    }

    pub fn block_modifying_operations(mut self, value: bool) -> Self {
        self.config.block_modifying_operations = value;
        self
    }

    pub fn partitions(mut self, partitions: u16) -> Self {
        self.config.partitions = partitions.max(1);
        self
    }

    pub fn relay_batch_size(mut self, size: u16) -> Self {
        self.config.relay_batch_size = size.max(1);
        self
    }

    pub fn consumer_batch_size(mut self, size: u16) -> Self {
        self.config.consumer_batch_size = size.max(1);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn stale_transaction_after(mut self, after: Duration) -> Self {
        self.config.stale_transaction_after = after;
        self
    }

    pub fn finished_transaction_retention(mut self, retention: Duration) -> Self {
        self.config.finished_transaction_retention = retention;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
