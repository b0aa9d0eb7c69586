use futures_util::future::join_all;
use tidings_store::Store;
use tokio::time::{interval_at, sleep, Duration, Instant};
use tracing::{debug, error, info};

use crate::{broker::Broker, config::Config, error::Result};

/// Publishes outbox rows to the broker, partition by partition, in sequence order.
///
/// A row is removed from the outbox only after the broker acknowledged it, so a crash between
/// the two steps publishes it again on restart.
#[derive(Clone)]
pub struct Relay {
    store: Store,
    broker: Box<dyn Broker>,
    config: Config,
}

impl Relay {
    pub fn new<B: Broker + 'static>(store: Store, broker: B) -> Self {
        Self {
            store,
            broker: Box::new(broker),
            config: Config::default(),
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;

        self
    }

    fn batch_size(&self) -> u16 {
        self.config.relay_batch_size.max(1)
    }

    /// Relays up to one batch of a partition and returns the number of rows published.
    ///
    /// Stops at the first failed publish: later rows of the partition are never sent ahead of an
    /// unsent one. Rows acknowledged before the failure are still removed.
    pub async fn feed_batch(&self, partition: i32) -> Result<usize> {
        let rows = self
            .store
            .pending(partition, self.batch_size())
            .await?;

        let mut sent = Vec::with_capacity(rows.len());
        let mut failure = None;

        for row in rows.iter() {
            match self
                .broker
                .publish(row.partition, &row.key, row.payload.as_deref())
                .await
            {
                Ok(offset) => {
                    debug!(
                        "outbox row {} published to partition {} at offset {offset}",
                        row.sequence, row.partition
                    );

                    sent.push(row.sequence);
                }
                Err(e) => {
                    error!(
                        "failed to publish outbox row {} of partition {partition}: {e}",
                        row.sequence
                    );

                    failure = Some(e);
                    break;
                }
            }
        }

        self.store.remove(&sent).await?;

        match failure {
            Some(e) => Err(e),
            _ => Ok(sent.len()),
        }
    }

    /// Drains every partition that has pending rows, once.
    pub async fn feed(&self) -> Result<usize> {
        let mut total = 0;

        for partition in self.store.partitions().await? {
            loop {
                let sent = self.feed_batch(partition).await?;
                total += sent;

                if sent < usize::from(self.batch_size()) {
                    break;
                }
            }
        }

        Ok(total)
    }

    /// Spawns one background loop per broker partition.
    pub async fn start(&self, delay: u64) -> Result<()> {
        let futures = (0..self.broker.partitions())
            .map(|partition| self.start_partition(i32::from(partition), delay));

        join_all(futures).await;

        Ok(())
    }

    async fn start_partition(&self, partition: i32, delay: u64) {
        let relay = self.clone();

        tokio::spawn(async move {
            if delay > 0 {
                info!("wait {delay} seconds to start relay of partition {partition}");
                sleep(Duration::from_secs(delay)).await;
            }

            info!("relay of partition {partition} started.");

            let mut interval = interval_at(Instant::now(), relay.config.poll_interval);

            loop {
                interval.tick().await;

                if let Err(e) = relay.feed_batch(partition).await {
                    error!("relay of partition {partition}: {e}");
                }
            }
        });
    }
}
