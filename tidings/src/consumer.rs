use futures_util::future::join_all;
use std::sync::Arc;
use tokio::time::{interval_at, sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::{
    broker::Broker,
    config::Config,
    engine::Engine,
    error::Result,
    registry::Registry,
    transaction::{BusinessTransactionManager, Outcome},
};

/// A named processor reading every broker partition with one worker each.
#[derive(Clone)]
pub struct Consumer {
    engine: Box<dyn Engine>,
    broker: Box<dyn Broker>,
    registry: Arc<Registry>,
    name: String,
    config: Config,
}

impl Consumer {
    pub fn new<E: Engine + 'static, B: Broker + 'static>(engine: E, broker: B) -> Self {
        Self {
            engine: Box::new(engine),
            broker: Box::new(broker),
            registry: Arc::new(Registry::new()),
            name: "default".to_owned(),
            config: Config::default(),
        }
    }

    pub fn name<N: Into<String>>(mut self, name: N) -> Self {
        self.name = name.into();

        self
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Arc::new(registry);

        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;

        self
    }

    pub fn manager(&self) -> BusinessTransactionManager {
        BusinessTransactionManager::new(self.engine.clone(), self.registry.clone(), &self.name)
    }

    /// Processes one batch of a partition from its committed offset. Returns the number of
    /// records consumed.
    pub async fn poll(&self, partition: i32) -> Result<usize> {
        let offset = self
            .engine
            .offset(&self.name, partition)
            .await?
            .unwrap_or_default();

        let records = self
            .broker
            .fetch(partition, offset, self.config.consumer_batch_size.max(1))
            .await?;

        let manager = self.manager();

        for record in records.iter() {
            let outcome = manager.process(record).await?;

            if outcome == Outcome::Skipped {
                debug!(
                    "{} skipped partition {partition} offset {}",
                    self.name, record.offset
                );
            }
        }

        Ok(records.len())
    }

    /// Polls until every partition reached its end offset.
    pub async fn drain(&self) -> Result<usize> {
        let mut total = 0;

        for partition in 0..self.broker.partitions() {
            let partition = i32::from(partition);

            loop {
                let consumed = self.poll(partition).await?;
                total += consumed;

                if consumed == 0 {
                    break;
                }
            }
        }

        Ok(total)
    }

    /// Spawns one worker per partition. A fatal error stops that worker; other errors are
    /// retried on the next tick.
    pub async fn start(&self, delay: u64) -> Result<()> {
        let futures = (0..self.broker.partitions())
            .map(|partition| self.start_partition(i32::from(partition), delay));

        join_all(futures).await;

        Ok(())
    }

    async fn start_partition(&self, partition: i32, delay: u64) {
        let consumer = self.clone();

        tokio::spawn(async move {
            let key = format!("{}/{partition}", consumer.name);

            if delay > 0 {
                info!("wait {delay} seconds to start {key}");
                sleep(Duration::from_secs(delay)).await;
            }

            info!("{key} started.");

            let mut interval = interval_at(Instant::now(), consumer.config.poll_interval);
            let mut last_stale_check = Instant::now();

            loop {
                interval.tick().await;

                match consumer.poll(partition).await {
                    Ok(consumed) if consumed > 0 => debug!("{key} consumed {consumed} records"),
                    Ok(_) => {}
                    Err(e) if e.is_fatal() => {
                        error!("{key} stopped: {e}");
                        break;
                    }
                    Err(e) => {
                        error!("{key}: {e}");
                        continue;
                    }
                }

                if last_stale_check.elapsed() < consumer.config.stale_transaction_after {
                    continue;
                }

                last_stale_check = Instant::now();

                match consumer
                    .manager()
                    .stale_transactions(consumer.config.stale_transaction_after)
                    .await
                {
                    Ok(transactions) => {
                        for tx in transactions.iter().filter(|tx| tx.partition == partition) {
                            warn!(
                                "{key} business transaction {} open since {} with {} records",
                                tx.transaction_id, tx.started_at, tx.records
                            );
                        }
                    }
                    Err(e) => error!("{key}: {e}"),
                }

                // finished transactions are tracked per processor, one worker prunes them
                if partition != 0 {
                    continue;
                }

                if let Err(e) = consumer
                    .manager()
                    .prune_finished(consumer.config.finished_transaction_retention)
                    .await
                {
                    error!("{key}: {e}");
                }
            }
        });
    }
}
