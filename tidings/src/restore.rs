use futures_util::future::try_join_all;
use std::{collections::HashMap, sync::Arc};
use tracing::info;

use crate::{
    broker::Broker,
    config::Config,
    engine::{Engine, PendingTransaction},
    error::{Error, Result},
    registry::Registry,
    transaction::{BusinessTransactionManager, Outcome},
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionReport {
    pub partition: i32,
    pub end_offset: i64,
    pub applied: usize,
    pub buffered: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreReport {
    pub partitions: Vec<PartitionReport>,
    /// Business transactions still waiting for their finish marker when the log ended.
    pub open_transactions: Vec<PendingTransaction>,
}

impl RestoreReport {
    pub fn applied(&self) -> usize {
        self.partitions.iter().map(|p| p.applied).sum()
    }

    pub fn buffered(&self) -> usize {
        self.partitions.iter().map(|p| p.buffered).sum()
    }

    pub fn skipped(&self) -> usize {
        self.partitions.iter().map(|p| p.skipped).sum()
    }
}

/// Rebuilds projections by replaying every partition from offset 0.
///
/// The replay stops at the end offsets captured when the run starts. Records go through the
/// same business transaction manager and registry as online consumers, under a dedicated
/// processor whose bookkeeping is cleared first, so a run can always be started again.
pub struct Restore {
    engine: Box<dyn Engine>,
    broker: Box<dyn Broker>,
    registry: Arc<Registry>,
    name: String,
    config: Config,
    max_offsets: HashMap<i32, i64>,
}

impl Restore {
    pub fn new<E: Engine + 'static, B: Broker + 'static>(engine: E, broker: B) -> Self {
        Self {
            engine: Box::new(engine),
            broker: Box::new(broker),
            registry: Arc::new(Registry::new()),
            name: "restore".to_owned(),
            config: Config::default(),
            max_offsets: HashMap::new(),
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

    /// Last offset of a partition the online service has processed. Replaying past it fails.
    pub fn max_offset(mut self, partition: i32, offset: i64) -> Self {
        self.max_offsets.insert(partition, offset);

        self
    }

    pub async fn run(&self) -> Result<RestoreReport> {
        self.engine.reset(&self.name).await?;

        let mut end_offsets = Vec::new();

        for partition in 0..self.broker.partitions() {
            let partition = i32::from(partition);
            let end_offset = self.broker.end_offset(partition).await?;

            if let Some(max_offset) = self.max_offsets.get(&partition) {
                if end_offset - 1 > *max_offset {
                    return Err(Error::RestoreAheadOfOnline {
                        partition,
                        offset: end_offset - 1,
                        max_offset: *max_offset,
                    });
                }
            }

            end_offsets.push((partition, end_offset));
        }

        info!("{} restore started for {} partitions", self.name, end_offsets.len());

        let manager =
            BusinessTransactionManager::new(self.engine.clone(), self.registry.clone(), &self.name);

        let futures = end_offsets
            .into_iter()
            .map(|(partition, end_offset)| self.replay(&manager, partition, end_offset));

        let partitions = try_join_all(futures).await?;
        let open_transactions = manager.open_transactions().await?;

        let report = RestoreReport {
            partitions,
            open_transactions,
        };

        info!(
            "{} restore finished: {} applied, {} buffered, {} skipped, {} open transactions",
            self.name,
            report.applied(),
            report.buffered(),
            report.skipped(),
            report.open_transactions.len()
        );

        Ok(report)
    }

    async fn replay(
        &self,
        manager: &BusinessTransactionManager,
        partition: i32,
        end_offset: i64,
    ) -> Result<PartitionReport> {
        let mut report = PartitionReport {
            partition,
            end_offset,
            ..Default::default()
        };

        let mut offset = 0;

        while offset < end_offset {
            let records = self
                .broker
                .fetch(partition, offset, self.config.consumer_batch_size.max(1))
                .await?;

            if records.is_empty() {
                break;
            }

            for record in records.iter().filter(|r| r.offset < end_offset) {
                match manager.process(record).await? {
                    Outcome::Applied(n) => report.applied += n,
                    Outcome::Buffered => report.buffered += 1,
                    Outcome::Skipped => report.skipped += 1,
                }

                offset = record.offset + 1;
            }

            if records.last().map(|r| r.offset + 1 >= end_offset).unwrap_or(true) {
                break;
            }
        }

        Ok(report)
    }
}
