use chrono::Utc;
use std::sync::Arc;
use tidings_store::Record;
use tokio::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    broker::BrokerRecord,
    engine::{BufferedRecord, Commit, Engine, FinishedTransaction, PendingTransaction},
    error::{Error, Result},
    projection::Projections,
    registry::Registry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handlers ran for this many records.
    Applied(usize),
    /// Held back until its business transaction finishes.
    Buffered,
    /// Redelivery, duplicate record or unregistered aggregate type.
    Skipped,
}

/// Applies broker records of one processor, grouping business transactions.
///
/// Per transaction id: `TransactionStarted` opens a persisted buffer, later records are
/// appended to it and `TransactionFinished` applies the whole buffer, releases it, records the
/// transaction as finished and commits the offset, all in one local transaction. Records
/// without a transaction id are applied right away. Every outcome commits the next offset with
/// the effects it covers.
#[derive(Clone)]
pub struct BusinessTransactionManager {
    engine: Box<dyn Engine>,
    registry: Arc<Registry>,
    processor: String,
}

impl BusinessTransactionManager {
    pub fn new(
        engine: Box<dyn Engine>,
        registry: Arc<Registry>,
        processor: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            registry,
            processor: processor.into(),
        }
    }

    pub fn processor(&self) -> &str {
        &self.processor
    }

    pub async fn process(&self, broker_record: &BrokerRecord) -> Result<Outcome> {
        let committed = self
            .engine
            .offset(&self.processor, broker_record.partition)
            .await?
            .unwrap_or_default();

        if broker_record.offset < committed {
            debug!(
                "{} skip redelivered offset {} of partition {}",
                self.processor, broker_record.offset, broker_record.partition
            );

            return Ok(Outcome::Skipped);
        }

        let record = broker_record.to_record()?;

        match record.key.business_transaction_id {
            Some(transaction_id) => {
                self.process_transactional(broker_record, &record, transaction_id)
                    .await
            }
            _ => self.apply(broker_record, &record).await,
        }
    }

    async fn apply(&self, broker_record: &BrokerRecord, record: &Record) -> Result<Outcome> {
        let mut projections = Projections::new(self.engine.as_ref());
        let applied = self.registry.dispatch(record, &mut projections).await?;

        let mut commit = self.commit(broker_record);
        commit.documents = projections.into_writes();
        self.engine.commit(commit).await?;

        if applied {
            Ok(Outcome::Applied(1))
        } else {
            Ok(Outcome::Skipped)
        }
    }

    async fn process_transactional(
        &self,
        broker_record: &BrokerRecord,
        record: &Record,
        transaction_id: Uuid,
    ) -> Result<Outcome> {
        let partition = broker_record.partition;
        let offset = broker_record.offset;

        if let Some(finished) = self.engine.finished(&self.processor, transaction_id).await? {
            return self.redelivered(broker_record, finished).await;
        }

        let buffered = self.engine.buffered(&self.processor, transaction_id).await?;

        let Some(last) = buffered.last() else {
            if !record.is_transaction_started() {
                return Err(self.violation(
                    transaction_id,
                    partition,
                    format!("offset {offset} received before TransactionStarted"),
                ));
            }

            debug!(
                "{} business transaction {transaction_id} started at offset {offset}",
                self.processor
            );

            return self.buffer(broker_record, transaction_id).await;
        };

        if last.partition != partition {
            return Err(self.violation(
                transaction_id,
                partition,
                format!("buffered records are on partition {}", last.partition),
            ));
        }

        if offset <= last.offset {
            debug!(
                "{} skip redelivered offset {offset} of open transaction {transaction_id}",
                self.processor
            );

            return self.skip(broker_record).await;
        }

        if buffered
            .iter()
            .any(|r| r.key == broker_record.key && r.payload == broker_record.payload)
        {
            warn!(
                "{} skip duplicate offset {offset} of open transaction {transaction_id}",
                self.processor
            );

            return self.skip(broker_record).await;
        }

        if !record.is_transaction_finished() {
            return self.buffer(broker_record, transaction_id).await;
        }

        let mut projections = Projections::new(self.engine.as_ref());
        let mut applied = 0;

        for buffered_record in buffered.iter() {
            let record = buffered_record.to_record()?;

            if record.is_transaction_started() {
                continue;
            }

            if self.registry.dispatch(&record, &mut projections).await? {
                applied += 1;
            }
        }

        let mut digests: Vec<Vec<u8>> = buffered.iter().map(BufferedRecord::digest).collect();
        digests.push(broker_record.digest());

        let mut commit = self.commit(broker_record);
        commit.documents = projections.into_writes();
        commit.release = Some(transaction_id);
        commit.finished = Some(FinishedTransaction {
            transaction_id,
            processor: self.processor.to_owned(),
            offset,
            finished_at: Utc::now(),
            digests,
        });

        self.engine.commit(commit).await?;

        debug!(
            "{} business transaction {transaction_id} applied {applied} of {} buffered records",
            self.processor,
            buffered.len()
        );

        Ok(Outcome::Applied(applied))
    }

    /// Records of an already finished transaction. The relay removes published rows batch by
    /// batch, so a crash may publish any tail of a group again. A record the group already held,
    /// same key and payload, is skipped; any other one is a protocol violation.
    async fn redelivered(
        &self,
        broker_record: &BrokerRecord,
        finished: FinishedTransaction,
    ) -> Result<Outcome> {
        let transaction_id = finished.transaction_id;
        let offset = broker_record.offset;

        if offset <= finished.offset || finished.contains(&broker_record.digest()) {
            debug!(
                "{} skip redelivered offset {offset} of finished transaction {transaction_id}",
                self.processor
            );

            return self.skip(broker_record).await;
        }

        Err(self.violation(
            transaction_id,
            broker_record.partition,
            format!(
                "offset {offset} arrived after the transaction finished at {}",
                finished.offset
            ),
        ))
    }

    async fn buffer(&self, broker_record: &BrokerRecord, transaction_id: Uuid) -> Result<Outcome> {
        let mut commit = self.commit(broker_record);
        commit.buffer.push(BufferedRecord {
            transaction_id,
            processor: self.processor.to_owned(),
            partition: broker_record.partition,
            offset: broker_record.offset,
            key: broker_record.key.clone(),
            payload: broker_record.payload.clone(),
            created_at: Utc::now(),
        });

        self.engine.commit(commit).await?;

        Ok(Outcome::Buffered)
    }

    async fn skip(&self, broker_record: &BrokerRecord) -> Result<Outcome> {
        self.engine.commit(self.commit(broker_record)).await?;

        Ok(Outcome::Skipped)
    }

    fn commit(&self, broker_record: &BrokerRecord) -> Commit {
        Commit::new(
            &self.processor,
            broker_record.partition,
            broker_record.offset + 1,
        )
    }

    fn violation(&self, transaction_id: Uuid, partition: i32, reason: String) -> Error {
        error!(
            "{} protocol violation in business transaction {transaction_id}: {reason}",
            self.processor
        );

        Error::UnknownOrOutOfOrderTransaction {
            transaction_id,
            partition,
            reason,
        }
    }

    /// Transactions started longer than `older_than` ago and still waiting for their finish.
    pub async fn stale_transactions(
        &self,
        older_than: Duration,
    ) -> Result<Vec<PendingTransaction>> {
        let older_than = chrono::Duration::from_std(older_than).map_err(anyhow::Error::from)?;
        let limit = Utc::now() - older_than;

        Ok(self
            .engine
            .open_transactions(&self.processor)
            .await?
            .into_iter()
            .filter(|tx| tx.started_at <= limit)
            .collect())
    }

    /// Forgets finished transactions older than `older_than`. Their records can no longer be
    /// told apart from a protocol violation if they are ever published again.
    pub async fn prune_finished(&self, older_than: Duration) -> Result<usize> {
        let older_than = chrono::Duration::from_std(older_than).map_err(anyhow::Error::from)?;
        let pruned = self
            .engine
            .prune_finished(&self.processor, Utc::now() - older_than)
            .await?;

        if pruned > 0 {
            debug!("{} pruned {pruned} finished transactions", self.processor);
        }

        Ok(pruned)
    }

    pub async fn open_transactions(&self) -> Result<Vec<PendingTransaction>> {
        self.engine.open_transactions(&self.processor).await
    }
}
