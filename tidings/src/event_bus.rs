use anyhow::anyhow;
use parking_lot::Mutex;
use std::sync::Arc;
use tidings_store::{
    partition_of, Changeset, MessageKey, OutboxEntry, OutboxRow, Payload, Record, Snapshot,
    SnapshotWrite, Store, BUSINESS_TRANSACTION,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    context::Context,
    error::{Error, Result},
};

/// Write side entry point: every event goes through the outbox of this store.
#[derive(Clone)]
pub struct EventStore {
    store: Store,
    config: Config,
}

impl EventStore {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            config: Config::default(),
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;

        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn settings(&self) -> &Config {
        &self.config
    }

    pub fn event_bus(&self, ctx: Context) -> EventBus {
        EventBus {
            event_store: self.clone(),
            ctx,
            transaction: Default::default(),
        }
    }

    /// Writes a single message to the outbox, outside of any snapshot mutation.
    pub async fn save(&self, key: MessageKey, payload: Option<Payload>) -> Result<OutboxRow> {
        self.assert_modifiable()?;

        let record = Record { key, payload };
        let entry = self.entry(&record)?;
        let mut rows = self.store.commit(Changeset::default().entry(entry)).await?;

        rows.pop()
            .ok_or_else(|| anyhow!("outbox returned no row for {}", record.key.aggregate_id).into())
    }

    pub(crate) fn assert_modifiable(&self) -> Result<()> {
        if self.config.block_modifying_operations {
            return Err(Error::BlockedOperation);
        }

        Ok(())
    }

    pub(crate) fn entry(&self, record: &Record) -> Result<OutboxEntry> {
        let entry = OutboxEntry::new(record, self.config.partitions)?;
        let size = entry.payload_size();

        if size > self.config.max_payload_size {
            return Err(Error::OversizedMessage {
                size,
                limit: self.config.max_payload_size,
            });
        }

        Ok(entry)
    }
}

#[derive(Debug)]
struct OpenTransaction {
    id: Uuid,
    partition: i32,
    depth: usize,
    poisoned: bool,
    changeset: Changeset,
}

/// A unit of work bound to an explicit [`Context`].
///
/// Outside a business transaction every command commits on its own. Inside one, snapshot writes
/// and events are staged and committed together when the outermost guard finishes.
#[derive(Clone)]
pub struct EventBus {
    event_store: EventStore,
    ctx: Context,
    transaction: Arc<Mutex<Option<OpenTransaction>>>,
}

impl EventBus {
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn event_store(&self) -> &EventStore {
        &self.event_store
    }

    pub fn business_transaction_id(&self) -> Option<Uuid> {
        self.transaction.lock().as_ref().map(|tx| tx.id)
    }

    /// Latest snapshot, including writes staged by the open business transaction.
    pub async fn find<S: Snapshot>(&self, identifier: Uuid) -> Result<Option<S>> {
        let staged = self.transaction.lock().as_ref().and_then(|tx| {
            tx.changeset
                .staged(S::aggregate_type(), identifier)
                .map(|s| s.cloned())
        });

        match staged {
            Some(Some(stored)) => Ok(Some(stored.to_snapshot()?)),
            Some(None) => Ok(None),
            _ => Ok(self.event_store.store.find(identifier).await?),
        }
    }

    pub async fn find_or_fail<S: Snapshot>(&self, identifier: Uuid) -> Result<S> {
        self.find(identifier).await?.ok_or_else(|| Error::NotFound {
            aggregate_type: S::aggregate_type().to_owned(),
            identifier,
        })
    }

    /// Opens a business transaction, or joins the one already open on this bus.
    pub fn begin_business_transaction(&self, root_context_id: Uuid) -> Result<BusinessTransaction> {
        self.event_store.assert_modifiable()?;

        let partition = partition_of(root_context_id, self.event_store.config.partitions);
        let mut transaction = self.transaction.lock();

        if let Some(tx) = transaction.as_mut() {
            if tx.partition != partition {
                return Err(Error::CrossPartitionTransaction {
                    transaction_id: tx.id,
                    expected: tx.partition,
                    actual: partition,
                });
            }

            tx.depth += 1;

            return Ok(BusinessTransaction {
                bus: self.clone(),
                id: tx.id,
                finished: false,
            });
        }

        let id = Uuid::new_v4();
        let key = MessageKey::new(BUSINESS_TRANSACTION, id, 0, root_context_id)
            .business_transaction(id);
        let started = self
            .event_store
            .entry(&Record::new(key, Payload::transaction_started(id)))?;

        debug!("business transaction {id} started on partition {partition}");

        *transaction = Some(OpenTransaction {
            id,
            partition,
            depth: 0,
            poisoned: false,
            changeset: Changeset::default().entry(started),
        });

        Ok(BusinessTransaction {
            bus: self.clone(),
            id,
            finished: false,
        })
    }

    /// Commits, or stages when a business transaction is open, snapshot writes and their events.
    pub(crate) async fn submit(
        &self,
        snapshots: Vec<SnapshotWrite>,
        records: Vec<Record>,
    ) -> Result<()> {
        self.event_store.assert_modifiable()?;

        let transaction_id = self.business_transaction_id();
        let mut changeset = Changeset {
            snapshots,
            entries: Vec::with_capacity(records.len()),
        };

        for mut record in records {
            if let Some(id) = transaction_id {
                record.key.business_transaction_id = Some(id);
            }

            changeset.entries.push(self.event_store.entry(&record)?);
        }

        {
            let mut transaction = self.transaction.lock();

            if let Some(tx) = transaction.as_mut() {
                let foreign = changeset
                    .entries
                    .iter()
                    .find(|e| e.partition != tx.partition);

                if let Some(entry) = foreign {
                    return Err(Error::CrossPartitionTransaction {
                        transaction_id: tx.id,
                        expected: tx.partition,
                        actual: entry.partition,
                    });
                }

                tx.changeset.extend(changeset);

                return Ok(());
            }
        }

        self.event_store.store.commit(changeset).await?;

        Ok(())
    }
}

/// Guard of an open business transaction. Dropping it without [`finish`](Self::finish)
/// discards everything staged.
pub struct BusinessTransaction {
    bus: EventBus,
    id: Uuid,
    finished: bool,
}

impl BusinessTransaction {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Commits markers, snapshots and events atomically. A nested guard only leaves its scope.
    pub async fn finish(mut self) -> Result<()> {
        self.finished = true;

        let changeset = {
            let mut transaction = self.bus.transaction.lock();

            if let Some(tx) = transaction.as_mut().filter(|tx| tx.depth > 0) {
                tx.depth -= 1;

                return Ok(());
            }

            let Some(tx) = transaction.take() else {
                return Err(anyhow!("business transaction {} is not open", self.id).into());
            };

            if tx.poisoned {
                warn!("business transaction {} discarded, a nested scope did not finish", tx.id);

                return Err(
                    anyhow!("business transaction {} was aborted by a nested scope", tx.id).into(),
                );
            }

            let mut changeset = tx.changeset;
            let root_context_id = match changeset.entries.first().map(OutboxEntry::to_record) {
                Some(record) => record?.key.root_context_id,
                None => return Err(anyhow!("business transaction {} has no marker", tx.id).into()),
            };

            let key = MessageKey::new(BUSINESS_TRANSACTION, tx.id, 1, root_context_id)
                .business_transaction(tx.id);

            changeset.entries.push(
                self.bus
                    .event_store
                    .entry(&Record::new(key, Payload::transaction_finished(tx.id)))?,
            );

            changeset
        };

        let rows = self.bus.event_store.store.commit(changeset).await?;

        debug!(
            "business transaction {} committed with {} outbox rows",
            self.id,
            rows.len()
        );

        Ok(())
    }
}

impl Drop for BusinessTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let mut transaction = self.bus.transaction.lock();

        match transaction.as_mut() {
            Some(tx) if tx.depth > 0 => {
                tx.depth -= 1;
                tx.poisoned = true;
            }
            Some(tx) => {
                warn!("business transaction {} dropped without finish, discarded", tx.id);
                *transaction = None;
            }
            None => {}
        }
    }
}
