use uuid::Uuid;

use crate::{
    engine::Engine,
    error::{Result, StoreError},
    outbox::{Changeset, OutboxRow},
    snapshot::{Snapshot, StoredSnapshot},
};

#[derive(Clone)]
pub struct Store {
    pub(crate) engine: Box<dyn Engine>,
}

impl Store {
    pub fn new<E: Engine + 'static>(engine: E) -> Self {
        Self {
            engine: Box::new(engine),
        }
    }

    pub async fn find<S: Snapshot>(&self, identifier: Uuid) -> Result<Option<S>> {
        match self.get(S::aggregate_type(), identifier).await? {
            Some(stored) => Ok(Some(stored.to_snapshot()?)),
            _ => Ok(None),
        }
    }

    pub async fn find_or_fail<S: Snapshot>(&self, identifier: Uuid) -> Result<S> {
        self.find(identifier)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                aggregate_type: S::aggregate_type().to_owned(),
                identifier,
            })
    }

    pub async fn get(
        &self,
        aggregate_type: &'_ str,
        identifier: Uuid,
    ) -> Result<Option<StoredSnapshot>> {
        self.engine.get(aggregate_type, identifier).await
    }

    pub async fn commit(&self, changeset: Changeset) -> Result<Vec<OutboxRow>> {
        self.engine.commit(changeset).await
    }

    pub async fn pending(&self, partition: i32, limit: u16) -> Result<Vec<OutboxRow>> {
        self.engine.pending(partition, limit).await
    }

    pub async fn partitions(&self) -> Result<Vec<i32>> {
        self.engine.partitions().await
    }

    pub async fn remove(&self, sequences: &[i64]) -> Result<()> {
        self.engine.remove(sequences).await
    }
}
