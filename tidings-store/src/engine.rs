use async_trait::async_trait;
use dyn_clone::DynClone;
use uuid::Uuid;

use crate::{
    error::{Result, StoreError},
    outbox::{Changeset, OutboxRow, SnapshotWrite},
    snapshot::StoredSnapshot,
};

#[cfg(feature = "memory")]
mod memory;
#[cfg(feature = "pg")]
mod pg;

#[cfg(feature = "memory")]
pub use memory::*;
#[cfg(feature = "pg")]
pub use pg::*;

#[async_trait]
pub trait Engine: DynClone + Send + Sync {
    async fn get(
        &self,
        aggregate_type: &'_ str,
        identifier: Uuid,
    ) -> Result<Option<StoredSnapshot>>;

    /// Applies every snapshot write and inserts every outbox entry in one transaction. Expected
    /// versions are re-checked inside that transaction, in changeset order.
    async fn commit(&self, changeset: Changeset) -> Result<Vec<OutboxRow>>;

    /// Oldest rows of a partition, in sequence order.
    async fn pending(&self, partition: i32, limit: u16) -> Result<Vec<OutboxRow>>;

    /// Partitions that currently hold at least one row.
    async fn partitions(&self) -> Result<Vec<i32>>;

    async fn remove(&self, sequences: &[i64]) -> Result<()>;
}

dyn_clone::clone_trait_object!(Engine);

pub(crate) fn check_version(write: &SnapshotWrite, actual: Option<i64>) -> Result<()> {
    let expected = write.expected_version();

    if expected == actual {
        return Ok(());
    }

    tracing::debug!(
        "{}#{} expected version {expected:?}, found {actual:?}",
        write.aggregate_type(),
        write.identifier()
    );

    Err(StoreError::ConcurrencyConflict {
        aggregate_type: write.aggregate_type().to_owned(),
        identifier: write.identifier(),
        expected,
        actual,
    })
}
