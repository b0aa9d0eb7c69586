use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use uuid::Uuid;

use crate::{
    engine::{check_version, Engine},
    error::Result,
    outbox::{Changeset, OutboxRow, SnapshotWrite},
    snapshot::StoredSnapshot,
    store::Store,
};

pub struct MemoryStore;

impl MemoryStore {
    pub fn create() -> Store {
        Store::new(Memory::default())
    }
}

#[derive(Debug, Default)]
struct State {
    snapshots: HashMap<(String, Uuid), StoredSnapshot>,
    outbox: BTreeMap<i64, OutboxRow>,
    sequence: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Memory(Arc<RwLock<State>>);

#[async_trait]
impl Engine for Memory {
    async fn get(
        &self,
        aggregate_type: &'_ str,
        identifier: Uuid,
    ) -> Result<Option<StoredSnapshot>> {
        Ok(self
            .0
            .read()
            .snapshots
            .get(&(aggregate_type.to_owned(), identifier))
            .cloned())
    }

    async fn commit(&self, changeset: Changeset) -> Result<Vec<OutboxRow>> {
        if changeset.is_empty() {
            return Ok(vec![]);
        }

        let mut state = self.0.write();

        // validate every write before touching the state
        let mut versions: HashMap<(String, Uuid), Option<i64>> = HashMap::new();

        for write in changeset.snapshots.iter() {
            let id = (write.aggregate_type().to_owned(), write.identifier());
            let actual = match versions.get(&id) {
                Some(version) => *version,
                _ => state.snapshots.get(&id).map(|s| s.version),
            };

            check_version(write, actual)?;

            let next = match write {
                SnapshotWrite::Save { snapshot, .. } => Some(snapshot.version),
                SnapshotWrite::Delete { .. } => None,
            };

            versions.insert(id, next);
        }

        for write in changeset.snapshots {
            match write {
                SnapshotWrite::Save { snapshot, .. } => {
                    state.snapshots.insert(
                        (snapshot.aggregate_type.to_owned(), snapshot.identifier),
                        snapshot,
                    );
                }
                SnapshotWrite::Delete {
                    aggregate_type,
                    identifier,
                    ..
                } => {
                    state.snapshots.remove(&(aggregate_type, identifier));
                }
            }
        }

        let mut rows = Vec::with_capacity(changeset.entries.len());

        for entry in changeset.entries {
            state.sequence += 1;

            let row = OutboxRow {
                sequence: state.sequence,
                partition: entry.partition,
                key: entry.key,
                payload: entry.payload,
                transaction_id: entry.transaction_id,
                created_at: Utc::now(),
            };

            state.outbox.insert(row.sequence, row.clone());
            rows.push(row);
        }

        Ok(rows)
    }

    async fn pending(&self, partition: i32, limit: u16) -> Result<Vec<OutboxRow>> {
        Ok(self
            .0
            .read()
            .outbox
            .values()
            .filter(|row| row.partition == partition)
            .take(usize::from(limit))
            .cloned()
            .collect())
    }

    async fn partitions(&self) -> Result<Vec<i32>> {
        let mut partitions = self
            .0
            .read()
            .outbox
            .values()
            .map(|row| row.partition)
            .collect::<Vec<_>>();

        partitions.sort_unstable();
        partitions.dedup();

        Ok(partitions)
    }

    async fn remove(&self, sequences: &[i64]) -> Result<()> {
        let mut state = self.0.write();

        for sequence in sequences {
            state.outbox.remove(sequence);
        }

        Ok(())
    }
}
