use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::Result, message::Record, snapshot::StoredSnapshot};

/// An encoded message waiting to be inserted in the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub partition: i32,
    pub key: Vec<u8>,
    pub payload: Option<Vec<u8>>,
    pub transaction_id: Option<Uuid>,
}

impl OutboxEntry {
    pub fn new(record: &Record, partitions: u16) -> Result<Self> {
        let (key, payload) = record.encode()?;

        Ok(Self {
            partition: record.key.partition(partitions),
            key,
            payload,
            transaction_id: record.key.business_transaction_id,
        })
    }

    pub fn payload_size(&self) -> usize {
        self.payload.as_ref().map(Vec::len).unwrap_or_default()
    }

    pub fn to_record(&self) -> Result<Record> {
        Record::decode(&self.key, self.payload.as_deref())
    }
}

/// A persisted outbox row. `sequence` is assigned by the engine and orders rows of a partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "pg", derive(sqlx::FromRow))]
pub struct OutboxRow {
    pub sequence: i64,
    pub partition: i32,
    pub key: Vec<u8>,
    pub payload: Option<Vec<u8>>,
    pub transaction_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl OutboxRow {
    pub fn to_record(&self) -> Result<Record> {
        Record::decode(&self.key, self.payload.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotWrite {
    /// Insert or replace. `expected_version` is the version the command read, `None` for a
    /// snapshot that must not exist yet.
    Save {
        snapshot: StoredSnapshot,
        expected_version: Option<i64>,
    },
    Delete {
        aggregate_type: String,
        identifier: Uuid,
        expected_version: i64,
    },
}

impl SnapshotWrite {
    pub fn aggregate_type(&self) -> &str {
        match self {
            SnapshotWrite::Save { snapshot, .. } => &snapshot.aggregate_type,
            SnapshotWrite::Delete { aggregate_type, .. } => aggregate_type,
        }
    }

    pub fn identifier(&self) -> Uuid {
        match self {
            SnapshotWrite::Save { snapshot, .. } => snapshot.identifier,
            SnapshotWrite::Delete { identifier, .. } => *identifier,
        }
    }

    pub fn expected_version(&self) -> Option<i64> {
        match self {
            SnapshotWrite::Save {
                expected_version, ..
            } => *expected_version,
            SnapshotWrite::Delete {
                expected_version, ..
            } => Some(*expected_version),
        }
    }
}

/// Snapshot writes and outbox entries committed together, or not at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changeset {
    pub snapshots: Vec<SnapshotWrite>,
    pub entries: Vec<OutboxEntry>,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty() && self.entries.is_empty()
    }

    pub fn snapshot(mut self, write: SnapshotWrite) -> Self {
        self.snapshots.push(write);

        self
    }

    pub fn entry(mut self, entry: OutboxEntry) -> Self {
        self.entries.push(entry);

        self
    }

    pub fn extend(&mut self, other: Changeset) {
        self.snapshots.extend(other.snapshots);
        self.entries.extend(other.entries);
    }

    /// Last staged state of a snapshot. `Some(None)` means it was staged for deletion.
    pub fn staged(
        &self,
        aggregate_type: &str,
        identifier: Uuid,
    ) -> Option<Option<&StoredSnapshot>> {
        self.snapshots
            .iter()
            .rev()
            .find(|w| w.aggregate_type() == aggregate_type && w.identifier() == identifier)
            .map(|w| match w {
                SnapshotWrite::Save { snapshot, .. } => Some(snapshot),
                SnapshotWrite::Delete { .. } => None,
            })
    }
}
