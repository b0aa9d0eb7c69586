#[cfg(feature = "memory")]
mod memory;
#[cfg(feature = "memory")]
pub use memory::*;

#[cfg(feature = "pg")]
mod pg;
#[cfg(feature = "pg")]
pub use pg::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dyn_clone::DynClone;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tidings_store::Record;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentRef {
    pub collection: String,
    pub id: Uuid,
}

impl DocumentRef {
    pub fn new(collection: impl Into<String>, id: Uuid) -> Self {
        Self {
            collection: collection.into(),
            id,
        }
    }
}

/// A projection entity. `parent` links dependent documents that are removed with their parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub collection: String,
    pub id: Uuid,
    pub parent: Option<DocumentRef>,
    pub version: i64,
    pub data: Value,
}

impl Document {
    pub fn new(collection: impl Into<String>, id: Uuid) -> Self {
        Self {
            collection: collection.into(),
            id,
            parent: None,
            version: 0,
            data: Value::Null,
        }
    }

    pub fn parent(mut self, value: DocumentRef) -> Self {
        self.parent = Some(value);

        self
    }

    pub fn version(mut self, value: i64) -> Self {
        self.version = value;

        self
    }

    pub fn data<D: Serialize>(mut self, value: &D) -> Result<Self> {
        self.data = serde_json::to_value(value)?;

        Ok(self)
    }

    pub fn to_data<D: DeserializeOwned>(&self) -> Result<D> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn to_ref(&self) -> DocumentRef {
        DocumentRef::new(&self.collection, self.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentWrite {
    Put(Document),
    Delete(DocumentRef),
}

/// A record held back until its business transaction finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedRecord {
    pub transaction_id: Uuid,
    pub processor: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Vec<u8>,
    pub payload: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

impl BufferedRecord {
    pub fn to_record(&self) -> Result<Record> {
        Ok(Record::decode(&self.key, self.payload.as_deref())?)
    }

    pub fn digest(&self) -> Vec<u8> {
        record_digest(&self.key, self.payload.as_deref())
    }
}

/// Identifies a published record by its key and payload bytes. Records of one command may
/// share a key, an event and a tombstone for instance, but never both.
pub fn record_digest(key: &[u8], payload: Option<&[u8]>) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update((key.len() as u64).to_be_bytes());
    hasher.update(key);

    match payload {
        Some(payload) => {
            hasher.update([1]);
            hasher.update(payload);
        }
        None => hasher.update([0]),
    }

    hasher.finalize().to_vec()
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "pg", derive(sqlx::FromRow))]
pub struct FinishedTransaction {
    pub transaction_id: Uuid,
    pub processor: String,
    pub offset: i64,
    pub finished_at: DateTime<Utc>,
    /// [`record_digest`] of every record the group held, markers included. A later record of
    /// the transaction with one of these digests is a duplicate publish.
    pub digests: Vec<Vec<u8>>,
}

impl FinishedTransaction {
    pub fn contains(&self, digest: &[u8]) -> bool {
        self.digests.iter().any(|d| d == digest)
    }
}

/// Summary of a business transaction still buffered for a processor.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "pg", derive(sqlx::FromRow))]
pub struct PendingTransaction {
    pub transaction_id: Uuid,
    pub partition: i32,
    pub records: i64,
    pub first_offset: i64,
    pub last_offset: i64,
    pub started_at: DateTime<Utc>,
}

/// Everything a processed record changes, committed in one local transaction.
///
/// `offset` is the next offset to consume; the stored offset never moves backwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub processor: String,
    pub partition: i32,
    pub offset: i64,
    pub documents: Vec<DocumentWrite>,
    pub buffer: Vec<BufferedRecord>,
    pub release: Option<Uuid>,
    pub finished: Option<FinishedTransaction>,
}

impl Commit {
    pub fn new(processor: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            processor: processor.into(),
            partition,
            offset,
            documents: Vec::new(),
            buffer: Vec::new(),
            release: None,
            finished: None,
        }
    }
}

#[async_trait]
pub trait Engine: DynClone + Send + Sync {
    async fn document(&self, collection: &'_ str, id: Uuid) -> Result<Option<Document>>;

    async fn children(&self, parent: &'_ DocumentRef) -> Result<Vec<Document>>;

    async fn documents(&self, collection: &'_ str) -> Result<Vec<Document>>;

    /// Buffered records of a transaction, in offset order.
    async fn buffered(&self, processor: &'_ str, transaction_id: Uuid)
        -> Result<Vec<BufferedRecord>>;

    async fn open_transactions(&self, processor: &'_ str) -> Result<Vec<PendingTransaction>>;

    async fn finished(
        &self,
        processor: &'_ str,
        transaction_id: Uuid,
    ) -> Result<Option<FinishedTransaction>>;

    async fn offset(&self, processor: &'_ str, partition: i32) -> Result<Option<i64>>;

    async fn commit(&self, commit: Commit) -> Result<()>;

    /// Deletes finished transactions recorded before `before`. Returns the number of deleted
    /// records.
    async fn prune_finished(&self, processor: &'_ str, before: DateTime<Utc>) -> Result<usize>;

    /// Forgets offsets, buffers and finished transactions of a processor.
    async fn reset(&self, processor: &'_ str) -> Result<()>;
}

dyn_clone::clone_trait_object!(Engine);
