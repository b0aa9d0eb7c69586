use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dyn_clone::DynClone;
use serde::{Deserialize, Serialize};
use tidings_store::Record;

use crate::error::Result;

#[cfg(feature = "memory")]
mod memory;
#[cfg(feature = "pg")]
mod pg;

#[cfg(feature = "memory")]
pub use memory::*;
#[cfg(feature = "pg")]
pub use pg::*;

/// A message as stored in a broker partition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "pg", derive(sqlx::FromRow))]
pub struct BrokerRecord {
    pub partition: i32,
    pub offset: i64,
    pub key: Vec<u8>,
    pub payload: Option<Vec<u8>>,
    pub timestamp: DateTime<Utc>,
}

impl BrokerRecord {
    pub fn to_record(&self) -> Result<Record> {
        Ok(Record::decode(&self.key, self.payload.as_deref())?)
    }

    pub fn digest(&self) -> Vec<u8> {
        crate::engine::record_digest(&self.key, self.payload.as_deref())
    }
}

/// Partitioned append-only log. Offsets start at 0 and are dense within a partition.
#[async_trait]
pub trait Broker: DynClone + Send + Sync {
    fn partitions(&self) -> u16;

    /// Appends a message and returns its offset once acknowledged.
    async fn publish(&self, partition: i32, key: &[u8], payload: Option<&[u8]>) -> Result<i64>;

    /// Records of a partition starting at `from_offset`, in offset order.
    async fn fetch(&self, partition: i32, from_offset: i64, max: u16) -> Result<Vec<BrokerRecord>>;

    /// Offset the next published record of the partition will get.
    async fn end_offset(&self, partition: i32) -> Result<i64>;
}

dyn_clone::clone_trait_object!(Broker);
