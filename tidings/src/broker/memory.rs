use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::{
    broker::{Broker, BrokerRecord},
    error::Result,
};

/// In-process broker keeping one append-only log per partition.
#[derive(Debug, Clone)]
pub struct MemoryBroker(Arc<RwLock<Vec<Vec<BrokerRecord>>>>);

impl MemoryBroker {
    pub fn new(partitions: u16) -> Self {
        let logs = (0..partitions.max(1)).map(|_| Vec::new()).collect();

        Self(Arc::new(RwLock::new(logs)))
    }

    /// Every record of a partition, for inspection.
    pub fn records(&self, partition: i32) -> Vec<BrokerRecord> {
        usize::try_from(partition)
            .ok()
            .and_then(|p| self.0.read().get(p).cloned())
            .unwrap_or_default()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(crate::config::PARTITIONS)
    }
}

fn index(partition: i32, partitions: usize) -> Result<usize> {
    match usize::try_from(partition) {
        Ok(p) if p < partitions => Ok(p),
        _ => Err(anyhow!("partition {partition} out of range 0..{partitions}").into()),
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn partitions(&self) -> u16 {
        u16::try_from(self.0.read().len()).unwrap_or(u16::MAX)
    }

    async fn publish(&self, partition: i32, key: &[u8], payload: Option<&[u8]>) -> Result<i64> {
        let mut logs = self.0.write();
        let p = index(partition, logs.len())?;
        let log = &mut logs[p];
        let offset = i64::try_from(log.len()).map_err(anyhow::Error::from)?;

        log.push(BrokerRecord {
            partition,
            offset,
            key: key.to_vec(),
            payload: payload.map(<[u8]>::to_vec),
            timestamp: Utc::now(),
        });

        Ok(offset)
    }

    async fn fetch(&self, partition: i32, from_offset: i64, max: u16) -> Result<Vec<BrokerRecord>> {
        let logs = self.0.read();
        let p = index(partition, logs.len())?;
        let start = usize::try_from(from_offset.max(0)).map_err(anyhow::Error::from)?;

        Ok(logs[p]
            .iter()
            .skip(start)
            .take(usize::from(max))
            .cloned()
            .collect())
    }

    async fn end_offset(&self, partition: i32) -> Result<i64> {
        let logs = self.0.read();
        let p = index(partition, logs.len())?;

        Ok(i64::try_from(logs[p].len()).map_err(anyhow::Error::from)?)
    }
}
