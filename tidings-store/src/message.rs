use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, StoreError};

/// Aggregate type used for the framing events of a business transaction.
pub const BUSINESS_TRANSACTION: &str = "BUSINESS_TRANSACTION";

pub const TRANSACTION_STARTED: &str = "TransactionStarted";
pub const TRANSACTION_FINISHED: &str = "TransactionFinished";

/// Key of every message written to the outbox and relayed to the broker.
///
/// `root_context_id` is the partitioning key: all events of one logical root land on the same
/// partition and are totally ordered relative to each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub version: i64,
    pub root_context_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_transaction_id: Option<Uuid>,
}

impl MessageKey {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: Uuid,
        version: i64,
        root_context_id: Uuid,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id,
            version,
            root_context_id,
            business_transaction_id: None,
        }
    }

    pub fn business_transaction(mut self, id: Uuid) -> Self {
        self.business_transaction_id = Some(id);

        self
    }

    pub fn partition(&self, partitions: u16) -> i32 {
        partition_of(self.root_context_id, partitions)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Maps a root context to a partition. Stable across processes and restarts.
pub fn partition_of(root_context_id: Uuid, partitions: u16) -> i32 {
    let partitions = u128::from(partitions.max(1));

    (root_context_id.as_u128() % partitions) as i32
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub kind: String,
    pub revision: u16,
    pub data: Value,
}

impl Payload {
    pub fn new<K: Into<String>>(kind: K) -> Self {
        Self {
            kind: kind.into(),
            revision: 1,
            data: Value::Null,
        }
    }

    pub fn revision(mut self, value: u16) -> Self {
        self.revision = value;

        self
    }

    pub fn data<D: Serialize>(mut self, value: D) -> Result<Self> {
        self.data = serde_json::to_value(&value)?;

        Ok(self)
    }

    pub fn to_data<D: DeserializeOwned>(&self) -> Result<D> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn transaction_started(transaction_id: Uuid) -> Self {
        Self {
            kind: TRANSACTION_STARTED.to_owned(),
            revision: 1,
            data: serde_json::json!({ "businessTransactionId": transaction_id }),
        }
    }

    pub fn transaction_finished(transaction_id: Uuid) -> Self {
        Self {
            kind: TRANSACTION_FINISHED.to_owned(),
            revision: 1,
            data: serde_json::json!({ "businessTransactionId": transaction_id }),
        }
    }
}

/// A decoded `(key, payload)` pair. A missing payload is a tombstone.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: MessageKey,
    pub payload: Option<Payload>,
}

impl Record {
    pub fn new(key: MessageKey, payload: Payload) -> Self {
        Self {
            key,
            payload: Some(payload),
        }
    }

    pub fn tombstone(key: MessageKey) -> Self {
        Self { key, payload: None }
    }

    pub fn decode(key: &[u8], payload: Option<&[u8]>) -> Result<Self> {
        let key = MessageKey::from_bytes(key)
            .map_err(|e| StoreError::InvalidMessage(format!("key: {e}")))?;

        let payload = match payload {
            Some(bytes) => Some(
                Payload::from_bytes(bytes)
                    .map_err(|e| StoreError::InvalidMessage(format!("payload: {e}")))?,
            ),
            _ => None,
        };

        Ok(Self { key, payload })
    }

    pub fn encode(&self) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        let payload = match &self.payload {
            Some(payload) => Some(payload.to_bytes()?),
            _ => None,
        };

        Ok((self.key.to_bytes()?, payload))
    }

    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }

    pub fn kind(&self) -> Option<&str> {
        self.payload.as_ref().map(|p| p.kind.as_str())
    }

    pub fn is_transaction_started(&self) -> bool {
        self.key.aggregate_type == BUSINESS_TRANSACTION && self.kind() == Some(TRANSACTION_STARTED)
    }

    pub fn is_transaction_finished(&self) -> bool {
        self.key.aggregate_type == BUSINESS_TRANSACTION
            && self.kind() == Some(TRANSACTION_FINISHED)
    }

    pub fn to_data<D: DeserializeOwned>(&self) -> Result<Option<D>> {
        match &self.payload {
            Some(payload) => Ok(Some(payload.to_data()?)),
            _ => Ok(None),
        }
    }
}
