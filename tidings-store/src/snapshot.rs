use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;

/// Who created and last modified a snapshot, stamped on every commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Auditing {
    pub created_by: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_modified_by: Option<String>,
    pub last_modified_at: Option<DateTime<Utc>>,
}

impl Auditing {
    pub fn stamp(&mut self, user_id: Option<&str>, created: bool) {
        let now = Utc::now();

        if created || self.created_at.is_none() {
            self.created_by = user_id.map(ToOwned::to_owned);
            self.created_at = Some(now);
        }

        self.last_modified_by = user_id.map(ToOwned::to_owned);
        self.last_modified_at = Some(now);
    }
}

/// Latest materialized state of an aggregate.
///
/// A snapshot starts at version 0 and every applied mutation bumps the version by exactly one.
/// Equality must cover every business field: a command whose update yields an equal snapshot is a
/// no-op and emits nothing.
pub trait Snapshot:
    Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn aggregate_type<'a>() -> &'a str;

    fn identifier(&self) -> Uuid;

    /// Partitioning key. Defaults to the snapshot's own identifier (a root aggregate).
    fn root_context_id(&self) -> Uuid {
        self.identifier()
    }

    fn version(&self) -> i64;

    fn set_version(&mut self, version: i64);

    fn auditing(&self) -> &Auditing;

    fn auditing_mut(&mut self) -> &mut Auditing;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "pg", derive(sqlx::FromRow))]
pub struct StoredSnapshot {
    pub aggregate_type: String,
    pub identifier: Uuid,
    pub root_context_id: Uuid,
    pub version: i64,
    pub data: Value,
    pub updated_at: DateTime<Utc>,
}

impl StoredSnapshot {
    pub fn from_snapshot<S: Snapshot>(snapshot: &S) -> Result<Self> {
        Ok(Self {
            aggregate_type: S::aggregate_type().to_owned(),
            identifier: snapshot.identifier(),
            root_context_id: snapshot.root_context_id(),
            version: snapshot.version(),
            data: serde_json::to_value(snapshot)?,
            updated_at: Utc::now(),
        })
    }

    pub fn to_snapshot<S: Snapshot>(&self) -> Result<S> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}
