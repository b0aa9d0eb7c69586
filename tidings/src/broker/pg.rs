use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use crate::{
    broker::{Broker, BrokerRecord},
    error::Result,
};

/// Broker log persisted in Postgres. Offsets are assigned under a per-partition advisory lock.
#[derive(Debug, Clone)]
pub struct PgBroker {
    pool: PgPool,
    prefix: Option<String>,
    partitions: u16,
}

impl PgBroker {
    pub fn new(pool: &PgPool, partitions: u16) -> Self {
        Self {
            pool: pool.clone(),
            prefix: None,
            partitions: partitions.max(1),
        }
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());

        self
    }

    pub fn table(&self, name: impl Into<String>) -> String {
        format!(
            "{}_{}",
            self.prefix.as_ref().unwrap_or(&"td".to_owned()),
            name.into()
        )
    }

    pub fn table_broker_log(&self) -> String {
        self.table("broker_log")
    }
}

#[async_trait]
impl Broker for PgBroker {
    fn partitions(&self) -> u16 {
        self.partitions
    }

    async fn publish(&self, partition: i32, key: &[u8], payload: Option<&[u8]>) -> Result<i64> {
        let table_broker_log = self.table_broker_log();
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("{table_broker_log}#{partition}"))
            .execute(&mut *tx)
            .await?;

        let (offset,) = sqlx::query_as::<_, (i64,)>(
            format!(
                r#"
                INSERT INTO {table_broker_log} (partition, log_offset, key, payload, timestamp)
                SELECT $1, COALESCE(MAX(log_offset) + 1, 0), $2, $3, $4
                FROM {table_broker_log} WHERE partition = $1
                RETURNING log_offset
                "#
            )
            .as_str(),
        )
        .bind(partition)
        .bind(key)
        .bind(payload)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(offset)
    }

    async fn fetch(&self, partition: i32, from_offset: i64, max: u16) -> Result<Vec<BrokerRecord>> {
        let table_broker_log = self.table_broker_log();

        let records = sqlx::query_as::<_, BrokerRecord>(
            format!(
                r#"
                SELECT partition, log_offset AS "offset", key, payload, timestamp
                FROM {table_broker_log}
                WHERE partition = $1 AND log_offset >= $2
                ORDER BY log_offset ASC
                LIMIT $3
                "#
            )
            .as_str(),
        )
        .bind(partition)
        .bind(from_offset)
        .bind(i64::from(max))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn end_offset(&self, partition: i32) -> Result<i64> {
        let table_broker_log = self.table_broker_log();

        let (offset,) = sqlx::query_as::<_, (i64,)>(
            format!(
                "SELECT COALESCE(MAX(log_offset) + 1, 0) FROM {table_broker_log} WHERE partition = $1"
            )
            .as_str(),
        )
        .bind(partition)
        .fetch_one(&self.pool)
        .await?;

        Ok(offset)
    }
}
