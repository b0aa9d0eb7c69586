use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    engine::{check_version, Engine},
    error::Result,
    outbox::{Changeset, OutboxEntry, OutboxRow, SnapshotWrite},
    snapshot::StoredSnapshot,
    store::Store,
};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    prefix: Option<String>,
}

impl PgStore {
    pub fn new(pool: &PgPool) -> Store {
        Store::new(Self {
            pool: pool.clone(),
            prefix: None,
        })
    }

    pub fn with_prefix(pool: &PgPool, prefix: impl Into<String>) -> Store {
        Store::new(Self {
            pool: pool.clone(),
            prefix: Some(prefix.into()),
        })
    }

    pub fn table(&self, name: impl Into<String>) -> String {
        format!(
            "{}_{}",
            self.prefix.as_ref().unwrap_or(&"td".to_owned()),
            name.into()
        )
    }

    pub fn table_snapshot(&self) -> String {
        self.table("snapshot")
    }

    pub fn table_outbox(&self) -> String {
        self.table("outbox")
    }
}

#[async_trait]
impl Engine for PgStore {
    async fn get(
        &self,
        aggregate_type: &'_ str,
        identifier: Uuid,
    ) -> Result<Option<StoredSnapshot>> {
        let table_snapshot = self.table_snapshot();

        let snapshot = sqlx::query_as::<_, StoredSnapshot>(
            format!(
                r#"
                SELECT * FROM {table_snapshot}
                WHERE aggregate_type = $1 AND identifier = $2
                "#
            )
            .as_str(),
        )
        .bind(aggregate_type)
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;

        Ok(snapshot)
    }

    async fn commit(&self, changeset: Changeset) -> Result<Vec<OutboxRow>> {
        if changeset.is_empty() {
            return Ok(vec![]);
        }

        let table_snapshot = self.table_snapshot();
        let table_outbox = self.table_outbox();
        let mut tx = self.pool.begin().await?;

        for write in changeset.snapshots.iter() {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(format!("{}#{}", write.aggregate_type(), write.identifier()))
                .execute(&mut *tx)
                .await?;

            let actual = sqlx::query_as::<_, (i64,)>(
                format!(
                    r#"
                    SELECT version FROM {table_snapshot}
                    WHERE aggregate_type = $1 AND identifier = $2
                    FOR UPDATE
                    "#
                )
                .as_str(),
            )
            .bind(write.aggregate_type())
            .bind(write.identifier())
            .fetch_optional(&mut *tx)
            .await?
            .map(|(version,)| version);

            if let Err(e) = check_version(write, actual) {
                tx.rollback().await?;

                return Err(e);
            }

            match write {
                SnapshotWrite::Save { snapshot, .. } => {
                    sqlx::query(
                        format!(
                            r#"
                            INSERT INTO {table_snapshot} (aggregate_type, identifier, root_context_id, version, data, updated_at)
                            VALUES ($1, $2, $3, $4, $5, $6)
                            ON CONFLICT (aggregate_type, identifier)
                            DO
                                UPDATE SET root_context_id = $3, version = $4, data = $5, updated_at = $6
                            "#
                        )
                        .as_str(),
                    )
                    .bind(&snapshot.aggregate_type)
                    .bind(snapshot.identifier)
                    .bind(snapshot.root_context_id)
                    .bind(snapshot.version)
                    .bind(&snapshot.data)
                    .bind(snapshot.updated_at)
                    .execute(&mut *tx)
                    .await?;
                }
                SnapshotWrite::Delete {
                    aggregate_type,
                    identifier,
                    ..
                } => {
                    sqlx::query(
                        format!(
                            "DELETE FROM {table_snapshot} WHERE aggregate_type = $1 AND identifier = $2"
                        )
                        .as_str(),
                    )
                    .bind(aggregate_type)
                    .bind(identifier)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        let mut rows = Vec::new();

        for entries in changeset.entries.chunks(100).collect::<Vec<&[OutboxEntry]>>() {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {table_outbox} (partition, key, payload, transaction_id, created_at) "
            ));

            query_builder.push_values(entries, |mut b, entry| {
                b.push_bind(entry.partition)
                    .push_bind(entry.key.clone())
                    .push_bind(entry.payload.clone())
                    .push_bind(entry.transaction_id)
                    .push_bind(Utc::now());
            });

            query_builder.push(" RETURNING *");

            let mut inserted = query_builder
                .build_query_as::<OutboxRow>()
                .fetch_all(&mut *tx)
                .await?;

            inserted.sort_by_key(|row| row.sequence);
            rows.extend(inserted);
        }

        tx.commit().await?;

        Ok(rows)
    }

    async fn pending(&self, partition: i32, limit: u16) -> Result<Vec<OutboxRow>> {
        let table_outbox = self.table_outbox();

        let rows = sqlx::query_as::<_, OutboxRow>(
            format!(
                r#"
                SELECT * FROM {table_outbox}
                WHERE partition = $1
                ORDER BY sequence ASC
                LIMIT $2
                "#
            )
            .as_str(),
        )
        .bind(partition)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn partitions(&self) -> Result<Vec<i32>> {
        let table_outbox = self.table_outbox();

        let partitions = sqlx::query_as::<_, (i32,)>(
            format!("SELECT DISTINCT partition FROM {table_outbox} ORDER BY partition").as_str(),
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(partitions.into_iter().map(|(p,)| p).collect())
    }

    async fn remove(&self, sequences: &[i64]) -> Result<()> {
        if sequences.is_empty() {
            return Ok(());
        }

        let table_outbox = self.table_outbox();

        sqlx::query(format!("DELETE FROM {table_outbox} WHERE sequence = ANY($1)").as_str())
            .bind(sequences)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
