use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    engine::{
        BufferedRecord, Commit, Document, DocumentRef, DocumentWrite, Engine, FinishedTransaction,
        PendingTransaction,
    },
    error::Result,
};

#[derive(Debug, Clone)]
pub struct PgEngine {
    pool: PgPool,
    prefix: Option<String>,
}

impl PgEngine {
    pub fn new(pool: &PgPool) -> Self {
        Self {
            pool: pool.clone(),
            prefix: None,
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

    pub fn table_document(&self) -> String {
        self.table("document")
    }

    pub fn table_transaction_buffer(&self) -> String {
        self.table("transaction_buffer")
    }

    pub fn table_transaction_finished(&self) -> String {
        self.table("transaction_finished")
    }

    pub fn table_consumer_offset(&self) -> String {
        self.table("consumer_offset")
    }
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    collection: String,
    id: Uuid,
    parent_collection: Option<String>,
    parent_id: Option<Uuid>,
    version: i64,
    data: Value,
}

impl From<DocumentRow> for Document {
    fn from(row: DocumentRow) -> Self {
        let parent = match (row.parent_collection, row.parent_id) {
            (Some(collection), Some(id)) => Some(DocumentRef { collection, id }),
            _ => None,
        };

        Document {
            collection: row.collection,
            id: row.id,
            parent,
            version: row.version,
            data: row.data,
        }
    }
}

#[derive(sqlx::FromRow)]
struct BufferedRow {
    transaction_id: Uuid,
    processor: String,
    partition: i32,
    consumer_offset: i64,
    key: Vec<u8>,
    payload: Option<Vec<u8>>,
    created_at: DateTime<Utc>,
}

impl From<BufferedRow> for BufferedRecord {
    fn from(row: BufferedRow) -> Self {
        BufferedRecord {
            transaction_id: row.transaction_id,
            processor: row.processor,
            partition: row.partition,
            offset: row.consumer_offset,
            key: row.key,
            payload: row.payload,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl Engine for PgEngine {
    async fn document(&self, collection: &'_ str, id: Uuid) -> Result<Option<Document>> {
        let table_document = self.table_document();

        let row = sqlx::query_as::<_, DocumentRow>(
            format!("SELECT * FROM {table_document} WHERE collection = $1 AND id = $2").as_str(),
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn children(&self, parent: &'_ DocumentRef) -> Result<Vec<Document>> {
        let table_document = self.table_document();

        let rows = sqlx::query_as::<_, DocumentRow>(
            format!(
                "SELECT * FROM {table_document} WHERE parent_collection = $1 AND parent_id = $2"
            )
            .as_str(),
        )
        .bind(&parent.collection)
        .bind(parent.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn documents(&self, collection: &'_ str) -> Result<Vec<Document>> {
        let table_document = self.table_document();

        let rows = sqlx::query_as::<_, DocumentRow>(
            format!("SELECT * FROM {table_document} WHERE collection = $1 ORDER BY id").as_str(),
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn buffered(
        &self,
        processor: &'_ str,
        transaction_id: Uuid,
    ) -> Result<Vec<BufferedRecord>> {
        let table_transaction_buffer = self.table_transaction_buffer();

        let rows = sqlx::query_as::<_, BufferedRow>(
            format!(
                r#"
                SELECT * FROM {table_transaction_buffer}
                WHERE processor = $1 AND transaction_id = $2
                ORDER BY consumer_offset ASC
                "#
            )
            .as_str(),
        )
        .bind(processor)
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn open_transactions(&self, processor: &'_ str) -> Result<Vec<PendingTransaction>> {
        let table_transaction_buffer = self.table_transaction_buffer();

        let transactions = sqlx::query_as::<_, PendingTransaction>(
            format!(
                r#"
                SELECT transaction_id, MIN(partition) AS partition, COUNT(*) AS records,
                    MIN(consumer_offset) AS first_offset, MAX(consumer_offset) AS last_offset,
                    MIN(created_at) AS started_at
                FROM {table_transaction_buffer}
                WHERE processor = $1
                GROUP BY transaction_id
                ORDER BY partition, first_offset
                "#
            )
            .as_str(),
        )
        .bind(processor)
        .fetch_all(&self.pool)
        .await?;

        Ok(transactions)
    }

    async fn finished(
        &self,
        processor: &'_ str,
        transaction_id: Uuid,
    ) -> Result<Option<FinishedTransaction>> {
        let table_transaction_finished = self.table_transaction_finished();

        let finished = sqlx::query_as::<_, FinishedTransaction>(
            format!(
                r#"
                SELECT transaction_id, processor, consumer_offset AS "offset", finished_at,
                    record_digests AS digests
                FROM {table_transaction_finished}
                WHERE processor = $1 AND transaction_id = $2
                "#
            )
            .as_str(),
        )
        .bind(processor)
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(finished)
    }

    async fn offset(&self, processor: &'_ str, partition: i32) -> Result<Option<i64>> {
        let table_consumer_offset = self.table_consumer_offset();

        let offset = sqlx::query_as::<_, (i64,)>(
            format!(
                "SELECT next_offset FROM {table_consumer_offset} WHERE processor = $1 AND partition = $2"
            )
            .as_str(),
        )
        .bind(processor)
        .bind(partition)
        .fetch_optional(&self.pool)
        .await?;

        Ok(offset.map(|(offset,)| offset))
    }

    async fn commit(&self, commit: Commit) -> Result<()> {
        let table_document = self.table_document();
        let table_transaction_buffer = self.table_transaction_buffer();
        let table_transaction_finished = self.table_transaction_finished();
        let table_consumer_offset = self.table_consumer_offset();
        let mut tx = self.pool.begin().await?;

        for write in commit.documents.iter() {
            match write {
                DocumentWrite::Put(doc) => {
                    sqlx::query(
                        format!(
                            r#"
                            INSERT INTO {table_document} (collection, id, parent_collection, parent_id, version, data, updated_at)
                            VALUES ($1, $2, $3, $4, $5, $6, $7)
                            ON CONFLICT (collection, id)
                            DO
                                UPDATE SET parent_collection = $3, parent_id = $4, version = $5, data = $6, updated_at = $7
                            "#
                        )
                        .as_str(),
                    )
                    .bind(&doc.collection)
                    .bind(doc.id)
                    .bind(doc.parent.as_ref().map(|p| p.collection.to_owned()))
                    .bind(doc.parent.as_ref().map(|p| p.id))
                    .bind(doc.version)
                    .bind(&doc.data)
                    .bind(Utc::now())
                    .execute(&mut *tx)
                    .await?;
                }
                DocumentWrite::Delete(doc) => {
                    sqlx::query(
                        format!("DELETE FROM {table_document} WHERE collection = $1 AND id = $2")
                            .as_str(),
                    )
                    .bind(&doc.collection)
                    .bind(doc.id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        for record in commit.buffer.iter() {
            sqlx::query(
                format!(
                    r#"
                    INSERT INTO {table_transaction_buffer} (transaction_id, processor, partition, consumer_offset, key, payload, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT DO NOTHING
                    "#
                )
                .as_str(),
            )
            .bind(record.transaction_id)
            .bind(&record.processor)
            .bind(record.partition)
            .bind(record.offset)
            .bind(&record.key)
            .bind(&record.payload)
            .bind(record.created_at)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(transaction_id) = commit.release {
            sqlx::query(
                format!(
                    "DELETE FROM {table_transaction_buffer} WHERE processor = $1 AND transaction_id = $2"
                )
                .as_str(),
            )
            .bind(&commit.processor)
            .bind(transaction_id)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(finished) = commit.finished.as_ref() {
            sqlx::query(
                format!(
                    r#"
                    INSERT INTO {table_transaction_finished} (transaction_id, processor, consumer_offset, finished_at, record_digests)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (processor, transaction_id)
                    DO
                        UPDATE SET consumer_offset = $3, finished_at = $4, record_digests = $5
                    "#
                )
                .as_str(),
            )
            .bind(finished.transaction_id)
            .bind(&finished.processor)
            .bind(finished.offset)
            .bind(finished.finished_at)
            .bind(&finished.digests)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            format!(
                r#"
                INSERT INTO {table_consumer_offset} (processor, partition, next_offset, updated_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (processor, partition)
                DO
                    UPDATE SET next_offset = GREATEST({table_consumer_offset}.next_offset, $3), updated_at = $4
                "#
            )
            .as_str(),
        )
        .bind(&commit.processor)
        .bind(commit.partition)
        .bind(commit.offset)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    async fn prune_finished(&self, processor: &'_ str, before: DateTime<Utc>) -> Result<usize> {
        let table_transaction_finished = self.table_transaction_finished();

        let result = sqlx::query(
            format!(
                r#"
                DELETE FROM {table_transaction_finished}
                WHERE processor = $1 AND finished_at < $2
                "#
            )
            .as_str(),
        )
        .bind(processor)
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }

    async fn reset(&self, processor: &'_ str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for table in [
            self.table_transaction_buffer(),
            self.table_transaction_finished(),
            self.table_consumer_offset(),
        ] {
            sqlx::query(format!("DELETE FROM {table} WHERE processor = $1").as_str())
                .bind(processor)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(())
    }
}
