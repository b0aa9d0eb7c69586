use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::{
    engine::{
        BufferedRecord, Commit, Document, DocumentRef, DocumentWrite, Engine, FinishedTransaction,
        PendingTransaction,
    },
    error::Result,
};

#[derive(Debug, Default)]
struct State {
    documents: HashMap<DocumentRef, Document>,
    buffers: HashMap<(String, Uuid), Vec<BufferedRecord>>,
    finished: HashMap<(String, Uuid), FinishedTransaction>,
    offsets: HashMap<(String, i32), i64>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryEngine(Arc<RwLock<State>>);

#[async_trait]
impl Engine for MemoryEngine {
    async fn document(&self, collection: &'_ str, id: Uuid) -> Result<Option<Document>> {
        Ok(self
            .0
            .read()
            .documents
            .get(&DocumentRef::new(collection, id))
            .cloned())
    }

    async fn children(&self, parent: &'_ DocumentRef) -> Result<Vec<Document>> {
        Ok(self
            .0
            .read()
            .documents
            .values()
            .filter(|doc| doc.parent.as_ref() == Some(parent))
            .cloned()
            .collect())
    }

    async fn documents(&self, collection: &'_ str) -> Result<Vec<Document>> {
        let mut documents = self
            .0
            .read()
            .documents
            .values()
            .filter(|doc| doc.collection == collection)
            .cloned()
            .collect::<Vec<_>>();

        documents.sort_by_key(|doc| doc.id);

        Ok(documents)
    }

    async fn buffered(
        &self,
        processor: &'_ str,
        transaction_id: Uuid,
    ) -> Result<Vec<BufferedRecord>> {
        Ok(self
            .0
            .read()
            .buffers
            .get(&(processor.to_owned(), transaction_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn open_transactions(&self, processor: &'_ str) -> Result<Vec<PendingTransaction>> {
        let state = self.0.read();
        let mut transactions = Vec::new();

        for ((p, transaction_id), records) in state.buffers.iter() {
            let (Some(first), Some(last)) = (records.first(), records.last()) else {
                continue;
            };

            if p != processor {
                continue;
            }

            transactions.push(PendingTransaction {
                transaction_id: *transaction_id,
                partition: first.partition,
                records: i64::try_from(records.len()).unwrap_or(i64::MAX),
                first_offset: first.offset,
                last_offset: last.offset,
                started_at: first.created_at,
            });
        }

        transactions.sort_by_key(|tx| (tx.partition, tx.first_offset));

        Ok(transactions)
    }

    async fn finished(
        &self,
        processor: &'_ str,
        transaction_id: Uuid,
    ) -> Result<Option<FinishedTransaction>> {
        Ok(self
            .0
            .read()
            .finished
            .get(&(processor.to_owned(), transaction_id))
            .cloned())
    }

    async fn offset(&self, processor: &'_ str, partition: i32) -> Result<Option<i64>> {
        Ok(self
            .0
            .read()
            .offsets
            .get(&(processor.to_owned(), partition))
            .copied())
    }

    async fn commit(&self, commit: Commit) -> Result<()> {
        let mut state = self.0.write();

        for write in commit.documents {
            match write {
                DocumentWrite::Put(doc) => {
                    state.documents.insert(doc.to_ref(), doc);
                }
                DocumentWrite::Delete(doc) => {
                    state.documents.remove(&doc);
                }
            }
        }

        for record in commit.buffer {
            let mut buffer = state
                .buffers
                .remove(&(record.processor.to_owned(), record.transaction_id))
                .unwrap_or_default();
            let key = (record.processor.to_owned(), record.transaction_id);

            buffer.push(record);
            buffer.sort_by_key(|r| r.offset);
            state.buffers.insert(key, buffer);
        }

        if let Some(transaction_id) = commit.release {
            state
                .buffers
                .remove(&(commit.processor.to_owned(), transaction_id));
        }

        if let Some(finished) = commit.finished {
            state.finished.insert(
                (finished.processor.to_owned(), finished.transaction_id),
                finished,
            );
        }

        let offset = state
            .offsets
            .entry((commit.processor, commit.partition))
            .or_insert(commit.offset);

        *offset = (*offset).max(commit.offset);

        Ok(())
    }

    async fn prune_finished(&self, processor: &'_ str, before: DateTime<Utc>) -> Result<usize> {
        let mut state = self.0.write();
        let len = state.finished.len();

        state
            .finished
            .retain(|(p, _), finished| p != processor || finished.finished_at >= before);

        Ok(len - state.finished.len())
    }

    async fn reset(&self, processor: &'_ str) -> Result<()> {
        let mut state = self.0.write();

        state.buffers.retain(|(p, _), _| p != processor);
        state.finished.retain(|(p, _), _| p != processor);
        state.offsets.retain(|(p, _), _| p != processor);

        Ok(())
    }
}
