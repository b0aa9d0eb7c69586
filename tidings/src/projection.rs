use serde::{de::DeserializeOwned, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::debug;
use uuid::Uuid;

use crate::{
    engine::{Document, DocumentRef, DocumentWrite, Engine},
    error::Result,
};

/// Projection writes of one local transaction, readable before they are committed.
pub struct Projections<'a> {
    engine: &'a dyn Engine,
    staged: HashMap<DocumentRef, Option<Document>>,
    writes: Vec<DocumentWrite>,
}

impl<'a> Projections<'a> {
    pub fn new(engine: &'a dyn Engine) -> Self {
        Self {
            engine,
            staged: HashMap::new(),
            writes: Vec::new(),
        }
    }

    pub async fn document(&self, collection: &str, id: Uuid) -> Result<Option<Document>> {
        match self.staged.get(&DocumentRef::new(collection, id)) {
            Some(staged) => Ok(staged.clone()),
            _ => self.engine.document(collection, id).await,
        }
    }

    pub async fn find<D: DeserializeOwned>(&self, collection: &str, id: Uuid) -> Result<Option<D>> {
        match self.document(collection, id).await? {
            Some(doc) => Ok(Some(doc.to_data()?)),
            _ => Ok(None),
        }
    }

    pub fn put(&mut self, document: Document) {
        self.staged.insert(document.to_ref(), Some(document.clone()));
        self.writes.push(DocumentWrite::Put(document));
    }

    /// Creates the document when absent, otherwise runs `update` on the stored copy.
    ///
    /// A document already at a newer version is left untouched and `false` is returned.
    pub async fn upsert<D, C, U>(
        &mut self,
        target: DocumentRef,
        parent: Option<DocumentRef>,
        version: i64,
        create: C,
        update: U,
    ) -> Result<bool>
    where
        D: Serialize + DeserializeOwned,
        C: FnOnce() -> D,
        U: FnOnce(&mut D),
    {
        let existing = self.document(&target.collection, target.id).await?;

        let (data, parent) = match existing {
            Some(doc) if doc.version > version => {
                debug!(
                    "{}#{} at version {} skips stale version {version}",
                    doc.collection, doc.id, doc.version
                );

                return Ok(false);
            }
            Some(doc) => {
                let mut data = doc.to_data::<D>()?;
                update(&mut data);

                (data, parent.or(doc.parent))
            }
            None => {
                let mut data = create();
                update(&mut data);

                (data, parent)
            }
        };

        let mut document = Document::new(target.collection, target.id)
            .version(version)
            .data(&data)?;
        document.parent = parent;

        self.put(document);

        Ok(true)
    }

    /// Removes a document and every document whose parent chain leads to it. Returns the
    /// number of removed documents.
    pub async fn delete(&mut self, collection: &str, id: Uuid) -> Result<usize> {
        let mut queue = VecDeque::from([DocumentRef::new(collection, id)]);
        let mut removed = 0;

        while let Some(target) = queue.pop_front() {
            if self.document(&target.collection, target.id).await?.is_none() {
                continue;
            }

            for child in self.children(&target).await? {
                queue.push_back(child);
            }

            self.staged.insert(target.clone(), None);
            self.writes.push(DocumentWrite::Delete(target));
            removed += 1;
        }

        Ok(removed)
    }

    async fn children(&self, parent: &DocumentRef) -> Result<Vec<DocumentRef>> {
        let mut children = self
            .engine
            .children(parent)
            .await?
            .into_iter()
            .map(|doc| doc.to_ref())
            .filter(|child| !self.staged.contains_key(child))
            .collect::<Vec<_>>();

        children.extend(self.staged.iter().filter_map(|(child, doc)| {
            doc.as_ref()
                .filter(|doc| doc.parent.as_ref() == Some(parent))
                .map(|_| child.clone())
        }));

        Ok(children)
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn into_writes(self) -> Vec<DocumentWrite> {
        self.writes
    }
}
