use async_trait::async_trait;
use dyn_clone::DynClone;
use std::collections::{HashMap, HashSet};
use tidings_store::Record;
use tracing::debug;

use crate::{
    error::{Error, Result},
    projection::Projections,
};

#[async_trait]
pub trait EventHandler: DynClone + Send + Sync {
    async fn handle(&self, record: &Record, projections: &mut Projections<'_>)
        -> anyhow::Result<()>;
}

dyn_clone::clone_trait_object!(EventHandler);

/// Static dispatch table from `(aggregate type, event kind)` to handlers, built once at startup.
#[derive(Clone, Default)]
pub struct Registry {
    handlers: HashMap<(String, String), Box<dyn EventHandler>>,
    tombstones: HashMap<String, Box<dyn EventHandler>>,
    aggregate_types: HashSet<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<H: EventHandler + 'static>(
        mut self,
        aggregate_type: impl Into<String>,
        kind: impl Into<String>,
        handler: H,
    ) -> Self {
        let key = (aggregate_type.into(), kind.into());

        if self.handlers.contains_key(&key) {
            panic!("handler for {}/{} registered twice", key.0, key.1);
        }

        self.aggregate_types.insert(key.0.to_owned());
        self.handlers.insert(key, Box::new(handler));

        self
    }

    pub fn on_tombstone<H: EventHandler + 'static>(
        mut self,
        aggregate_type: impl Into<String>,
        handler: H,
    ) -> Self {
        let aggregate_type = aggregate_type.into();

        if self.tombstones.contains_key(&aggregate_type) {
            panic!("tombstone handler for {aggregate_type} registered twice");
        }

        self.aggregate_types.insert(aggregate_type.to_owned());
        self.tombstones.insert(aggregate_type, Box::new(handler));

        self
    }

    pub fn can_handle(&self, record: &Record) -> bool {
        self.aggregate_types.contains(&record.key.aggregate_type)
    }

    /// Routes a record to its handler. Returns `false` when no handler is registered for the
    /// aggregate type.
    pub async fn dispatch(
        &self,
        record: &Record,
        projections: &mut Projections<'_>,
    ) -> Result<bool> {
        if !self.can_handle(record) {
            debug!(
                "skip {}#{} v{}, aggregate type not registered",
                record.key.aggregate_type, record.key.aggregate_id, record.key.version
            );

            return Ok(false);
        }

        let aggregate_type = record.key.aggregate_type.to_owned();

        let handler = match record.kind() {
            Some(kind) => self.handlers.get(&(aggregate_type.to_owned(), kind.to_owned())),
            _ => self.tombstones.get(&aggregate_type),
        };

        let Some(handler) = handler else {
            return Err(Error::InvalidEventKind {
                aggregate_type,
                kind: record.kind().map(ToOwned::to_owned),
            });
        };

        handler
            .handle(record, projections)
            .await
            .map_err(|error| Error::Handler {
                aggregate_type,
                kind: record.kind().unwrap_or("tombstone").to_owned(),
                error,
            })?;

        Ok(true)
    }
}
