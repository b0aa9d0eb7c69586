use tidings_store::{MessageKey, Payload, Record, Snapshot, SnapshotWrite, StoredSnapshot};

use crate::{
    error::{Error, Result},
    event_bus::EventBus,
};

enum Emit {
    Event(String),
    Tombstone,
}

/// Fluent pipeline from a loaded snapshot to its committed successor.
///
/// The first failing step short-circuits the rest of the pipeline; nothing is staged or
/// persisted for a failed command.
pub struct CommandHandler<S: Snapshot> {
    original: Option<S>,
    snapshot: S,
    error: Option<Error>,
    emits: Vec<Emit>,
    only_if_changed: bool,
}

pub trait ToCommandHandler: Snapshot {
    fn to_command_handler(self) -> CommandHandler<Self>;
}

impl<S: Snapshot> ToCommandHandler for S {
    fn to_command_handler(self) -> CommandHandler<Self> {
        CommandHandler {
            original: Some(self.clone()),
            snapshot: self,
            error: None,
            emits: Vec::new(),
            only_if_changed: false,
        }
    }
}

impl<S: Snapshot> CommandHandler<S> {
    /// Pipeline for an aggregate that does not exist yet. It is persisted with version 0.
    pub fn create(snapshot: S) -> Self {
        Self {
            original: None,
            snapshot,
            error: None,
            emits: Vec::new(),
            only_if_changed: false,
        }
    }

    pub fn snapshot(&self) -> &S {
        &self.snapshot
    }

    pub fn assert_version_matches(mut self, expected: i64) -> Self {
        if self.error.is_some() {
            return self;
        }

        let actual = self.original.as_ref().map(|s| s.version());

        if actual != Some(expected) {
            self.error = Some(Error::ConcurrencyConflict {
                aggregate_type: S::aggregate_type().to_owned(),
                identifier: self.snapshot.identifier(),
                expected: Some(expected),
                actual,
            });
        }

        self
    }

    pub fn check_precondition(self, check: impl FnOnce(&S) -> bool) -> Check<S> {
        self.check(check, CheckKind::Precondition)
    }

    pub fn check_authorization(self, check: impl FnOnce(&S) -> bool) -> Check<S> {
        self.check(check, CheckKind::Authorization)
    }

    fn check(self, check: impl FnOnce(&S) -> bool, kind: CheckKind) -> Check<S> {
        let passed = self.error.is_some() || check(&self.snapshot);

        Check {
            handler: self,
            passed,
            kind,
        }
    }

    /// Replaces the snapshot with the result of a pure transformation.
    pub fn update(mut self, transform: impl FnOnce(S) -> S) -> Self {
        if self.error.is_none() {
            self.snapshot = transform(self.snapshot);
        }

        self
    }

    pub fn apply_changes(mut self, changes: impl FnOnce(&mut S)) -> Self {
        if self.error.is_none() {
            changes(&mut self.snapshot);
        }

        self
    }

    pub fn emit_event(mut self, kind: impl Into<String>) -> Self {
        self.emits.push(Emit::Event(kind.into()));

        self
    }

    /// Deletes the snapshot and emits a tombstone for it.
    pub fn emit_tombstone(mut self) -> Self {
        self.emits.push(Emit::Tombstone);

        self
    }

    pub fn if_snapshot_was_changed(mut self) -> Self {
        self.only_if_changed = true;

        self
    }

    pub fn was_changed(&self) -> bool {
        match &self.original {
            Some(original) => original != &self.snapshot,
            _ => true,
        }
    }

    /// Commits through the bus, or stages when a business transaction is open, and returns the
    /// persisted snapshot.
    pub async fn to(self, bus: &EventBus) -> Result<S> {
        if let Some(err) = self.error {
            return Err(err);
        }

        let tombstone = self.emits.iter().any(|e| matches!(e, Emit::Tombstone));

        if !tombstone && self.only_if_changed && !self.was_changed() {
            tracing::debug!(
                "{}#{} unchanged, nothing emitted",
                S::aggregate_type(),
                self.snapshot.identifier()
            );

            return Ok(self.snapshot);
        }

        if tombstone {
            return self.delete(bus).await;
        }

        let mut snapshot = self.snapshot;
        let expected_version = self.original.as_ref().map(|s| s.version());

        snapshot.set_version(expected_version.map(|v| v + 1).unwrap_or_default());
        snapshot
            .auditing_mut()
            .stamp(bus.context().user_id.as_deref(), expected_version.is_none());

        let mut records = Vec::with_capacity(self.emits.len());

        for emit in self.emits {
            let Emit::Event(kind) = emit else {
                continue;
            };

            records.push(Record::new(key_of(&snapshot), Payload::new(kind).data(&snapshot)?));
        }

        let write = SnapshotWrite::Save {
            snapshot: StoredSnapshot::from_snapshot(&snapshot)?,
            expected_version,
        };

        bus.submit(vec![write], records).await?;

        Ok(snapshot)
    }

    async fn delete(self, bus: &EventBus) -> Result<S> {
        let Some(original) = self.original else {
            return Err(Error::NotFound {
                aggregate_type: S::aggregate_type().to_owned(),
                identifier: self.snapshot.identifier(),
            });
        };

        let mut snapshot = self.snapshot;
        snapshot.set_version(original.version() + 1);

        let mut records = Vec::with_capacity(self.emits.len());

        for emit in self.emits {
            let record = match emit {
                Emit::Event(kind) => {
                    Record::new(key_of(&snapshot), Payload::new(kind).data(&snapshot)?)
                }
                Emit::Tombstone => Record::tombstone(key_of(&snapshot)),
            };

            records.push(record);
        }

        let write = SnapshotWrite::Delete {
            aggregate_type: S::aggregate_type().to_owned(),
            identifier: original.identifier(),
            expected_version: original.version(),
        };

        bus.submit(vec![write], records).await?;

        Ok(snapshot)
    }
}

fn key_of<S: Snapshot>(snapshot: &S) -> MessageKey {
    MessageKey::new(
        S::aggregate_type(),
        snapshot.identifier(),
        snapshot.version(),
        snapshot.root_context_id(),
    )
}

enum CheckKind {
    Precondition,
    Authorization,
}

/// Result of a check, resolved by choosing the error raised on failure.
pub struct Check<S: Snapshot> {
    handler: CommandHandler<S>,
    passed: bool,
    kind: CheckKind,
}

impl<S: Snapshot> Check<S> {
    pub fn on_failure_throw(mut self, err: impl Into<Error>) -> CommandHandler<S> {
        if !self.passed {
            self.handler.error = Some(err.into());
        }

        self.handler
    }

    /// Fails with a message key: `PreconditionViolation` for preconditions, `AccessDenied` for
    /// authorization checks.
    pub fn on_failure_message(self, key: impl Into<String>) -> CommandHandler<S> {
        let err = match self.kind {
            CheckKind::Precondition => Error::PreconditionViolation(key.into()),
            CheckKind::Authorization => Error::AccessDenied(key.into()),
        };

        self.on_failure_throw(err)
    }
}
