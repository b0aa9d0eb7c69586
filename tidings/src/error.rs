use tidings_store::StoreError;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{aggregate_type}#{identifier} expected version {expected:?} but found {actual:?}")]
    ConcurrencyConflict {
        aggregate_type: String,
        identifier: Uuid,
        expected: Option<i64>,
        actual: Option<i64>,
    },

    #[error("{aggregate_type}#{identifier} not found")]
    NotFound {
        aggregate_type: String,
        identifier: Uuid,
    },

    #[error("payload of {size} bytes exceeds the limit of {limit} bytes")]
    OversizedMessage { size: usize, limit: usize },

    #[error("modifying operations are blocked")]
    BlockedOperation,

    #[error("precondition failed `{0}`")]
    PreconditionViolation(String),

    #[error("access denied `{0}`")]
    AccessDenied(String),

    #[error("business transaction {transaction_id} on partition {partition}: {reason}")]
    UnknownOrOutOfOrderTransaction {
        transaction_id: Uuid,
        partition: i32,
        reason: String,
    },

    #[error("business transaction {transaction_id} is bound to partition {expected}, got {actual}")]
    CrossPartitionTransaction {
        transaction_id: Uuid,
        expected: i32,
        actual: i32,
    },

    #[error("invalid event kind {kind:?} for aggregate type {aggregate_type}")]
    InvalidEventKind {
        aggregate_type: String,
        kind: Option<String>,
    },

    #[error("partition {partition} offset {offset} is past the online offset {max_offset}")]
    RestoreAheadOfOnline {
        partition: i32,
        offset: i64,
        max_offset: i64,
    },

    #[error("handler {aggregate_type}/{kind} failed `{error}`")]
    Handler {
        aggregate_type: String,
        kind: String,
        error: anyhow::Error,
    },

    #[error("store `{0}`")]
    Store(StoreError),

    #[cfg(feature = "pg")]
    #[error("sqlx `{0}`")]
    Sqlx(#[from] sqlx::Error),

    #[error("serde_json `{0}`")]
    SerdeJson(#[from] serde_json::Error),

    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl Error {
    /// Errors that must stop a consumer worker instead of being retried on the next tick.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::UnknownOrOutOfOrderTransaction { .. }
                | Error::CrossPartitionTransaction { .. }
                | Error::InvalidEventKind { .. }
                | Error::RestoreAheadOfOnline { .. }
                | Error::Store(StoreError::InvalidMessage(_))
        )
    }
}

impl From<StoreError> for Error {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::ConcurrencyConflict {
                aggregate_type,
                identifier,
                expected,
                actual,
            } => Error::ConcurrencyConflict {
                aggregate_type,
                identifier,
                expected,
                actual,
            },
            StoreError::NotFound {
                aggregate_type,
                identifier,
            } => Error::NotFound {
                aggregate_type,
                identifier,
            },
            other => Error::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
