use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
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

    #[error("invalid message `{0}`")]
    InvalidMessage(String),

    #[cfg(feature = "pg")]
    #[error("sqlx `{0}`")]
    Sqlx(#[from] sqlx::Error),

    #[error("serde_json `{0}`")]
    SerdeJson(#[from] serde_json::Error),

    #[error("std::num `{0}`")]
    TryFromInt(#[from] std::num::TryFromIntError),

    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
