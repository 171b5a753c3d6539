use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("database query failed: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("{entity} {id} not found")]
    Missing { entity: &'static str, id: i64 },

    #[error("invalid stored value: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn missing(entity: &'static str, id: i64) -> Self {
        StoreError::Missing { entity, id }
    }
}

impl<E: std::fmt::Display> From<bb8::RunError<E>> for StoreError {
    fn from(err: bb8::RunError<E>) -> Self {
        // bb8 only implements Display for `E: std::error::Error`; mirror its text.
        match err {
            bb8::RunError::User(err) => StoreError::Pool(err.to_string()),
            bb8::RunError::TimedOut => StoreError::Pool("Timed out in bb8".to_string()),
        }
    }
}

/// Broker failures. Ingest reconnects on these; publishing retries once.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("amqp connection closed: {0}")]
    Closed(String),
}
