//! Error taxonomy.
//!
//! Only construction can surface an error to the caller; after startup the
//! façade is catch-log-continue everywhere. The kinds below exist so the
//! logging sites can tell a fatal condition (schema too old, failed bulk
//! load) from the routine ones (transient store errors, exhausted pool,
//! malformed notification payloads).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// The store of record reports a schema older than this build supports.
    /// Fatal at startup.
    #[error("store schema version {found} is below the required minimum {required}")]
    SchemaTooOld { found: i32, required: i32 },

    /// A connection borrow waited past its deadline. The operation that
    /// wanted the connection is dropped and retried on its next tick.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// Transient store failure. Logged per commit; never retried — the
    /// external notification stream re-establishes convergence.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Key-value cache failure (listener transport, status sink, side
    /// indexes). Logged and skipped; the cache views are rebuilt on the next
    /// tick.
    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),

    /// A notification payload that could not be decoded. Dropped with a log
    /// line; the message is still acknowledged.
    #[error("malformed notification payload: {0}")]
    MalformedPayload(String),

    /// Status-sink backend failure. The current batch is dropped.
    #[error("status sink error: {0}")]
    Sink(String),

    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl DbError {
    /// Collapse sqlx pool-timeout errors into the pool-exhaustion kind so
    /// call sites can branch without inspecting sqlx internals.
    pub fn from_store(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut => Self::PoolExhausted,
            other => Self::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_maps_to_pool_exhausted() {
        let e = DbError::from_store(sqlx::Error::PoolTimedOut);
        assert!(matches!(e, DbError::PoolExhausted));
    }

    #[test]
    fn test_schema_error_message_names_versions() {
        let e = DbError::SchemaTooOld {
            found: 12,
            required: 38,
        };
        let msg = e.to_string();
        assert!(msg.contains("12"));
        assert!(msg.contains("38"));
    }
}
