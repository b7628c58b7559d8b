/// Errors that can occur talking to the backing store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The Redis client reported an error.
    #[cfg(feature = "redis")]
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    /// A subscription's connection ended.
    #[error("subscription closed")]
    Closed,

    /// A key holds a different kind of value than the operation expects.
    #[error("wrong kind of value at key {0}")]
    WrongType(String),

    /// The store could not be reached. Worth retrying.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether retrying the same operation shortly might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            #[cfg(feature = "redis")]
            StoreError::Redis(e) => {
                e.is_io_error()
                    || e.is_timeout()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.kind() == redis::ErrorKind::TryAgain
            }
            StoreError::Unavailable(_) => true,
            StoreError::Closed | StoreError::WrongType(_) => false,
        }
    }
}
