//! Room-layer configuration.

/// Limits for event log and roster operations.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// How many fresh ids `append_new` tries after an id conflict.
    pub max_conflict_retries: u32,

    /// How many times a compare-and-swap write is attempted before the
    /// caller gets [`RoomError::Transient`](crate::RoomError::Transient).
    pub max_transaction_retries: u32,

    /// Server-side cap on the number of entries in one range page.
    pub max_page_size: usize,

    /// Attempts for reads that hit a transient store error.
    pub store_retries: u32,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
            max_transaction_retries: 5,
            max_page_size: 100,
            store_retries: 3,
        }
    }
}
