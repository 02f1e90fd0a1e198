use std::time::Duration;

// copied from wlroots - docs say "maximum size can vary widely depending on the implementation"
// and there is no way to query the maximum size, you just get a non-descriptive `Length` error...
/// Default upper bound for a single property write
pub const INCR_CHUNK_SIZE: usize = 64 * 1024;

/// Default time a requestor gets to consume a chunk of an incremental transfer
pub const DEFAULT_INCR_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunables of the selection owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionConfig {
    /// Largest payload written in one property change.
    ///
    /// Payloads above this size are sent incrementally. The value is additionally capped
    /// by the maximum request length of the connection, and fixed for the lifetime of a transfer.
    pub max_chunk_size: usize,
    /// How long to wait for the requestor to delete the property before abandoning
    /// an incremental transfer
    pub incr_timeout: Duration,
    /// Answer requests for the `TIMESTAMP` target with the acquisition time of the selection
    /// instead of asking the [`SelectionHandler`](super::SelectionHandler)
    pub answer_timestamp_target: bool,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        SelectionConfig {
            max_chunk_size: INCR_CHUNK_SIZE,
            incr_timeout: DEFAULT_INCR_TIMEOUT,
            answer_timestamp_target: true,
        }
    }
}
