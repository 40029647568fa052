use thiserror::Error;

/// Errors from key-value store and pub/sub operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cannot be reached at all. Callers must not assume anything
    /// about lock state when they see this.
    #[error("connection error: {0}")]
    Connection(String),

    /// The store was reachable but a command failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// The dedicated subscriber connection dropped or errored. Recovered
    /// internally by the notification reader; never surfaced to lock callers.
    #[error("subscription error: {0}")]
    Subscription(String),
}
