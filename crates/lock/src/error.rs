use thiserror::Error;

use exclave_store::StoreError;

/// Errors from lock manager operations.
///
/// Failing to acquire before the timeout is not an error:
/// [`LockManager::acquire`](crate::LockManager::acquire) returns `false`.
#[derive(Debug, Error)]
pub enum LockError {
    /// The SET/DEL/PUBLISH path could not reach the backing store. The lock
    /// state is unknown at this point; the caller decides retry policy.
    /// Masking this would silently turn "lock unknown" into "lock not
    /// held", which is unsafe.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// Lock keys must be non-empty.
    #[error("lock key must not be empty")]
    EmptyKey,
}
