//! Reservoir error types.

use std::fmt;

/// Errors from reservoir operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReservoirError {
    /// The reservoir was cancelled while waiting.
    #[error("reservoir cancelled")]
    Cancelled,

    /// The deadline passed before space (or an item) became available.
    #[error("reservoir operation timed out")]
    Timeout,

    /// The reservoir is full.
    #[error("reservoir is full")]
    Full,
}

/// Error returned from [`Reservoir::try_add`](super::Reservoir::try_add),
/// handing the rejected item back.
pub struct TryAddError<T> {
    /// The item that could not be added.
    pub value: T,
    /// Why it was rejected.
    pub error: ReservoirError,
}

impl<T> TryAddError<T> {
    /// Returns the rejected item.
    pub fn into_inner(self) -> T {
        self.value
    }

    /// Returns true if the reservoir was full.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.error == ReservoirError::Full
    }
}

impl<T> fmt::Debug for TryAddError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TryAddError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for TryAddError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl<T> std::error::Error for TryAddError<T> {}
