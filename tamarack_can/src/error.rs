//! Transport error types

use core::fmt;

use fallible_collections::TryReserveError;

pub use tamarack_core::OutOfMemoryError;

/// Errors that can occur when enqueueing an outgoing transfer
#[derive(Debug, PartialEq, Eq)]
pub enum PushError {
    /// Memory allocation failed or the frame queue is out of capacity
    Memory(OutOfMemoryError),
    /// The transfer is anonymous but does not fit into one frame
    AnonymousMultiFrame,
}

impl From<OutOfMemoryError> for PushError {
    fn from(inner: OutOfMemoryError) -> Self {
        PushError::Memory(inner)
    }
}

impl From<TryReserveError> for PushError {
    fn from(inner: TryReserveError) -> Self {
        PushError::Memory(inner.into())
    }
}

impl fmt::Display for PushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Memory(_) => f.write_str("out of memory"),
            PushError::AnonymousMultiFrame => {
                f.write_str("anonymous transfers must fit into one frame")
            }
        }
    }
}
