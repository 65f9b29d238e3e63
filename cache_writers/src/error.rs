use std::sync::Arc;

use thiserror::Error;

use crate::interface::ConsumerId;

/// Failures reported by a [`NetworkSource`](crate::NetworkSource) read.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Connection reset by peer")]
    ConnectionReset,

    #[error("Request aborted")]
    Aborted,

    #[error("Response body ended early: received {received} of {expected} bytes")]
    IncompleteBody { expected: u64, received: u64 },

    #[error("Network Error: {0}")]
    Other(String),
}

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        NetworkError::Io(Arc::new(err))
    }
}

/// Failures reported by a [`CacheEntry`](crate::CacheEntry) write.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum CacheEntryError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Entry has been doomed")]
    Doomed,

    #[error("Short write: expected {expected} bytes, wrote {written}")]
    ShortWrite { expected: usize, written: usize },

    #[error("Cache Entry Error: {0}")]
    Other(String),
}

impl From<std::io::Error> for CacheEntryError {
    fn from(err: std::io::Error) -> Self {
        CacheEntryError::Io(Arc::new(err))
    }
}

#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum WritersError {
    #[error("Network Error: {0}")]
    Network(#[from] NetworkError),

    #[error("Cache Write Error: {0}")]
    CacheWrite(CacheEntryError),

    #[error("Cache Metadata Error: {0}")]
    CacheMetadata(CacheEntryError),

    #[error("Writer group cannot admit more consumers")]
    GroupClosed,

    #[error("Requested range not satisfiable")]
    RangeNotSatisfiable,

    #[error("Consumer {0} is not a member of this writer group")]
    UnknownConsumer(ConsumerId),

    #[error("Consumer {0} already has a read outstanding")]
    ReadAlreadyPending(ConsumerId),

    #[error("No network source attached to the writer group")]
    NoNetworkSource,

    #[error("A read cycle is in progress")]
    CycleInProgress,

    #[error("Consumer {0} was removed before its read completed")]
    RemovedFromGroup(ConsumerId),

    #[error("Invalid Arguments: {0}")]
    InvalidArguments(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Internal Error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, WritersError>;

impl PartialEq for WritersError {
    fn eq(&self, other: &WritersError) -> bool {
        match (self, other) {
            (WritersError::UnknownConsumer(a), WritersError::UnknownConsumer(b)) => a == b,
            (WritersError::ReadAlreadyPending(a), WritersError::ReadAlreadyPending(b)) => a == b,
            (WritersError::RemovedFromGroup(a), WritersError::RemovedFromGroup(b)) => a == b,
            (e1, e2) => std::mem::discriminant(e1) == std::mem::discriminant(e2),
        }
    }
}

impl From<bincode::Error> for WritersError {
    fn from(err: bincode::Error) -> Self {
        WritersError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_is_by_kind() {
        let a = WritersError::CacheWrite(CacheEntryError::Doomed);
        let b = WritersError::CacheWrite(CacheEntryError::Other("disk full".into()));
        assert_eq!(a, b);
        assert_ne!(a, WritersError::CacheMetadata(CacheEntryError::Doomed));

        assert_eq!(WritersError::UnknownConsumer(ConsumerId(3)), WritersError::UnknownConsumer(ConsumerId(3)));
        assert_ne!(WritersError::UnknownConsumer(ConsumerId(3)), WritersError::UnknownConsumer(ConsumerId(4)));
    }

    #[test]
    fn test_network_error_display() {
        let err: WritersError = NetworkError::IncompleteBody {
            expected: 1000,
            received: 400,
        }
        .into();
        assert_eq!(err.to_string(), "Network Error: Response body ended early: received 400 of 1000 bytes");
    }
}
