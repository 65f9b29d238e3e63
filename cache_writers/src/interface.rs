use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;

use crate::error::{CacheEntryError, NetworkError, Result};
use crate::priority::RequestPriority;
use crate::response_info::ResponseInfo;

/// Handle identifying one consumer within a [`WriterGroup`](crate::WriterGroup).
///
/// Handles are allocated by the group and never reused, so a stale handle can only ever
/// refer to a departed consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Coarse progress of the underlying fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadState {
    #[default]
    Idle,
    Connecting,
    WaitingForResponse,
    ReadingResponse,
}

/// The single fetch shared by every member of a group.
///
/// At most one `read` is outstanding at any time; the group guarantees this.
#[async_trait]
pub trait NetworkSource: Send + Sync {
    /// Reads up to `buf.len()` bytes. `Ok(0)` signals end of stream.
    async fn read(&self, buf: &mut [u8]) -> std::result::Result<usize, NetworkError>;

    /// Fire-and-forget; may be called while a read is outstanding.
    fn set_priority(&self, priority: RequestPriority);

    /// Fresher response metadata than what consumers declared when joining, if the source has any.
    fn response_info(&self) -> Option<ResponseInfo> {
        None
    }

    fn load_state(&self) -> LoadState {
        LoadState::ReadingResponse
    }
}

/// The cache entry receiving the response body and metadata.
#[async_trait]
pub trait CacheEntry: Send + Sync {
    /// Current size of the body stream; the next append offset.
    fn current_size(&self) -> u64;

    /// Writes `data` at `offset`, returning the number of bytes written.
    async fn write(&self, offset: u64, data: &[u8]) -> std::result::Result<usize, CacheEntryError>;

    /// Replaces the entry's metadata blob, returning the number of bytes written.
    async fn write_metadata(&self, blob: &[u8]) -> std::result::Result<usize, CacheEntryError>;
}

/// A logical requester sharing the group's bytes.
#[cfg_attr(test, mockall::automock)]
pub trait Consumer: Send + Sync {
    /// Called exactly once, when the consumer leaves the group for any reason.
    fn notify_removed_from_group(&self);
}

/// What the owning cache learns when a group disbands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisbandReport {
    /// Whether the entry is worth keeping (complete, or truncated and resumable).
    pub kept: bool,
    /// Idle members handed back to the cache as readers of the now complete entry.
    pub handoff_readers: BTreeSet<ConsumerId>,
}

/// Callback interface of the cache that owns the group's entry.
#[cfg_attr(test, mockall::automock)]
pub trait OwningCache: Send + Sync {
    fn on_group_disbanded(&self, report: DisbandReport);
}

/// Collaborator handling a byte-range request's own view of the entry.
///
/// When the active reader carries one, the group hands it the freshly read bytes instead of
/// appending them, and skips generic fan-out of the result.
#[async_trait]
pub trait PartialRange: Send + Sync {
    /// Positioned write of `data` into `entry`; may fail with
    /// [`WritersError::RangeNotSatisfiable`](crate::WritersError::RangeNotSatisfiable).
    async fn cache_write(&self, entry: &dyn CacheEntry, data: &[u8]) -> Result<usize>;

    /// Whether the request is resuming an entry that was already stored as truncated.
    fn is_truncated(&self) -> bool;

    fn response_info(&self) -> Option<ResponseInfo> {
        None
    }
}
