use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::CacheEntryError;
use crate::interface::CacheEntry;

#[derive(Debug, Default)]
struct EntryState {
    body: Vec<u8>,
    metadata: Option<Vec<u8>>,
}

/// CacheEntry implementor that keeps the body and metadata in memory.
///
/// Writes past the current end leave a zero-filled gap, which is how positioned range writes
/// land in a sparse entry.
#[derive(Debug, Default)]
pub struct MemoryCacheEntry {
    state: Mutex<EntryState>,
    doomed: AtomicBool,
}

impl MemoryCacheEntry {
    pub fn new() -> Self {
        Self::default()
    }

    /// An entry already holding `body`, e.g. the surviving prefix of an earlier fetch.
    pub fn with_body(body: impl Into<Vec<u8>>) -> Self {
        Self {
            state: Mutex::new(EntryState {
                body: body.into(),
                metadata: None,
            }),
            doomed: AtomicBool::new(false),
        }
    }

    pub fn body(&self) -> Vec<u8> {
        self.state.lock().body.clone()
    }

    pub fn metadata(&self) -> Option<Vec<u8>> {
        self.state.lock().metadata.clone()
    }

    /// Further writes fail with [`CacheEntryError::Doomed`].
    pub fn doom(&self) {
        self.doomed.store(true, Ordering::Release);
    }

    pub fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::Acquire)
    }

    fn check_doomed(&self) -> Result<(), CacheEntryError> {
        if self.is_doomed() {
            return Err(CacheEntryError::Doomed);
        }
        Ok(())
    }
}

#[async_trait]
impl CacheEntry for MemoryCacheEntry {
    fn current_size(&self) -> u64 {
        self.state.lock().body.len() as u64
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<usize, CacheEntryError> {
        self.check_doomed()?;

        let offset = usize::try_from(offset).map_err(|e| CacheEntryError::Other(format!("offset out of range: {e}")))?;
        let end = offset
            .checked_add(data.len())
            .ok_or_else(|| CacheEntryError::Other(format!("write of {} bytes at offset {offset} overflows", data.len())))?;

        let mut state = self.state.lock();
        if state.body.len() < end {
            state.body.resize(end, 0);
        }
        state.body[offset..end].copy_from_slice(data);
        Ok(data.len())
    }

    async fn write_metadata(&self, blob: &[u8]) -> Result<usize, CacheEntryError> {
        self.check_doomed()?;
        self.state.lock().metadata = Some(blob.to_vec());
        Ok(blob.len())
    }
}
