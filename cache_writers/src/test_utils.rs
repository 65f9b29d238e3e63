use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, HeaderValue, StatusCode};
use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;

use crate::error::{CacheEntryError, NetworkError, Result, WritersError};
use crate::interface::{CacheEntry, Consumer, DisbandReport, NetworkSource, OwningCache, PartialRange};
use crate::memory_entry::MemoryCacheEntry;
use crate::priority::RequestPriority;
use crate::response_info::ResponseInfo;

/// Network source whose reads complete only when the test feeds it a result.
pub(crate) struct ScriptedNetworkSource {
    results: tokio::sync::Mutex<UnboundedReceiver<std::result::Result<Vec<u8>, NetworkError>>>,
    feeder: UnboundedSender<std::result::Result<Vec<u8>, NetworkError>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    reads: AtomicUsize,
    priorities: Mutex<Vec<RequestPriority>>,
    response_info: Mutex<Option<ResponseInfo>>,
}

impl ScriptedNetworkSource {
    pub(crate) fn new() -> Arc<Self> {
        let (feeder, results) = unbounded_channel();
        Arc::new(Self {
            results: tokio::sync::Mutex::new(results),
            feeder,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            priorities: Mutex::new(Vec::new()),
            response_info: Mutex::new(None),
        })
    }

    pub(crate) fn push_data(&self, data: &[u8]) {
        let _ = self.feeder.send(Ok(data.to_vec()));
    }

    pub(crate) fn push_eof(&self) {
        let _ = self.feeder.send(Ok(Vec::new()));
    }

    pub(crate) fn push_error(&self, error: NetworkError) {
        let _ = self.feeder.send(Err(error));
    }

    pub(crate) fn set_response_info(&self, info: ResponseInfo) {
        *self.response_info.lock() = Some(info);
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub(crate) fn last_priority(&self) -> Option<RequestPriority> {
        self.priorities.lock().last().copied()
    }
}

#[async_trait]
impl NetworkSource for ScriptedNetworkSource {
    async fn read(&self, buf: &mut [u8]) -> std::result::Result<usize, NetworkError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.reads.fetch_add(1, Ordering::SeqCst);

        let next = self.results.lock().await.recv().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match next {
            Some(Ok(data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            },
            Some(Err(e)) => Err(e),
            None => Err(NetworkError::Aborted),
        }
    }

    fn set_priority(&self, priority: RequestPriority) {
        self.priorities.lock().push(priority);
    }

    fn response_info(&self) -> Option<ResponseInfo> {
        self.response_info.lock().clone()
    }
}

/// Memory entry with switchable write failures and a log of data writes.
#[derive(Default)]
pub(crate) struct FaultyEntry {
    pub(crate) inner: MemoryCacheEntry,
    fail_data: AtomicBool,
    short_data: AtomicBool,
    fail_metadata: AtomicBool,
    writes: Mutex<Vec<(u64, usize)>>,
    metadata_writes: AtomicUsize,
    hold_metadata: AtomicBool,
    metadata_release: Notify,
}

impl FaultyEntry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn with_body(body: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryCacheEntry::with_body(body.to_vec()),
            ..Default::default()
        })
    }

    pub(crate) fn fail_data_writes(&self, fail: bool) {
        self.fail_data.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn short_data_writes(&self, short: bool) {
        self.short_data.store(short, Ordering::SeqCst);
    }

    pub(crate) fn fail_metadata_writes(&self, fail: bool) {
        self.fail_metadata.store(fail, Ordering::SeqCst);
    }

    /// Metadata writes park until [`release_metadata_writes`](Self::release_metadata_writes).
    pub(crate) fn hold_metadata_writes(&self) {
        self.hold_metadata.store(true, Ordering::SeqCst);
    }

    pub(crate) fn release_metadata_writes(&self) {
        self.hold_metadata.store(false, Ordering::SeqCst);
        self.metadata_release.notify_one();
    }

    pub(crate) fn writes(&self) -> Vec<(u64, usize)> {
        self.writes.lock().clone()
    }

    pub(crate) fn metadata_write_count(&self) -> usize {
        self.metadata_writes.load(Ordering::SeqCst)
    }

    pub(crate) fn stored_metadata(&self) -> Option<ResponseInfo> {
        self.inner.metadata().and_then(|blob| ResponseInfo::restore(&blob).ok())
    }
}

#[async_trait]
impl CacheEntry for FaultyEntry {
    fn current_size(&self) -> u64 {
        self.inner.current_size()
    }

    async fn write(&self, offset: u64, data: &[u8]) -> std::result::Result<usize, CacheEntryError> {
        self.writes.lock().push((offset, data.len()));
        if self.fail_data.load(Ordering::SeqCst) {
            return Err(CacheEntryError::Other("disk full".to_string()));
        }
        if self.short_data.load(Ordering::SeqCst) && data.len() > 1 {
            return self.inner.write(offset, &data[..data.len() - 1]).await;
        }
        self.inner.write(offset, data).await
    }

    async fn write_metadata(&self, blob: &[u8]) -> std::result::Result<usize, CacheEntryError> {
        self.metadata_writes.fetch_add(1, Ordering::SeqCst);
        if self.hold_metadata.load(Ordering::SeqCst) {
            self.metadata_release.notified().await;
        }
        if self.fail_metadata.load(Ordering::SeqCst) {
            return Err(CacheEntryError::Other("metadata stream closed".to_string()));
        }
        self.inner.write_metadata(blob).await
    }
}

#[derive(Default)]
pub(crate) struct RecordingConsumer {
    removed: AtomicUsize,
}

impl RecordingConsumer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn removed_count(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }
}

impl Consumer for RecordingConsumer {
    fn notify_removed_from_group(&self) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct RecordingOwner {
    reports: Mutex<Vec<DisbandReport>>,
}

impl RecordingOwner {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn reports(&self) -> Vec<DisbandReport> {
        self.reports.lock().clone()
    }
}

impl OwningCache for RecordingOwner {
    fn on_group_disbanded(&self, report: DisbandReport) {
        self.reports.lock().push(report);
    }
}

/// Range collaborator writing each chunk at a fixed offset it advances itself.
pub(crate) struct ScriptedRange {
    next_offset: Mutex<u64>,
    truncated: bool,
    unsatisfiable: AtomicBool,
    response_info: Option<ResponseInfo>,
}

impl ScriptedRange {
    pub(crate) fn new(start: u64, truncated: bool, response_info: Option<ResponseInfo>) -> Arc<Self> {
        Arc::new(Self {
            next_offset: Mutex::new(start),
            truncated,
            unsatisfiable: AtomicBool::new(false),
            response_info,
        })
    }

    pub(crate) fn reject_next_write(&self) {
        self.unsatisfiable.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PartialRange for ScriptedRange {
    async fn cache_write(&self, entry: &dyn CacheEntry, data: &[u8]) -> Result<usize> {
        if self.unsatisfiable.swap(false, Ordering::SeqCst) {
            return Err(WritersError::RangeNotSatisfiable);
        }
        let offset = *self.next_offset.lock();
        let written = entry.write(offset, data).await.map_err(WritersError::CacheWrite)?;
        *self.next_offset.lock() += written as u64;
        Ok(written)
    }

    fn is_truncated(&self) -> bool {
        self.truncated
    }

    fn response_info(&self) -> Option<ResponseInfo> {
        self.response_info.clone()
    }
}

/// 200 response with a known length and a strong entity tag.
pub(crate) fn resumable_info(content_length: u64) -> ResponseInfo {
    let mut headers = HeaderMap::new();
    headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(content_length));
    headers.insert(http::header::ETAG, HeaderValue::from_static("\"v1\""));
    headers.insert(http::header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    ResponseInfo::new(StatusCode::OK, headers)
}

/// 200 response with a known length but no validator.
pub(crate) fn unvalidated_info(content_length: u64) -> ResponseInfo {
    let mut headers = HeaderMap::new();
    headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(content_length));
    ResponseInfo::new(StatusCode::OK, headers)
}

/// Polls `condition` until it holds, yielding to spawned tasks in between.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
