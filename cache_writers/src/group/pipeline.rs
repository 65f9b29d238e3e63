use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, error, info, warn};

use super::state::{Departure, Effects, PipelineState};
use super::truncation::{TruncateOutcome, TruncatePlan};
use super::{GroupMode, WriterGroup};
use crate::error::{CacheEntryError, Result, WritersError};
use crate::interface::{ConsumerId, NetworkSource};

impl WriterGroup {
    /// One full cycle: network read, cache write, result distribution.
    ///
    /// Runs as its own task so that consumers leaving or dropping their read futures never
    /// abort it half way.
    pub(crate) async fn run_cycle(self, source: Arc<dyn NetworkSource>, read_len: usize) {
        let mut buf = BytesMut::zeroed(read_len);

        match source.read(&mut buf[..]).await {
            Ok(bytes_read) => {
                buf.truncate(bytes_read.min(read_len));
                self.cache_write(buf.freeze()).await;
            },
            Err(e) => {
                warn!(error = %e, "network read failed");
                self.on_network_read_failure(WritersError::Network(e)).await;
            },
        }
    }

    async fn cache_write(&self, data: Bytes) {
        let (skip, offset, range_request) = {
            let mut state = self.inner.state.lock();
            state.pipeline = PipelineState::CacheWrite;
            let skip = data.is_empty() || state.mode == GroupMode::ReadOnly;
            (skip, self.inner.entry.current_size(), state.active_range_request())
        };

        let result = if skip {
            Ok(data.len())
        } else if let Some(range) = &range_request {
            range.cache_write(self.inner.entry.as_ref(), &data).await
        } else {
            self.inner.entry.write(offset, &data).await.map_err(WritersError::CacheWrite)
        };

        match result {
            Ok(written) if written == data.len() => self.on_data_received(data).await,
            Ok(written) => {
                let e = WritersError::CacheWrite(CacheEntryError::ShortWrite {
                    expected: data.len(),
                    written,
                });
                self.on_cache_write_failure(data, e).await
            },
            Err(e @ WritersError::CacheWrite(_)) => self.on_cache_write_failure(data, e).await,
            Err(e) => self.finish_cycle_with_error(e).await,
        }
    }

    /// Fails everyone waiting on the network, then disposes of the entry.
    async fn on_network_read_failure(&self, error: WritersError) {
        let mut effects = Effects::default();
        let should_truncate = {
            let mut state = self.inner.state.lock();
            state.fail_waiting_and_idle(&error, &mut effects);

            if let Some(active) = state.active_reader.take() {
                state.remove_member(active.consumer, &mut effects);
                state.departed.insert(active.consumer, Departure::Failed(error.clone()));
                effects.deliver(active.sender, Err(error.clone()));
            }
            debug_assert!(state.members.is_empty());
            state.take_disband_decision()
        };

        self.disband_empty_group(should_truncate, effects).await;
    }

    /// The active reader keeps its bytes and queued reads fail. Idle members stay and keep
    /// reading from the network, but the group never writes to the entry again.
    async fn on_cache_write_failure(&self, data: Bytes, error: WritersError) {
        error!(error = %error, bytes = data.len(), "failed to write response data to cache; continuing network-only");

        let mut effects = Effects::default();
        let disband_empty = {
            let mut state = self.inner.state.lock();
            state.fail_waiting_reads(&error, &mut effects);

            state.mode = GroupMode::ReadOnly;
            state.keep_entry_on_incomplete = false;
            state.report_disband(false, BTreeSet::new(), &mut effects);

            if let Some(active) = state.active_reader.take() {
                effects.deliver(active.sender, Ok(data));
            }

            if state.members.is_empty() {
                Some(state.take_disband_decision())
            } else {
                state.pipeline = PipelineState::Idle;
                None
            }
        };

        match disband_empty {
            Some(should_truncate) => self.disband_empty_group(should_truncate, effects).await,
            None => effects.apply(self.inner.owner.as_ref()),
        }
    }

    async fn on_data_received(&self, data: Bytes) {
        let bytes_read = data.len();
        let mut effects = Effects::default();

        let should_truncate = {
            let mut state = self.inner.state.lock();

            if state.members.is_empty() {
                // Everyone left while the cycle was in flight.
                let should_truncate = state.take_disband_decision();
                if bytes_read == 0 {
                    let entry_size = self.inner.entry.current_size();
                    if state.body_complete(entry_size) {
                        info!(entry_size, "response complete after all consumers left");
                        state.report_disband(true, BTreeSet::new(), &mut effects);
                        state.reset_for_empty();
                        drop(state);
                        effects.apply(self.inner.owner.as_ref());
                        return;
                    }
                    warn!(entry_size, "response ended before its declared length");
                }
                Some(should_truncate)
            } else if state.active_range_request().is_some() {
                // The range collaborator interprets its own result.
                if let Some(active) = state.active_reader.take() {
                    effects.deliver(active.sender, Ok(data));
                }
                state.pipeline = PipelineState::Idle;
                None
            } else if bytes_read == 0 {
                let mut finished: Vec<ConsumerId> = Vec::new();
                if let Some(active) = state.active_reader.take() {
                    finished.push(active.consumer);
                    effects.deliver(active.sender, Ok(Bytes::new()));
                }
                while let Some(pending) = state.pending_reads.pop_front() {
                    finished.push(pending.consumer);
                    effects.deliver(pending.sender, Ok(Bytes::new()));
                }
                for id in &finished {
                    state.remove_member(*id, &mut effects);
                    state.departed.insert(*id, Departure::Completed);
                }

                let handoff_readers: BTreeSet<ConsumerId> = state.members.keys().copied().collect();
                for id in &handoff_readers {
                    state.remove_member(*id, &mut effects);
                    state.departed.insert(*id, Departure::Completed);
                }

                info!(
                    finished = finished.len(),
                    handoff = handoff_readers.len(),
                    "response complete; disbanding writer group"
                );
                state.report_disband(true, handoff_readers, &mut effects);
                state.reset_for_empty();
                None
            } else {
                if let Some(active) = state.active_reader.take() {
                    effects.deliver(active.sender, Ok(data.clone()));
                }
                let queued = state.pending_reads.len();
                while let Some(pending) = state.pending_reads.pop_front() {
                    let len = pending.requested_len.min(bytes_read);
                    effects.deliver(pending.sender, Ok(data.slice(..len)));
                }
                debug!(bytes_read, queued, "read cycle complete");
                state.pipeline = PipelineState::Idle;
                None
            }
        };

        match should_truncate {
            Some(should_truncate) => self.disband_empty_group(should_truncate, effects).await,
            None => effects.apply(self.inner.owner.as_ref()),
        }
    }

    /// Ends the cycle with an error the group does not interpret (e.g. from a range collaborator).
    async fn finish_cycle_with_error(&self, error: WritersError) {
        debug!(error = %error, "read cycle ended with collaborator error");
        let mut effects = Effects::default();
        let disband_empty = {
            let mut state = self.inner.state.lock();
            if let Some(active) = state.active_reader.take() {
                effects.deliver(active.sender, Err(error));
            }
            // Queued reads stay queued; the next read call drives a fresh cycle for them.
            if state.members.is_empty() {
                Some(state.take_disband_decision())
            } else {
                state.pipeline = PipelineState::Idle;
                None
            }
        };

        match disband_empty {
            Some(should_truncate) => self.disband_empty_group(should_truncate, effects).await,
            None => effects.apply(self.inner.owner.as_ref()),
        }
    }

    /// Final step once the last member is gone: optional truncation, then the owner callback,
    /// then a reset for the next generation. The group stays closed to newcomers throughout.
    pub(crate) async fn disband_empty_group(&self, should_truncate: bool, mut effects: Effects) {
        let plan = {
            let mut state = self.inner.state.lock();
            debug_assert!(matches!(state.pipeline, PipelineState::Disbanding));
            if should_truncate {
                state.plan_truncation(self.inner.entry.current_size(), &self.inner.config)
            } else {
                state.keep_entry_on_incomplete = false;
                TruncatePlan::Done(TruncateOutcome::NotKept)
            }
        };

        match plan {
            TruncatePlan::Done(outcome) => self.inner.state.lock().close_generation(outcome, &mut effects),
            TruncatePlan::WriteMetadata(blob) => {
                let result = self.inner.entry.write_metadata(&blob).await;
                let mut state = self.inner.state.lock();
                let outcome = state.finish_truncation(blob.len(), result);
                state.close_generation(outcome, &mut effects);
            },
        }
        effects.apply(self.inner.owner.as_ref());
    }

    /// Persists the truncated metadata from a task of its own, so the write completes even if
    /// the caller stops waiting.
    pub(crate) async fn write_truncated_metadata(&self, blob: Vec<u8>) -> Result<TruncateOutcome> {
        let group = self.clone();
        tokio::spawn(async move { group.write_metadata_now(blob).await })
            .await
            .map_err(|e| WritersError::Internal(format!("truncation task failed: {e}")))
    }

    async fn write_metadata_now(&self, blob: Vec<u8>) -> TruncateOutcome {
        let result = self.inner.entry.write_metadata(&blob).await;
        self.inner.state.lock().finish_truncation(blob.len(), result)
    }
}

