//! The shared cache-write coordinator.
//!
//! A [`WriterGroup`] lets several consumers of the same resource share one network fetch and
//! one entry write stream. Whichever member calls [`WriterGroup::read`] while the group is
//! idle becomes the active reader and starts a cycle: one network read, at most one cache
//! write, then fan-out of the bytes to the active reader and every read queued meanwhile.

mod pipeline;
mod state;
mod truncation;


use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info};

use self::state::{ActiveRead, Departure, Effects, GroupState, MemberContext, PendingRead, PipelineState};
pub use self::state::GroupMode;
use self::truncation::TruncatePlan;
pub use self::truncation::TruncateOutcome;
use crate::config::WritersConfig;
use crate::error::{Result, WritersError};
use crate::interface::{CacheEntry, Consumer, ConsumerId, LoadState, NetworkSource, OwningCache, PartialRange};
use crate::priority::RequestPriority;
use crate::response_info::ResponseInfo;

/// How a consumer joins a group.
#[derive(Clone, Default)]
pub struct MemberOptions {
    /// The member must be the only one, now and for the rest of the group's generation.
    pub exclusive: bool,
    /// The member only reads from the network; implies `exclusive`.
    pub network_only: bool,
    pub priority: RequestPriority,
    /// The member's view of the response; becomes the group's truncation metadata.
    pub response_info: ResponseInfo,
    /// Set for byte-range requests; requires `exclusive`.
    pub partial: Option<Arc<dyn PartialRange>>,
}

impl MemberOptions {
    pub fn new(priority: RequestPriority, response_info: ResponseInfo) -> Self {
        Self {
            priority,
            response_info,
            ..Default::default()
        }
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn network_only(mut self) -> Self {
        self.exclusive = true;
        self.network_only = true;
        self
    }

    pub fn with_partial(mut self, partial: Arc<dyn PartialRange>) -> Self {
        self.exclusive = true;
        self.partial = Some(partial);
        self
    }
}

pub(crate) struct GroupInner {
    pub(crate) entry: Arc<dyn CacheEntry>,
    pub(crate) owner: Arc<dyn OwningCache>,
    pub(crate) config: WritersConfig,
    pub(crate) state: Mutex<GroupState>,
}

/// Handle to a writer group; clones share the same group.
#[derive(Clone)]
pub struct WriterGroup {
    pub(crate) inner: Arc<GroupInner>,
}

impl WriterGroup {
    /// Creates an empty group writing to `entry`, reporting to `owner`, configured from the environment.
    pub fn new(entry: Arc<dyn CacheEntry>, owner: Arc<dyn OwningCache>) -> Self {
        Self::with_config(entry, owner, WritersConfig::from_env())
    }

    pub fn with_config(entry: Arc<dyn CacheEntry>, owner: Arc<dyn OwningCache>, config: WritersConfig) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                entry,
                owner,
                config,
                state: Mutex::new(GroupState::new()),
            }),
        }
    }

    /// Adds a consumer, failing with [`WritersError::GroupClosed`] when the group cannot admit it.
    pub fn add_consumer(&self, consumer: Arc<dyn Consumer>, options: MemberOptions) -> Result<ConsumerId> {
        if options.partial.is_some() && !options.exclusive {
            return Err(WritersError::InvalidArguments("range requests must join exclusively".to_string()));
        }
        if options.network_only && !options.exclusive {
            return Err(WritersError::InvalidArguments("network-only members must join exclusively".to_string()));
        }

        let mut state = self.inner.state.lock();
        if !state.can_admit_more() || (options.exclusive && !state.members.is_empty()) {
            debug!(members = state.members.len(), mode = ?state.mode, "writer group rejected consumer");
            return Err(WritersError::GroupClosed);
        }

        let id = state.allocate_id();

        if options.network_only {
            state.mode = GroupMode::ReadOnly;
        } else if options.exclusive {
            state.mode = GroupMode::Exclusive;
        }
        if options.exclusive {
            state.range_request = options.partial.clone();
        }

        state.keep_entry_on_incomplete = state.mode != GroupMode::ReadOnly
            && self.inner.config.allow_truncated_entries
            && options.response_info.allows_resume(self.inner.config.strong_validator_min_age);
        state.last_response_info = Some(options.response_info);
        state.deferred_disband = None;

        state.members.insert(
            id,
            MemberContext {
                consumer,
                priority: options.priority,
                partial: options.partial,
            },
        );

        state.aggregate_priority = state.highest_member_priority();
        state.propagate_priority();

        debug!(consumer = %id, members = state.members.len(), mode = ?state.mode, "consumer joined writer group");
        Ok(id)
    }

    /// Attaches the fetch handle the group reads from.
    pub fn set_network_source(&self, consumer: ConsumerId, source: Arc<dyn NetworkSource>) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.member(consumer)?;
        source.set_priority(state.aggregate_priority);
        state.network_source = Some(source);
        Ok(())
    }

    /// Drops the network source of an exclusive range request between sub-range fetches.
    pub fn reset_network_source(&self, consumer: ConsumerId) -> Result<()> {
        let mut state = self.inner.state.lock();
        let member = state.member(consumer)?;
        if state.mode != GroupMode::Exclusive || state.members.len() != 1 || member.partial.is_none() {
            return Err(WritersError::InvalidArguments(
                "only the sole member of an exclusive range request may reset the network source".to_string(),
            ));
        }
        if !state.is_idle() {
            return Err(WritersError::CycleInProgress);
        }
        state.network_source = None;
        Ok(())
    }

    pub fn set_priority(&self, consumer: ConsumerId, priority: RequestPriority) -> Result<()> {
        let mut state = self.inner.state.lock();
        let member = state
            .members
            .get_mut(&consumer)
            .ok_or(WritersError::UnknownConsumer(consumer))?;
        member.priority = priority;
        state.update_priority();
        Ok(())
    }

    /// Removes a consumer. Its outstanding read, if any, is dropped without a result.
    ///
    /// When the last member leaves, the entry is either truncated (if `should_truncate_if_last`
    /// and the body is incomplete) or reported as not kept. If a cycle is still in flight that
    /// decision waits for the cycle to finish.
    pub async fn remove_consumer(&self, consumer: ConsumerId, should_truncate_if_last: bool) -> Result<()> {
        let mut effects = Effects::default();
        let disband_now = {
            let mut state = self.inner.state.lock();

            if state.departed.contains_key(&consumer) {
                return Ok(());
            }
            if !state.remove_member(consumer, &mut effects) {
                return Err(WritersError::UnknownConsumer(consumer));
            }

            if state.is_active(consumer) {
                // The cycle keeps running for everyone else; only the result is discarded.
                state.active_reader = None;
            } else {
                state.pending_reads.retain(|p| p.consumer != consumer);
            }

            debug!(consumer = %consumer, members = state.members.len(), "consumer left writer group");

            if !state.members.is_empty() {
                state.update_priority();
                false
            } else if !state.is_idle() {
                state.deferred_disband = Some(should_truncate_if_last);
                false
            } else {
                state.begin_disband();
                true
            }
        };

        if disband_now {
            let group = self.clone();
            tokio::spawn(async move { group.disband_empty_group(should_truncate_if_last, effects).await })
                .await
                .map_err(|e| WritersError::Internal(format!("disband task failed: {e}")))?;
        } else {
            effects.apply(self.inner.owner.as_ref());
        }
        Ok(())
    }

    /// Reads the next chunk of the shared body into `buf`, returning the number of bytes.
    ///
    /// If no cycle is running the caller becomes the active reader and a single network read
    /// of up to `buf.len()` bytes is issued; otherwise the call waits for the running cycle
    /// and receives `min(buf.len(), bytes_read)` bytes of its result. `Ok(0)` is end of stream.
    pub async fn read(&self, consumer: ConsumerId, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Err(WritersError::InvalidArguments("read buffer must not be empty".to_string()));
        }

        let (sender, receiver) = oneshot::channel();
        let start_cycle = {
            let mut state = self.inner.state.lock();

            match state.departed.get(&consumer) {
                Some(Departure::Failed(e)) => return Err(e.clone()),
                Some(Departure::Completed) => return Ok(0),
                None => {},
            }
            state.member(consumer)?;

            if state.is_active(consumer) || state.pending_reads.iter().any(|p| p.consumer == consumer) {
                return Err(WritersError::ReadAlreadyPending(consumer));
            }

            if state.cycle_in_flight() {
                state.pending_reads.push_back(PendingRead {
                    consumer,
                    requested_len: buf.len(),
                    sender,
                });
                debug!(consumer = %consumer, queued = state.pending_reads.len(), "read queued behind active cycle");
                None
            } else if !state.is_idle() {
                // No cycle will answer a read queued behind a truncation write.
                return Err(WritersError::CycleInProgress);
            } else {
                let source = state.network_source.clone().ok_or(WritersError::NoNetworkSource)?;
                state.active_reader = Some(ActiveRead { consumer, sender });
                state.pipeline = PipelineState::NetworkRead;
                debug!(consumer = %consumer, len = buf.len(), "starting read cycle");
                Some(source)
            }
        };

        if let Some(source) = start_cycle {
            let group = self.clone();
            let read_len = buf.len();
            tokio::spawn(async move { group.run_cycle(source, read_len).await });
        }

        let data = receiver.await.map_err(|_| WritersError::RemovedFromGroup(consumer))??;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    /// Disposes of an incomplete entry on behalf of the sole remaining member.
    ///
    /// Repeating the call within a generation returns the first outcome without side effects.
    pub async fn truncate_entry(&self) -> Result<TruncateOutcome> {
        let plan = {
            let mut state = self.inner.state.lock();
            if !state.is_idle() {
                return Err(WritersError::CycleInProgress);
            }
            if state.members.len() > 1 {
                return Ok(TruncateOutcome::OtherMembersRemain);
            }
            state.plan_truncation(self.inner.entry.current_size(), &self.inner.config)
        };

        match plan {
            TruncatePlan::Done(outcome) => Ok(outcome),
            TruncatePlan::WriteMetadata(blob) => self.write_truncated_metadata(blob).await,
        }
    }

    /// Whether the entry's partial body could be completed later by a range request.
    pub fn can_resume(&self) -> bool {
        let state = self.inner.state.lock();
        state
            .response_info_for_truncation()
            .is_some_and(|info| truncation::can_resume(&info, self.inner.entry.current_size(), &self.inner.config))
    }

    /// Stops writing to the cache if `consumer` is the only member. Returns whether it did.
    pub fn stop_caching(&self, consumer: ConsumerId) -> Result<bool> {
        let mut effects = Effects::default();
        {
            let mut state = self.inner.state.lock();
            state.member(consumer)?;
            if state.members.len() != 1 {
                return Ok(false);
            }
            info!(consumer = %consumer, "stopped caching; continuing network-only");
            state.mode = GroupMode::ReadOnly;
            state.keep_entry_on_incomplete = false;
            state.report_disband(false, BTreeSet::new(), &mut effects);
        }
        effects.apply(self.inner.owner.as_ref());
        Ok(true)
    }

    /// Demotes a single-member group to network-only, reporting `success` as whether the
    /// entry is kept. No-op while other members remain.
    pub fn set_network_read_only(&self, consumer: ConsumerId, success: bool) -> Result<()> {
        let mut effects = Effects::default();
        {
            let mut state = self.inner.state.lock();
            state.member(consumer)?;
            if state.members.len() > 1 {
                return Ok(());
            }
            state.mode = GroupMode::ReadOnly;
            if !success {
                state.keep_entry_on_incomplete = false;
            }
            state.report_disband(success, BTreeSet::new(), &mut effects);
        }
        effects.apply(self.inner.owner.as_ref());
        Ok(())
    }

    /// Removes every member at once, e.g. to convert them into readers of a finished entry.
    /// Only valid while no read is active or queued.
    pub fn remove_all_idle_members(&self) -> Result<BTreeSet<ConsumerId>> {
        let mut effects = Effects::default();
        let ids = {
            let mut state = self.inner.state.lock();
            if !state.contains_only_idle_members() || !state.is_idle() {
                return Err(WritersError::CycleInProgress);
            }
            let ids: BTreeSet<ConsumerId> = state.members.keys().copied().collect();
            for id in &ids {
                state.remove_member(*id, &mut effects);
                state.departed.insert(*id, Departure::Completed);
            }
            state.reset_for_empty();
            ids
        };
        effects.apply(self.inner.owner.as_ref());
        Ok(ids)
    }

    pub fn can_admit_more(&self) -> bool {
        self.inner.state.lock().can_admit_more()
    }

    pub fn contains_only_idle_members(&self) -> bool {
        self.inner.state.lock().contains_only_idle_members()
    }

    pub fn member_count(&self) -> usize {
        self.inner.state.lock().members.len()
    }

    pub fn has_member(&self, consumer: ConsumerId) -> bool {
        self.inner.state.lock().members.contains_key(&consumer)
    }

    pub fn aggregate_priority(&self) -> RequestPriority {
        self.inner.state.lock().aggregate_priority
    }

    pub fn mode(&self) -> GroupMode {
        self.inner.state.lock().mode
    }

    pub fn is_network_read_only(&self) -> bool {
        self.mode() == GroupMode::ReadOnly
    }

    pub fn keep_entry_on_incomplete(&self) -> bool {
        self.inner.state.lock().keep_entry_on_incomplete
    }

    pub fn active_reader(&self) -> Option<ConsumerId> {
        self.inner.state.lock().active_reader.as_ref().map(|a| a.consumer)
    }

    pub fn pending_read_count(&self) -> usize {
        self.inner.state.lock().pending_reads.len()
    }

    /// True when no read, write or truncation is in flight.
    pub fn is_idle(&self) -> bool {
        self.inner.state.lock().is_idle()
    }

    pub fn load_state(&self) -> LoadState {
        let state = self.inner.state.lock();
        state
            .network_source
            .as_ref()
            .map(|source| source.load_state())
            .unwrap_or(LoadState::Idle)
    }
}
