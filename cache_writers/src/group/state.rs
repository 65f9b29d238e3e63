use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

use super::truncation::TruncateOutcome;
use crate::error::{Result, WritersError};
use crate::interface::{Consumer, ConsumerId, DisbandReport, NetworkSource, OwningCache, PartialRange};
use crate::priority::RequestPriority;
use crate::response_info::ResponseInfo;

pub(crate) type ReadSender = oneshot::Sender<Result<Bytes>>;

/// How the group may use the cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMode {
    /// Shared fetch; appends to the entry and admits new members.
    Writing,
    /// Single-member fetch (e.g. a byte-range request); still writes, never admits.
    Exclusive,
    /// No further writes to the entry; existing members keep reading from the network.
    ReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipelineState {
    Idle,
    NetworkRead,
    CacheWrite,
    TruncateWrite,
    /// The last member is gone; truncation and the owner report are pending.
    Disbanding,
}

pub(crate) struct MemberContext {
    pub(crate) consumer: Arc<dyn Consumer>,
    pub(crate) priority: RequestPriority,
    pub(crate) partial: Option<Arc<dyn PartialRange>>,
}

pub(crate) struct ActiveRead {
    pub(crate) consumer: ConsumerId,
    pub(crate) sender: ReadSender,
}

pub(crate) struct PendingRead {
    pub(crate) consumer: ConsumerId,
    pub(crate) requested_len: usize,
    pub(crate) sender: ReadSender,
}

/// Why a consumer is no longer a member; answers its later calls.
#[derive(Debug, Clone)]
pub(crate) enum Departure {
    Failed(WritersError),
    Completed,
}

/// Side effects collected under the state lock and applied once it is released.
#[derive(Default)]
pub(crate) struct Effects {
    removed: Vec<Arc<dyn Consumer>>,
    disband: Option<DisbandReport>,
    deliveries: Vec<(ReadSender, Result<Bytes>)>,
}

impl Effects {
    pub(crate) fn deliver(&mut self, sender: ReadSender, result: Result<Bytes>) {
        self.deliveries.push((sender, result));
    }

    /// Removal notices first, then the owner callback, then read results in queue order.
    pub(crate) fn apply(self, owner: &dyn OwningCache) {
        for consumer in self.removed {
            consumer.notify_removed_from_group();
        }
        if let Some(report) = self.disband {
            owner.on_group_disbanded(report);
        }
        for (sender, result) in self.deliveries {
            // The receiver is gone if the consumer stopped waiting; nothing to do.
            let _ = sender.send(result);
        }
    }
}

pub(crate) struct GroupState {
    pub(crate) members: HashMap<ConsumerId, MemberContext>,
    next_consumer_id: u64,
    pub(crate) departed: HashMap<ConsumerId, Departure>,

    pub(crate) network_source: Option<Arc<dyn NetworkSource>>,
    pub(crate) active_reader: Option<ActiveRead>,
    pub(crate) pending_reads: VecDeque<PendingRead>,
    pub(crate) pipeline: PipelineState,

    pub(crate) mode: GroupMode,
    pub(crate) aggregate_priority: RequestPriority,
    pub(crate) keep_entry_on_incomplete: bool,
    pub(crate) last_response_info: Option<ResponseInfo>,
    pub(crate) range_request: Option<Arc<dyn PartialRange>>,

    pub(crate) truncation: Option<TruncateOutcome>,
    outcome_reported: bool,
    pub(crate) deferred_disband: Option<bool>,
}

impl GroupState {
    pub(crate) fn new() -> Self {
        Self {
            members: HashMap::new(),
            next_consumer_id: 1,
            departed: HashMap::new(),
            network_source: None,
            active_reader: None,
            pending_reads: VecDeque::new(),
            pipeline: PipelineState::Idle,
            mode: GroupMode::Writing,
            aggregate_priority: RequestPriority::MINIMUM,
            keep_entry_on_incomplete: false,
            last_response_info: None,
            range_request: None,
            truncation: None,
            outcome_reported: false,
            deferred_disband: None,
        }
    }

    pub(crate) fn allocate_id(&mut self) -> ConsumerId {
        let id = ConsumerId(self.next_consumer_id);
        self.next_consumer_id += 1;
        id
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.pipeline == PipelineState::Idle
    }

    pub(crate) fn can_admit_more(&self) -> bool {
        if matches!(self.pipeline, PipelineState::TruncateWrite | PipelineState::Disbanding) {
            return false;
        }
        self.members.is_empty() || self.mode == GroupMode::Writing
    }

    /// A new read joins the running cycle only while network bytes are still on their way.
    pub(crate) fn cycle_in_flight(&self) -> bool {
        self.active_reader.is_some() || matches!(self.pipeline, PipelineState::NetworkRead | PipelineState::CacheWrite)
    }

    /// Closes the emptied group to newcomers until [`reset_for_empty`](Self::reset_for_empty) runs.
    pub(crate) fn begin_disband(&mut self) {
        debug_assert!(self.members.is_empty());
        self.pipeline = PipelineState::Disbanding;
    }

    /// Enters disbanding after a cycle emptied the group, returning whether to truncate.
    pub(crate) fn take_disband_decision(&mut self) -> bool {
        self.begin_disband();
        self.deferred_disband.take().unwrap_or(true)
    }

    pub(crate) fn contains_only_idle_members(&self) -> bool {
        self.pending_reads.is_empty() && self.active_reader.is_none()
    }

    pub(crate) fn member(&self, consumer: ConsumerId) -> Result<&MemberContext> {
        self.members.get(&consumer).ok_or(WritersError::UnknownConsumer(consumer))
    }

    pub(crate) fn is_active(&self, consumer: ConsumerId) -> bool {
        self.active_reader.as_ref().is_some_and(|a| a.consumer == consumer)
    }

    pub(crate) fn active_range_request(&self) -> Option<Arc<dyn PartialRange>> {
        let active = self.active_reader.as_ref()?;
        self.members.get(&active.consumer)?.partial.clone()
    }

    /// Removes a member and queues its removal notice. Does not touch reads.
    pub(crate) fn remove_member(&mut self, consumer: ConsumerId, effects: &mut Effects) -> bool {
        match self.members.remove(&consumer) {
            Some(member) => {
                effects.removed.push(member.consumer);
                true
            },
            None => false,
        }
    }

    /// Records the outcome for the owning cache unless this generation already reported one.
    pub(crate) fn report_disband(&mut self, kept: bool, handoff_readers: BTreeSet<ConsumerId>, effects: &mut Effects) {
        if self.outcome_reported {
            return;
        }
        self.outcome_reported = true;
        effects.disband = Some(DisbandReport { kept, handoff_readers });
    }

    /// Recomputes the maximum member priority, pushing it to the network source if it moved.
    pub(crate) fn update_priority(&mut self) {
        let current_highest = self.highest_member_priority();
        if current_highest != self.aggregate_priority {
            debug!(from = ?self.aggregate_priority, to = ?current_highest, "writer group priority changed");
            self.aggregate_priority = current_highest;
            self.propagate_priority();
        }
    }

    pub(crate) fn highest_member_priority(&self) -> RequestPriority {
        self.members
            .values()
            .map(|m| m.priority)
            .max()
            .unwrap_or(RequestPriority::MINIMUM)
    }

    pub(crate) fn propagate_priority(&self) {
        if let Some(source) = &self.network_source {
            source.set_priority(self.aggregate_priority);
        }
    }

    /// Fails every queued read with `error`, removing those consumers from the group.
    pub(crate) fn fail_waiting_reads(&mut self, error: &WritersError, effects: &mut Effects) {
        while let Some(pending) = self.pending_reads.pop_front() {
            self.remove_member(pending.consumer, effects);
            self.departed.insert(pending.consumer, Departure::Failed(error.clone()));
            effects.deliver(pending.sender, Err(error.clone()));
        }
        self.update_priority();
    }

    /// Fails every queued read and every idle member with `error`. The active reader, if
    /// any, stays a member; its fate is decided by the caller.
    pub(crate) fn fail_waiting_and_idle(&mut self, error: &WritersError, effects: &mut Effects) {
        self.fail_waiting_reads(error, effects);

        let active = self.active_reader.as_ref().map(|a| a.consumer);
        let idle: Vec<ConsumerId> = self.members.keys().copied().filter(|id| Some(*id) != active).collect();
        for id in idle {
            self.remove_member(id, effects);
            self.departed.insert(id, Departure::Failed(error.clone()));
        }

        self.update_priority();
    }

    /// Metadata the truncation logic should judge: the network's view if it has one,
    /// otherwise the most recently joined member's.
    pub(crate) fn response_info_for_truncation(&self) -> Option<ResponseInfo> {
        self.network_source
            .as_ref()
            .and_then(|source| source.response_info())
            .or_else(|| self.last_response_info.clone())
    }

    /// True unless a declared content length exceeds what the entry holds.
    pub(crate) fn body_complete(&self, entry_size: u64) -> bool {
        match self.response_info_for_truncation().and_then(|info| info.content_length()) {
            Some(declared) => entry_size >= declared,
            None => true,
        }
    }

    /// Starts a fresh generation once the last member is gone.
    pub(crate) fn reset_for_empty(&mut self) {
        debug_assert!(self.members.is_empty());
        self.network_source = None;
        self.active_reader = None;
        self.pending_reads.clear();
        self.pipeline = PipelineState::Idle;
        self.mode = GroupMode::Writing;
        self.aggregate_priority = RequestPriority::MINIMUM;
        self.keep_entry_on_incomplete = false;
        self.last_response_info = None;
        self.range_request = None;
        self.truncation = None;
        self.outcome_reported = false;
        self.deferred_disband = None;
    }
}
