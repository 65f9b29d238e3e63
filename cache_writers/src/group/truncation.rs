use std::collections::BTreeSet;

use tracing::{debug, error, info};

use super::state::{Effects, GroupState, PipelineState};
use crate::config::WritersConfig;
use crate::error::CacheEntryError;
use crate::response_info::ResponseInfo;

/// Result of deciding what to do with an incomplete entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncateOutcome {
    /// Other members still need the entry; nothing was decided.
    OtherMembersRemain,
    /// The group had already given up on keeping partial data.
    NotKept,
    /// The body already reached its declared length; kept as complete.
    AlreadyComplete,
    /// A range request over a complete entry; the entry is left alone.
    SkippedRangeRequest,
    /// Partial data is not resumable; the entry must be discarded.
    CannotResume,
    /// Metadata flagged truncated was persisted; the entry is kept for resumption.
    Truncated,
    /// Persisting the truncated metadata failed; the entry must be discarded.
    MetadataWriteFailed,
}

impl TruncateOutcome {
    pub fn keeps_entry(self) -> bool {
        matches!(
            self,
            TruncateOutcome::OtherMembersRemain
                | TruncateOutcome::AlreadyComplete
                | TruncateOutcome::SkippedRangeRequest
                | TruncateOutcome::Truncated
        )
    }
}

pub(crate) enum TruncatePlan {
    Done(TruncateOutcome),
    WriteMetadata(Vec<u8>),
}

/// Resumability of an incomplete entry judged against `info`.
pub(crate) fn can_resume(info: &ResponseInfo, entry_size: u64, config: &WritersConfig) -> bool {
    entry_size > 0 && info.allows_resume(config.strong_validator_min_age)
}

impl GroupState {
    /// Decides how to dispose of an incomplete entry. A metadata write, if needed, is left to
    /// the caller and reported back through [`finish_truncation`](Self::finish_truncation).
    ///
    /// The first decision of a generation sticks: later calls return it unchanged.
    pub(crate) fn plan_truncation(&mut self, entry_size: u64, config: &WritersConfig) -> TruncatePlan {
        if let Some(outcome) = self.truncation {
            return TruncatePlan::Done(outcome);
        }

        let info = self.response_info_for_truncation();
        let declared = info.as_ref().and_then(|i| i.content_length());

        let outcome = if !self.keep_entry_on_incomplete {
            TruncateOutcome::NotKept
        } else if matches!(declared, Some(len) if entry_size >= len) {
            TruncateOutcome::AlreadyComplete
        } else if self.range_request.as_ref().is_some_and(|range| !range.is_truncated()) {
            TruncateOutcome::SkippedRangeRequest
        } else {
            let info = self.range_request.as_ref().and_then(|range| range.response_info()).or(info);
            match info {
                Some(info) if can_resume(&info, entry_size, config) => {
                    match info.persist(true, !config.persist_transient_headers) {
                        Ok(blob) => {
                            debug!(entry_size, blob_len = blob.len(), "writing truncated response metadata");
                            self.pipeline = PipelineState::TruncateWrite;
                            return TruncatePlan::WriteMetadata(blob);
                        },
                        Err(e) => {
                            error!(error = %e, "failed to serialize truncated response metadata");
                            TruncateOutcome::MetadataWriteFailed
                        },
                    }
                },
                _ => TruncateOutcome::CannotResume,
            }
        };

        self.settle_truncation(outcome);
        TruncatePlan::Done(outcome)
    }

    pub(crate) fn finish_truncation(
        &mut self,
        expected_len: usize,
        result: std::result::Result<usize, CacheEntryError>,
    ) -> TruncateOutcome {
        self.pipeline = PipelineState::Idle;
        let outcome = match result {
            Ok(written) if written == expected_len => {
                info!(bytes = written, "stored incomplete entry as truncated");
                TruncateOutcome::Truncated
            },
            Ok(written) => {
                error!(expected = expected_len, written, "failed to write response info to cache");
                TruncateOutcome::MetadataWriteFailed
            },
            Err(e) => {
                error!(error = %e, "failed to write response info to cache");
                TruncateOutcome::MetadataWriteFailed
            },
        };
        self.settle_truncation(outcome);
        outcome
    }

    /// Reports the disband outcome and resets for the next generation.
    pub(crate) fn close_generation(&mut self, outcome: TruncateOutcome, effects: &mut Effects) {
        info!(?outcome, kept = outcome.keeps_entry(), "writer group disbanded");
        self.report_disband(outcome.keeps_entry(), BTreeSet::new(), effects);
        self.reset_for_empty();
    }

    fn settle_truncation(&mut self, outcome: TruncateOutcome) {
        if !outcome.keeps_entry() {
            self.keep_entry_on_incomplete = false;
        }
        self.truncation = Some(outcome);
    }
}
