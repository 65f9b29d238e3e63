#![cfg_attr(feature = "strict", deny(warnings))]

mod config;
pub mod error;
mod group;
mod interface;
mod memory_entry;
mod priority;
mod response_info;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::WritersConfig;
pub use error::{CacheEntryError, NetworkError, Result, WritersError};
pub use group::{GroupMode, MemberOptions, TruncateOutcome, WriterGroup};
pub use interface::{CacheEntry, Consumer, ConsumerId, DisbandReport, LoadState, NetworkSource, OwningCache, PartialRange};
pub use memory_entry::MemoryCacheEntry;
pub use priority::RequestPriority;
pub use response_info::ResponseInfo;
