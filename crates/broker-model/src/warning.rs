//! Soft, partial-result outcomes attached to an otherwise-successful response
//!
//! Mirrors the teacher's `fail_on_shard_error` distinction between a hard
//! error and a partial result: the broker never fails a whole request for
//! these conditions, but the caller must be able to observe them.

use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Warning {
    /// A shard failed during chain-ID resolution; the union proceeded
    /// with the surviving shards.
    ChainShardFailed { shard_id: String, message: String },
    /// The union of chain-resolved reference IDs exceeded
    /// `maxDistributedReferenceIds` and was truncated.
    ChainReferencesTruncated { requested: usize, kept: usize },
    /// Include iteration hit the hard cap before reaching a fixed point.
    IncludeIterationCapped { cap: u32 },
    /// The included-resource bundle exceeded its cap; a follow-up
    /// `$includes`-style retrieval is required.
    IncludeBundleTruncated { kept: usize },
    /// A shard failed during the main fan-out; its entries are absent
    /// from the aggregated result.
    ShardExcluded { shard_id: String, message: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChainShardFailed { shard_id, message } => {
                write!(f, "chain resolution: shard {shard_id} failed: {message}")
            }
            Self::ChainReferencesTruncated { requested, kept } => {
                write!(f, "chain resolution: truncated {requested} reference ids to {kept}")
            }
            Self::IncludeIterationCapped { cap } => {
                write!(f, "include resolution: iteration cap ({cap}) reached before fixed point")
            }
            Self::IncludeBundleTruncated { kept } => {
                write!(f, "include resolution: bundle truncated, kept {kept} included resources")
            }
            Self::ShardExcluded { shard_id, message } => {
                write!(f, "shard {shard_id} excluded from result: {message}")
            }
        }
    }
}
