//! Compaction context types.
//!
//! During log cleaning the replication layer asks the runtime, entry by
//! entry, whether to retain each entry. The decision logic lives on the
//! apply core so it sees the live session registry; the context types here
//! describe the compaction pass itself.
//!
//! Filter results must be deterministic given identical entry and context
//! across replicas; the filter therefore consults only replicated state.

use serde::{Deserialize, Serialize};

/// Kind of compaction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompactionKind {
    /// Incremental cleaning of a log region.
    Minor,
    /// Full rewrite up to the compaction ceiling.
    Major,
}

/// Context for a compaction pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Compaction {
    /// Kind of pass.
    pub kind: CompactionKind,

    /// Highest log index staged for cleaning in this pass.
    pub index: u64,
}

impl Compaction {
    /// Create a compaction context.
    pub fn new(kind: CompactionKind, index: u64) -> Self {
        Self { kind, index }
    }

    /// Create a minor compaction context.
    pub fn minor(index: u64) -> Self {
        Self::new(CompactionKind::Minor, index)
    }

    /// Create a major compaction context.
    pub fn major(index: u64) -> Self {
        Self::new(CompactionKind::Major, index)
    }
}
