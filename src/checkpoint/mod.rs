//! Checkpoints and checkpoint collections
//!
//! A checkpoint is a sampled `(timestamp, rank, location)` triple used as a
//! seek anchor. Collections keep checkpoints in rank order and answer
//! floor lookups:
//!
//! - **ArrayCollection**: growable in-memory array, binary search
//! - **BTreeCollection**: disk-resident B-tree with fixed-size nodes
//!
//! ```text
//! seek_rank(9500), interval 1000
//!        ↓
//! search(Rank(9500)) → checkpoint #9 (rank 9000)
//!        ↓
//! open reader at checkpoint #9, skip 500 events
//! ```

mod array;
mod btree;
mod node;

pub use array::ArrayCollection;
pub use btree::{BTreeCollection, TreeMeta, DEFAULT_NODE_CACHE_CAPACITY};

use crate::error::{IndexError, IndexResult};
use crate::trace::{Rank, Timestamp, TraceLocation, TraceSignature};
use serde::Serialize;

/// Smallest accepted B-tree branching factor
pub const MIN_BRANCHING_FACTOR: usize = 2;

/// Immutable seek anchor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint<L> {
    /// Timestamp of the checkpointed event
    pub timestamp: Timestamp,
    /// Rank of the checkpointed event
    pub rank: Rank,
    /// Location a reader resumes at to read this event next
    pub location: L,
}

impl<L: TraceLocation> Checkpoint<L> {
    pub fn new(timestamp: Timestamp, rank: Rank, location: L) -> Self {
        Self {
            timestamp,
            rank,
            location,
        }
    }

    /// Whether this checkpoint lies at or before `key`
    pub fn at_or_before(&self, key: SearchKey) -> bool {
        match key {
            SearchKey::Rank(rank) => self.rank <= rank,
            SearchKey::Timestamp(ts) => self.timestamp <= ts,
        }
    }

    /// Reject a checkpoint that would not strictly follow `previous`
    pub(crate) fn check_follows(&self, previous: Option<&Checkpoint<L>>) -> IndexResult<()> {
        if let Some(prev) = previous {
            if self.rank <= prev.rank || self.timestamp < prev.timestamp {
                return Err(IndexError::NonMonotonic(format!(
                    "checkpoint (rank {}, ts {}) does not follow (rank {}, ts {})",
                    self.rank, self.timestamp, prev.rank, prev.timestamp
                )));
            }
        }
        Ok(())
    }
}

/// Target of a floor lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKey {
    Rank(Rank),
    Timestamp(Timestamp),
}

/// Ordered, append-only container of checkpoints
///
/// A single writer appends while any number of readers search. Appends
/// only ever extend the sequence, so a position returned by `search`
/// stays valid until `reset`.
pub trait CheckpointCollection<L: TraceLocation>: Send + Sync {
    /// Append a checkpoint; its rank must exceed every stored rank
    fn insert(&self, checkpoint: Checkpoint<L>) -> IndexResult<()>;

    /// Number of stored checkpoints
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checkpoint at positional index `index`
    fn get(&self, index: usize) -> IndexResult<Option<Checkpoint<L>>>;

    /// Position of the last checkpoint at or before `key`
    fn search(&self, key: SearchKey) -> IndexResult<Option<usize>>;

    /// The last checkpoint at or before `key`
    fn floor(&self, key: SearchKey) -> IndexResult<Option<Checkpoint<L>>> {
        match self.search(key)? {
            Some(index) => self.get(index),
            None => Ok(None),
        }
    }

    /// Most recently appended checkpoint
    fn last(&self) -> IndexResult<Option<Checkpoint<L>>> {
        match self.len() {
            0 => Ok(None),
            n => self.get(n - 1),
        }
    }

    /// All checkpoints in rank order
    fn snapshot(&self) -> IndexResult<Vec<Checkpoint<L>>> {
        let mut out = Vec::with_capacity(self.len());
        for index in 0..self.len() {
            if let Some(checkpoint) = self.get(index)? {
                out.push(checkpoint);
            }
        }
        Ok(out)
    }

    /// Drop every checkpoint (rebuild from scratch)
    fn reset(&self) -> IndexResult<()>;

    /// Make the current contents durable and mark them complete
    ///
    /// `events` is the total number of events the index covers and
    /// `signature` the identity of the trace it was built from.
    fn flush(&self, events: u64, signature: Option<TraceSignature>) -> IndexResult<()>;

    /// Release file handles and caches; the collection is unusable after
    fn release(&self) -> IndexResult<()> {
        Ok(())
    }

    /// Whether contents survive the process
    fn is_persistent(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_or_before() {
        let cp = Checkpoint::new(500, 10, 80u64);

        assert!(cp.at_or_before(SearchKey::Rank(10)));
        assert!(cp.at_or_before(SearchKey::Rank(11)));
        assert!(!cp.at_or_before(SearchKey::Rank(9)));
        assert!(cp.at_or_before(SearchKey::Timestamp(500)));
        assert!(!cp.at_or_before(SearchKey::Timestamp(499)));
    }

    #[test]
    fn test_check_follows() {
        let first = Checkpoint::new(100, 0, 0u64);
        let second = Checkpoint::new(100, 5, 40u64);
        let stale = Checkpoint::new(200, 5, 40u64);
        let backwards = Checkpoint::new(50, 10, 80u64);

        assert!(first.check_follows(None).is_ok());
        assert!(second.check_follows(Some(&first)).is_ok());
        assert!(stale.check_follows(Some(&second)).is_err());
        assert!(backwards.check_follows(Some(&second)).is_err());
    }
}
