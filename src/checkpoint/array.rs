//! Array-backed checkpoint collection
//!
//! Fully held in memory. Chosen for small or short-lived traces and as the
//! default when persistence is disabled.
//!
//! # Performance
//! - Insert: amortized O(1)
//! - Search: O(log n) binary search

use crate::checkpoint::{Checkpoint, CheckpointCollection, SearchKey};
use crate::error::IndexResult;
use crate::trace::{TraceLocation, TraceSignature};
use parking_lot::RwLock;

/// In-memory checkpoint collection
#[derive(Debug, Default)]
pub struct ArrayCollection<L> {
    checkpoints: RwLock<Vec<Checkpoint<L>>>,
}

impl<L: TraceLocation> ArrayCollection<L> {
    pub fn new() -> Self {
        Self {
            checkpoints: RwLock::new(Vec::new()),
        }
    }
}

impl<L: TraceLocation> CheckpointCollection<L> for ArrayCollection<L> {
    fn insert(&self, checkpoint: Checkpoint<L>) -> IndexResult<()> {
        let mut checkpoints = self.checkpoints.write();
        checkpoint.check_follows(checkpoints.last())?;
        checkpoints.push(checkpoint);
        Ok(())
    }

    fn len(&self) -> usize {
        self.checkpoints.read().len()
    }

    fn get(&self, index: usize) -> IndexResult<Option<Checkpoint<L>>> {
        Ok(self.checkpoints.read().get(index).cloned())
    }

    fn search(&self, key: SearchKey) -> IndexResult<Option<usize>> {
        let checkpoints = self.checkpoints.read();
        // Ranks and timestamps are both non-decreasing, so the predicate is
        // a prefix of the array
        let count = checkpoints.partition_point(|cp| cp.at_or_before(key));
        Ok(count.checked_sub(1))
    }

    fn floor(&self, key: SearchKey) -> IndexResult<Option<Checkpoint<L>>> {
        let checkpoints = self.checkpoints.read();
        let count = checkpoints.partition_point(|cp| cp.at_or_before(key));
        Ok(count.checked_sub(1).map(|i| checkpoints[i].clone()))
    }

    fn snapshot(&self) -> IndexResult<Vec<Checkpoint<L>>> {
        Ok(self.checkpoints.read().clone())
    }

    fn reset(&self) -> IndexResult<()> {
        self.checkpoints.write().clear();
        Ok(())
    }

    fn flush(&self, _events: u64, _signature: Option<TraceSignature>) -> IndexResult<()> {
        Ok(())
    }

    fn release(&self) -> IndexResult<()> {
        let mut checkpoints = self.checkpoints.write();
        checkpoints.clear();
        checkpoints.shrink_to_fit();
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        false
    }
}
