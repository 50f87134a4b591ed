//! Runtime parameters of a checkpoint indexer

use crate::checkpoint::MIN_BRANCHING_FACTOR;
use crate::error::{IndexError, IndexResult};
use crate::persist::IndexParams;

/// Largest accepted branching factor (node key counts are stored as `u16`)
pub const MAX_BRANCHING_FACTOR: usize = 4096;

/// Indexer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    /// One checkpoint every `interval` events
    pub interval: u64,

    /// B-tree branching factor for persistent indexes
    pub branching_factor: usize,

    /// Decoded B-tree nodes kept in memory
    pub node_cache_capacity: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            interval: 1000,
            branching_factor: 32,
            node_cache_capacity: crate::checkpoint::DEFAULT_NODE_CACHE_CAPACITY,
        }
    }
}

impl IndexConfig {
    pub fn new(interval: u64) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    pub fn with_branching_factor(mut self, branching_factor: usize) -> Self {
        self.branching_factor = branching_factor;
        self
    }

    pub fn with_node_cache_capacity(mut self, capacity: usize) -> Self {
        self.node_cache_capacity = capacity;
        self
    }

    /// Reject parameters no index can be built with
    pub fn validate(&self) -> IndexResult<()> {
        if self.interval == 0 {
            return Err(IndexError::Configuration(
                "checkpoint interval must be positive".to_string(),
            ));
        }
        if !(MIN_BRANCHING_FACTOR..=MAX_BRANCHING_FACTOR).contains(&self.branching_factor) {
            return Err(IndexError::Configuration(format!(
                "branching factor must be between {} and {}, got {}",
                MIN_BRANCHING_FACTOR, MAX_BRANCHING_FACTOR, self.branching_factor
            )));
        }
        if self.node_cache_capacity == 0 {
            return Err(IndexError::Configuration(
                "node cache capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Parameters a stored index must match to be reused
    pub fn params(&self) -> IndexParams {
        IndexParams {
            interval: self.interval,
            branching: self.branching_factor,
            cache_capacity: self.node_cache_capacity,
        }
    }
}
