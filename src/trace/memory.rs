//! In-memory trace source
//!
//! Holds timestamps in a shared `Vec`. Locations are plain ordinals, so the
//! location of an event equals its rank. Useful for tests, benchmarks and
//! hosts that already have their events in memory.

use crate::error::{IndexError, IndexResult};
use crate::trace::{Rank, Timestamp, TraceEvent, TraceReader, TraceSignature, TraceSource};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Event produced by a [`MemoryTrace`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryEvent {
    pub timestamp: Timestamp,
    pub rank: Rank,
}

impl TraceEvent for MemoryEvent {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// `Vec`-backed trace
#[derive(Debug, Clone)]
pub struct MemoryTrace {
    timestamps: Arc<Vec<Timestamp>>,
    signature: Arc<RwLock<Option<TraceSignature>>>,
    /// Rank at which readers report a source failure (`u64::MAX` = never)
    fail_at: Arc<AtomicU64>,
}

impl MemoryTrace {
    /// Create a trace from timestamps (must be non-decreasing)
    pub fn new(timestamps: Vec<Timestamp>) -> Self {
        let signature = TraceSignature::new(timestamps.len() as u64, 0, 0);
        Self {
            timestamps: Arc::new(timestamps),
            signature: Arc::new(RwLock::new(Some(signature))),
            fail_at: Arc::new(AtomicU64::new(u64::MAX)),
        }
    }

    /// Trace of `count` events with timestamps `0, step, 2*step, ...`
    pub fn sequential(count: u64, step: Timestamp) -> Self {
        Self::new((0..count as i64).map(|i| i * step).collect())
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Replace the reported signature (simulates an external modification)
    pub fn set_signature(&self, signature: Option<TraceSignature>) {
        *self.signature.write() = signature;
    }

    /// Make every reader fail when it reaches `rank`
    pub fn fail_at(&self, rank: Rank) {
        self.fail_at.store(rank, Ordering::SeqCst);
    }

    /// Stop injecting failures
    pub fn clear_failure(&self) {
        self.fail_at.store(u64::MAX, Ordering::SeqCst);
    }
}

impl TraceSource for MemoryTrace {
    type Event = MemoryEvent;
    type Location = u64;
    type Reader = MemoryTraceReader;

    fn open(&self) -> IndexResult<MemoryTraceReader> {
        self.open_at(&0, 0)
    }

    fn open_at(&self, location: &u64, rank: Rank) -> IndexResult<MemoryTraceReader> {
        if *location != rank || *location > self.timestamps.len() as u64 {
            return Err(IndexError::source_read(
                rank,
                format!("location {} does not belong to this trace", location),
            ));
        }

        Ok(MemoryTraceReader {
            timestamps: Arc::clone(&self.timestamps),
            fail_at: Arc::clone(&self.fail_at),
            position: *location,
        })
    }

    fn signature(&self) -> IndexResult<Option<TraceSignature>> {
        Ok(*self.signature.read())
    }
}

/// Reader over a [`MemoryTrace`]
pub struct MemoryTraceReader {
    timestamps: Arc<Vec<Timestamp>>,
    fail_at: Arc<AtomicU64>,
    position: u64,
}

impl TraceReader for MemoryTraceReader {
    type Event = MemoryEvent;
    type Location = u64;

    fn location(&self) -> u64 {
        self.position
    }

    fn rank(&self) -> Rank {
        self.position
    }

    fn next_event(&mut self) -> IndexResult<Option<MemoryEvent>> {
        if self.position == self.fail_at.load(Ordering::SeqCst) {
            return Err(IndexError::source_read(self.position, "injected failure"));
        }

        match self.timestamps.get(self.position as usize) {
            Some(&timestamp) => {
                let event = MemoryEvent {
                    timestamp,
                    rank: self.position,
                };
                self.position += 1;
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }
}
