//! Checkpoint indexer
//!
//! Drives a linear scan of a trace source, drops a checkpoint every
//! `interval` events, and answers seeks by a floor lookup in the checkpoint
//! collection followed by a bounded scan from that checkpoint.
//!
//! # State machine
//!
//! ```text
//!            build_index / first seek
//!   Empty ───────────────────────────→ Building ──(end of data)──→ Built
//!                                        ↑  │                        │
//!                                        │  └─ cancelled / bounded   │ invalidate()
//!                                        │     (reader parked)       │ refresh() on change
//!                                        │                           ↓
//!                                        └────── next access ──── Invalid
//! ```
//!
//! Builds are serialized by a build lock. Seeks never take it unless they
//! have to build themselves: a seek whose target lies beyond the indexed
//! prefix waits on a condition variable until the running build passes
//! the target, completes, or fails.

mod background;
mod cancel;
mod config;
mod cursor;

pub use background::AsyncIndexer;
pub use cancel::CancelToken;
pub use config::{IndexConfig, MAX_BRANCHING_FACTOR};
pub use cursor::{SeekOutcome, TraceCursor};

use crate::checkpoint::{ArrayCollection, Checkpoint, CheckpointCollection, SearchKey};
use crate::error::{IndexError, IndexResult};
use crate::persist::load_or_create;
use crate::trace::{Rank, Timestamp, TraceEvent, TraceReader, TraceSignature, TraceSource};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::path::Path;
use std::time::{Duration, Instant};

/// How long a waiting seek sleeps before re-checking the build state
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Lifecycle state of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    /// Nothing indexed yet
    Empty,
    /// A prefix of the trace is indexed
    Building,
    /// The whole trace is indexed
    Built,
    /// The trace changed or the index broke; rebuilt on next access
    Invalid,
}

impl std::fmt::Display for IndexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IndexState::Empty => "empty",
            IndexState::Building => "building",
            IndexState::Built => "built",
            IndexState::Invalid => "invalid",
        };
        f.write_str(name)
    }
}

/// How far a build should go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildTarget {
    /// To the end of the trace
    Unbounded,
    /// Until the event with this rank has been indexed
    Rank(Rank),
    /// Until an event at or after this timestamp has been indexed
    Timestamp(Timestamp),
}

/// Why a build returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum BuildOutcome {
    /// End of data reached; the index is Built
    Complete { events: u64 },
    /// A bounded target was passed; the reader is parked
    Reached { scanned: u64 },
    /// The cancel token fired; the reader is parked
    Cancelled { scanned: u64 },
}

/// Snapshot of an indexer's build progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildProgress {
    pub state: IndexState,
    /// Events scanned so far (never decreases within one build)
    pub scanned: u64,
    /// Timestamp of the last scanned event
    pub last_timestamp: Option<Timestamp>,
    /// Total event count, known once Built
    pub total: Option<u64>,
    pub checkpoints: usize,
}

#[derive(Debug, Clone)]
struct BuildFailure {
    rank: Rank,
    message: String,
}

#[derive(Debug)]
struct Progress {
    state: IndexState,
    scanned: u64,
    last_timestamp: Option<Timestamp>,
    total: Option<u64>,
    /// Signature of the trace the current index was built from
    signature: Option<TraceSignature>,
    /// Most recent build failure, cleared when a build starts
    failure: Option<BuildFailure>,
    /// Number of failed builds so far
    failures: u64,
    waiters: usize,
    disposed: bool,
}

impl Progress {
    fn new(state: IndexState) -> Self {
        Self {
            state,
            scanned: 0,
            last_timestamp: None,
            total: None,
            signature: None,
            failure: None,
            failures: 0,
            waiters: 0,
            disposed: false,
        }
    }

    /// Whether the indexed prefix already answers `target`
    fn covers(&self, target: BuildTarget) -> bool {
        match self.state {
            IndexState::Built => true,
            IndexState::Building => match target {
                BuildTarget::Unbounded => false,
                BuildTarget::Rank(rank) => self.scanned > rank,
                BuildTarget::Timestamp(ts) => self.last_timestamp.is_some_and(|last| last >= ts),
            },
            IndexState::Empty | IndexState::Invalid => false,
        }
    }

    fn failure_error(&self) -> IndexError {
        match &self.failure {
            Some(failure) => IndexError::source_read(failure.rank, failure.message.clone()),
            None => IndexError::source_read(self.scanned, "index build failed"),
        }
    }
}

/// State owned by whoever holds the build lock
struct BuildSlot<R> {
    /// Reader parked by a cancelled or bounded build
    reader: Option<R>,
}

/// Sparse checkpoint index over a trace source
pub struct CheckpointIndexer<S: TraceSource> {
    source: S,
    collection: Box<dyn CheckpointCollection<S::Location>>,
    config: IndexConfig,
    build: Mutex<BuildSlot<S::Reader>>,
    progress: Mutex<Progress>,
    progress_changed: Condvar,
}

impl<S: TraceSource> CheckpointIndexer<S> {
    /// Transient index held in memory
    pub fn new(source: S, config: IndexConfig) -> IndexResult<Self> {
        config.validate()?;
        let collection: Box<dyn CheckpointCollection<S::Location>> = Box::new(ArrayCollection::new());
        Ok(Self::from_parts(source, collection, config, Progress::new(IndexState::Empty)))
    }

    /// Index over a caller-supplied collection
    ///
    /// Whatever the collection holds is discarded by the first build.
    pub fn with_collection(
        source: S,
        collection: Box<dyn CheckpointCollection<S::Location>>,
        config: IndexConfig,
    ) -> IndexResult<Self> {
        config.validate()?;
        Ok(Self::from_parts(source, collection, config, Progress::new(IndexState::Empty)))
    }

    /// Persistent index stored at `path`
    ///
    /// A stored index built from the same trace with the same parameters is
    /// reused as Built; anything else is discarded and rebuilt on demand.
    pub fn persistent(source: S, path: &Path, config: IndexConfig) -> IndexResult<Self> {
        config.validate()?;
        let signature = source.signature()?;
        let loaded = load_or_create::<S::Location>(path, signature, config.params())?;

        let mut progress = Progress::new(loaded.state);
        if loaded.state == IndexState::Built {
            progress.scanned = loaded.event_count;
            progress.total = Some(loaded.event_count);
            progress.signature = signature;
        }

        Ok(Self::from_parts(source, Box::new(loaded.collection), config, progress))
    }

    fn from_parts(
        source: S,
        collection: Box<dyn CheckpointCollection<S::Location>>,
        config: IndexConfig,
        progress: Progress,
    ) -> Self {
        Self {
            source,
            collection,
            config,
            build: Mutex::new(BuildSlot { reader: None }),
            progress: Mutex::new(progress),
            progress_changed: Condvar::new(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn is_persistent(&self) -> bool {
        self.collection.is_persistent()
    }

    pub fn state(&self) -> IndexState {
        self.progress.lock().state
    }

    /// Total number of events, known only once the index is Built
    pub fn size(&self) -> Option<u64> {
        let progress = self.progress.lock();
        match (progress.state, progress.disposed) {
            (IndexState::Built, false) => progress.total,
            _ => None,
        }
    }

    pub fn progress(&self) -> BuildProgress {
        let progress = self.progress.lock();
        BuildProgress {
            state: progress.state,
            scanned: progress.scanned,
            last_timestamp: progress.last_timestamp,
            total: progress.total,
            checkpoints: if progress.disposed { 0 } else { self.collection.len() },
        }
    }

    pub fn checkpoint_count(&self) -> usize {
        self.collection.len()
    }

    /// All checkpoints indexed so far
    pub fn checkpoints(&self) -> IndexResult<Vec<Checkpoint<S::Location>>> {
        self.check_live()?;
        self.collection.snapshot()
    }

    /// Signature of the trace the current index was built from
    pub fn signature(&self) -> Option<TraceSignature> {
        self.progress.lock().signature
    }

    fn check_live(&self) -> IndexResult<()> {
        if self.progress.lock().disposed {
            return Err(IndexError::Disposed);
        }
        Ok(())
    }

    /// Scan the trace until `target` is indexed, the trace ends, or `cancel` fires
    ///
    /// Blocks while another build holds the build lock. Resumes a reader
    /// parked by a previous cancelled or bounded build; after a failed build
    /// it reopens the trace at the last checkpoint.
    pub fn build_index(&self, target: BuildTarget, cancel: &CancelToken) -> IndexResult<BuildOutcome> {
        let mut slot = self.build.lock();
        self.run_build(&mut slot, target, cancel)
    }

    fn run_build(
        &self,
        slot: &mut BuildSlot<S::Reader>,
        target: BuildTarget,
        cancel: &CancelToken,
    ) -> IndexResult<BuildOutcome> {
        let restart = {
            let progress = self.progress.lock();
            if progress.disposed {
                return Err(IndexError::Disposed);
            }
            match progress.state {
                IndexState::Built => {
                    return Ok(BuildOutcome::Complete {
                        events: progress.total.unwrap_or(progress.scanned),
                    })
                }
                IndexState::Empty | IndexState::Invalid => true,
                IndexState::Building => false,
            }
        };

        let result = match self.start(slot, restart) {
            Ok(signature) => self.scan(slot, target, cancel, signature),
            Err(e) => Err(e),
        };

        match &result {
            Err(IndexError::Disposed) | Ok(_) => {}
            Err(e) => self.record_failure(e),
        }
        result
    }

    /// Enter Building, clearing old contents when starting from scratch
    fn start(&self, slot: &mut BuildSlot<S::Reader>, restart: bool) -> IndexResult<Option<TraceSignature>> {
        if restart {
            slot.reader = None;
            if !self.collection.is_empty() {
                self.collection.reset()?;
            }
            let signature = self.source.signature()?;

            let mut progress = self.progress.lock();
            progress.state = IndexState::Building;
            progress.scanned = 0;
            progress.last_timestamp = None;
            progress.total = None;
            progress.signature = signature;
            progress.failure = None;
            self.progress_changed.notify_all();

            tracing::info!(
                "Building index (interval {}, {})",
                self.config.interval,
                if self.collection.is_persistent() { "persistent" } else { "in memory" }
            );
            return Ok(signature);
        }

        let mut progress = self.progress.lock();
        progress.failure = None;
        Ok(progress.signature)
    }

    fn scan(
        &self,
        slot: &mut BuildSlot<S::Reader>,
        target: BuildTarget,
        cancel: &CancelToken,
        signature: Option<TraceSignature>,
    ) -> IndexResult<BuildOutcome> {
        let started = Instant::now();
        let mut reader = match slot.reader.take() {
            Some(reader) => reader,
            None => match self.collection.last()? {
                Some(checkpoint) => {
                    tracing::debug!("Resuming build at checkpoint rank {}", checkpoint.rank);
                    self.source.open_at(&checkpoint.location, checkpoint.rank)?
                }
                None => self.source.open()?,
            },
        };

        let interval = self.config.interval;
        let mut previous: Option<Timestamp> = None;

        loop {
            {
                let progress = self.progress.lock();
                if progress.disposed {
                    return Err(IndexError::Disposed);
                }
                if cancel.is_cancelled() {
                    let scanned = reader.rank();
                    slot.reader = Some(reader);
                    tracing::info!("Index build cancelled after {} events", scanned);
                    return Ok(BuildOutcome::Cancelled { scanned });
                }
                if target != BuildTarget::Unbounded && progress.covers(target) {
                    slot.reader = Some(reader);
                    return Ok(BuildOutcome::Reached {
                        scanned: progress.scanned,
                    });
                }
            }

            let location = reader.location();
            let rank = reader.rank();

            let Some(event) = reader.next_event()? else {
                self.collection.flush(rank, signature)?;

                let mut progress = self.progress.lock();
                progress.state = IndexState::Built;
                progress.scanned = progress.scanned.max(rank);
                progress.total = Some(rank);
                self.progress_changed.notify_all();

                tracing::info!(
                    "Index built: {} events, {} checkpoints in {:?}",
                    rank,
                    self.collection.len(),
                    started.elapsed()
                );
                return Ok(BuildOutcome::Complete { events: rank });
            };

            let timestamp = event.timestamp();
            if let Some(prev) = previous {
                if timestamp < prev {
                    return Err(IndexError::NonMonotonic(format!(
                        "event {} has timestamp {} after {}",
                        rank, timestamp, prev
                    )));
                }
            }
            previous = Some(timestamp);

            // Resuming at a checkpoint re-reads events that are already indexed
            if rank % interval == 0 && self.collection.last()?.map_or(true, |cp| cp.rank < rank) {
                self.collection
                    .insert(Checkpoint::new(timestamp, rank, location))?;
                tracing::trace!("Checkpoint at rank {} (ts {})", rank, timestamp);
            }

            let mut progress = self.progress.lock();
            if rank >= progress.scanned {
                progress.scanned = rank + 1;
                progress.last_timestamp = Some(timestamp);
            }
            if progress.waiters > 0 {
                self.progress_changed.notify_all();
            }
        }
    }

    fn record_failure(&self, error: &IndexError) {
        let mut progress = self.progress.lock();
        let rank = match error {
            IndexError::SourceRead { rank, .. } => *rank,
            _ => progress.scanned,
        };
        progress.failure = Some(BuildFailure {
            rank,
            message: error.to_string(),
        });
        progress.failures += 1;
        self.progress_changed.notify_all();

        tracing::warn!("Index build failed at rank {}: {}", rank, error);
    }

    /// Make sure the index answers `target`, building or waiting as needed
    fn ensure_indexed(&self, target: BuildTarget) -> IndexResult<()> {
        let mut progress = self.progress.lock();
        let failures_seen = progress.failures;

        loop {
            if progress.disposed {
                return Err(IndexError::Disposed);
            }
            if progress.failures > failures_seen {
                return Err(progress.failure_error());
            }
            if progress.covers(target) {
                return Ok(());
            }

            let needs_builder = matches!(progress.state, IndexState::Empty | IndexState::Invalid)
                || progress.failure.is_some();
            if needs_builder {
                if let Some(mut slot) = self.build.try_lock() {
                    drop(progress);
                    self.run_build(&mut slot, BuildTarget::Unbounded, &CancelToken::new())?;
                    drop(slot);
                    progress = self.progress.lock();
                    continue;
                }
            }

            progress.waiters += 1;
            self.progress_changed.wait_for(&mut progress, WAIT_SLICE);
            progress.waiters -= 1;
        }
    }

    /// Position a reader at the event with rank `rank`
    pub fn seek_rank(&self, rank: Rank) -> IndexResult<SeekOutcome<S::Reader>> {
        self.retry_on_corruption(|| {
            self.ensure_indexed(BuildTarget::Rank(rank))?;
            self.position(Some(SearchKey::Rank(rank)), |r, _| r >= rank)
        })
    }

    /// Position a reader at the first event with timestamp at or after `timestamp`
    pub fn seek(&self, timestamp: Timestamp) -> IndexResult<SeekOutcome<S::Reader>> {
        self.retry_on_corruption(|| {
            self.ensure_indexed(BuildTarget::Timestamp(timestamp))?;
            // Anchor strictly before the target so equal timestamps spanning a
            // checkpoint are not skipped
            let key = timestamp.checked_sub(1).map(SearchKey::Timestamp);
            self.position(key, |_, event| event.timestamp() >= timestamp)
        })
    }

    fn position(
        &self,
        key: Option<SearchKey>,
        reached: impl FnMut(Rank, &S::Event) -> bool,
    ) -> IndexResult<SeekOutcome<S::Reader>> {
        let anchor = match key {
            Some(key) => self.collection.floor(key)?,
            None => None,
        };
        let reader = match &anchor {
            Some(checkpoint) => self.source.open_at(&checkpoint.location, checkpoint.rank)?,
            None => self.source.open()?,
        };

        let outcome = match TraceCursor::position(reader, reached)? {
            Some(cursor) => {
                tracing::debug!(
                    "Seek anchored at rank {}, skipped {} events",
                    cursor.anchor_rank(),
                    cursor.skipped()
                );
                SeekOutcome::Positioned(cursor)
            }
            None => SeekOutcome::EndOfTrace,
        };
        Ok(outcome)
    }

    /// Run `op`, and once more after a rebuild if it hit a corrupt index
    fn retry_on_corruption<T>(&self, op: impl Fn() -> IndexResult<T>) -> IndexResult<T> {
        match op() {
            Err(e) if e.is_corruption() => {
                tracing::warn!("Corrupt index detected during seek, rebuilding: {}", e);
                self.invalidate()?;
                op()
            }
            result => result,
        }
    }

    /// Throw the index away; the next access rebuilds it
    pub fn invalidate(&self) -> IndexResult<()> {
        let mut slot = self.build.lock();
        self.check_live()?;

        slot.reader = None;
        self.collection.reset()?;

        let mut progress = self.progress.lock();
        progress.state = IndexState::Invalid;
        progress.scanned = 0;
        progress.last_timestamp = None;
        progress.total = None;
        progress.failure = None;
        self.progress_changed.notify_all();

        tracing::info!("Index invalidated");
        Ok(())
    }

    /// Invalidate the index if the trace changed since it was built
    ///
    /// Returns whether the index was invalidated.
    pub fn refresh(&self) -> IndexResult<bool> {
        self.check_live()?;
        let current = self.source.signature()?;

        let built_for = {
            let progress = self.progress.lock();
            match progress.state {
                IndexState::Empty | IndexState::Invalid => return Ok(false),
                IndexState::Building | IndexState::Built => progress.signature,
            }
        };

        if current == built_for {
            return Ok(false);
        }

        tracing::info!(
            "Trace changed ({} -> {}), invalidating index",
            describe(built_for.as_ref()),
            describe(current.as_ref())
        );
        self.invalidate()?;
        Ok(true)
    }

    /// Stop any build, drop readers and release the collection's resources
    ///
    /// Every later operation fails with [`IndexError::Disposed`]. Disposing
    /// twice is a no-op.
    pub fn dispose(&self) -> IndexResult<()> {
        {
            let mut progress = self.progress.lock();
            if progress.disposed {
                return Ok(());
            }
            progress.disposed = true;
            self.progress_changed.notify_all();
        }

        let mut slot = self.build.lock();
        slot.reader = None;
        self.collection.release()?;
        tracing::debug!("Index disposed");
        Ok(())
    }
}

fn describe(signature: Option<&TraceSignature>) -> String {
    signature.map_or_else(|| "no signature".to_string(), |s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::BTreeCollection;
    use crate::persist::{IndexFile, IndexHeader, HEADER_SIZE};
    use crate::trace::{MemoryEvent, MemoryTrace, MemoryTraceReader};
    use proptest::prelude::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn indexer(trace: MemoryTrace, interval: u64) -> CheckpointIndexer<MemoryTrace> {
        CheckpointIndexer::new(trace, IndexConfig::new(interval)).unwrap()
    }

    fn landed_rank<R: TraceReader>(outcome: SeekOutcome<R>) -> Option<Rank> {
        outcome.into_cursor().map(|cursor| cursor.rank())
    }

    /// Memory trace whose readers fire a cancel token after `after` events
    struct CancellingTrace {
        inner: MemoryTrace,
        token: CancelToken,
        after: Rank,
    }

    struct CancellingReader {
        inner: MemoryTraceReader,
        token: CancelToken,
        after: Rank,
    }

    impl TraceReader for CancellingReader {
        type Event = MemoryEvent;
        type Location = u64;

        fn location(&self) -> u64 {
            self.inner.location()
        }

        fn rank(&self) -> Rank {
            self.inner.rank()
        }

        fn next_event(&mut self) -> IndexResult<Option<MemoryEvent>> {
            let event = self.inner.next_event()?;
            if matches!(event, Some(e) if e.rank + 1 == self.after) {
                self.token.cancel();
            }
            Ok(event)
        }
    }

    impl CancellingTrace {
        fn wrap(&self, inner: MemoryTraceReader) -> CancellingReader {
            CancellingReader {
                inner,
                token: self.token.clone(),
                after: self.after,
            }
        }
    }

    impl TraceSource for CancellingTrace {
        type Event = MemoryEvent;
        type Location = u64;
        type Reader = CancellingReader;

        fn open(&self) -> IndexResult<CancellingReader> {
            Ok(self.wrap(self.inner.open()?))
        }

        fn open_at(&self, location: &u64, rank: Rank) -> IndexResult<CancellingReader> {
            Ok(self.wrap(self.inner.open_at(location, rank)?))
        }

        fn signature(&self) -> IndexResult<Option<TraceSignature>> {
            self.inner.signature()
        }
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = CheckpointIndexer::new(MemoryTrace::sequential(10, 1), IndexConfig::new(0))
            .err()
            .unwrap();
        assert!(matches!(err, IndexError::Configuration(_)));
    }

    #[test]
    fn test_checkpoints_every_interval() {
        let index = indexer(MemoryTrace::sequential(10_000, 1), 1000);

        let outcome = index.build_index(BuildTarget::Unbounded, &CancelToken::new()).unwrap();
        assert_eq!(outcome, BuildOutcome::Complete { events: 10_000 });
        assert_eq!(index.state(), IndexState::Built);
        assert_eq!(index.size(), Some(10_000));

        let ranks: Vec<Rank> = index.checkpoints().unwrap().iter().map(|cp| cp.rank).collect();
        assert_eq!(ranks, (0..10).map(|i| i * 1000).collect::<Vec<_>>());

        // Checkpoint location is where the checkpointed event is read next
        for cp in index.checkpoints().unwrap() {
            assert_eq!(cp.location, cp.rank);
            assert_eq!(cp.timestamp, cp.rank as i64);
        }
    }

    #[test]
    fn test_seek_rank_scans_from_nearest_checkpoint() {
        let index = indexer(MemoryTrace::sequential(10_000, 1), 1000);

        let cursor = index.seek_rank(9500).unwrap().into_cursor().unwrap();
        assert_eq!(cursor.anchor_rank(), 9000);
        assert_eq!(cursor.skipped(), 500);
        assert_eq!(cursor.rank(), 9500);
        assert_eq!(index.state(), IndexState::Built);
    }

    #[test]
    fn test_seek_rank_bounds() {
        let index = indexer(MemoryTrace::sequential(100, 5), 10);

        assert_eq!(landed_rank(index.seek_rank(0).unwrap()), Some(0));
        assert_eq!(landed_rank(index.seek_rank(99).unwrap()), Some(99));
        assert!(index.seek_rank(100).unwrap().is_end_of_trace());
        assert!(index.seek_rank(u64::MAX).unwrap().is_end_of_trace());
    }

    #[test]
    fn test_seek_timestamp_lands_on_first_equal() {
        let trace = MemoryTrace::new(vec![0, 1, 1, 3, 3, 3, 3, 3, 3, 7, 8]);
        let index = indexer(trace, 2);

        assert_eq!(landed_rank(index.seek(-5).unwrap()), Some(0));
        assert_eq!(landed_rank(index.seek(0).unwrap()), Some(0));
        assert_eq!(landed_rank(index.seek(1).unwrap()), Some(1));
        assert_eq!(landed_rank(index.seek(2).unwrap()), Some(3));
        assert_eq!(landed_rank(index.seek(3).unwrap()), Some(3));
        assert_eq!(landed_rank(index.seek(8).unwrap()), Some(10));
        assert!(index.seek(9).unwrap().is_end_of_trace());
        assert_eq!(landed_rank(index.seek(i64::MIN).unwrap()), Some(0));
    }

    #[test]
    fn test_seek_is_idempotent() {
        let index = indexer(MemoryTrace::sequential(5000, 3), 128);

        let read = |t| -> Vec<(Rank, i64)> {
            index
                .seek(t)
                .unwrap()
                .into_cursor()
                .unwrap()
                .take(50)
                .map(|item| {
                    let (rank, event) = item.unwrap();
                    (rank, event.timestamp)
                })
                .collect()
        };

        let first = read(7001);
        assert_eq!(first.len(), 50);
        assert_eq!(first[0], (2334, 7002));
        assert_eq!(first, read(7001));
    }

    #[test]
    fn test_empty_trace() {
        let index = indexer(MemoryTrace::new(Vec::new()), 10);

        assert!(index.seek(0).unwrap().is_end_of_trace());
        assert!(index.seek_rank(0).unwrap().is_end_of_trace());
        assert_eq!(index.size(), Some(0));
        assert!(index.checkpoints().unwrap().is_empty());
    }

    #[test]
    fn test_size_unknown_until_built() {
        let index = indexer(MemoryTrace::sequential(100, 1), 10);
        assert_eq!(index.size(), None);
        assert_eq!(index.state(), IndexState::Empty);

        let outcome = index.build_index(BuildTarget::Rank(50), &CancelToken::new()).unwrap();
        assert_eq!(outcome, BuildOutcome::Reached { scanned: 51 });
        assert_eq!(index.state(), IndexState::Building);
        assert_eq!(index.size(), None);

        index.build_index(BuildTarget::Unbounded, &CancelToken::new()).unwrap();
        assert_eq!(index.size(), Some(100));
    }

    #[test]
    fn test_bounded_build_by_timestamp() {
        let index = indexer(MemoryTrace::sequential(1000, 10), 100);

        let outcome = index
            .build_index(BuildTarget::Timestamp(2500), &CancelToken::new())
            .unwrap();
        assert_eq!(outcome, BuildOutcome::Reached { scanned: 251 });

        let progress = index.progress();
        assert_eq!(progress.last_timestamp, Some(2500));
        assert_eq!(progress.checkpoints, 3);

        // Resumes the parked reader rather than starting over
        let outcome = index.build_index(BuildTarget::Unbounded, &CancelToken::new()).unwrap();
        assert_eq!(outcome, BuildOutcome::Complete { events: 1000 });
        assert_eq!(index.checkpoint_count(), 10);
    }

    #[test]
    fn test_cancelled_build_serves_prefix_and_blocks_beyond() {
        let token = CancelToken::new();
        let trace = CancellingTrace {
            inner: MemoryTrace::sequential(10_000, 1),
            token: token.clone(),
            after: 3000,
        };
        let index = Arc::new(CheckpointIndexer::new(trace, IndexConfig::new(1000)).unwrap());

        let outcome = index.build_index(BuildTarget::Unbounded, &token).unwrap();
        assert_eq!(outcome, BuildOutcome::Cancelled { scanned: 3000 });
        assert_eq!(index.state(), IndexState::Building);
        assert!(index.checkpoints().unwrap().iter().all(|cp| cp.rank <= 3000));

        assert_eq!(landed_rank(index.seek_rank(2000).unwrap()), Some(2000));

        let waiter = {
            let index = Arc::clone(&index);
            std::thread::spawn(move || landed_rank(index.seek_rank(8000).unwrap()))
        };

        std::thread::sleep(Duration::from_millis(200));
        assert!(!waiter.is_finished());

        let outcome = index.build_index(BuildTarget::Unbounded, &CancelToken::new()).unwrap();
        assert_eq!(outcome, BuildOutcome::Complete { events: 10_000 });
        assert_eq!(waiter.join().unwrap(), Some(8000));
        assert_eq!(index.checkpoint_count(), 10);
    }

    #[test]
    fn test_source_failure_propagates_and_recovers() {
        let trace = MemoryTrace::sequential(10_000, 1);
        trace.fail_at(5000);
        let index = indexer(trace.clone(), 1000);

        let err = index.build_index(BuildTarget::Unbounded, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, IndexError::SourceRead { rank: 5000, .. }));
        assert_eq!(index.state(), IndexState::Building);

        // The prefix stays usable
        assert_eq!(landed_rank(index.seek_rank(1234).unwrap()), Some(1234));

        // Beyond the prefix the seek retries the build and fails again
        assert!(index.seek_rank(6000).is_err());

        trace.clear_failure();
        assert_eq!(landed_rank(index.seek_rank(6000).unwrap()), Some(6000));
        assert_eq!(index.state(), IndexState::Built);

        let ranks: Vec<Rank> = index.checkpoints().unwrap().iter().map(|cp| cp.rank).collect();
        assert_eq!(ranks, (0..10).map(|i| i * 1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_waiter_receives_build_failure() {
        let trace = MemoryTrace::sequential(10_000, 1);
        let index = Arc::new(indexer(trace.clone(), 1000));

        index.build_index(BuildTarget::Rank(3000), &CancelToken::new()).unwrap();
        trace.fail_at(7000);

        let waiter = {
            let index = Arc::clone(&index);
            std::thread::spawn(move || index.seek_rank(8000).map(|o| o.is_end_of_trace()))
        };
        std::thread::sleep(Duration::from_millis(100));

        assert!(index.build_index(BuildTarget::Unbounded, &CancelToken::new()).is_err());
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, IndexError::SourceRead { rank: 7000, .. }));
    }

    #[test]
    fn test_backwards_timestamp_fails_build() {
        let index = indexer(MemoryTrace::new(vec![0, 5, 3, 9]), 1);

        let err = index.build_index(BuildTarget::Unbounded, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, IndexError::NonMonotonic(_)));
        assert_eq!(index.checkpoint_count(), 2);
    }

    #[test]
    fn test_refresh_invalidates_on_change() {
        let trace = MemoryTrace::sequential(500, 1);
        let index = indexer(trace.clone(), 100);
        index.build_index(BuildTarget::Unbounded, &CancelToken::new()).unwrap();

        assert!(!index.refresh().unwrap());
        assert_eq!(index.state(), IndexState::Built);

        trace.set_signature(Some(TraceSignature::new(501, 1, 0)));
        assert!(index.refresh().unwrap());
        assert_eq!(index.state(), IndexState::Invalid);
        assert_eq!(index.checkpoint_count(), 0);

        // Next access rebuilds
        assert_eq!(landed_rank(index.seek_rank(250).unwrap()), Some(250));
        assert_eq!(index.state(), IndexState::Built);
        assert_eq!(index.signature().unwrap().len, 501);
    }

    #[test]
    fn test_dispose() {
        let index = indexer(MemoryTrace::sequential(100, 1), 10);
        index.seek_rank(10).unwrap();

        index.dispose().unwrap();
        index.dispose().unwrap();

        assert!(matches!(index.seek_rank(10), Err(IndexError::Disposed)));
        assert!(matches!(index.checkpoints(), Err(IndexError::Disposed)));
        assert!(matches!(
            index.build_index(BuildTarget::Unbounded, &CancelToken::new()),
            Err(IndexError::Disposed)
        ));
        assert_eq!(index.size(), None);
    }

    #[test]
    fn test_persistent_index_is_reused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.tmix");
        let trace = MemoryTrace::sequential(5000, 2);
        let config = IndexConfig::new(100).with_branching_factor(3);

        let expected = {
            let index = CheckpointIndexer::persistent(trace.clone(), &path, config.clone()).unwrap();
            assert!(index.is_persistent());
            assert_eq!(index.state(), IndexState::Empty);
            index.build_index(BuildTarget::Unbounded, &CancelToken::new()).unwrap();
            index.checkpoints().unwrap()
        };

        let index = CheckpointIndexer::persistent(trace.clone(), &path, config.clone()).unwrap();
        assert_eq!(index.state(), IndexState::Built);
        assert_eq!(index.size(), Some(5000));
        assert_eq!(index.checkpoints().unwrap(), expected);
        assert_eq!(landed_rank(index.seek(4321).unwrap()), Some(2161));
        drop(index);

        // A modified trace starts over
        trace.set_signature(Some(TraceSignature::new(1, 2, 3)));
        let index = CheckpointIndexer::persistent(trace, &path, config).unwrap();
        assert_eq!(index.state(), IndexState::Empty);
    }

    #[test]
    fn test_corrupt_node_during_seek_triggers_rebuild() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.tmix");
        let trace = MemoryTrace::sequential(10_000, 1);
        let config = IndexConfig::new(10)
            .with_branching_factor(2)
            .with_node_cache_capacity(1);

        {
            let index = CheckpointIndexer::persistent(trace.clone(), &path, config.clone()).unwrap();
            index.build_index(BuildTarget::Unbounded, &CancelToken::new()).unwrap();
        }

        let index = CheckpointIndexer::persistent(trace, &path, config).unwrap();
        assert_eq!(index.state(), IndexState::Built);

        {
            use std::io::{Seek, SeekFrom, Write};
            let mut raw = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            raw.seek(SeekFrom::Start(HEADER_SIZE as u64 + 20)).unwrap();
            raw.write_all(&[0xEE; 8]).unwrap();
        }

        assert_eq!(landed_rank(index.seek_rank(5).unwrap()), Some(5));
        assert_eq!(index.state(), IndexState::Built);
        assert_eq!(index.checkpoint_count(), 1000);
    }

    #[test]
    fn test_btree_collection_behind_indexer() {
        let dir = tempdir().unwrap();
        let header = IndexHeader::new(8, 7, 2, None);
        let file = Arc::new(IndexFile::create(dir.path().join("t.tmix"), header).unwrap());
        let tree = BTreeCollection::<u64>::create(file, 2, 8).unwrap();

        let config = IndexConfig::new(7).with_branching_factor(2);
        let index =
            CheckpointIndexer::with_collection(MemoryTrace::sequential(700, 1), Box::new(tree), config)
                .unwrap();

        for rank in [0u64, 6, 7, 350, 699] {
            assert_eq!(landed_rank(index.seek_rank(rank).unwrap()), Some(rank));
        }
        assert_eq!(index.checkpoint_count(), 100);
    }

    fn timestamps_from(deltas: &[i64]) -> Vec<i64> {
        deltas
            .iter()
            .scan(0i64, |acc, d| {
                *acc += d;
                Some(*acc)
            })
            .collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32,
            .. ProptestConfig::default()
        })]

        #[test]
        fn seek_rank_lands_on_every_rank(
            deltas in prop::collection::vec(0i64..3, 0..300),
            interval in 1u64..40,
        ) {
            let timestamps = timestamps_from(&deltas);
            let count = timestamps.len() as u64;
            let index = indexer(MemoryTrace::new(timestamps), interval);

            for rank in 0..count {
                prop_assert_eq!(landed_rank(index.seek_rank(rank).unwrap()), Some(rank));
            }
            prop_assert!(index.seek_rank(count).unwrap().is_end_of_trace());

            let checkpoints = index.checkpoints().unwrap();
            prop_assert!(checkpoints.windows(2).all(|w| w[0].rank < w[1].rank));
            prop_assert!(checkpoints.iter().all(|cp| cp.rank % interval == 0));
        }

        #[test]
        fn seek_lands_on_first_event_at_or_after(
            deltas in prop::collection::vec(0i64..4, 1..300),
            interval in 1u64..40,
        ) {
            let timestamps = timestamps_from(&deltas);
            let last = *timestamps.last().unwrap();
            let index = indexer(MemoryTrace::new(timestamps.clone()), interval);

            for t in -1..=last + 1 {
                let expected = timestamps.partition_point(|&ts| ts < t);
                let landed = landed_rank(index.seek(t).unwrap());
                if expected == timestamps.len() {
                    prop_assert_eq!(landed, None);
                } else {
                    prop_assert_eq!(landed, Some(expected as u64));
                }
            }
        }

        #[test]
        fn btree_seeks_match_linear_scan(
            deltas in prop::collection::vec(0i64..3, 1..200),
            interval in 1u64..8,
            branching in 2usize..4,
        ) {
            let dir = tempdir().unwrap();
            let header = IndexHeader::new(8, interval, branching as u32, None);
            let file = Arc::new(IndexFile::create(dir.path().join("t.tmix"), header).unwrap());
            let tree = BTreeCollection::<u64>::create(file, branching, 4).unwrap();

            let timestamps = timestamps_from(&deltas);
            let count = timestamps.len() as u64;
            let last = *timestamps.last().unwrap();
            let config = IndexConfig::new(interval).with_branching_factor(branching);
            let index = CheckpointIndexer::with_collection(
                MemoryTrace::new(timestamps.clone()),
                Box::new(tree),
                config,
            )
            .unwrap();

            for rank in 0..count {
                prop_assert_eq!(landed_rank(index.seek_rank(rank).unwrap()), Some(rank));
            }
            prop_assert!(index.seek_rank(count).unwrap().is_end_of_trace());

            for t in -1..=last + 1 {
                let expected = timestamps.partition_point(|&ts| ts < t);
                let landed = landed_rank(index.seek(t).unwrap());
                if expected == timestamps.len() {
                    prop_assert_eq!(landed, None);
                } else {
                    prop_assert_eq!(landed, Some(expected as u64));
                }
            }
        }
    }
}
