//! Async facade over a checkpoint indexer
//!
//! Builds and seeks block on trace I/O, so they run on tokio's blocking
//! pool. The indexer itself is shared through an `Arc`, letting a host
//! keep a build running in the background while serving seeks.

use crate::error::{IndexError, IndexResult};
use crate::indexer::{BuildOutcome, BuildTarget, CancelToken, CheckpointIndexer, SeekOutcome};
use crate::trace::{Rank, Timestamp, TraceSource};
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};

/// Checkpoint indexer usable from async code
pub struct AsyncIndexer<S: TraceSource> {
    inner: Arc<CheckpointIndexer<S>>,
}

impl<S: TraceSource> Clone for AsyncIndexer<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> AsyncIndexer<S>
where
    S: TraceSource + 'static,
    S::Reader: 'static,
    S::Event: 'static,
{
    pub fn new(indexer: CheckpointIndexer<S>) -> Self {
        Self {
            inner: Arc::new(indexer),
        }
    }

    pub fn from_arc(inner: Arc<CheckpointIndexer<S>>) -> Self {
        Self { inner }
    }

    /// The shared synchronous indexer
    pub fn indexer(&self) -> &Arc<CheckpointIndexer<S>> {
        &self.inner
    }

    /// Start a build on the blocking pool
    pub fn spawn_build(
        &self,
        target: BuildTarget,
        cancel: CancelToken,
    ) -> JoinHandle<IndexResult<BuildOutcome>> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.build_index(target, &cancel))
    }

    /// Build and wait for the result
    pub async fn build(&self, target: BuildTarget, cancel: CancelToken) -> IndexResult<BuildOutcome> {
        self.spawn_build(target, cancel).await.map_err(join_error)?
    }

    pub async fn seek(&self, timestamp: Timestamp) -> IndexResult<SeekOutcome<S::Reader>> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.seek(timestamp))
            .await
            .map_err(join_error)?
    }

    pub async fn seek_rank(&self, rank: Rank) -> IndexResult<SeekOutcome<S::Reader>> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.seek_rank(rank))
            .await
            .map_err(join_error)?
    }

    pub async fn dispose(&self) -> IndexResult<()> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.dispose())
            .await
            .map_err(join_error)?
    }
}

fn join_error(err: JoinError) -> IndexError {
    IndexError::Task(err.to_string())
}
