//! # tracemark
//!
//! Sparse checkpoint index for huge, append-only, time-ordered event
//! traces. Seek to any rank or timestamp without re-scanning the trace and
//! without holding it in memory.
//!
//! ## Features
//!
//! - **Incremental builds**: seeks are served while the trace is still
//!   being indexed
//! - **Two collections**: in-memory array or on-disk B-tree with
//!   fixed-size, checksummed nodes
//! - **Persistence**: stored indexes are reused across runs while the
//!   trace is unchanged and silently rebuilt otherwise
//! - **Cancellation**: builds stop between events and resume later
//!
//! ## Modules
//!
//! - [`trace`]: trace source interfaces plus file and memory traces
//! - [`checkpoint`]: checkpoints and checkpoint collections
//! - [`indexer`]: build state machine and seeks
//! - [`persist`]: index file format and reuse decisions
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tracemark::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let trace = FileTrace::open("run.trace")?;
//!     let index = CheckpointIndexer::persistent(
//!         trace,
//!         std::path::Path::new("run.tmix"),
//!         IndexConfig::new(1000),
//!     )?;
//!
//!     // Builds the index on first use
//!     if let Some(cursor) = index.seek(1_700_000_000)?.into_cursor() {
//!         for item in cursor.take(10) {
//!             let (rank, record) = item?;
//!             println!("{} {}", rank, record.timestamp);
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod indexer;
pub mod logging;
pub mod persist;
pub mod trace;

pub use checkpoint::{
    ArrayCollection, BTreeCollection, Checkpoint, CheckpointCollection, SearchKey,
};

pub use error::{IndexError, IndexResult};

pub use indexer::{
    AsyncIndexer, BuildOutcome, BuildProgress, BuildTarget, CancelToken, CheckpointIndexer,
    IndexConfig, IndexState, SeekOutcome, TraceCursor,
};

pub use persist::{index_path_for, load_or_create, IndexParams, LoadedIndex};

pub use trace::{
    import_csv, FileTrace, MemoryTrace, Rank, Timestamp, TraceEvent, TraceLocation, TraceReader,
    TraceRecord, TraceSignature, TraceSource, TraceWriter,
};

pub use config::{Config, ConfigError, IndexSettings, LoggingConfig};
