//! Trace sources
//!
//! The index never parses events itself. It talks to a trace through the
//! narrow interfaces defined here:
//!
//! - **TraceSource**: opens sequential readers, either at rank 0 or resumed
//!   at a previously observed location, and reports a validation signature
//! - **TraceReader**: yields events one by one and reports the location and
//!   rank of the *next* event
//! - **TraceLocation**: opaque resumable position with a fixed-width encoding
//!
//! Two sources ship with the crate:
//!
//! - [`FileTrace`]: length-prefixed, checksummed records in a single file
//! - [`MemoryTrace`]: a `Vec`-backed trace for tests and embedding

mod file;
mod memory;

pub use file::{import_csv, FileTrace, FileTraceReader, TraceRecord, TraceWriter};
pub use memory::{MemoryEvent, MemoryTrace, MemoryTraceReader};

use crate::error::IndexResult;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Event timestamp (trace time units, typically nanoseconds)
pub type Timestamp = i64;

/// Zero-based ordinal position of an event in the trace
pub type Rank = u64;

/// Opaque position token understood only by the trace source
///
/// Locations must order consistently with rank order. They are stored
/// inside fixed-size index nodes, so every location encodes to exactly
/// `ENCODED_LEN` bytes.
pub trait TraceLocation: Clone + Ord + Debug + Send + Sync + 'static {
    /// Width of the binary encoding in bytes
    const ENCODED_LEN: usize;

    /// Write the location into `buf` (exactly `ENCODED_LEN` bytes)
    fn encode(&self, buf: &mut [u8]);

    /// Read a location back from `buf` (exactly `ENCODED_LEN` bytes)
    fn decode(buf: &[u8]) -> Self;
}

impl TraceLocation for u64 {
    const ENCODED_LEN: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&buf[..8]);
        u64::from_le_bytes(bytes)
    }
}

/// A single trace event as seen by the index
pub trait TraceEvent {
    fn timestamp(&self) -> Timestamp;
}

/// Sequential, read-once reader over a trace
pub trait TraceReader: Send {
    type Event: TraceEvent;
    type Location: TraceLocation;

    /// Location of the next event this reader will return
    fn location(&self) -> Self::Location;

    /// Rank of the next event this reader will return
    fn rank(&self) -> Rank;

    /// Read the next event, `None` at end of data
    fn next_event(&mut self) -> IndexResult<Option<Self::Event>>;
}

/// A trace that can be read sequentially and resumed at a location
pub trait TraceSource: Send + Sync {
    type Event: TraceEvent + Send;
    type Location: TraceLocation;
    type Reader: TraceReader<Event = Self::Event, Location = Self::Location>;

    /// Open a reader positioned at rank 0
    fn open(&self) -> IndexResult<Self::Reader>;

    /// Open a reader positioned at `location`, whose next event has `rank`
    fn open_at(&self, location: &Self::Location, rank: Rank) -> IndexResult<Self::Reader>;

    /// External identity of the trace, used to validate persisted indexes
    ///
    /// Sources that cannot describe themselves return `None`; their
    /// persisted indexes are never reused.
    fn signature(&self) -> IndexResult<Option<TraceSignature>>;
}

/// Fingerprint of a trace's external identity (size + modification time)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSignature {
    /// Size of the underlying resource in bytes (or events)
    pub len: u64,
    /// Modification time, seconds since the Unix epoch
    pub modified_secs: i64,
    /// Sub-second part of the modification time
    pub modified_nanos: u32,
}

impl TraceSignature {
    pub fn new(len: u64, modified_secs: i64, modified_nanos: u32) -> Self {
        Self {
            len,
            modified_secs,
            modified_nanos,
        }
    }

    /// Compute the signature of a file from its metadata
    pub fn of_file(path: &Path) -> IndexResult<Self> {
        let meta = std::fs::metadata(path)?;
        let (modified_secs, modified_nanos) = match meta.modified() {
            Ok(time) => match time.duration_since(UNIX_EPOCH) {
                Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
                Err(e) => {
                    let d = e.duration();
                    (-(d.as_secs() as i64), d.subsec_nanos())
                }
            },
            // Platforms without mtime fall back to size only
            Err(_) => (0, 0),
        };

        Ok(Self {
            len: meta.len(),
            modified_secs,
            modified_nanos,
        })
    }

    /// Modification time as a UTC datetime, if representable
    pub fn modified(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp(self.modified_secs, self.modified_nanos)
    }
}

impl std::fmt::Display for TraceSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.modified() {
            Some(ts) => write!(f, "{} bytes, modified {}", self.len, ts.to_rfc3339()),
            None => write!(f, "{} bytes", self.len),
        }
    }
}
