//! Persistence layer for disk-backed indexes
//!
//! One index file per trace:
//!
//! - **header**: format version, parameters, validation signature, tree root
//! - **file**: shared handle through which nodes and header are written
//!
//! # Reuse decision
//!
//! ```text
//! load_or_create(path, signature)
//!   ├─ no file                         → create, Empty
//!   ├─ unreadable / corrupt header     → delete, create, Empty
//!   ├─ version / params / sig mismatch → delete, create, Empty
//!   ├─ incomplete (build interrupted)  → delete, create, Empty
//!   ├─ tree verification fails        → delete, create, Empty
//!   └─ otherwise                       → reopen, Built
//! ```
//!
//! A stored index is never a reason to fail: anything wrong with it is a
//! cache miss.

mod file;
mod header;

pub use file::IndexFile;
pub use header::{IndexHeader, HEADER_SIZE, INDEX_MAGIC, INDEX_VERSION};

use crate::checkpoint::BTreeCollection;
use crate::error::{IndexError, IndexResult};
use crate::indexer::IndexState;
use crate::trace::{TraceLocation, TraceSignature};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File extension for index files
pub const INDEX_EXTENSION: &str = "tmix";

/// Parameters an index file must match to be reused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexParams {
    pub interval: u64,
    pub branching: usize,
    pub cache_capacity: usize,
}

/// Result of [`load_or_create`]
pub struct LoadedIndex<L> {
    pub collection: BTreeCollection<L>,
    pub state: IndexState,
    /// Events covered by a reused index (0 for a fresh one)
    pub event_count: u64,
}

/// Open a stored index for reuse, or start a fresh one
pub fn load_or_create<L: TraceLocation>(
    path: &Path,
    signature: Option<TraceSignature>,
    params: IndexParams,
) -> IndexResult<LoadedIndex<L>> {
    if path.exists() {
        match try_reuse::<L>(path, signature.as_ref(), params) {
            Ok(Some(loaded)) => {
                tracing::info!(
                    "Reusing index {:?}: {} checkpoints over {} events",
                    path,
                    loaded.collection.meta().len,
                    loaded.event_count
                );
                return Ok(loaded);
            }
            Ok(None) => {}
            Err(e) if e.is_corruption() => {
                tracing::warn!("Discarding corrupt index {:?}: {}", path, e);
            }
            Err(e) => return Err(e),
        }
        remove_index(path)?;
    }

    let header = IndexHeader::new(
        L::ENCODED_LEN as u16,
        params.interval,
        params.branching as u32,
        signature,
    );
    let file = Arc::new(IndexFile::create(path, header)?);
    let collection = BTreeCollection::create(file, params.branching, params.cache_capacity)?;
    tracing::debug!("Created empty index {:?}", path);

    Ok(LoadedIndex {
        collection,
        state: IndexState::Empty,
        event_count: 0,
    })
}

/// `Ok(None)` when the stored index is stale, `Err(CorruptIndex)` when broken
fn try_reuse<L: TraceLocation>(
    path: &Path,
    signature: Option<&TraceSignature>,
    params: IndexParams,
) -> IndexResult<Option<LoadedIndex<L>>> {
    let file = IndexFile::open(path)?;
    let header = file.header();

    if let Some(reason) = stale_reason::<L>(&header, signature, params) {
        tracing::info!("Rebuilding index {:?}: {}", path, reason);
        return Ok(None);
    }

    let collection = BTreeCollection::open(Arc::new(file), params.branching, params.cache_capacity)?;
    Ok(Some(LoadedIndex {
        collection,
        state: IndexState::Built,
        event_count: header.event_count,
    }))
}

/// Why a well-formed stored index cannot be reused, if it cannot
fn stale_reason<L: TraceLocation>(
    header: &IndexHeader,
    signature: Option<&TraceSignature>,
    params: IndexParams,
) -> Option<String> {
    if header.version != INDEX_VERSION {
        return Some(format!(
            "format version {} (current {})",
            header.version, INDEX_VERSION
        ));
    }
    if header.location_len as usize != L::ENCODED_LEN {
        return Some(format!(
            "location width {} (expected {})",
            header.location_len,
            L::ENCODED_LEN
        ));
    }
    if header.interval != params.interval {
        return Some(format!(
            "interval {} (configured {})",
            header.interval, params.interval
        ));
    }
    if header.branching as usize != params.branching {
        return Some(format!(
            "branching factor {} (configured {})",
            header.branching, params.branching
        ));
    }
    if !header.complete {
        return Some("previous build did not complete".to_string());
    }
    match (header.signature.as_ref(), signature) {
        (Some(stored), Some(current)) if stored == current => None,
        (Some(stored), Some(current)) => Some(format!(
            "trace changed ({} -> {})",
            stored, current
        )),
        _ => Some("trace has no validation signature".to_string()),
    }
}

/// Delete a stored index file if present
pub fn remove_index(path: &Path) -> IndexResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(IndexError::Io(e)),
    }
}

/// Index file path for a trace file inside `index_dir`
///
/// The name combines the trace's file stem with a hash of its full path so
/// traces with the same name in different directories do not collide.
pub fn index_path_for(index_dir: &Path, trace_path: &Path) -> PathBuf {
    let canonical = trace_path
        .canonicalize()
        .unwrap_or_else(|_| trace_path.to_path_buf());
    let hash = crc32fast::hash(canonical.to_string_lossy().as_bytes());
    let stem = trace_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("trace");

    index_dir.join(format!("{}-{:08x}.{}", stem, hash, INDEX_EXTENSION))
}
