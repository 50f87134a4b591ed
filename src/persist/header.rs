//! Index file header
//!
//! Layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ HEADER (128 bytes)                      │
//! │   magic: [u8; 4] = "TMIX"               │
//! │   version: u16                          │
//! │   location_len: u16                     │
//! │   interval: u64                         │
//! │   branching: u32                        │
//! │   flags: u8 (complete, has_signature)   │
//! │   reserved: [u8; 3]                     │
//! │   trace_len: u64                        │
//! │   modified_secs: i64                    │
//! │   modified_nanos: u32                   │
//! │   root_offset: u64 (0 = empty tree)     │
//! │   checkpoint_count: u64                 │
//! │   height: u32                           │
//! │   next_offset: u64                      │
//! │   event_count: u64                      │
//! │   reserved: [u8; 44]                    │
//! │   checksum: u32                         │
//! ├─────────────────────────────────────────┤
//! │ NODES (fixed-size B-tree nodes)         │
//! └─────────────────────────────────────────┘
//! ```

use crate::error::{IndexError, IndexResult};
use crate::trace::TraceSignature;

/// Magic bytes for index file identification
pub const INDEX_MAGIC: [u8; 4] = *b"TMIX";

/// Current index format version
pub const INDEX_VERSION: u16 = 1;

/// Header size in bytes; the node region starts right after it
pub const HEADER_SIZE: usize = 128;

const FLAG_COMPLETE: u8 = 0b01;
const FLAG_SIGNATURE: u8 = 0b10;

/// Index file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHeader {
    /// Format version
    pub version: u16,
    /// Encoded width of one trace location
    pub location_len: u16,
    /// Events between checkpoints
    pub interval: u64,
    /// B-tree branching factor
    pub branching: u32,
    /// Set once a full scan has been flushed
    pub complete: bool,
    /// Identity of the trace this index was built for
    pub signature: Option<TraceSignature>,
    /// Offset of the root node, 0 when the tree is empty
    pub root_offset: u64,
    /// Number of checkpoints in the tree
    pub checkpoint_count: u64,
    /// Tree height (0 when empty)
    pub height: u32,
    /// End of the node region
    pub next_offset: u64,
    /// Total events covered by the index
    pub event_count: u64,
}

impl IndexHeader {
    /// Create a header for a fresh, empty index
    pub fn new(
        location_len: u16,
        interval: u64,
        branching: u32,
        signature: Option<TraceSignature>,
    ) -> Self {
        Self {
            version: INDEX_VERSION,
            location_len,
            interval,
            branching,
            complete: false,
            signature,
            root_offset: 0,
            checkpoint_count: 0,
            height: 0,
            next_offset: HEADER_SIZE as u64,
            event_count: 0,
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];

        buf[0..4].copy_from_slice(&INDEX_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..8].copy_from_slice(&self.location_len.to_le_bytes());
        buf[8..16].copy_from_slice(&self.interval.to_le_bytes());
        buf[16..20].copy_from_slice(&self.branching.to_le_bytes());

        let mut flags = 0u8;
        if self.complete {
            flags |= FLAG_COMPLETE;
        }
        if let Some(sig) = &self.signature {
            flags |= FLAG_SIGNATURE;
            buf[24..32].copy_from_slice(&sig.len.to_le_bytes());
            buf[32..40].copy_from_slice(&sig.modified_secs.to_le_bytes());
            buf[40..44].copy_from_slice(&sig.modified_nanos.to_le_bytes());
        }
        buf[20] = flags;

        buf[44..52].copy_from_slice(&self.root_offset.to_le_bytes());
        buf[52..60].copy_from_slice(&self.checkpoint_count.to_le_bytes());
        buf[60..64].copy_from_slice(&self.height.to_le_bytes());
        buf[64..72].copy_from_slice(&self.next_offset.to_le_bytes());
        buf[72..80].copy_from_slice(&self.event_count.to_le_bytes());
        // bytes 80-123 reserved

        let checksum = crc32fast::hash(&buf[0..124]);
        buf[124..128].copy_from_slice(&checksum.to_le_bytes());

        buf
    }

    /// Parse header from bytes
    ///
    /// Versions other than [`INDEX_VERSION`] are accepted here; deciding
    /// whether to reuse the index is the caller's job.
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> IndexResult<Self> {
        let stored_checksum = u32::from_le_bytes([buf[124], buf[125], buf[126], buf[127]]);
        let computed_checksum = crc32fast::hash(&buf[0..124]);

        if stored_checksum != computed_checksum {
            return Err(IndexError::CorruptIndex(format!(
                "Header checksum mismatch: stored={}, computed={}",
                stored_checksum, computed_checksum
            )));
        }

        if buf[0..4] != INDEX_MAGIC {
            return Err(IndexError::CorruptIndex(format!(
                "Invalid magic: {:?}",
                &buf[0..4]
            )));
        }

        let flags = buf[20];
        let signature = if flags & FLAG_SIGNATURE != 0 {
            Some(TraceSignature {
                len: le_u64(&buf[24..32]),
                modified_secs: le_u64(&buf[32..40]) as i64,
                modified_nanos: u32::from_le_bytes([buf[40], buf[41], buf[42], buf[43]]),
            })
        } else {
            None
        };

        Ok(Self {
            version: u16::from_le_bytes([buf[4], buf[5]]),
            location_len: u16::from_le_bytes([buf[6], buf[7]]),
            interval: le_u64(&buf[8..16]),
            branching: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
            complete: flags & FLAG_COMPLETE != 0,
            signature,
            root_offset: le_u64(&buf[44..52]),
            checkpoint_count: le_u64(&buf[52..60]),
            height: u32::from_le_bytes([buf[60], buf[61], buf[62], buf[63]]),
            next_offset: le_u64(&buf[64..72]),
            event_count: le_u64(&buf[72..80]),
        })
    }
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}
