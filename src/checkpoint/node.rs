//! Fixed-size B-tree node format
//!
//! Layout for branching factor `b` and location width `L`:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ HEADER (8 bytes)                        │
//! │   kind: u8 (0 = leaf, 1 = internal)     │
//! │   key_count: u16                        │
//! │   tag: u8 = 0xB7                        │
//! │   reserved: [u8; 4]                     │
//! ├─────────────────────────────────────────┤
//! │ KEYS ((2b-1) slots)                     │
//! │   rank: u64                             │
//! │   timestamp: i64                        │
//! │   location: [u8; L]                     │
//! ├─────────────────────────────────────────┤
//! │ CHILDREN (2b slots, zero in leaves)     │
//! │   offset: u64                           │
//! │   subtree_count: u64                    │
//! ├─────────────────────────────────────────┤
//! │ checksum: u32 (CRC32 of all above)      │
//! └─────────────────────────────────────────┘
//! ```

use crate::checkpoint::Checkpoint;
use crate::error::{IndexError, IndexResult};
use crate::trace::TraceLocation;

const NODE_HEADER_SIZE: usize = 8;
const NODE_TAG: u8 = 0xB7;
const KEY_FIXED_SIZE: usize = 16;
const CHILD_SIZE: usize = 16;
const CHECKSUM_SIZE: usize = 4;

const KIND_LEAF: u8 = 0;
const KIND_INTERNAL: u8 = 1;

/// Size in bytes of every node for the given branching factor
pub(crate) fn node_size<L: TraceLocation>(branching: usize) -> usize {
    NODE_HEADER_SIZE
        + max_keys(branching) * key_size::<L>()
        + max_children(branching) * CHILD_SIZE
        + CHECKSUM_SIZE
}

pub(crate) fn max_keys(branching: usize) -> usize {
    2 * branching - 1
}

pub(crate) fn max_children(branching: usize) -> usize {
    2 * branching
}

fn key_size<L: TraceLocation>() -> usize {
    KEY_FIXED_SIZE + L::ENCODED_LEN
}

/// Pointer from an internal node to a child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChildRef {
    /// File offset of the child node
    pub offset: u64,
    /// Number of checkpoints in the child's subtree
    pub count: u64,
}

/// Decoded B-tree node; a node without children is a leaf
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Node<L> {
    pub keys: Vec<Checkpoint<L>>,
    pub children: Vec<ChildRef>,
}

impl<L: TraceLocation> Node<L> {
    pub fn leaf(keys: Vec<Checkpoint<L>>) -> Self {
        Self {
            keys,
            children: Vec::new(),
        }
    }

    pub fn internal(keys: Vec<Checkpoint<L>>, children: Vec<ChildRef>) -> Self {
        Self { keys, children }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Checkpoints stored in this node and all of its descendants
    pub fn subtree_count(&self) -> u64 {
        self.keys.len() as u64 + self.children.iter().map(|c| c.count).sum::<u64>()
    }

    pub fn encode(&self, branching: usize) -> Vec<u8> {
        let size = node_size::<L>(branching);
        let mut buf = vec![0u8; size];

        buf[0] = if self.is_leaf() { KIND_LEAF } else { KIND_INTERNAL };
        buf[1..3].copy_from_slice(&(self.keys.len() as u16).to_le_bytes());
        buf[3] = NODE_TAG;

        let mut pos = NODE_HEADER_SIZE;
        for key in &self.keys {
            buf[pos..pos + 8].copy_from_slice(&key.rank.to_le_bytes());
            buf[pos + 8..pos + 16].copy_from_slice(&key.timestamp.to_le_bytes());
            key.location
                .encode(&mut buf[pos + KEY_FIXED_SIZE..pos + key_size::<L>()]);
            pos += key_size::<L>();
        }

        let mut pos = NODE_HEADER_SIZE + max_keys(branching) * key_size::<L>();
        for child in &self.children {
            buf[pos..pos + 8].copy_from_slice(&child.offset.to_le_bytes());
            buf[pos + 8..pos + 16].copy_from_slice(&child.count.to_le_bytes());
            pos += CHILD_SIZE;
        }

        let checksum = crc32fast::hash(&buf[..size - CHECKSUM_SIZE]);
        buf[size - CHECKSUM_SIZE..].copy_from_slice(&checksum.to_le_bytes());

        buf
    }

    /// Decode a node read from `offset` (used in error messages)
    pub fn decode(buf: &[u8], branching: usize, offset: u64) -> IndexResult<Self> {
        let size = node_size::<L>(branching);
        if buf.len() != size {
            return Err(IndexError::CorruptIndex(format!(
                "node at {} has {} bytes, expected {}",
                offset,
                buf.len(),
                size
            )));
        }

        let stored = u32::from_le_bytes([
            buf[size - 4],
            buf[size - 3],
            buf[size - 2],
            buf[size - 1],
        ]);
        let computed = crc32fast::hash(&buf[..size - CHECKSUM_SIZE]);
        if stored != computed {
            return Err(IndexError::CorruptIndex(format!(
                "node at {} checksum mismatch: stored={}, computed={}",
                offset, stored, computed
            )));
        }

        if buf[3] != NODE_TAG {
            return Err(IndexError::CorruptIndex(format!(
                "node at {} has invalid tag {:#x}",
                offset, buf[3]
            )));
        }

        let kind = buf[0];
        let key_count = u16::from_le_bytes([buf[1], buf[2]]) as usize;
        if key_count == 0 || key_count > max_keys(branching) {
            return Err(IndexError::CorruptIndex(format!(
                "node at {} has invalid key count {}",
                offset, key_count
            )));
        }

        let mut keys = Vec::with_capacity(key_count);
        let mut pos = NODE_HEADER_SIZE;
        for _ in 0..key_count {
            let rank = read_u64(&buf[pos..pos + 8]);
            let timestamp = read_u64(&buf[pos + 8..pos + 16]) as i64;
            let location = L::decode(&buf[pos + KEY_FIXED_SIZE..pos + key_size::<L>()]);
            keys.push(Checkpoint::new(timestamp, rank, location));
            pos += key_size::<L>();
        }

        let children = match kind {
            KIND_LEAF => Vec::new(),
            KIND_INTERNAL => {
                let mut children = Vec::with_capacity(key_count + 1);
                let mut pos = NODE_HEADER_SIZE + max_keys(branching) * key_size::<L>();
                for _ in 0..=key_count {
                    let child = ChildRef {
                        offset: read_u64(&buf[pos..pos + 8]),
                        count: read_u64(&buf[pos + 8..pos + 16]),
                    };
                    if child.offset == 0 || child.count == 0 {
                        return Err(IndexError::CorruptIndex(format!(
                            "node at {} has a dangling child pointer",
                            offset
                        )));
                    }
                    children.push(child);
                    pos += CHILD_SIZE;
                }
                children
            }
            other => {
                return Err(IndexError::CorruptIndex(format!(
                    "node at {} has unknown kind {}",
                    offset, other
                )))
            }
        };

        Ok(Self { keys, children })
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}
