//! Disk-resident B-tree checkpoint collection
//!
//! Checkpoints are records of a B-tree keyed by rank, stored in fixed-size
//! nodes inside an [`IndexFile`]. Child pointers are file offsets plus the
//! child's subtree size, so positional lookups stay O(log_b n).
//!
//! Appends are strictly rank-ascending and always land on the rightmost
//! path. An overflowing node is split right-biased: the left node keeps
//! `2b-2` keys, its last key moves up, and the new right sibling starts
//! with just the appended key. Nodes therefore end up nearly full instead
//! of half full.
//!
//! # Performance
//! - Append: O(log_b n) node writes (the rightmost path is rewritten)
//! - Search / get: O(log_b n) node reads, mostly served from the cache
//!
//! Readers hold the metadata read lock for a whole descent; the writer holds
//! the write lock for a whole append. Cached nodes are `Arc` snapshots that
//! a write replaces wholesale.

use crate::checkpoint::node::{max_keys, node_size, ChildRef, Node};
use crate::checkpoint::{Checkpoint, CheckpointCollection, SearchKey, MIN_BRANCHING_FACTOR};
use crate::error::{IndexError, IndexResult};
use crate::persist::{IndexFile, HEADER_SIZE};
use crate::trace::{TraceLocation, TraceSignature};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Default number of decoded nodes kept in memory
pub const DEFAULT_NODE_CACHE_CAPACITY: usize = 256;

/// Root metadata of the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeMeta {
    /// Offset of the root node
    pub root: Option<u64>,
    /// Number of checkpoints
    pub len: u64,
    /// Number of node levels (0 when empty)
    pub height: u32,
    /// Where the next node will be written
    pub next_offset: u64,
}

impl TreeMeta {
    pub fn empty() -> Self {
        Self {
            root: None,
            len: 0,
            height: 0,
            next_offset: HEADER_SIZE as u64,
        }
    }
}

struct TreeState<L> {
    meta: TreeMeta,
    last: Option<Checkpoint<L>>,
}

/// Bounded node cache with FIFO eviction
struct NodeCache<L> {
    nodes: HashMap<u64, Arc<Node<L>>>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl<L> NodeCache<L> {
    fn new(capacity: usize) -> Self {
        Self {
            nodes: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, offset: u64) -> Option<Arc<Node<L>>> {
        self.nodes.get(&offset).cloned()
    }

    fn put(&mut self, offset: u64, node: Arc<Node<L>>) {
        if self.nodes.insert(offset, node).is_none() {
            self.order.push_back(offset);
            while self.nodes.len() > self.capacity {
                match self.order.pop_front() {
                    Some(evicted) => {
                        self.nodes.remove(&evicted);
                    }
                    None => break,
                }
            }
        }
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.order.clear();
    }
}

/// Checkpoint collection stored as an on-disk B-tree
pub struct BTreeCollection<L> {
    file: Arc<IndexFile>,
    branching: usize,
    node_size: usize,
    state: RwLock<TreeState<L>>,
    cache: Mutex<NodeCache<L>>,
}

impl<L: TraceLocation> BTreeCollection<L> {
    /// Create an empty tree in `file`, discarding any nodes it holds
    pub fn create(file: Arc<IndexFile>, branching: usize, cache_capacity: usize) -> IndexResult<Self> {
        Self::check_branching(branching)?;
        file.clear_nodes()?;

        Ok(Self {
            file,
            branching,
            node_size: node_size::<L>(branching),
            state: RwLock::new(TreeState {
                meta: TreeMeta::empty(),
                last: None,
            }),
            cache: Mutex::new(NodeCache::new(cache_capacity)),
        })
    }

    /// Reopen the tree described by the file's committed header
    ///
    /// The whole tree is verified; any structural problem is reported as
    /// [`IndexError::CorruptIndex`].
    pub fn open(file: Arc<IndexFile>, branching: usize, cache_capacity: usize) -> IndexResult<Self> {
        Self::check_branching(branching)?;
        let header = file.header();

        let meta = TreeMeta {
            root: (header.root_offset != 0).then_some(header.root_offset),
            len: header.checkpoint_count,
            height: header.height,
            next_offset: header.next_offset,
        };

        let tree = Self {
            file,
            branching,
            node_size: node_size::<L>(branching),
            state: RwLock::new(TreeState { meta, last: None }),
            cache: Mutex::new(NodeCache::new(cache_capacity)),
        };

        tree.verify()?;

        let last = match tree.len() {
            0 => None,
            n => tree.get(n - 1)?,
        };
        tree.state.write().last = last;

        Ok(tree)
    }

    fn check_branching(branching: usize) -> IndexResult<()> {
        if branching < MIN_BRANCHING_FACTOR {
            return Err(IndexError::Configuration(format!(
                "branching factor must be at least {}, got {}",
                MIN_BRANCHING_FACTOR, branching
            )));
        }
        Ok(())
    }

    /// Current root metadata
    pub fn meta(&self) -> TreeMeta {
        self.state.read().meta.clone()
    }

    fn load(&self, offset: u64) -> IndexResult<Arc<Node<L>>> {
        if let Some(node) = self.cache.lock().get(offset) {
            return Ok(node);
        }

        let mut buf = vec![0u8; self.node_size];
        self.file.read_at(offset, &mut buf)?;
        let node = Arc::new(Node::decode(&buf, self.branching, offset)?);

        self.cache.lock().put(offset, Arc::clone(&node));
        Ok(node)
    }

    fn store(&self, offset: u64, node: Node<L>) -> IndexResult<()> {
        self.file.write_at(offset, &node.encode(self.branching))?;
        self.cache.lock().put(offset, Arc::new(node));
        Ok(())
    }

    fn allocate(&self, meta: &mut TreeMeta) -> u64 {
        let offset = meta.next_offset;
        meta.next_offset += self.node_size as u64;
        offset
    }

    /// Internal nodes only exist above the leaf level; anything deeper is a pointer cycle
    fn check_internal_depth(meta: &TreeMeta, offset: u64, depth: u32) -> IndexResult<()> {
        if depth >= meta.height {
            return Err(IndexError::CorruptIndex(format!(
                "internal node at {} sits at depth {}, tree height is {}",
                offset, depth, meta.height
            )));
        }
        Ok(())
    }

    /// Split an overflowing rightmost node
    ///
    /// Returns the promoted key and the new right sibling.
    fn split_right(node: &mut Node<L>) -> IndexResult<(Checkpoint<L>, Node<L>)> {
        let (Some(right_key), Some(promoted)) = (node.keys.pop(), node.keys.pop()) else {
            return Err(IndexError::CorruptIndex("split of an underfull node".into()));
        };

        let right = if node.is_leaf() {
            Node::leaf(vec![right_key])
        } else {
            let right_children = node.children.split_off(node.children.len() - 2);
            Node::internal(vec![right_key], right_children)
        };

        Ok((promoted, right))
    }

    fn append(&self, state: &mut TreeState<L>, checkpoint: Checkpoint<L>) -> IndexResult<()> {
        let meta = &mut state.meta;

        let Some(root) = meta.root else {
            let offset = self.allocate(meta);
            self.store(offset, Node::leaf(vec![checkpoint.clone()]))?;
            meta.root = Some(offset);
            meta.height = 1;
            meta.len = 1;
            state.last = Some(checkpoint);
            return Ok(());
        };

        // Rightmost path, root first
        let mut spine: Vec<(u64, Node<L>)> = Vec::with_capacity(meta.height as usize);
        let mut offset = root;
        loop {
            let node = self.load(offset)?;
            let next = node.children.last().map(|c| c.offset);
            if next.is_some() {
                Self::check_internal_depth(meta, offset, spine.len() as u32 + 1)?;
            }
            spine.push((offset, (*node).clone()));
            match next {
                Some(child) => offset = child,
                None => break,
            }
        }

        let limit = max_keys(self.branching);
        let mut carry: Option<(Checkpoint<L>, ChildRef)> = None;
        let mut below: Option<u64> = None;

        for (offset, mut node) in spine.into_iter().rev() {
            if node.is_leaf() {
                node.keys.push(checkpoint.clone());
            } else {
                if let (Some(count), Some(last)) = (below, node.children.last_mut()) {
                    last.count = count;
                }
                if let Some((separator, right)) = carry.take() {
                    node.keys.push(separator);
                    node.children.push(right);
                }
            }

            if node.keys.len() > limit {
                let (promoted, right) = Self::split_right(&mut node)?;
                let right_offset = self.allocate(meta);
                let right_ref = ChildRef {
                    offset: right_offset,
                    count: right.subtree_count(),
                };
                self.store(right_offset, right)?;
                carry = Some((promoted, right_ref));
            }

            below = Some(node.subtree_count());
            self.store(offset, node)?;
        }

        if let Some((separator, right)) = carry {
            let left = ChildRef {
                offset: root,
                count: below.unwrap_or(0),
            };
            let new_root = self.allocate(meta);
            self.store(new_root, Node::internal(vec![separator], vec![left, right]))?;
            meta.root = Some(new_root);
            meta.height += 1;
            tracing::debug!("B-tree grew to height {}", meta.height);
        }

        meta.len += 1;
        state.last = Some(checkpoint);
        Ok(())
    }

    /// Floor lookup returning both the position and the checkpoint
    fn search_floor(&self, key: SearchKey) -> IndexResult<Option<(usize, Checkpoint<L>)>> {
        let state = self.state.read();
        let Some(mut offset) = state.meta.root else {
            return Ok(None);
        };

        // Checkpoints strictly before the current subtree
        let mut before = 0u64;
        let mut best = None;
        let mut depth = 1u32;

        loop {
            let node = self.load(offset)?;
            let i = node.keys.partition_point(|k| k.at_or_before(key));

            if node.is_leaf() {
                if i > 0 {
                    best = Some(((before + i as u64 - 1) as usize, node.keys[i - 1].clone()));
                }
                return Ok(best);
            }
            Self::check_internal_depth(&state.meta, offset, depth)?;
            depth += 1;

            let skipped: u64 = node.children[..i].iter().map(|c| c.count).sum();
            if i > 0 {
                best = Some((
                    (before + skipped + i as u64 - 1) as usize,
                    node.keys[i - 1].clone(),
                ));
            }
            before += skipped + i as u64;
            offset = node.children[i].offset;
        }
    }

    /// Walk every node and check the tree's structural invariants
    pub fn verify(&self) -> IndexResult<()> {
        let state = self.state.read();
        let meta = &state.meta;

        let Some(root) = meta.root else {
            if meta.len != 0 || meta.height != 0 {
                return Err(IndexError::CorruptIndex(format!(
                    "empty tree claims {} checkpoints and height {}",
                    meta.len, meta.height
                )));
            }
            return Ok(());
        };

        let mut previous: Option<Checkpoint<L>> = None;
        let count = self.verify_node(root, 1, meta, &mut previous)?;
        if count != meta.len {
            return Err(IndexError::CorruptIndex(format!(
                "tree holds {} checkpoints, header claims {}",
                count, meta.len
            )));
        }
        Ok(())
    }

    fn verify_node(
        &self,
        offset: u64,
        depth: u32,
        meta: &TreeMeta,
        previous: &mut Option<Checkpoint<L>>,
    ) -> IndexResult<u64> {
        let region_start = HEADER_SIZE as u64;
        if offset < region_start
            || offset + self.node_size as u64 > meta.next_offset
            || (offset - region_start) % self.node_size as u64 != 0
        {
            return Err(IndexError::CorruptIndex(format!(
                "node offset {} outside node region",
                offset
            )));
        }

        let node = self.load(offset)?;

        if node.is_leaf() {
            if depth != meta.height {
                return Err(IndexError::CorruptIndex(format!(
                    "leaf at {} has depth {}, tree height is {}",
                    offset, depth, meta.height
                )));
            }
            for key in &node.keys {
                key.check_follows(previous.as_ref())
                    .map_err(|e| IndexError::CorruptIndex(e.to_string()))?;
                *previous = Some(key.clone());
            }
            return Ok(node.keys.len() as u64);
        }

        Self::check_internal_depth(meta, offset, depth)?;

        let mut total = 0u64;
        for (i, child) in node.children.iter().enumerate() {
            let actual = self.verify_node(child.offset, depth + 1, meta, previous)?;
            if actual != child.count {
                return Err(IndexError::CorruptIndex(format!(
                    "child {} of node {} holds {} checkpoints, pointer says {}",
                    i, offset, actual, child.count
                )));
            }
            total += actual;

            if let Some(key) = node.keys.get(i) {
                key.check_follows(previous.as_ref())
                    .map_err(|e| IndexError::CorruptIndex(e.to_string()))?;
                *previous = Some(key.clone());
                total += 1;
            }
        }
        Ok(total)
    }
}

impl<L: TraceLocation> CheckpointCollection<L> for BTreeCollection<L> {
    fn insert(&self, checkpoint: Checkpoint<L>) -> IndexResult<()> {
        let mut state = self.state.write();
        checkpoint.check_follows(state.last.as_ref())?;
        self.append(&mut state, checkpoint)
    }

    fn len(&self) -> usize {
        self.state.read().meta.len as usize
    }

    fn get(&self, index: usize) -> IndexResult<Option<Checkpoint<L>>> {
        let state = self.state.read();
        if index as u64 >= state.meta.len {
            return Ok(None);
        }
        let Some(mut offset) = state.meta.root else {
            return Ok(None);
        };

        let mut remaining = index as u64;
        let mut depth = 1u32;
        'descend: loop {
            let node = self.load(offset)?;

            if node.is_leaf() {
                return Ok(node.keys.get(remaining as usize).cloned());
            }
            Self::check_internal_depth(&state.meta, offset, depth)?;
            depth += 1;

            for (i, child) in node.children.iter().enumerate() {
                if remaining < child.count {
                    offset = child.offset;
                    continue 'descend;
                }
                remaining -= child.count;

                if let Some(key) = node.keys.get(i) {
                    if remaining == 0 {
                        return Ok(Some(key.clone()));
                    }
                    remaining -= 1;
                }
            }

            return Err(IndexError::CorruptIndex(format!(
                "subtree counts at node {} do not cover position {}",
                offset, index
            )));
        }
    }

    fn search(&self, key: SearchKey) -> IndexResult<Option<usize>> {
        Ok(self.search_floor(key)?.map(|(index, _)| index))
    }

    fn floor(&self, key: SearchKey) -> IndexResult<Option<Checkpoint<L>>> {
        Ok(self.search_floor(key)?.map(|(_, checkpoint)| checkpoint))
    }

    fn last(&self) -> IndexResult<Option<Checkpoint<L>>> {
        Ok(self.state.read().last.clone())
    }

    fn reset(&self) -> IndexResult<()> {
        let mut state = self.state.write();
        self.file.clear_nodes()?;
        self.cache.lock().clear();
        state.meta = TreeMeta::empty();
        state.last = None;
        Ok(())
    }

    fn flush(&self, events: u64, signature: Option<TraceSignature>) -> IndexResult<()> {
        let state = self.state.read();
        let meta = state.meta.clone();

        self.file.commit(|h| {
            h.signature = signature;
            h.root_offset = meta.root.unwrap_or(0);
            h.checkpoint_count = meta.len;
            h.height = meta.height;
            h.next_offset = meta.next_offset;
            h.event_count = events;
            h.complete = true;
        })?;

        tracing::debug!(
            "Flushed B-tree index {:?}: {} checkpoints, height {}",
            self.file.path(),
            meta.len,
            meta.height
        );
        Ok(())
    }

    fn release(&self) -> IndexResult<()> {
        let _state = self.state.write();
        self.cache.lock().clear();
        self.file.close();
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::IndexHeader;
    use tempfile::{tempdir, TempDir};

    fn new_tree(branching: usize) -> (TempDir, BTreeCollection<u64>) {
        let dir = tempdir().unwrap();
        let header = IndexHeader::new(8, 1, branching as u32, None);
        let file = Arc::new(IndexFile::create(dir.path().join("t.tmix"), header).unwrap());
        let tree = BTreeCollection::create(file, branching, 8).unwrap();
        (dir, tree)
    }

    fn fill(tree: &BTreeCollection<u64>, count: u64, interval: u64) {
        for i in 0..count {
            let rank = i * interval;
            tree.insert(Checkpoint::new(rank as i64 * 2, rank, rank * 16))
                .unwrap();
        }
    }

    #[test]
    fn test_rejects_small_branching() {
        let dir = tempdir().unwrap();
        let header = IndexHeader::new(8, 1, 1, None);
        let file = Arc::new(IndexFile::create(dir.path().join("t.tmix"), header).unwrap());
        let err = BTreeCollection::<u64>::create(file, 1, 8).err().unwrap();
        assert!(matches!(err, IndexError::Configuration(_)));
    }

    #[test]
    fn test_single_leaf() {
        let (_dir, tree) = new_tree(4);
        fill(&tree, 5, 10);

        assert_eq!(tree.len(), 5);
        assert_eq!(tree.meta().height, 1);
        assert_eq!(tree.get(4).unwrap().unwrap().rank, 40);
        assert_eq!(tree.search(SearchKey::Rank(25)).unwrap(), Some(2));
    }

    #[test]
    fn test_grows_and_stays_ordered() {
        for branching in [2, 3, 8] {
            let (_dir, tree) = new_tree(branching);
            fill(&tree, 1000, 7);

            assert_eq!(tree.len(), 1000);
            assert!(tree.meta().height > 1);
            tree.verify().unwrap();

            for i in 0..1000u64 {
                let cp = tree.get(i as usize).unwrap().unwrap();
                assert_eq!(cp.rank, i * 7);
                assert_eq!(cp.location, i * 7 * 16);
            }
            assert!(tree.get(1000).unwrap().is_none());
        }
    }

    #[test]
    fn test_search_matches_linear_scan() {
        let (_dir, tree) = new_tree(2);
        fill(&tree, 300, 10);

        for target in [0u64, 1, 9, 10, 11, 555, 1999, 2990, 2999, 10_000] {
            let expected = (target / 10).min(299) as usize;
            assert_eq!(tree.search(SearchKey::Rank(target)).unwrap(), Some(expected));

            let floor = tree.floor(SearchKey::Rank(target)).unwrap().unwrap();
            assert_eq!(floor.rank, expected as u64 * 10);
        }

        // Timestamps are rank * 2
        assert_eq!(tree.search(SearchKey::Timestamp(-5)).unwrap(), None);
        assert_eq!(tree.search(SearchKey::Timestamp(39)).unwrap(), Some(1));
        assert_eq!(tree.search(SearchKey::Timestamp(40)).unwrap(), Some(2));
    }

    #[test]
    fn test_right_biased_split_fills_nodes() {
        let (_dir, tree) = new_tree(4);
        // 7 keys per node; the 8th append splits the root leaf
        fill(&tree, 8, 1);

        let meta = tree.meta();
        assert_eq!(meta.height, 2);
        let root = tree.load(meta.root.unwrap()).unwrap();
        assert_eq!(root.keys.len(), 1);
        assert_eq!(root.keys[0].rank, 6);
        assert_eq!(root.children[0].count, 6);
        assert_eq!(root.children[1].count, 1);
    }

    #[test]
    fn test_rejects_out_of_order() {
        let (_dir, tree) = new_tree(2);
        fill(&tree, 10, 5);

        let err = tree.insert(Checkpoint::new(1000, 45, 0)).unwrap_err();
        assert!(matches!(err, IndexError::NonMonotonic(_)));
        assert_eq!(tree.len(), 10);
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tmix");

        {
            let header = IndexHeader::new(8, 1, 3, None);
            let file = Arc::new(IndexFile::create(&path, header).unwrap());
            let tree = BTreeCollection::<u64>::create(file, 3, 4).unwrap();
            fill(&tree, 500, 3);
            tree.flush(1500, None).unwrap();
        }

        let file = Arc::new(IndexFile::open(&path).unwrap());
        assert!(file.header().complete);
        assert_eq!(file.header().event_count, 1500);

        let tree = BTreeCollection::<u64>::open(file, 3, 4).unwrap();
        assert_eq!(tree.len(), 500);
        assert_eq!(tree.last().unwrap().unwrap().rank, 1497);
        assert_eq!(tree.search(SearchKey::Rank(1000)).unwrap(), Some(333));
    }

    #[test]
    fn test_reopen_detects_corrupt_node() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tmix");

        {
            let header = IndexHeader::new(8, 1, 2, None);
            let file = Arc::new(IndexFile::create(&path, header).unwrap());
            let tree = BTreeCollection::<u64>::create(file, 2, 4).unwrap();
            fill(&tree, 50, 1);
            tree.flush(50, None).unwrap();
        }

        {
            use std::io::{Seek, SeekFrom, Write};
            let mut raw = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            raw.seek(SeekFrom::Start(HEADER_SIZE as u64 + 20)).unwrap();
            raw.write_all(&[0xAB; 4]).unwrap();
        }

        let file = Arc::new(IndexFile::open(&path).unwrap());
        let err = BTreeCollection::<u64>::open(file, 2, 4).err().unwrap();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_child_pointer_cycle_is_corruption() {
        use crate::indexer::IndexState;
        use crate::persist::{load_or_create, IndexParams};
        use crate::trace::TraceSignature;

        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tmix");
        let params = IndexParams {
            interval: 1,
            branching: 2,
            cache_capacity: 4,
        };
        let signature = Some(TraceSignature::new(20, 1_700_000_000, 0));

        {
            let loaded = load_or_create::<u64>(&path, signature, params).unwrap();
            let tree = loaded.collection;
            fill(&tree, 20, 1);
            tree.flush(20, signature).unwrap();

            // Point the root's first child back at the root, checksum intact
            let root = tree.meta().root.unwrap();
            let mut node = (*tree.load(root).unwrap()).clone();
            assert!(!node.is_leaf());
            node.children[0].offset = root;
            tree.store(root, node).unwrap();

            let err = tree.floor(SearchKey::Rank(0)).unwrap_err();
            assert!(err.is_corruption());
            assert!(tree.get(0).unwrap_err().is_corruption());
            assert!(tree.verify().unwrap_err().is_corruption());
        }

        let loaded = load_or_create::<u64>(&path, signature, params).unwrap();
        assert_eq!(loaded.state, IndexState::Empty);
        assert!(loaded.collection.is_empty());
    }

    #[test]
    fn test_reset_empties_tree() {
        let (_dir, tree) = new_tree(2);
        fill(&tree, 20, 1);
        tree.reset().unwrap();

        assert!(tree.is_empty());
        assert_eq!(tree.meta(), TreeMeta::empty());
        assert!(tree.floor(SearchKey::Rank(5)).unwrap().is_none());

        fill(&tree, 3, 1);
        assert_eq!(tree.len(), 3);
        tree.verify().unwrap();
    }

    #[test]
    fn test_concurrent_readers_during_append() {
        let (_dir, tree) = new_tree(3);
        let tree = Arc::new(tree);

        let writer = {
            let tree = Arc::clone(&tree);
            std::thread::spawn(move || fill(&tree, 2000, 1))
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let tree = Arc::clone(&tree);
                std::thread::spawn(move || {
                    for _ in 0..300 {
                        if let Some((index, cp)) = tree.search_floor(SearchKey::Rank(1500)).unwrap() {
                            assert_eq!(index as u64, cp.rank);
                            assert!(cp.rank <= 1500);
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        tree.verify().unwrap();
    }
}
