//! Tree driver tying the per-node operations together.
//!
//! The driver performs the descent/ascent for point lookups, ordered scans,
//! inserts and deletes, consuming only the node navigation contract. All
//! structural mutation of one tree happens under a single writer discipline;
//! the store handle is passed explicitly into every operation that may touch
//! the block device (lookups too, since a cold path materializes lazily).

use std::mem;

use crate::{
    error::error_validation,
    leaf::Leaf,
    meta::{BlockPointer, MetaBlockReader, MetaBlockWriter},
    node::{prefix_from, Node, Node4, Prefix},
    repr::{ChildAddr, RowId, MAX_PREFIX_LEN},
    store::BlockDevice,
    utils::{common_prefix_len, EscapedBytes},
    Error,
};

/// Ordered secondary index mapping encoded keys to row ids.
///
/// Keys are opaque byte sequences compared lexicographically; the upstream
/// value encoding must produce a prefix-free key set (no indexed key a strict
/// prefix of another), which variable-width encodings achieve with a
/// terminator. A key maps to one or more row ids.
///
/// The tree adapts each node's fanout representation to its live child count
/// and stores shared key bytes once per node (prefix compression), so lookups
/// cost one node per consumed key byte run rather than one per byte.
///
/// [Art::persist] writes the node graph to a block store in post-order and
/// returns the root's address; [Art::open] reads back only the root, with the
/// rest of the graph materializing lazily as queries touch it.
pub struct Art {
    root: Option<Box<Node>>,
    num_keys: u64,
}

enum Inserted {
    NewKey,
    NewRow,
    Duplicate,
}

enum Erased {
    NotFound,
    Row,
    KeyRemoved,
    /// The leaf below lost its last row id, the caller must unlink it
    EmptyLeaf,
}

impl Default for Art {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Art {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Art")
            .field("num_keys", &self.num_keys)
            .field("root", &self.root.as_deref().map(Node::tag))
            .finish()
    }
}

impl Art {
    pub fn new() -> Self {
        Self {
            root: None,
            num_keys: 0,
        }
    }

    /// Number of distinct keys in the index
    pub fn len(&self) -> u64 {
        self.num_keys
    }

    pub fn is_empty(&self) -> bool {
        self.num_keys == 0
    }

    /// Inserts `row` under `key`. Returns false if the pair was already present.
    /// Keys are limited to 1 MiB, matching the bound the record reader enforces.
    pub fn insert(
        &mut self,
        store: &dyn BlockDevice,
        key: &[u8],
        row: RowId,
    ) -> Result<bool, Error> {
        if key.len() > MAX_PREFIX_LEN {
            return Err(error_validation!(
                "Key of {} bytes exceeds the {} byte maximum",
                key.len(),
                MAX_PREFIX_LEN
            ));
        }
        let Some(root) = &mut self.root else {
            self.root = Some(Box::new(Node::Leaf(Leaf::new(prefix_from(key), row))));
            self.num_keys = 1;
            return Ok(true);
        };
        match Self::insert_at(root, store, key, 0, row)? {
            Inserted::NewKey => {
                self.num_keys += 1;
                Ok(true)
            }
            Inserted::NewRow => Ok(true),
            Inserted::Duplicate => Ok(false),
        }
    }

    /// Removes `row` from `key`. Returns false if the pair wasn't present.
    /// Removing the last row id of a key removes the key, collapsing and
    /// demoting nodes on the way up as needed.
    pub fn delete(
        &mut self,
        store: &dyn BlockDevice,
        key: &[u8],
        row: RowId,
    ) -> Result<bool, Error> {
        let Some(root) = &mut self.root else {
            return Ok(false);
        };
        match Self::erase_at(root, store, key, 0, row)? {
            Erased::NotFound => Ok(false),
            Erased::Row => Ok(true),
            Erased::KeyRemoved => {
                self.num_keys -= 1;
                Ok(true)
            }
            Erased::EmptyLeaf => {
                self.root = None;
                self.num_keys -= 1;
                Ok(true)
            }
        }
    }

    /// Row ids of an exactly matching key
    pub fn get(&mut self, store: &dyn BlockDevice, key: &[u8]) -> Result<Option<&[RowId]>, Error> {
        match &mut self.root {
            Some(root) => Self::lookup_at(root, store, key, 0),
            None => Ok(None),
        }
    }

    /// Visits every `(key, row)` pair with key `>= lower` in ascending key order
    /// (row ids ascending within a key). The visitor returns false to stop early.
    pub fn scan_ge(
        &mut self,
        store: &dyn BlockDevice,
        lower: &[u8],
        mut visit: impl FnMut(&[u8], RowId) -> bool,
    ) -> Result<(), Error> {
        if let Some(root) = &mut self.root {
            let mut key_buf = Vec::new();
            Self::scan_at(root, store, Some(lower), 0, &mut key_buf, &mut visit)?;
        }
        Ok(())
    }

    /// Writes the node graph to the store and returns the address of the
    /// index record (root address + key count). Resident nodes are rewritten;
    /// children never materialized re-emit their recorded addresses without
    /// being loaded.
    pub fn persist(&mut self, store: &dyn BlockDevice) -> Result<BlockPointer, Error> {
        let mut writer = MetaBlockWriter::new(store)?;
        let root_addr = match &mut self.root {
            Some(root) => {
                let pos = root.serialize(&mut writer)?;
                ChildAddr::new(pos.block, pos.offset)
            }
            None => ChildAddr::INVALID,
        };
        let pos = writer.pos()?;
        writer.write(zerocopy::IntoBytes::as_bytes(&root_addr))?;
        writer.write_u64(self.num_keys)?;
        writer.finish()?;
        debug!("persisted index of {} keys at {pos:?}", self.num_keys);
        Ok(pos)
    }

    /// Opens a previously persisted index, reading only the root node.
    /// Everything below materializes on first access.
    pub fn open(store: &dyn BlockDevice, pos: BlockPointer) -> Result<Self, Error> {
        let mut reader = MetaBlockReader::new(store, pos)?;
        let root_addr: ChildAddr = reader.read_repr()?;
        let num_keys = reader.read_u64()?;
        let root = if root_addr.is_valid() {
            reader.seek(BlockPointer {
                block: root_addr.block.get(),
                offset: root_addr.offset.get(),
            })?;
            Some(Node::deserialize(&mut reader)?)
        } else {
            None
        };
        Ok(Self { root, num_keys })
    }

    fn insert_at(
        slot: &mut Box<Node>,
        store: &dyn BlockDevice,
        key: &[u8],
        depth: usize,
        row: RowId,
    ) -> Result<Inserted, Error> {
        enum Action {
            AddRow,
            SplitLeaf(usize),
            SplitPrefix(usize),
            Descend(usize),
            AddChild,
            PrefixViolation,
        }
        let remaining = &key[depth..];
        let action = match &**slot {
            Node::Leaf(leaf) => {
                let m = common_prefix_len(&leaf.prefix, remaining);
                if m == leaf.prefix.len() && m == remaining.len() {
                    Action::AddRow
                } else if m == leaf.prefix.len() || m == remaining.len() {
                    Action::PrefixViolation
                } else {
                    Action::SplitLeaf(m)
                }
            }
            node => {
                let p = node.prefix();
                let m = common_prefix_len(p, remaining);
                if m < p.len() {
                    if m == remaining.len() {
                        Action::PrefixViolation
                    } else {
                        Action::SplitPrefix(m)
                    }
                } else if p.len() == remaining.len() {
                    Action::PrefixViolation
                } else {
                    match node.get_child_pos(remaining[p.len()]) {
                        Some(pos) => Action::Descend(pos),
                        None => Action::AddChild,
                    }
                }
            }
        };

        match action {
            Action::AddRow => {
                let Node::Leaf(leaf) = &mut **slot else {
                    unreachable!()
                };
                Ok(if leaf.insert_row(row)? {
                    Inserted::NewRow
                } else {
                    Inserted::Duplicate
                })
            }
            Action::PrefixViolation => Err(error_validation!(
                "Key {:?} is a prefix of another indexed key (key set must be prefix-free)",
                EscapedBytes(key)
            )),
            Action::SplitLeaf(m) => {
                // The leaf's remainder and the new key diverge after m bytes:
                // both move under a fresh Node4 holding the common part
                let split = Node4::new(prefix_from(&remaining[..m]));
                let old = mem::replace(&mut **slot, Node::Node4(split));
                let Node::Leaf(mut old_leaf) = old else {
                    unreachable!()
                };
                let old_byte = old_leaf.prefix[m];
                old_leaf.prefix = prefix_from(&old_leaf.prefix[m + 1..]);
                let new_byte = remaining[m];
                let new_leaf = Leaf::new(prefix_from(&remaining[m + 1..]), row);
                Node::insert_child(slot, old_byte, Box::new(Node::Leaf(old_leaf)));
                Node::insert_child(slot, new_byte, Box::new(Node::Leaf(new_leaf)));
                Ok(Inserted::NewKey)
            }
            Action::SplitPrefix(m) => {
                // The key diverges inside this node's compressed prefix
                let split = Node4::new(prefix_from(&remaining[..m]));
                let mut old = Box::new(mem::replace(&mut **slot, Node::Node4(split)));
                let old_byte = old.prefix()[m];
                let old_prefix: Prefix = prefix_from(&old.prefix()[m + 1..]);
                *old.prefix_mut() = old_prefix;
                let new_byte = remaining[m];
                let new_leaf = Leaf::new(prefix_from(&remaining[m + 1..]), row);
                Node::insert_child(slot, old_byte, old);
                Node::insert_child(slot, new_byte, Box::new(Node::Leaf(new_leaf)));
                Ok(Inserted::NewKey)
            }
            Action::Descend(pos) => {
                let p_len = slot.prefix().len();
                let child = slot.get_child(store, pos)?;
                Self::insert_at(child, store, key, depth + p_len + 1, row)
            }
            Action::AddChild => {
                let p_len = slot.prefix().len();
                let byte = remaining[p_len];
                let leaf = Leaf::new(prefix_from(&remaining[p_len + 1..]), row);
                Node::insert_child(slot, byte, Box::new(Node::Leaf(leaf)));
                Ok(Inserted::NewKey)
            }
        }
    }

    fn erase_at(
        slot: &mut Box<Node>,
        store: &dyn BlockDevice,
        key: &[u8],
        depth: usize,
        row: RowId,
    ) -> Result<Erased, Error> {
        let remaining = &key[depth..];
        let descend = match &mut **slot {
            Node::Leaf(leaf) => {
                if leaf.prefix[..] != *remaining || !leaf.remove_row(row) {
                    return Ok(Erased::NotFound);
                }
                return Ok(if leaf.row_ids.is_empty() {
                    Erased::EmptyLeaf
                } else {
                    Erased::Row
                });
            }
            node => {
                let p = node.prefix();
                if remaining.len() <= p.len() || !remaining.starts_with(p) {
                    return Ok(Erased::NotFound);
                }
                match node.get_child_pos(remaining[p.len()]) {
                    Some(pos) => (pos, p.len()),
                    None => return Ok(Erased::NotFound),
                }
            }
        };

        let (pos, p_len) = descend;
        let child_depth = depth + p_len + 1;
        let child = slot.get_child(store, pos)?;
        // When this erase is about to empty a leaf child, the collapse below
        // needs the sibling resident; load it before the row is removed so a
        // failed read leaves the key in place
        let empties_leaf = matches!(&**child, Node::Leaf(leaf)
            if leaf.prefix[..] == key[child_depth..] && leaf.row_ids[..] == [row]);
        if empties_leaf {
            Node::materialize_collapse_survivor(slot, store, pos)?;
        }

        let child = slot.get_child(store, pos)?;
        match Self::erase_at(child, store, key, child_depth, row)? {
            Erased::EmptyLeaf => {
                Node::erase_child(slot, store, pos)?;
                Ok(Erased::KeyRemoved)
            }
            other => Ok(other),
        }
    }

    fn lookup_at<'n>(
        slot: &'n mut Box<Node>,
        store: &dyn BlockDevice,
        key: &[u8],
        depth: usize,
    ) -> Result<Option<&'n [RowId]>, Error> {
        let remaining = &key[depth..];
        let descend = match &**slot {
            Node::Leaf(leaf) => {
                if leaf.prefix[..] == *remaining {
                    let Node::Leaf(leaf) = &**slot else {
                        unreachable!()
                    };
                    return Ok(Some(&leaf.row_ids));
                }
                return Ok(None);
            }
            node => {
                let p = node.prefix();
                if remaining.len() <= p.len() || !remaining.starts_with(p) {
                    return Ok(None);
                }
                match node.get_child_pos(remaining[p.len()]) {
                    Some(pos) => (pos, p.len()),
                    None => return Ok(None),
                }
            }
        };

        let (pos, p_len) = descend;
        let child = slot.get_child(store, pos)?;
        Self::lookup_at(child, store, key, depth + p_len + 1)
    }

    /// Recursive lower-bounded traversal. `lower` is the still-active bound
    /// (None once the path is known to exceed it), `depth` the key bytes
    /// consumed before this node, `key_buf` the reconstructed path bytes.
    /// Returns false when the visitor stopped the scan.
    fn scan_at(
        slot: &mut Box<Node>,
        store: &dyn BlockDevice,
        lower: Option<&[u8]>,
        depth: usize,
        key_buf: &mut Vec<u8>,
        visit: &mut impl FnMut(&[u8], RowId) -> bool,
    ) -> Result<bool, Error> {
        let keep_len = key_buf.len();
        let result = Self::scan_at_inner(slot, store, lower, depth, key_buf, visit);
        key_buf.truncate(keep_len);
        result
    }

    fn scan_at_inner(
        slot: &mut Box<Node>,
        store: &dyn BlockDevice,
        lower: Option<&[u8]>,
        depth: usize,
        key_buf: &mut Vec<u8>,
        visit: &mut impl FnMut(&[u8], RowId) -> bool,
    ) -> Result<bool, Error> {
        let node = &mut **slot;
        key_buf.extend_from_slice(node.prefix());

        if let Node::Leaf(leaf) = &mut *node {
            // key_buf now holds the full key
            if lower.map_or(true, |lower| key_buf.as_slice() >= lower) {
                for &row in &leaf.row_ids {
                    if !visit(key_buf, row) {
                        return Ok(false);
                    }
                }
            }
            return Ok(true);
        }

        // Resolve the bound against this node's compressed prefix
        let prefix_len = node.prefix().len();
        let bound = match lower {
            Some(lower) if depth < lower.len() => {
                let remaining = &lower[depth..];
                let cmp_len = prefix_len.min(remaining.len());
                match node.prefix()[..cmp_len].cmp(&remaining[..cmp_len]) {
                    // The whole subtree sorts below the bound
                    std::cmp::Ordering::Less => return Ok(true),
                    // The whole subtree sorts above the bound
                    std::cmp::Ordering::Greater => None,
                    std::cmp::Ordering::Equal if remaining.len() <= prefix_len => None,
                    std::cmp::Ordering::Equal => Some(lower),
                }
            }
            _ => None,
        };
        let depth = depth + prefix_len;

        let first = match bound {
            Some(lower) => {
                let Some((pos, equal)) = node.get_child_greater_equal(lower[depth]) else {
                    return Ok(true);
                };
                // Only the exactly-matching child still needs the bound; the
                // rest of the subtree is strictly greater
                key_buf.push(node.key_at_pos(pos));
                let child_bound = equal.then_some(lower);
                let child = node.get_child(store, pos)?;
                let cont = Self::scan_at(child, store, child_bound, depth + 1, key_buf, visit)?;
                key_buf.pop();
                if !cont {
                    return Ok(false);
                }
                Some(pos)
            }
            None => None,
        };

        let mut pos = match first {
            Some(p) => node.get_next_pos(Some(p)),
            None => node.get_next_pos(None),
        };
        while let Some(p) = pos {
            key_buf.push(node.key_at_pos(p));
            let child = node.get_child(store, p)?;
            let cont = Self::scan_at(child, store, None, depth + 1, key_buf, visit)?;
            key_buf.pop();
            if !cont {
                return Ok(false);
            }
            pos = node.get_next_pos(Some(p));
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{store::MemStore, BlockId, BLOCK_SIZE};

    /// Fails reads once its budget is spent, writes always succeed
    struct FlakyStore {
        inner: MemStore,
        reads_left: AtomicUsize,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemStore::new(),
                reads_left: AtomicUsize::new(usize::MAX),
            }
        }
    }

    impl BlockDevice for FlakyStore {
        fn allocate_block(&self) -> Result<BlockId, Error> {
            self.inner.allocate_block()
        }

        fn write_block(&self, id: BlockId, data: &[u8; BLOCK_SIZE]) -> Result<(), Error> {
            self.inner.write_block(id, data)
        }

        fn read_block(&self, id: BlockId, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), Error> {
            let claimed = self
                .reads_left
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
            if claimed.is_err() {
                return Err(Error::Io(std::io::Error::other("injected read failure")));
            }
            self.inner.read_block(id, buf)
        }
    }

    fn collect(art: &mut Art, store: &dyn BlockDevice, lower: &[u8]) -> Vec<(Vec<u8>, RowId)> {
        let mut out = Vec::new();
        art.scan_ge(store, lower, |key, row| {
            out.push((key.to_vec(), row));
            true
        })
        .unwrap();
        out
    }

    #[test]
    fn insert_get_delete() {
        let store = MemStore::new();
        let mut art = Art::new();
        assert!(art.insert(&store, b"apple\0", 1).unwrap());
        assert!(art.insert(&store, b"banana\0", 2).unwrap());
        assert!(art.insert(&store, b"apricot\0", 3).unwrap());
        assert_eq!(art.len(), 3);

        assert_eq!(art.get(&store, b"apple\0").unwrap(), Some(&[1u64][..]));
        assert_eq!(art.get(&store, b"apricot\0").unwrap(), Some(&[3u64][..]));
        assert_eq!(art.get(&store, b"cherry\0").unwrap(), None);
        assert_eq!(art.get(&store, b"app").unwrap(), None);

        assert!(art.delete(&store, b"apple\0", 1).unwrap());
        assert!(!art.delete(&store, b"apple\0", 1).unwrap());
        assert_eq!(art.len(), 2);
        assert_eq!(art.get(&store, b"apple\0").unwrap(), None);
        assert_eq!(art.get(&store, b"apricot\0").unwrap(), Some(&[3u64][..]));
    }

    #[test]
    fn multiple_rows_per_key() {
        let store = MemStore::new();
        let mut art = Art::new();
        assert!(art.insert(&store, b"k\0", 30).unwrap());
        assert!(art.insert(&store, b"k\0", 10).unwrap());
        assert!(art.insert(&store, b"k\0", 20).unwrap());
        assert!(!art.insert(&store, b"k\0", 20).unwrap());
        assert_eq!(art.len(), 1);
        assert_eq!(art.get(&store, b"k\0").unwrap(), Some(&[10u64, 20, 30][..]));

        assert!(art.delete(&store, b"k\0", 20).unwrap());
        assert_eq!(art.len(), 1);
        assert!(art.delete(&store, b"k\0", 10).unwrap());
        assert!(art.delete(&store, b"k\0", 30).unwrap());
        assert_eq!(art.len(), 0);
        assert!(art.is_empty());
    }

    #[test]
    fn prefix_keys_rejected() {
        let store = MemStore::new();
        let mut art = Art::new();
        art.insert(&store, b"abc", 1).unwrap();
        assert!(matches!(
            art.insert(&store, b"ab", 2),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            art.insert(&store, b"abcd", 3),
            Err(Error::Validation(_))
        ));
        // The reverse order fails as well
        let mut art = Art::new();
        art.insert(&store, b"abcd", 1).unwrap();
        assert!(matches!(
            art.insert(&store, b"abc", 2),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn key_length_limit() {
        let store = MemStore::new();
        let mut art = Art::new();
        let long = vec![7u8; MAX_PREFIX_LEN + 1];
        assert!(matches!(
            art.insert(&store, &long, 1),
            Err(Error::Validation(_))
        ));
        assert!(art.is_empty());

        // A key at exactly the limit survives a full persist/open cycle
        let max = vec![7u8; MAX_PREFIX_LEN];
        assert!(art.insert(&store, &max, 1).unwrap());
        let pos = art.persist(&store).unwrap();
        let mut opened = Art::open(&store, pos).unwrap();
        assert_eq!(opened.get(&store, &max).unwrap(), Some(&[1u64][..]));
    }

    #[test]
    fn failed_sibling_read_aborts_delete() {
        let store = FlakyStore::new();
        let mut art = Art::new();
        art.insert(&store, b"a\0", 1).unwrap();
        art.insert(&store, b"b\0", 2).unwrap();
        let pos = art.persist(&store).unwrap();
        let mut art = Art::open(&store, pos).unwrap();

        // One read materializes the "a" leaf, then loading the collapse
        // sibling fails before any row is removed
        store.reads_left.store(1, Ordering::Relaxed);
        assert!(matches!(art.delete(&store, b"a\0", 1), Err(Error::Io(_))));
        assert_eq!(art.len(), 2);
        assert_eq!(art.get(&store, b"a\0").unwrap(), Some(&[1u64][..]));

        // With reads restored the tree is fully intact and the same delete
        // goes through and collapses
        store.reads_left.store(usize::MAX, Ordering::Relaxed);
        assert_eq!(
            collect(&mut art, &store, b""),
            vec![(b"a\0".to_vec(), 1), (b"b\0".to_vec(), 2)]
        );
        assert!(art.delete(&store, b"a\0", 1).unwrap());
        assert_eq!(art.len(), 1);
        assert_eq!(art.get(&store, b"a\0").unwrap(), None);
        assert_eq!(art.get(&store, b"b\0").unwrap(), Some(&[2u64][..]));
    }

    #[test]
    fn scan_ordered_with_bound() {
        let store = MemStore::new();
        let mut art = Art::new();
        let keys: &[&[u8]] = &[
            b"aa\0", b"ab\0", b"abc\0", b"b\0", b"ba\0", b"z\0", b"za\0",
        ];
        for (i, key) in keys.iter().enumerate() {
            art.insert(&store, key, i as RowId).unwrap();
        }

        let all = collect(&mut art, &store, b"");
        let mut sorted: Vec<&[u8]> = keys.to_vec();
        sorted.sort();
        assert_eq!(
            all.iter().map(|(k, _)| k.as_slice()).collect::<Vec<_>>(),
            sorted
        );

        let from_b = collect(&mut art, &store, b"b");
        assert_eq!(from_b.len(), 4);
        assert_eq!(from_b[0].0, b"b\0");

        // Bound equal to an existing key includes it
        let from_ba = collect(&mut art, &store, b"ba\0");
        assert_eq!(from_ba[0].0, b"ba\0");
        // Bound past everything yields nothing
        assert!(collect(&mut art, &store, b"zz").is_empty());
    }

    #[test]
    fn scan_early_stop() {
        let store = MemStore::new();
        let mut art = Art::new();
        for i in 0..100u64 {
            art.insert(&store, &i.to_be_bytes(), i).unwrap();
        }
        let mut seen = 0;
        art.scan_ge(&store, &[], |_, _| {
            seen += 1;
            seen < 10
        })
        .unwrap();
        assert_eq!(seen, 10);
    }

    #[test]
    fn persist_open_round_trip() {
        let store = MemStore::new();
        let mut art = Art::new();
        for i in 0..500u64 {
            let key = format!("key-{i:05}");
            art.insert(&store, key.as_bytes(), i).unwrap();
        }
        let pos = art.persist(&store).unwrap();

        let mut opened = Art::open(&store, pos).unwrap();
        assert_eq!(opened.len(), 500);
        // Point lookups materialize only the touched path
        assert_eq!(
            opened.get(&store, b"key-00123").unwrap(),
            Some(&[123u64][..])
        );
        assert_eq!(opened.get(&store, b"key-00499").unwrap(), Some(&[499u64][..]));
        assert_eq!(opened.get(&store, b"key-99999").unwrap(), None);

        // Scans see everything in order
        let all = collect(&mut opened, &store, b"key-00490");
        assert_eq!(all.len(), 10);
        assert_eq!(all[0].0, b"key-00490");
        assert_eq!(all[9].1, 499);
    }

    #[test]
    fn persist_empty_index() {
        let store = MemStore::new();
        let mut art = Art::new();
        let pos = art.persist(&store).unwrap();
        let mut opened = Art::open(&store, pos).unwrap();
        assert!(opened.is_empty());
        assert_eq!(opened.get(&store, b"x").unwrap(), None);
        assert!(collect(&mut opened, &store, b"").is_empty());
    }

    #[test]
    fn mutate_after_open() {
        let store = MemStore::new();
        let mut art = Art::new();
        for i in 0..100u64 {
            art.insert(&store, &i.to_be_bytes(), i).unwrap();
        }
        let pos = art.persist(&store).unwrap();

        let mut opened = Art::open(&store, pos).unwrap();
        // Deletes and inserts against a lazily loaded tree
        for i in 0..50u64 {
            assert!(opened.delete(&store, &i.to_be_bytes(), i).unwrap());
        }
        opened.insert(&store, &1000u64.to_be_bytes(), 1000).unwrap();
        assert_eq!(opened.len(), 51);

        let all = collect(&mut opened, &store, &[]);
        assert_eq!(all.len(), 51);
        assert_eq!(all[0].1, 50);
        assert_eq!(all[50].1, 1000);

        // And a second persist of the partially materialized tree still works
        let pos = opened.persist(&store).unwrap();
        let mut reopened = Art::open(&store, pos).unwrap();
        assert_eq!(collect(&mut reopened, &store, &[]), all);
    }
}
