//! Adaptive node variants of the index tree.
//!
//! Every inner node is one of four fixed capacity representations (4/16/48/256
//! way fanout) behind the closed [Node] enum. A node that outgrows its capacity
//! is promoted to the next larger variant before the triggering insert lands;
//! erases shrink back down and a node left with a single child is collapsed into
//! it, fusing the compressed prefixes. Children persisted to the block store are
//! kept as `(block, offset)` stubs and materialized on first access.

use std::mem;

use smallvec::SmallVec;

use crate::{
    error::error_corruption,
    leaf::Leaf,
    meta::{BlockPointer, MetaBlockReader, MetaBlockWriter},
    repr::{ChildAddr, NodeRecordHeader, NodeTag, EMPTY_SLOT},
    store::BlockDevice,
    Error,
};

/// Compressed key prefix, exclusively owned by its node
pub(crate) type Prefix = SmallVec<u8, 8>;

pub(crate) fn prefix_from(bytes: &[u8]) -> Prefix {
    bytes.iter().copied().collect()
}

// Shrink-on-erase thresholds. Each leaves spare capacity in the smaller
// variant so a shrink isn't immediately followed by a promotion.
const NODE16_SHRINK: usize = 3;
const NODE48_SHRINK: usize = 12;
const NODE256_SHRINK: usize = 37;

/// Two-state child slot: resident in-memory subtree and/or its persisted address.
/// An occupied slot is never both non-resident and address-less.
#[derive(Debug)]
pub(crate) struct ChildSlot {
    pub node: Option<Box<Node>>,
    pub addr: ChildAddr,
}

impl Default for ChildSlot {
    fn default() -> Self {
        Self {
            node: None,
            addr: ChildAddr::INVALID,
        }
    }
}

impl ChildSlot {
    fn resident(node: Box<Node>) -> Self {
        Self {
            node: Some(node),
            addr: ChildAddr::INVALID,
        }
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.node.is_none() && !self.addr.is_valid()
    }

    /// Loads the subtree from the store on first access and caches it in the slot.
    /// A failed read leaves the slot untouched.
    pub fn materialize(&mut self, store: &dyn BlockDevice) -> Result<&mut Box<Node>, Error> {
        if self.node.is_none() {
            assert!(self.addr.is_valid(), "materialize of an empty child slot");
            let pos = BlockPointer {
                block: self.addr.block.get(),
                offset: self.addr.offset.get(),
            };
            let mut reader = MetaBlockReader::new(store, pos)?;
            let node = Node::deserialize(&mut reader)?;
            trace!("materialized {:?} node at {:?}", node.tag(), pos);
            self.node = Some(node);
        }
        Ok(self.node.as_mut().expect("slot resident"))
    }
}

#[derive(Debug)]
pub(crate) enum Node {
    Node4(Node4),
    Node16(Node16),
    Node48(Node48),
    Node256(Node256),
    Leaf(Leaf),
}

#[derive(Debug)]
pub(crate) struct Node4 {
    pub prefix: Prefix,
    count: u8,
    keys: [u8; 4],
    children: [ChildSlot; 4],
}

#[derive(Debug)]
pub(crate) struct Node16 {
    pub prefix: Prefix,
    count: u8,
    keys: [u8; 16],
    children: [ChildSlot; 16],
}

/// 48-way node: a direct 256 entry byte -> slot index table plus a dense slot array
#[derive(Debug)]
pub(crate) struct Node48 {
    pub prefix: Prefix,
    count: u8,
    child_index: Box<[u8; 256]>,
    children: Box<[ChildSlot; 48]>,
}

/// 256-way node: one slot per possible discriminant byte, can never overflow
#[derive(Debug)]
pub(crate) struct Node256 {
    pub prefix: Prefix,
    count: u16,
    children: Box<[ChildSlot; 256]>,
}

fn empty_slots<const N: usize>() -> [ChildSlot; N] {
    std::array::from_fn(|_| ChildSlot::default())
}

impl Node4 {
    pub fn new(prefix: Prefix) -> Self {
        Self {
            prefix,
            count: 0,
            keys: [0; 4],
            children: empty_slots(),
        }
    }

    fn from_node16(n: &mut Node16) -> Self {
        debug_assert!(n.count as usize <= 4);
        let mut node = Self::new(mem::take(&mut n.prefix));
        for i in 0..n.count as usize {
            node.keys[i] = n.keys[i];
            node.children[i] = mem::take(&mut n.children[i]);
        }
        node.count = n.count;
        node
    }
}

impl Node16 {
    fn new(prefix: Prefix) -> Self {
        Self {
            prefix,
            count: 0,
            keys: [0; 16],
            children: empty_slots(),
        }
    }

    fn from_node4(n: &mut Node4) -> Self {
        let mut node = Self::new(mem::take(&mut n.prefix));
        for i in 0..n.count as usize {
            node.keys[i] = n.keys[i];
            node.children[i] = mem::take(&mut n.children[i]);
        }
        node.count = n.count;
        node
    }

    fn from_node48(n: &mut Node48) -> Self {
        debug_assert!(n.count as usize <= 16);
        let mut node = Self::new(mem::take(&mut n.prefix));
        let mut j = 0;
        for byte in 0..=255u8 {
            let idx = n.child_index[byte as usize];
            if idx != EMPTY_SLOT {
                node.keys[j] = byte;
                node.children[j] = mem::take(&mut n.children[idx as usize]);
                j += 1;
            }
        }
        node.count = j as u8;
        node
    }
}

impl Node48 {
    fn new(prefix: Prefix) -> Self {
        Self {
            prefix,
            count: 0,
            child_index: Box::new([EMPTY_SLOT; 256]),
            children: Box::new(empty_slots()),
        }
    }

    fn from_node16(n: &mut Node16) -> Self {
        let mut node = Self::new(mem::take(&mut n.prefix));
        for i in 0..n.count as usize {
            node.child_index[n.keys[i] as usize] = i as u8;
            node.children[i] = mem::take(&mut n.children[i]);
        }
        node.count = n.count;
        node
    }

    fn from_node256(n: &mut Node256) -> Self {
        debug_assert!(n.count as usize <= 48);
        let mut node = Self::new(mem::take(&mut n.prefix));
        let mut j = 0u8;
        for byte in 0..=255u8 {
            if !n.children[byte as usize].is_empty() {
                node.child_index[byte as usize] = j;
                node.children[j as usize] = mem::take(&mut n.children[byte as usize]);
                j += 1;
            }
        }
        node.count = j;
        node
    }
}

impl Node256 {
    fn new(prefix: Prefix) -> Self {
        Self {
            prefix,
            count: 0,
            children: Box::new(empty_slots()),
        }
    }

    fn from_node48(n: &mut Node48) -> Self {
        let mut node = Self::new(mem::take(&mut n.prefix));
        for byte in 0..=255u8 {
            let idx = n.child_index[byte as usize];
            if idx != EMPTY_SLOT {
                node.children[byte as usize] = mem::take(&mut n.children[idx as usize]);
            }
        }
        node.count = n.count as u16;
        node
    }
}

/// Sorted insert for the linear key array variants, shifting entries right
fn sorted_insert<const N: usize>(
    keys: &mut [u8; N],
    children: &mut [ChildSlot; N],
    count: usize,
    byte: u8,
    child: ChildSlot,
) {
    debug_assert!(count < N);
    let pos = keys[..count].iter().position(|&k| k >= byte).unwrap_or(count);
    let mut i = count;
    while i > pos {
        keys[i] = keys[i - 1];
        children.swap(i, i - 1);
        i -= 1;
    }
    keys[pos] = byte;
    children[pos] = child;
}

/// Erase for the linear key array variants, shifting entries left to close the gap
fn sorted_erase<const N: usize>(
    keys: &mut [u8; N],
    children: &mut [ChildSlot; N],
    count: usize,
    pos: usize,
) {
    assert!(pos < count, "erase position {pos} out of range");
    children[pos] = ChildSlot::default();
    for i in pos..count - 1 {
        keys[i] = keys[i + 1];
        children.swap(i, i + 1);
    }
    keys[count - 1] = 0;
    children[count - 1] = ChildSlot::default();
}

impl Node {
    pub fn tag(&self) -> NodeTag {
        match self {
            Node::Node4(_) => NodeTag::Node4,
            Node::Node16(_) => NodeTag::Node16,
            Node::Node48(_) => NodeTag::Node48,
            Node::Node256(_) => NodeTag::Node256,
            Node::Leaf(_) => NodeTag::Leaf,
        }
    }

    pub fn count(&self) -> usize {
        match self {
            Node::Node4(n) => n.count as usize,
            Node::Node16(n) => n.count as usize,
            Node::Node48(n) => n.count as usize,
            Node::Node256(n) => n.count as usize,
            Node::Leaf(_) => 0,
        }
    }

    pub fn prefix(&self) -> &[u8] {
        match self {
            Node::Node4(n) => &n.prefix,
            Node::Node16(n) => &n.prefix,
            Node::Node48(n) => &n.prefix,
            Node::Node256(n) => &n.prefix,
            Node::Leaf(n) => &n.prefix,
        }
    }

    pub fn prefix_mut(&mut self) -> &mut Prefix {
        match self {
            Node::Node4(n) => &mut n.prefix,
            Node::Node16(n) => &mut n.prefix,
            Node::Node48(n) => &mut n.prefix,
            Node::Node256(n) => &mut n.prefix,
            Node::Leaf(n) => &mut n.prefix,
        }
    }

    /// Position of the child keyed by discriminant byte `byte`, if any.
    /// Small variants use dense positions `0..count`, Node48/Node256 use the
    /// byte value itself.
    pub fn get_child_pos(&self, byte: u8) -> Option<usize> {
        match self {
            Node::Node4(n) => n.keys[..n.count as usize].iter().position(|&k| k == byte),
            Node::Node16(n) => n.keys[..n.count as usize].iter().position(|&k| k == byte),
            Node::Node48(n) => {
                (n.child_index[byte as usize] != EMPTY_SLOT).then_some(byte as usize)
            }
            Node::Node256(n) => (!n.children[byte as usize].is_empty()).then_some(byte as usize),
            Node::Leaf(_) => None,
        }
    }

    /// First child whose discriminant byte is `>= byte`, and whether it is exactly `byte`
    pub fn get_child_greater_equal(&self, byte: u8) -> Option<(usize, bool)> {
        match self {
            Node::Node4(n) => ge_in_sorted(&n.keys[..n.count as usize], byte),
            Node::Node16(n) => ge_in_sorted(&n.keys[..n.count as usize], byte),
            Node::Node48(n) => (byte as usize..256)
                .find(|&b| n.child_index[b] != EMPTY_SLOT)
                .map(|b| (b, b == byte as usize)),
            Node::Node256(n) => (byte as usize..256)
                .find(|&b| !n.children[b].is_empty())
                .map(|b| (b, b == byte as usize)),
            Node::Leaf(_) => None,
        }
    }

    /// Next occupied position after `pos` in ascending discriminant order;
    /// `None` as input starts before the first child
    pub fn get_next_pos(&self, pos: Option<usize>) -> Option<usize> {
        let start = pos.map_or(0, |p| p + 1);
        match self {
            Node::Node4(n) => (start < n.count as usize).then_some(start),
            Node::Node16(n) => (start < n.count as usize).then_some(start),
            Node::Node48(n) => (start..256).find(|&b| n.child_index[b] != EMPTY_SLOT),
            Node::Node256(n) => (start..256).find(|&b| !n.children[b].is_empty()),
            Node::Leaf(_) => None,
        }
    }

    /// Position of the smallest keyed child
    pub fn get_min(&self) -> usize {
        assert!(self.count() > 0, "get_min on an empty node");
        self.get_next_pos(None).expect("non-empty node")
    }

    /// Discriminant byte of the child at `pos`
    pub fn key_at_pos(&self, pos: usize) -> u8 {
        match self {
            Node::Node4(n) => {
                assert!(pos < n.count as usize);
                n.keys[pos]
            }
            Node::Node16(n) => {
                assert!(pos < n.count as usize);
                n.keys[pos]
            }
            Node::Node48(_) | Node::Node256(_) => {
                debug_assert!(self.slot_at(pos).is_some());
                pos as u8
            }
            Node::Leaf(_) => unreachable!("key_at_pos on a leaf"),
        }
    }

    fn slot_at(&self, pos: usize) -> Option<&ChildSlot> {
        match self {
            Node::Node4(n) => (pos < n.count as usize).then(|| &n.children[pos]),
            Node::Node16(n) => (pos < n.count as usize).then(|| &n.children[pos]),
            Node::Node48(n) => {
                let idx = n.child_index[pos];
                (idx != EMPTY_SLOT).then(|| &n.children[idx as usize])
            }
            Node::Node256(n) => (!n.children[pos].is_empty()).then(|| &n.children[pos]),
            Node::Leaf(_) => None,
        }
    }

    fn slot_at_mut(&mut self, pos: usize) -> &mut ChildSlot {
        match self {
            Node::Node4(n) => {
                assert!(pos < n.count as usize, "child position {pos} out of range");
                &mut n.children[pos]
            }
            Node::Node16(n) => {
                assert!(pos < n.count as usize, "child position {pos} out of range");
                &mut n.children[pos]
            }
            Node::Node48(n) => {
                let idx = n.child_index[pos];
                assert!(idx != EMPTY_SLOT, "child position {pos} unoccupied");
                &mut n.children[idx as usize]
            }
            Node::Node256(n) => {
                assert!(!n.children[pos].is_empty(), "child position {pos} unoccupied");
                &mut n.children[pos]
            }
            Node::Leaf(_) => unreachable!("child access on a leaf"),
        }
    }

    /// Child at `pos`, materializing it from the store on first access
    pub fn get_child(
        &mut self,
        store: &dyn BlockDevice,
        pos: usize,
    ) -> Result<&mut Box<Node>, Error> {
        self.slot_at_mut(pos).materialize(store)
    }

    /// Inserts `child` keyed by `byte` into the node held by `slot`, promoting the
    /// node to the next larger variant first if it is at capacity. The discriminant
    /// byte must not be present yet.
    pub fn insert_child(slot: &mut Box<Node>, byte: u8, child: Box<Node>) {
        debug_assert!(slot.get_child_pos(byte).is_none());
        match &mut **slot {
            Node::Node4(n) => {
                if (n.count as usize) < 4 {
                    sorted_insert(
                        &mut n.keys,
                        &mut n.children,
                        n.count as usize,
                        byte,
                        ChildSlot::resident(child),
                    );
                    n.count += 1;
                } else {
                    trace!("promote Node4 -> Node16");
                    **slot = Node::Node16(Node16::from_node4(n));
                    Self::insert_child(slot, byte, child);
                }
            }
            Node::Node16(n) => {
                if (n.count as usize) < 16 {
                    sorted_insert(
                        &mut n.keys,
                        &mut n.children,
                        n.count as usize,
                        byte,
                        ChildSlot::resident(child),
                    );
                    n.count += 1;
                } else {
                    trace!("promote Node16 -> Node48");
                    **slot = Node::Node48(Node48::from_node16(n));
                    Self::insert_child(slot, byte, child);
                }
            }
            Node::Node48(n) => {
                if (n.count as usize) < 48 {
                    let free = n
                        .children
                        .iter()
                        .position(|slot| slot.is_empty())
                        .expect("Node48 below capacity has a free slot");
                    n.child_index[byte as usize] = free as u8;
                    n.children[free] = ChildSlot::resident(child);
                    n.count += 1;
                } else {
                    trace!("promote Node48 -> Node256");
                    **slot = Node::Node256(Node256::from_node48(n));
                    Self::insert_child(slot, byte, child);
                }
            }
            Node::Node256(n) => {
                n.children[byte as usize] = ChildSlot::resident(child);
                n.count += 1;
            }
            Node::Leaf(_) => unreachable!("insert_child on a leaf"),
        }
    }

    /// Removes the child at `pos` from the node held by `slot`, releasing its
    /// subtree. A node left with a single child is collapsed into it (fusing
    /// prefixes); a node dropping to its shrink threshold is demoted to the next
    /// smaller variant.
    /// Materializes the sibling that would survive a collapse triggered by
    /// erasing `pos`. No-op unless the node holds exactly two children. Erase
    /// paths call this before mutating anything so a failed read leaves the
    /// tree untouched.
    pub fn materialize_collapse_survivor(
        slot: &mut Box<Node>,
        store: &dyn BlockDevice,
        pos: usize,
    ) -> Result<(), Error> {
        if slot.count() == 2 {
            let survivor = slot
                .get_next_pos(None)
                .filter(|&p| p != pos)
                .or_else(|| slot.get_next_pos(Some(pos)))
                .expect("two-child node has a survivor");
            slot.slot_at_mut(survivor).materialize(store)?;
        }
        Ok(())
    }

    pub fn erase_child(
        slot: &mut Box<Node>,
        store: &dyn BlockDevice,
        pos: usize,
    ) -> Result<(), Error> {
        // The survivor of a collapse needs its prefix fused
        Self::materialize_collapse_survivor(slot, store, pos)?;

        enum Shrink {
            Keep,
            Collapse,
            To4,
            To16,
            To48,
        }
        let shrink = match &mut **slot {
            Node::Node4(n) => {
                sorted_erase(&mut n.keys, &mut n.children, n.count as usize, pos);
                n.count -= 1;
                match n.count {
                    1 => Shrink::Collapse,
                    _ => Shrink::Keep,
                }
            }
            Node::Node16(n) => {
                sorted_erase(&mut n.keys, &mut n.children, n.count as usize, pos);
                n.count -= 1;
                match n.count as usize {
                    1 => Shrink::Collapse,
                    NODE16_SHRINK => Shrink::To4,
                    _ => Shrink::Keep,
                }
            }
            Node::Node48(n) => {
                let idx = n.child_index[pos];
                assert!(idx != EMPTY_SLOT, "erase position {pos} unoccupied");
                n.children[idx as usize] = ChildSlot::default();
                n.child_index[pos] = EMPTY_SLOT;
                n.count -= 1;
                match n.count as usize {
                    1 => Shrink::Collapse,
                    NODE48_SHRINK => Shrink::To16,
                    _ => Shrink::Keep,
                }
            }
            Node::Node256(n) => {
                assert!(!n.children[pos].is_empty(), "erase position {pos} unoccupied");
                n.children[pos] = ChildSlot::default();
                n.count -= 1;
                match n.count as usize {
                    1 => Shrink::Collapse,
                    NODE256_SHRINK => Shrink::To48,
                    _ => Shrink::Keep,
                }
            }
            Node::Leaf(_) => unreachable!("erase_child on a leaf"),
        };

        match shrink {
            Shrink::Keep => {}
            Shrink::Collapse => Self::collapse(slot),
            Shrink::To4 => {
                trace!("demote Node16 -> Node4");
                let Node::Node16(n) = &mut **slot else {
                    unreachable!()
                };
                **slot = Node::Node4(Node4::from_node16(n));
            }
            Shrink::To16 => {
                trace!("demote Node48 -> Node16");
                let Node::Node48(n) = &mut **slot else {
                    unreachable!()
                };
                **slot = Node::Node16(Node16::from_node48(n));
            }
            Shrink::To48 => {
                trace!("demote Node256 -> Node48");
                let Node::Node256(n) = &mut **slot else {
                    unreachable!()
                };
                **slot = Node::Node48(Node48::from_node256(n));
            }
        }
        Ok(())
    }

    /// Replaces a one-child node with that child, prepending the node's prefix
    /// and the child's discriminant byte to the child's own prefix
    fn collapse(slot: &mut Box<Node>) {
        debug_assert_eq!(slot.count(), 1);
        let pos = slot.get_min();
        let byte = slot.key_at_pos(pos);
        let mut child = slot
            .slot_at_mut(pos)
            .node
            .take()
            .expect("collapse survivor is resident");

        let mut fused = Prefix::new();
        fused.extend(slot.prefix().iter().copied());
        fused.push(byte);
        fused.extend(child.prefix().iter().copied());
        trace!(
            "collapse {:?} into {:?} child, fused prefix len {}",
            slot.tag(),
            child.tag(),
            fused.len()
        );
        *child.prefix_mut() = fused;
        *slot = child;
    }

    /// Persists the node graph depth-first in post-order. The returned pointer
    /// addresses this node's own record, written after all of its children.
    /// Unmaterialized stubs re-emit their recorded address without being loaded.
    pub fn serialize(&mut self, writer: &mut MetaBlockWriter<'_>) -> Result<BlockPointer, Error> {
        match self {
            Node::Leaf(leaf) => leaf.serialize(writer),
            Node::Node4(n) => {
                let addrs = serialize_children(&mut n.children, writer)?;
                let pos = writer.pos()?;
                write_record_head(writer, NodeTag::Node4, n.count as u16, &n.prefix)?;
                writer.write(&n.keys)?;
                write_addrs(writer, &addrs)?;
                Ok(pos)
            }
            Node::Node16(n) => {
                let addrs = serialize_children(&mut n.children, writer)?;
                let pos = writer.pos()?;
                write_record_head(writer, NodeTag::Node16, n.count as u16, &n.prefix)?;
                writer.write(&n.keys)?;
                write_addrs(writer, &addrs)?;
                Ok(pos)
            }
            Node::Node48(n) => {
                let addrs = serialize_children(&mut n.children[..], writer)?;
                let pos = writer.pos()?;
                write_record_head(writer, NodeTag::Node48, n.count as u16, &n.prefix)?;
                writer.write(&n.child_index[..])?;
                write_addrs(writer, &addrs)?;
                Ok(pos)
            }
            Node::Node256(n) => {
                let addrs = serialize_children(&mut n.children[..], writer)?;
                let pos = writer.pos()?;
                write_record_head(writer, NodeTag::Node256, n.count, &n.prefix)?;
                write_addrs(writer, &addrs)?;
                Ok(pos)
            }
        }
    }

    /// Reads one node record, leaving all children as on-disk stubs
    pub fn deserialize(reader: &mut MetaBlockReader<'_>) -> Result<Box<Node>, Error> {
        let header: NodeRecordHeader = reader.read_repr()?;
        let tag = header.validate()?;
        let count = header.count.get() as usize;
        let mut prefix_buf = vec![0u8; header.prefix_len.get() as usize];
        reader.read(&mut prefix_buf)?;
        let prefix: Prefix = prefix_buf.iter().copied().collect();

        let node = match tag {
            NodeTag::Leaf => Node::Leaf(Leaf::deserialize(reader, count, prefix)?),
            NodeTag::Node4 => {
                let mut keys = [0u8; 4];
                reader.read(&mut keys)?;
                let children = read_slots::<4>(reader)?;
                validate_sorted_keys(&keys[..count], &children, tag)?;
                Node::Node4(Node4 {
                    prefix,
                    count: count as u8,
                    keys,
                    children,
                })
            }
            NodeTag::Node16 => {
                let mut keys = [0u8; 16];
                reader.read(&mut keys)?;
                let children = read_slots::<16>(reader)?;
                validate_sorted_keys(&keys[..count], &children, tag)?;
                Node::Node16(Node16 {
                    prefix,
                    count: count as u8,
                    keys,
                    children,
                })
            }
            NodeTag::Node48 => {
                let mut child_index = Box::new([0u8; 256]);
                reader.read(&mut child_index[..])?;
                let children = Box::new(read_slots::<48>(reader)?);
                let mut occupied = 0;
                let mut seen = [false; 48];
                for &idx in child_index.iter() {
                    if idx == EMPTY_SLOT {
                        continue;
                    }
                    if idx as usize >= 48 || mem::replace(&mut seen[idx as usize], true) {
                        return Err(error_corruption!("Corrupt Node48 child index {idx}"));
                    }
                    if !children[idx as usize].addr.is_valid() {
                        return Err(error_corruption!(
                            "Node48 occupied slot {idx} has no child address"
                        ));
                    }
                    occupied += 1;
                }
                if occupied != count {
                    return Err(error_corruption!(
                        "Node48 count {count} does not match {occupied} occupied slots"
                    ));
                }
                Node::Node48(Node48 {
                    prefix,
                    count: count as u8,
                    child_index,
                    children,
                })
            }
            NodeTag::Node256 => {
                let children = Box::new(read_slots::<256>(reader)?);
                let occupied = children.iter().filter(|slot| slot.addr.is_valid()).count();
                if occupied != count {
                    return Err(error_corruption!(
                        "Node256 count {count} does not match {occupied} occupied slots"
                    ));
                }
                Node::Node256(Node256 {
                    prefix,
                    count: count as u16,
                    children,
                })
            }
        };
        Ok(Box::new(node))
    }
}

fn ge_in_sorted(keys: &[u8], byte: u8) -> Option<(usize, bool)> {
    keys.iter()
        .position(|&k| k >= byte)
        .map(|pos| (pos, keys[pos] == byte))
}

fn serialize_children(
    children: &mut [ChildSlot],
    writer: &mut MetaBlockWriter<'_>,
) -> Result<SmallVec<ChildAddr, 16>, Error> {
    let mut addrs = SmallVec::new();
    for slot in children {
        let addr = if let Some(node) = &mut slot.node {
            let pos = node.serialize(writer)?;
            ChildAddr::new(pos.block, pos.offset)
        } else {
            // Unmaterialized stubs keep their prior address, empty slots the sentinel
            slot.addr
        };
        if addr.is_valid() {
            slot.addr = addr;
        }
        addrs.push(addr);
    }
    Ok(addrs)
}

fn write_record_head(
    writer: &mut MetaBlockWriter<'_>,
    tag: NodeTag,
    count: u16,
    prefix: &[u8],
) -> Result<(), Error> {
    let header = NodeRecordHeader::new(tag, count, prefix.len() as u32);
    writer.write(zerocopy::IntoBytes::as_bytes(&header))?;
    writer.write(prefix)
}

fn write_addrs(writer: &mut MetaBlockWriter<'_>, addrs: &[ChildAddr]) -> Result<(), Error> {
    for addr in addrs {
        writer.write(zerocopy::IntoBytes::as_bytes(addr))?;
    }
    Ok(())
}

fn read_slots<const N: usize>(reader: &mut MetaBlockReader<'_>) -> Result<[ChildSlot; N], Error> {
    let mut slots = empty_slots::<N>();
    for slot in &mut slots {
        slot.addr = reader.read_repr::<ChildAddr>()?;
    }
    Ok(slots)
}

fn validate_sorted_keys(keys: &[u8], children: &[ChildSlot], tag: NodeTag) -> Result<(), Error> {
    if !keys.windows(2).all(|w| w[0] < w[1]) {
        return Err(error_corruption!("{tag:?} keys out of order: {keys:?}"));
    }
    for (i, slot) in children[..keys.len()].iter().enumerate() {
        if !slot.addr.is_valid() {
            return Err(error_corruption!(
                "{tag:?} occupied position {i} has no child address"
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
impl Node {
    /// Recursively materializes every child below this node
    pub(crate) fn force_materialize(&mut self, store: &dyn BlockDevice) -> Result<(), Error> {
        let mut pos = self.get_next_pos(None);
        while let Some(p) = pos {
            self.get_child(store, p)?.force_materialize(store)?;
            pos = self.get_next_pos(Some(p));
        }
        Ok(())
    }

    /// Structural equality: tag, prefix, count, discriminant bytes and children,
    /// ignoring persisted addresses. Unmaterialized children never compare equal.
    pub(crate) fn deep_eq(&self, other: &Node) -> bool {
        if self.tag() != other.tag()
            || self.prefix() != other.prefix()
            || self.count() != other.count()
        {
            return false;
        }
        if let (Node::Leaf(a), Node::Leaf(b)) = (self, other) {
            return a.row_ids == b.row_ids;
        }
        let mut pos_a = self.get_next_pos(None);
        let mut pos_b = other.get_next_pos(None);
        while let (Some(a), Some(b)) = (pos_a, pos_b) {
            if self.key_at_pos(a) != other.key_at_pos(b) {
                return false;
            }
            let (slot_a, slot_b) = (self.slot_at(a).unwrap(), other.slot_at(b).unwrap());
            match (&slot_a.node, &slot_b.node) {
                (Some(a), Some(b)) if a.deep_eq(b) => {}
                _ => return false,
            }
            pos_a = self.get_next_pos(Some(a));
            pos_b = other.get_next_pos(Some(b));
        }
        pos_a.is_none() && pos_b.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn leaf(row: RowId) -> Box<Node> {
        Box::new(Node::Leaf(Leaf::new(Prefix::new(), row)))
    }

    fn leaf_with_prefix(prefix: &[u8], row: RowId) -> Box<Node> {
        Box::new(Node::Leaf(Leaf::new(prefix_from(prefix), row)))
    }

    use crate::repr::RowId;

    fn node_with_keys(keys: &[u8]) -> Box<Node> {
        let mut node: Box<Node> = Box::new(Node::Node4(Node4::new(Prefix::new())));
        for &k in keys {
            Node::insert_child(&mut node, k, leaf(k as RowId));
        }
        node
    }

    fn collect_keys(node: &Node) -> Vec<u8> {
        let mut out = Vec::new();
        let mut pos = node.get_next_pos(None);
        while let Some(p) = pos {
            out.push(node.key_at_pos(p));
            pos = node.get_next_pos(Some(p));
        }
        out
    }

    #[test]
    fn promotion_chain() {
        let mut expected = Vec::new();
        let mut node: Box<Node> = Box::new(Node::Node4(Node4::new(Prefix::new())));
        // Insert in descending order so sortedness isn't an artifact of insertion order
        for k in (0..=255u8).rev() {
            Node::insert_child(&mut node, k, leaf(k as RowId));
            expected.push(k);
            let count = expected.len();
            let tag = node.tag();
            match count {
                0..=4 => assert_eq!(tag, NodeTag::Node4),
                5..=16 => assert_eq!(tag, NodeTag::Node16),
                17..=48 => assert_eq!(tag, NodeTag::Node48),
                _ => assert_eq!(tag, NodeTag::Node256),
            }
            assert_eq!(node.count(), count);
        }
        let mut sorted = expected.clone();
        sorted.sort_unstable();
        assert_eq!(collect_keys(&node), sorted);
        // Every key is found at the position reporting its discriminant byte
        for k in 0..=255u8 {
            let pos = node.get_child_pos(k).unwrap();
            assert_eq!(node.key_at_pos(pos), k);
        }
    }

    #[test]
    fn ordering_invariant_random() {
        use rand::prelude::*;
        let mut rng = rand::rngs::SmallRng::seed_from_u64(7);
        for _ in 0..50 {
            let mut keys: Vec<u8> = (0..=255).collect();
            keys.shuffle(&mut rng);
            let n = rng.random_range(2..=keys.len());
            let node = node_with_keys(&keys[..n]);
            let collected = collect_keys(&node);
            assert!(collected.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(collected.len(), n);
        }
    }

    #[test]
    fn greater_equal_scan_boundary() {
        // Same contract across all four variants
        for fill in [0usize, 8, 30, 120] {
            let mut keys = vec![0x05u8, 0x0A, 0x0F];
            keys.extend(0x80..0x80 + fill as u8);
            let node = node_with_keys(&keys);

            let (pos, equal) = node.get_child_greater_equal(0x08).unwrap();
            assert_eq!((node.key_at_pos(pos), equal), (0x0A, false));
            let (pos, equal) = node.get_child_greater_equal(0x0A).unwrap();
            assert_eq!((node.key_at_pos(pos), equal), (0x0A, true));
            if fill == 0 {
                assert_eq!(node.get_child_greater_equal(0x10), None);
            } else {
                let (pos, equal) = node.get_child_greater_equal(0x10).unwrap();
                assert_eq!((node.key_at_pos(pos), equal), (0x80, false));
            }
        }
    }

    #[test]
    fn collapse_fuses_prefixes() {
        let store = MemStore::new();
        // Node4 with prefix [], children 0x10 -> leaf A (prefix []) and
        // 0x20 -> leaf B (prefix [0x05]). Erasing 0x10 must leave a single
        // leaf with prefix [0x20, 0x05].
        let mut node: Box<Node> = Box::new(Node::Node4(Node4::new(Prefix::new())));
        Node::insert_child(&mut node, 0x10, leaf_with_prefix(&[], 1));
        Node::insert_child(&mut node, 0x20, leaf_with_prefix(&[0x05], 2));

        let pos = node.get_child_pos(0x10).unwrap();
        Node::erase_child(&mut node, &store, pos).unwrap();

        assert_eq!(node.tag(), NodeTag::Leaf);
        assert_eq!(node.prefix(), &[0x20, 0x05]);
        let Node::Leaf(leaf) = &*node else { unreachable!() };
        assert_eq!(leaf.row_ids, vec![2]);
    }

    #[test]
    fn collapse_with_parent_prefix() {
        let store = MemStore::new();
        let mut node: Box<Node> = Box::new(Node::Node4(Node4::new(prefix_from(&[0xAA, 0xBB]))));
        Node::insert_child(&mut node, 0x01, leaf_with_prefix(&[0xCC], 1));
        Node::insert_child(&mut node, 0x02, leaf_with_prefix(&[], 2));

        let pos = node.get_child_pos(0x02).unwrap();
        Node::erase_child(&mut node, &store, pos).unwrap();
        assert_eq!(node.prefix(), &[0xAA, 0xBB, 0x01, 0xCC]);
    }

    #[test]
    fn demotion_chain() {
        let store = MemStore::new();
        let mut node = node_with_keys(&(0..=255).collect::<Vec<_>>());
        assert_eq!(node.tag(), NodeTag::Node256);
        // Erase top down so the surviving keys stay 0..n
        for k in (2..=255u8).rev() {
            let pos = node.get_child_pos(k).unwrap();
            Node::erase_child(&mut node, &store, pos).unwrap();
            let count = k as usize;
            let tag = node.tag();
            match count {
                0..=NODE16_SHRINK => assert_eq!(tag, NodeTag::Node4),
                4..=NODE48_SHRINK => assert_eq!(tag, NodeTag::Node16),
                13..=NODE256_SHRINK => assert_eq!(tag, NodeTag::Node48),
                _ => assert_eq!(tag, NodeTag::Node256),
            }
            assert_eq!(node.count(), count);
            assert_eq!(collect_keys(&node), (0..k).collect::<Vec<_>>());
        }
        // Down to two children; one more erase collapses into the survivor
        let pos = node.get_child_pos(1).unwrap();
        Node::erase_child(&mut node, &store, pos).unwrap();
        assert_eq!(node.tag(), NodeTag::Leaf);
        assert_eq!(node.prefix(), &[0x00]);
    }

    #[test]
    fn serialize_round_trip() {
        let store = MemStore::new();
        // Two levels: a Node16 whose children include another inner node and leaves
        let mut inner = node_with_keys(&[1, 2, 3]);
        *inner.prefix_mut() = prefix_from(b"in");
        let mut root: Box<Node> = Box::new(Node::Node4(Node4::new(prefix_from(b"root"))));
        Node::insert_child(&mut root, 0x61, inner);
        for k in [0x10u8, 0x42, 0x99, 0xFE] {
            Node::insert_child(&mut root, k, leaf_with_prefix(b"suffix", k as RowId));
        }
        assert_eq!(root.tag(), NodeTag::Node16);

        let mut writer = MetaBlockWriter::new(&store).unwrap();
        let pos = root.serialize(&mut writer).unwrap();
        writer.finish().unwrap();

        let mut reader = MetaBlockReader::new(&store, pos).unwrap();
        let mut loaded = Node::deserialize(&mut reader).unwrap();
        assert_eq!(loaded.tag(), NodeTag::Node16);
        assert_eq!(loaded.prefix(), b"root");
        loaded.force_materialize(&store).unwrap();
        assert!(loaded.deep_eq(&root));
    }

    #[test]
    fn round_trip_all_variants() {
        let store = MemStore::new();
        for n in [3usize, 10, 40, 200] {
            let keys: Vec<u8> = (0..n as u8).map(|k| k.wrapping_mul(5)).collect();
            let mut node = node_with_keys(&keys);
            let mut writer = MetaBlockWriter::new(&store).unwrap();
            let pos = node.serialize(&mut writer).unwrap();
            writer.finish().unwrap();

            let mut reader = MetaBlockReader::new(&store, pos).unwrap();
            let mut loaded = Node::deserialize(&mut reader).unwrap();
            loaded.force_materialize(&store).unwrap();
            assert!(loaded.deep_eq(&node), "variant with {n} children");
        }
    }

    #[test]
    fn lazy_materialization_is_transparent() {
        let store = MemStore::new();
        let mut node = node_with_keys(&[5, 10, 15]);
        let mut writer = MetaBlockWriter::new(&store).unwrap();
        let pos = node.serialize(&mut writer).unwrap();
        writer.finish().unwrap();

        let mut reader = MetaBlockReader::new(&store, pos).unwrap();
        let mut lazy = Node::deserialize(&mut reader).unwrap();
        // Children start as stubs
        assert!(lazy.slot_at(0).unwrap().node.is_none());
        assert!(lazy.slot_at(0).unwrap().addr.is_valid());

        let pos10 = lazy.get_child_pos(10).unwrap();
        let child = lazy.get_child(&store, pos10).unwrap();
        assert_eq!(child.tag(), NodeTag::Leaf);
        let Node::Leaf(child_leaf) = &**child else { unreachable!() };
        assert_eq!(child_leaf.row_ids, vec![10]);

        // Second access hits the cache and observes the same child
        assert!(lazy.slot_at(pos10).unwrap().node.is_some());
        let again = lazy.get_child(&store, pos10).unwrap();
        let Node::Leaf(again_leaf) = &**again else { unreachable!() };
        assert_eq!(again_leaf.row_ids, vec![10]);
    }

    #[test]
    fn serialize_preserves_unmaterialized_stubs() {
        let store = MemStore::new();
        let mut node = node_with_keys(&[1, 2, 3]);
        let mut writer = MetaBlockWriter::new(&store).unwrap();
        let pos = node.serialize(&mut writer).unwrap();
        writer.finish().unwrap();

        let mut reader = MetaBlockReader::new(&store, pos).unwrap();
        let mut lazy = Node::deserialize(&mut reader).unwrap();
        // Materialize a single child, then re-serialize without touching the others
        let p = lazy.get_child_pos(2).unwrap();
        lazy.get_child(&store, p).unwrap();
        let mut writer = MetaBlockWriter::new(&store).unwrap();
        let pos2 = lazy.serialize(&mut writer).unwrap();
        writer.finish().unwrap();

        let mut reader = MetaBlockReader::new(&store, pos2).unwrap();
        let mut reloaded = Node::deserialize(&mut reader).unwrap();
        reloaded.force_materialize(&store).unwrap();
        lazy.force_materialize(&store).unwrap();
        assert!(reloaded.deep_eq(&lazy));
    }

    #[test]
    fn corrupt_records_rejected() {
        let store = MemStore::new();
        let mut writer = MetaBlockWriter::new(&store).unwrap();
        let pos = writer.pos().unwrap();
        // Unknown tag
        writer.write(&[9u8, 1, 0, 0, 0, 0, 0]).unwrap();
        writer.finish().unwrap();
        let mut reader = MetaBlockReader::new(&store, pos).unwrap();
        assert!(matches!(
            Node::deserialize(&mut reader),
            Err(Error::Corruption(_))
        ));

        // Count above capacity
        let mut writer = MetaBlockWriter::new(&store).unwrap();
        let pos = writer.pos().unwrap();
        write_record_head(&mut writer, NodeTag::Node4, 5, &[]).unwrap();
        writer.finish().unwrap();
        let mut reader = MetaBlockReader::new(&store, pos).unwrap();
        assert!(matches!(
            Node::deserialize(&mut reader),
            Err(Error::Corruption(_))
        ));

        // Keys out of order
        let mut writer = MetaBlockWriter::new(&store).unwrap();
        let pos = writer.pos().unwrap();
        write_record_head(&mut writer, NodeTag::Node4, 2, &[]).unwrap();
        writer.write(&[9u8, 3, 0, 0]).unwrap();
        write_addrs(&mut writer, &[ChildAddr::new(0, 8); 4]).unwrap();
        writer.finish().unwrap();
        let mut reader = MetaBlockReader::new(&store, pos).unwrap();
        assert!(matches!(
            Node::deserialize(&mut reader),
            Err(Error::Corruption(_))
        ));
    }
}
