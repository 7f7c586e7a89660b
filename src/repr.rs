use std::fmt;

use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::error_corruption;
use crate::Error;

pub type BlockId = u64;
pub type RowId = u64;

/// Sentinel for both halves of an absent child address
pub const INVALID_BLOCK: u64 = u64::MAX;

/// Node48 child index value for bytes with no child.
/// Valid indexes are 0..48 so any value >= 48 works.
pub const EMPTY_SLOT: u8 = 48;

/// Upper bound accepted for a deserialized prefix length.
/// Anything above this is treated as a corrupt header rather than an allocation request.
pub const MAX_PREFIX_LEN: usize = 1 << 20;

/// Discriminant persisted at the head of every node record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeTag {
    Node4 = 1,
    Node16 = 2,
    Node48 = 3,
    Node256 = 4,
    Leaf = 5,
}

impl NodeTag {
    pub fn from_u8(raw: u8) -> Result<Self, Error> {
        match raw {
            1 => Ok(NodeTag::Node4),
            2 => Ok(NodeTag::Node16),
            3 => Ok(NodeTag::Node48),
            4 => Ok(NodeTag::Node256),
            5 => Ok(NodeTag::Leaf),
            _ => Err(error_corruption!("Unknown node tag {raw}")),
        }
    }

    pub fn capacity(self) -> usize {
        match self {
            NodeTag::Node4 => 4,
            NodeTag::Node16 => 16,
            NodeTag::Node48 => 48,
            NodeTag::Node256 => 256,
            NodeTag::Leaf => 0,
        }
    }
}

/// Persisted `(block, offset)` address of a serialized node
#[derive(Default, Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, PartialEq, Eq)]
#[repr(packed)]
pub struct ChildAddr {
    pub block: U64,
    pub offset: U64,
}

impl ChildAddr {
    pub const INVALID: ChildAddr = ChildAddr {
        block: U64::from_bytes(u64::MAX.to_le_bytes()),
        offset: U64::from_bytes(u64::MAX.to_le_bytes()),
    };

    #[inline]
    pub fn new(block: BlockId, offset: u64) -> Self {
        Self {
            block: U64::new(block),
            offset: U64::new(offset),
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.block.get() != INVALID_BLOCK
    }
}

impl fmt::Debug for ChildAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            f.debug_tuple("ChildAddr")
                .field(&self.block.get())
                .field(&self.offset.get())
                .finish()
        } else {
            write!(f, "ChildAddr(invalid)")
        }
    }
}

/// Fixed head of every node record: `[tag][count][prefix_len]`,
/// followed by the prefix bytes and the variant specific arrays
#[derive(Default, Copy, Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
pub struct NodeRecordHeader {
    pub tag: u8,
    pub count: U16,
    pub prefix_len: U32,
}

impl NodeRecordHeader {
    pub fn new(tag: NodeTag, count: u16, prefix_len: u32) -> Self {
        Self {
            tag: tag as u8,
            count: U16::new(count),
            prefix_len: U32::new(prefix_len),
        }
    }

    pub fn validate(&self) -> Result<NodeTag, Error> {
        let tag = NodeTag::from_u8(self.tag)?;
        let count = self.count.get() as usize;
        let max_count = match tag {
            // Leaf count is the number of row ids
            NodeTag::Leaf => u16::MAX as usize,
            _ => tag.capacity(),
        };
        if count > max_count {
            return Err(error_corruption!(
                "Node count {count} exceeds capacity of {tag:?}"
            ));
        }
        if self.prefix_len.get() as usize > MAX_PREFIX_LEN {
            return Err(error_corruption!(
                "Implausible prefix length {}",
                self.prefix_len.get()
            ));
        }
        Ok(tag)
    }
}
