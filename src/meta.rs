//! Append-only meta block writer and the matching seekable reader.
//!
//! Node graphs are persisted as a chain of fixed size blocks. The first 8 bytes of
//! every meta block hold the id of the next block in the chain (or [INVALID_BLOCK]
//! for the tail) so a reader positioned anywhere in the chain can stream forward
//! across block boundaries. Values are split across boundaries arbitrarily.

use std::mem::size_of;

use zerocopy::byteorder::little_endian::U64;
use zerocopy::{FromBytes, IntoBytes};

use crate::{
    error::error_corruption,
    repr::{BlockId, INVALID_BLOCK},
    store::BlockDevice,
    Error, BLOCK_SIZE,
};

const NEXT_PTR_SIZE: usize = size_of::<u64>();

/// Address of a serialized record inside a meta block chain.
/// Offsets are counted from the block start, so valid payload offsets are
/// `NEXT_PTR_SIZE..BLOCK_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPointer {
    pub block: BlockId,
    pub offset: u64,
}

/// Buffered writer appending to a fresh chain of meta blocks
pub struct MetaBlockWriter<'store> {
    store: &'store dyn BlockDevice,
    buf: Box<[u8; BLOCK_SIZE]>,
    block: BlockId,
    offset: usize,
}

impl<'store> MetaBlockWriter<'store> {
    pub fn new(store: &'store dyn BlockDevice) -> Result<Self, Error> {
        let block = store.allocate_block()?;
        let mut buf = Box::new([0u8; BLOCK_SIZE]);
        buf[..NEXT_PTR_SIZE].copy_from_slice(&INVALID_BLOCK.to_le_bytes());
        Ok(Self {
            store,
            buf,
            block,
            offset: NEXT_PTR_SIZE,
        })
    }

    /// Current write cursor. The next byte written lands exactly here.
    pub fn pos(&mut self) -> Result<BlockPointer, Error> {
        if self.offset == BLOCK_SIZE {
            self.advance_block()?;
        }
        Ok(BlockPointer {
            block: self.block,
            offset: self.offset as u64,
        })
    }

    pub fn write(&mut self, mut data: &[u8]) -> Result<(), Error> {
        while !data.is_empty() {
            if self.offset == BLOCK_SIZE {
                self.advance_block()?;
            }
            let n = data.len().min(BLOCK_SIZE - self.offset);
            self.buf[self.offset..self.offset + n].copy_from_slice(&data[..n]);
            self.offset += n;
            data = &data[n..];
        }
        Ok(())
    }

    #[inline]
    pub fn write_u8(&mut self, value: u8) -> Result<(), Error> {
        self.write(&[value])
    }

    #[inline]
    pub fn write_u16(&mut self, value: u16) -> Result<(), Error> {
        self.write(&value.to_le_bytes())
    }

    #[inline]
    pub fn write_u32(&mut self, value: u32) -> Result<(), Error> {
        self.write(&value.to_le_bytes())
    }

    #[inline]
    pub fn write_u64(&mut self, value: u64) -> Result<(), Error> {
        self.write(&value.to_le_bytes())
    }

    /// Writes the tail block out. Must be called once writing is complete,
    /// nothing is durable before this.
    pub fn finish(self) -> Result<(), Error> {
        self.store.write_block(self.block, &self.buf)?;
        Ok(())
    }

    fn advance_block(&mut self) -> Result<(), Error> {
        let next = self.store.allocate_block()?;
        self.buf[..NEXT_PTR_SIZE].copy_from_slice(&next.to_le_bytes());
        self.store.write_block(self.block, &self.buf)?;
        trace!("meta block {} -> {}", self.block, next);
        self.buf.fill(0);
        self.buf[..NEXT_PTR_SIZE].copy_from_slice(&INVALID_BLOCK.to_le_bytes());
        self.block = next;
        self.offset = NEXT_PTR_SIZE;
        Ok(())
    }
}

/// Reader positioned inside a meta block chain, following next pointers on demand
pub struct MetaBlockReader<'store> {
    store: &'store dyn BlockDevice,
    buf: Box<[u8; BLOCK_SIZE]>,
    block: BlockId,
    offset: usize,
}

impl<'store> MetaBlockReader<'store> {
    pub fn new(store: &'store dyn BlockDevice, pos: BlockPointer) -> Result<Self, Error> {
        let mut reader = Self {
            store,
            buf: Box::new([0u8; BLOCK_SIZE]),
            block: INVALID_BLOCK,
            offset: NEXT_PTR_SIZE,
        };
        reader.seek(pos)?;
        Ok(reader)
    }

    pub fn seek(&mut self, pos: BlockPointer) -> Result<(), Error> {
        let offset = pos.offset as usize;
        if !(NEXT_PTR_SIZE..BLOCK_SIZE).contains(&offset) {
            return Err(error_corruption!(
                "Meta pointer offset {offset} out of range"
            ));
        }
        if pos.block != self.block {
            self.store.read_block(pos.block, &mut self.buf)?;
            self.block = pos.block;
        }
        self.offset = offset;
        Ok(())
    }

    pub fn read(&mut self, mut out: &mut [u8]) -> Result<(), Error> {
        while !out.is_empty() {
            if self.offset == BLOCK_SIZE {
                self.advance_block()?;
            }
            let n = out.len().min(BLOCK_SIZE - self.offset);
            let (dst, rest) = out.split_at_mut(n);
            dst.copy_from_slice(&self.buf[self.offset..self.offset + n]);
            self.offset += n;
            out = rest;
        }
        Ok(())
    }

    #[inline]
    pub fn read_u8(&mut self) -> Result<u8, Error> {
        let mut buf = [0u8; 1];
        self.read(&mut buf)?;
        Ok(buf[0])
    }

    #[inline]
    pub fn read_u64(&mut self) -> Result<u64, Error> {
        let mut buf = [0u8; 8];
        self.read(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads a fixed-width zerocopy value
    pub fn read_repr<T: FromBytes + IntoBytes>(&mut self) -> Result<T, Error> {
        let mut value = T::new_zeroed();
        self.read(value.as_mut_bytes())?;
        Ok(value)
    }

    fn advance_block(&mut self) -> Result<(), Error> {
        let next = U64::read_from_bytes(&self.buf[..NEXT_PTR_SIZE])
            .expect("meta header size")
            .get();
        if next == INVALID_BLOCK {
            return Err(error_corruption!(
                "Read past the end of meta chain at block {}",
                self.block
            ));
        }
        self.store.read_block(next, &mut self.buf)?;
        self.block = next;
        self.offset = NEXT_PTR_SIZE;
        Ok(())
    }
}
