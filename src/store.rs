use std::{
    fs::{File, OpenOptions},
    path::Path,
};

use parking_lot::{Mutex, RwLock};

use crate::{
    error::{error_corruption, io_invalid_input},
    repr::BlockId,
    utils::FileExt,
    Error, BLOCK_SIZE,
};

/// Append-only, block addressed byte storage shared by every index persisted into it.
///
/// Blocks are allocated monotonically and written exactly once; already written blocks
/// are immutable, so concurrent readers need no locking beyond what the implementation
/// uses internally for its own bookkeeping.
pub trait BlockDevice: Send + Sync {
    /// Reserves a fresh block id. The block contents are undefined until written.
    fn allocate_block(&self) -> Result<BlockId, Error>;
    /// Writes a full block. `id` must have been previously allocated.
    fn write_block(&self, id: BlockId, data: &[u8; BLOCK_SIZE]) -> Result<(), Error>;
    /// Reads back a previously written block.
    fn read_block(&self, id: BlockId, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), Error>;
}

/// Block device backed by a single file, block `i` at byte offset `i * BLOCK_SIZE`
#[derive(Debug)]
pub struct FileStore {
    file: File,
    next_block: Mutex<BlockId>,
}

impl FileStore {
    /// Opens (or creates) a store file. Allocation resumes after the last full block
    /// already present in the file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        let next_block = len / BLOCK_SIZE as u64;
        Ok(Self {
            file,
            next_block: Mutex::new(next_block),
        })
    }

    /// Flushes file contents to stable storage
    pub fn sync(&self) -> Result<(), Error> {
        self.file.sync_data()?;
        Ok(())
    }
}

impl BlockDevice for FileStore {
    fn allocate_block(&self) -> Result<BlockId, Error> {
        let mut next = self.next_block.lock();
        let id = *next;
        *next += 1;
        Ok(id)
    }

    fn write_block(&self, id: BlockId, data: &[u8; BLOCK_SIZE]) -> Result<(), Error> {
        if id >= *self.next_block.lock() {
            return Err(io_invalid_input!("Write to unallocated block {id}"));
        }
        self.file.write_all_at(data, id * BLOCK_SIZE as u64)?;
        Ok(())
    }

    fn read_block(&self, id: BlockId, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), Error> {
        self.file
            .read_exact_at(buf, id * BLOCK_SIZE as u64)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    error_corruption!("Short read of block {id}")
                } else {
                    e.into()
                }
            })
    }
}

/// In-memory block device for tests and ephemeral indexes
#[derive(Debug, Default)]
pub struct MemStore {
    blocks: RwLock<Vec<Box<[u8; BLOCK_SIZE]>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of allocated blocks
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockDevice for MemStore {
    fn allocate_block(&self) -> Result<BlockId, Error> {
        let mut blocks = self.blocks.write();
        blocks.push(Box::new([0u8; BLOCK_SIZE]));
        Ok(blocks.len() as BlockId - 1)
    }

    fn write_block(&self, id: BlockId, data: &[u8; BLOCK_SIZE]) -> Result<(), Error> {
        let mut blocks = self.blocks.write();
        let block = blocks
            .get_mut(id as usize)
            .ok_or_else(|| io_invalid_input!("Write to unallocated block {id}"))?;
        block.copy_from_slice(data);
        Ok(())
    }

    fn read_block(&self, id: BlockId, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), Error> {
        let blocks = self.blocks.read();
        let block = blocks
            .get(id as usize)
            .ok_or_else(|| error_corruption!("Read of unallocated block {id}"))?;
        buf.copy_from_slice(&block[..]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_store_round_trip() {
        let store = MemStore::new();
        let a = store.allocate_block().unwrap();
        let b = store.allocate_block().unwrap();
        assert_eq!((a, b), (0, 1));

        let mut data = [0u8; BLOCK_SIZE];
        data[0] = 0xAB;
        data[BLOCK_SIZE - 1] = 0xCD;
        store.write_block(b, &data).unwrap();

        let mut buf = [0u8; BLOCK_SIZE];
        store.read_block(b, &mut buf).unwrap();
        assert_eq!(buf[0], 0xAB);
        assert_eq!(buf[BLOCK_SIZE - 1], 0xCD);

        assert!(store.read_block(2, &mut buf).is_err());
        assert!(store.write_block(2, &data).is_err());
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks");
        {
            let store = FileStore::open(&path).unwrap();
            let id = store.allocate_block().unwrap();
            let mut data = [7u8; BLOCK_SIZE];
            data[11] = 42;
            store.write_block(id, &data).unwrap();
            store.sync().unwrap();
        }
        // Reopening resumes allocation after the existing block
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.allocate_block().unwrap(), 1);
        let mut buf = [0u8; BLOCK_SIZE];
        store.read_block(0, &mut buf).unwrap();
        assert_eq!(buf[11], 42);
        assert_eq!(buf[0], 7);
        // Block 1 was allocated but never written
        assert!(store.read_block(1, &mut buf).is_err());
    }
}
