//! Block-persisted adaptive radix tree for ordered secondary indexes.
//!
//! Keys are opaque byte strings in lexicographic order, each mapping to a set
//! of row ids. Inner nodes adapt their representation to the live fanout
//! (4/16/48/256 children) and compress shared key bytes into per-node
//! prefixes, see [Art] for the full contract.
//!
//! Index trees persist into any [BlockDevice] as chains of fixed size meta
//! blocks; opening a persisted tree reads the root only and the rest of the
//! node graph materializes lazily as lookups and scans touch it.
//!
//! ```
//! use artindex::{Art, MemStore};
//!
//! let store = MemStore::new();
//! let mut index = Art::new();
//! index.insert(&store, b"cherry\0", 3)?;
//! index.insert(&store, b"apple\0", 1)?;
//! let pos = index.persist(&store)?;
//!
//! let mut index = Art::open(&store, pos)?;
//! assert_eq!(index.get(&store, b"apple\0")?, Some(&[1u64][..]));
//! # Ok::<(), artindex::Error>(())
//! ```
#[macro_use]
extern crate derive_more;
#[macro_use]
extern crate log;

mod error;
mod leaf;
mod meta;
mod node;
mod repr;
mod store;
mod tree;
mod utils;


pub use crate::{
    error::Error,
    meta::{BlockPointer, MetaBlockReader, MetaBlockWriter},
    repr::{BlockId, RowId},
    store::{BlockDevice, FileStore, MemStore},
    tree::Art,
};

/// Size of every block of a [BlockDevice]
pub const BLOCK_SIZE: usize = 4096;
